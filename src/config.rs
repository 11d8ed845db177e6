//! Layered runtime settings: flags, environment, TOML file, defaults

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::Level;

use crate::cli::DaemonOpts;
use crate::logging::LogFormat;
use crate::remote::RemoteEndpoint;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_GRACE_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{}", .0.join(" | "))]
    Invalid(Vec<String>),
    #[error("prepare data path {}: {source}", .path.display())]
    DataPath { path: PathBuf, source: io::Error },
}

/// Contents of the optional TOML file. Keys match the long flag names with
/// underscores.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub data_path: Option<PathBuf>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub remote_user: Option<String>,
    pub rsync_ssh_key: Option<PathBuf>,
    pub ls_ssh_key: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    pub ls_command: Option<String>,
    pub grace_period_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub log_level: Level,
    pub log_format: LogFormat,
    pub data_path: PathBuf,
    pub remote: RemoteEndpoint,
    pub grace_period: Duration,
}

impl Settings {
    /// Load the file named in `opts` (if any), merge, validate and prepare
    /// the data directory.
    pub fn resolve(opts: DaemonOpts) -> Result<Self, ConfigError> {
        let file = match &opts.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let mut settings = Self::merge(opts, file)?;
        settings.prepare_data_path()?;
        Ok(settings)
    }

    /// Merge option layers and validate. Every problem is reported at once.
    pub fn merge(opts: DaemonOpts, file: FileConfig) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        let mut required = |value: Option<String>, name: &str| -> String {
            match value.filter(|v| !v.trim().is_empty()) {
                Some(v) => v,
                None => {
                    problems.push(format!("{name} is required"));
                    String::new()
                }
            }
        };
        let remote_host = required(opts.remote_host.or(file.remote_host), "REMOTE_HOST");
        let remote_user = required(opts.remote_user.or(file.remote_user), "REMOTE_USER");
        let data_path = required(path_string(opts.data_path.or(file.data_path)), "DATA_PATH");
        let rsync_ssh_key =
            required(path_string(opts.rsync_ssh_key.or(file.rsync_ssh_key)), "RSYNC_SSH_KEY");
        let ls_ssh_key = required(path_string(opts.ls_ssh_key.or(file.ls_ssh_key)), "LS_SSH_KEY");
        let known_hosts =
            required(path_string(opts.known_hosts.or(file.known_hosts)), "KNOWN_HOSTS");

        let remote_port = match opts.remote_port.or(file.remote_port) {
            Some(0) => {
                problems.push("REMOTE_PORT must be non-zero".to_string());
                0
            }
            Some(port) => port,
            None => {
                problems.push("REMOTE_PORT is required".to_string());
                0
            }
        };

        let level_text = opts
            .log_level
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());
        let log_level = match level_text.parse::<Level>() {
            Ok(level) => level,
            Err(_) => {
                problems.push(format!("invalid LOG_LEVEL {level_text:?}"));
                Level::INFO
            }
        };

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        let grace_secs = opts
            .grace_period_secs
            .or(file.grace_period_secs)
            .unwrap_or(DEFAULT_GRACE_SECS);

        Ok(Self {
            host: opts
                .host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: opts.port.or(file.port).unwrap_or(DEFAULT_PORT),
            log_level,
            log_format: opts.log_format.or(file.log_format).unwrap_or(LogFormat::Json),
            data_path: PathBuf::from(data_path),
            remote: RemoteEndpoint {
                host: remote_host,
                port: remote_port,
                user: remote_user,
                rsync_ssh_key: PathBuf::from(rsync_ssh_key),
                ls_ssh_key: PathBuf::from(ls_ssh_key),
                known_hosts: PathBuf::from(known_hosts),
                ls_command: opts.ls_command.or(file.ls_command),
            },
            grace_period: Duration::from_secs(grace_secs),
        })
    }

    /// Create the data directory if needed and replace it with its canonical form.
    pub fn prepare_data_path(&mut self) -> Result<(), ConfigError> {
        let fail = |source| ConfigError::DataPath {
            path: self.data_path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.data_path).map_err(fail)?;
        let canonical = std::fs::canonicalize(&self.data_path).map_err(fail)?;
        if !canonical.is_dir() {
            return Err(fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a directory",
            )));
        }
        self.data_path = canonical;
        Ok(())
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn path_string(path: Option<PathBuf>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}
