//! Command-line options for the daemon

use clap::Parser;
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Every option may also come from its environment variable or the TOML file
/// named by `--config`; flags win over the environment, which wins over the file.
#[derive(Clone, Debug, Default, Parser)]
#[command(
    author,
    version,
    about = "Mirror remote directory subtrees on demand and report transfer progress over HTTP"
)]
pub struct DaemonOpts {
    /// TOML file supplying defaults for the options below
    #[arg(long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address [default: 0.0.0.0]
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Listen port [default: 8080]
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// trace, debug, info, warn or error [default: info]
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log line format [default: json]
    #[arg(long, env = "LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// Local directory the remote tree is mirrored into
    #[arg(long, env = "DATA_PATH")]
    pub data_path: Option<PathBuf>,

    #[arg(long, env = "REMOTE_HOST")]
    pub remote_host: Option<String>,

    #[arg(long, env = "REMOTE_PORT")]
    pub remote_port: Option<u16>,

    #[arg(long, env = "REMOTE_USER")]
    pub remote_user: Option<String>,

    /// Private key used by transfers
    #[arg(long, env = "RSYNC_SSH_KEY")]
    pub rsync_ssh_key: Option<PathBuf>,

    /// Private key used for directory listings
    #[arg(long, env = "LS_SSH_KEY")]
    pub ls_ssh_key: Option<PathBuf>,

    /// known_hosts file pinning the remote host key
    #[arg(long, env = "KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// Remote listing command; omit when the listing key has a forced command
    #[arg(long, env = "LS_COMMAND")]
    pub ls_command: Option<String>,

    /// Seconds a cancelled transfer gets to exit before it is killed [default: 5]
    #[arg(long, env = "GRACE_PERIOD_SECS")]
    pub grace_period_secs: Option<u64>,
}
