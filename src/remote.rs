//! Remote endpoint description and the commands run against it
//!
//! Listing goes through `ssh` (optionally relying on a forced command bound to
//! the listing key), transfers through `rsync` tunnelled over `ssh`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

/// The single remote host this instance mirrors from.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub rsync_ssh_key: PathBuf,
    pub ls_ssh_key: PathBuf,
    pub known_hosts: PathBuf,
    /// Remote command for the listing session; `None` relies on a forced command.
    pub ls_command: Option<String>,
}

impl RemoteEndpoint {
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn ssh_options(&self, key: &Path) -> Vec<String> {
        vec![
            "-i".into(),
            key.display().to_string(),
            "-p".into(),
            self.port.to_string(),
            "-o".into(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            "PasswordAuthentication=no".into(),
        ]
    }

    /// Argv (without the program) for the remote directory listing session.
    pub fn listing_args(&self) -> Vec<String> {
        let mut args = vec!["-T".to_string()];
        args.extend(self.ssh_options(&self.ls_ssh_key));
        args.push(self.login());
        if let Some(cmd) = self.ls_command.as_deref().filter(|c| !c.trim().is_empty()) {
            args.push(cmd.to_string());
        }
        args
    }

    /// Argv (without the program) for an archive-mode transfer of
    /// `remote_path` into `destination`.
    pub fn transfer_args(&self, remote_path: &str, destination: &Path) -> Vec<String> {
        let mut args = vec![
            "-a".to_string(),
            "--info=progress2".to_string(),
            "-e".to_string(),
        ];
        let mut shell = vec!["ssh".to_string()];
        shell.extend(self.ssh_options(&self.rsync_ssh_key));
        args.push(shell.join(" "));
        // A trailing slash on the root copies its contents rather than the directory
        let source = if remote_path == crate::paths::ROOT {
            format!("{}:/", self.login())
        } else {
            format!("{}:{}", self.login(), remote_path)
        };
        args.push(source);
        let mut dest = destination.display().to_string();
        if !dest.ends_with('/') {
            dest.push('/');
        }
        args.push(dest);
        args
    }
}

/// Builds the external commands the tree builder and supervisor run.
///
/// Commands are returned unconfigured for stdio; callers decide piping.
pub trait RemoteTools: Send + Sync {
    /// Command printing one absolute remote directory per line, parents first.
    fn listing_command(&self) -> Command;

    /// Command copying `remote_path` into the local `destination` directory while
    /// reporting progress on stdout.
    fn transfer_command(&self, remote_path: &str, destination: &Path) -> Command;
}

/// Production tools: `ssh` for listing, `rsync` over `ssh` for transfers.
pub struct SshTools {
    endpoint: RemoteEndpoint,
}

impl SshTools {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }
}

impl RemoteTools for SshTools {
    fn listing_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.endpoint.listing_args()).stdin(Stdio::null());
        cmd
    }

    fn transfer_command(&self, remote_path: &str, destination: &Path) -> Command {
        let mut cmd = Command::new("rsync");
        cmd.args(self.endpoint.transfer_args(remote_path, destination))
            .stdin(Stdio::null());
        cmd
    }
}
