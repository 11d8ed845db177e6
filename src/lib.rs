//! Treemirror
//!
//! Mirrors subtrees of a remote directory hierarchy into a local data root on
//! demand, tracks the transfers it starts and reports which remote directories
//! are already present locally.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod paths;
pub mod progress;
pub mod registry;
pub mod remote;
pub mod server;
pub mod supervisor;
pub mod tree;

pub use error::{ErrorKind, SyncError};
pub use manager::SyncJobManager;
pub use remote::{RemoteEndpoint, RemoteTools, SshTools};
