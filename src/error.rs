//! Error taxonomy shared by the tree builder, registry and job manager

use std::io;

use thiserror::Error;

/// Coarse classification used when mapping failures onto the API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Io,
    Command,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid path")]
    InvalidPath,
    #[error("sync already started")]
    AlreadyStarted,
    #[error("sync in progress")]
    SyncInProgress,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Command(String),
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidPath => ErrorKind::Validation,
            SyncError::AlreadyStarted | SyncError::SyncInProgress => ErrorKind::Conflict,
            SyncError::Io { .. } => ErrorKind::Io,
            SyncError::Command(_) => ErrorKind::Command,
        }
    }
}
