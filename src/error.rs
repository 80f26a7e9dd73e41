//! Error types for dirfetch
//!
//! Every error is local to one session or one task; none of them takes
//! the server process down. Binaries wrap these in `anyhow` for setup
//! failures.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the server engine and the client.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Peer closed or reset the connection before the exchange completed
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The client's path request could not be decoded
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A path could not be listed, classified, opened or read
    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A write to the socket failed part way through a record
    #[error("write failed mid-transfer: {0}")]
    ProtocolWrite(#[source] io::Error),

    /// The server's byte stream did not follow the framing rules
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A received name is unsafe to create under the output directory
    #[error("invalid file path: {0}")]
    InvalidPath(String),

    /// The task queue was closed for shutdown
    #[error("task queue closed")]
    QueueClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// True for filesystem errors the walker treats as "skip this subtree".
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            TransferError::Filesystem { source, .. }
                if source.kind() == io::ErrorKind::PermissionDenied
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
