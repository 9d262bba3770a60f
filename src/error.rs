//! Error types for the sync protocol and both of its endpoints.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Malformed or out-of-order data on the wire. The connection carrying it is abandoned.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown request kind {0}")]
    UnknownKind(u32),

    #[error("unknown status code {0}")]
    UnknownStatus(u32),

    #[error("{field} field incomplete: expected {expected} bytes, got {got}")]
    ShortField {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("peer closed the connection while sending the {0} field")]
    TruncatedRequest(&'static str),

    #[error("data arrived before the previous request was handled")]
    Unsolicited,

    #[error("peer closed the connection with {remaining} body bytes outstanding")]
    TruncatedBody { remaining: u64 },

    #[error("path is {len} bytes, at most {max} fit on the wire")]
    PathTooLong { len: usize, max: usize },

    #[error("path {0:?} is not representable on the wire")]
    InvalidPath(String),

    #[error("path {0:?} escapes the sync root")]
    UnsafePath(String),

    #[error("transfer for {path:?} carries unsupported mode {mode:o}")]
    UnsupportedMode { path: String, mode: u32 },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("remote entry {path:?} has a different type than the local one")]
    TypeMismatch { path: String },

    #[error("{}: unsupported file type", path.display())]
    UnsupportedType { path: PathBuf },

    #[error("peer disconnected")]
    PeerDisconnect,

    #[error("transfer of {path:?} failed: {reason}")]
    TransferFailure { path: String, reason: String },

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn fs(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    /// Reading a fixed-size reply hit EOF: the peer went away.
    pub fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            SyncError::PeerDisconnect
        } else {
            SyncError::Io(err)
        }
    }
}
