use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("fragment identity is required")]
    FragmentIdentityRequired,

    #[error("fragment `{0}` not found")]
    FragmentNotFound(String),

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("stream closed before {0}")]
    UnexpectedEof(&'static str),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Reading the local fragment source failed; nothing came from the node.
    #[error("reading fragment source: {0}")]
    Source(#[source] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
