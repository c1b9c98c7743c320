//! Error types for sopsfs

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load secrets structure: {0}")]
    StructureSource(String),

    #[error("Decryption failed: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Mount failed: {0}")]
    Mount(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errno reported to the FUSE kernel interface.
    ///
    /// The filesystem protocol only carries error codes, so every decrypt
    /// failure collapses to `EIO`.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            _ => libc::EIO,
        }
    }
}

/// Failure of a single leaf decryption
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("decryption timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("data key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("key path not found in decrypted document: {0}")]
    PathNotFound(String),

    #[error("decryption failed: {0}")]
    Failed(String),
}
