//! sopsfs - Read-only FUSE filesystem for SOPS-encrypted secrets
//!
//! The key structure of an encrypted document is exposed as a directory
//! tree under `/secrets`. Each value is decrypted through a remote SOPS
//! keyservice on first read and cached in memory for a bounded time.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod sops;
pub mod tree;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::SecretCache;
    pub use crate::config::Config;
    pub use crate::error::{DecryptError, Error, Result};
    pub use crate::fs::SecretsFs;
    pub use crate::sops::{Decryptor, SopsClient};
    pub use crate::tree::{KeyPath, SecretTree};
}
