//! SOPS backend
//!
//! Everything that touches the encrypted document:
//! - Reading its key structure (no keyservice needed)
//! - Decrypting single values through the sops binary
//! - Keyservice addressing and reachability checks

mod client;
mod keyservice;
mod structure;

pub use client::{extract_expression, SopsClient};
pub use keyservice::{KeyserviceAddr, PROBE_TIMEOUT};
pub use structure::{load_structure_file, parse_structure, recipients, Recipient, SOPS_METADATA_KEY};

use crate::error::{DecryptError, Result};
use crate::tree::{KeyPath, SecretTree};
use std::path::Path;
use std::time::Duration;

/// Source of secret structure and decrypted values.
///
/// Implementations are called from filesystem threads and must be safe to
/// share between them.
pub trait Decryptor: Send + Sync {
    /// Load the key structure of `source`, without its `sops` metadata
    fn load_structure(&self, source: &Path) -> Result<SecretTree>;

    /// Decrypt the single value at `key_path`, bounded by `timeout`
    fn decrypt_leaf(
        &self,
        source: &Path,
        key_path: &KeyPath,
        timeout: Duration,
    ) -> std::result::Result<String, DecryptError>;
}
