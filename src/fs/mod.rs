//! Filesystem layer
//!
//! `dispatch` answers path-based operations from the secret tree and cache;
//! `filesystem` adapts them to the inode-based FUSE interface.

mod dispatch;
mod filesystem;
mod inode;

pub use dispatch::{DirEntry, NodeAttr, SecretsFs, SecretsFsOptions, ROOT_PATH, SECRETS_PATH};
pub use filesystem::{mount, mount_options, SecretsFuse};
pub use inode::{child_path, InodeTable, ROOT_INO, SECRETS_INO};
