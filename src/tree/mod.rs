//! Secret tree and path resolution
//!
//! Holds the key structure of the secrets document and maps mounted
//! filesystem paths onto it.

mod node;
mod path;

pub use node::{build_tree, classify, NodeKind, SecretNode, SecretTree};
pub use path::{KeyPath, RECOGNIZED_SUFFIXES, SECRETS_ROOT};
