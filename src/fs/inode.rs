//! Inode numbering
//!
//! The kernel addresses nodes by inode number while the filesystem resolves
//! paths. Numbers are handed out on first lookup and stay stable for the life
//! of the mount, including across structure refreshes; a number whose path
//! disappeared simply resolves to ENOENT.

use super::dispatch::{ROOT_PATH, SECRETS_PATH};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode of the mount root
pub const ROOT_INO: u64 = 1;

/// Inode of `/secrets`
pub const SECRETS_INO: u64 = 2;

/// Bidirectional path and inode number mapping
pub struct InodeTable {
    /// Next inode number to hand out
    next_ino: AtomicU64,
    /// ino -> path
    paths: DashMap<u64, String>,
    /// path -> ino
    inos: DashMap<String, u64>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = InodeTable {
            next_ino: AtomicU64::new(SECRETS_INO + 1),
            paths: DashMap::new(),
            inos: DashMap::new(),
        };
        table.register(ROOT_INO, ROOT_PATH);
        table.register(SECRETS_INO, SECRETS_PATH);
        table
    }

    fn register(&self, ino: u64, path: &str) {
        self.paths.insert(ino, path.to_string());
        self.inos.insert(path.to_string(), ino);
    }

    /// Path for an inode number
    pub fn path(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).map(|p| p.value().clone())
    }

    /// Inode number for a path, allocating one on first sight
    pub fn ino_for(&self, path: &str) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }

        let ino = *self
            .inos
            .entry(path.to_string())
            .or_insert_with(|| self.next_ino.fetch_add(1, Ordering::SeqCst));
        self.paths.entry(ino).or_insert_with(|| path.to_string());
        ino
    }

    /// Inode number of the directory containing `path`
    pub fn parent_ino(&self, path: &str) -> u64 {
        match path.rsplit_once('/') {
            Some(("", _)) | None => ROOT_INO,
            Some((parent, _)) => self.ino_for(parent),
        }
    }

    /// Number of known inodes
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Path of `name` inside the directory at `parent`
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
