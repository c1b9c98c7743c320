//! Path-based filesystem operations
//!
//! Every operation is stateless given the current secret tree and the value
//! cache. Paths are absolute, `/`-separated, and rooted at the mount point:
//!
//! ```text
//! /                   mount root
//! └── secrets/        fixed secrets root
//!     ├── database/   interior node
//!     │   └── password  leaf, decrypted on read
//!     └── token       leaf
//! ```

use crate::cache::{SecretCache, SecretValue};
use crate::config::{Config, DEFAULT_DECRYPT_TIMEOUT_SECS, DEFAULT_PLACEHOLDER_SIZE};
use crate::error::{Error, Result};
use crate::sops::Decryptor;
use crate::tree::{classify, KeyPath, NodeKind, SecretNode, SecretTree, SECRETS_ROOT};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Path of the mount root
pub const ROOT_PATH: &str = "/";

/// Path of the fixed secrets directory
pub const SECRETS_PATH: &str = "/secrets";

/// Attributes of a resolved path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    /// Directory or file
    pub kind: NodeKind,
    /// Reported size; a placeholder for files, whose size is unknown until read
    pub size: u64,
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Directory or file
    pub kind: NodeKind,
}

/// Tunables for [`SecretsFs`]
#[derive(Debug, Clone)]
pub struct SecretsFsOptions {
    /// Upper bound on a single decrypt
    pub decrypt_timeout: Duration,
    /// Size reported for files
    pub placeholder_size: u64,
}

impl Default for SecretsFsOptions {
    fn default() -> Self {
        SecretsFsOptions {
            decrypt_timeout: Duration::from_secs(DEFAULT_DECRYPT_TIMEOUT_SECS),
            placeholder_size: DEFAULT_PLACEHOLDER_SIZE,
        }
    }
}

impl From<&Config> for SecretsFsOptions {
    fn from(config: &Config) -> Self {
        SecretsFsOptions {
            decrypt_timeout: config.sops.decrypt_timeout(),
            placeholder_size: config.mount.placeholder_size,
        }
    }
}

/// Read-only view of a secrets document as a filesystem
pub struct SecretsFs {
    /// Encrypted document
    source: PathBuf,
    /// Current structure snapshot, replaced whole on refresh
    tree: RwLock<Arc<SecretTree>>,
    /// Decrypted values
    cache: Arc<SecretCache>,
    /// Decryption backend
    decryptor: Arc<dyn Decryptor>,
    /// Tunables
    options: SecretsFsOptions,
}

impl SecretsFs {
    /// Load the structure of `source` and build the filesystem.
    ///
    /// Fails if the structure cannot be loaded; there is nothing to serve
    /// without it.
    pub fn new(
        source: PathBuf,
        decryptor: Arc<dyn Decryptor>,
        cache: Arc<SecretCache>,
        options: SecretsFsOptions,
    ) -> Result<Self> {
        let tree = decryptor.load_structure(&source)?;
        Ok(Self::with_tree(source, tree, decryptor, cache, options))
    }

    /// Build the filesystem around an already loaded tree
    pub fn with_tree(
        source: PathBuf,
        tree: SecretTree,
        decryptor: Arc<dyn Decryptor>,
        cache: Arc<SecretCache>,
        options: SecretsFsOptions,
    ) -> Self {
        SecretsFs {
            source,
            tree: RwLock::new(Arc::new(tree)),
            cache,
            decryptor,
            options,
        }
    }

    /// Encrypted document being served
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Current structure snapshot
    pub fn tree(&self) -> Arc<SecretTree> {
        Arc::clone(&self.tree.read())
    }

    /// Decrypted-value cache
    pub fn cache(&self) -> &Arc<SecretCache> {
        &self.cache
    }

    /// Reload the structure and swap it in.
    ///
    /// On failure the current tree stays in place. The cache is cleared on
    /// success so values of removed or moved keys are not served.
    pub fn refresh(&self) -> Result<()> {
        match self.decryptor.load_structure(&self.source) {
            Ok(tree) => {
                let top_level = tree.top_level_len();
                *self.tree.write() = Arc::new(tree);
                self.cache.clear();
                info!("Refreshed secrets structure: {} top-level keys", top_level);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to refresh secrets structure, keeping current tree: {}", e);
                Err(e)
            }
        }
    }

    /// Classify `path` as directory or file
    fn kind_of(&self, path: &str) -> Result<NodeKind> {
        if path == ROOT_PATH || path == SECRETS_PATH {
            return Ok(NodeKind::Directory);
        }

        let key_path = KeyPath::from_fs_path(path).ok_or_else(|| Error::NotFound(path.to_string()))?;
        let tree = self.tree();
        tree.resolve(&key_path)
            .map(classify)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// Attribute query
    pub fn getattr(&self, path: &str) -> Result<NodeAttr> {
        debug!("getattr(path={})", path);

        let kind = self.kind_of(path)?;
        let size = match kind {
            NodeKind::Directory => 0,
            NodeKind::File => self.options.placeholder_size,
        };
        Ok(NodeAttr { kind, size })
    }

    /// Open a directory. No state is kept, the handle is always 0.
    pub fn opendir(&self, path: &str) -> Result<u64> {
        debug!("opendir(path={})", path);

        match self.kind_of(path)? {
            NodeKind::Directory => Ok(0),
            NodeKind::File => Err(Error::NotADirectory(path.to_string())),
        }
    }

    /// List a directory
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        debug!("readdir(path={})", path);

        if path == ROOT_PATH {
            return Ok(vec![DirEntry {
                name: SECRETS_ROOT.to_string(),
                kind: NodeKind::Directory,
            }]);
        }

        let tree = self.tree();
        if path == SECRETS_PATH {
            return Ok(entries_of(tree.top_level()));
        }

        let key_path = KeyPath::from_fs_path(path).ok_or_else(|| Error::NotFound(path.to_string()))?;
        match tree.resolve(&key_path) {
            Some(SecretNode::Interior(children)) => Ok(entries_of(children)),
            Some(SecretNode::Leaf) => Err(Error::NotADirectory(path.to_string())),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    /// Close a directory
    pub fn releasedir(&self, path: &str, fh: u64) -> Result<()> {
        debug!("releasedir(path={}, fh={})", path, fh);
        Ok(())
    }

    /// Open a file. Decryption is deferred to the first read.
    pub fn open(&self, path: &str) -> Result<u64> {
        debug!("open(path={})", path);

        match self.kind_of(path)? {
            NodeKind::File => Ok(0),
            NodeKind::Directory => Err(Error::IsADirectory(path.to_string())),
        }
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// Reading at or past the end returns no bytes.
    pub fn read(&self, path: &str, offset: u64, size: u32) -> Result<Zeroizing<Vec<u8>>> {
        debug!("read(path={}, offset={}, size={})", path, offset, size);

        if self.kind_of(path)? == NodeKind::Directory {
            return Err(Error::IsADirectory(path.to_string()));
        }

        let secret = self.read_secret(path)?;
        let data = slice_at(secret.as_bytes(), offset, size);
        debug!("read(path={}) returning {} bytes", path, data.len());
        Ok(Zeroizing::new(data.to_vec()))
    }

    /// Close a file
    pub fn release(&self, path: &str, fh: u64) -> Result<()> {
        debug!("release(path={}, fh={})", path, fh);
        Ok(())
    }

    /// Decrypted value of the file at `path`, from cache or a fresh decrypt.
    ///
    /// No lock is held while decrypting. Concurrent misses on one path may
    /// each decrypt; the last one to finish wins the cache slot.
    pub fn read_secret(&self, path: &str) -> Result<SecretValue> {
        let key_path = KeyPath::from_fs_path(path).ok_or_else(|| Error::NotFound(path.to_string()))?;

        if let Some(value) = self.cache.get(path) {
            debug!("Cache HIT for {}", path);
            return Ok(value);
        }

        debug!("Cache MISS for {}, decrypting", path);
        let plaintext = self
            .decryptor
            .decrypt_leaf(&self.source, &key_path, self.options.decrypt_timeout)
            .map_err(|e| {
                warn!("Decrypting {} failed: {}", path, e);
                Error::Decrypt(e)
            })?;

        let value = self.cache.put(path, plaintext);
        debug!("Cached decrypted secret for {}", path);
        Ok(value)
    }
}

fn entries_of(children: &std::collections::BTreeMap<String, SecretNode>) -> Vec<DirEntry> {
    children
        .iter()
        .map(|(name, node)| DirEntry {
            name: name.clone(),
            kind: classify(node),
        })
        .collect()
}

/// Bytes of `data` in `[offset, offset + size)`, clamped to its length
fn slice_at(data: &[u8], offset: u64, size: u32) -> &[u8] {
    let len = data.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    let end = start.saturating_add(size as usize).min(len);
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::error::DecryptError;
    use crate::sops::parse_structure;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(300);

    const DOC: &str = r#"
database:
  password: ENC[x]
  user: ENC[x]
api:
  github: ENC[x]
  nested:
    deep: ENC[x]
postgres:
  test_pass: ENC[x]
token: ENC[x]
port: ENC[x]
sops:
  version: 3.8.1
"#;

    /// Decryptor answering from a fixed table and counting calls
    struct FakeDecryptor {
        document: parking_lot::Mutex<String>,
        values: HashMap<String, String>,
        calls: AtomicUsize,
        fail_with: Option<DecryptError>,
    }

    impl FakeDecryptor {
        fn new() -> Self {
            let values = [
                ("database/password", "hunter2"),
                ("database/user", "admin"),
                ("api/github", "ghp_0123456789"),
                ("api/nested/deep", "deep value"),
                ("postgres/test_pass", "pg"),
                ("token", "tok"),
                ("port", "5432"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

            FakeDecryptor {
                document: parking_lot::Mutex::new(DOC.to_string()),
                values,
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(err: DecryptError) -> Self {
            FakeDecryptor {
                fail_with: Some(err),
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Decryptor for FakeDecryptor {
        fn load_structure(&self, _source: &Path) -> Result<SecretTree> {
            parse_structure(&self.document.lock())
        }

        fn decrypt_leaf(
            &self,
            _source: &Path,
            key_path: &KeyPath,
            _timeout: Duration,
        ) -> std::result::Result<String, DecryptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.values
                .get(&key_path.to_string())
                .cloned()
                .ok_or_else(|| DecryptError::PathNotFound(key_path.to_string()))
        }
    }

    fn setup_with(decryptor: FakeDecryptor) -> (SecretsFs, Arc<FakeDecryptor>, Arc<ManualClock>) {
        let decryptor = Arc::new(decryptor);
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(SecretCache::with_clock(TTL, clock.clone()));
        let fs = SecretsFs::new(
            PathBuf::from("secrets.yaml"),
            decryptor.clone(),
            cache,
            SecretsFsOptions::default(),
        )
        .unwrap();
        (fs, decryptor, clock)
    }

    fn setup() -> (SecretsFs, Arc<FakeDecryptor>, Arc<ManualClock>) {
        setup_with(FakeDecryptor::new())
    }

    fn read_all(fs: &SecretsFs, path: &str) -> Vec<u8> {
        fs.read(path, 0, 4096).unwrap().to_vec()
    }

    #[test]
    fn test_getattr_synthetic_roots() {
        let (fs, _, _) = setup();
        assert_eq!(fs.getattr("/").unwrap().kind, NodeKind::Directory);
        assert_eq!(fs.getattr("/secrets").unwrap().kind, NodeKind::Directory);
    }

    #[test]
    fn test_getattr_tree_nodes() {
        let (fs, _, _) = setup();
        assert_eq!(fs.getattr("/secrets/database").unwrap().kind, NodeKind::Directory);

        let attr = fs.getattr("/secrets/database/password").unwrap();
        assert_eq!(attr.kind, NodeKind::File);
        assert_eq!(attr.size, DEFAULT_PLACEHOLDER_SIZE);

        let attr = fs.getattr("/secrets/postgres/test_pass.yaml").unwrap();
        assert_eq!(attr.kind, NodeKind::File);
    }

    #[test]
    fn test_getattr_not_found() {
        let (fs, _, _) = setup();
        assert!(matches!(fs.getattr("/other/path"), Err(Error::NotFound(_))));
        assert!(matches!(fs.getattr("/secrets/missing"), Err(Error::NotFound(_))));
        assert!(matches!(fs.getattr("/secrets/token/below_leaf"), Err(Error::NotFound(_))));
        assert!(matches!(fs.getattr("/secrets/sops"), Err(Error::NotFound(_))));
        assert!(matches!(fs.getattr(""), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_exactly_one_classification() {
        let (fs, _, _) = setup();
        let paths = [
            "/", "/secrets", "/secrets/api", "/secrets/api/github", "/secrets/api/nope",
            "/nope", "/secrets/api/github/x", "/secrets/port.txt",
        ];
        for path in paths {
            let dir = fs.opendir(path).is_ok();
            let file = fs.open(path).is_ok();
            let missing = matches!(fs.getattr(path), Err(Error::NotFound(_)));
            assert_eq!(
                [dir, file, missing].iter().filter(|b| **b).count(),
                1,
                "path {}",
                path
            );
        }
    }

    #[test]
    fn test_opendir() {
        let (fs, _, _) = setup();
        assert_eq!(fs.opendir("/").unwrap(), 0);
        assert_eq!(fs.opendir("/secrets").unwrap(), 0);
        assert_eq!(fs.opendir("/secrets/api/nested").unwrap(), 0);
        assert!(matches!(fs.opendir("/secrets/token"), Err(Error::NotADirectory(_))));
        assert!(matches!(fs.opendir("/secrets/nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_readdir_root() {
        let (fs, _, _) = setup();
        assert_eq!(
            fs.readdir("/").unwrap(),
            vec![DirEntry { name: "secrets".to_string(), kind: NodeKind::Directory }]
        );
    }

    #[test]
    fn test_readdir_secrets_lists_top_level_keys() {
        let (fs, _, _) = setup();
        let mut entries = fs.readdir("/secrets").unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let expected = [
            ("api", NodeKind::Directory),
            ("database", NodeKind::Directory),
            ("port", NodeKind::File),
            ("postgres", NodeKind::Directory),
            ("token", NodeKind::File),
        ];
        assert_eq!(entries.len(), expected.len());
        for (entry, (name, kind)) in entries.iter().zip(expected) {
            assert_eq!(entry.name, name);
            assert_eq!(entry.kind, kind);
        }
    }

    #[test]
    fn test_readdir_nested() {
        let (fs, _, _) = setup();
        let entries = fs.readdir("/secrets/api").unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "github".to_string(), kind: NodeKind::File },
                DirEntry { name: "nested".to_string(), kind: NodeKind::Directory },
            ]
        );
        assert!(matches!(fs.readdir("/secrets/token"), Err(Error::NotADirectory(_))));
        assert!(matches!(fs.readdir("/secrets/nope"), Err(Error::NotFound(_))));
        assert!(matches!(fs.readdir("/elsewhere"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_open_does_not_decrypt() {
        let (fs, decryptor, _) = setup();
        assert_eq!(fs.open("/secrets/database/password").unwrap(), 0);
        assert!(matches!(fs.open("/secrets/database"), Err(Error::IsADirectory(_))));
        assert!(matches!(fs.open("/secrets"), Err(Error::IsADirectory(_))));
        assert!(matches!(fs.open("/secrets/nope"), Err(Error::NotFound(_))));
        assert_eq!(decryptor.calls(), 0);
        assert!(fs.release("/secrets/database/password", 0).is_ok());
        assert!(fs.releasedir("/secrets/database", 0).is_ok());
    }

    #[test]
    fn test_read_decrypts_once_and_caches_under_full_path() {
        let (fs, decryptor, _) = setup();

        assert_eq!(read_all(&fs, "/secrets/database/password"), b"hunter2");
        assert_eq!(decryptor.calls(), 1);
        assert!(fs.cache().get("/secrets/database/password").is_some());
    }

    #[test]
    fn test_read_hit_within_ttl_then_miss_after() {
        let (fs, decryptor, clock) = setup();

        let first = read_all(&fs, "/secrets/api/github");
        clock.advance(Duration::from_secs(1));
        let second = read_all(&fs, "/secrets/api/github");
        assert_eq!(first, second);
        assert_eq!(decryptor.calls(), 1);

        clock.advance(TTL);
        let third = read_all(&fs, "/secrets/api/github");
        assert_eq!(third, first);
        assert_eq!(decryptor.calls(), 2);
    }

    #[test]
    fn test_suffixed_path_cached_separately() {
        let (fs, decryptor, _) = setup();
        assert_eq!(read_all(&fs, "/secrets/postgres/test_pass.yaml"), b"pg");
        assert_eq!(read_all(&fs, "/secrets/postgres/test_pass"), b"pg");
        assert_eq!(decryptor.calls(), 2);
    }

    #[test]
    fn test_read_offsets() {
        let (fs, _, _) = setup();
        assert_eq!(fs.read("/secrets/database/password", 2, 3).unwrap().as_slice(), b"nte");
        assert_eq!(fs.read("/secrets/database/password", 5, 100).unwrap().as_slice(), b"r2");
        assert!(fs.read("/secrets/database/password", 7, 10).unwrap().is_empty());
        assert!(fs.read("/secrets/database/password", u64::MAX, 10).unwrap().is_empty());
    }

    #[test]
    fn test_read_directory_fails() {
        let (fs, decryptor, _) = setup();
        assert!(matches!(fs.read("/secrets/api", 0, 10), Err(Error::IsADirectory(_))));
        assert!(matches!(fs.read("/secrets/missing", 0, 10), Err(Error::NotFound(_))));
        assert_eq!(decryptor.calls(), 0);
    }

    #[test]
    fn test_decrypt_failure_is_io_and_not_cached() {
        let (fs, decryptor, _) =
            setup_with(FakeDecryptor::failing(DecryptError::Timeout(Duration::from_secs(10))));

        let err = fs.read("/secrets/token", 0, 10).unwrap_err();
        assert!(matches!(err, Error::Decrypt(DecryptError::Timeout(_))));
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(fs.cache().is_empty());

        // No retry inside the dispatcher; the next read tries again
        assert!(fs.read("/secrets/token", 0, 10).is_err());
        assert_eq!(decryptor.calls(), 2);
    }

    #[test]
    fn test_refresh_swaps_tree_and_clears_cache() {
        let (fs, decryptor, _) = setup();
        read_all(&fs, "/secrets/token");
        assert_eq!(fs.cache().len(), 1);

        *decryptor.document.lock() = "fresh:\n  key: ENC[x]\n".to_string();
        fs.refresh().unwrap();

        assert!(fs.cache().is_empty());
        assert!(matches!(fs.getattr("/secrets/token"), Err(Error::NotFound(_))));
        assert_eq!(fs.getattr("/secrets/fresh").unwrap().kind, NodeKind::Directory);
    }

    #[test]
    fn test_failed_refresh_keeps_tree() {
        let (fs, decryptor, _) = setup();
        *decryptor.document.lock() = "- not a mapping\n".to_string();

        assert!(fs.refresh().is_err());
        assert_eq!(fs.getattr("/secrets/token").unwrap().kind, NodeKind::File);
    }

    #[test]
    fn test_concurrent_reads() {
        let (fs, decryptor, _) = setup();
        let fs = Arc::new(fs);
        let paths = ["/secrets/token", "/secrets/api/github", "/secrets/database/user"];

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let fs = Arc::clone(&fs);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let path = paths[i % paths.len()];
                        assert!(!fs.read(path, 0, 64).unwrap().is_empty());
                        assert!(fs.getattr(path).is_ok());
                        assert!(fs.readdir("/secrets").is_ok());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Misses racing on the same path may each decrypt, but never more
        // than once per reading thread.
        let calls = decryptor.calls();
        assert!(calls >= paths.len() && calls <= 8, "calls = {}", calls);
        assert_eq!(fs.cache().len(), paths.len());
    }

    #[test]
    fn test_slice_at() {
        assert_eq!(slice_at(b"abcdef", 0, 3), b"abc");
        assert_eq!(slice_at(b"abcdef", 4, 10), b"ef");
        assert_eq!(slice_at(b"abcdef", 6, 1), b"");
        assert_eq!(slice_at(b"", 0, 10), b"");
    }
}
