//! Filesystem path to key path derivation

use std::fmt;

/// Name of the synthetic directory every secret lives under
pub const SECRETS_ROOT: &str = "secrets";

/// File-name suffixes hidden from the key name
pub const RECOGNIZED_SUFFIXES: &[&str] = &[".yaml", ".txt"];

/// Ordered mapping keys identifying one node of the secret tree.
///
/// Never empty: a key path with zero segments would address the root, which
/// is not a valid lookup target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// Build a key path from raw segments, rejecting empty input
    pub fn new(segments: Vec<String>) -> Option<Self> {
        if segments.is_empty() {
            None
        } else {
            Some(KeyPath(segments))
        }
    }

    /// Derive the key path addressed by a mounted filesystem path.
    ///
    /// `/secrets/postgres/admin.yaml` becomes `["postgres", "admin"]`.
    /// Returns `None` for anything outside `/secrets/`, for the secrets root
    /// itself and for paths with empty segments. Never fails otherwise.
    pub fn from_fs_path(path: &str) -> Option<Self> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut parts = trimmed.split('/');

        if parts.next()? != SECRETS_ROOT {
            return None;
        }

        let mut segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }

        let last = segments.last_mut()?;
        if let Some(stem) = strip_recognized_suffix(last) {
            *last = stem;
        }

        KeyPath::new(segments)
    }

    /// Segments in walk order
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mounted path of this key, e.g. `/secrets/postgres/admin`
    pub fn to_fs_path(&self) -> String {
        format!("/{}/{}", SECRETS_ROOT, self.0.join("/"))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Strip one recognized suffix, unless that would leave an empty name
fn strip_recognized_suffix(segment: &str) -> Option<String> {
    RECOGNIZED_SUFFIXES.iter().find_map(|suffix| {
        segment
            .strip_suffix(suffix)
            .filter(|stem| !stem.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(path: &str) -> Option<Vec<String>> {
        KeyPath::from_fs_path(path).map(|k| k.segments().to_vec())
    }

    #[test]
    fn test_top_level_key() {
        assert_eq!(
            keys("/secrets/vaultwarden_admin_token"),
            Some(vec!["vaultwarden_admin_token".to_string()])
        );
    }

    #[test]
    fn test_nested_key() {
        assert_eq!(
            keys("/secrets/database/password"),
            Some(vec!["database".to_string(), "password".to_string()])
        );
    }

    #[test]
    fn test_suffix_stripped_from_last_segment() {
        assert_eq!(
            keys("/secrets/postgres/test_pass.yaml"),
            Some(vec!["postgres".to_string(), "test_pass".to_string()])
        );
        assert_eq!(
            keys("/secrets/codeium_config.txt"),
            Some(vec!["codeium_config".to_string()])
        );
    }

    #[test]
    fn test_only_one_suffix_stripped() {
        assert_eq!(keys("/secrets/a.txt.yaml"), Some(vec!["a.txt".to_string()]));
    }

    #[test]
    fn test_suffix_kept_on_intermediate_segments() {
        assert_eq!(
            keys("/secrets/conf.yaml/key"),
            Some(vec!["conf.yaml".to_string(), "key".to_string()])
        );
    }

    #[test]
    fn test_bare_suffix_is_not_stripped() {
        assert_eq!(keys("/secrets/.txt"), Some(vec![".txt".to_string()]));
    }

    #[test]
    fn test_invalid_paths() {
        assert_eq!(keys("/other/path"), None);
        assert_eq!(keys(""), None);
        assert_eq!(keys("/"), None);
        assert_eq!(keys("/secrets"), None);
        assert_eq!(keys("/secrets/"), None);
        assert_eq!(keys("/secrets//x"), None);
        assert_eq!(keys("/secretsx/a"), None);
    }

    #[test]
    fn test_derivation_is_total() {
        let inputs = [
            "", "/", "//", "secrets", "secrets/a", "/secrets/a/", "/secrets/\u{0}",
            "/secrets/ä/ö.txt", "../../etc/passwd", "/secrets/../x", ".yaml",
        ];
        for input in inputs {
            if let Some(key_path) = KeyPath::from_fs_path(input) {
                assert!(!key_path.is_empty(), "empty key path for {:?}", input);
            }
        }
    }

    #[test]
    fn test_fs_path_round_trip() {
        let key_path = KeyPath::from_fs_path("/secrets/api/github").unwrap();
        assert_eq!(key_path.to_fs_path(), "/secrets/api/github");
        assert_eq!(key_path.to_string(), "api/github");
    }
}
