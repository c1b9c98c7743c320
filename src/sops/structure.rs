//! Reading the key structure and recipients of an encrypted document
//!
//! SOPS encrypts values but leaves keys in the clear, so the tree can be
//! built straight from the encrypted file without contacting the keyservice.

use crate::error::{Error, Result};
use crate::tree::{build_tree, SecretTree};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::info;

/// Top-level key holding SOPS metadata rather than secrets
pub const SOPS_METADATA_KEY: &str = "sops";

/// Parse an encrypted document and build its secret tree
pub fn parse_structure(content: &str) -> Result<SecretTree> {
    let mut document: Value = serde_yaml::from_str(content)
        .map_err(|e| Error::StructureSource(format!("Failed to parse secrets file: {}", e)))?;

    if let Value::Mapping(mapping) = &mut document {
        mapping.remove(SOPS_METADATA_KEY);
    }

    build_tree(document)
}

/// Read and parse an encrypted document from disk
pub fn load_structure_file(path: &Path) -> Result<SecretTree> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::StructureSource(format!("Failed to read {}: {}", path.display(), e))
    })?;

    let tree = parse_structure(&content)?;
    info!(
        "Loaded secrets structure from {} with {} top-level keys",
        path.display(),
        tree.top_level_len()
    );
    Ok(tree)
}

/// A key able to decrypt the document's data key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Key backend, e.g. `age` or `kms`
    pub kind: &'static str,
    /// Backend-specific key identifier
    pub id: String,
}

/// Backends and the fields that identify a key within each
const RECIPIENT_FIELDS: &[(&str, &[&str])] = &[
    ("age", &["recipient"]),
    ("pgp", &["fp"]),
    ("kms", &["arn"]),
    ("gcp_kms", &["resource_id"]),
    ("azure_kv", &["vault_url", "name"]),
    ("hc_vault", &["vault_address", "engine_path", "key_name"]),
];

/// List the recipients declared in the `sops` metadata block.
///
/// Includes recipients nested in `key_groups`. Returns an empty list for a
/// document without metadata.
pub fn recipients(content: &str) -> Result<Vec<Recipient>> {
    let document: Value = serde_yaml::from_str(content)
        .map_err(|e| Error::StructureSource(format!("Failed to parse secrets file: {}", e)))?;

    let mut out = Vec::new();
    if let Some(Value::Mapping(metadata)) = document.get(SOPS_METADATA_KEY) {
        collect_recipients(metadata, &mut out);

        if let Some(Value::Sequence(groups)) = metadata.get("key_groups") {
            for group in groups.iter().filter_map(Value::as_mapping) {
                collect_recipients(group, &mut out);
            }
        }
    }
    Ok(out)
}

fn collect_recipients(metadata: &Mapping, out: &mut Vec<Recipient>) {
    for (kind, fields) in RECIPIENT_FIELDS {
        let Some(Value::Sequence(entries)) = metadata.get(*kind) else {
            continue;
        };
        for entry in entries {
            let parts: Vec<&str> = fields
                .iter()
                .filter_map(|field| entry.get(*field).and_then(Value::as_str))
                .collect();
            if !parts.is_empty() {
                out.push(Recipient {
                    kind: *kind,
                    id: parts.join("/"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{KeyPath, NodeKind};
    use std::io::Write;

    const ENCRYPTED: &str = r#"
database:
    password: ENC[AES256_GCM,data:9w==,iv:abc=,tag:def=,type:str]
    port: ENC[AES256_GCM,data:NTQzMg==,iv:abc=,tag:def=,type:int]
api:
    github: ENC[AES256_GCM,data:Z2g=,iv:abc=,tag:def=,type:str]
sops:
    kms: []
    age:
        - recipient: age1ql3z7hjy54pw3hyww5ayyfg7zqgvc7w3j2elw8zmrj2kg5sfn9aqmcac8p
          enc: |
            -----BEGIN AGE ENCRYPTED FILE-----
            -----END AGE ENCRYPTED FILE-----
    pgp:
        - created_at: "2024-01-01T00:00:00Z"
          enc: "..."
          fp: 85D77543B3D624B63CEA9E6DBC17301B491B3F21
    lastmodified: "2024-01-01T00:00:00Z"
    mac: ENC[AES256_GCM,data:abc,type:str]
    version: 3.8.1
"#;

    #[test]
    fn test_sops_metadata_excluded() {
        let tree = parse_structure(ENCRYPTED).unwrap();
        assert_eq!(tree.top_level_len(), 2);
        assert!(!tree.top_level().contains_key("sops"));

        let port = KeyPath::from_fs_path("/secrets/database/port").unwrap();
        assert_eq!(tree.resolve(&port).map(|n| n.kind()), Some(NodeKind::File));
    }

    #[test]
    fn test_json_document() {
        let tree = parse_structure(r#"{"a": {"b": "ENC[x]"}, "sops": {}}"#).unwrap();
        assert_eq!(tree.top_level_len(), 1);
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_invalid_documents() {
        assert!(matches!(
            parse_structure("a: [unclosed"),
            Err(Error::StructureSource(_))
        ));
        assert!(matches!(
            parse_structure("- just\n- a list\n"),
            Err(Error::StructureSource(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ENCRYPTED.as_bytes()).unwrap();

        let tree = load_structure_file(file.path()).unwrap();
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn test_missing_file() {
        let err = load_structure_file(Path::new("/nonexistent/secrets.yaml")).unwrap_err();
        assert!(matches!(err, Error::StructureSource(_)));
    }

    #[test]
    fn test_recipients() {
        let found = recipients(ENCRYPTED).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, "age");
        assert!(found[0].id.starts_with("age1ql3z"));
        assert_eq!(found[1].kind, "pgp");
        assert_eq!(found[1].id, "85D77543B3D624B63CEA9E6DBC17301B491B3F21");
    }

    #[test]
    fn test_recipients_in_key_groups() {
        let doc = r#"
a: ENC[x]
sops:
    key_groups:
        - age:
            - recipient: age1first
        - kms:
            - arn: arn:aws:kms:eu-west-1:123:key/abc
"#;
        let found = recipients(doc).unwrap();
        assert_eq!(
            found,
            vec![
                Recipient { kind: "age", id: "age1first".to_string() },
                Recipient { kind: "kms", id: "arn:aws:kms:eu-west-1:123:key/abc".to_string() },
            ]
        );
    }

    #[test]
    fn test_recipients_without_metadata() {
        assert!(recipients("a: b\n").unwrap().is_empty());
    }
}
