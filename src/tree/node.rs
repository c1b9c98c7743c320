//! Structure-only representation of the secrets document
//!
//! The tree records which keys exist and whether each one holds nested keys
//! or a value. Values themselves are never stored here.

use crate::error::{Error, Result};
use crate::tree::KeyPath;
use chrono::{DateTime, Utc};
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Kind of a resolved node as seen by the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Node with named children
    Directory,
    /// Node holding a single secret value
    File,
}

impl NodeKind {
    /// Convert to fuser file type
    pub fn to_fuser(&self) -> fuser::FileType {
        match self {
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::File => fuser::FileType::RegularFile,
        }
    }
}

/// One node of the secret tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretNode {
    /// Mapping from key to child node
    Interior(BTreeMap<String, SecretNode>),
    /// A value exists at this key path
    Leaf,
}

impl SecretNode {
    /// Directory for interior nodes, file for leaves
    pub fn kind(&self) -> NodeKind {
        classify(self)
    }

    /// Children of an interior node, `None` for leaves
    pub fn children(&self) -> Option<&BTreeMap<String, SecretNode>> {
        match self {
            SecretNode::Interior(children) => Some(children),
            SecretNode::Leaf => None,
        }
    }
}

/// Classify a resolved node
pub fn classify(node: &SecretNode) -> NodeKind {
    match node {
        SecretNode::Interior(_) => NodeKind::Directory,
        SecretNode::Leaf => NodeKind::File,
    }
}

/// Immutable snapshot of the secrets document structure
#[derive(Debug, Clone)]
pub struct SecretTree {
    /// Top-level mapping
    root: BTreeMap<String, SecretNode>,
    /// When this snapshot was built
    loaded_at: DateTime<Utc>,
}

impl SecretTree {
    /// Build a tree directly from top-level children
    pub fn from_children(root: BTreeMap<String, SecretNode>) -> Self {
        SecretTree {
            root,
            loaded_at: Utc::now(),
        }
    }

    /// Top-level keys and their nodes
    pub fn top_level(&self) -> &BTreeMap<String, SecretNode> {
        &self.root
    }

    /// Number of top-level keys
    pub fn top_level_len(&self) -> usize {
        self.root.len()
    }

    /// When this snapshot was built
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Walk the tree along `key_path`.
    ///
    /// Returns `None` as soon as a segment is missing or a leaf is reached
    /// while segments remain.
    pub fn resolve(&self, key_path: &KeyPath) -> Option<&SecretNode> {
        let (first, rest) = key_path.segments().split_first()?;
        let mut current = self.root.get(first)?;
        for segment in rest {
            current = current.children()?.get(segment)?;
        }
        Some(current)
    }

    /// Key paths of every leaf, in key order
    pub fn leaf_paths(&self) -> Vec<KeyPath> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        collect_leaves(&self.root, &mut prefix, &mut out);
        out
    }

    /// Number of leaves in the tree
    pub fn leaf_count(&self) -> usize {
        fn count(children: &BTreeMap<String, SecretNode>) -> usize {
            children
                .values()
                .map(|node| match node {
                    SecretNode::Interior(nested) => count(nested),
                    SecretNode::Leaf => 1,
                })
                .sum()
        }
        count(&self.root)
    }

    /// First leaf in key order, used to pick a self-test target
    pub fn first_leaf(&self) -> Option<KeyPath> {
        let mut prefix = Vec::new();
        first_leaf_in(&self.root, &mut prefix)
    }
}

fn collect_leaves(
    children: &BTreeMap<String, SecretNode>,
    prefix: &mut Vec<String>,
    out: &mut Vec<KeyPath>,
) {
    for (name, node) in children {
        prefix.push(name.clone());
        match node {
            SecretNode::Interior(nested) => collect_leaves(nested, prefix, out),
            SecretNode::Leaf => out.extend(KeyPath::new(prefix.clone())),
        }
        prefix.pop();
    }
}

fn first_leaf_in(
    children: &BTreeMap<String, SecretNode>,
    prefix: &mut Vec<String>,
) -> Option<KeyPath> {
    for (name, node) in children {
        prefix.push(name.clone());
        let found = match node {
            SecretNode::Interior(nested) => first_leaf_in(nested, prefix),
            SecretNode::Leaf => KeyPath::new(prefix.clone()),
        };
        if found.is_some() {
            return found;
        }
        prefix.pop();
    }
    None
}

/// Build a tree from parsed structural metadata.
///
/// The document root must be a mapping. Nested mappings become interior
/// nodes; every other value (scalar, sequence, null) becomes a leaf.
pub fn build_tree(metadata: Value) -> Result<SecretTree> {
    match metadata {
        Value::Mapping(mapping) => Ok(SecretTree::from_children(build_mapping(mapping))),
        Value::Tagged(tagged) => build_tree(tagged.value),
        other => Err(Error::StructureSource(format!(
            "expected a mapping at the document root, found {}",
            value_kind(&other)
        ))),
    }
}

fn build_mapping(mapping: serde_yaml::Mapping) -> BTreeMap<String, SecretNode> {
    let mut children = BTreeMap::new();
    for (key, value) in mapping {
        let Some(name) = key_text(&key) else {
            debug!("Skipping non-string key of kind {}", value_kind(&key));
            continue;
        };
        if children.insert(name.clone(), build_node(value)).is_some() {
            warn!("Duplicate key {:?} after key conversion, keeping the last one", name);
        }
    }
    children
}

fn build_node(value: Value) -> SecretNode {
    match value {
        Value::Mapping(mapping) => SecretNode::Interior(build_mapping(mapping)),
        Value::Tagged(tagged) => build_node(tagged.value),
        _ => SecretNode::Leaf,
    }
}

/// Text of a string mapping key; sops addresses values by string key only
fn key_text(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Tagged(tagged) => key_text(&tagged.value),
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
