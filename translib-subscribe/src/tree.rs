//! Sparse data tree used as notification payload
//!
//! A [`DataTree`] maps path segments to either a leaf value or a nested
//! subtree. Segments are the string form of one path element, so list
//! instances appear as `interface[name=Ethernet0]`. Merging is structural:
//! subtrees merge recursively and leaves overwrite.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use translib_path::Path;

use crate::error::{Result, SubscribeError};

/// A leaf value or a subtree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataNode {
    Tree(DataTree),
    Leaf(serde_json::Value),
}

impl DataNode {
    pub fn leaf(value: impl Into<serde_json::Value>) -> Self {
        DataNode::Leaf(value.into())
    }

    pub fn as_tree(&self) -> Option<&DataTree> {
        match self {
            DataNode::Tree(t) => Some(t),
            DataNode::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&serde_json::Value> {
        match self {
            DataNode::Leaf(v) => Some(v),
            DataNode::Tree(_) => None,
        }
    }

    /// A subtree with no children carries no data
    pub fn is_empty(&self) -> bool {
        matches!(self, DataNode::Tree(t) if t.is_empty())
    }
}

impl From<DataTree> for DataNode {
    fn from(tree: DataTree) -> Self {
        DataNode::Tree(tree)
    }
}

/// Mapping of path segment to value or subtree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataTree {
    children: BTreeMap<String, DataNode>,
}

impl DataTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style insert of one child
    pub fn with(mut self, segment: impl Into<String>, node: impl Into<DataNode>) -> Self {
        self.insert(segment, node);
        self
    }

    /// Builder style insert of one leaf
    pub fn with_leaf(self, segment: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.with(segment, DataNode::leaf(value))
    }

    pub fn insert(&mut self, segment: impl Into<String>, node: impl Into<DataNode>) {
        self.children.insert(segment.into(), node.into());
    }

    pub fn get(&self, segment: &str) -> Option<&DataNode> {
        self.children.get(segment)
    }

    pub fn remove(&mut self, segment: &str) -> Option<DataNode> {
        self.children.remove(segment)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DataNode)> {
        self.children.iter()
    }

    /// Node at a relative path, if present
    pub fn lookup(&self, rel: &Path) -> Option<&DataNode> {
        let mut elems = rel.elems().iter();
        let first = elems.next()?;
        let mut node = self.children.get(&first.to_string())?;
        for e in elems {
            node = node.as_tree()?.children.get(&e.to_string())?;
        }
        Some(node)
    }

    /// Recursively merge another tree into this one
    pub fn merge(&mut self, other: DataTree) {
        for (segment, node) in other.children {
            self.merge_child(segment, node);
        }
    }

    fn merge_child(&mut self, segment: String, node: DataNode) {
        match (self.children.get_mut(&segment), node) {
            (Some(DataNode::Tree(existing)), DataNode::Tree(incoming)) => existing.merge(incoming),
            (_, node) => {
                self.children.insert(segment, node);
            }
        }
    }

    /// Merge `node` at the relative path `rel`, creating subtrees on the way.
    ///
    /// A leaf cannot be merged at the empty path.
    pub fn merge_at(&mut self, rel: &Path, node: DataNode) -> Result<()> {
        let Some((last, parents)) = rel.elems().split_last() else {
            return match node {
                DataNode::Tree(t) => {
                    self.merge(t);
                    Ok(())
                }
                DataNode::Leaf(_) => Err(SubscribeError::Internal(
                    "cannot merge a leaf value at the tree root".to_string(),
                )),
            };
        };

        let mut cursor = self;
        for e in parents {
            let entry = cursor
                .children
                .entry(e.to_string())
                .or_insert_with(|| DataNode::Tree(DataTree::new()));
            if let DataNode::Leaf(_) = entry {
                *entry = DataNode::Tree(DataTree::new());
            }
            let DataNode::Tree(subtree) = entry else {
                return Err(SubscribeError::Internal(format!("no subtree at {}", e)));
            };
            cursor = subtree;
        }
        cursor.merge_child(last.to_string(), node);
        Ok(())
    }

    /// Tree holding `node` under the relative path `rel`
    pub fn wrap(rel: &Path, node: DataNode) -> Result<DataTree> {
        let mut tree = DataTree::new();
        tree.merge_at(rel, node)?;
        Ok(tree)
    }

    /// Drop top level leaves with the given names
    pub fn remove_leaves<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            if let Some(DataNode::Leaf(_)) = self.children.get(name) {
                self.children.remove(name);
            }
        }
    }
}
