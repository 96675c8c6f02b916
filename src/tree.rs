//! Artifact tree assembly
//!
//! Turns the flat list of artifact records of a run into a directory-like
//! tree for rendering and lookup. Trees are rebuilt on every request.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::{ArtifactRecord, Error, Result};

/// Artifact attached to a leaf node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactLeaf {
    pub uri: String,
    pub path: String,
    pub run_uuid: String,
}

/// One node of the artifact tree.
///
/// Interior nodes have children and no artifact; leaves have an artifact and
/// no children. Children are sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactTreeNode {
    pub children: BTreeMap<String, ArtifactTreeNode>,
    pub artifact: Option<ArtifactLeaf>,
}

impl ArtifactTreeNode {
    pub fn is_leaf(&self) -> bool {
        self.artifact.is_some()
    }

    pub fn child(&self, name: &str) -> Option<&ArtifactTreeNode> {
        self.children.get(name)
    }

    /// Look up the node at a `/`-delimited path
    pub fn get(&self, path: &str) -> Option<&ArtifactTreeNode> {
        path.split('/')
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    /// All leaves below this node, in path order
    pub fn leaves(&self) -> Vec<&ArtifactLeaf> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a ArtifactLeaf>) {
        if let Some(leaf) = &self.artifact {
            out.push(leaf);
        }
        for child in self.children.values() {
            child.collect_leaves(out);
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }
}

/// Build the artifact tree of a run.
///
/// Paths are trusted (validated at upload). A path that is a strict prefix of
/// another artifact's path cannot be both file and directory and is reported
/// as [`Error::ArtifactPathConflict`]. A repeated path replaces the earlier
/// record.
pub fn build_tree(run_uuid: &str, artifacts: &[ArtifactRecord]) -> Result<ArtifactTreeNode> {
    let mut root = ArtifactTreeNode::default();

    for record in artifacts {
        let mut node = &mut root;

        for segment in record.path.split('/') {
            if let Some(leaf) = &node.artifact {
                return Err(Error::ArtifactPathConflict {
                    path: record.path.clone(),
                    existing: leaf.path.clone(),
                });
            }
            node = node.children.entry(segment.to_string()).or_default();
        }

        // Terminal node is already a directory
        if !node.children.is_empty() {
            let existing = node
                .leaves()
                .first()
                .map(|leaf| leaf.path.clone())
                .unwrap_or_default();
            return Err(Error::ArtifactPathConflict {
                path: record.path.clone(),
                existing,
            });
        }

        node.artifact = Some(ArtifactLeaf {
            uri: record.uri.clone(),
            path: record.path.clone(),
            run_uuid: run_uuid.to_string(),
        });
    }

    Ok(root)
}

/// Find an existing path that `candidate` cannot coexist with.
///
/// Two paths conflict when one is a directory prefix of the other. Equal
/// paths do not conflict (re-upload replaces).
pub fn conflicting_path<'a, I>(existing: I, candidate: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    existing.into_iter().find(|path| {
        is_dir_prefix(path, candidate) || is_dir_prefix(candidate, path)
    })
}

fn is_dir_prefix(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'/'
}
