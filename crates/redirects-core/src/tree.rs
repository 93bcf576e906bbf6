//! Content tree flattening and old/new diffing.
//!
//! The content tree is treated as an opaque labeled tree: every node has an
//! id, a URI and children. A move shows up as the same node id carrying a
//! different URI in the new tree, which is turned into an automatic
//! `old URI → new URI` redirect.
//!
//! Nodes that only exist in the old tree are not translated into
//! definitions here. Their redirects are retired by the liveness check in
//! [`consolidate`](crate::consolidate), which sees the whole redirect set.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{RedirectError, Result};
use crate::models::{Dimension, RedirectDefinition};

/// One node of an exported content tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: String,
    pub uri: String,
    /// Children keyed by node id.
    #[serde(default)]
    pub nodes: BTreeMap<String, ContentNode>,
}

impl ContentNode {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            nodes: BTreeMap::new(),
        }
    }

    /// Builder helper used by content fixtures and tests.
    pub fn with_child(mut self, child: ContentNode) -> Self {
        self.nodes.insert(child.id.clone(), child);
        self
    }
}

/// A node in a flattened tree; children are referenced by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatNode {
    pub id: String,
    pub uri: String,
    pub children: Vec<String>,
}

/// Flat `node id → node` mapping for one dimension.
pub type NodeMap = HashMap<String, FlatNode>;

/// Flattens a content tree into a [`NodeMap`].
///
/// Uses an explicit worklist so deep or adversarial trees cannot exhaust
/// the call stack. A missing root yields an empty map.
pub fn flatten_tree(root: Option<&ContentNode>) -> NodeMap {
    let mut map = NodeMap::new();
    let mut stack: Vec<&ContentNode> = root.into_iter().collect();

    while let Some(node) = stack.pop() {
        map.insert(
            node.id.clone(),
            FlatNode {
                id: node.id.clone(),
                uri: node.uri.clone(),
                children: node.nodes.keys().cloned().collect(),
            },
        );
        stack.extend(node.nodes.values());
    }

    map
}

/// URIs currently present in a flattened tree.
pub fn available_targets(map: &NodeMap) -> HashSet<String> {
    map.values().map(|node| node.uri.clone()).collect()
}

/// Derives automatic redirects from the old and new state of one dimension.
///
/// For every node id present in both maps whose URI changed, emits a
/// permanent `old URI → new URI` redirect that respects and transfers
/// query parameters and links back to the node via `content_id`.
/// Output is sorted by source.
///
/// # Errors
///
/// Returns [`RedirectError::InvalidInput`] when either map is empty, to
/// tell "nothing changed" apart from "caller passed bad data".
pub fn diff_trees(
    old: &NodeMap,
    new: &NodeMap,
    dimension: &Dimension,
) -> Result<Vec<RedirectDefinition>> {
    if old.is_empty() || new.is_empty() {
        return Err(RedirectError::invalid(format!(
            "cannot diff content trees for dimension '{dimension}': old or new state is empty"
        )));
    }

    let mut redirects: Vec<RedirectDefinition> = new
        .iter()
        .filter_map(|(id, new_node)| {
            let old_node = old.get(id)?;
            (old_node.uri != new_node.uri).then(|| {
                RedirectDefinition::automatic(
                    old_node.uri.clone(),
                    new_node.uri.clone(),
                    dimension.clone(),
                    Some(id.clone()),
                )
            })
        })
        .collect();

    redirects.sort_by(|a, b| a.source.cmp(&b.source));
    tracing::debug!(
        dimension = %dimension,
        count = redirects.len(),
        "derived automatic redirects from content diff"
    );
    Ok(redirects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RedirectCode, RedirectionType};

    fn old_tree() -> ContentNode {
        ContentNode::new("1", "/main")
            .with_child(ContentNode::new("2", "/main/herren"))
            .with_child(
                ContentNode::new("3", "/main/damen/kleidung")
                    .with_child(ContentNode::new("4", "/damen/kleidung/schuhe"))
                    .with_child(ContentNode::new("5", "/damen/kleidung/roecke")),
            )
            .with_child(ContentNode::new("8", "/main/sport"))
    }

    fn new_tree() -> ContentNode {
        ContentNode::new("1", "/main")
            .with_child(ContentNode::new("2", "/main/herren"))
            .with_child(
                ContentNode::new("3", "/main/damen/kleidung")
                    .with_child(ContentNode::new("4", "/damen/kleidung/schuhe-new"))
                    .with_child(ContentNode::new("5", "/damen/kleidung/roecke-new")),
            )
    }

    #[test]
    fn test_flatten_collects_every_node() {
        let map = flatten_tree(Some(&old_tree()));
        assert_eq!(map.len(), 6);
        assert_eq!(map["3"].children, vec!["4".to_string(), "5".to_string()]);
        assert_eq!(map["4"].uri, "/damen/kleidung/schuhe");
    }

    #[test]
    fn test_flatten_missing_root() {
        assert!(flatten_tree(None).is_empty());
    }

    #[test]
    fn test_flatten_deep_tree_without_recursion() {
        let mut node = ContentNode::new("leaf", "/leaf");
        for depth in 0..50_000 {
            node = ContentNode::new(format!("n{depth}"), format!("/n{depth}")).with_child(node);
        }
        let map = flatten_tree(Some(&node));
        assert_eq!(map.len(), 50_001);
        // Dropping a 50k-deep tree recurses in the derived Drop impl; leak it instead.
        std::mem::forget(node);
    }

    #[test]
    fn test_two_moved_nodes_emit_two_redirects() {
        let old = flatten_tree(Some(&old_tree()));
        let new = flatten_tree(Some(&new_tree()));
        let redirects = diff_trees(&old, &new, &Dimension::from("de")).unwrap();

        assert_eq!(redirects.len(), 2);
        assert_eq!(redirects[0].source, "/damen/kleidung/roecke");
        assert_eq!(redirects[0].target, "/damen/kleidung/roecke-new");
        assert_eq!(redirects[1].source, "/damen/kleidung/schuhe");
        assert_eq!(redirects[1].target, "/damen/kleidung/schuhe-new");
        for r in &redirects {
            assert_eq!(r.redirection_type, RedirectionType::Automatic);
            assert_eq!(r.code, RedirectCode::Permanent);
            assert!(r.respect_params && r.transfer_params);
            assert_eq!(r.dimension.as_str(), "de");
            assert!(!r.stale);
        }
        assert_eq!(redirects[1].content_id.as_deref(), Some("4"));
        assert_ne!(redirects[0].id, redirects[1].id);
    }

    #[test]
    fn test_removed_nodes_are_not_translated() {
        let old = flatten_tree(Some(&old_tree()));
        let new = flatten_tree(Some(&new_tree()));
        let redirects = diff_trees(&old, &new, &Dimension::from("de")).unwrap();
        assert!(redirects.iter().all(|r| r.source != "/main/sport"));
    }

    #[test]
    fn test_unchanged_tree_yields_nothing() {
        let old = flatten_tree(Some(&old_tree()));
        let redirects = diff_trees(&old, &old.clone(), &Dimension::from("de")).unwrap();
        assert!(redirects.is_empty());
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let old = flatten_tree(Some(&old_tree()));
        let err = diff_trees(&old, &NodeMap::new(), &Dimension::from("de")).unwrap_err();
        assert!(matches!(err, RedirectError::InvalidInput(_)));
        let err = diff_trees(&NodeMap::new(), &old, &Dimension::from("de")).unwrap_err();
        assert!(matches!(err, RedirectError::InvalidInput(_)));
    }

    #[test]
    fn test_available_targets() {
        let targets = available_targets(&flatten_tree(Some(&new_tree())));
        assert!(targets.contains("/damen/kleidung/schuhe-new"));
        assert!(!targets.contains("/main/sport"));
    }

    #[test]
    fn test_content_node_json() {
        let json = r#"{"id":"1","uri":"/","nodes":{"2":{"id":"2","uri":"/a"}}}"#;
        let node: ContentNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.nodes["2"].uri, "/a");
        assert!(node.nodes["2"].nodes.is_empty());
    }
}
