//! The locally visible topology: a tree rooted at self, with each
//! neighbour's advertised subtree as a child.
//!
//! Trees are value types. A connection stores the subtree its peer last
//! advertised; exchanging them over NodeSync copies the whole structure.

use serde_json::{json, Map, Value};

use crate::wire::ProtoError;
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub node_id: NodeId,
    pub root: bool,
    pub contains_root: bool,
    pub time_authority: bool,
    pub subs: Vec<Tree>,
}

impl Tree {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id, root: false, contains_root: false, time_authority: false, subs: Vec::new() }
    }

    /// Pre-order flatten into a node list.
    pub fn as_list(&self, include_self: bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        if include_self {
            out.push(self.node_id);
        }
        for sub in &self.subs {
            out.extend(sub.as_list(true));
        }
        out
    }

    /// Number of nodes in the tree, self included.
    pub fn size(&self) -> usize {
        1 + self.subs.iter().map(Tree::size).sum::<usize>()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.node_id == node_id || self.subs.iter().any(|sub| sub.contains(node_id))
    }

    pub fn find_subtree(&self, node_id: NodeId) -> Option<&Tree> {
        if self.node_id == node_id {
            return Some(self);
        }
        self.subs.iter().find_map(|sub| sub.find_subtree(node_id))
    }

    /// Path from this node down to `target`, inclusive on both ends.
    /// In a tree the unique descent path is also the BFS shortest path.
    pub fn path_to(&self, target: NodeId) -> Option<Vec<NodeId>> {
        if self.node_id == target {
            return Some(vec![self.node_id]);
        }
        for sub in &self.subs {
            if let Some(mut path) = sub.path_to(target) {
                path.insert(0, self.node_id);
                return Some(path);
            }
        }
        None
    }

    /// Hop distance from this node to `target`, or `None` if unreachable.
    pub fn hops_to(&self, target: NodeId) -> Option<u32> {
        self.path_to(target).map(|path| (path.len() - 1) as u32)
    }

    /// True iff this node is the root or any descendant is.
    pub fn computes_contains_root(&self) -> bool {
        self.root || self.subs.iter().any(Tree::computes_contains_root)
    }

    /// False/empty attributes are omitted on the wire, matching the compact
    /// form peers emit.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("nodeId".into(), json!(self.node_id));
        if self.root {
            obj.insert("root".into(), json!(true));
        }
        if self.contains_root {
            obj.insert("containsRoot".into(), json!(true));
        }
        if self.time_authority {
            obj.insert("timeAuthority".into(), json!(true));
        }
        if !self.subs.is_empty() {
            obj.insert("subs".into(), Value::Array(self.subs.iter().map(Tree::to_value).collect()));
        }
        Value::Object(obj)
    }

    pub fn from_value(value: &Value) -> Result<Tree, ProtoError> {
        let obj = value.as_object().ok_or(ProtoError::NotAnObject)?;
        let node_id = obj
            .get("nodeId")
            .ok_or(ProtoError::MissingField("nodeId"))?
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .ok_or(ProtoError::BadField("nodeId"))?;

        let mut tree = Tree::new(node_id);
        tree.root = flag(obj, "root");
        tree.contains_root = flag(obj, "containsRoot");
        tree.time_authority = flag(obj, "timeAuthority");
        if let Some(subs) = obj.get("subs") {
            let subs = subs.as_array().ok_or(ProtoError::BadField("subs"))?;
            tree.subs = subs.iter().map(Tree::from_value).collect::<Result<_, _>>()?;
        }
        Ok(tree)
    }
}

fn flag(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree {
        // 1 -> (2 -> 4, 3)
        let mut tree = Tree::new(1);
        let mut two = Tree::new(2);
        two.subs.push(Tree::new(4));
        tree.subs.push(two);
        tree.subs.push(Tree::new(3));
        tree
    }

    #[test]
    fn as_list_is_preorder() {
        assert_eq!(sample().as_list(true), vec![1, 2, 4, 3]);
        assert_eq!(sample().as_list(false), vec![2, 4, 3]);
    }

    #[test]
    fn contains_descends() {
        let tree = sample();
        assert!(tree.contains(4));
        assert!(!tree.contains(5));
    }

    #[test]
    fn find_subtree_returns_inner_node() {
        let tree = sample();
        let sub = tree.find_subtree(2).expect("subtree 2");
        assert_eq!(sub.as_list(true), vec![2, 4]);
    }

    #[test]
    fn path_to_self_is_single_entry() {
        assert_eq!(sample().path_to(1), Some(vec![1]));
    }

    #[test]
    fn path_to_leaf_walks_the_tree() {
        assert_eq!(sample().path_to(4), Some(vec![1, 2, 4]));
        assert_eq!(sample().path_to(99), None);
    }

    #[test]
    fn hops_count_edges_not_nodes() {
        assert_eq!(sample().hops_to(1), Some(0));
        assert_eq!(sample().hops_to(4), Some(2));
        assert_eq!(sample().hops_to(99), None);
    }

    #[test]
    fn contains_root_recomputes_from_descendants() {
        let mut tree = sample();
        assert!(!tree.computes_contains_root());
        tree.subs[0].subs[0].root = true;
        assert!(tree.computes_contains_root());
    }

    #[test]
    fn json_roundtrip_drops_nothing() {
        let mut tree = sample();
        tree.root = true;
        tree.contains_root = true;
        tree.subs[1].time_authority = true;

        let decoded = Tree::from_value(&tree.to_value()).expect("decode");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn compact_form_omits_false_flags() {
        let value = Tree::new(9).to_value();
        let obj = value.as_object().expect("object");
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("nodeId"));
    }
}
