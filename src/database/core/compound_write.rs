use crate::database::core::path::Path;
use crate::database::core::snap::{Index, NamedNode, Node};
use crate::database::core::util::ImmutableTree;
use crate::util::{assert, CONSTANTS};

/// A set of overwrites layered at different paths.
///
/// A write at some path swallows any writes below it; later writes below an
/// existing one are folded into that write's node.
#[derive(Clone, Debug, Default)]
pub struct CompoundWrite {
    writes: ImmutableTree<Node>,
}

impl CompoundWrite {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_tree(writes: ImmutableTree<Node>) -> Self {
        Self { writes }
    }

    pub fn tree(&self) -> &ImmutableTree<Node> {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn add_write(&self, path: &Path, node: Node) -> CompoundWrite {
        if path.is_empty() {
            return CompoundWrite::from_tree(ImmutableTree::with_value(node));
        }
        if let Some((root_path, root_node)) = self.writes.find_rootmost_value_and_path(path) {
            let relative = Path::relative(&root_path, path);
            let updated = root_node.update_child(&relative, node);
            return CompoundWrite::from_tree(self.writes.set(&root_path, updated));
        }
        CompoundWrite::from_tree(
            self.writes
                .set_tree(path, ImmutableTree::with_value(node)),
        )
    }

    /// Adds every write of `other` relative to `path`.
    pub fn add_writes(&self, path: &Path, other: &CompoundWrite) -> CompoundWrite {
        let mut result = self.clone();
        other.writes.foreach(|relative, node| {
            result = result.add_write(&path.child_path(relative), node.clone());
        });
        result
    }

    /// Drops the write at `path` and everything below it.
    pub fn remove_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return CompoundWrite::empty();
        }
        CompoundWrite::from_tree(self.writes.set_tree(path, ImmutableTree::new()))
    }

    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.get_complete_node(path).is_some()
    }

    /// The node at `path` if a single write fully determines it.
    pub fn get_complete_node(&self, path: &Path) -> Option<Node> {
        self.writes
            .find_rootmost_value_and_path(path)
            .map(|(root_path, node)| node.child(&Path::relative(&root_path, path)))
    }

    /// Immediate children fully determined by this write set.
    pub fn get_complete_children(&self) -> Vec<NamedNode> {
        match self.writes.value() {
            Some(node) => node.ordered_children(&Index::Priority),
            None => {
                let mut children = Vec::new();
                self.writes.foreach_child(|key, node| {
                    children.push(NamedNode::new(key, node.clone()));
                });
                children
            }
        }
    }

    /// The writes as seen from `path`.
    pub fn child_compound_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        match self.get_complete_node(path) {
            Some(shadowing) => CompoundWrite::from_tree(ImmutableTree::with_value(shadowing)),
            None => CompoundWrite::from_tree(self.writes.subtree(path)),
        }
    }

    /// Layers the writes on top of `node`. Priority writes are applied last so
    /// they land on whatever the sibling writes produced.
    pub fn apply(&self, node: &Node) -> Node {
        apply_subtree_write(&Path::empty(), &self.writes, node.clone())
    }
}

fn apply_subtree_write(relative: &Path, tree: &ImmutableTree<Node>, node: Node) -> Node {
    if let Some(value) = tree.value() {
        return node.update_child(relative, value.clone());
    }
    let mut node = node;
    let mut priority_write = None;
    for (key, child_tree) in tree.children() {
        if key == CONSTANTS.priority_key {
            assert(
                child_tree.value().is_some(),
                "Priority writes must always be leaf nodes",
            );
            priority_write = child_tree.value().cloned();
        } else {
            node = apply_subtree_write(&relative.child(key), child_tree, node);
        }
    }
    if let Some(priority) = priority_write {
        if !node.child(relative).is_empty() {
            node = node.update_child(&relative.child(CONSTANTS.priority_key), priority);
        }
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn node(value: Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn path(text: &str) -> Path {
        Path::parse(text).unwrap()
    }

    #[test]
    fn deeper_write_folds_into_existing_one() {
        let writes = CompoundWrite::empty()
            .add_write(&path("a"), node(json!({ "b": 1 })))
            .add_write(&path("a/c"), Node::leaf(2.0));
        assert_eq!(
            writes.get_complete_node(&path("a")).unwrap().val(),
            json!({ "b": 1, "c": 2 })
        );
        assert!(writes.tree().get(&path("a/c")).is_none());
    }

    #[test]
    fn shallower_write_replaces_deeper_ones() {
        let writes = CompoundWrite::empty()
            .add_write(&path("a/b"), Node::leaf(1.0))
            .add_write(&path("a"), Node::leaf(5.0));
        assert_eq!(writes.get_complete_node(&path("a/b")), Some(Node::empty()));
        assert_eq!(writes.apply(&Node::empty()).val(), json!({ "a": 5 }));
    }

    #[test]
    fn apply_layers_over_server_data() {
        let server = node(json!({ "a": { "x": 1, "y": 2 }, "b": 3 }));
        let writes = CompoundWrite::empty()
            .add_write(&path("a/y"), Node::leaf(20.0))
            .add_write(&path("c"), Node::leaf("new"));
        assert_eq!(
            writes.apply(&server).val(),
            json!({ "a": { "x": 1, "y": 20 }, "b": 3, "c": "new" })
        );
    }

    #[test]
    fn priority_write_applies_after_siblings() {
        let writes = CompoundWrite::empty()
            .add_write(&path("a").child(".priority"), Node::leaf(4.0))
            .add_write(&path("a/b"), Node::leaf(1.0));
        let applied = writes.apply(&Node::empty());
        assert_eq!(applied.child(&path("a")).priority().val(), json!(4));

        let priority_only = CompoundWrite::empty().add_write(&path("gone").child(".priority"), Node::leaf(1.0));
        assert!(priority_only.apply(&Node::empty()).is_empty());
    }

    #[test]
    fn child_compound_write_synthesizes_from_shadowing_write() {
        let writes = CompoundWrite::empty().add_write(&path("a"), node(json!({ "b": { "c": 1 } })));
        let child = writes.child_compound_write(&path("a/b"));
        assert_eq!(child.get_complete_node(&Path::empty()).unwrap().val(), json!({ "c": 1 }));
        assert!(writes.child_compound_write(&path("z")).is_empty());
    }

    #[test]
    fn complete_children_lists_direct_writes() {
        let writes = CompoundWrite::empty()
            .add_write(&path("x"), Node::leaf(1.0))
            .add_write(&path("y/z"), Node::leaf(2.0));
        let names: Vec<String> = writes
            .get_complete_children()
            .into_iter()
            .map(|named| named.name)
            .collect();
        assert_eq!(names, vec!["x".to_string()]);
    }

    #[test]
    fn remove_write_drops_subtree() {
        let writes = CompoundWrite::empty()
            .add_write(&path("a/b"), Node::leaf(1.0))
            .add_write(&path("a/c"), Node::leaf(2.0));
        let removed = writes.remove_write(&path("a/b"));
        assert!(!removed.has_complete_write(&path("a/b")));
        assert!(removed.has_complete_write(&path("a/c")));
        assert!(writes.remove_write(&Path::empty()).is_empty());
    }
}
