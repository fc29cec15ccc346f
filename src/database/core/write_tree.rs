use std::collections::BTreeMap;

use crate::database::core::compound_write::CompoundWrite;
use crate::database::core::path::Path;
use crate::database::core::snap::{Index, Node};
use crate::database::core::util::ImmutableTree;
use crate::util::{assert, fail};

/// Payload of a pending write.
#[derive(Clone, Debug)]
pub enum WriteData {
    Overwrite(Node),
    /// Values keyed by path relative to the write's path.
    Merge(BTreeMap<Path, Node>),
}

/// A local write that the server has not acknowledged yet.
#[derive(Clone, Debug)]
pub struct WriteRecord {
    pub write_id: u64,
    pub path: Path,
    pub data: WriteData,
    pub visible: bool,
}

impl WriteRecord {
    fn contains_path(&self, path: &Path) -> bool {
        match &self.data {
            WriteData::Overwrite(_) => self.path.contains(path),
            WriteData::Merge(children) => children
                .keys()
                .any(|child| self.path.child_path(child).contains(path)),
        }
    }

    /// Locations, relative to the write path, whose value this write affects.
    pub fn affected_tree(&self) -> ImmutableTree<bool> {
        match &self.data {
            WriteData::Overwrite(_) => ImmutableTree::with_value(true),
            WriteData::Merge(children) => children
                .keys()
                .fold(ImmutableTree::new(), |tree, child| tree.set(child, true)),
        }
    }
}

fn merge_to_compound(children: &BTreeMap<Path, Node>) -> CompoundWrite {
    children
        .iter()
        .fold(CompoundWrite::empty(), |write, (path, node)| {
            write.add_write(path, node.clone())
        })
}

/// Pending local writes, kept in write id order and layered over server data.
#[derive(Debug, Default)]
pub struct WriteTree {
    visible_writes: CompoundWrite,
    all_writes: Vec<WriteRecord>,
    last_write_id: Option<u64>,
}

impl WriteTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_overwrite(&mut self, path: Path, snap: Node, write_id: u64, visible: bool) {
        self.check_write_id(write_id);
        if visible {
            self.visible_writes = self.visible_writes.add_write(&path, snap.clone());
        }
        self.all_writes.push(WriteRecord {
            write_id,
            path,
            data: WriteData::Overwrite(snap),
            visible,
        });
        self.last_write_id = Some(write_id);
    }

    pub fn add_merge(&mut self, path: Path, children: BTreeMap<Path, Node>, write_id: u64) {
        self.check_write_id(write_id);
        self.visible_writes = self
            .visible_writes
            .add_writes(&path, &merge_to_compound(&children));
        self.all_writes.push(WriteRecord {
            write_id,
            path,
            data: WriteData::Merge(children),
            visible: true,
        });
        self.last_write_id = Some(write_id);
    }

    #[track_caller]
    fn check_write_id(&self, write_id: u64) {
        if let Some(last) = self.last_write_id {
            assert(
                write_id > last,
                "Stacking an older write on top of newer ones",
            );
        }
    }

    pub fn get_write(&self, write_id: u64) -> Option<&WriteRecord> {
        self.all_writes
            .iter()
            .find(|record| record.write_id == write_id)
    }

    pub fn writes(&self) -> &[WriteRecord] {
        &self.all_writes
    }

    pub fn is_empty(&self) -> bool {
        self.all_writes.is_empty()
    }

    /// Removes a write once it was acknowledged or reverted.
    ///
    /// Returns true when the visible value of some location may have changed
    /// and views need to be re-evaluated.
    pub fn remove_write(&mut self, write_id: u64) -> bool {
        let Some(index) = self
            .all_writes
            .iter()
            .position(|record| record.write_id == write_id)
        else {
            fail(format!("remove_write called with nonexistent write id {write_id}"));
        };
        let removed = self.all_writes.remove(index);

        let mut removed_was_visible = removed.visible;
        let mut overlaps_other_writes = false;
        for (position, current) in self.all_writes.iter().enumerate().rev() {
            if !removed_was_visible {
                break;
            }
            if !current.visible {
                continue;
            }
            if position >= index && current.contains_path(&removed.path) {
                // A later write shadows the removed one.
                removed_was_visible = false;
            } else if removed.path.contains(&current.path) {
                overlaps_other_writes = true;
            }
        }

        if !removed_was_visible {
            return false;
        }
        if overlaps_other_writes {
            self.reset_tree();
            return true;
        }
        match &removed.data {
            WriteData::Overwrite(_) => {
                self.visible_writes = self.visible_writes.remove_write(&removed.path);
            }
            WriteData::Merge(children) => {
                for child in children.keys() {
                    self.visible_writes = self
                        .visible_writes
                        .remove_write(&removed.path.child_path(child));
                }
            }
        }
        true
    }

    fn reset_tree(&mut self) {
        self.visible_writes = layer_tree(&self.all_writes, &Path::empty(), |write| write.visible);
    }

    /// A complete node at `path` coming from a visible write, if any.
    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.visible_writes.get_complete_node(path)
    }

    /// The value a listener at `path` should see: `server_cache` (when it is
    /// complete) with all visible writes layered on top.
    ///
    /// Returns `None` when neither the server cache nor the writes fully
    /// determine the value.
    pub fn calc_complete_event_cache(&self, path: &Path, server_cache: Option<&Node>) -> Option<Node> {
        if let Some(shadowing) = self.visible_writes.get_complete_node(path) {
            return Some(shadowing);
        }
        let merge = self.visible_writes.child_compound_write(path);
        if merge.is_empty() {
            return server_cache.cloned();
        }
        if server_cache.is_none() && !merge.has_complete_write(&Path::empty()) {
            return None;
        }
        let base = server_cache.cloned().unwrap_or_else(Node::empty);
        Some(merge.apply(&base))
    }

    /// The value at `path` with every pending write layered over
    /// `server_cache` (or over nothing), hidden ones included, except the
    /// writes listed in `exclude`.
    pub fn calc_latest_state(&self, path: &Path, server_cache: Option<&Node>, exclude: &[u64]) -> Node {
        let merge = layer_tree(&self.all_writes, path, |write| !exclude.contains(&write.write_id));
        merge.apply(&server_cache.cloned().unwrap_or_else(Node::empty))
    }

    /// Every child of `path` whose value is fully known, combining the
    /// complete children of `server_children` with visible writes.
    pub fn calc_complete_event_children(&self, path: &Path, server_children: Option<&Node>) -> Node {
        let mut complete = Node::empty();
        if let Some(top_level) = self.visible_writes.get_complete_node(path) {
            if !top_level.is_leaf() {
                for named in top_level.ordered_children(&Index::Priority) {
                    complete = complete.update_immediate_child(&named.name, named.node);
                }
            }
            return complete;
        }
        let merge = self.visible_writes.child_compound_write(path);
        if let Some(server_children) = server_children {
            for (key, child) in server_children.children() {
                let key_path = Path::from_trusted(vec![key.to_string()]);
                let node = merge.child_compound_write(&key_path).apply(child);
                complete = complete.update_immediate_child(key, node);
            }
        }
        for named in merge.get_complete_children() {
            complete = complete.update_immediate_child(&named.name, named.node);
        }
        complete
    }
}

/// Layers the writes accepted by `include`, as seen from `tree_root`.
fn layer_tree<F>(writes: &[WriteRecord], tree_root: &Path, include: F) -> CompoundWrite
where
    F: Fn(&WriteRecord) -> bool,
{
    let mut compound = CompoundWrite::empty();
    for write in writes.iter().filter(|write| include(write)) {
        match &write.data {
            WriteData::Overwrite(snap) => {
                if tree_root.contains(&write.path) {
                    let relative = Path::relative(tree_root, &write.path);
                    compound = compound.add_write(&relative, snap.clone());
                } else if write.path.contains(tree_root) {
                    let relative = Path::relative(&write.path, tree_root);
                    compound = compound.add_write(&Path::empty(), snap.child(&relative));
                }
            }
            WriteData::Merge(children) => {
                if tree_root.contains(&write.path) {
                    let relative = Path::relative(tree_root, &write.path);
                    compound = compound.add_writes(&relative, &merge_to_compound(children));
                } else if write.path.contains(tree_root) {
                    let relative = Path::relative(&write.path, tree_root);
                    if relative.is_empty() {
                        compound = compound.add_writes(&Path::empty(), &merge_to_compound(children));
                    } else {
                        for (child_path, node) in children {
                            if child_path.contains(&relative) {
                                let deep = node.child(&Path::relative(child_path, &relative));
                                compound = compound.add_write(&Path::empty(), deep);
                            } else if relative.contains(child_path) {
                                let below = Path::relative(&relative, child_path);
                                compound = compound.add_write(&below, node.clone());
                            }
                        }
                    }
                }
            }
        }
    }
    compound
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

    fn merge(entries: &[(&str, Value)]) -> BTreeMap<Path, Node> {
        entries
            .iter()
            .map(|(key, value)| (path(key), node(value.clone())))
            .collect()
    }

    #[test]
    fn higher_write_id_wins_at_same_path() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(path("a"), node(json!("X")), 1, true);
        tree.add_overwrite(path("a"), node(json!("Y")), 2, true);
        let visible = tree.calc_complete_event_cache(&path("a"), Some(&Node::empty())).unwrap();
        assert_eq!(visible.val(), json!("Y"));
    }

    #[test]
    #[should_panic(expected = "older write")]
    fn rejects_out_of_order_write_ids() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(path("a"), Node::leaf(1.0), 5, true);
        tree.add_overwrite(path("a"), Node::leaf(1.0), 4, true);
    }

    #[test]
    fn removing_shadowed_write_needs_no_reevaluation() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(path("a/b"), Node::leaf(1.0), 1, true);
        tree.add_overwrite(path("a"), node(json!({ "b": 2 })), 2, true);
        assert!(!tree.remove_write(1));
        assert_eq!(
            tree.shadowing_write(&path("a/b")).unwrap().val(),
            json!(2)
        );
    }

    #[test]
    fn removing_overlapping_write_rebuilds_visible_set() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(path("a"), node(json!({ "x": 1 })), 1, true);
        tree.add_overwrite(path("a/y"), Node::leaf(2.0), 2, true);
        assert!(tree.remove_write(1));
        let visible = tree
            .calc_complete_event_cache(&path("a"), Some(&node(json!({ "x": 10 }))))
            .unwrap();
        assert_eq!(visible.val(), json!({ "x": 10, "y": 2 }));
    }

    #[test]
    fn invisible_writes_do_not_affect_visible_value() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(path("a"), Node::leaf(1.0), 1, false);
        assert!(tree.shadowing_write(&path("a")).is_none());
        assert!(!tree.remove_write(1));
    }

    #[test]
    fn merges_layer_over_server_cache() {
        let mut tree = WriteTree::new();
        tree.add_merge(path("a"), merge(&[("b", json!(1)), ("c/d", json!(2))]), 1);
        let server = node(json!({ "b": 0, "e": 3 }));
        let visible = tree.calc_complete_event_cache(&path("a"), Some(&server)).unwrap();
        assert_eq!(visible.val(), json!({ "b": 1, "c": { "d": 2 }, "e": 3 }));
        assert!(tree.calc_complete_event_cache(&path("a"), None).is_none());
        assert!(tree.remove_write(1));
        assert!(tree.shadowing_write(&path("a/b")).is_none());
    }

    #[test]
    fn complete_children_without_server_data() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(path("list/w"), Node::leaf(0.0), 1, true);
        let children = tree.calc_complete_event_children(&path("list"), None);
        assert_eq!(children.val(), json!({ "w": 0 }));
        let with_server =
            tree.calc_complete_event_children(&path("list"), Some(&node(json!({ "x": 1 }))));
        assert_eq!(with_server.val(), json!({ "w": 0, "x": 1 }));
    }

    #[test]
    fn layer_tree_projects_writes_from_above() {
        let writes = vec![
            WriteRecord {
                write_id: 1,
                path: path("a"),
                data: WriteData::Overwrite(node(json!({ "b": { "c": 1 } }))),
                visible: true,
            },
            WriteRecord {
                write_id: 2,
                path: path("a/b"),
                data: WriteData::Merge(merge(&[("d", json!(2))])),
                visible: true,
            },
        ];
        let layered = layer_tree(&writes, &path("a/b"), |write| write.visible);
        assert_eq!(
            layered.get_complete_node(&Path::empty()).unwrap().val(),
            json!({ "c": 1, "d": 2 })
        );
    }

    #[test]
    fn latest_state_sees_hidden_writes_minus_exclusions() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(path("counter"), Node::leaf(1.0), 1, false);
        tree.add_overwrite(path("other"), Node::leaf(5.0), 2, true);
        let server = node(json!({ "counter": 0 }));

        let visible = tree.calc_complete_event_cache(&Path::empty(), Some(&server)).unwrap();
        assert_eq!(visible.val(), json!({ "counter": 0, "other": 5 }));

        let latest = tree.calc_latest_state(&Path::empty(), Some(&server), &[]);
        assert_eq!(latest.val(), json!({ "counter": 1, "other": 5 }));
        let without = tree.calc_latest_state(&path("counter"), Some(&Node::leaf(0.0)), &[1]);
        assert_eq!(without.val(), json!(0));
    }
}
