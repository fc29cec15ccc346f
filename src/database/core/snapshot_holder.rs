use crate::database::core::path::Path;
use crate::database::core::snap::Node;

/// The one mutable cell holding the best known server root.
///
/// Everything else computes a new `Node` and swaps it in here.
#[derive(Clone, Debug, Default)]
pub struct SnapshotHolder {
    root: Node,
}

impl SnapshotHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn get_node(&self, path: &Path) -> Node {
        self.root.child(path)
    }

    pub fn update_snapshot(&mut self, path: &Path, node: Node) {
        self.root = self.root.update_child(path, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn applying_same_overwrite_twice_is_idempotent() {
        let mut holder = SnapshotHolder::new();
        let path = Path::parse("a/b").unwrap();
        let value = Node::from_json(&json!({ "c": 1 })).unwrap();
        holder.update_snapshot(&path, value.clone());
        let once = holder.root().clone();
        holder.update_snapshot(&path, value);
        assert!(Node::ptr_eq(&once, holder.root()));
        assert_eq!(holder.get_node(&Path::parse("a/b/c").unwrap()).val(), json!(1));
    }
}
