use std::cmp::Ordering;
use std::fmt;

use crate::database::core::path::Path;
use crate::database::core::snap::Node;

/// Sentinel names sorting before / after every real key.
pub const MIN_NAME: &str = "[MIN_NAME]";
pub const MAX_NAME: &str = "[MAX_NAME]";

/// A child key paired with the node stored under it.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedNode {
    pub name: String,
    pub node: Node,
}

impl NamedNode {
    pub fn new(name: impl Into<String>, node: Node) -> Self {
        Self {
            name: name.into(),
            node,
        }
    }
}

/// Orders keys the way the server does: 32-bit integer keys first (numerically,
/// shorter spelling first on ties), then all other keys lexicographically.
pub fn name_compare(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if a == MIN_NAME || b == MAX_NAME {
        return Ordering::Less;
    }
    if b == MIN_NAME || a == MAX_NAME {
        return Ordering::Greater;
    }
    match (try_parse_int(a), try_parse_int(b)) {
        (Some(left), Some(right)) => left.cmp(&right).then(a.len().cmp(&b.len())),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn try_parse_int(key: &str) -> Option<i32> {
    let digits = key.strip_prefix('-').unwrap_or(key);
    let canonical = !digits.is_empty()
        && digits.bytes().all(|byte| byte.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
        && key != "-0";
    if !canonical {
        return None;
    }
    key.parse::<i32>().ok()
}

/// Ordering applied to the children of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Index {
    #[default]
    Priority,
    Key,
    Value,
    Child(Path),
}

impl Index {
    /// The part of a child that this index sorts on.
    pub fn indexed_value(&self, node: &Node) -> Node {
        match self {
            Index::Priority => node.priority(),
            Index::Key => Node::empty(),
            Index::Value => node.clone(),
            Index::Child(path) => node.child(path),
        }
    }

    pub fn compare(&self, a: &NamedNode, b: &NamedNode) -> Ordering {
        self.compare_posts(
            &a.name,
            &self.indexed_value(&a.node),
            &b.name,
            &self.indexed_value(&b.node),
        )
    }

    /// Compares two `(name, indexed value)` positions.
    pub fn compare_posts(
        &self,
        a_name: &str,
        a_value: &Node,
        b_name: &str,
        b_value: &Node,
    ) -> Ordering {
        match self {
            Index::Key => name_compare(a_name, b_name),
            _ => a_value
                .compare_to(b_value)
                .then_with(|| name_compare(a_name, b_name)),
        }
    }

    pub fn indexed_value_changed(&self, old: &Node, new: &Node) -> bool {
        match self {
            Index::Key => false,
            _ => self.indexed_value(old) != self.indexed_value(new),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Index::Priority)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Priority => f.write_str(".priority"),
            Index::Key => f.write_str(".key"),
            Index::Value => f.write_str(".value"),
            Index::Child(path) => {
                let joined = path.segments().join("/");
                f.write_str(&joined)
            }
        }
    }
}
