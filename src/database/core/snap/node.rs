use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock};

use serde_json::{Map, Number, Value};

use crate::database::core::path::Path;
use crate::database::core::snap::{Index, NamedNode};
use crate::database::error::{invalid_argument, DatabaseResult};
use crate::util::{assert, sha1_base64, CONSTANTS};

/// Scalar payload of a leaf node.
#[derive(Clone, Debug, PartialEq)]
pub enum LeafValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl LeafValue {
    fn type_rank(&self) -> u8 {
        match self {
            LeafValue::Bool(_) => 0,
            LeafValue::Number(_) => 1,
            LeafValue::String(_) => 2,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            LeafValue::Bool(_) => "boolean",
            LeafValue::Number(_) => "number",
            LeafValue::String(_) => "string",
        }
    }

    fn compare(&self, other: &LeafValue) -> Ordering {
        match (self, other) {
            (LeafValue::Bool(a), LeafValue::Bool(b)) => a.cmp(b),
            (LeafValue::Number(a), LeafValue::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (LeafValue::String(a), LeafValue::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn hash_text(&self) -> String {
        let rendered = match self {
            LeafValue::Bool(flag) => flag.to_string(),
            LeafValue::Number(number) => double_to_ieee754_string(*number),
            LeafValue::String(text) => text.clone(),
        };
        format!("{}:{}", self.type_name(), rendered)
    }

    pub fn to_json(&self) -> Value {
        match self {
            LeafValue::Bool(flag) => Value::Bool(*flag),
            LeafValue::Number(number) => json_number(*number),
            LeafValue::String(text) => Value::String(text.clone()),
        }
    }
}

impl From<bool> for LeafValue {
    fn from(value: bool) -> Self {
        LeafValue::Bool(value)
    }
}

impl From<f64> for LeafValue {
    fn from(value: f64) -> Self {
        LeafValue::Number(value)
    }
}

impl From<i64> for LeafValue {
    fn from(value: i64) -> Self {
        LeafValue::Number(value as f64)
    }
}

impl From<&str> for LeafValue {
    fn from(value: &str) -> Self {
        LeafValue::String(value.to_string())
    }
}

impl From<String> for LeafValue {
    fn from(value: String) -> Self {
        LeafValue::String(value)
    }
}

fn double_to_ieee754_string(value: f64) -> String {
    format!("{:016x}", value.to_bits())
}

fn json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

enum NodeData {
    Leaf(LeafValue),
    Children(BTreeMap<String, Node>),
}

struct NodeInner {
    data: NodeData,
    priority: Option<Node>,
    hash: OnceLock<String>,
}

static EMPTY_NODE: LazyLock<Node> = LazyLock::new(|| Node::from_parts(NodeData::Children(BTreeMap::new()), None));

/// Immutable JSON tree node.
///
/// Every update returns a new node; untouched children are shared by
/// reference with the original, so cloning a node is a reference count bump.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    fn from_parts(data: NodeData, priority: Option<Node>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                data,
                priority: priority.filter(|priority| !priority.is_empty()),
                hash: OnceLock::new(),
            }),
        }
    }

    /// The shared "nothing here" node.
    pub fn empty() -> Node {
        EMPTY_NODE.clone()
    }

    pub fn leaf(value: impl Into<LeafValue>) -> Node {
        Self::from_parts(NodeData::Leaf(value.into()), None)
    }

    pub fn ptr_eq(a: &Node, b: &Node) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.inner.data, NodeData::Children(children) if children.is_empty())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.inner.data, NodeData::Leaf(_))
    }

    pub fn leaf_value(&self) -> Option<&LeafValue> {
        match &self.inner.data {
            NodeData::Leaf(value) => Some(value),
            NodeData::Children(_) => None,
        }
    }

    pub fn priority(&self) -> Node {
        self.inner.priority.clone().unwrap_or_else(Node::empty)
    }

    /// Empty nodes never carry a priority; the update is ignored for them.
    pub fn update_priority(&self, priority: Node) -> Node {
        assert(
            priority.is_empty() || priority.is_leaf(),
            "priority must be a leaf node",
        );
        match &self.inner.data {
            NodeData::Leaf(value) => Self::from_parts(NodeData::Leaf(value.clone()), Some(priority)),
            NodeData::Children(children) if children.is_empty() => self.clone(),
            NodeData::Children(children) => {
                Self::from_parts(NodeData::Children(children.clone()), Some(priority))
            }
        }
    }

    pub fn immediate_child(&self, key: &str) -> Node {
        if key == CONSTANTS.priority_key {
            return self.priority();
        }
        match &self.inner.data {
            NodeData::Leaf(_) => Node::empty(),
            NodeData::Children(children) => children.get(key).cloned().unwrap_or_else(Node::empty),
        }
    }

    pub fn child(&self, path: &Path) -> Node {
        let mut current = self.clone();
        for segment in path.segments() {
            current = current.immediate_child(segment);
            if current.is_empty() {
                break;
            }
        }
        current
    }

    pub fn has_child(&self, key: &str) -> bool {
        !self.immediate_child(key).is_empty()
    }

    pub fn num_children(&self) -> usize {
        match &self.inner.data {
            NodeData::Leaf(_) => 0,
            NodeData::Children(children) => children.len(),
        }
    }

    /// Children in plain string key order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        let children = match &self.inner.data {
            NodeData::Children(children) => Some(children.iter()),
            NodeData::Leaf(_) => None,
        };
        children
            .into_iter()
            .flatten()
            .map(|(key, node)| (key.as_str(), node))
    }

    pub fn update_immediate_child(&self, key: &str, child: Node) -> Node {
        if key == CONSTANTS.priority_key {
            return self.update_priority(child);
        }
        match &self.inner.data {
            NodeData::Leaf(_) => {
                if child.is_empty() {
                    self.clone()
                } else {
                    Node::empty()
                        .update_immediate_child(key, child)
                        .update_priority(self.priority())
                }
            }
            NodeData::Children(children) => {
                let existing = children.get(key);
                match existing {
                    Some(current) if Node::ptr_eq(current, &child) => return self.clone(),
                    None if child.is_empty() => return self.clone(),
                    _ => {}
                }
                let mut updated = children.clone();
                if child.is_empty() {
                    updated.remove(key);
                } else {
                    updated.insert(key.to_string(), child);
                }
                if updated.is_empty() {
                    Node::empty()
                } else {
                    Self::from_parts(NodeData::Children(updated), self.inner.priority.clone())
                }
            }
        }
    }

    /// Replaces the node at `path`. Writing the empty node deletes the key and
    /// collapses parents that become empty.
    pub fn update_child(&self, path: &Path, child: Node) -> Node {
        let Some(front) = path.front() else {
            return child;
        };
        assert(
            front != CONSTANTS.priority_key || path.len() == 1,
            ".priority must be the last token in a path",
        );
        if self.is_leaf() && child.is_empty() && front != CONSTANTS.priority_key {
            return self.clone();
        }
        let current = self.immediate_child(front);
        let replaced = current.update_child(&path.pop_front(), child);
        if Node::ptr_eq(&current, &replaced) {
            return self.clone();
        }
        self.update_immediate_child(front, replaced)
    }

    /// Children sorted by `index`.
    pub fn ordered_children(&self, index: &Index) -> Vec<NamedNode> {
        let mut named: Vec<NamedNode> = self
            .children()
            .map(|(key, node)| NamedNode::new(key, node.clone()))
            .collect();
        named.sort_by(|a, b| index.compare(a, b));
        named
    }

    /// Name of the sibling preceding `key` under `index`, if any.
    pub fn predecessor_child_name(&self, key: &str, index: &Index) -> Option<String> {
        let ordered = self.ordered_children(index);
        let position = ordered.iter().position(|named| named.name == key)?;
        position
            .checked_sub(1)
            .map(|previous| ordered[previous].name.clone())
    }

    /// Canonical content hash shared with the server; the empty node hashes to "".
    pub fn hash(&self) -> &str {
        self.inner.hash.get_or_init(|| self.compute_hash())
    }

    fn compute_hash(&self) -> String {
        let mut to_hash = String::new();
        if let Some(priority) = &self.inner.priority {
            if let Some(value) = priority.leaf_value() {
                to_hash.push_str("priority:");
                to_hash.push_str(&value.hash_text());
                to_hash.push(':');
            }
        }
        match &self.inner.data {
            NodeData::Leaf(value) => {
                to_hash.push_str(&value.hash_text());
                sha1_base64(to_hash)
            }
            NodeData::Children(_) => {
                for named in self.ordered_children(&Index::Priority) {
                    let child_hash = named.node.hash();
                    if !child_hash.is_empty() {
                        to_hash.push(':');
                        to_hash.push_str(&named.name);
                        to_hash.push(':');
                        to_hash.push_str(child_hash);
                    }
                }
                if to_hash.is_empty() {
                    String::new()
                } else {
                    sha1_base64(to_hash)
                }
            }
        }
    }

    /// Value ordering: empty < boolean < number < string < node with children.
    pub fn compare_to(&self, other: &Node) -> Ordering {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        match (&self.inner.data, &other.inner.data) {
            (NodeData::Leaf(a), NodeData::Leaf(b)) => a.compare(b),
            (NodeData::Leaf(_), NodeData::Children(_)) => Ordering::Less,
            (NodeData::Children(_), NodeData::Leaf(_)) => Ordering::Greater,
            (NodeData::Children(_), NodeData::Children(_)) => Ordering::Equal,
        }
    }

    /// Plain JSON value. Objects whose keys are all small integers come back as arrays.
    pub fn val(&self) -> Value {
        self.to_json(false)
    }

    /// JSON value including `.priority` / `.value` wrappers.
    pub fn export_val(&self) -> Value {
        self.to_json(true)
    }

    fn to_json(&self, export: bool) -> Value {
        match &self.inner.data {
            NodeData::Leaf(value) => {
                let plain = value.to_json();
                match (&self.inner.priority, export) {
                    (Some(priority), true) => {
                        let mut map = Map::with_capacity(2);
                        map.insert(".value".to_string(), plain);
                        map.insert(".priority".to_string(), priority.val());
                        Value::Object(map)
                    }
                    _ => plain,
                }
            }
            NodeData::Children(children) if children.is_empty() => Value::Null,
            NodeData::Children(children) => {
                let mut max_key = 0usize;
                let mut all_integer_keys = true;
                for key in children.keys() {
                    match array_index(key) {
                        Some(index) if all_integer_keys => max_key = max_key.max(index),
                        _ => all_integer_keys = false,
                    }
                }
                if !export && all_integer_keys && max_key < 2 * children.len() {
                    let mut array = vec![Value::Null; max_key + 1];
                    for (key, child) in children {
                        if let Some(index) = array_index(key) {
                            array[index] = child.to_json(export);
                        }
                    }
                    return Value::Array(array);
                }
                let mut map = Map::with_capacity(children.len() + 1);
                for (key, child) in children {
                    map.insert(key.clone(), child.to_json(export));
                }
                if export {
                    if let Some(priority) = &self.inner.priority {
                        map.insert(".priority".to_string(), priority.val());
                    }
                }
                Value::Object(map)
            }
        }
    }

    /// Builds a node from user supplied JSON, validating keys and priorities.
    ///
    /// Accepts `.value` / `.priority` wrappers; arrays become index keyed
    /// children; `null` children are dropped.
    pub fn from_json(value: &Value) -> DatabaseResult<Node> {
        match value {
            Value::Null => Ok(Node::empty()),
            Value::Bool(flag) => Ok(Node::leaf(*flag)),
            Value::Number(number) => number
                .as_f64()
                .filter(|number| number.is_finite())
                .map(Node::leaf)
                .ok_or_else(|| invalid_argument(format!("Unsupported number {number}"))),
            Value::String(text) => Ok(Node::leaf(text.as_str())),
            Value::Array(items) => {
                let mut children = BTreeMap::new();
                for (index, item) in items.iter().enumerate() {
                    let child = Node::from_json(item)?;
                    if !child.is_empty() {
                        children.insert(index.to_string(), child);
                    }
                }
                Ok(Self::children_node(children, None))
            }
            Value::Object(map) => {
                if map.contains_key(".sv") {
                    return Err(invalid_argument(
                        "Server value placeholders must be resolved before building a snapshot",
                    ));
                }
                let priority = match map.get(".priority") {
                    Some(priority) => Some(Node::priority_from_json(priority)?),
                    None => None,
                };
                if let Some(inner) = map.get(".value") {
                    if map.keys().any(|key| key != ".value" && key != ".priority") {
                        return Err(invalid_argument(
                            "An object containing .value cannot have other children",
                        ));
                    }
                    let node = Node::from_json(inner)?;
                    return Ok(match priority {
                        Some(priority) => node.update_priority(priority),
                        None => node,
                    });
                }
                let mut children = BTreeMap::new();
                for (key, child) in map {
                    if key == ".priority" {
                        continue;
                    }
                    validate_key(key)?;
                    let child = Node::from_json(child)?;
                    if !child.is_empty() {
                        children.insert(key.clone(), child);
                    }
                }
                Ok(Self::children_node(children, priority))
            }
        }
    }

    /// Priorities may only be strings, numbers or null.
    pub fn priority_from_json(value: &Value) -> DatabaseResult<Node> {
        match value {
            Value::Null => Ok(Node::empty()),
            Value::String(text) => Ok(Node::leaf(text.as_str())),
            Value::Number(number) => number
                .as_f64()
                .map(Node::leaf)
                .ok_or_else(|| invalid_argument("Priority must be a finite number")),
            _ => Err(invalid_argument("Priority must be a string, number, or null")),
        }
    }

    fn children_node(children: BTreeMap<String, Node>, priority: Option<Node>) -> Node {
        if children.is_empty() {
            Node::empty()
        } else {
            Self::from_parts(NodeData::Children(children), priority)
        }
    }
}

fn array_index(key: &str) -> Option<usize> {
    if key == "0" || (!key.starts_with('0') && key.bytes().all(|byte| byte.is_ascii_digit())) {
        key.parse().ok()
    } else {
        None
    }
}

fn validate_key(key: &str) -> DatabaseResult<()> {
    let invalid = key.is_empty()
        || key
            .chars()
            .any(|ch| matches!(ch, '.' | '#' | '$' | '[' | ']' | '/') || ch.is_ascii_control());
    if invalid {
        return Err(invalid_argument(format!(
            "Key '{key}' must be non-empty and cannot contain '.', '#', '$', '[', ']', '/' or control characters"
        )));
    }
    Ok(())
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        if Node::ptr_eq(self, other) {
            return true;
        }
        if self.inner.priority != other.inner.priority {
            return false;
        }
        match (&self.inner.data, &other.inner.data) {
            (NodeData::Leaf(a), NodeData::Leaf(b)) => a == b,
            (NodeData::Children(a), NodeData::Children(b)) => a == b,
            _ => false,
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::empty()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.export_val())
    }
}
