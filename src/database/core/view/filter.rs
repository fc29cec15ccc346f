use std::cmp::Ordering;

use crate::database::core::snap::{NamedNode, Node};
use crate::database::core::view::query_params::{QueryLimit, QueryParams};

/// Narrows a node to the children selected by a query's range and limit.
#[derive(Clone, Debug)]
pub struct NodeFilter {
    params: QueryParams,
    start: Option<(String, Node)>,
    end: Option<(String, Node)>,
}

impl NodeFilter {
    pub fn new(params: &QueryParams) -> Self {
        Self {
            params: params.clone(),
            start: params.start_post(),
            end: params.end_post(),
        }
    }

    pub fn filters_nodes(&self) -> bool {
        !self.params.loads_all_data()
    }

    /// Whether `child` lies inside the query range, ignoring the limit.
    pub fn matches(&self, child: &NamedNode) -> bool {
        let index = &self.params.index;
        let indexed = index.indexed_value(&child.node);
        let start_ok = match (&self.start, &self.params.start) {
            (Some((name, value)), Some(bound)) => {
                let order = index.compare_posts(name, value, &child.name, &indexed);
                if bound.inclusive {
                    order != Ordering::Greater
                } else {
                    order == Ordering::Less
                }
            }
            _ => true,
        };
        let end_ok = match (&self.end, &self.params.end) {
            (Some((name, value)), Some(bound)) => {
                let order = index.compare_posts(&child.name, &indexed, name, value);
                if bound.inclusive {
                    order != Ordering::Greater
                } else {
                    order == Ordering::Less
                }
            }
            _ => true,
        };
        start_ok && end_ok
    }

    /// The part of `node` visible through the query.
    pub fn apply(&self, node: &Node) -> Node {
        if !self.filters_nodes() {
            return node.clone();
        }
        if node.is_leaf() {
            return Node::empty();
        }
        let in_range: Vec<NamedNode> = node
            .ordered_children(&self.params.index)
            .into_iter()
            .filter(|child| self.matches(child))
            .collect();
        let kept: &[NamedNode] = match self.params.limit {
            None => &in_range,
            Some(QueryLimit::First(count)) => &in_range[..in_range.len().min(count as usize)],
            Some(QueryLimit::Last(count)) => {
                &in_range[in_range.len().saturating_sub(count as usize)..]
            }
        };
        let mut filtered = node.clone();
        for (key, _) in node.children() {
            if !kept.iter().any(|child| child.name == key) {
                filtered = filtered.update_immediate_child(key, Node::empty());
            }
        }
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::path::Path;
    use crate::database::core::snap::Index;
    use serde_json::{json, Value};

    fn node(value: Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn scores() -> Node {
        node(json!({
            "alice": { "score": 10 },
            "bob": { "score": 30 },
            "carol": { "score": 20 },
            "dave": { "score": 20 }
        }))
    }

    fn by_score() -> QueryParams {
        let mut params = QueryParams::default();
        params.set_index(Index::Child(Path::parse("score").unwrap())).unwrap();
        params
    }

    fn keys(node: &Node, index: &Index) -> Vec<String> {
        node.ordered_children(index).into_iter().map(|child| child.name).collect()
    }

    #[test]
    fn limit_to_first_keeps_lowest_entries() {
        let mut params = by_score();
        params.set_limit(QueryLimit::First(2)).unwrap();
        let filtered = NodeFilter::new(&params).apply(&scores());
        assert_eq!(keys(&filtered, &params.index), vec!["alice", "carol"]);
    }

    #[test]
    fn limit_to_last_keeps_highest_entries() {
        let mut params = by_score();
        params.set_limit(QueryLimit::Last(2)).unwrap();
        let filtered = NodeFilter::new(&params).apply(&scores());
        assert_eq!(keys(&filtered, &params.index), vec!["dave", "bob"]);
    }

    #[test]
    fn start_at_with_key_breaks_ties() {
        let mut params = by_score();
        params
            .set_start(Node::leaf(20.0), Some("dave".into()), true)
            .unwrap();
        let filtered = NodeFilter::new(&params).apply(&scores());
        assert_eq!(keys(&filtered, &params.index), vec!["dave", "bob"]);
    }

    #[test]
    fn exclusive_bounds() {
        let mut params = by_score();
        params.set_start(Node::leaf(10.0), None, false).unwrap();
        params.set_end(Node::leaf(30.0), None, false).unwrap();
        let filtered = NodeFilter::new(&params).apply(&scores());
        assert_eq!(keys(&filtered, &params.index), vec!["carol", "dave"]);
    }

    #[test]
    fn key_range() {
        let mut params = QueryParams::default();
        params.set_index(Index::Key).unwrap();
        params.set_start(Node::leaf("b"), None, true).unwrap();
        params.set_end(Node::leaf("d"), None, true).unwrap();
        let filtered = NodeFilter::new(&params).apply(&scores());
        assert_eq!(keys(&filtered, &Index::Key), vec!["bob", "carol"]);
    }

    fn ranked() -> Node {
        node(json!({
            "a": { ".value": 3, ".priority": 30 },
            "b": { ".value": 1, ".priority": 10 },
            "c": { ".value": 2, ".priority": 20 }
        }))
    }

    fn window(index: Index, configure: impl FnOnce(&mut QueryParams)) -> Vec<String> {
        let mut params = QueryParams::default();
        if !index.is_default() {
            params.set_index(index.clone()).unwrap();
        }
        configure(&mut params);
        keys(&NodeFilter::new(&params).apply(&ranked()), &index)
    }

    #[test]
    fn limit_without_range_applies_to_every_index() {
        let first_two = |params: &mut QueryParams| params.set_limit(QueryLimit::First(2)).unwrap();
        assert_eq!(window(Index::Priority, first_two), vec!["b", "c"]);
        assert_eq!(window(Index::Value, first_two), vec!["b", "c"]);
        assert_eq!(window(Index::Key, first_two), vec!["a", "b"]);

        let last_one = |params: &mut QueryParams| params.set_limit(QueryLimit::Last(1)).unwrap();
        assert_eq!(window(Index::Priority, last_one), vec!["a"]);
        assert_eq!(window(Index::Value, last_one), vec!["a"]);
        assert_eq!(window(Index::Key, last_one), vec!["c"]);

        let mut params = by_score();
        params.set_limit(QueryLimit::First(1)).unwrap();
        assert_eq!(keys(&NodeFilter::new(&params).apply(&scores()), &params.index), vec!["alice"]);
    }

    #[test]
    fn start_without_end_is_open_above() {
        assert_eq!(
            window(Index::Priority, |params| params.set_start(Node::leaf(20.0), None, true).unwrap()),
            vec!["c", "a"]
        );
        assert_eq!(
            window(Index::Value, |params| params.set_start(Node::leaf(2.0), None, true).unwrap()),
            vec!["c", "a"]
        );
        assert_eq!(
            window(Index::Key, |params| params.set_start(Node::leaf("b"), None, true).unwrap()),
            vec!["b", "c"]
        );

        let mut params = by_score();
        params.set_start(Node::leaf(20.0), None, true).unwrap();
        assert_eq!(
            keys(&NodeFilter::new(&params).apply(&scores()), &params.index),
            vec!["carol", "dave", "bob"]
        );
    }

    #[test]
    fn end_without_start_is_open_below() {
        assert_eq!(
            window(Index::Value, |params| params.set_end(Node::leaf(2.0), None, true).unwrap()),
            vec!["b", "c"]
        );
        let mut params = by_score();
        params.set_end(Node::leaf(20.0), None, false).unwrap();
        assert_eq!(keys(&NodeFilter::new(&params).apply(&scores()), &params.index), vec!["alice"]);
    }

    #[test]
    fn unfiltered_params_pass_through() {
        let original = scores();
        let filtered = NodeFilter::new(&QueryParams::default()).apply(&original);
        assert!(Node::ptr_eq(&original, &filtered));
    }
}
