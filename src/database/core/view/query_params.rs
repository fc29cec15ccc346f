use std::fmt;

use serde_json::{Map, Value};

use crate::database::core::path::Path;
use crate::database::core::snap::{Index, LeafValue, Node, MAX_NAME, MIN_NAME};
use crate::database::error::{invalid_argument, DatabaseResult};

/// One end of a query range.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryBound {
    /// Indexed value (a leaf or the empty node).
    pub value: Node,
    /// Key used to break ties between children with equal indexed values.
    pub name: Option<String>,
    pub inclusive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryLimit {
    First(u32),
    Last(u32),
}

impl QueryLimit {
    pub fn count(&self) -> u32 {
        match self {
            QueryLimit::First(count) | QueryLimit::Last(count) => *count,
        }
    }
}

/// Ordering, range and limit applied to a location.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryParams {
    pub index: Index,
    pub start: Option<QueryBound>,
    pub end: Option<QueryBound>,
    pub limit: Option<QueryLimit>,
    order_by_called: bool,
}

impl QueryParams {
    pub fn set_index(&mut self, index: Index) -> DatabaseResult<()> {
        if self.order_by_called {
            return Err(invalid_argument("orderBy has already been specified"));
        }
        self.index = index;
        self.order_by_called = true;
        Ok(())
    }

    /// `startAt` when `inclusive`, `startAfter` otherwise.
    pub fn set_start(&mut self, value: Node, name: Option<String>, inclusive: bool) -> DatabaseResult<()> {
        if self.start.is_some() {
            return Err(invalid_argument(
                "startAt/startAfter/equalTo has already been specified",
            ));
        }
        let name = if name.is_none() && !inclusive && self.index != Index::Key {
            Some(MAX_NAME.to_string())
        } else {
            name
        };
        self.start = Some(QueryBound {
            value,
            name,
            inclusive,
        });
        Ok(())
    }

    /// `endAt` when `inclusive`, `endBefore` otherwise.
    pub fn set_end(&mut self, value: Node, name: Option<String>, inclusive: bool) -> DatabaseResult<()> {
        if self.end.is_some() {
            return Err(invalid_argument(
                "endAt/endBefore/equalTo has already been specified",
            ));
        }
        let name = if name.is_none() && !inclusive && self.index != Index::Key {
            Some(MIN_NAME.to_string())
        } else {
            name
        };
        self.end = Some(QueryBound {
            value,
            name,
            inclusive,
        });
        Ok(())
    }

    pub fn set_limit(&mut self, limit: QueryLimit) -> DatabaseResult<()> {
        if self.limit.is_some() {
            return Err(invalid_argument("limit has already been specified"));
        }
        if limit.count() == 0 {
            return Err(invalid_argument("limit must be a positive integer"));
        }
        self.limit = Some(limit);
        Ok(())
    }

    /// True when the query returns every child of its location.
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.index.is_default()
    }

    /// Lower bound as a `(name, indexed value)` position; `None` when unbounded.
    pub fn start_post(&self) -> Option<(String, Node)> {
        self.start
            .as_ref()
            .map(|bound| self.post_for(bound, MIN_NAME))
    }

    /// Upper bound as a `(name, indexed value)` position; `None` when unbounded.
    pub fn end_post(&self) -> Option<(String, Node)> {
        self.end.as_ref().map(|bound| self.post_for(bound, MAX_NAME))
    }

    fn post_for(&self, bound: &QueryBound, default_name: &str) -> (String, Node) {
        if self.index == Index::Key {
            let key = match bound.value.leaf_value() {
                Some(LeafValue::String(key)) => key.clone(),
                _ => default_name.to_string(),
            };
            return (key, Node::empty());
        }
        let name = bound
            .name
            .clone()
            .unwrap_or_else(|| default_name.to_string());
        (name, bound.value.clone())
    }

    /// The query object sent with a listen; it also identifies the query.
    pub fn to_query_object(&self) -> Value {
        let mut object = Map::new();
        if let Some(start) = &self.start {
            object.insert("sp".into(), start.value.val());
            if let Some(name) = &start.name {
                object.insert("sn".into(), Value::String(name.clone()));
            }
            object.insert("sin".into(), Value::Bool(start.inclusive));
        }
        if let Some(end) = &self.end {
            object.insert("ep".into(), end.value.val());
            if let Some(name) = &end.name {
                object.insert("en".into(), Value::String(name.clone()));
            }
            object.insert("ein".into(), Value::Bool(end.inclusive));
        }
        if let Some(limit) = &self.limit {
            object.insert("l".into(), Value::from(limit.count()));
            let view_from = match limit {
                QueryLimit::First(_) => "l",
                QueryLimit::Last(_) => "r",
            };
            object.insert("vf".into(), Value::String(view_from.into()));
        }
        if !self.index.is_default() {
            object.insert("i".into(), Value::String(self.index.to_string()));
        }
        Value::Object(object)
    }

    /// Stable identifier: `"default"` for the plain location, otherwise the
    /// serialized query object (keys sorted).
    pub fn identifier(&self) -> String {
        match self.to_query_object() {
            Value::Object(map) if map.is_empty() => "default".to_string(),
            object => object.to_string(),
        }
    }
}

/// A location plus the parameters applied to it.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    pub path: Path,
    pub params: QueryParams,
}

impl QuerySpec {
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    pub fn default_at(path: Path) -> Self {
        Self::new(path, QueryParams::default())
    }

    pub fn query_id(&self) -> String {
        self.params.identifier()
    }

    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }

    /// The query actually listened for on the server; queries that load all
    /// data share the plain listen at their location.
    pub fn for_listening(&self) -> QuerySpec {
        if self.loads_all_data() && !self.params.is_default() {
            QuerySpec::default_at(self.path.clone())
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.query_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_params_identify_as_default() {
        let params = QueryParams::default();
        assert!(params.is_default());
        assert_eq!(params.identifier(), "default");
    }

    #[test]
    fn query_object_uses_wire_keys() {
        let mut params = QueryParams::default();
        params.set_index(Index::Child(Path::parse("age").unwrap())).unwrap();
        params.set_start(Node::leaf(18.0), None, true).unwrap();
        params.set_limit(QueryLimit::Last(5)).unwrap();
        assert_eq!(
            params.to_query_object(),
            json!({ "sp": 18, "sin": true, "l": 5, "vf": "r", "i": "age" })
        );
        assert!(!params.loads_all_data());
    }

    #[test]
    fn start_after_without_key_excludes_equal_values() {
        let mut params = QueryParams::default();
        params.set_index(Index::Value).unwrap();
        params.set_start(Node::leaf(3.0), None, false).unwrap();
        assert_eq!(params.start_post().unwrap().0, MAX_NAME);
        assert_eq!(params.to_query_object()["sn"], json!(MAX_NAME));
    }

    #[test]
    fn key_index_posts_use_the_key() {
        let mut params = QueryParams::default();
        params.set_index(Index::Key).unwrap();
        params.set_start(Node::leaf("b"), None, true).unwrap();
        assert_eq!(params.start_post(), Some(("b".to_string(), Node::empty())));
        assert_eq!(params.end_post(), None);
    }

    #[test]
    fn constraints_cannot_repeat() {
        let mut params = QueryParams::default();
        params.set_limit(QueryLimit::First(1)).unwrap();
        assert!(params.set_limit(QueryLimit::Last(1)).is_err());
        params.set_index(Index::Key).unwrap();
        assert!(params.set_index(Index::Value).is_err());
        assert!(QueryParams::default().set_limit(QueryLimit::First(0)).is_err());
    }

    #[test]
    fn ordered_queries_listen_with_default_params() {
        let mut params = QueryParams::default();
        params.set_index(Index::Value).unwrap();
        let spec = QuerySpec::new(Path::parse("a").unwrap(), params);
        assert_eq!(spec.query_id(), r#"{"i":".value"}"#);
        assert_eq!(spec.for_listening().query_id(), "default");
    }
}
