use std::collections::BTreeMap;
use std::sync::Arc;

use crate::database::core::path::Path;
use crate::database::core::snap::Node;

/// Persistent tree keyed by path segments with an optional value at every node.
///
/// Setting a value at a path discards everything that used to live below it;
/// a value therefore shadows its whole subtree.
#[derive(Clone, Debug)]
pub struct ImmutableTree<V> {
    value: Option<V>,
    children: BTreeMap<String, Arc<ImmutableTree<V>>>,
}

impl<V> Default for ImmutableTree<V> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }
}

impl<V: Clone> ImmutableTree<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: V) -> Self {
        Self {
            value: Some(value),
            children: BTreeMap::new(),
        }
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &ImmutableTree<V>)> {
        self.children
            .iter()
            .map(|(key, child)| (key.as_str(), child.as_ref()))
    }

    pub fn child(&self, key: &str) -> Option<&ImmutableTree<V>> {
        self.children.get(key).map(Arc::as_ref)
    }

    /// Value stored exactly at `path`.
    pub fn get(&self, path: &Path) -> Option<&V> {
        match path.front() {
            None => self.value.as_ref(),
            Some(front) => self.child(front)?.get(&path.pop_front()),
        }
    }

    /// Subtree rooted at `path`; empty when nothing lives there.
    pub fn subtree(&self, path: &Path) -> ImmutableTree<V> {
        match path.front() {
            None => self.clone(),
            Some(front) => match self.child(front) {
                Some(child) => child.subtree(&path.pop_front()),
                None => ImmutableTree::new(),
            },
        }
    }

    pub fn set(&self, path: &Path, value: V) -> ImmutableTree<V> {
        self.set_tree(path, ImmutableTree::with_value(value))
    }

    /// Replaces the subtree at `path`, pruning children that end up empty.
    pub fn set_tree(&self, path: &Path, tree: ImmutableTree<V>) -> ImmutableTree<V> {
        let Some(front) = path.front() else {
            return tree;
        };
        let current = self
            .child(front)
            .cloned()
            .unwrap_or_default();
        let replaced = current.set_tree(&path.pop_front(), tree);
        let mut children = self.children.clone();
        if replaced.is_empty() {
            children.remove(front);
        } else {
            children.insert(front.to_string(), Arc::new(replaced));
        }
        ImmutableTree {
            value: self.value.clone(),
            children,
        }
    }

    /// Removes the value at `path` (the subtree below it stays).
    pub fn remove(&self, path: &Path) -> ImmutableTree<V> {
        match path.front() {
            None => ImmutableTree {
                value: None,
                children: self.children.clone(),
            },
            Some(front) => {
                let Some(child) = self.child(front) else {
                    return self.clone();
                };
                let removed = child.remove(&path.pop_front());
                let mut children = self.children.clone();
                if removed.is_empty() {
                    children.remove(front);
                } else {
                    children.insert(front.to_string(), Arc::new(removed));
                }
                ImmutableTree {
                    value: self.value.clone(),
                    children,
                }
            }
        }
    }

    /// The value nearest the root along `path`, with its path relative to the root.
    pub fn find_rootmost_value_and_path(&self, path: &Path) -> Option<(Path, &V)> {
        self.find_rootmost_matching(path, |_| true)
    }

    pub fn find_rootmost_matching(
        &self,
        path: &Path,
        predicate: impl Fn(&V) -> bool,
    ) -> Option<(Path, &V)> {
        let mut node = self;
        let mut walked = Vec::new();
        let mut remaining = path.clone();
        loop {
            if let Some(value) = node.value.as_ref().filter(|value| predicate(*value)) {
                return Some((Path::from_trusted(walked), value));
            }
            let front = remaining.front()?.to_string();
            node = node.child(&front)?;
            walked.push(front);
            remaining = remaining.pop_front();
        }
    }

    /// The deepest value along `path`.
    pub fn leafmost_value(&self, path: &Path) -> Option<&V> {
        let mut node = self;
        let mut found = node.value.as_ref();
        for segment in path.segments() {
            match node.child(segment) {
                Some(child) => {
                    node = child;
                    if node.value.is_some() {
                        found = node.value.as_ref();
                    }
                }
                None => break,
            }
        }
        found
    }

    /// Calls `f` for every value along `path`, root first, until it returns false.
    pub fn foreach_on_path(&self, path: &Path, mut f: impl FnMut(&Path, &V) -> bool) {
        let mut node = self;
        let mut walked = Vec::new();
        let mut remaining = path.clone();
        loop {
            if let Some(value) = &node.value {
                if !f(&Path::from_trusted(walked.clone()), value) {
                    return;
                }
            }
            let Some(front) = remaining.front().map(str::to_string) else {
                return;
            };
            match node.child(&front) {
                Some(child) => node = child,
                None => return,
            }
            walked.push(front);
            remaining = remaining.pop_front();
        }
    }

    /// Visits every value, descendants before their ancestors.
    pub fn foreach(&self, mut f: impl FnMut(&Path, &V)) {
        self.foreach_inner(&Path::empty(), &mut f);
    }

    fn foreach_inner(&self, prefix: &Path, f: &mut impl FnMut(&Path, &V)) {
        for (key, child) in &self.children {
            child.foreach_inner(&prefix.child(key), f);
        }
        if let Some(value) = &self.value {
            f(prefix, value);
        }
    }

    /// Visits the values stored directly on immediate children.
    pub fn foreach_child(&self, mut f: impl FnMut(&str, &V)) {
        for (key, child) in &self.children {
            if let Some(value) = &child.value {
                f(key, value);
            }
        }
    }

    /// Bottom-up fold: `f(path, value, folded children)`.
    pub fn fold<A>(&self, f: &mut impl FnMut(&Path, Option<&V>, BTreeMap<String, A>) -> A) -> A {
        self.fold_inner(&Path::empty(), f)
    }

    fn fold_inner<A>(
        &self,
        prefix: &Path,
        f: &mut impl FnMut(&Path, Option<&V>, BTreeMap<String, A>) -> A,
    ) -> A {
        let mut folded = BTreeMap::new();
        for (key, child) in &self.children {
            let result = child.fold_inner(&prefix.child(key), f);
            folded.insert(key.clone(), result);
        }
        f(prefix, self.value.as_ref(), folded)
    }
}

impl ImmutableTree<Node> {
    /// Builds a tree holding `node` at every given relative path.
    pub fn from_children<'a>(entries: impl IntoIterator<Item = (&'a Path, &'a Node)>) -> Self {
        entries
            .into_iter()
            .fold(ImmutableTree::new(), |tree, (path, node)| {
                tree.set(path, node.clone())
            })
    }

    /// Subtree at `path` where a value stored above `path` is projected down
    /// to the matching child node.
    pub fn resolved_subtree(&self, path: &Path) -> ImmutableTree<Node> {
        match self.find_rootmost_value_and_path(path) {
            Some((found_at, node)) => {
                let relative = Path::relative(&found_at, path);
                ImmutableTree::with_value(node.child(&relative))
            }
            None => self.subtree(path),
        }
    }

    pub fn resolved_child(&self, key: &str) -> ImmutableTree<Node> {
        if let Some(node) = &self.value {
            return ImmutableTree::with_value(node.immediate_child(key));
        }
        self.child(key).cloned().unwrap_or_default()
    }
}
