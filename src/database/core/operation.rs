use crate::database::core::path::Path;
use crate::database::core::snap::Node;
use crate::database::core::util::ImmutableTree;
use crate::util::assert;

/// Where an operation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationSource {
    /// A local write made through this client.
    User,
    /// Data pushed by the server for an unfiltered listen.
    Server,
    /// Data pushed by the server for the filtered query registered under this tag.
    TaggedQuery(u64),
}

impl OperationSource {
    pub fn is_from_user(&self) -> bool {
        matches!(self, OperationSource::User)
    }

    pub fn is_from_server(&self) -> bool {
        !self.is_from_user()
    }

    pub fn tag(&self) -> Option<u64> {
        match self {
            OperationSource::TaggedQuery(tag) => Some(*tag),
            _ => None,
        }
    }
}

/// A single change to the cached tree, addressed by `path`.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Replace everything at `path` with `snap`.
    Overwrite {
        source: OperationSource,
        path: Path,
        snap: Node,
    },
    /// Replace each value in `children` (keyed by path relative to `path`).
    Merge {
        source: OperationSource,
        path: Path,
        children: ImmutableTree<Node>,
    },
    /// The server finished sending the initial data for a listen at `path`.
    ListenComplete { source: OperationSource, path: Path },
    /// A pending user write was acknowledged (or reverted). `affected` marks
    /// the locations, relative to `path`, whose visible value may change.
    AckUserWrite {
        path: Path,
        affected: ImmutableTree<bool>,
        revert: bool,
    },
}

impl Operation {
    pub fn overwrite(source: OperationSource, path: Path, snap: Node) -> Self {
        Operation::Overwrite { source, path, snap }
    }

    pub fn merge(source: OperationSource, path: Path, children: ImmutableTree<Node>) -> Self {
        Operation::Merge {
            source,
            path,
            children,
        }
    }

    pub fn listen_complete(source: OperationSource, path: Path) -> Self {
        Operation::ListenComplete { source, path }
    }

    pub fn source(&self) -> OperationSource {
        match self {
            Operation::Overwrite { source, .. }
            | Operation::Merge { source, .. }
            | Operation::ListenComplete { source, .. } => *source,
            Operation::AckUserWrite { .. } => OperationSource::User,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Operation::Overwrite { path, .. }
            | Operation::Merge { path, .. }
            | Operation::ListenComplete { path, .. }
            | Operation::AckUserWrite { path, .. } => path,
        }
    }

    /// The same operation as seen from `child_key`, one level deeper.
    ///
    /// Returns `None` when the child is unaffected. Merges and acks at a
    /// non-empty path must only be projected onto the child on their path.
    pub fn operation_for_child(&self, child_key: &str) -> Option<Operation> {
        match self {
            Operation::Overwrite { source, path, snap } => match path.front() {
                None => Some(Operation::overwrite(
                    *source,
                    Path::empty(),
                    snap.immediate_child(child_key),
                )),
                Some(front) if front == child_key => {
                    Some(Operation::overwrite(*source, path.pop_front(), snap.clone()))
                }
                Some(_) => None,
            },
            Operation::Merge {
                source,
                path,
                children,
            } => match path.front() {
                None => {
                    let child_tree = children.resolved_child(child_key);
                    if child_tree.is_empty() {
                        None
                    } else if let Some(value) = child_tree.value() {
                        Some(Operation::overwrite(*source, Path::empty(), value.clone()))
                    } else {
                        Some(Operation::merge(*source, Path::empty(), child_tree))
                    }
                }
                Some(front) => {
                    assert(
                        front == child_key,
                        "Can't get a merge for a child not on the path of the operation",
                    );
                    Some(Operation::merge(*source, path.pop_front(), children.clone()))
                }
            },
            Operation::ListenComplete { source, path } => {
                Some(Operation::listen_complete(*source, path.pop_front()))
            }
            Operation::AckUserWrite {
                path,
                affected,
                revert,
            } => match path.front() {
                None => {
                    if affected.value().is_some() {
                        assert(
                            affected.children().next().is_none(),
                            "affected tree should not have overlapping affected paths",
                        );
                        return Some(self.clone());
                    }
                    let child_tree = affected.subtree(&Path::from_trusted(vec![child_key.to_string()]));
                    if child_tree.is_empty() {
                        return None;
                    }
                    Some(Operation::AckUserWrite {
                        path: Path::empty(),
                        affected: child_tree,
                        revert: *revert,
                    })
                }
                Some(front) => {
                    assert(
                        front == child_key,
                        "operation_for_child called for a child not on the ack path",
                    );
                    Some(Operation::AckUserWrite {
                        path: path.pop_front(),
                        affected: affected.clone(),
                        revert: *revert,
                    })
                }
            },
        }
    }

    /// Projects the operation along `relative`, returning `None` as soon as a
    /// step leaves it unaffected.
    pub fn operation_for_path(&self, relative: &Path) -> Option<Operation> {
        let mut current = self.clone();
        for segment in relative.segments() {
            if !current.path().is_empty() && current.path().front() != Some(segment.as_str()) {
                return None;
            }
            current = current.operation_for_child(segment)?;
        }
        Some(current)
    }

    /// The same operation addressed at `path` instead.
    pub fn with_path(&self, path: Path) -> Operation {
        match self {
            Operation::Overwrite { source, snap, .. } => Operation::overwrite(*source, path, snap.clone()),
            Operation::Merge {
                source, children, ..
            } => Operation::merge(*source, path, children.clone()),
            Operation::ListenComplete { source, .. } => Operation::listen_complete(*source, path),
            Operation::AckUserWrite {
                affected, revert, ..
            } => Operation::AckUserWrite {
                path,
                affected: affected.clone(),
                revert: *revert,
            },
        }
    }

    /// The operation as seen from `location`, with its path made relative to
    /// it. `None` when nothing at or below `location` is affected.
    pub fn for_location(&self, location: &Path) -> Option<Operation> {
        let path = self.path();
        if location.contains(path) {
            Some(self.with_path(Path::relative(location, path)))
        } else if path.contains(location) {
            self.with_path(Path::empty())
                .operation_for_path(&Path::relative(path, location))
        } else {
            None
        }
    }

    /// Applies the operation to `node`, which is rooted at the same location
    /// as the operation.
    pub fn apply_to(&self, node: &Node) -> Node {
        match self {
            Operation::Overwrite { path, snap, .. } => node.update_child(path, snap.clone()),
            Operation::Merge { path, children, .. } => {
                let mut result = node.clone();
                children.foreach(|relative, value| {
                    result = result.update_child(&path.child_path(relative), value.clone());
                });
                result
            }
            Operation::ListenComplete { .. } | Operation::AckUserWrite { .. } => node.clone(),
        }
    }
}
