use std::collections::{BTreeMap, HashMap};

use crate::database::core::operation::{Operation, OperationSource};
use crate::database::core::path::Path;
use crate::database::core::snap::Node;
use crate::database::core::snapshot_holder::SnapshotHolder;
use crate::database::core::util::{CountedSet, ImmutableTree};
use crate::database::core::view::{EventRegistration, QueuedEvent, QuerySpec, View, ViewInput};
use crate::database::core::write_tree::{WriteRecord, WriteTree};
use crate::database::error::DatabaseError;
use crate::database::LOGGER;

/// A listen the transport should open.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenRequest {
    pub query: QuerySpec,
    pub tag: Option<u64>,
    /// Hash of the data already cached for the query.
    pub hash: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ListenInstruction {
    Start(ListenRequest),
    Stop { query: QuerySpec, tag: Option<u64> },
}

/// Events to raise plus listens to open or close, produced by registration changes.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub events: Vec<QueuedEvent>,
    pub listens: Vec<ListenInstruction>,
}

/// All views at one location, keyed by query identifier.
#[derive(Debug, Default)]
struct SyncPoint {
    views: CountedSet<String, View>,
}

impl SyncPoint {
    /// A view that loads all data at this location.
    fn complete_view(&self) -> Option<&View> {
        self.views.values().find(|view| view.query().loads_all_data())
    }

    fn has_complete_view(&self) -> bool {
        self.complete_view().is_some()
    }

    /// Views of filtered queries.
    fn query_views(&self) -> impl Iterator<Item = &View> {
        self.views
            .values()
            .filter(|view| !view.query().loads_all_data())
    }
}

/// Combines the server cache, pending writes and every active view.
///
/// Every entry point returns the events the change produced; nothing is raised
/// from here.
#[derive(Debug, Default)]
pub struct SyncTree {
    holder: SnapshotHolder,
    writes: WriteTree,
    sync_points: BTreeMap<Path, SyncPoint>,
    /// Locations whose server data is fully known.
    complete: ImmutableTree<bool>,
    next_tag: u64,
    query_to_tag: HashMap<String, u64>,
    tag_to_query: HashMap<u64, QuerySpec>,
}

fn query_key(query: &QuerySpec) -> String {
    format!("{}${}", query.path, query.query_id())
}

impl SyncTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tree(&self) -> &WriteTree {
        &self.writes
    }

    pub fn server_root(&self) -> &Node {
        self.holder.root()
    }

    pub fn is_empty(&self) -> bool {
        self.sync_points.is_empty()
    }

    // ---- local writes ------------------------------------------------------

    /// Records a local overwrite and applies it optimistically.
    pub fn apply_user_overwrite(
        &mut self,
        path: Path,
        node: Node,
        write_id: u64,
        visible: bool,
    ) -> Vec<QueuedEvent> {
        self.writes
            .add_overwrite(path.clone(), node.clone(), write_id, visible);
        if !visible {
            return Vec::new();
        }
        self.apply_operation(Operation::overwrite(OperationSource::User, path, node))
    }

    /// Records a local multi-location update; keys of `children` are relative to `path`.
    pub fn apply_user_merge(
        &mut self,
        path: Path,
        children: BTreeMap<Path, Node>,
        write_id: u64,
    ) -> Vec<QueuedEvent> {
        let tree = ImmutableTree::from_children(children.iter());
        self.writes.add_merge(path.clone(), children, write_id);
        self.apply_operation(Operation::merge(OperationSource::User, path, tree))
    }

    /// Resolves a pending write. With `revert` the optimistic value is rolled
    /// back to whatever the server state and the remaining writes say.
    pub fn ack_user_write(&mut self, write_id: u64, revert: bool) -> Vec<QueuedEvent> {
        let Some(record) = self.writes.get_write(write_id).cloned() else {
            LOGGER.warn(format!("Ignoring ack for unknown write {write_id}"));
            return Vec::new();
        };
        if !self.writes.remove_write(write_id) {
            return Vec::new();
        }
        let WriteRecord { path, .. } = &record;
        self.apply_operation(Operation::AckUserWrite {
            path: path.clone(),
            affected: record.affected_tree(),
            revert,
        })
    }

    // ---- server data -------------------------------------------------------

    pub fn apply_server_overwrite(&mut self, path: Path, node: Node) -> Vec<QueuedEvent> {
        self.apply_operation(Operation::overwrite(OperationSource::Server, path, node))
    }

    pub fn apply_server_merge(&mut self, path: Path, children: BTreeMap<Path, Node>) -> Vec<QueuedEvent> {
        let tree = ImmutableTree::from_children(children.iter());
        self.apply_operation(Operation::merge(OperationSource::Server, path, tree))
    }

    pub fn apply_listen_complete(&mut self, path: Path) -> Vec<QueuedEvent> {
        self.apply_operation(Operation::listen_complete(OperationSource::Server, path))
    }

    pub fn apply_tagged_query_overwrite(&mut self, path: Path, node: Node, tag: u64) -> Vec<QueuedEvent> {
        self.apply_tagged(path, tag, |relative| {
            Operation::overwrite(OperationSource::TaggedQuery(tag), relative, node)
        })
    }

    pub fn apply_tagged_query_merge(
        &mut self,
        path: Path,
        children: BTreeMap<Path, Node>,
        tag: u64,
    ) -> Vec<QueuedEvent> {
        let tree = ImmutableTree::from_children(children.iter());
        self.apply_tagged(path, tag, |relative| {
            Operation::merge(OperationSource::TaggedQuery(tag), relative, tree)
        })
    }

    pub fn apply_tagged_listen_complete(&mut self, path: Path, tag: u64) -> Vec<QueuedEvent> {
        self.apply_tagged(path, tag, |relative| {
            Operation::listen_complete(OperationSource::TaggedQuery(tag), relative)
        })
    }

    fn apply_tagged(
        &mut self,
        path: Path,
        tag: u64,
        build: impl FnOnce(Path) -> Operation,
    ) -> Vec<QueuedEvent> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            // The query was removed already.
            return Vec::new();
        };
        if !query.path.contains(&path) {
            LOGGER.warn(format!("Dropping tagged update for {path} outside of query {query}"));
            return Vec::new();
        }
        let op = build(Path::relative(&query.path, &path));
        let query_id = query.query_id();
        let Some(view) = self
            .sync_points
            .get_mut(&query.path)
            .and_then(|point| point.views.get_mut(&query_id))
        else {
            return Vec::new();
        };
        Self::apply_to_own_cache(view, &op, true);
        self.refresh_view(&query.path, &query_id)
    }

    fn apply_to_own_cache(view: &mut View, op: &Operation, create: bool) {
        if view.own_cache.is_none() && !create {
            return;
        }
        let current = view.own_cache.take().unwrap_or_else(Node::empty);
        view.own_cache = Some(op.apply_to(&current));
        let covers_view = op.path().is_empty()
            && matches!(op, Operation::Overwrite { .. } | Operation::ListenComplete { .. });
        if covers_view {
            view.own_cache_complete = true;
        }
    }

    /// Routes `op` to the server cache (for server operations) and re-evaluates
    /// every view it reaches.
    fn apply_operation(&mut self, op: Operation) -> Vec<QueuedEvent> {
        let locations: Vec<Path> = self
            .sync_points
            .keys()
            .filter(|location| location.is_related(op.path()))
            .cloned()
            .collect();
        let mut reached = Vec::new();
        for location in locations {
            let Some(rooted) = op.for_location(&location) else {
                continue;
            };
            if op.source() == OperationSource::Server {
                self.apply_server_operation_at(&location, &rooted);
            }
            reached.push(location);
        }
        let mut events = Vec::new();
        for location in reached {
            events.extend(self.refresh_sync_point(&location));
        }
        events
    }

    fn apply_server_operation_at(&mut self, location: &Path, rooted: &Operation) {
        let current = self.holder.get_node(location);
        self.holder
            .update_snapshot(location, rooted.apply_to(&current));
        match rooted {
            Operation::Overwrite { path, .. } | Operation::ListenComplete { path, .. } => {
                self.complete = self.complete.set(&location.child_path(path), true);
            }
            Operation::Merge { path, children, .. } => {
                let base = location.child_path(path);
                let mut complete = self.complete.clone();
                children.foreach(|relative, _| {
                    complete = complete.set(&base.child_path(relative), true);
                });
                self.complete = complete;
            }
            Operation::AckUserWrite { .. } => {}
        }
        if let Some(point) = self.sync_points.get_mut(location) {
            for view in point.views.values_mut() {
                Self::apply_to_own_cache(view, rooted, false);
            }
        }
    }

    fn is_server_complete(&self, path: &Path) -> bool {
        self.complete.find_rootmost_value_and_path(path).is_some()
    }

    /// Children of `path` whose server data is complete.
    fn complete_server_children(&self, path: &Path) -> Node {
        let node = self.holder.get_node(path);
        let mut known = Node::empty();
        self.complete.subtree(path).foreach_child(|key, _| {
            known = known.update_immediate_child(key, node.immediate_child(key));
        });
        known
    }

    fn server_cache_for(&self, path: &Path, view: &View) -> Option<Node> {
        match view.own_server_cache() {
            Some(own) => own.cloned(),
            None => self
                .is_server_complete(path)
                .then(|| self.holder.get_node(path)),
        }
    }

    fn view_input(&self, path: &Path, view: &View) -> ViewInput {
        let server_cache = self.server_cache_for(path, view);
        match self.writes.calc_complete_event_cache(path, server_cache.as_ref()) {
            Some(node) => ViewInput::Complete(node),
            None => {
                let known = match &view.own_cache {
                    Some(own) => own.clone(),
                    None => self.complete_server_children(path),
                };
                ViewInput::Partial(self.writes.calc_complete_event_children(path, Some(&known)))
            }
        }
    }

    fn refresh_sync_point(&mut self, path: &Path) -> Vec<QueuedEvent> {
        let query_ids: Vec<String> = match self.sync_points.get(path) {
            Some(point) => point.views.keys().cloned().collect(),
            None => return Vec::new(),
        };
        query_ids
            .iter()
            .flat_map(|query_id| self.refresh_view(path, query_id))
            .collect()
    }

    fn refresh_view(&mut self, path: &Path, query_id: &String) -> Vec<QueuedEvent> {
        let Some(input) = self
            .sync_points
            .get(path)
            .and_then(|point| point.views.get(query_id))
            .map(|view| self.view_input(path, view))
        else {
            return Vec::new();
        };
        match self
            .sync_points
            .get_mut(path)
            .and_then(|point| point.views.get_mut(query_id))
        {
            Some(view) => view.update(input),
            None => Vec::new(),
        }
    }

    /// The value at `path` as currently known: complete server data with
    /// pending writes layered on top.
    pub fn calc_complete_event_cache(&self, path: &Path) -> Option<Node> {
        let server_cache = self
            .is_server_complete(path)
            .then(|| self.holder.get_node(path));
        self.writes
            .calc_complete_event_cache(path, server_cache.as_ref())
    }

    /// The value a transaction at `path` builds on: server data plus every
    /// pending write, hidden ones included, except those in `exclude`.
    pub fn calc_latest_state(&self, path: &Path, exclude: &[u64]) -> Node {
        let server_cache = self
            .is_server_complete(path)
            .then(|| self.holder.get_node(path));
        self.writes
            .calc_latest_state(path, server_cache.as_ref(), exclude)
    }

    // ---- registrations -----------------------------------------------------

    /// Attaches `registration` to the view for `query`, creating the view and
    /// the listen behind it when needed.
    pub fn add_event_registration(
        &mut self,
        query: QuerySpec,
        registration: EventRegistration,
    ) -> SyncOutcome {
        let path = query.path.clone();
        let query_id = query.query_id();
        let covered_by_ancestor = self
            .sync_points
            .iter()
            .any(|(location, point)| location.contains(&path) && point.has_complete_view());
        let view_exists = self
            .sync_points
            .get(&path)
            .is_some_and(|point| point.views.contains(&query_id));

        if !view_exists {
            if !query.loads_all_data() {
                self.next_tag += 1;
                let tag = self.next_tag;
                self.query_to_tag.insert(query_key(&query), tag);
                self.tag_to_query.insert(tag, query.clone());
            }
            let placeholder = View::new(query.clone(), ViewInput::Partial(Node::empty()));
            let input = self.view_input(&path, &placeholder);
            self.sync_points
                .entry(path.clone())
                .or_default()
                .views
                .add(query_id.clone(), View::new(query.clone(), input));
        }

        let mut outcome = SyncOutcome::default();
        if let Some(view) = self
            .sync_points
            .get_mut(&path)
            .and_then(|point| point.views.get_mut(&query_id))
        {
            outcome.events = view.add_registration(registration);
        }
        if !view_exists && !covered_by_ancestor {
            outcome.listens = self.setup_listener(&query);
        }
        outcome
    }

    fn tag_for_query(&self, query: &QuerySpec) -> Option<u64> {
        self.query_to_tag.get(&query_key(query)).copied()
    }

    pub fn query_for_tag(&self, tag: u64) -> Option<&QuerySpec> {
        self.tag_to_query.get(&tag)
    }

    fn listen_request_for(&self, view: &View) -> ListenRequest {
        let query = view.query();
        let hash = self
            .server_cache_for(&query.path, view)
            .map(|node| node.hash().to_string())
            .unwrap_or_default();
        ListenRequest {
            query: query.for_listening(),
            tag: self.tag_for_query(query),
            hash,
        }
    }

    fn setup_listener(&self, query: &QuerySpec) -> Vec<ListenInstruction> {
        let Some(view) = self
            .sync_points
            .get(&query.path)
            .and_then(|point| point.views.get(&query.query_id()))
        else {
            return Vec::new();
        };
        let request = self.listen_request_for(view);
        let tag = request.tag;
        let mut listens = vec![ListenInstruction::Start(request)];
        if tag.is_none() {
            // A plain listen covers every listen at or below it.
            for shadowed in self.shadowed_queries(&query.path) {
                listens.push(ListenInstruction::Stop {
                    tag: self.tag_for_query(&shadowed),
                    query: shadowed.for_listening(),
                });
            }
        }
        listens
    }

    /// Sync points at or below `root` that are not under another point with a
    /// complete view (the point at `root` itself never shadows).
    fn uncovered_points_below(&self, root: &Path) -> Vec<(&Path, &SyncPoint)> {
        let mut result: Vec<(&Path, &SyncPoint)> = Vec::new();
        let mut covering: Vec<&Path> = Vec::new();
        for (location, point) in self.sync_points.range(root.clone()..) {
            if !root.contains(location) {
                break;
            }
            if covering.iter().any(|cover| cover.contains(location)) {
                continue;
            }
            result.push((location, point));
            if location != root && point.has_complete_view() {
                covering.push(location);
            }
        }
        result
    }

    /// Listens that a new plain listen at `root` makes redundant.
    fn shadowed_queries(&self, root: &Path) -> Vec<QuerySpec> {
        let mut queries = Vec::new();
        for (location, point) in self.uncovered_points_below(root) {
            match point.complete_view() {
                Some(view) if location != root => queries.push(view.query().clone()),
                _ => queries.extend(point.query_views().map(|view| view.query().clone())),
            }
        }
        queries
    }

    /// Detaches registration `id` (or every registration when `None`) from
    /// the view for `query`. A plain query detaches from every view at its
    /// location. With `cancel_error` the removed registrations get a cancel
    /// event and no stop instructions are produced.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        id: Option<u64>,
        cancel_error: Option<DatabaseError>,
    ) -> SyncOutcome {
        let path = query.path.clone();
        let query_id = query.query_id();
        let mut outcome = SyncOutcome::default();
        let Some(point) = self.sync_points.get_mut(&path) else {
            return outcome;
        };
        if !query.params.is_default() && !point.views.contains(&query_id) {
            return outcome;
        }

        let had_complete_view = point.has_complete_view();
        let targets: Vec<String> = if query.params.is_default() {
            point.views.keys().cloned().collect()
        } else {
            vec![query_id]
        };
        let mut removed: Vec<QuerySpec> = Vec::new();
        for target in targets {
            let Some(view) = point.views.get_mut(&target) else {
                continue;
            };
            outcome
                .events
                .extend(view.remove_registration(id, cancel_error.as_ref()));
            if view.is_empty() {
                if let Some(view) = point.views.remove(&target) {
                    if !view.query().loads_all_data() {
                        removed.push(view.query().clone());
                    }
                }
            }
        }
        if had_complete_view && !point.has_complete_view() {
            removed.push(QuerySpec::default_at(path.clone()));
        }
        if point.views.is_empty() {
            self.sync_points.remove(&path);
            self.prune_server_cache(&path);
        }

        let removing_default = removed.iter().any(QuerySpec::loads_all_data);
        let covered = self
            .sync_points
            .iter()
            .any(|(location, point)| location.contains(&path) && point.has_complete_view());

        if removing_default && !covered {
            for (_, point) in self.uncovered_points_below(&path) {
                let views: Vec<&View> = match point.complete_view() {
                    Some(view) => vec![view],
                    None => point.query_views().collect(),
                };
                for view in views {
                    outcome
                        .listens
                        .push(ListenInstruction::Start(self.listen_request_for(view)));
                }
            }
        }
        if !covered && !removed.is_empty() && cancel_error.is_none() {
            if removing_default {
                outcome.listens.push(ListenInstruction::Stop {
                    query: QuerySpec::default_at(path.clone()),
                    tag: None,
                });
            } else {
                for query in &removed {
                    outcome.listens.push(ListenInstruction::Stop {
                        query: query.for_listening(),
                        tag: self.tag_for_query(query),
                    });
                }
            }
        }
        for query in removed.iter().filter(|query| !query.loads_all_data()) {
            if let Some(tag) = self.query_to_tag.remove(&query_key(query)) {
                self.tag_to_query.remove(&tag);
            }
        }
        outcome
    }

    /// Forgets server data at `path` once nothing at or above it listens,
    /// keeping what descendant views still rely on.
    fn prune_server_cache(&mut self, path: &Path) {
        if self
            .sync_points
            .keys()
            .any(|location| location.contains(path))
        {
            return;
        }
        let kept: Vec<(Path, ImmutableTree<bool>, Node)> = self
            .sync_points
            .keys()
            .filter(|location| path.contains(location))
            .map(|location| {
                let complete = match self.complete.find_rootmost_value_and_path(location) {
                    Some(_) => ImmutableTree::with_value(true),
                    None => self.complete.subtree(location),
                };
                (location.clone(), complete, self.holder.get_node(location))
            })
            .collect();
        self.complete = self.complete.set_tree(path, ImmutableTree::new());
        self.holder.update_snapshot(path, Node::empty());
        for (location, complete, node) in kept {
            self.complete = self.complete.set_tree(&location, complete);
            self.holder.update_snapshot(&location, node);
        }
    }
}
