use std::sync::{Arc, MutexGuard};

use serde_json::{json, Value};

use super::{server_time, with_child, Repo, RepoState};
use crate::database::core::path::Path;
use crate::database::core::server_actions::ServerStatus;
use crate::database::core::snap::Node;
use crate::database::core::view::{DataEvent, EventType, QueuedEvent, QuerySpec};
use crate::database::error::{aborted, internal_error, DatabaseError, DatabaseResult};
use crate::database::server_value::resolve_deferred_value;
use crate::database::LOGGER;

/// Sends of one transaction before it is given up.
pub const MAX_TRANSACTION_RETRIES: u32 = 25;

/// Computes the new value from the current one. Returning `None` aborts.
pub type TransactionUpdate = Box<dyn FnMut(Value) -> Option<Value> + Send>;

/// Called once when a transaction commits, aborts or fails.
pub type TransactionCompletion = Box<dyn FnOnce(DatabaseResult<TransactionOutcome>) + Send>;

/// How a transaction ended. `node` is the committed value, or the value the
/// update function last saw when it declined to write.
#[derive(Clone, Debug)]
pub struct TransactionOutcome {
    pub committed: bool,
    pub node: Node,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransactionStatus {
    /// Run locally and waiting to be sent.
    Run,
    Sent,
    /// Sent, then overtaken by a local write. Aborted unless the server accepts it.
    SentNeedsAbort,
    NeedsAbort,
    Completed,
}

pub(super) struct Transaction {
    order: u64,
    path: Path,
    update: TransactionUpdate,
    on_complete: Option<TransactionCompletion>,
    status: TransactionStatus,
    apply_locally: bool,
    retry_count: u32,
    abort_reason: Option<DatabaseError>,
    write_id: u64,
    /// Output with server value placeholders left in, as sent to the server.
    raw_output: Value,
    output: Node,
    /// Registration keeping `path` synced while the transaction is pending.
    watch: u64,
}

struct TransactionSend {
    path: Path,
    data: Value,
    hash: String,
    orders: Vec<u64>,
}

/// Work recorded under the state lock and carried out once it is released.
#[derive(Default)]
pub(super) struct TransactionEffects {
    events: Vec<QueuedEvent>,
    sends: Vec<TransactionSend>,
    completions: Vec<(TransactionCompletion, DatabaseResult<TransactionOutcome>)>,
    unwatch: Vec<(Path, u64)>,
}

impl RepoState {
    fn allocate_write_id(&mut self) -> u64 {
        let write_id = self.next_write_id;
        self.next_write_id += 1;
        write_id
    }

    fn start_transaction(
        &mut self,
        path: Path,
        mut update: TransactionUpdate,
        apply_locally: bool,
        on_complete: TransactionCompletion,
        watch: u64,
    ) {
        let input = self.sync_tree.calc_latest_state(&path, &[]);
        let Some(value) = update(input.val()) else {
            self.effects.unwatch.push((path, watch));
            let outcome = TransactionOutcome {
                committed: false,
                node: input,
            };
            self.effects.completions.push((on_complete, Ok(outcome)));
            return;
        };
        let now = server_time(self.server_time_offset_ms);
        let (raw_output, output) = match prepare_output(&input, value, now) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.effects.unwatch.push((path, watch));
                self.effects.completions.push((on_complete, Err(err)));
                return;
            }
        };
        let write_id = self.allocate_write_id();
        let order = self.next_transaction_order;
        self.next_transaction_order += 1;
        let events = self
            .sync_tree
            .apply_user_overwrite(path.clone(), output.clone(), write_id, apply_locally);
        self.effects.events.extend(events);
        self.transactions.push(Transaction {
            order,
            path,
            update,
            on_complete: Some(on_complete),
            status: TransactionStatus::Run,
            apply_locally,
            retry_count: 0,
            abort_reason: None,
            write_id,
            raw_output,
            output,
            watch,
        });
        self.send_ready_transactions();
    }

    /// The rootmost location at or above `path` holding a transaction, or
    /// `path` itself.
    fn transaction_root(&self, path: &Path) -> Path {
        self.transactions
            .iter()
            .map(|transaction| &transaction.path)
            .filter(|candidate| candidate.contains(path))
            .min_by_key(|candidate| candidate.len())
            .cloned()
            .unwrap_or_else(|| path.clone())
    }

    /// Indices, in creation order, of the transactions at or below `root`.
    fn queue_under(&self, root: &Path) -> Vec<usize> {
        self.transactions
            .iter()
            .enumerate()
            .filter(|(_, transaction)| root.contains(&transaction.path))
            .map(|(index, _)| index)
            .collect()
    }

    fn prune_completed_transactions(&mut self) {
        self.transactions
            .retain(|transaction| transaction.status != TransactionStatus::Completed);
    }

    /// Sends every queue whose transactions have all been run and none sent.
    fn send_ready_transactions(&mut self) {
        self.prune_completed_transactions();
        let mut roots: Vec<Path> = Vec::new();
        for transaction in &self.transactions {
            let root = self.transaction_root(&transaction.path);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        for root in roots {
            let queue = self.queue_under(&root);
            let all_run = queue
                .iter()
                .all(|&index| self.transactions[index].status == TransactionStatus::Run);
            if all_run {
                self.send_transaction_queue(root, queue);
            }
        }
    }

    fn send_transaction_queue(&mut self, root: Path, queue: Vec<usize>) {
        let exclude: Vec<u64> = queue
            .iter()
            .map(|&index| self.transactions[index].write_id)
            .collect();
        let latest = self.sync_tree.calc_latest_state(&root, &exclude);
        let hash = latest.hash().to_string();
        let mut data = latest.export_val();
        let mut orders = Vec::with_capacity(queue.len());
        for index in queue {
            let transaction = &mut self.transactions[index];
            transaction.status = TransactionStatus::Sent;
            transaction.retry_count += 1;
            let relative = Path::relative(&root, &transaction.path);
            data = with_child(&data, &relative, transaction.raw_output.clone());
            orders.push(transaction.order);
        }
        self.effects.sends.push(TransactionSend {
            path: root,
            data,
            hash,
            orders,
        });
    }

    fn on_transaction_sent(&mut self, root: &Path, orders: &[u64], status: ServerStatus) {
        match status {
            ServerStatus::Ok => {
                let RepoState {
                    sync_tree,
                    transactions,
                    effects,
                    ..
                } = self;
                for transaction in transactions
                    .iter_mut()
                    .filter(|transaction| orders.contains(&transaction.order))
                {
                    transaction.status = TransactionStatus::Completed;
                    effects
                        .events
                        .extend(sync_tree.ack_user_write(transaction.write_id, false));
                    effects
                        .unwatch
                        .push((transaction.path.clone(), transaction.watch));
                    if let Some(on_complete) = transaction.on_complete.take() {
                        let outcome = TransactionOutcome {
                            committed: true,
                            node: transaction.output.clone(),
                        };
                        effects.completions.push((on_complete, Ok(outcome)));
                    }
                }
                self.send_ready_transactions();
            }
            ServerStatus::Error { ref code, .. } if code == "datastale" => {
                LOGGER.debug(format!("transaction at {root} was stale, rerunning"));
                for transaction in self
                    .transactions
                    .iter_mut()
                    .filter(|transaction| orders.contains(&transaction.order))
                {
                    transaction.status = match transaction.status {
                        TransactionStatus::SentNeedsAbort => TransactionStatus::NeedsAbort,
                        _ => TransactionStatus::Run,
                    };
                }
                self.rerun_transactions(root);
            }
            failed => {
                LOGGER.warn(format!("transaction at {root} failed: {failed}"));
                let error = failed
                    .into_result()
                    .err()
                    .unwrap_or_else(|| internal_error("transaction failed"));
                for transaction in self
                    .transactions
                    .iter_mut()
                    .filter(|transaction| orders.contains(&transaction.order))
                {
                    transaction.status = TransactionStatus::NeedsAbort;
                    transaction.abort_reason = Some(error.clone());
                }
                self.rerun_transactions(root);
            }
        }
    }

    /// Reruns the transactions that depend on data at `changed` and returns
    /// the location they were collected from.
    pub(super) fn rerun_transactions(&mut self, changed: &Path) -> Path {
        let root = self.transaction_root(changed);
        let queue = self.queue_under(&root);
        self.rerun_transaction_queue(queue);
        root
    }

    fn rerun_transaction_queue(&mut self, queue: Vec<usize>) {
        if queue.is_empty() {
            return;
        }
        let now = server_time(self.server_time_offset_ms);
        let mut ignored: Vec<u64> = queue
            .iter()
            .map(|&index| &self.transactions[index])
            .filter(|transaction| transaction.status == TransactionStatus::Run)
            .map(|transaction| transaction.write_id)
            .collect();

        for index in queue {
            let write_id = self.transactions[index].write_id;
            let status = self.transactions[index].status;
            let finished = match status {
                TransactionStatus::NeedsAbort => {
                    let reason = self.transactions[index]
                        .abort_reason
                        .take()
                        .unwrap_or_else(|| aborted("set"));
                    self.revert_write(write_id);
                    Some(Err(reason))
                }
                TransactionStatus::Run
                    if self.transactions[index].retry_count >= MAX_TRANSACTION_RETRIES =>
                {
                    self.revert_write(write_id);
                    Some(Err(aborted("maxretry")))
                }
                TransactionStatus::Run => {
                    let path = self.transactions[index].path.clone();
                    let current = self.sync_tree.calc_latest_state(&path, &ignored);
                    let next = (self.transactions[index].update)(current.val());
                    match next.map(|value| prepare_output(&current, value, now)) {
                        Some(Ok((raw_output, output))) => {
                            let new_write_id = self.allocate_write_id();
                            let transaction = &mut self.transactions[index];
                            transaction.write_id = new_write_id;
                            transaction.raw_output = raw_output;
                            transaction.output = output.clone();
                            let apply_locally = transaction.apply_locally;
                            ignored.retain(|id| *id != write_id);
                            let events = self.sync_tree.apply_user_overwrite(
                                path,
                                output,
                                new_write_id,
                                apply_locally,
                            );
                            self.effects.events.extend(events);
                            self.revert_write(write_id);
                            None
                        }
                        Some(Err(err)) => {
                            self.revert_write(write_id);
                            Some(Err(err))
                        }
                        None => {
                            self.revert_write(write_id);
                            Some(Ok(TransactionOutcome {
                                committed: false,
                                node: current,
                            }))
                        }
                    }
                }
                _ => None,
            };
            if let Some(result) = finished {
                self.finish_transaction(index, result);
            }
        }
        self.send_ready_transactions();
    }

    /// Aborts the unsent transactions at, above or below `path` and marks the
    /// sent ones to be aborted when they come back. Returns the location
    /// transactions need to be rerun from.
    pub(super) fn abort_transactions(&mut self, path: &Path) -> Path {
        let affected = self.transaction_root(path);
        for index in 0..self.transactions.len() {
            let transaction = &mut self.transactions[index];
            if !(transaction.path.contains(path) || path.contains(&transaction.path)) {
                continue;
            }
            match transaction.status {
                TransactionStatus::Sent => {
                    transaction.status = TransactionStatus::SentNeedsAbort;
                    transaction.abort_reason = Some(aborted("set"));
                }
                TransactionStatus::Run => {
                    let write_id = transaction.write_id;
                    self.revert_write(write_id);
                    self.finish_transaction(index, Err(aborted("set")));
                }
                _ => {}
            }
        }
        self.prune_completed_transactions();
        affected
    }

    fn revert_write(&mut self, write_id: u64) {
        let events = self.sync_tree.ack_user_write(write_id, true);
        self.effects.events.extend(events);
    }

    fn finish_transaction(&mut self, index: usize, result: DatabaseResult<TransactionOutcome>) {
        let transaction = &mut self.transactions[index];
        transaction.status = TransactionStatus::Completed;
        self.effects
            .unwatch
            .push((transaction.path.clone(), transaction.watch));
        if let Some(on_complete) = transaction.on_complete.take() {
            self.effects.completions.push((on_complete, result));
        }
    }
}

/// Builds the value to send and the node to apply locally. Without an
/// explicit `.priority` the current priority is kept.
fn prepare_output(current: &Node, value: Value, now: i64) -> DatabaseResult<(Value, Node)> {
    let explicit_priority = matches!(&value, Value::Object(map) if map.contains_key(".priority"));
    let resolved = resolve_deferred_value(&value, current, now)?;
    let mut node = Node::from_json(&resolved)?;
    if explicit_priority {
        return Ok((value, node));
    }
    let priority = current.priority();
    if priority.is_empty() || node.is_empty() {
        return Ok((value, node));
    }
    node = node.update_priority(priority.clone());
    let raw = match value {
        Value::Object(mut map) if !map.contains_key(".sv") => {
            map.insert(".priority".to_string(), priority.val());
            Value::Object(map)
        }
        other => json!({ ".value": other, ".priority": priority.val() }),
    };
    Ok((raw, node))
}

impl Repo {
    /// Runs `update` on the latest value at `path` and commits its result
    /// with a compare-and-set write. The update is rerun whenever the server
    /// reports the data changed underneath it, until it commits, declines by
    /// returning `None`, or has been retried too often. A local write at,
    /// above or below `path` aborts it.
    ///
    /// With `apply_locally` listeners see each attempt before it commits.
    /// `update` runs while the repo is locked and must not call back into it.
    pub fn start_transaction(
        &self,
        path: &Path,
        update: TransactionUpdate,
        apply_locally: bool,
        on_complete: TransactionCompletion,
    ) {
        LOGGER.debug(format!("transaction at {path}"));
        let watch = self.add_event_callback(
            QuerySpec::default_at(path.clone()),
            EventType::Value,
            Arc::new(|_: DataEvent| {}),
            None,
        );
        let mut state = self.state();
        state.start_transaction(path.clone(), update, apply_locally, on_complete, watch);
        self.release(state);
    }

    /// Unlocks `state`, raises every queued event, then carries out the
    /// transaction work recorded while it was held.
    pub(super) fn release(&self, mut state: MutexGuard<'_, RepoState>) {
        let effects = std::mem::take(&mut state.effects);
        self.inner.events.queue(effects.events);
        drop(state);
        self.inner.events.raise_queued();
        for send in effects.sends {
            self.send_transaction(send);
        }
        for (path, watch) in effects.unwatch {
            self.remove_event_callback(&QuerySpec::default_at(path), watch);
        }
        for (on_complete, result) in effects.completions {
            on_complete(result);
        }
    }

    fn send_transaction(&self, send: TransactionSend) {
        let TransactionSend {
            path,
            data,
            hash,
            orders,
        } = send;
        LOGGER.debug(format!("sending {} transaction(s) at {path}", orders.len()));
        let weak = self.downgrade();
        let root = path.clone();
        self.inner.server.put(
            &path,
            data,
            Some(hash),
            Box::new(move |status| {
                if let Some(repo) = Repo::upgrade(&weak) {
                    let mut state = repo.state();
                    state.on_transaction_sent(&root, &orders, status);
                    repo.release(state);
                }
            }),
        );
    }
}
