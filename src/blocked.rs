//! Tracker for evaluations whose scheduler ran but placed nothing.
//!
//! A blocked eval waits here until a state change makes placement plausible
//! again: a node of the right computed class becoming schedulable, capacity
//! freeing on a specific node, or quota headroom appearing. Each unblock
//! republishes the matching evals into the broker with a fresh snapshot
//! index equal to the unblock index, so workers know which store generation
//! to wait for before rescheduling.
//!
//! Evals whose scheduler could not compute a class (wildcard constraints)
//! are "escaped": they unblock on any relevant change, trading extra work
//! for correctness. Republication is dampened by remembering the last index
//! each eval was released at, and at most one blocked eval is kept per job
//! (the newest wins; losers surface through [`BlockedEvals::drain_duplicates`]
//! so the leader can cancel them in state).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::broker::EvalBroker;
use crate::metrics;
use crate::structs::{EvalStatus, Evaluation};

type JobKey = (String, String);

struct BlockedEntry {
    eval: Evaluation,
    /// The last unblock index this eval was republished at.
    last_unblock_index: u64,
}

#[derive(Default)]
struct TrackerInner {
    enabled: bool,
    /// All tracked evals by id.
    captured: HashMap<String, BlockedEntry>,
    /// Class-keyed index over non-escaped evals.
    by_class: HashMap<u64, HashSet<String>>,
    /// Quota-keyed index over non-escaped evals with a quota.
    by_quota: HashMap<String, HashSet<String>>,
    /// Node-keyed index (system evals blocked on one node).
    by_node: HashMap<String, HashSet<String>>,
    /// Evals that escaped class computation; unblocked by everything.
    escaped: HashSet<String>,
    /// One blocked eval per job; the id currently holding the slot.
    by_job: HashMap<JobKey, String>,
    /// Older evals displaced by a newer one, awaiting cancellation.
    duplicates: Vec<Evaluation>,
    /// Last index each eval was released at; survives re-blocking so a
    /// churning escaped eval is not republished for store generations it
    /// already saw.
    released_at: HashMap<String, u64>,
}

impl TrackerInner {
    fn remove_entry(&mut self, id: &str) -> Option<BlockedEntry> {
        let entry = self.captured.remove(id)?;
        if let Some(set) = self.by_class.get_mut(&entry.eval.computed_class) {
            set.remove(id);
        }
        if let Some(set) = self.by_quota.get_mut(&entry.eval.quota_limit) {
            set.remove(id);
        }
        if let Some(set) = self.by_node.get_mut(&entry.eval.node_id) {
            set.remove(id);
        }
        self.escaped.remove(id);
        let key = (entry.eval.namespace.clone(), entry.eval.job_id.clone());
        if self.by_job.get(&key).map(String::as_str) == Some(id) {
            self.by_job.remove(&key);
        }
        Some(entry)
    }
}

/// Statistics for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockedStats {
    pub total_blocked: usize,
    pub total_escaped: usize,
    pub total_quota_limited: usize,
}

pub struct BlockedEvals {
    inner: Mutex<TrackerInner>,
    broker: Arc<EvalBroker>,
}

impl BlockedEvals {
    pub fn new(broker: Arc<EvalBroker>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TrackerInner::default()),
            broker,
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;
        if !enabled {
            *inner = TrackerInner::default();
        }
    }

    /// Track a blocked eval. Duplicate ids are ignored; a second blocked
    /// eval for the same job displaces the older of the two.
    pub fn block(&self, eval: Evaluation) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled || inner.captured.contains_key(&eval.id) {
            return;
        }

        let key = (eval.namespace.clone(), eval.job_id.clone());
        if let Some(existing_id) = inner.by_job.get(&key).cloned() {
            let existing_index = inner
                .captured
                .get(&existing_id)
                .map(|e| e.eval.create_index)
                .unwrap_or(0);
            if eval.create_index <= existing_index {
                // The incoming eval is the stale one.
                inner.duplicates.push(eval);
                return;
            }
            if let Some(old) = inner.remove_entry(&existing_id) {
                inner.duplicates.push(old.eval);
            }
        }

        let id = eval.id.clone();
        if eval.escaped_computation {
            inner.escaped.insert(id.clone());
        } else {
            inner
                .by_class
                .entry(eval.computed_class)
                .or_default()
                .insert(id.clone());
            if !eval.quota_limit.is_empty() {
                inner
                    .by_quota
                    .entry(eval.quota_limit.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }
        if !eval.node_id.is_empty() {
            inner.by_node.entry(eval.node_id.clone()).or_default().insert(id.clone());
        }
        inner.by_job.insert(key, id.clone());
        let last_unblock_index = inner.released_at.get(&id).copied().unwrap_or(0);
        inner.captured.insert(
            id,
            BlockedEntry {
                eval,
                last_unblock_index,
            },
        );
        metrics::BLOCKED_EVALS.set(inner.captured.len() as i64);
    }

    /// A node of `class` became schedulable at `index`.
    pub fn unblock(&self, class: u64, index: u64) {
        self.release(index, |inner| {
            inner.by_class.get(&class).cloned().unwrap_or_default()
        });
    }

    /// Capacity changed on one node at `index`.
    pub fn unblock_node(&self, node_id: &str, index: u64) {
        let node_id = node_id.to_string();
        self.release(index, move |inner| {
            inner.by_node.get(&node_id).cloned().unwrap_or_default()
        });
    }

    /// Quota headroom appeared at `index`.
    pub fn unblock_quota(&self, quota: &str, index: u64) {
        let quota = quota.to_string();
        self.release(index, move |inner| {
            inner.by_quota.get(&quota).cloned().unwrap_or_default()
        });
    }

    /// Both a class and its quota changed in one write.
    pub fn unblock_class_and_quota(&self, class: u64, quota: &str, index: u64) {
        let quota = quota.to_string();
        self.release(index, move |inner| {
            let mut ids = inner.by_class.get(&class).cloned().unwrap_or_default();
            if let Some(q) = inner.by_quota.get(&quota) {
                ids.extend(q.iter().cloned());
            }
            ids
        });
    }

    fn release<F>(&self, index: u64, select: F)
    where
        F: FnOnce(&TrackerInner) -> HashSet<String>,
    {
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.enabled {
                return;
            }
            let mut ids = select(&inner);
            // Escaped evals ride along on every unblock.
            ids.extend(inner.escaped.iter().cloned());

            for id in ids {
                let Some(entry) = inner.captured.get_mut(&id) else {
                    continue;
                };
                // Dampening: a second unblock at the same index is a no-op.
                if entry.last_unblock_index >= index {
                    continue;
                }
                let Some(entry) = inner.remove_entry(&id) else {
                    continue;
                };
                inner.released_at.insert(id, index);
                released.push(entry.eval);
            }
            metrics::BLOCKED_EVALS.set(inner.captured.len() as i64);
        }

        for mut eval in released {
            debug!(eval_id = %eval.id, index, "unblocking eval");
            metrics::BLOCKED_UNBLOCKS.inc();
            // The eval re-enters the broker as pending work against the
            // store generation that triggered the unblock.
            eval.status = EvalStatus::Pending;
            eval.snapshot_index = index;
            self.broker.enqueue(eval);
        }
    }

    /// Purge a job's blocked evals after a successful scheduling cycle.
    pub fn untrack(&self, namespace: &str, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = (namespace.to_string(), job_id.to_string());
        if let Some(id) = inner.by_job.get(&key).cloned() {
            inner.remove_entry(&id);
            inner.released_at.remove(&id);
        }
        metrics::BLOCKED_EVALS.set(inner.captured.len() as i64);
    }

    /// Displaced evals awaiting cancellation in state.
    pub fn drain_duplicates(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.inner.lock().unwrap().duplicates)
    }

    pub fn stats(&self) -> BlockedStats {
        let inner = self.inner.lock().unwrap();
        BlockedStats {
            total_blocked: inner.captured.len(),
            total_escaped: inner.escaped.len(),
            total_quota_limited: inner.by_quota.values().map(HashSet::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SCHEDULER_VERSION;
    use crate::config::ServerConfig;
    use crate::structs::TRIGGER_QUEUED_ALLOCS;
    use std::time::Duration;

    fn setup() -> (Arc<EvalBroker>, Arc<BlockedEvals>) {
        let (broker, _failed_rx) = EvalBroker::new(&ServerConfig::for_testing());
        broker.set_enabled(true);
        // The receiver is dropped; failed sends are ignored in these tests.
        let blocked = BlockedEvals::new(broker.clone());
        blocked.set_enabled(true);
        (broker, blocked)
    }

    fn blocked_eval(id: &str, job: &str, class: u64, create_index: u64) -> Evaluation {
        let mut e = Evaluation::new("default", job, "service", 50, TRIGGER_QUEUED_ALLOCS);
        e.id = id.to_string();
        e.status = EvalStatus::Blocked;
        e.computed_class = class;
        e.create_index = create_index;
        e.modify_index = create_index;
        e
    }

    async fn dequeue_id(broker: &Arc<EvalBroker>) -> Option<String> {
        broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(100))
            .await
            .unwrap()
            .map(|(e, _, _)| e.id)
    }

    #[tokio::test]
    async fn unblock_republishes_matching_class() {
        let (broker, blocked) = setup();
        blocked.block(blocked_eval("e1", "j1", 7, 10));
        assert_eq!(blocked.stats().total_blocked, 1);

        blocked.unblock(7, 25);
        assert_eq!(blocked.stats().total_blocked, 0);

        let (eval, _, wait_index) = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(100))
            .await
            .unwrap()
            .expect("republished");
        assert_eq!(eval.id, "e1");
        // The republished eval carries the unblock index as its snapshot
        // index; the broker wait index is the modify index.
        assert_eq!(eval.snapshot_index, 25);
        assert_eq!(wait_index, 10);
    }

    #[tokio::test]
    async fn unblock_other_class_is_ignored() {
        let (broker, blocked) = setup();
        blocked.block(blocked_eval("e1", "j1", 7, 10));
        blocked.unblock(8, 25);
        assert_eq!(blocked.stats().total_blocked, 1);
        assert_eq!(dequeue_id(&broker).await, None);
    }

    #[tokio::test]
    async fn escaped_evals_unblock_on_any_change() {
        let (broker, blocked) = setup();
        let mut e = blocked_eval("e1", "j1", 0, 10);
        e.escaped_computation = true;
        blocked.block(e);

        // A class the eval knows nothing about still releases it.
        blocked.unblock(1234, 30);
        assert_eq!(dequeue_id(&broker).await, Some("e1".to_string()));
    }

    #[tokio::test]
    async fn newer_eval_displaces_older_for_same_job() {
        let (_broker, blocked) = setup();
        blocked.block(blocked_eval("old", "j1", 7, 10));
        blocked.block(blocked_eval("new", "j1", 7, 20));

        assert_eq!(blocked.stats().total_blocked, 1);
        let dups = blocked.drain_duplicates();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].id, "old");
    }

    #[tokio::test]
    async fn stale_eval_does_not_displace_newer() {
        let (_broker, blocked) = setup();
        blocked.block(blocked_eval("new", "j1", 7, 20));
        blocked.block(blocked_eval("old", "j1", 7, 10));

        let dups = blocked.drain_duplicates();
        assert_eq!(dups[0].id, "old");
    }

    #[tokio::test]
    async fn untrack_purges_job() {
        let (broker, blocked) = setup();
        blocked.block(blocked_eval("e1", "j1", 7, 10));
        blocked.untrack("default", "j1");
        assert_eq!(blocked.stats().total_blocked, 0);

        blocked.unblock(7, 25);
        assert_eq!(dequeue_id(&broker).await, None);
    }

    #[tokio::test]
    async fn unblock_node_releases_node_keyed_eval() {
        let (broker, blocked) = setup();
        let mut e = blocked_eval("e1", "j1", 7, 10);
        e.node_id = "node-1".to_string();
        blocked.block(e);

        blocked.unblock_node("node-2", 20);
        assert_eq!(blocked.stats().total_blocked, 1);

        blocked.unblock_node("node-1", 21);
        assert_eq!(dequeue_id(&broker).await, Some("e1".to_string()));
    }

    #[tokio::test]
    async fn quota_unblock() {
        let (broker, blocked) = setup();
        let mut e = blocked_eval("e1", "j1", 7, 10);
        e.quota_limit = "dev-quota".to_string();
        blocked.block(e);

        blocked.unblock_quota("prod-quota", 20);
        assert_eq!(blocked.stats().total_blocked, 1);
        blocked.unblock_quota("dev-quota", 21);
        assert_eq!(dequeue_id(&broker).await, Some("e1".to_string()));
    }

    #[tokio::test]
    async fn disabled_tracker_drops_blocks() {
        let (_broker, blocked) = setup();
        blocked.set_enabled(false);
        blocked.block(blocked_eval("e1", "j1", 7, 10));
        assert_eq!(blocked.stats().total_blocked, 0);
    }
}
