//! Evaluation broker: the pending-work queue between the FSM and the
//! scheduler workers.
//!
//! Evals are partitioned by scheduler name and ordered by priority (ties
//! broken oldest-first). A dequeue moves the eval into an unacked lease
//! identified by a token; Ack retires it, Nack re-enqueues it after an
//! exponential delay (a small initial, a much larger subsequent). A per-eval
//! delivery counter caps total deliveries; at the limit the eval is failed
//! out through the `failed` channel and the leader writes the failure plus a
//! follow-up eval to state.
//!
//! Serial-jobs rule: at most one eval per (namespace, job) is ever ready or
//! unacked. Later evals for the same job wait in a per-job queue in
//! create-index order and are released one at a time as their predecessors
//! retire. This prevents out-of-order scheduling on a single job.
//!
//! The broker is only active on the leader. Disabling it drops every queue;
//! the state store still holds the evals and the next leader re-enqueues
//! them during leadership establishment.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::errors::RpcError;
use crate::metrics;
use crate::structs::Evaluation;

/// Bumped whenever the scheduler contract changes incompatibly; dequeuers
/// present theirs and are rejected on mismatch so mixed fleets fail loudly.
pub const SCHEDULER_VERSION: u64 = 1;

type JobKey = (String, String);

/// Heap entry: priority first, then oldest create index.
struct ReadyEval {
    eval: Evaluation,
}

impl PartialEq for ReadyEval {
    fn eq(&self, other: &Self) -> bool {
        self.eval.priority == other.eval.priority
            && self.eval.create_index == other.eval.create_index
    }
}
impl Eq for ReadyEval {}
impl PartialOrd for ReadyEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyEval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.eval
            .priority
            .cmp(&other.eval.priority)
            .then_with(|| other.eval.create_index.cmp(&self.eval.create_index))
    }
}

struct UnackedEval {
    eval: Evaluation,
    token: String,
    /// Total deliveries so far, this lease included.
    deliveries: u32,
}

#[derive(Default)]
struct BrokerInner {
    enabled: bool,
    /// Ready heaps by scheduler name.
    ready: HashMap<String, BinaryHeap<ReadyEval>>,
    unacked: HashMap<String, UnackedEval>,
    /// Evals held back by the serial-jobs rule, per job, by create index.
    job_waiting: HashMap<JobKey, BTreeMap<u64, Evaluation>>,
    /// The eval currently ready or unacked for each job.
    job_active: HashMap<JobKey, String>,
    /// Evals whose `wait_until` has not arrived, by eval id.
    time_waiting: HashMap<String, Evaluation>,
    /// Nacked evals sitting out their reenqueue delay.
    delayed: HashSet<String>,
    /// Delivery counts survive requeues so the limit is cumulative.
    deliveries: HashMap<String, u32>,
}

impl BrokerInner {
    fn eval_known(&self, id: &str) -> bool {
        self.unacked.contains_key(id)
            || self.time_waiting.contains_key(id)
            || self.delayed.contains(id)
            || self
                .ready
                .values()
                .any(|h| h.iter().any(|r| r.eval.id == id))
            || self
                .job_waiting
                .values()
                .any(|q| q.values().any(|e| e.id == id))
    }

    fn push_ready(&mut self, eval: Evaluation) {
        self.ready
            .entry(eval.eval_type.clone())
            .or_default()
            .push(ReadyEval { eval });
    }

    /// Retire a job's active eval and promote its oldest waiter.
    fn release_job(&mut self, key: &JobKey) -> Option<Evaluation> {
        self.job_active.remove(key);
        let queue = self.job_waiting.get_mut(key)?;
        let (_, next) = queue.pop_first()?;
        if queue.is_empty() {
            self.job_waiting.remove(key);
        }
        self.job_active.insert(key.clone(), next.id.clone());
        Some(next)
    }
}

/// Queue statistics reported to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_unacked: usize,
    pub total_waiting: usize,
    pub total_job_held: usize,
    pub by_scheduler: HashMap<String, usize>,
}

pub struct EvalBroker {
    /// Back-reference for the timers this broker spawns on itself.
    weak: std::sync::Weak<EvalBroker>,
    inner: Mutex<BrokerInner>,
    wakeup: Notify,
    failed_tx: mpsc::UnboundedSender<Evaluation>,
    nack_timeout: Duration,
    delivery_limit: u32,
    initial_reenqueue_delay: Duration,
    subsequent_reenqueue_delay: Duration,
}

impl EvalBroker {
    /// Returns the broker and the channel of evals that exhausted their
    /// delivery limit; the leader loop turns each into a failed status plus
    /// a follow-up eval in state.
    pub fn new(config: &ServerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Evaluation>) {
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let broker = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            inner: Mutex::new(BrokerInner::default()),
            wakeup: Notify::new(),
            failed_tx,
            nack_timeout: config.eval_nack_timeout,
            delivery_limit: config.eval_delivery_limit,
            initial_reenqueue_delay: config.eval_nack_initial_reenqueue_delay,
            subsequent_reenqueue_delay: config.eval_nack_subsequent_reenqueue_delay,
        });
        (broker, failed_rx)
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("broker alive while borrowed")
    }

    pub fn enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Enable on leadership gain; disable drops every queue (the unacked
    /// leases implicitly revert: their evals are still pending in state and
    /// the next leader re-enqueues them).
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;
        if !enabled {
            *inner = BrokerInner::default();
        }
        drop(inner);
        self.wakeup.notify_waiters();
    }

    /// Add a pending eval. Duplicates (by id) and non-pending evals are
    /// ignored, which makes FSM replay idempotent.
    pub fn enqueue(&self, eval: Evaluation) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled || !eval.should_enqueue() || inner.eval_known(&eval.id) {
            return;
        }
        metrics::EVAL_ENQUEUES.inc();

        if eval.wait_until > crate::structs::now_millis() {
            let delay = Duration::from_millis(
                (eval.wait_until - crate::structs::now_millis()).max(0) as u64,
            );
            inner.time_waiting.insert(eval.id.clone(), eval.clone());
            drop(inner);
            let broker = self.arc();
            let id = eval.id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                broker.promote_waiting(&id);
            });
            return;
        }

        Self::enqueue_locked(&mut inner, eval);
        drop(inner);
        self.wakeup.notify_waiters();
    }

    fn enqueue_locked(inner: &mut BrokerInner, eval: Evaluation) {
        let key = (eval.namespace.clone(), eval.job_id.clone());
        match inner.job_active.get(&key) {
            // Serial-jobs rule: an older eval is in flight, hold this one.
            Some(active) if *active != eval.id => {
                inner
                    .job_waiting
                    .entry(key)
                    .or_default()
                    .insert(eval.create_index, eval);
            }
            _ => {
                inner.job_active.insert(key, eval.id.clone());
                inner.push_ready(eval);
            }
        }
    }

    fn promote_waiting(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(eval) = inner.time_waiting.remove(id) {
            Self::enqueue_locked(&mut inner, eval);
            drop(inner);
            self.wakeup.notify_waiters();
        }
    }

    /// Dequeue the highest-priority eval for any of `schedulers`, blocking
    /// up to `timeout`. Returns `(eval, token, wait_index)`; the wait index
    /// is the eval's modify index at enqueue, the store index a worker must
    /// observe before scheduling it.
    pub async fn dequeue(
        &self,
        schedulers: &[String],
        scheduler_version: u64,
        timeout: Duration,
    ) -> Result<Option<(Evaluation, String, u64)>, RpcError> {
        if scheduler_version != SCHEDULER_VERSION {
            return Err(RpcError::VersionMismatch(format!(
                "scheduler version {} does not match broker version {}",
                scheduler_version, SCHEDULER_VERSION
            )));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before the check so an enqueue landing
            // in between is not lost.
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.enabled {
                    return Err(RpcError::BrokerDisabled);
                }
                if let Some(out) = self.try_dequeue_locked(&mut inner, schedulers) {
                    return Ok(Some(out));
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn try_dequeue_locked(
        &self,
        inner: &mut BrokerInner,
        schedulers: &[String],
    ) -> Option<(Evaluation, String, u64)> {
        // Pick the best head across the requested schedulers.
        let best = schedulers
            .iter()
            .filter_map(|s| {
                let heap = inner.ready.get(s)?;
                let head = heap.peek()?;
                Some((s.clone(), head.eval.priority, head.eval.create_index))
            })
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)))?;

        let eval = inner.ready.get_mut(&best.0)?.pop()?.eval;
        let token = crate::structs::generate_id();
        let deliveries = {
            let d = inner.deliveries.entry(eval.id.clone()).or_insert(0);
            *d += 1;
            *d
        };
        let wait_index = eval.modify_index;
        inner.unacked.insert(
            eval.id.clone(),
            UnackedEval {
                eval: eval.clone(),
                token: token.clone(),
                deliveries,
            },
        );
        metrics::EVAL_DEQUEUES.inc();
        Some((eval, token, wait_index))
    }

    /// Spawn the visibility timer for a lease. If the worker neither acks
    /// nor nacks within the timeout, the lease is nacked on its behalf.
    pub fn start_nack_timer(&self, eval_id: String, token: String) {
        let broker = self.arc();
        let timeout = self.nack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_held = {
                let inner = broker.inner.lock().unwrap();
                inner
                    .unacked
                    .get(&eval_id)
                    .map(|u| u.token == token)
                    .unwrap_or(false)
            };
            if still_held {
                warn!(eval_id = %eval_id, "eval lease expired, nacking");
                let _ = broker.nack(&eval_id, &token);
            }
        });
    }

    /// Retire a lease. Returns the eval so the caller can untrack its
    /// blocked siblings and write the terminal status to state.
    pub fn ack(&self, eval_id: &str, token: &str) -> Result<Evaluation, RpcError> {
        let mut inner = self.inner.lock().unwrap();
        let unacked = self.take_lease(&mut inner, eval_id, token)?;
        inner.deliveries.remove(eval_id);
        let key = (unacked.eval.namespace.clone(), unacked.eval.job_id.clone());
        let released = inner.release_job(&key);
        drop(inner);
        metrics::EVAL_ACKS.inc();
        if released.is_some() {
            self.wakeup.notify_waiters();
        }
        Ok(unacked.eval)
    }

    /// Return a lease to the queue. Applies the reenqueue delay and, past
    /// the delivery limit, fails the eval out instead.
    pub fn nack(&self, eval_id: &str, token: &str) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        let unacked = self.take_lease(&mut inner, eval_id, token)?;
        metrics::EVAL_NACKS.inc();

        if unacked.deliveries >= self.delivery_limit {
            debug!(
                eval_id = %eval_id,
                deliveries = unacked.deliveries,
                "eval exhausted delivery limit, failing out"
            );
            inner.deliveries.remove(eval_id);
            let key = (unacked.eval.namespace.clone(), unacked.eval.job_id.clone());
            let released = inner.release_job(&key);
            drop(inner);
            if released.is_some() {
                self.wakeup.notify_waiters();
            }
            let _ = self.failed_tx.send(unacked.eval);
            return Ok(());
        }

        // First nack gets the short delay, every later one the long delay.
        let delay = if unacked.deliveries <= 1 {
            self.initial_reenqueue_delay
        } else {
            self.subsequent_reenqueue_delay
        };
        inner.delayed.insert(eval_id.to_string());
        drop(inner);

        let broker = self.arc();
        let eval = unacked.eval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = broker.inner.lock().unwrap();
            if inner.delayed.remove(&eval.id) && inner.enabled {
                inner.push_ready(eval);
                drop(inner);
                broker.wakeup.notify_waiters();
            }
        });
        Ok(())
    }

    fn take_lease(
        &self,
        inner: &mut BrokerInner,
        eval_id: &str,
        token: &str,
    ) -> Result<UnackedEval, RpcError> {
        match inner.unacked.get(eval_id) {
            None => Err(RpcError::UnknownEval(eval_id.to_string())),
            Some(u) if u.token != token => Err(RpcError::VersionMismatch(format!(
                "token does not match lease for eval {}",
                eval_id
            ))),
            Some(_) => Ok(inner.unacked.remove(eval_id).expect("checked above")),
        }
    }

    pub fn stats(&self) -> BrokerStats {
        let inner = self.inner.lock().unwrap();
        let mut by_scheduler = HashMap::new();
        let mut total_ready = 0;
        for (s, heap) in &inner.ready {
            by_scheduler.insert(s.clone(), heap.len());
            total_ready += heap.len();
        }
        BrokerStats {
            total_ready,
            total_unacked: inner.unacked.len(),
            total_waiting: inner.time_waiting.len() + inner.delayed.len(),
            total_job_held: inner.job_waiting.values().map(BTreeMap::len).sum(),
            by_scheduler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{Evaluation, TRIGGER_JOB_REGISTER};

    fn broker() -> (Arc<EvalBroker>, mpsc::UnboundedReceiver<Evaluation>) {
        let (b, rx) = EvalBroker::new(&ServerConfig::for_testing());
        b.set_enabled(true);
        (b, rx)
    }

    fn eval(id: &str, job: &str, priority: i32, modify_index: u64) -> Evaluation {
        let mut e = Evaluation::new("default", job, "service", priority, TRIGGER_JOB_REGISTER);
        e.id = id.to_string();
        e.create_index = modify_index;
        e.modify_index = modify_index;
        e
    }

    #[tokio::test]
    async fn single_eval_lifecycle() {
        // Seed scenario S1: enqueue, dequeue, ack.
        let (broker, _rx) = broker();
        broker.enqueue(eval("e1", "j1", 50, 10));

        let (e, token, wait_index) = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(50))
            .await
            .unwrap()
            .expect("eval available");
        assert_eq!(e.id, "e1");
        assert!(!token.is_empty());
        assert_eq!(wait_index, 10);

        broker.ack("e1", &token).unwrap();
        let stats = broker.stats();
        assert_eq!(stats.total_ready, 0);
        assert_eq!(stats.total_unacked, 0);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let (broker, _rx) = broker();
        let out = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn wrong_scheduler_version_is_explicit_error() {
        let (broker, _rx) = broker();
        let err = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION + 1, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::VersionMismatch(_)));
    }

    #[tokio::test]
    async fn disabled_broker_rejects_dequeue_and_drops_enqueues() {
        let (broker, _rx) = broker();
        broker.set_enabled(false);
        broker.enqueue(eval("e1", "j1", 50, 10));
        assert_eq!(broker.stats().total_ready, 0);
        let err = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::BrokerDisabled);
    }

    #[tokio::test]
    async fn priority_order_wins_then_fifo() {
        let (broker, _rx) = broker();
        broker.enqueue(eval("low", "j1", 10, 1));
        broker.enqueue(eval("high", "j2", 90, 2));
        broker.enqueue(eval("mid", "j3", 50, 3));

        let mut order = Vec::new();
        for _ in 0..3 {
            let (e, token, _) = broker
                .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(50))
                .await
                .unwrap()
                .unwrap();
            broker.ack(&e.id, &token).unwrap();
            order.push(e.id);
        }
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn nack_redelivers_until_limit_then_fails_out() {
        // Seed scenario S2: delivery limit 3, then a follow-up is emitted.
        let (broker, mut failed_rx) = broker();
        broker.enqueue(eval("e1", "j1", 50, 10));

        for _ in 0..3 {
            let (e, token, _) = broker
                .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(200))
                .await
                .unwrap()
                .expect("redelivered");
            assert_eq!(e.id, "e1");
            broker.nack("e1", &token).unwrap();
        }

        // Third nack exhausted the limit: e1 leaves the queues entirely.
        let out = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.is_none());

        let failed = failed_rx.recv().await.expect("failed eval emitted");
        assert_eq!(failed.id, "e1");
    }

    #[tokio::test]
    async fn serial_jobs_rule() {
        // Seed scenario S3: same job delivers strictly in order.
        let (broker, _rx) = broker();
        broker.enqueue(eval("e1", "j", 50, 1000));
        broker.enqueue(eval("e2", "j", 50, 2000));

        let (first, token1, wait1) = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, "e1");
        assert_eq!(wait1, 1000);

        // While e1 is unacked, e2 must not be delivered.
        let held = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(held.is_none());
        assert_eq!(broker.stats().total_job_held, 1);

        broker.ack("e1", &token1).unwrap();
        let (second, _token2, wait2) = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(50))
            .await
            .unwrap()
            .expect("e2 released");
        assert_eq!(second.id, "e2");
        assert_eq!(wait2, 2000);
    }

    #[tokio::test]
    async fn ack_with_wrong_token_is_rejected() {
        let (broker, _rx) = broker();
        broker.enqueue(eval("e1", "j1", 50, 10));
        let (_, _token, _) = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let err = broker.ack("e1", "bogus-token").unwrap_err();
        assert!(matches!(err, RpcError::VersionMismatch(_)));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_idempotent() {
        let (broker, _rx) = broker();
        broker.enqueue(eval("e1", "j1", 50, 10));
        broker.enqueue(eval("e1", "j1", 50, 10));
        assert_eq!(broker.stats().total_ready, 1);
    }

    #[tokio::test]
    async fn scheduler_filter_is_respected() {
        let (broker, _rx) = broker();
        let mut e = eval("e1", "j1", 50, 10);
        e.eval_type = "batch".into();
        broker.enqueue(e);

        let out = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(out.is_none());

        let out = broker
            .dequeue(
                &["service".into(), "batch".into()],
                SCHEDULER_VERSION,
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(out.unwrap().0.id, "e1");
    }

    #[tokio::test]
    async fn wait_until_defers_delivery() {
        let (broker, _rx) = broker();
        let mut e = eval("e1", "j1", 50, 10);
        e.wait_until = crate::structs::now_millis() + 40;
        broker.enqueue(e);

        let early = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(early.is_none());

        let late = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(late.unwrap().0.id, "e1");
    }

    #[tokio::test]
    async fn lease_expiry_auto_nacks() {
        let (broker, _rx) = broker();
        broker.enqueue(eval("e1", "j1", 50, 10));
        let (_, token, _) = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        broker.start_nack_timer("e1".into(), token);

        // The testing nack timeout is 200ms and the initial reenqueue delay
        // 5ms; the eval must come back without an explicit nack.
        let redelivered = broker
            .dequeue(&["service".into()], SCHEDULER_VERSION, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(redelivered.unwrap().0.id, "e1");
    }
}
