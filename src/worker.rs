//! Scheduler workers: the pool that turns pending evaluations into plans.
//!
//! Each worker loops dequeue → wait-for-index → schedule → ack/nack. The
//! wait step blocks until the local state store has applied the eval's wait
//! index, which is what lets followers participate safely: a worker only
//! schedules on snapshots that contain the eval's cause. On wait timeout
//! the eval is nacked and the sync limit widens 10x for one attempt; if the
//! store is still behind, the worker logs and moves on.
//!
//! Worker status follows strict transitions
//! (Starting→Started→(Pausing→Paused→Resuming→Started)*→Stopping→Stopped)
//! with cooperative pause at the safe point before dequeue. Workload status
//! is reported separately so operators can tell "paused by operator" from
//! "backing off" from "waiting for raft".

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{EvalBroker, SCHEDULER_VERSION};
use crate::errors::RpcError;
use crate::fsm::{
    AppliedResponse, DeploymentDeleteRequest, EvalDeleteRequest, EvalUpdateRequest,
    JobDeregisterRequest, MessageType, NodeDeregisterRequest,
};
use crate::scheduler::{new_scheduler, Planner};
use crate::state_store::StateSnapshot;
use crate::structs::{Evaluation, Plan, PlanResult};

/// Fast backoff for transient dequeue errors.
const BACKOFF_BASELINE_FAST: Duration = Duration::from_millis(20);
/// Slow baseline used after a scheduler-version mismatch and for raft
/// proposal retries.
const BACKOFF_BASELINE_SLOW: Duration = Duration::from_millis(500);
/// Upper bound on every backoff.
const BACKOFF_LIMIT_SLOW: Duration = Duration::from_secs(10);
/// How long one dequeue blocks before looping to the pause point.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
/// Base limit on waiting for the store to reach an eval's wait index.
const RAFT_SYNC_LIMIT: Duration = Duration::from_secs(5);
/// Bounded attempts for leader-transient raft proposals.
const MAX_PROPOSE_ATTEMPTS: usize = 8;

/// Clusters at or above this version normalize plans to id-only diffs.
const MIN_PLAN_NORMALIZE_VERSION: &str = "0.1.0";

// ── Capability interface ──────────────────────────────────────────────────────

/// What a worker needs from the server; a test can substitute a fake.
#[async_trait]
pub trait WorkerContext: Send + Sync + 'static {
    fn broker(&self) -> Arc<EvalBroker>;
    fn snapshot(&self) -> StateSnapshot;
    fn enabled_schedulers(&self) -> Vec<String>;
    async fn wait_for_index(&self, index: u64, timeout: Duration) -> Option<u64>;
    async fn raft_apply(
        &self,
        mt: MessageType,
        body: serde_json::Value,
    ) -> Result<AppliedResponse, RpcError>;
    async fn submit_plan(&self, plan: Plan) -> Result<PlanResult, RpcError>;
    fn servers_meet_minimum_version(&self, min_version: &str, include_failed: bool) -> bool;
}

// ── Worker status ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Started,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadStatus {
    Idle,
    Scheduling,
    WaitingForRaft,
    Backoff,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

/// Handle the server keeps per worker.
pub struct WorkerHandle {
    pub id: usize,
    control: watch::Sender<Control>,
    status: Arc<Mutex<WorkerStatus>>,
    workload: Arc<Mutex<WorkloadStatus>>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn pause(&self) {
        let _ = self.control.send(Control::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control.send(Control::Run);
    }

    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock().unwrap()
    }

    pub fn workload_status(&self) -> WorkloadStatus {
        *self.workload.lock().unwrap()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawn one worker task.
pub fn spawn_worker(id: usize, ctx: Arc<dyn WorkerContext>) -> WorkerHandle {
    let (control_tx, control_rx) = watch::channel(Control::Run);
    let status = Arc::new(Mutex::new(WorkerStatus::Starting));
    let workload = Arc::new(Mutex::new(WorkloadStatus::Idle));
    let worker = Worker {
        id,
        ctx,
        control: control_rx,
        status: status.clone(),
        workload: workload.clone(),
        sync_limit: RAFT_SYNC_LIMIT,
    };
    let join = tokio::spawn(worker.run());
    WorkerHandle {
        id,
        control: control_tx,
        status,
        workload,
        join,
    }
}

struct Worker {
    id: usize,
    ctx: Arc<dyn WorkerContext>,
    control: watch::Receiver<Control>,
    status: Arc<Mutex<WorkerStatus>>,
    workload: Arc<Mutex<WorkloadStatus>>,
    /// Widened 10x after a sync timeout, restored after a success.
    sync_limit: Duration,
}

impl Worker {
    fn set_status(&self, s: WorkerStatus) {
        *self.status.lock().unwrap() = s;
    }

    fn set_workload(&self, s: WorkloadStatus) {
        *self.workload.lock().unwrap() = s;
    }

    async fn run(mut self) {
        info!(worker_id = self.id, "scheduler worker starting");
        self.set_status(WorkerStatus::Started);

        let schedulers = self.ctx.enabled_schedulers();
        let mut backoff = BACKOFF_BASELINE_FAST;
        let mut baseline = BACKOFF_BASELINE_FAST;

        loop {
            // Cooperative pause/stop point, before dequeue only.
            let control = *self.control.borrow();
            match control {
                Control::Stop => break,
                Control::Pause => {
                    self.set_status(WorkerStatus::Pausing);
                    self.set_status(WorkerStatus::Paused);
                    self.set_workload(WorkloadStatus::Paused);
                    let resumed = self.wait_while_paused().await;
                    if !resumed {
                        break;
                    }
                    self.set_status(WorkerStatus::Resuming);
                    self.set_status(WorkerStatus::Started);
                }
                Control::Run => {}
            }

            self.set_workload(WorkloadStatus::Idle);
            let dequeued = self
                .ctx
                .broker()
                .dequeue(&schedulers, SCHEDULER_VERSION, DEQUEUE_TIMEOUT)
                .await;

            let (eval, token, wait_index) = match dequeued {
                Ok(Some(out)) => out,
                Ok(None) => continue,
                Err(err) => {
                    if matches!(err, RpcError::VersionMismatch(_)) {
                        // A mixed-version fleet; widen the baseline so this
                        // worker stops hammering the broker.
                        baseline = BACKOFF_BASELINE_SLOW;
                    }
                    self.set_workload(WorkloadStatus::Backoff);
                    debug!(worker_id = self.id, error = %err, backoff_ms = backoff.as_millis() as u64, "dequeue failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_LIMIT_SLOW).max(baseline);
                    continue;
                }
            };
            backoff = baseline;

            self.ctx
                .broker()
                .start_nack_timer(eval.id.clone(), token.clone());

            if !self.wait_for_eval_index(&eval, &token, wait_index).await {
                continue;
            }

            self.set_workload(WorkloadStatus::Scheduling);
            match self.invoke_scheduler(&eval, &token).await {
                Ok(()) => {
                    if let Err(e) = self.ctx.broker().ack(&eval.id, &token) {
                        warn!(worker_id = self.id, eval_id = %eval.id, error = %e, "ack failed");
                    }
                }
                Err(e) => {
                    error!(worker_id = self.id, eval_id = %eval.id, error = %e, "scheduling failed, nacking");
                    let _ = self.ctx.broker().nack(&eval.id, &token);
                }
            }
        }

        self.set_status(WorkerStatus::Stopping);
        self.set_status(WorkerStatus::Stopped);
        info!(worker_id = self.id, "scheduler worker stopped");
    }

    /// Park until resumed. Returns false when stopped instead.
    async fn wait_while_paused(&mut self) -> bool {
        loop {
            if self.control.changed().await.is_err() {
                return false;
            }
            let control = *self.control.borrow();
            match control {
                Control::Run => return true,
                Control::Stop => return false,
                Control::Pause => {}
            }
        }
    }

    /// Block until the store contains the eval's cause. On timeout, nack
    /// and widen the sync limit once; a second failure logs and resets.
    async fn wait_for_eval_index(&mut self, eval: &Evaluation, token: &str, wait_index: u64) -> bool {
        if wait_index == 0 {
            return true;
        }
        self.set_workload(WorkloadStatus::WaitingForRaft);
        match self.ctx.wait_for_index(wait_index, self.sync_limit).await {
            Some(_) => {
                self.sync_limit = RAFT_SYNC_LIMIT;
                true
            }
            None => {
                if self.sync_limit == RAFT_SYNC_LIMIT {
                    self.sync_limit = RAFT_SYNC_LIMIT * 10;
                    warn!(
                        worker_id = self.id,
                        eval_id = %eval.id,
                        wait_index,
                        "state store behind eval, widening sync limit"
                    );
                } else {
                    error!(
                        worker_id = self.id,
                        eval_id = %eval.id,
                        wait_index,
                        "state store still behind eval after widened limit"
                    );
                    self.sync_limit = RAFT_SYNC_LIMIT;
                }
                let _ = self.ctx.broker().nack(&eval.id, token);
                false
            }
        }
    }

    async fn invoke_scheduler(&self, eval: &Evaluation, token: &str) -> Result<(), RpcError> {
        let snapshot = self.ctx.snapshot();
        let planner: Arc<dyn Planner> = Arc::new(WorkerPlanner {
            ctx: self.ctx.clone(),
            eval_token: token.to_string(),
            snapshot_index: snapshot.latest_index(),
        });
        let mut scheduler = new_scheduler(&eval.eval_type, snapshot, planner)?;
        scheduler.process(eval).await
    }
}

// ── Planner implementation ────────────────────────────────────────────────────

/// The worker acting as the scheduler's back-interface. One instance per
/// dequeued eval: it pins the eval token and the snapshot index.
pub struct WorkerPlanner {
    ctx: Arc<dyn WorkerContext>,
    eval_token: String,
    snapshot_index: u64,
}

impl WorkerPlanner {
    /// Retry loop for leader-transient failures; every other error
    /// surfaces immediately.
    async fn with_leader_retries<T, F, Fut>(&self, mut call: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let mut backoff = BACKOFF_BASELINE_SLOW;
        for attempt in 0..MAX_PROPOSE_ATTEMPTS {
            match call().await {
                Ok(out) => return Ok(out),
                Err(e @ (RpcError::NoLeader | RpcError::PlanQueueDisabled)) => {
                    debug!(attempt, error = %e, "leader unavailable, retrying proposal");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_LIMIT_SLOW);
                }
                Err(other) => return Err(other),
            }
        }
        Err(RpcError::NoLeader)
    }

    async fn apply_evals(&self, evals: Vec<Evaluation>) -> Result<(), RpcError> {
        let body = serde_json::to_value(EvalUpdateRequest { evals })
            .map_err(|e| RpcError::Validation(e.to_string()))?;
        self.with_leader_retries(|| async {
            let resp = self
                .ctx
                .raft_apply(MessageType::EvalUpdate, body.clone())
                .await?;
            match resp.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
    }
}

#[async_trait]
impl Planner for WorkerPlanner {
    async fn submit_plan(
        &self,
        mut plan: Plan,
    ) -> Result<(PlanResult, Option<StateSnapshot>), RpcError> {
        plan.eval_token = self.eval_token.clone();
        plan.snapshot_index = self.snapshot_index;
        plan.normalized = self
            .ctx
            .servers_meet_minimum_version(MIN_PLAN_NORMALIZE_VERSION, true);

        let result = self
            .with_leader_retries(|| {
                let plan = plan.clone();
                async { self.ctx.submit_plan(plan).await }
            })
            .await?;

        // A refresh request means the state moved underneath the plan;
        // hand the scheduler a snapshot that contains the refresh index.
        let refreshed = if result.refresh_index > 0 {
            self.ctx
                .wait_for_index(result.refresh_index, RAFT_SYNC_LIMIT)
                .await;
            Some(self.ctx.snapshot())
        } else {
            None
        };
        Ok((result, refreshed))
    }

    async fn update_eval(&self, eval: Evaluation) -> Result<(), RpcError> {
        self.apply_evals(vec![eval]).await
    }

    async fn create_eval(&self, eval: Evaluation) -> Result<(), RpcError> {
        self.apply_evals(vec![eval]).await
    }

    async fn reblock_eval(&self, eval: Evaluation) -> Result<(), RpcError> {
        self.apply_evals(vec![eval]).await
    }

    async fn reap(&self, eval_ids: Vec<String>, alloc_ids: Vec<String>) -> Result<(), RpcError> {
        let body = serde_json::to_value(EvalDeleteRequest {
            eval_ids,
            alloc_ids,
        })
        .map_err(|e| RpcError::Validation(e.to_string()))?;
        self.with_leader_retries(|| async {
            let resp = self
                .ctx
                .raft_apply(MessageType::EvalDelete, body.clone())
                .await?;
            match resp.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
    }

    async fn deregister_nodes(&self, node_ids: Vec<String>) -> Result<(), RpcError> {
        let body = serde_json::to_value(NodeDeregisterRequest {
            node_ids,
            evals: vec![],
        })
        .map_err(|e| RpcError::Validation(e.to_string()))?;
        self.with_leader_retries(|| async {
            let resp = self
                .ctx
                .raft_apply(MessageType::NodeDeregister, body.clone())
                .await?;
            match resp.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
    }

    async fn purge_jobs(&self, jobs: Vec<(String, String)>) -> Result<(), RpcError> {
        for (namespace, job_id) in jobs {
            let body = serde_json::to_value(JobDeregisterRequest {
                namespace,
                job_id,
                purge: true,
                eval: None,
            })
            .map_err(|e| RpcError::Validation(e.to_string()))?;
            self.with_leader_retries(|| async {
                let resp = self
                    .ctx
                    .raft_apply(MessageType::JobDeregister, body.clone())
                    .await?;
                match resp.error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn delete_deployments(&self, deployment_ids: Vec<String>) -> Result<(), RpcError> {
        let body = serde_json::to_value(DeploymentDeleteRequest { deployment_ids })
            .map_err(|e| RpcError::Validation(e.to_string()))?;
        self.with_leader_retries(|| async {
            let resp = self
                .ctx
                .raft_apply(MessageType::DeploymentDelete, body.clone())
                .await?;
            match resp.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
    }

    fn servers_meet_minimum_version(&self, min_version: &str, include_failed: bool) -> bool {
        self.ctx
            .servers_meet_minimum_version(min_version, include_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{EvalStatus, DEFAULT_NAMESPACE, TRIGGER_JOB_REGISTER};
    use crate::test_util::{test_job, LocalHarness};

    #[tokio::test]
    async fn worker_schedules_and_acks() {
        let harness = LocalHarness::new();
        harness.become_leader();
        let node = crate::test_util::test_node();
        harness.register_node(node);
        harness.register_job(test_job("web"), true);

        let handle = spawn_worker(0, harness.clone());
        // The FSM enqueued the job-register eval; the worker should drain
        // it and write the complete status plus the placement.
        harness
            .wait_until(
                || {
                    let snap = harness.snapshot();
                    snap.allocs().count() == 1
                        && snap
                            .evals()
                            .all(|e| e.status == EvalStatus::Complete)
                },
                Duration::from_secs(5),
            )
            .await;

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn worker_pause_resume_stop_transitions() {
        let harness = LocalHarness::new();
        harness.become_leader();
        let handle = spawn_worker(0, harness.clone());

        // Let the worker reach the loop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status(), WorkerStatus::Started);

        handle.pause();
        harness
            .wait_until(
                || handle.status() == WorkerStatus::Paused,
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(handle.workload_status(), WorkloadStatus::Paused);

        handle.resume();
        harness
            .wait_until(
                || handle.status() == WorkerStatus::Started,
                Duration::from_secs(2),
            )
            .await;

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn paused_worker_does_not_dequeue() {
        let harness = LocalHarness::new();
        harness.become_leader();
        let handle = spawn_worker(0, harness.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.pause();
        harness
            .wait_until(
                || handle.status() == WorkerStatus::Paused,
                Duration::from_secs(2),
            )
            .await;

        // Work arriving while paused stays in the broker.
        let mut eval =
            crate::structs::Evaluation::new(DEFAULT_NAMESPACE, "web", "service", 50, TRIGGER_JOB_REGISTER);
        eval.id = "held".into();
        harness.broker().enqueue(eval);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(harness.broker().stats().total_ready, 1);

        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn stopped_worker_reports_stopped() {
        let harness = LocalHarness::new();
        harness.become_leader();
        let handle = spawn_worker(3, harness.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        harness
            .wait_until(
                || handle.status() == WorkerStatus::Stopped,
                Duration::from_secs(2),
            )
            .await;
    }
}
