//! Leader-side plan application pipeline.
//!
//! Workers submit plans into a queue consumed by exactly one task on the
//! leader. Each plan is validated against a live snapshot: per node, the
//! node must still exist, be ready and eligible, the allocations the plan
//! claims must still be valid, and capacity must cover the new placements.
//! Nodes that fail are stripped from the plan and the result carries a
//! refresh index so the scheduler replans the remainder against fresher
//! state. Whatever survives is committed through Raft in one atomic
//! apply-plan-results command.
//!
//! Only one plan is in flight through Raft at a time, which keeps
//! alloc-index assignment contiguous and globally ordered. A plan that
//! still commits something alongside a non-zero refresh index is committed
//! partially; this is uniform at the only call site (`evaluate_plan`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info};

use crate::errors::RpcError;
use crate::fsm::{AppliedResponse, ApplyPlanResultsRequest, MessageType};
use crate::metrics;
use crate::state_store::{StateSnapshot, StateStore};
use crate::structs::*;

/// Bound on concurrent per-node fit checks; the checks are CPU-bound.
const NODE_CHECK_CONCURRENCY: usize = 8;

/// Minimal Raft capability the applier needs from the server.
#[async_trait]
pub trait RaftProposer: Send + Sync {
    async fn propose(
        &self,
        mt: MessageType,
        body: serde_json::Value,
    ) -> Result<AppliedResponse, RpcError>;
}

/// One queued submission.
pub struct PlanRequest {
    pub plan: Plan,
    pub reply: oneshot::Sender<Result<PlanResult, RpcError>>,
}

/// Cloneable handle workers submit through. Disabled off-leader.
#[derive(Clone)]
pub struct PlanQueue {
    tx: Arc<std::sync::Mutex<Option<mpsc::Sender<PlanRequest>>>>,
}

impl Default for PlanQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanQueue {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.tx.lock().unwrap().is_some()
    }

    /// Install the sender half on leadership gain.
    pub fn enable(&self) -> mpsc::Receiver<PlanRequest> {
        let (tx, rx) = mpsc::channel(64);
        *self.tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Drop the sender on leadership loss; queued submitters get a closed
    /// channel and report the queue as disabled.
    pub fn disable(&self) {
        *self.tx.lock().unwrap() = None;
    }

    pub async fn submit(&self, plan: Plan) -> Result<PlanResult, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let tx = {
            let guard = self.tx.lock().unwrap();
            guard.clone().ok_or(RpcError::PlanQueueDisabled)?
        };
        tx.send(PlanRequest {
            plan,
            reply: reply_tx,
        })
        .await
        .map_err(|_| RpcError::PlanQueueDisabled)?;
        reply_rx.await.map_err(|_| RpcError::PlanQueueDisabled)?
    }
}

/// The validated form of a plan: what survived, and the refresh index (0
/// when every node passed).
pub struct EvaluatedPlan {
    pub plan: Plan,
    pub refresh_index: u64,
}

/// Validate `plan` against `snapshot`, stripping nodes that fail.
pub async fn evaluate_plan(snapshot: &StateSnapshot, plan: &Plan) -> EvaluatedPlan {
    let mut node_ids: Vec<String> = plan
        .node_allocation
        .keys()
        .chain(plan.node_update.keys())
        .chain(plan.node_preemptions.keys())
        .cloned()
        .collect();
    node_ids.sort();
    node_ids.dedup();

    // Fan the per-node checks out under a bounded pool.
    let sem = Arc::new(Semaphore::new(NODE_CHECK_CONCURRENCY));
    let mut tasks = tokio::task::JoinSet::new();
    for node_id in node_ids {
        let sem = sem.clone();
        let snapshot = snapshot.clone();
        let new_allocs = plan.node_allocation.get(&node_id).cloned().unwrap_or_default();
        let stops = plan.node_update.get(&node_id).cloned().unwrap_or_default();
        let preemptions = plan
            .node_preemptions
            .get(&node_id)
            .cloned()
            .unwrap_or_default();
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore open");
            let ok = node_fits(&snapshot, &node_id, &new_allocs, &stops, &preemptions);
            (node_id, ok)
        });
    }

    let mut failed: Vec<String> = Vec::new();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok((node_id, true)) => {
                debug!(node_id = %node_id, "plan node validated");
            }
            Ok((node_id, false)) => failed.push(node_id),
            Err(e) => {
                error!(error = %e, "plan validation task panicked");
            }
        }
    }

    if failed.is_empty() {
        return EvaluatedPlan {
            plan: plan.clone(),
            refresh_index: 0,
        };
    }

    let mut filtered = plan.clone();
    for node_id in &failed {
        filtered.node_allocation.remove(node_id);
        filtered.node_update.remove(node_id);
        filtered.node_preemptions.remove(node_id);
    }
    info!(
        eval_id = %plan.eval_id,
        failed_nodes = failed.len(),
        "plan partially rejected, requesting refresh"
    );
    EvaluatedPlan {
        plan: filtered,
        refresh_index: snapshot.latest_index(),
    }
}

/// The per-node fit check.
fn node_fits(
    snapshot: &StateSnapshot,
    node_id: &str,
    new_allocs: &[Allocation],
    stops: &[PlanAllocStop],
    preemptions: &[PlanPreemption],
) -> bool {
    let node = snapshot.node(node_id);

    // New placements need a live, eligible node. Stops and evictions do
    // not: winding down a dead node's allocs must always be possible.
    if !new_allocs.is_empty() {
        match &node {
            Some(n) if n.is_schedulable() => {}
            _ => return false,
        }
    }

    // Claimed allocations must still be valid: present, on this node, and
    // not already preempted by someone else.
    for stop in stops {
        match snapshot.alloc(&stop.alloc_id) {
            Some(a) if a.node_id == node_id => {}
            _ => return false,
        }
    }
    for preemption in preemptions {
        match snapshot.alloc(&preemption.alloc_id) {
            Some(a)
                if a.node_id == node_id
                    && (a.preempted_by_allocation.is_empty()
                        || a.preempted_by_allocation == preemption.preempted_by) => {}
            _ => return false,
        }
    }

    // Capacity: live usage minus what this plan releases, plus the new
    // placements, must fit the node.
    if new_allocs.is_empty() {
        return true;
    }
    let node = node.expect("checked above for placements");
    let releasing: std::collections::HashSet<&str> = stops
        .iter()
        .map(|s| s.alloc_id.as_str())
        .chain(preemptions.iter().map(|p| p.alloc_id.as_str()))
        .collect();
    let mut used = Resources::default();
    for alloc in snapshot.allocs_by_node(node_id) {
        if alloc.is_live() && !releasing.contains(alloc.id.as_str()) {
            used.add(&alloc.resources);
        }
    }
    for alloc in new_allocs {
        used.add(&alloc.resources);
    }
    node.resources.superset_of(&used)
}

/// Build the Raft command for a validated plan. Alloc indexes are assigned
/// contiguously in node order.
pub fn plan_to_results(
    snapshot: &StateSnapshot,
    evaluated: &EvaluatedPlan,
) -> ApplyPlanResultsRequest {
    let plan = &evaluated.plan;
    let mut allocs = Vec::new();
    let mut next_index = 0u64;
    for (_, node_allocs) in plan.node_allocation.iter() {
        for alloc in node_allocs {
            let mut alloc = alloc.clone();
            alloc.alloc_index = next_index;
            next_index += 1;
            allocs.push(alloc);
        }
    }

    let stops: Vec<PlanAllocStop> = plan.node_update.values().flatten().cloned().collect();
    let preemptions: Vec<PlanPreemption> =
        plan.node_preemptions.values().flatten().cloned().collect();

    // Preempted jobs get a follow-up eval so their lost work reschedules.
    let mut preempted_jobs: Vec<(String, String)> = preemptions
        .iter()
        .filter_map(|p| {
            snapshot
                .alloc(&p.alloc_id)
                .map(|a| (a.namespace.clone(), a.job_id.clone()))
        })
        .collect();
    preempted_jobs.sort();
    preempted_jobs.dedup();
    let preemption_evals = preempted_jobs
        .into_iter()
        .filter_map(|(ns, job_id)| {
            let job = snapshot.job(&ns, &job_id)?;
            Some(Evaluation::new(
                &ns,
                &job_id,
                job.job_type.scheduler(),
                job.priority,
                TRIGGER_PREEMPTION,
            ))
        })
        .collect();

    ApplyPlanResultsRequest {
        allocs,
        stops,
        preemptions,
        deployment: plan.deployment.clone(),
        preemption_evals,
        eval: None,
    }
}

/// The single-consumer apply loop. Runs on the leader until the queue is
/// disabled (receiver closes) or shutdown flips.
pub async fn run_plan_applier(
    store: Arc<StateStore>,
    proposer: Arc<dyn RaftProposer>,
    mut rx: mpsc::Receiver<PlanRequest>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("plan applier started");
    loop {
        let request = tokio::select! {
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let result = apply_one(&store, proposer.as_ref(), request.plan).await;
        // A dropped reply just means the worker gave up waiting.
        let _ = request.reply.send(result);
    }
    info!("plan applier stopped");
}

async fn apply_one(
    store: &Arc<StateStore>,
    proposer: &dyn RaftProposer,
    plan: Plan,
) -> Result<PlanResult, RpcError> {
    let timer = std::time::Instant::now();
    let snapshot = store.snapshot();
    let evaluated = evaluate_plan(&snapshot, &plan).await;

    let mut result = PlanResult {
        alloc_index: 0,
        refresh_index: evaluated.refresh_index,
        node_allocation: evaluated.plan.node_allocation.clone(),
    };

    if !evaluated.plan.is_empty() {
        let results = plan_to_results(&snapshot, &evaluated);
        let body = serde_json::to_value(&results)
            .map_err(|e| RpcError::Validation(format!("encode plan results: {e}")))?;
        let resp = proposer
            .propose(MessageType::ApplyPlanResults, body)
            .await?;
        if let Some(err) = resp.error {
            return Err(err);
        }
        result.alloc_index = resp.index;
        metrics::PLANS_COMMITTED.inc();
    } else {
        result.node_allocation = HashMap::new();
        metrics::PLANS_REJECTED.inc();
    }
    metrics::PLAN_APPLY_SECONDS.observe(timer.elapsed().as_secs_f64());
    Ok(result)
}
