//! Sub-schedulers and the planner back-interface they drive.
//!
//! A scheduler receives a state snapshot, the evaluation to process, and a
//! [`Planner`]: the worker that dequeued the eval. It reconciles desired
//! against actual state, proposes a [`Plan`], and reacts to the plan result
//! (a non-zero refresh index means the state moved underneath it; refresh
//! and replan the remainder, a bounded number of times).
//!
//! Selection is an explicit dispatch table keyed by scheduler name: service
//! and batch share the generic reconciler, system places one instance per
//! feasible node, and core runs the leader's garbage collection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::RpcError;
use crate::state_store::StateSnapshot;
use crate::structs::*;

/// Bounded replan attempts after a plan comes back partially applied.
const MAX_PLAN_RETRIES: usize = 2;

/// Desired-status reasons attached to stopped allocs.
pub const REASON_JOB_DEREGISTERED: &str = "alloc not needed due to job deregistration";
pub const REASON_ALLOC_NOT_NEEDED: &str = "alloc not needed due to job update";
pub const REASON_NODE_LOST: &str = "alloc lost since its node is gone";

/// Core job ids the leader schedules for garbage collection.
pub const CORE_JOB_EVAL_GC: &str = "eval-gc";
pub const CORE_JOB_NODE_GC: &str = "node-gc";
pub const CORE_JOB_JOB_GC: &str = "job-gc";
pub const CORE_JOB_DEPLOYMENT_GC: &str = "deployment-gc";

// ── Planner interface ─────────────────────────────────────────────────────────

/// The capability surface a scheduler gets from its worker. Every method
/// that proposes through Raft is resubmitted with slow backoff while the
/// error is "No cluster leader" or "plan queue is disabled"; all other
/// errors surface immediately.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Submit a plan. Returns the result and, when the applier asked for a
    /// refresh, a snapshot at least as fresh as the refresh index.
    async fn submit_plan(&self, plan: Plan)
        -> Result<(PlanResult, Option<StateSnapshot>), RpcError>;

    /// Rewrite an eval (status, queued allocations).
    async fn update_eval(&self, eval: Evaluation) -> Result<(), RpcError>;

    /// Persist a brand-new eval (follow-ups, chained decisions).
    async fn create_eval(&self, eval: Evaluation) -> Result<(), RpcError>;

    /// Persist an eval back into the blocked state.
    async fn reblock_eval(&self, eval: Evaluation) -> Result<(), RpcError>;

    /// Reap terminal evals and allocs; only the core scheduler calls this.
    async fn reap(&self, eval_ids: Vec<String>, alloc_ids: Vec<String>) -> Result<(), RpcError>;

    /// Remove fully drained terminal nodes; core-scheduler GC only.
    async fn deregister_nodes(&self, node_ids: Vec<String>) -> Result<(), RpcError>;

    /// Purge tombstoned jobs with no remaining live state; core GC only.
    async fn purge_jobs(&self, jobs: Vec<(String, String)>) -> Result<(), RpcError>;

    /// Delete terminal deployments; core GC only.
    async fn delete_deployments(&self, deployment_ids: Vec<String>) -> Result<(), RpcError>;

    /// Version gate for behavior that changed wire format.
    fn servers_meet_minimum_version(&self, min_version: &str, include_failed: bool) -> bool;
}

// ── Dispatch table ────────────────────────────────────────────────────────────

#[async_trait]
pub trait Scheduler: Send {
    async fn process(&mut self, eval: &Evaluation) -> Result<(), RpcError>;
}

/// Explicit name-to-scheduler table; unknown names are a validation error
/// so a misconfigured broker partition fails loudly.
pub fn new_scheduler(
    name: &str,
    snapshot: StateSnapshot,
    planner: Arc<dyn Planner>,
) -> Result<Box<dyn Scheduler>, RpcError> {
    match name {
        "service" | "batch" => Ok(Box::new(GenericScheduler::new(snapshot, planner))),
        "system" => Ok(Box::new(SystemScheduler::new(snapshot, planner))),
        "core" => Ok(Box::new(CoreScheduler::new(snapshot, planner))),
        other => Err(RpcError::Validation(format!(
            "unknown scheduler {:?}",
            other
        ))),
    }
}

// ── Feasibility helpers ───────────────────────────────────────────────────────

/// Resources on `node` not claimed by live allocations.
fn free_resources(snapshot: &StateSnapshot, node: &Node) -> Resources {
    let mut used = Resources::default();
    for alloc in snapshot.allocs_by_node(&node.id) {
        if alloc.is_live() {
            used.add(&alloc.resources);
        }
    }
    Resources {
        cpu_mhz: node.resources.cpu_mhz.saturating_sub(used.cpu_mhz),
        memory_mb: node.resources.memory_mb.saturating_sub(used.memory_mb),
        disk_mb: node.resources.disk_mb.saturating_sub(used.disk_mb),
    }
}

fn class_matches(tg: &TaskGroup, node: &Node) -> bool {
    tg.class_constraint.is_empty() || tg.class_constraint == "*" || tg.class_constraint == node.node_class
}

/// Outcome of a feasibility sweep for one task group.
struct Feasibility {
    /// Schedulable nodes with capacity, best-fit (least free) first.
    fit: Vec<Arc<Node>>,
    /// Classes that matched constraints but lacked capacity; capacity on
    /// these may free up, so a blocked eval keys on them.
    exhausted_classes: HashSet<u64>,
    /// True when the constraint was a wildcard, defeating class caching.
    escaped: bool,
}

fn feasible_nodes(snapshot: &StateSnapshot, tg: &TaskGroup) -> Feasibility {
    let mut fit: Vec<(Resources, Arc<Node>)> = Vec::new();
    let mut exhausted_classes = HashSet::new();
    for node in snapshot.nodes() {
        if !node.is_schedulable() || !class_matches(tg, node) {
            continue;
        }
        let free = free_resources(snapshot, node);
        if free.superset_of(&tg.resources) {
            fit.push((free, node.clone()));
        } else {
            exhausted_classes.insert(node.computed_class);
        }
    }
    // Best fit: tightest remaining capacity first.
    fit.sort_by_key(|(free, node)| (free.cpu_mhz + free.memory_mb, node.id.clone()));
    Feasibility {
        fit: fit.into_iter().map(|(_, n)| n).collect(),
        exhausted_classes,
        // An unconstrained group can land on any future node; no single
        // class captures that, so the blocked eval must escape.
        escaped: tg.class_constraint.is_empty() || tg.class_constraint == "*",
    }
}

/// A canaried job version rolls out under a deployment. Returns one to
/// create when none is live for this (job, version).
fn missing_deployment(snapshot: &StateSnapshot, job: &Job) -> Option<Deployment> {
    if job.job_type != JobType::Service || !job.task_groups.iter().any(|tg| tg.canaries > 0) {
        return None;
    }
    let already_running = snapshot.tables().deployments.values().any(|d| {
        d.namespace == job.namespace
            && d.job_id == job.id
            && d.job_version == job.version
            && !d.status.is_terminal()
    });
    if already_running {
        return None;
    }
    let mut task_groups = HashMap::new();
    for tg in &job.task_groups {
        task_groups.insert(
            tg.name.clone(),
            DeploymentTaskGroupState {
                desired_total: tg.count,
                desired_canaries: tg.canaries,
                ..DeploymentTaskGroupState::default()
            },
        );
    }
    Some(Deployment {
        id: generate_id(),
        namespace: job.namespace.clone(),
        job_id: job.id.clone(),
        job_version: job.version,
        status: DeploymentStatus::Running,
        status_description: "deployment is running".to_string(),
        task_groups,
        create_index: 0,
        modify_index: 0,
    })
}

// ── Generic scheduler (service + batch) ───────────────────────────────────────

pub struct GenericScheduler {
    snapshot: StateSnapshot,
    planner: Arc<dyn Planner>,
}

impl GenericScheduler {
    pub fn new(snapshot: StateSnapshot, planner: Arc<dyn Planner>) -> Self {
        Self { snapshot, planner }
    }

    /// Diff desired against actual and build the plan plus the per-group
    /// shortfall that could not be placed.
    fn reconcile(
        &self,
        snapshot: &StateSnapshot,
        eval: &Evaluation,
        job: &Job,
    ) -> (Plan, HashMap<String, u32>, HashSet<u64>, bool) {
        let mut plan = Plan {
            eval_id: eval.id.clone(),
            job_id: job.id.clone(),
            namespace: job.namespace.clone(),
            priority: job.priority,
            ..Plan::default()
        };
        let mut queued: HashMap<String, u32> = HashMap::new();
        let mut exhausted = HashSet::new();
        let mut escaped = false;

        for tg in &job.task_groups {
            let mut live: Vec<Arc<Allocation>> = snapshot
                .allocs_by_job(&job.namespace, &job.id)
                .filter(|a| a.task_group == tg.name && a.is_live())
                .cloned()
                .collect();

            // Replace allocs whose node went away or stopped being
            // schedulable: stop them here, the placement pass below refills.
            live.retain(|alloc| {
                let healthy_node = snapshot
                    .node(&alloc.node_id)
                    .map(|n| n.is_schedulable())
                    .unwrap_or(false);
                if !healthy_node {
                    plan.node_update
                        .entry(alloc.node_id.clone())
                        .or_default()
                        .push(PlanAllocStop {
                            alloc_id: alloc.id.clone(),
                            reason: REASON_NODE_LOST.to_string(),
                        });
                }
                healthy_node
            });

            let desired = tg.count as usize;

            // Scale down: stop the newest surplus allocs.
            if live.len() > desired {
                live.sort_by_key(|a| a.create_index);
                for alloc in live.split_off(desired) {
                    plan.node_update
                        .entry(alloc.node_id.clone())
                        .or_default()
                        .push(PlanAllocStop {
                            alloc_id: alloc.id.clone(),
                            reason: REASON_ALLOC_NOT_NEEDED.to_string(),
                        });
                }
            }

            // Scale up: place the shortfall on feasible nodes.
            let missing = desired.saturating_sub(live.len());
            if missing == 0 {
                continue;
            }
            let feasibility = feasible_nodes(snapshot, tg);
            escaped |= feasibility.escaped;
            exhausted.extend(feasibility.exhausted_classes);

            let mut placed = 0usize;
            let mut node_load: HashMap<String, Resources> = HashMap::new();
            'placing: for _ in 0..missing {
                for node in &feasibility.fit {
                    // Capacity already consumed by this plan on this node.
                    let pending = node_load.entry(node.id.clone()).or_default();
                    let mut free = free_resources(snapshot, node);
                    free.cpu_mhz = free.cpu_mhz.saturating_sub(pending.cpu_mhz);
                    free.memory_mb = free.memory_mb.saturating_sub(pending.memory_mb);
                    free.disk_mb = free.disk_mb.saturating_sub(pending.disk_mb);
                    if !free.superset_of(&tg.resources) {
                        exhausted.insert(node.computed_class);
                        continue;
                    }
                    pending.add(&tg.resources);
                    plan.node_allocation
                        .entry(node.id.clone())
                        .or_default()
                        .push(Allocation {
                            id: generate_id(),
                            namespace: job.namespace.clone(),
                            job_id: job.id.clone(),
                            job_version: job.version,
                            task_group: tg.name.clone(),
                            node_id: node.id.clone(),
                            eval_id: eval.id.clone(),
                            resources: tg.resources,
                            desired_status: AllocDesiredStatus::Run,
                            desired_description: String::new(),
                            client_status: AllocClientStatus::Pending,
                            preempted_by_allocation: String::new(),
                            deployment_id: String::new(),
                            alloc_index: 0,
                            create_index: 0,
                            modify_index: 0,
                        });
                    placed += 1;
                    continue 'placing;
                }
                break; // no node fits the rest of this group
            }
            if placed < missing {
                queued.insert(tg.name.clone(), (missing - placed) as u32);
            }
        }
        (plan, queued, exhausted, escaped)
    }

    /// Stop every live alloc of a job that no longer wants any.
    fn stop_all(&self, snapshot: &StateSnapshot, eval: &Evaluation, reason: &str) -> Plan {
        let mut plan = Plan {
            eval_id: eval.id.clone(),
            job_id: eval.job_id.clone(),
            namespace: eval.namespace.clone(),
            priority: eval.priority,
            ..Plan::default()
        };
        for alloc in snapshot.allocs_by_job(&eval.namespace, &eval.job_id) {
            if alloc.is_live() {
                plan.node_update
                    .entry(alloc.node_id.clone())
                    .or_default()
                    .push(PlanAllocStop {
                        alloc_id: alloc.id.clone(),
                        reason: reason.to_string(),
                    });
            }
        }
        plan
    }

    async fn finish(
        &self,
        eval: &Evaluation,
        queued: HashMap<String, u32>,
        exhausted: HashSet<u64>,
        escaped: bool,
    ) -> Result<(), RpcError> {
        if !queued.is_empty() {
            // Chain a blocked eval so freed capacity reschedules the rest.
            let mut blocked = Evaluation::new(
                &eval.namespace,
                &eval.job_id,
                &eval.eval_type,
                eval.priority,
                TRIGGER_QUEUED_ALLOCS,
            );
            blocked.status = EvalStatus::Blocked;
            blocked.previous_eval = eval.id.clone();
            blocked.queued_allocations = queued.clone();
            blocked.escaped_computation = escaped || exhausted.is_empty();
            if let Some(class) = exhausted.iter().min() {
                blocked.computed_class = *class;
            }
            blocked.quota_limit = self
                .snapshot
                .namespace(&eval.namespace)
                .map(|ns| ns.quota.clone())
                .unwrap_or_default();
            self.planner.reblock_eval(blocked.clone()).await?;

            let mut done = eval.clone();
            done.status = EvalStatus::Complete;
            done.blocked_eval = blocked.id;
            done.queued_allocations = queued;
            return self.planner.update_eval(done).await;
        }

        let mut done = eval.clone();
        done.status = EvalStatus::Complete;
        done.queued_allocations = HashMap::new();
        self.planner.update_eval(done).await
    }
}

#[async_trait]
impl Scheduler for GenericScheduler {
    async fn process(&mut self, eval: &Evaluation) -> Result<(), RpcError> {
        let mut snapshot = self.snapshot.clone();

        // A stopped or purged job only needs its allocs wound down.
        let job = snapshot.job(&eval.namespace, &eval.job_id);
        let stopping = job.as_ref().map(|j| j.stop).unwrap_or(true);
        if stopping {
            let plan = self.stop_all(&snapshot, eval, REASON_JOB_DEREGISTERED);
            if !plan.is_empty() {
                self.planner.submit_plan(plan).await?;
            }
            let mut done = eval.clone();
            done.status = EvalStatus::Complete;
            return self.planner.update_eval(done).await;
        }
        let job = job.expect("checked above");
        if !job.is_directly_schedulable() {
            // Periodic/parameterized parents spawn children elsewhere.
            let mut done = eval.clone();
            done.status = EvalStatus::Complete;
            return self.planner.update_eval(done).await;
        }

        let mut attempt = 0;
        let (mut plan, mut queued, mut exhausted, mut escaped) =
            self.reconcile(&snapshot, eval, &job);
        plan.deployment = missing_deployment(&snapshot, &job);
        loop {
            if plan.is_empty() {
                break;
            }
            let (result, refreshed) = self.planner.submit_plan(plan).await?;
            if result.refresh_index == 0 {
                break;
            }
            // Partial commit: what survived is in place, replan the rest
            // against the refreshed snapshot.
            attempt += 1;
            if attempt > MAX_PLAN_RETRIES {
                debug!(eval_id = %eval.id, "giving up replanning after refresh");
                break;
            }
            let Some(fresh) = refreshed else { break };
            snapshot = fresh;
            let redo = self.reconcile(&snapshot, eval, &job);
            plan = redo.0;
            queued = redo.1;
            exhausted = redo.2;
            escaped = redo.3;
            plan.deployment = missing_deployment(&snapshot, &job);
        }

        self.finish(eval, queued, exhausted, escaped).await
    }
}

// ── System scheduler ──────────────────────────────────────────────────────────

/// Places one instance of every task group on every feasible node.
pub struct SystemScheduler {
    snapshot: StateSnapshot,
    planner: Arc<dyn Planner>,
}

impl SystemScheduler {
    pub fn new(snapshot: StateSnapshot, planner: Arc<dyn Planner>) -> Self {
        Self { snapshot, planner }
    }
}

#[async_trait]
impl Scheduler for SystemScheduler {
    async fn process(&mut self, eval: &Evaluation) -> Result<(), RpcError> {
        let snapshot = self.snapshot.clone();
        let Some(job) = snapshot.job(&eval.namespace, &eval.job_id) else {
            let mut done = eval.clone();
            done.status = EvalStatus::Complete;
            return self.planner.update_eval(done).await;
        };

        let mut plan = Plan {
            eval_id: eval.id.clone(),
            job_id: job.id.clone(),
            namespace: job.namespace.clone(),
            priority: job.priority,
            ..Plan::default()
        };

        for tg in &job.task_groups {
            let placed_nodes: HashSet<String> = snapshot
                .allocs_by_job(&job.namespace, &job.id)
                .filter(|a| a.task_group == tg.name && a.is_live())
                .map(|a| a.node_id.clone())
                .collect();

            for node in snapshot.nodes() {
                if job.stop {
                    continue;
                }
                if !node.is_schedulable() || !class_matches(tg, node) {
                    continue;
                }
                if placed_nodes.contains(&node.id) {
                    continue;
                }
                if !free_resources(&snapshot, node).superset_of(&tg.resources) {
                    continue;
                }
                plan.node_allocation
                    .entry(node.id.clone())
                    .or_default()
                    .push(Allocation {
                        id: generate_id(),
                        namespace: job.namespace.clone(),
                        job_id: job.id.clone(),
                        job_version: job.version,
                        task_group: tg.name.clone(),
                        node_id: node.id.clone(),
                        eval_id: eval.id.clone(),
                        resources: tg.resources,
                        desired_status: AllocDesiredStatus::Run,
                        desired_description: String::new(),
                        client_status: AllocClientStatus::Pending,
                        preempted_by_allocation: String::new(),
                        deployment_id: String::new(),
                        alloc_index: 0,
                        create_index: 0,
                        modify_index: 0,
                    });
            }

            // Wind down instances on nodes that left or stopped the job.
            for alloc in snapshot.allocs_by_job(&job.namespace, &job.id) {
                if alloc.task_group != tg.name || !alloc.is_live() {
                    continue;
                }
                let feasible = !job.stop
                    && snapshot
                        .node(&alloc.node_id)
                        .map(|n| n.is_schedulable() && class_matches(tg, &n))
                        .unwrap_or(false);
                if !feasible {
                    plan.node_update
                        .entry(alloc.node_id.clone())
                        .or_default()
                        .push(PlanAllocStop {
                            alloc_id: alloc.id.clone(),
                            reason: REASON_NODE_LOST.to_string(),
                        });
                }
            }
        }

        if !plan.is_empty() {
            self.planner.submit_plan(plan).await?;
        }
        let mut done = eval.clone();
        done.status = EvalStatus::Complete;
        self.planner.update_eval(done).await
    }
}

// ── Core scheduler (garbage collection) ───────────────────────────────────────

/// Reaps terminal state. The eval's job id names the GC pass.
pub struct CoreScheduler {
    snapshot: StateSnapshot,
    planner: Arc<dyn Planner>,
}

impl CoreScheduler {
    pub fn new(snapshot: StateSnapshot, planner: Arc<dyn Planner>) -> Self {
        Self { snapshot, planner }
    }

    fn collect_eval_gc(&self) -> (Vec<String>, Vec<String>) {
        let mut eval_ids = Vec::new();
        let mut alloc_ids = Vec::new();
        for eval in self.snapshot.evals() {
            if !eval.status.is_terminal() {
                continue;
            }
            // An eval is reapable once every alloc it produced is terminal.
            let allocs: Vec<_> = self
                .snapshot
                .allocs()
                .filter(|a| a.eval_id == eval.id)
                .collect();
            if allocs.iter().all(|a| a.is_terminal()) {
                eval_ids.push(eval.id.clone());
                alloc_ids.extend(allocs.iter().map(|a| a.id.clone()));
            }
        }
        (eval_ids, alloc_ids)
    }

    fn collect_job_gc(&self) -> Vec<(String, String)> {
        self.snapshot
            .jobs()
            .filter(|job| {
                job.stop
                    && self
                        .snapshot
                        .allocs_by_job(&job.namespace, &job.id)
                        .all(|a| a.is_terminal())
                    && self
                        .snapshot
                        .evals_by_job(&job.namespace, &job.id)
                        .all(|e| e.status.is_terminal())
            })
            .map(|job| (job.namespace.clone(), job.id.clone()))
            .collect()
    }

    fn collect_deployment_gc(&self) -> Vec<String> {
        self.snapshot
            .tables()
            .deployments
            .values()
            .filter(|d| d.status.is_terminal())
            .map(|d| d.id.clone())
            .collect()
    }
}

#[async_trait]
impl Scheduler for CoreScheduler {
    async fn process(&mut self, eval: &Evaluation) -> Result<(), RpcError> {
        match eval.job_id.as_str() {
            CORE_JOB_EVAL_GC => {
                let (eval_ids, alloc_ids) = self.collect_eval_gc();
                if !eval_ids.is_empty() || !alloc_ids.is_empty() {
                    info!(
                        evals = eval_ids.len(),
                        allocs = alloc_ids.len(),
                        "core gc reaping terminal evals"
                    );
                    self.planner.reap(eval_ids, alloc_ids).await?;
                }
            }
            CORE_JOB_NODE_GC => {
                // Down nodes with no live allocs have nothing left to
                // account for; their rows go.
                let reapable: Vec<String> = self
                    .snapshot
                    .nodes()
                    .filter(|n| {
                        n.status.is_terminal()
                            && self.snapshot.allocs_by_node(&n.id).all(|a| a.is_terminal())
                    })
                    .map(|n| n.id.clone())
                    .collect();
                if !reapable.is_empty() {
                    info!(nodes = reapable.len(), "core gc reaping terminal nodes");
                    self.planner.deregister_nodes(reapable).await?;
                }
            }
            CORE_JOB_JOB_GC => {
                let purgeable = self.collect_job_gc();
                if !purgeable.is_empty() {
                    debug!(jobs = purgeable.len(), "core gc purging dead jobs");
                    self.planner.purge_jobs(purgeable).await?;
                }
            }
            CORE_JOB_DEPLOYMENT_GC => {
                let terminal = self.collect_deployment_gc();
                if !terminal.is_empty() {
                    self.planner.delete_deployments(terminal).await?;
                }
            }
            other => {
                return Err(RpcError::Validation(format!(
                    "unknown core gc job {:?}",
                    other
                )));
            }
        }
        let mut done = eval.clone();
        done.status = EvalStatus::Complete;
        self.planner.update_eval(done).await
    }
}
