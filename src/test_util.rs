//! Shared fixtures for unit and integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::config::ServerConfig;
use crate::errors::RpcError;
use crate::fsm::{
    AppliedResponse, Fsm, JobRegisterRequest, LogCommand, MessageType, NodeRegisterRequest,
    SideEffects,
};
use crate::periodic::{LaunchRequest, PeriodicDispatcher, SystemClock};
use crate::plan_apply::{evaluate_plan, plan_to_results};
use crate::scheduler::Planner;
use crate::state_store::{StateSnapshot, StateStore, StateTables, Table};
use crate::structs::*;
use crate::worker::WorkerContext;

pub fn test_node() -> Node {
    let mut node = Node {
        id: generate_id(),
        datacenter: "dc1".into(),
        node_class: "compute".into(),
        attributes: HashMap::from([("kernel".to_string(), "linux".to_string())]),
        resources: Resources {
            cpu_mhz: 4000,
            memory_mb: 8192,
            disk_mb: 100_000,
        },
        status: NodeStatus::Ready,
        scheduling_eligibility: SchedulingEligibility::Eligible,
        drain_strategy: None,
        secret_id: generate_id(),
        computed_class: 0,
        status_updated_at: 0,
        create_index: 0,
        modify_index: 0,
    };
    node.compute_class();
    node
}

pub fn test_job(id: &str) -> Job {
    Job {
        id: id.to_string(),
        namespace: DEFAULT_NAMESPACE.to_string(),
        job_type: JobType::Service,
        priority: 50,
        version: 0,
        task_groups: vec![TaskGroup {
            name: "app".to_string(),
            count: 1,
            resources: Resources {
                cpu_mhz: 100,
                memory_mb: 128,
                disk_mb: 100,
            },
            class_constraint: String::new(),
            canaries: 0,
        }],
        periodic: None,
        parameterized: None,
        status: JobStatus::Pending,
        stop: false,
        stable: false,
        create_index: 0,
        modify_index: 0,
    }
}

/// The side-effect sinks wired into a test FSM, with their receivers held
/// open so sends never error.
pub struct TestSinks {
    pub broker: Arc<EvalBroker>,
    pub blocked: Arc<BlockedEvals>,
    pub periodic: Arc<PeriodicDispatcher>,
    pub failed_rx: mpsc::UnboundedReceiver<Evaluation>,
    pub launch_rx: mpsc::UnboundedReceiver<LaunchRequest>,
}

/// An FSM over a fresh store with live (enabled) side-effect sinks.
pub fn test_fsm() -> (Fsm, TestSinks) {
    let store = Arc::new(StateStore::new());
    let config = ServerConfig::for_testing();
    let (broker, failed_rx) = EvalBroker::new(&config);
    broker.set_enabled(true);
    let blocked = BlockedEvals::new(broker.clone());
    blocked.set_enabled(true);
    let (periodic, launch_rx) = PeriodicDispatcher::new(Arc::new(SystemClock));
    periodic.set_enabled(true);

    let fsm = Fsm::new(
        store,
        SideEffects {
            broker: broker.clone(),
            blocked: blocked.clone(),
            periodic: periodic.clone(),
        },
    );
    (
        fsm,
        TestSinks {
            broker,
            blocked,
            periodic,
            failed_rx,
            launch_rx,
        },
    )
}

/// A snapshot over hand-built tables.
pub fn snapshot_of(tables: StateTables) -> StateSnapshot {
    let store = StateStore::new();
    store.swap_all(tables);
    store.snapshot()
}

/// A snapshot seeded with the given rows at index 10.
pub fn snapshot_with(
    nodes: Vec<Node>,
    jobs: Vec<Job>,
    allocs: Vec<Allocation>,
) -> StateSnapshot {
    let store = StateStore::new();
    let mut txn = store.begin(10);
    for node in nodes {
        txn.tables.nodes.insert(node.id.clone(), Arc::new(node));
        txn.bump(Table::Nodes);
    }
    for job in jobs {
        txn.tables.jobs.insert(job.key(), Arc::new(job));
        txn.bump(Table::Jobs);
    }
    for alloc in allocs {
        txn.tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
        txn.bump(Table::Allocs);
    }
    store.commit(txn);
    store.snapshot()
}

/// A single-server in-process control plane: the FSM applied directly with
/// a local index counter standing in for the Raft log. Gives worker and
/// end-to-end tests the full dequeue → schedule → plan → commit cycle
/// without networking.
pub struct LocalHarness {
    fsm: Fsm,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
    periodic: Arc<PeriodicDispatcher>,
    index: AtomicU64,
    /// Serializes applies: exactly one writer, like the Raft apply path.
    apply_lock: Mutex<()>,
    /// Single-flight plan application.
    plan_lock: tokio::sync::Mutex<()>,
    _failed_rx: Mutex<mpsc::UnboundedReceiver<Evaluation>>,
    _launch_rx: Mutex<mpsc::UnboundedReceiver<LaunchRequest>>,
}

impl LocalHarness {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        let store = Arc::new(StateStore::new());
        let config = ServerConfig::for_testing();
        let (broker, failed_rx) = EvalBroker::new(&config);
        let blocked = BlockedEvals::new(broker.clone());
        let (periodic, launch_rx) = PeriodicDispatcher::new(Arc::new(SystemClock));
        let fsm = Fsm::new(
            store,
            SideEffects {
                broker: broker.clone(),
                blocked: blocked.clone(),
                periodic: periodic.clone(),
            },
        );
        Arc::new(Self {
            fsm,
            broker,
            blocked,
            periodic,
            index: AtomicU64::new(1),
            apply_lock: Mutex::new(()),
            plan_lock: tokio::sync::Mutex::new(()),
            _failed_rx: Mutex::new(failed_rx),
            _launch_rx: Mutex::new(launch_rx),
        })
    }

    pub fn become_leader(&self) {
        self.broker.set_enabled(true);
        self.blocked.set_enabled(true);
        self.periodic.set_enabled(true);
    }

    pub fn broker(&self) -> Arc<EvalBroker> {
        self.broker.clone()
    }

    pub fn blocked(&self) -> Arc<BlockedEvals> {
        self.blocked.clone()
    }

    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.fsm.store().snapshot()
    }

    /// Apply one command at the next index, exactly like a committed log
    /// entry would be.
    pub fn apply<T: Serialize>(&self, mt: MessageType, body: &T) -> AppliedResponse {
        let _guard = self.apply_lock.lock().unwrap();
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        self.fsm
            .apply(index, &LogCommand::encode(mt, body, now_millis()))
    }

    pub fn register_node(&self, node: Node) -> AppliedResponse {
        self.apply(MessageType::NodeRegister, &NodeRegisterRequest { node })
    }

    /// Register a job, synthesizing the trigger eval like the RPC layer
    /// does.
    pub fn register_job(&self, job: Job, with_eval: bool) -> AppliedResponse {
        let eval = with_eval.then(|| {
            Evaluation::new(
                &job.namespace,
                &job.id,
                job.job_type.scheduler(),
                job.priority,
                TRIGGER_JOB_REGISTER,
            )
        });
        self.apply(MessageType::JobRegister, &JobRegisterRequest { job, eval })
    }

    /// Deregister a job, synthesizing the wind-down eval like the RPC
    /// layer does.
    pub fn deregister_job(&self, namespace: &str, job_id: &str, purge: bool) -> AppliedResponse {
        let eval = self
            .fsm
            .store()
            .snapshot()
            .job(namespace, job_id)
            .map(|job| {
                Evaluation::new(
                    namespace,
                    job_id,
                    job.job_type.scheduler(),
                    job.priority,
                    TRIGGER_JOB_DEREGISTER,
                )
            });
        self.apply(
            MessageType::JobDeregister,
            &crate::fsm::JobDeregisterRequest {
                namespace: namespace.to_string(),
                job_id: job_id.to_string(),
                purge,
                eval,
            },
        )
    }

    /// Pop one eval the broker failed out, if any.
    pub fn take_failed_eval(&self) -> Option<Evaluation> {
        self._failed_rx.lock().unwrap().try_recv().ok()
    }

    pub async fn wait_until<F: Fn() -> bool>(&self, pred: F, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !pred() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached within {:?}",
                timeout
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl WorkerContext for LocalHarness {
    fn broker(&self) -> Arc<EvalBroker> {
        self.broker.clone()
    }

    fn snapshot(&self) -> StateSnapshot {
        self.fsm.store().snapshot()
    }

    fn enabled_schedulers(&self) -> Vec<String> {
        ServerConfig::for_testing().enabled_schedulers
    }

    async fn wait_for_index(&self, index: u64, timeout: Duration) -> Option<u64> {
        self.fsm.store().wait_for_index(index, timeout).await
    }

    async fn raft_apply(
        &self,
        mt: MessageType,
        body: serde_json::Value,
    ) -> Result<AppliedResponse, RpcError> {
        Ok(self.apply(mt, &body))
    }

    async fn submit_plan(&self, plan: Plan) -> Result<PlanResult, RpcError> {
        let _single_flight = self.plan_lock.lock().await;
        let snapshot = self.snapshot();
        let evaluated = evaluate_plan(&snapshot, &plan).await;
        let mut result = PlanResult {
            alloc_index: 0,
            refresh_index: evaluated.refresh_index,
            node_allocation: evaluated.plan.node_allocation.clone(),
        };
        if !evaluated.plan.is_empty() {
            let results = plan_to_results(&snapshot, &evaluated);
            let resp = self.apply(MessageType::ApplyPlanResults, &results);
            if let Some(err) = resp.error {
                return Err(err);
            }
            result.alloc_index = resp.index;
        } else {
            result.node_allocation = HashMap::new();
        }
        Ok(result)
    }

    fn servers_meet_minimum_version(&self, _min_version: &str, _include_failed: bool) -> bool {
        true
    }
}

/// A [`Planner`] that records every call and fully commits every plan.
#[derive(Default)]
pub struct PlannerRecorder {
    plans: Mutex<Vec<Plan>>,
    eval_updates: Mutex<Vec<Evaluation>>,
    created: Mutex<Vec<Evaluation>>,
    reblocked: Mutex<Vec<Evaluation>>,
    reaped: Mutex<(Vec<String>, Vec<String>)>,
    deregistered_nodes: Mutex<Vec<String>>,
    purged_jobs: Mutex<Vec<(String, String)>>,
    deleted_deployments: Mutex<Vec<String>>,
}

impl PlannerRecorder {
    pub fn plans(&self) -> Vec<Plan> {
        self.plans.lock().unwrap().clone()
    }
    pub fn eval_updates(&self) -> Vec<Evaluation> {
        self.eval_updates.lock().unwrap().clone()
    }
    pub fn created(&self) -> Vec<Evaluation> {
        self.created.lock().unwrap().clone()
    }
    pub fn reblocked(&self) -> Vec<Evaluation> {
        self.reblocked.lock().unwrap().clone()
    }
    pub fn reaped(&self) -> (Vec<String>, Vec<String>) {
        self.reaped.lock().unwrap().clone()
    }
    pub fn deregistered_nodes(&self) -> Vec<String> {
        self.deregistered_nodes.lock().unwrap().clone()
    }
    pub fn purged_jobs(&self) -> Vec<(String, String)> {
        self.purged_jobs.lock().unwrap().clone()
    }
    pub fn deleted_deployments(&self) -> Vec<String> {
        self.deleted_deployments.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for PlannerRecorder {
    async fn submit_plan(
        &self,
        plan: Plan,
    ) -> Result<(PlanResult, Option<StateSnapshot>), RpcError> {
        let result = PlanResult {
            alloc_index: 1,
            refresh_index: 0,
            node_allocation: plan.node_allocation.clone(),
        };
        self.plans.lock().unwrap().push(plan);
        Ok((result, None))
    }

    async fn update_eval(&self, eval: Evaluation) -> Result<(), RpcError> {
        self.eval_updates.lock().unwrap().push(eval);
        Ok(())
    }

    async fn create_eval(&self, eval: Evaluation) -> Result<(), RpcError> {
        self.created.lock().unwrap().push(eval);
        Ok(())
    }

    async fn reblock_eval(&self, eval: Evaluation) -> Result<(), RpcError> {
        self.reblocked.lock().unwrap().push(eval);
        Ok(())
    }

    async fn reap(&self, eval_ids: Vec<String>, alloc_ids: Vec<String>) -> Result<(), RpcError> {
        let mut guard = self.reaped.lock().unwrap();
        guard.0.extend(eval_ids);
        guard.1.extend(alloc_ids);
        Ok(())
    }

    async fn deregister_nodes(&self, node_ids: Vec<String>) -> Result<(), RpcError> {
        self.deregistered_nodes.lock().unwrap().extend(node_ids);
        Ok(())
    }

    async fn purge_jobs(&self, jobs: Vec<(String, String)>) -> Result<(), RpcError> {
        self.purged_jobs.lock().unwrap().extend(jobs);
        Ok(())
    }

    async fn delete_deployments(&self, deployment_ids: Vec<String>) -> Result<(), RpcError> {
        self.deleted_deployments.lock().unwrap().extend(deployment_ids);
        Ok(())
    }

    fn servers_meet_minimum_version(&self, _min_version: &str, _include_failed: bool) -> bool {
        true
    }
}
