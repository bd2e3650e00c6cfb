//! Core data model: the objects persisted in the state store and the
//! payloads carried through the Raft log.
//!
//! Every persisted object carries `create_index <= modify_index`, both set by
//! the FSM from the Raft index of the write that produced them. Status fields
//! are small string-backed enums so snapshots stay stable across versions.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The default namespace objects land in when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Trigger attached to the follow-up eval created when an eval exhausts its
/// delivery limit.
pub const TRIGGER_FAILED_FOLLOWUP: &str = "failed-follow-up";

/// Trigger for evals synthesized on job registration.
pub const TRIGGER_JOB_REGISTER: &str = "job-register";
pub const TRIGGER_JOB_DEREGISTER: &str = "job-deregister";
pub const TRIGGER_NODE_UPDATE: &str = "node-update";
pub const TRIGGER_NODE_DRAIN: &str = "node-drain";
pub const TRIGGER_PERIODIC: &str = "periodic-job";
pub const TRIGGER_PLAN_REJECT: &str = "plan-rejected";
pub const TRIGGER_PREEMPTION: &str = "preemption";
pub const TRIGGER_QUEUED_ALLOCS: &str = "queued-allocs";
pub const TRIGGER_DEPLOYMENT_WATCHER: &str = "deployment-watcher";

pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the epoch; the only wall-clock representation the
/// data model stores.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Init,
    Ready,
    Down,
    Disconnected,
    Reap,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Init => "initializing",
            NodeStatus::Ready => "ready",
            NodeStatus::Down => "down",
            NodeStatus::Disconnected => "disconnected",
            NodeStatus::Reap => "reap",
        }
    }

    /// Terminal statuses free the node's heartbeat timer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Down | NodeStatus::Reap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    Eligible,
    Ineligible,
}

/// An operator-requested drain with an optional deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainStrategy {
    /// Milliseconds the drain may take before remaining allocs are force
    /// stopped. Zero means no deadline.
    pub deadline_ms: i64,
    /// Stop system jobs as well once service allocs have drained.
    pub ignore_system_jobs: bool,
    /// Set when the deadline passed and the drainer forced the remainder.
    pub force_deadline_hit: bool,
}

/// A registered worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable UUID assigned by the client on first registration.
    pub id: String,
    /// Datacenter within the region.
    pub datacenter: String,
    /// Operator-assigned class used for constraint matching.
    pub node_class: String,
    /// Schedulable attributes (kernel, arch, driver versions, ...).
    pub attributes: HashMap<String, String>,
    /// Total schedulable resources.
    pub resources: Resources,
    pub status: NodeStatus,
    pub scheduling_eligibility: SchedulingEligibility,
    pub drain_strategy: Option<DrainStrategy>,
    /// Authenticates client->server calls. Redacted from list responses.
    pub secret_id: String,
    /// Cached hash of schedulable attributes; keys blocked-eval tracking.
    pub computed_class: u64,
    pub status_updated_at: i64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Node {
    /// Recompute the node's class hash from its schedulable attributes.
    ///
    /// Two nodes with equal computed classes are interchangeable for
    /// feasibility checking, which lets the blocked-eval tracker cache
    /// "no placement possible" verdicts per class instead of per node.
    pub fn compute_class(&mut self) {
        let mut h = DefaultHasher::new();
        self.node_class.hash(&mut h);
        self.datacenter.hash(&mut h);
        let mut keys: Vec<&String> = self.attributes.keys().collect();
        keys.sort();
        for k in keys {
            k.hash(&mut h);
            self.attributes[k].hash(&mut h);
        }
        self.resources.cpu_mhz.hash(&mut h);
        self.resources.memory_mb.hash(&mut h);
        self.resources.disk_mb.hash(&mut h);
        self.computed_class = h.finish();
    }

    /// Ready for placements: status ready and eligibility not revoked.
    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Ready
            && self.scheduling_eligibility == SchedulingEligibility::Eligible
            && self.drain_strategy.is_none()
    }
}

/// Schedulable resource quantities. A node advertises totals; task groups
/// request portions of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Resources {
    pub fn superset_of(&self, other: &Resources) -> bool {
        self.cpu_mhz >= other.cpu_mhz
            && self.memory_mb >= other.memory_mb
            && self.disk_mb >= other.disk_mb
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpu_mhz += other.cpu_mhz;
        self.memory_mb += other.memory_mb;
        self.disk_mb += other.disk_mb;
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Service,
    Batch,
    System,
}

impl JobType {
    /// The scheduler name evals for this job are routed to.
    pub fn scheduler(&self) -> &'static str {
        match self {
            JobType::Service => "service",
            JobType::Batch => "batch",
            JobType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Dead,
}

/// Cron-driven child spawning for periodic jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicConfig {
    pub enabled: bool,
    /// Cron expression evaluated in UTC.
    pub spec: String,
    /// Skip a launch while the previous child is still running.
    pub prohibit_overlap: bool,
}

/// On-demand dispatch for parameterized jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterizedConfig {
    pub payload_required: bool,
    pub meta_required: Vec<String>,
}

/// One co-scheduled unit of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    /// Desired instance count. System jobs ignore it (one per node).
    pub count: u32,
    pub resources: Resources,
    /// Constraint on `node_class`; empty matches every node. A literal
    /// `"*"` is a wildcard that defeats computed-class caching.
    pub class_constraint: String,
    /// Canary count during a rolling update.
    pub canaries: u32,
}

/// An immutable-per-version description of desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub namespace: String,
    pub job_type: JobType,
    pub priority: i32,
    /// Bumped on every re-registration that changes the definition.
    pub version: u64,
    pub task_groups: Vec<TaskGroup>,
    pub periodic: Option<PeriodicConfig>,
    pub parameterized: Option<ParameterizedConfig>,
    pub status: JobStatus,
    /// Tombstone set by deregister without purge.
    pub stop: bool,
    /// Set by deployment promotion; stable versions are preferred when
    /// reverting.
    pub stable: bool,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Job {
    pub fn key(&self) -> (String, String) {
        (self.namespace.clone(), self.id.clone())
    }

    pub fn is_periodic_active(&self) -> bool {
        !self.stop
            && self
                .periodic
                .as_ref()
                .map(|p| p.enabled)
                .unwrap_or(false)
    }

    /// Jobs a scheduler acts on directly; periodic/parameterized parents
    /// only spawn children.
    pub fn is_directly_schedulable(&self) -> bool {
        self.periodic.is_none() && self.parameterized.is_none()
    }
}

/// Persisted record of one periodic launch, keyed like its job. Guards
/// against double-launching the same cron tick across leader failovers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicLaunch {
    pub namespace: String,
    pub job_id: String,
    /// Launch time in epoch millis of the tick that fired.
    pub launch_millis: i64,
    pub create_index: u64,
    pub modify_index: u64,
}

// ── Evaluations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Pending,
    Blocked,
    Complete,
    Failed,
    Cancelled,
}

impl EvalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Pending => "pending",
            EvalStatus::Blocked => "blocked",
            EvalStatus::Complete => "complete",
            EvalStatus::Failed => "failed",
            EvalStatus::Cancelled => "cancelled",
        }
    }
}

/// A unit of scheduling work: (re)compute placements for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub namespace: String,
    pub job_id: String,
    /// Scheduler name: service, batch, system or core.
    pub eval_type: String,
    pub priority: i32,
    pub triggered_by: String,
    pub status: EvalStatus,
    pub status_description: String,
    /// Minimum state-store index a worker must observe before scheduling.
    pub snapshot_index: u64,
    /// Epoch millis before which the broker must not deliver this eval.
    pub wait_until: i64,
    /// Set on follow-up evals: the eval that exhausted its deliveries.
    pub previous_eval: String,
    /// Set on system evals blocked against one specific node.
    pub node_id: String,
    /// Set when a blocked eval was spawned from this one.
    pub blocked_eval: String,
    /// Filled by the blocked path: computed class the scheduler saw.
    pub computed_class: u64,
    /// True when wildcard constraints defeated class computation.
    pub escaped_computation: bool,
    /// Quota the namespace maps to at blocking time.
    pub quota_limit: String,
    /// Placements the scheduler could not make, per task group.
    pub queued_allocations: HashMap<String, u32>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Evaluation {
    pub fn new(namespace: &str, job_id: &str, eval_type: &str, priority: i32, trigger: &str) -> Self {
        Self {
            id: generate_id(),
            namespace: namespace.to_string(),
            job_id: job_id.to_string(),
            eval_type: eval_type.to_string(),
            priority,
            triggered_by: trigger.to_string(),
            status: EvalStatus::Pending,
            status_description: String::new(),
            snapshot_index: 0,
            wait_until: 0,
            previous_eval: String::new(),
            node_id: String::new(),
            blocked_eval: String::new(),
            computed_class: 0,
            escaped_computation: false,
            quota_limit: String::new(),
            queued_allocations: HashMap::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    /// The broker only accepts pending evals; everything else lives in the
    /// blocked tracker or is terminal.
    pub fn should_enqueue(&self) -> bool {
        self.status == EvalStatus::Pending
    }

    pub fn should_block(&self) -> bool {
        self.status == EvalStatus::Blocked
    }
}

// ── Allocations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    Run,
    Stop,
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl AllocClientStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
        )
    }
}

/// The binding of one task group of one job version to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub namespace: String,
    pub job_id: String,
    pub job_version: u64,
    pub task_group: String,
    pub node_id: String,
    pub eval_id: String,
    pub resources: Resources,
    pub desired_status: AllocDesiredStatus,
    pub desired_description: String,
    pub client_status: AllocClientStatus,
    /// Allocs evicted to make room record their preemptor here.
    pub preempted_by_allocation: String,
    pub deployment_id: String,
    /// Ordinal within the plan batch that created this alloc; contiguous
    /// within a single committed plan.
    pub alloc_index: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Allocation {
    /// Counts against node resources only while it may still run.
    pub fn is_live(&self) -> bool {
        self.desired_status == AllocDesiredStatus::Run && !self.client_status.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        self.client_status.is_terminal()
            || matches!(
                self.desired_status,
                AllocDesiredStatus::Stop | AllocDesiredStatus::Evict
            )
    }
}

/// Client-side transition request persisted on the alloc (restart/migrate).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredTransition {
    pub migrate: bool,
    pub reschedule: bool,
}

// ── Plans ─────────────────────────────────────────────────────────────────────

/// A stopped allocation plus the reason, as proposed in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAllocStop {
    pub alloc_id: String,
    pub reason: String,
}

/// A preemption victim and its preemptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPreemption {
    pub alloc_id: String,
    pub preempted_by: String,
}

/// A scheduler's proposal of node-allocation changes. Transient: never
/// persisted, only its result is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: String,
    pub eval_token: String,
    pub job_id: String,
    pub namespace: String,
    pub priority: i32,
    /// The state-store index the scheduler planned against.
    pub snapshot_index: u64,
    /// New allocations per node.
    pub node_allocation: HashMap<String, Vec<Allocation>>,
    /// Allocations to stop per node.
    pub node_update: HashMap<String, Vec<PlanAllocStop>>,
    /// Preemptions per node.
    pub node_preemptions: HashMap<String, Vec<PlanPreemption>>,
    /// Deployment the plan creates or advances, if any.
    pub deployment: Option<Deployment>,
    /// When normalization is supported cluster-wide, stops/preemptions are
    /// sent as id-only diffs.
    pub normalized: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.node_allocation.values().all(|v| v.is_empty())
            && self.node_update.values().all(|v| v.is_empty())
            && self.node_preemptions.values().all(|v| v.is_empty())
            && self.deployment.is_none()
    }
}

/// The committed outcome of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// Raft index the plan's allocations were committed at; 0 when nothing
    /// was committed.
    pub alloc_index: u64,
    /// When > 0, the scheduler must refresh to this index and replan the
    /// remainder.
    pub refresh_index: u64,
    /// Allocations that survived per-node validation, per node.
    pub node_allocation: HashMap<String, Vec<Allocation>>,
}

impl PlanResult {
    pub fn full_commit(&self, plan: &Plan) -> bool {
        let proposed: usize = plan.node_allocation.values().map(Vec::len).sum();
        let committed: usize = self.node_allocation.values().map(Vec::len).sum();
        proposed == committed
    }
}

// ── Deployments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Paused,
    Successful,
    Cancelled,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Successful | DeploymentStatus::Cancelled | DeploymentStatus::Failed
        )
    }
}

/// Rolling-update accounting for one task group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTaskGroupState {
    pub desired_total: u32,
    pub desired_canaries: u32,
    pub placed_allocs: u32,
    pub healthy_allocs: u32,
    pub unhealthy_allocs: u32,
    pub promoted: bool,
}

/// A rolling-update state machine attached to a job version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub namespace: String,
    pub job_id: String,
    pub job_version: u64,
    pub status: DeploymentStatus,
    pub status_description: String,
    pub task_groups: HashMap<String, DeploymentTaskGroupState>,
    pub create_index: u64,
    pub modify_index: u64,
}

// ── ACL / namespaces / volumes / services / variables ─────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclPolicy {
    pub name: String,
    pub description: String,
    /// Opaque rule document; policy algebra lives outside the core.
    pub rules: String,
    pub create_index: u64,
    pub modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclToken {
    pub accessor_id: String,
    pub secret_id: String,
    pub name: String,
    /// "management" or "client".
    pub token_type: String,
    pub policies: Vec<String>,
    pub roles: Vec<String>,
    /// Epoch millis; 0 means no expiry.
    pub expiration_millis: i64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl AclToken {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiration_millis > 0 && now_millis >= self.expiration_millis
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclRole {
    pub id: String,
    pub name: String,
    pub policies: Vec<String>,
    pub create_index: u64,
    pub modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub description: String,
    /// Quota the namespace maps to; enforcement is out of core.
    pub quota: String,
    pub create_index: u64,
    pub modify_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsiClaimMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiClaim {
    pub alloc_id: String,
    pub node_id: String,
    pub mode: CsiClaimMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiVolume {
    pub id: String,
    pub namespace: String,
    pub plugin_id: String,
    pub max_readers: u32,
    pub max_writers: u32,
    pub claims: Vec<CsiClaim>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl CsiVolume {
    pub fn can_claim(&self, mode: CsiClaimMode) -> bool {
        let (readers, writers) = self.claims.iter().fold((0u32, 0u32), |(r, w), c| match c.mode {
            CsiClaimMode::Read => (r + 1, w),
            CsiClaimMode::Write => (r, w + 1),
        });
        match mode {
            CsiClaimMode::Read => readers < self.max_readers,
            CsiClaimMode::Write => writers < self.max_writers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub service_name: String,
    pub namespace: String,
    pub node_id: String,
    pub alloc_id: String,
    pub address: String,
    pub port: u16,
    pub create_index: u64,
    pub modify_index: u64,
}

/// A mutable key-value entry with CAS support and an optional holder lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub namespace: String,
    pub path: String,
    /// Opaque items; encryption-at-rest is out of core.
    pub items: HashMap<String, String>,
    /// Present while a lock is held on this variable.
    pub lock_holder: Option<String>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// Cluster-wide scheduler tuning, a CAS-protected singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enables preemption per scheduler name.
    pub preemption_enabled: HashMap<String, bool>,
    /// Pause all scheduling without stopping the workers.
    pub paused: bool,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut preemption_enabled = HashMap::new();
        for s in ["service", "batch", "system"] {
            preemption_enabled.insert(s.to_string(), s == "system");
        }
        Self {
            preemption_enabled,
            paused: false,
            create_index: 0,
            modify_index: 0,
        }
    }
}

/// Cluster identity singleton, written once at bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub cluster_id: String,
    pub create_millis: i64,
}

// ── Job summaries ─────────────────────────────────────────────────────────────

/// Per-task-group placement accounting maintained by the FSM, used by the
/// restore-time reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupSummary {
    pub queued: u32,
    pub starting: u32,
    pub running: u32,
    pub complete: u32,
    pub failed: u32,
    pub lost: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub namespace: String,
    pub job_id: String,
    pub task_groups: HashMap<String, TaskGroupSummary>,
    pub create_index: u64,
    pub modify_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> Node {
        let mut n = Node {
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
        n.compute_class();
        n
    }

    #[test]
    fn computed_class_is_stable_and_attribute_sensitive() {
        let a = test_node();
        let mut b = a.clone();
        b.id = generate_id();
        b.secret_id = generate_id();
        b.compute_class();
        // Identity fields do not participate in the class hash.
        assert_eq!(a.computed_class, b.computed_class);

        b.attributes.insert("kernel".into(), "darwin".into());
        b.compute_class();
        assert_ne!(a.computed_class, b.computed_class);
    }

    #[test]
    fn node_schedulability() {
        let mut n = test_node();
        assert!(n.is_schedulable());

        n.scheduling_eligibility = SchedulingEligibility::Ineligible;
        assert!(!n.is_schedulable());

        n.scheduling_eligibility = SchedulingEligibility::Eligible;
        n.drain_strategy = Some(DrainStrategy {
            deadline_ms: 0,
            ignore_system_jobs: false,
            force_deadline_hit: false,
        });
        assert!(!n.is_schedulable());
    }

    #[test]
    fn resources_superset() {
        let node = Resources {
            cpu_mhz: 1000,
            memory_mb: 512,
            disk_mb: 1000,
        };
        let fits = Resources {
            cpu_mhz: 500,
            memory_mb: 512,
            disk_mb: 100,
        };
        let too_big = Resources {
            cpu_mhz: 500,
            memory_mb: 513,
            disk_mb: 100,
        };
        assert!(node.superset_of(&fits));
        assert!(!node.superset_of(&too_big));
    }

    #[test]
    fn eval_status_terminality() {
        assert!(!EvalStatus::Pending.is_terminal());
        assert!(!EvalStatus::Blocked.is_terminal());
        assert!(EvalStatus::Complete.is_terminal());
        assert!(EvalStatus::Failed.is_terminal());
        assert!(EvalStatus::Cancelled.is_terminal());
    }

    #[test]
    fn alloc_liveness() {
        let mut a = Allocation {
            id: generate_id(),
            namespace: DEFAULT_NAMESPACE.into(),
            job_id: "web".into(),
            job_version: 1,
            task_group: "app".into(),
            node_id: generate_id(),
            eval_id: generate_id(),
            resources: Resources::default(),
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            client_status: AllocClientStatus::Running,
            preempted_by_allocation: String::new(),
            deployment_id: String::new(),
            alloc_index: 0,
            create_index: 0,
            modify_index: 0,
        };
        assert!(a.is_live());
        a.client_status = AllocClientStatus::Failed;
        assert!(!a.is_live());
        assert!(a.is_terminal());
    }

    #[test]
    fn csi_claim_limits() {
        let mut vol = CsiVolume {
            id: "vol1".into(),
            namespace: DEFAULT_NAMESPACE.into(),
            plugin_id: "ebs".into(),
            max_readers: 2,
            max_writers: 1,
            claims: vec![],
            create_index: 0,
            modify_index: 0,
        };
        assert!(vol.can_claim(CsiClaimMode::Write));
        vol.claims.push(CsiClaim {
            alloc_id: "a1".into(),
            node_id: "n1".into(),
            mode: CsiClaimMode::Write,
        });
        assert!(!vol.can_claim(CsiClaimMode::Write));
        assert!(vol.can_claim(CsiClaimMode::Read));
    }

    #[test]
    fn plan_emptiness() {
        let mut p = Plan::default();
        assert!(p.is_empty());
        p.node_allocation.insert("n1".into(), vec![]);
        assert!(p.is_empty());
    }

    #[test]
    fn token_expiry() {
        let t = AclToken {
            accessor_id: generate_id(),
            secret_id: generate_id(),
            name: "ci".into(),
            token_type: "client".into(),
            policies: vec![],
            roles: vec![],
            expiration_millis: 1_000,
            create_index: 0,
            modify_index: 0,
        };
        assert!(!t.is_expired(999));
        assert!(t.is_expired(1_000));
    }
}
