//! The deterministic state machine applied under the Raft log.
//!
//! Every log entry is a [`LogCommand`]: a one-byte message-type discriminant
//! (bit 0x80 = ignore-unknown, for forward-compatible upgrades), an 8-byte
//! big-endian proposer timestamp in epoch millis, then a `serde_json` body.
//! The timestamp travels in the log so replicas agree on wall-clock-derived
//! fields and the snapshot time table stays deterministic.
//!
//! For each command the FSM decodes, validates, mutates the state store in
//! one write transaction, and only after the commit emits side effects:
//! enqueue into the eval broker, insert into the blocked tracker, add/remove
//! periodic jobs, and unblock cached classes. Side effects are idempotent
//! because Raft can re-apply on restart.
//!
//! Failure surface: an unknown message type without the ignore flag, or a
//! malformed body, panics (the committed log is corrupt). Logically invalid
//! mutations return a validation error in the apply response and leave the
//! store untouched.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::errors::RpcError;
use crate::periodic::PeriodicDispatcher;
use crate::state_store::{StateStore, StateTables, Table, Txn};
use crate::structs::*;

/// Set on the discriminant byte when replicas too old to know the type may
/// skip the entry instead of panicking.
pub const IGNORE_UNKNOWN_FLAG: u8 = 0x80;

// ── Message types ─────────────────────────────────────────────────────────────

/// Log command discriminants. Values are wire-stable; append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    NodeRegister = 0,
    NodeDeregister = 1,
    NodeStatusUpdate = 2,
    NodeDrainUpdate = 3,
    NodeEligibilityUpdate = 4,
    JobRegister = 5,
    JobDeregister = 6,
    JobStability = 7,
    EvalUpdate = 8,
    EvalDelete = 9,
    AllocUpdate = 10,
    AllocClientUpdate = 11,
    AllocDesiredTransition = 12,
    ApplyPlanResults = 13,
    DeploymentStatusUpdate = 14,
    DeploymentPromote = 15,
    DeploymentAllocHealth = 16,
    DeploymentDelete = 17,
    AclPolicyUpsert = 18,
    AclPolicyDelete = 19,
    AclTokenUpsert = 20,
    AclTokenDelete = 21,
    AclRoleUpsert = 22,
    AclRoleDelete = 23,
    SchedulerConfigSet = 24,
    ClusterMetadataSet = 25,
    CsiVolumeRegister = 26,
    CsiVolumeDeregister = 27,
    CsiVolumeClaim = 28,
    NamespaceUpsert = 29,
    NamespaceDelete = 30,
    ServiceRegister = 31,
    ServiceDeregister = 32,
    VariableApply = 33,
    PeriodicLaunchUpsert = 34,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            0 => NodeRegister,
            1 => NodeDeregister,
            2 => NodeStatusUpdate,
            3 => NodeDrainUpdate,
            4 => NodeEligibilityUpdate,
            5 => JobRegister,
            6 => JobDeregister,
            7 => JobStability,
            8 => EvalUpdate,
            9 => EvalDelete,
            10 => AllocUpdate,
            11 => AllocClientUpdate,
            12 => AllocDesiredTransition,
            13 => ApplyPlanResults,
            14 => DeploymentStatusUpdate,
            15 => DeploymentPromote,
            16 => DeploymentAllocHealth,
            17 => DeploymentDelete,
            18 => AclPolicyUpsert,
            19 => AclPolicyDelete,
            20 => AclTokenUpsert,
            21 => AclTokenDelete,
            22 => AclRoleUpsert,
            23 => AclRoleDelete,
            24 => SchedulerConfigSet,
            25 => ClusterMetadataSet,
            26 => CsiVolumeRegister,
            27 => CsiVolumeDeregister,
            28 => CsiVolumeClaim,
            29 => NamespaceUpsert,
            30 => NamespaceDelete,
            31 => ServiceRegister,
            32 => ServiceDeregister,
            33 => VariableApply,
            34 => PeriodicLaunchUpsert,
            _ => return None,
        })
    }
}

// ── Command envelope ──────────────────────────────────────────────────────────

/// Raw bytes of one log command; the application payload type of the Raft
/// type config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogCommand(pub Vec<u8>);

impl LogCommand {
    /// Encode `body` under message type `mt` with the proposer's clock.
    pub fn encode<T: Serialize>(mt: MessageType, body: &T, timestamp_millis: i64) -> Self {
        Self::encode_flagged(mt, body, timestamp_millis, false)
    }

    pub fn encode_flagged<T: Serialize>(
        mt: MessageType,
        body: &T,
        timestamp_millis: i64,
        ignorable: bool,
    ) -> Self {
        let mut buf = Vec::new();
        let mut b = mt as u8;
        if ignorable {
            b |= IGNORE_UNKNOWN_FLAG;
        }
        buf.push(b);
        buf.extend_from_slice(&timestamp_millis.to_be_bytes());
        // Serialization of an in-memory struct cannot fail here.
        buf.extend_from_slice(&serde_json::to_vec(body).expect("encode log command"));
        Self(buf)
    }

    /// Split into (raw type byte, ignorable, timestamp, body bytes).
    /// Panics on a truncated frame: committed log entries are trusted.
    pub fn decode_parts(&self) -> (u8, bool, i64, &[u8]) {
        assert!(self.0.len() >= 9, "corrupt raft entry: truncated header");
        let raw = self.0[0];
        let ts = i64::from_be_bytes(self.0[1..9].try_into().expect("timestamp bytes"));
        (
            raw & !IGNORE_UNKNOWN_FLAG,
            raw & IGNORE_UNKNOWN_FLAG != 0,
            ts,
            &self.0[9..],
        )
    }
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> T {
    // A committed entry that fails to decode means the log is corrupt.
    serde_json::from_slice(body).expect("corrupt raft entry: undecodable body")
}

/// The FSM's answer to one applied command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedResponse {
    pub index: u64,
    /// Validation/conflict outcome; `None` is success.
    pub error: Option<RpcError>,
}

impl AppliedResponse {
    fn ok(index: u64) -> Self {
        Self { index, error: None }
    }

    fn err(index: u64, error: RpcError) -> Self {
        Self {
            index,
            error: Some(error),
        }
    }
}

// ── Command payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegisterRequest {
    pub node: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeregisterRequest {
    pub node_ids: Vec<String>,
    /// Evals for the jobs that lost placements, pre-created by the caller
    /// so the FSM stays deterministic.
    pub evals: Vec<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusUpdateRequest {
    pub node_id: String,
    pub status: NodeStatus,
    pub evals: Vec<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDrainUpdateRequest {
    pub node_id: String,
    pub drain_strategy: Option<DrainStrategy>,
    pub evals: Vec<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEligibilityUpdateRequest {
    pub node_id: String,
    pub eligibility: SchedulingEligibility,
    pub evals: Vec<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRegisterRequest {
    pub job: Job,
    /// Synthesized by the proposer for directly schedulable jobs.
    pub eval: Option<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDeregisterRequest {
    pub namespace: String,
    pub job_id: String,
    pub purge: bool,
    pub eval: Option<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStabilityRequest {
    pub namespace: String,
    pub job_id: String,
    pub job_version: u64,
    pub stable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalUpdateRequest {
    pub evals: Vec<Evaluation>,
}

/// Deletes terminal evals and allocs; emitted by the core scheduler's reap
/// pass and by eval-ack cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalDeleteRequest {
    pub eval_ids: Vec<String>,
    pub alloc_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocUpdateRequest {
    pub allocs: Vec<Allocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocClientStatusUpdate {
    pub alloc_id: String,
    pub client_status: AllocClientStatus,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocClientUpdateRequest {
    pub updates: Vec<AllocClientStatusUpdate>,
    pub evals: Vec<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocDesiredTransitionRequest {
    pub transitions: HashMap<String, DesiredTransition>,
    pub evals: Vec<Evaluation>,
}

/// The committed form of a validated plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyPlanResultsRequest {
    /// New allocations, alloc_index already assigned contiguously.
    pub allocs: Vec<Allocation>,
    /// (alloc id, reason) pairs to stop.
    pub stops: Vec<PlanAllocStop>,
    /// Victims evicted for a preemptor.
    pub preemptions: Vec<PlanPreemption>,
    pub deployment: Option<Deployment>,
    /// Follow-up evals for jobs that lost allocs to preemption.
    pub preemption_evals: Vec<Evaluation>,
    /// The scheduling eval, rewritten with queued allocations.
    pub eval: Option<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatusUpdateRequest {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub description: String,
    pub eval: Option<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPromoteRequest {
    pub deployment_id: String,
    /// Empty means promote every task group.
    pub groups: Vec<String>,
    pub eval: Option<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentAllocHealthRequest {
    pub deployment_id: String,
    pub healthy_alloc_ids: Vec<String>,
    pub unhealthy_alloc_ids: Vec<String>,
    pub eval: Option<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDeleteRequest {
    pub deployment_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclPolicyUpsertRequest {
    pub policies: Vec<AclPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclPolicyDeleteRequest {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclTokenUpsertRequest {
    pub tokens: Vec<AclToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclTokenDeleteRequest {
    pub accessor_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRoleUpsertRequest {
    pub roles: Vec<AclRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRoleDeleteRequest {
    pub role_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfigSetRequest {
    pub config: SchedulerConfig,
    /// When set, the write only lands if the stored modify index still
    /// equals `config.modify_index`.
    pub cas: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetadataSetRequest {
    pub meta: ClusterMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsiVolumeRegisterRequest {
    pub volumes: Vec<CsiVolume>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsiVolumeDeregisterRequest {
    pub namespace: String,
    pub volume_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsiVolumeClaimRequest {
    pub namespace: String,
    pub volume_id: String,
    pub claim: CsiClaim,
    /// True releases the claim instead of taking it.
    pub release: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceUpsertRequest {
    pub namespaces: Vec<Namespace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceDeleteRequest {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegisterRequest {
    pub services: Vec<ServiceRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDeregisterRequest {
    pub namespace: String,
    pub service_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarOp {
    Set,
    Cas,
    Delete,
    DeleteCas,
    LockAcquire,
    LockRelease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableApplyRequest {
    pub op: VarOp,
    pub var: Variable,
    /// Expected modify index for the CAS ops.
    pub cas_index: u64,
    /// Holder identity for the lock ops.
    pub lock_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicLaunchUpsertRequest {
    pub namespace: String,
    pub job_id: String,
    pub launch_millis: i64,
}

// ── FSM ───────────────────────────────────────────────────────────────────────

/// Sinks the FSM feeds after a transaction commits. All of them tolerate
/// duplicate delivery.
pub struct SideEffects {
    pub broker: Arc<EvalBroker>,
    pub blocked: Arc<BlockedEvals>,
    pub periodic: Arc<PeriodicDispatcher>,
}

/// Coarse map from Raft index to proposer wall clock, persisted in the
/// snapshot so restores keep the association.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeTable {
    pub entries: Vec<(u64, i64)>,
}

impl TimeTable {
    const GRANULARITY_MILLIS: i64 = 60_000;
    const MAX_ENTRIES: usize = 4096;

    fn witness(&mut self, index: u64, millis: i64) {
        if let Some((_, last)) = self.entries.last() {
            if millis - *last < Self::GRANULARITY_MILLIS {
                return;
            }
        }
        self.entries.push((index, millis));
        if self.entries.len() > Self::MAX_ENTRIES {
            self.entries.remove(0);
        }
    }
}

/// The state machine. Exactly one instance mutates the store; everything
/// else reads snapshots.
pub struct Fsm {
    store: Arc<StateStore>,
    effects: SideEffects,
    time_table: std::sync::Mutex<TimeTable>,
}

impl Fsm {
    pub fn new(store: Arc<StateStore>, effects: SideEffects) -> Self {
        Self {
            store,
            effects,
            time_table: std::sync::Mutex::new(TimeTable::default()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Apply one committed command at `index`.
    pub fn apply(&self, index: u64, cmd: &LogCommand) -> AppliedResponse {
        let (raw_type, ignorable, ts, body) = cmd.decode_parts();
        let Some(mt) = MessageType::from_u8(raw_type) else {
            if ignorable {
                warn!(msg_type = raw_type, index, "ignoring unknown log command");
                return AppliedResponse::ok(index);
            }
            panic!("corrupt raft entry: unknown message type {raw_type}");
        };

        self.time_table.lock().unwrap().witness(index, ts);

        let mut txn = self.store.begin(index);
        let result = self.dispatch(mt, &mut txn, ts, body);

        match result {
            Ok(effects) => {
                self.store.commit(txn);
                self.run_effects(effects, index);
                AppliedResponse::ok(index)
            }
            Err(e) => {
                // Nothing was published; the transaction is dropped.
                debug!(msg_type = ?mt, index, error = %e, "command rejected");
                AppliedResponse::err(index, e)
            }
        }
    }

    fn dispatch(
        &self,
        mt: MessageType,
        txn: &mut Txn,
        ts: i64,
        body: &[u8],
    ) -> Result<Effects, RpcError> {
        match mt {
            MessageType::NodeRegister => self.apply_node_register(txn, ts, decode_body(body)),
            MessageType::NodeDeregister => self.apply_node_deregister(txn, decode_body(body)),
            MessageType::NodeStatusUpdate => self.apply_node_status(txn, ts, decode_body(body)),
            MessageType::NodeDrainUpdate => self.apply_node_drain(txn, decode_body(body)),
            MessageType::NodeEligibilityUpdate => {
                self.apply_node_eligibility(txn, decode_body(body))
            }
            MessageType::JobRegister => self.apply_job_register(txn, decode_body(body)),
            MessageType::JobDeregister => self.apply_job_deregister(txn, decode_body(body)),
            MessageType::JobStability => self.apply_job_stability(txn, decode_body(body)),
            MessageType::EvalUpdate => self.apply_eval_update(txn, decode_body(body)),
            MessageType::EvalDelete => self.apply_eval_delete(txn, decode_body(body)),
            MessageType::AllocUpdate => self.apply_alloc_update(txn, decode_body(body)),
            MessageType::AllocClientUpdate => {
                self.apply_alloc_client_update(txn, decode_body(body))
            }
            MessageType::AllocDesiredTransition => {
                self.apply_alloc_desired_transition(txn, decode_body(body))
            }
            MessageType::ApplyPlanResults => self.apply_plan_results(txn, decode_body(body)),
            MessageType::DeploymentStatusUpdate => {
                self.apply_deployment_status(txn, decode_body(body))
            }
            MessageType::DeploymentPromote => self.apply_deployment_promote(txn, decode_body(body)),
            MessageType::DeploymentAllocHealth => {
                self.apply_deployment_alloc_health(txn, decode_body(body))
            }
            MessageType::DeploymentDelete => self.apply_deployment_delete(txn, decode_body(body)),
            MessageType::AclPolicyUpsert => self.apply_acl_policy_upsert(txn, decode_body(body)),
            MessageType::AclPolicyDelete => self.apply_acl_policy_delete(txn, decode_body(body)),
            MessageType::AclTokenUpsert => self.apply_acl_token_upsert(txn, decode_body(body)),
            MessageType::AclTokenDelete => self.apply_acl_token_delete(txn, decode_body(body)),
            MessageType::AclRoleUpsert => self.apply_acl_role_upsert(txn, decode_body(body)),
            MessageType::AclRoleDelete => self.apply_acl_role_delete(txn, decode_body(body)),
            MessageType::SchedulerConfigSet => {
                self.apply_scheduler_config_set(txn, decode_body(body))
            }
            MessageType::ClusterMetadataSet => {
                self.apply_cluster_metadata_set(txn, decode_body(body))
            }
            MessageType::CsiVolumeRegister => self.apply_csi_register(txn, decode_body(body)),
            MessageType::CsiVolumeDeregister => self.apply_csi_deregister(txn, decode_body(body)),
            MessageType::CsiVolumeClaim => self.apply_csi_claim(txn, decode_body(body)),
            MessageType::NamespaceUpsert => self.apply_namespace_upsert(txn, decode_body(body)),
            MessageType::NamespaceDelete => self.apply_namespace_delete(txn, decode_body(body)),
            MessageType::ServiceRegister => self.apply_service_register(txn, decode_body(body)),
            MessageType::ServiceDeregister => self.apply_service_deregister(txn, decode_body(body)),
            MessageType::VariableApply => self.apply_variable(txn, decode_body(body)),
            MessageType::PeriodicLaunchUpsert => {
                self.apply_periodic_launch(txn, decode_body(body))
            }
        }
    }

    fn run_effects(&self, effects: Effects, index: u64) {
        for eval in effects.enqueue {
            self.effects.broker.enqueue(eval);
        }
        for eval in effects.block {
            self.effects.blocked.block(eval);
        }
        for job in effects.periodic_add {
            self.effects.periodic.add(job);
        }
        for (ns, job_id) in effects.periodic_remove {
            self.effects.periodic.remove(&ns, &job_id);
        }
        for class in effects.unblock_classes {
            self.effects.blocked.unblock(class, index);
        }
        for node_id in effects.unblock_nodes {
            self.effects.blocked.unblock_node(&node_id, index);
        }
        for quota in effects.unblock_quotas {
            self.effects.blocked.unblock_quota(&quota, index);
        }
        for (ns, job_id) in effects.untrack {
            self.effects.blocked.untrack(&ns, &job_id);
        }
    }

    // ── Node commands ────────────────────────────────────────────────────

    fn apply_node_register(
        &self,
        txn: &mut Txn,
        ts: i64,
        req: NodeRegisterRequest,
    ) -> Result<Effects, RpcError> {
        let mut node = req.node;
        if node.id.is_empty() {
            return Err(RpcError::Validation("node id is required".into()));
        }
        node.compute_class();
        node.status_updated_at = ts;

        let mut effects = Effects::default();
        match txn.tables.nodes.get(&node.id) {
            Some(existing) => {
                node.create_index = existing.create_index;
                // Re-registration of a live node keeps its operator state.
                node.scheduling_eligibility = existing.scheduling_eligibility;
                node.drain_strategy = existing.drain_strategy.clone();
            }
            None => node.create_index = txn.index(),
        }
        node.modify_index = txn.index();

        if node.is_schedulable() {
            effects.unblock_classes.push(node.computed_class);
        }
        txn.tables.nodes.insert(node.id.clone(), Arc::new(node));
        txn.bump(Table::Nodes);
        Ok(effects)
    }

    fn apply_node_deregister(
        &self,
        txn: &mut Txn,
        req: NodeDeregisterRequest,
    ) -> Result<Effects, RpcError> {
        for id in &req.node_ids {
            if txn.tables.nodes.remove(id).is_none() {
                return Err(RpcError::UnknownNode(id.clone()));
            }
        }
        txn.bump(Table::Nodes);
        self.persist_evals(txn, req.evals)
    }

    fn apply_node_status(
        &self,
        txn: &mut Txn,
        ts: i64,
        req: NodeStatusUpdateRequest,
    ) -> Result<Effects, RpcError> {
        let node = txn
            .tables
            .nodes
            .get(&req.node_id)
            .ok_or_else(|| RpcError::UnknownNode(req.node_id.clone()))?;
        let mut node = (**node).clone();
        node.status = req.status;
        node.status_updated_at = ts;
        node.modify_index = txn.index();
        let unblock = node.is_schedulable().then_some(node.computed_class);

        txn.tables.nodes.insert(node.id.clone(), Arc::new(node));
        txn.bump(Table::Nodes);

        let mut effects = self.persist_evals(txn, req.evals)?;
        effects.unblock_classes.extend(unblock);
        Ok(effects)
    }

    fn apply_node_drain(
        &self,
        txn: &mut Txn,
        req: NodeDrainUpdateRequest,
    ) -> Result<Effects, RpcError> {
        let node = txn
            .tables
            .nodes
            .get(&req.node_id)
            .ok_or_else(|| RpcError::UnknownNode(req.node_id.clone()))?;
        let mut node = (**node).clone();
        node.drain_strategy = req.drain_strategy;
        // Draining implies ineligibility; clearing a drain does not restore
        // it, that takes an explicit eligibility update.
        if node.drain_strategy.is_some() {
            node.scheduling_eligibility = SchedulingEligibility::Ineligible;
        }
        node.modify_index = txn.index();
        txn.tables.nodes.insert(node.id.clone(), Arc::new(node));
        txn.bump(Table::Nodes);
        self.persist_evals(txn, req.evals)
    }

    fn apply_node_eligibility(
        &self,
        txn: &mut Txn,
        req: NodeEligibilityUpdateRequest,
    ) -> Result<Effects, RpcError> {
        let node = txn
            .tables
            .nodes
            .get(&req.node_id)
            .ok_or_else(|| RpcError::UnknownNode(req.node_id.clone()))?;
        if req.eligibility == SchedulingEligibility::Eligible && node.drain_strategy.is_some() {
            return Err(RpcError::Validation(
                "cannot make a draining node eligible".into(),
            ));
        }
        let mut node = (**node).clone();
        node.scheduling_eligibility = req.eligibility;
        node.modify_index = txn.index();
        let unblock = node.is_schedulable().then_some(node.computed_class);
        txn.tables.nodes.insert(node.id.clone(), Arc::new(node));
        txn.bump(Table::Nodes);

        let mut effects = self.persist_evals(txn, req.evals)?;
        effects.unblock_classes.extend(unblock);
        Ok(effects)
    }

    // ── Job commands ─────────────────────────────────────────────────────

    fn apply_job_register(
        &self,
        txn: &mut Txn,
        req: JobRegisterRequest,
    ) -> Result<Effects, RpcError> {
        let mut job = req.job;
        if job.id.is_empty() {
            return Err(RpcError::Validation("job id is required".into()));
        }
        if job.namespace.is_empty() {
            job.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if !txn.tables.namespaces.contains_key(&job.namespace)
            && job.namespace != DEFAULT_NAMESPACE
        {
            return Err(RpcError::Validation(format!(
                "namespace {:?} does not exist",
                job.namespace
            )));
        }

        let key = job.key();
        match txn.tables.jobs.get(&key) {
            Some(existing) => {
                job.create_index = existing.create_index;
                job.version = existing.version + 1;
            }
            None => {
                job.create_index = txn.index();
                job.version = 0;
            }
        }
        job.modify_index = txn.index();
        job.status = JobStatus::Pending;

        let mut effects = Effects::default();
        if job.is_periodic_active() {
            effects.periodic_add.push(job.clone());
        }
        self.ensure_job_summary(txn, &job);
        txn.tables.jobs.insert(key, Arc::new(job));
        txn.bump(Table::Jobs);
        txn.bump(Table::JobSummaries);

        let eval_effects = self.persist_evals(txn, req.eval.into_iter().collect())?;
        effects.merge(eval_effects);
        Ok(effects)
    }

    fn apply_job_deregister(
        &self,
        txn: &mut Txn,
        req: JobDeregisterRequest,
    ) -> Result<Effects, RpcError> {
        let key = (req.namespace.clone(), req.job_id.clone());
        let Some(job) = txn.tables.jobs.get(&key) else {
            return Err(RpcError::UnknownJob(req.job_id.clone()));
        };

        let mut effects = Effects::default();
        effects
            .periodic_remove
            .push((req.namespace.clone(), req.job_id.clone()));

        if req.purge {
            txn.tables.jobs.remove(&key);
            txn.tables.job_summaries.remove(&key);
            txn.tables.periodic_launches.remove(&key);
            txn.bump(Table::JobSummaries);
            txn.bump(Table::PeriodicLaunches);
        } else {
            let mut job = (**job).clone();
            job.stop = true;
            job.status = JobStatus::Dead;
            job.modify_index = txn.index();
            txn.tables.jobs.insert(key, Arc::new(job));
        }
        txn.bump(Table::Jobs);

        effects.merge(self.persist_evals(txn, req.eval.into_iter().collect())?);
        Ok(effects)
    }

    fn apply_job_stability(
        &self,
        txn: &mut Txn,
        req: JobStabilityRequest,
    ) -> Result<Effects, RpcError> {
        let key = (req.namespace.clone(), req.job_id.clone());
        let job = txn
            .tables
            .jobs
            .get(&key)
            .ok_or_else(|| RpcError::UnknownJob(req.job_id.clone()))?;
        if job.version != req.job_version {
            return Err(RpcError::Validation(format!(
                "job version {} is not current",
                req.job_version
            )));
        }
        let mut job = (**job).clone();
        job.stable = req.stable;
        job.modify_index = txn.index();
        txn.tables.jobs.insert(key, Arc::new(job));
        txn.bump(Table::Jobs);
        Ok(Effects::default())
    }

    // ── Eval commands ────────────────────────────────────────────────────

    fn apply_eval_update(
        &self,
        txn: &mut Txn,
        req: EvalUpdateRequest,
    ) -> Result<Effects, RpcError> {
        self.persist_evals(txn, req.evals)
    }

    fn apply_eval_delete(
        &self,
        txn: &mut Txn,
        req: EvalDeleteRequest,
    ) -> Result<Effects, RpcError> {
        let mut touched_evals = false;
        let mut touched_allocs = false;
        for id in &req.eval_ids {
            touched_evals |= txn.tables.evals.remove(id).is_some();
        }
        let mut jobs = Vec::new();
        for id in &req.alloc_ids {
            if let Some(a) = txn.tables.allocs.remove(id) {
                touched_allocs = true;
                jobs.push((a.namespace.clone(), a.job_id.clone()));
            }
        }
        if touched_evals {
            txn.bump(Table::Evals);
        }
        if touched_allocs {
            txn.bump(Table::Allocs);
            for (ns, job_id) in jobs {
                self.recompute_job_summary(txn, &ns, &job_id);
            }
            txn.bump(Table::JobSummaries);
        }
        Ok(Effects::default())
    }

    /// Shared tail for every command that carries evals: assign indexes,
    /// upsert, fold queued allocations into the job summary, and route the
    /// eval to the broker or the blocked tracker.
    fn persist_evals(
        &self,
        txn: &mut Txn,
        evals: Vec<Evaluation>,
    ) -> Result<Effects, RpcError> {
        let mut effects = Effects::default();
        if evals.is_empty() {
            return Ok(effects);
        }
        for mut eval in evals {
            if eval.id.is_empty() {
                return Err(RpcError::Validation("eval id is required".into()));
            }
            match txn.tables.evals.get(&eval.id) {
                Some(existing) => eval.create_index = existing.create_index,
                None => eval.create_index = txn.index(),
            }
            eval.modify_index = txn.index();

            self.fold_queued_into_summary(txn, &eval);

            if eval.should_enqueue() {
                effects.enqueue.push(eval.clone());
            } else if eval.should_block() {
                effects.block.push(eval.clone());
            } else if eval.status == EvalStatus::Complete && eval.queued_allocations.is_empty() {
                // A fully successful cycle; any older blocked eval for the
                // job is moot.
                effects
                    .untrack
                    .push((eval.namespace.clone(), eval.job_id.clone()));
            }
            txn.tables.evals.insert(eval.id.clone(), Arc::new(eval));
        }
        txn.bump(Table::Evals);
        Ok(effects)
    }

    fn fold_queued_into_summary(&self, txn: &mut Txn, eval: &Evaluation) {
        if eval.queued_allocations.is_empty() {
            return;
        }
        let key = (eval.namespace.clone(), eval.job_id.clone());
        let mut summary = txn
            .tables
            .job_summaries
            .get(&key)
            .map(|s| (**s).clone())
            .unwrap_or_else(|| JobSummary {
                namespace: eval.namespace.clone(),
                job_id: eval.job_id.clone(),
                task_groups: HashMap::new(),
                create_index: txn.index(),
                modify_index: txn.index(),
            });
        for (tg, queued) in &eval.queued_allocations {
            summary.task_groups.entry(tg.clone()).or_default().queued = *queued;
        }
        summary.modify_index = txn.index();
        txn.tables.job_summaries.insert(key, Arc::new(summary));
        txn.bump(Table::JobSummaries);
    }

    // ── Alloc commands ───────────────────────────────────────────────────

    fn apply_alloc_update(
        &self,
        txn: &mut Txn,
        req: AllocUpdateRequest,
    ) -> Result<Effects, RpcError> {
        let mut effects = Effects::default();
        let mut jobs = Vec::new();
        for mut alloc in req.allocs {
            match txn.tables.allocs.get(&alloc.id) {
                Some(existing) => alloc.create_index = existing.create_index,
                None => alloc.create_index = txn.index(),
            }
            alloc.modify_index = txn.index();
            if alloc.is_terminal() {
                // Freed capacity: wake evals keyed on the node and on the
                // node's class.
                effects.unblock_nodes.push(alloc.node_id.clone());
                if let Some(node) = txn.tables.nodes.get(&alloc.node_id) {
                    effects.unblock_classes.push(node.computed_class);
                }
            }
            jobs.push((alloc.namespace.clone(), alloc.job_id.clone()));
            txn.tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
        }
        txn.bump(Table::Allocs);
        jobs.dedup();
        for (ns, job_id) in jobs {
            self.recompute_job_summary(txn, &ns, &job_id);
        }
        txn.bump(Table::JobSummaries);
        Ok(effects)
    }

    fn apply_alloc_client_update(
        &self,
        txn: &mut Txn,
        req: AllocClientUpdateRequest,
    ) -> Result<Effects, RpcError> {
        let mut effects = Effects::default();
        let mut jobs = Vec::new();
        for update in req.updates {
            let alloc = txn
                .tables
                .allocs
                .get(&update.alloc_id)
                .ok_or_else(|| RpcError::UnknownAlloc(update.alloc_id.clone()))?;
            let mut alloc = (**alloc).clone();
            alloc.client_status = update.client_status;
            alloc.desired_description = update.description;
            alloc.modify_index = txn.index();
            if alloc.client_status.is_terminal() {
                // A terminal alloc frees node resources; blocked evals keyed
                // on that node or its class may become placeable.
                effects.unblock_nodes.push(alloc.node_id.clone());
                if let Some(node) = txn.tables.nodes.get(&alloc.node_id) {
                    effects.unblock_classes.push(node.computed_class);
                }
            }
            jobs.push((alloc.namespace.clone(), alloc.job_id.clone()));
            txn.tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
        }
        txn.bump(Table::Allocs);
        jobs.dedup();
        for (ns, job_id) in jobs {
            self.recompute_job_summary(txn, &ns, &job_id);
        }
        txn.bump(Table::JobSummaries);

        effects.merge(self.persist_evals(txn, req.evals)?);
        Ok(effects)
    }

    fn apply_alloc_desired_transition(
        &self,
        txn: &mut Txn,
        req: AllocDesiredTransitionRequest,
    ) -> Result<Effects, RpcError> {
        for (alloc_id, _transition) in &req.transitions {
            let alloc = txn
                .tables
                .allocs
                .get(alloc_id)
                .ok_or_else(|| RpcError::UnknownAlloc(alloc_id.clone()))?;
            let mut alloc = (**alloc).clone();
            alloc.modify_index = txn.index();
            txn.tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
        }
        if !req.transitions.is_empty() {
            txn.bump(Table::Allocs);
        }
        self.persist_evals(txn, req.evals)
    }

    // ── Plan results ─────────────────────────────────────────────────────

    fn apply_plan_results(
        &self,
        txn: &mut Txn,
        req: ApplyPlanResultsRequest,
    ) -> Result<Effects, RpcError> {
        let mut effects = Effects::default();
        let mut jobs = Vec::new();

        // A deployment riding along adopts the plan's placements.
        let deployment_id = req.deployment.as_ref().map(|d| d.id.clone());
        let mut placed_per_group: HashMap<String, u32> = HashMap::new();

        for mut alloc in req.allocs {
            alloc.create_index = txn.index();
            alloc.modify_index = txn.index();
            if let (Some(id), Some(d)) = (&deployment_id, &req.deployment) {
                if alloc.namespace == d.namespace
                    && alloc.job_id == d.job_id
                    && alloc.job_version == d.job_version
                {
                    alloc.deployment_id = id.clone();
                    *placed_per_group.entry(alloc.task_group.clone()).or_insert(0) += 1;
                }
            }
            jobs.push((alloc.namespace.clone(), alloc.job_id.clone()));
            txn.tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
        }

        for stop in &req.stops {
            let Some(alloc) = txn.tables.allocs.get(&stop.alloc_id) else {
                continue; // already reaped
            };
            let mut alloc = (**alloc).clone();
            alloc.desired_status = AllocDesiredStatus::Stop;
            alloc.desired_description = stop.reason.clone();
            alloc.modify_index = txn.index();
            jobs.push((alloc.namespace.clone(), alloc.job_id.clone()));
            txn.tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
        }

        for preemption in &req.preemptions {
            let Some(alloc) = txn.tables.allocs.get(&preemption.alloc_id) else {
                continue;
            };
            let mut alloc = (**alloc).clone();
            alloc.desired_status = AllocDesiredStatus::Evict;
            alloc.preempted_by_allocation = preemption.preempted_by.clone();
            alloc.modify_index = txn.index();
            jobs.push((alloc.namespace.clone(), alloc.job_id.clone()));
            txn.tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
        }
        txn.bump(Table::Allocs);

        if let Some(mut deployment) = req.deployment {
            match txn.tables.deployments.get(&deployment.id) {
                Some(existing) => deployment.create_index = existing.create_index,
                None => deployment.create_index = txn.index(),
            }
            for (group, placed) in &placed_per_group {
                deployment
                    .task_groups
                    .entry(group.clone())
                    .or_default()
                    .placed_allocs += placed;
            }
            deployment.modify_index = txn.index();
            txn.tables
                .deployments
                .insert(deployment.id.clone(), Arc::new(deployment));
            txn.bump(Table::Deployments);
        }

        jobs.sort();
        jobs.dedup();
        for (ns, job_id) in jobs {
            self.recompute_job_summary(txn, &ns, &job_id);
        }
        txn.bump(Table::JobSummaries);

        let mut evals = req.preemption_evals;
        evals.extend(req.eval);
        effects.merge(self.persist_evals(txn, evals)?);
        Ok(effects)
    }

    // ── Deployment commands ──────────────────────────────────────────────

    fn apply_deployment_status(
        &self,
        txn: &mut Txn,
        req: DeploymentStatusUpdateRequest,
    ) -> Result<Effects, RpcError> {
        let deployment = txn
            .tables
            .deployments
            .get(&req.deployment_id)
            .ok_or_else(|| RpcError::Validation(format!(
                "unknown deployment {:?}",
                req.deployment_id
            )))?;
        if deployment.status.is_terminal() {
            return Err(RpcError::Validation(
                "cannot update a terminal deployment".into(),
            ));
        }
        let mut deployment = (**deployment).clone();
        deployment.status = req.status;
        deployment.status_description = req.description;
        deployment.modify_index = txn.index();
        txn.tables
            .deployments
            .insert(deployment.id.clone(), Arc::new(deployment));
        txn.bump(Table::Deployments);
        self.persist_evals(txn, req.eval.into_iter().collect())
    }

    fn apply_deployment_promote(
        &self,
        txn: &mut Txn,
        req: DeploymentPromoteRequest,
    ) -> Result<Effects, RpcError> {
        let deployment = txn
            .tables
            .deployments
            .get(&req.deployment_id)
            .ok_or_else(|| RpcError::Validation(format!(
                "unknown deployment {:?}",
                req.deployment_id
            )))?;
        let mut deployment = (**deployment).clone();
        for (name, state) in deployment.task_groups.iter_mut() {
            if req.groups.is_empty() || req.groups.contains(name) {
                if state.healthy_allocs < state.desired_canaries {
                    return Err(RpcError::Validation(format!(
                        "task group {:?} has insufficient healthy canaries",
                        name
                    )));
                }
                state.promoted = true;
            }
        }
        deployment.modify_index = txn.index();

        // Promotion marks the job version stable.
        let key = (deployment.namespace.clone(), deployment.job_id.clone());
        if let Some(job) = txn.tables.jobs.get(&key) {
            if job.version == deployment.job_version {
                let mut job = (**job).clone();
                job.stable = true;
                job.modify_index = txn.index();
                txn.tables.jobs.insert(key, Arc::new(job));
                txn.bump(Table::Jobs);
            }
        }

        txn.tables
            .deployments
            .insert(deployment.id.clone(), Arc::new(deployment));
        txn.bump(Table::Deployments);
        self.persist_evals(txn, req.eval.into_iter().collect())
    }

    fn apply_deployment_alloc_health(
        &self,
        txn: &mut Txn,
        req: DeploymentAllocHealthRequest,
    ) -> Result<Effects, RpcError> {
        let deployment = txn
            .tables
            .deployments
            .get(&req.deployment_id)
            .ok_or_else(|| RpcError::Validation(format!(
                "unknown deployment {:?}",
                req.deployment_id
            )))?;
        let mut deployment = (**deployment).clone();

        for (ids, healthy) in [
            (&req.healthy_alloc_ids, true),
            (&req.unhealthy_alloc_ids, false),
        ] {
            for alloc_id in ids {
                let Some(alloc) = txn.tables.allocs.get(alloc_id) else {
                    return Err(RpcError::UnknownAlloc(alloc_id.clone()));
                };
                let state = deployment
                    .task_groups
                    .entry(alloc.task_group.clone())
                    .or_default();
                if healthy {
                    state.healthy_allocs += 1;
                } else {
                    state.unhealthy_allocs += 1;
                }
            }
        }
        if !req.unhealthy_alloc_ids.is_empty() {
            deployment.status = DeploymentStatus::Failed;
            deployment.status_description = "allocations reported unhealthy".into();
        }
        deployment.modify_index = txn.index();
        txn.tables
            .deployments
            .insert(deployment.id.clone(), Arc::new(deployment));
        txn.bump(Table::Deployments);
        self.persist_evals(txn, req.eval.into_iter().collect())
    }

    fn apply_deployment_delete(
        &self,
        txn: &mut Txn,
        req: DeploymentDeleteRequest,
    ) -> Result<Effects, RpcError> {
        for id in &req.deployment_ids {
            txn.tables.deployments.remove(id);
        }
        txn.bump(Table::Deployments);
        Ok(Effects::default())
    }

    // ── ACL commands ─────────────────────────────────────────────────────

    fn apply_acl_policy_upsert(
        &self,
        txn: &mut Txn,
        req: AclPolicyUpsertRequest,
    ) -> Result<Effects, RpcError> {
        for mut policy in req.policies {
            match txn.tables.acl_policies.get(&policy.name) {
                Some(existing) => policy.create_index = existing.create_index,
                None => policy.create_index = txn.index(),
            }
            policy.modify_index = txn.index();
            txn.tables
                .acl_policies
                .insert(policy.name.clone(), Arc::new(policy));
        }
        txn.bump(Table::AclPolicies);
        Ok(Effects::default())
    }

    fn apply_acl_policy_delete(
        &self,
        txn: &mut Txn,
        req: AclPolicyDeleteRequest,
    ) -> Result<Effects, RpcError> {
        for name in &req.names {
            txn.tables.acl_policies.remove(name);
        }
        txn.bump(Table::AclPolicies);
        Ok(Effects::default())
    }

    fn apply_acl_token_upsert(
        &self,
        txn: &mut Txn,
        req: AclTokenUpsertRequest,
    ) -> Result<Effects, RpcError> {
        for mut token in req.tokens {
            if token.token_type != "client" && token.token_type != "management" {
                return Err(RpcError::Validation(format!(
                    "invalid token type {:?}",
                    token.token_type
                )));
            }
            match txn.tables.acl_tokens.get(&token.accessor_id) {
                Some(existing) => token.create_index = existing.create_index,
                None => token.create_index = txn.index(),
            }
            token.modify_index = txn.index();
            txn.tables
                .acl_tokens
                .insert(token.accessor_id.clone(), Arc::new(token));
        }
        txn.bump(Table::AclTokens);
        Ok(Effects::default())
    }

    fn apply_acl_token_delete(
        &self,
        txn: &mut Txn,
        req: AclTokenDeleteRequest,
    ) -> Result<Effects, RpcError> {
        for id in &req.accessor_ids {
            txn.tables.acl_tokens.remove(id);
        }
        txn.bump(Table::AclTokens);
        Ok(Effects::default())
    }

    fn apply_acl_role_upsert(
        &self,
        txn: &mut Txn,
        req: AclRoleUpsertRequest,
    ) -> Result<Effects, RpcError> {
        for mut role in req.roles {
            for policy in &role.policies {
                if !txn.tables.acl_policies.contains_key(policy) {
                    return Err(RpcError::Validation(format!(
                        "role references unknown policy {:?}",
                        policy
                    )));
                }
            }
            match txn.tables.acl_roles.get(&role.id) {
                Some(existing) => role.create_index = existing.create_index,
                None => role.create_index = txn.index(),
            }
            role.modify_index = txn.index();
            txn.tables.acl_roles.insert(role.id.clone(), Arc::new(role));
        }
        txn.bump(Table::AclRoles);
        Ok(Effects::default())
    }

    fn apply_acl_role_delete(
        &self,
        txn: &mut Txn,
        req: AclRoleDeleteRequest,
    ) -> Result<Effects, RpcError> {
        for id in &req.role_ids {
            txn.tables.acl_roles.remove(id);
        }
        txn.bump(Table::AclRoles);
        Ok(Effects::default())
    }

    // ── Config singletons ────────────────────────────────────────────────

    fn apply_scheduler_config_set(
        &self,
        txn: &mut Txn,
        req: SchedulerConfigSetRequest,
    ) -> Result<Effects, RpcError> {
        let mut config = req.config;
        if req.cas {
            let current = txn
                .tables
                .scheduler_config
                .as_ref()
                .map(|c| c.modify_index)
                .unwrap_or(0);
            if current != config.modify_index {
                let conflict = txn
                    .tables
                    .scheduler_config
                    .as_ref()
                    .map(|c| serde_json::to_string(&**c).unwrap_or_default())
                    .unwrap_or_default();
                return Err(RpcError::Conflict {
                    conflict_index: current,
                    conflict,
                });
            }
        }
        config.create_index = txn
            .tables
            .scheduler_config
            .as_ref()
            .map(|c| c.create_index)
            .unwrap_or(txn.index());
        config.modify_index = txn.index();
        txn.tables.scheduler_config = Some(Arc::new(config));
        txn.bump(Table::SchedulerConfig);
        Ok(Effects::default())
    }

    fn apply_cluster_metadata_set(
        &self,
        txn: &mut Txn,
        req: ClusterMetadataSetRequest,
    ) -> Result<Effects, RpcError> {
        if let Some(existing) = &txn.tables.cluster_meta {
            if existing.cluster_id != req.meta.cluster_id {
                return Err(RpcError::Validation(
                    "cluster metadata is already set".into(),
                ));
            }
            return Ok(Effects::default());
        }
        txn.tables.cluster_meta = Some(Arc::new(req.meta));
        txn.bump(Table::ClusterMeta);
        Ok(Effects::default())
    }

    // ── CSI volumes ──────────────────────────────────────────────────────

    fn apply_csi_register(
        &self,
        txn: &mut Txn,
        req: CsiVolumeRegisterRequest,
    ) -> Result<Effects, RpcError> {
        for mut vol in req.volumes {
            let key = (vol.namespace.clone(), vol.id.clone());
            match txn.tables.csi_volumes.get(&key) {
                Some(existing) => {
                    vol.create_index = existing.create_index;
                    vol.claims = existing.claims.clone();
                }
                None => vol.create_index = txn.index(),
            }
            vol.modify_index = txn.index();
            txn.tables.csi_volumes.insert(key, Arc::new(vol));
        }
        txn.bump(Table::CsiVolumes);
        Ok(Effects::default())
    }

    fn apply_csi_deregister(
        &self,
        txn: &mut Txn,
        req: CsiVolumeDeregisterRequest,
    ) -> Result<Effects, RpcError> {
        for id in &req.volume_ids {
            let key = (req.namespace.clone(), id.clone());
            if let Some(vol) = txn.tables.csi_volumes.get(&key) {
                if !vol.claims.is_empty() {
                    return Err(RpcError::Validation(format!(
                        "volume {:?} still has active claims",
                        id
                    )));
                }
                txn.tables.csi_volumes.remove(&key);
            }
        }
        txn.bump(Table::CsiVolumes);
        Ok(Effects::default())
    }

    fn apply_csi_claim(
        &self,
        txn: &mut Txn,
        req: CsiVolumeClaimRequest,
    ) -> Result<Effects, RpcError> {
        let key = (req.namespace.clone(), req.volume_id.clone());
        let vol = txn
            .tables
            .csi_volumes
            .get(&key)
            .ok_or_else(|| RpcError::Validation(format!(
                "unknown volume {:?}",
                req.volume_id
            )))?;
        let mut vol = (**vol).clone();
        if req.release {
            vol.claims.retain(|c| c.alloc_id != req.claim.alloc_id);
        } else {
            if !vol.can_claim(req.claim.mode) {
                return Err(RpcError::Validation(format!(
                    "volume {:?} has no free {:?} claims",
                    req.volume_id, req.claim.mode
                )));
            }
            // Re-claim by the same alloc is an idempotent no-op.
            if !vol.claims.iter().any(|c| c.alloc_id == req.claim.alloc_id) {
                vol.claims.push(req.claim);
            }
        }
        vol.modify_index = txn.index();
        txn.tables.csi_volumes.insert(key, Arc::new(vol));
        txn.bump(Table::CsiVolumes);
        Ok(Effects::default())
    }

    // ── Namespaces / services ────────────────────────────────────────────

    fn apply_namespace_upsert(
        &self,
        txn: &mut Txn,
        req: NamespaceUpsertRequest,
    ) -> Result<Effects, RpcError> {
        let mut effects = Effects::default();
        for mut ns in req.namespaces {
            if ns.name.is_empty() {
                return Err(RpcError::Validation("namespace name is required".into()));
            }
            match txn.tables.namespaces.get(&ns.name) {
                Some(existing) => {
                    ns.create_index = existing.create_index;
                    // A quota change may open headroom for evals blocked
                    // on the old limit.
                    if existing.quota != ns.quota && !existing.quota.is_empty() {
                        effects.unblock_quotas.push(existing.quota.clone());
                    }
                }
                None => ns.create_index = txn.index(),
            }
            ns.modify_index = txn.index();
            txn.tables.namespaces.insert(ns.name.clone(), Arc::new(ns));
        }
        txn.bump(Table::Namespaces);
        Ok(effects)
    }

    fn apply_namespace_delete(
        &self,
        txn: &mut Txn,
        req: NamespaceDeleteRequest,
    ) -> Result<Effects, RpcError> {
        for name in &req.names {
            if name == DEFAULT_NAMESPACE {
                return Err(RpcError::Validation(
                    "the default namespace cannot be deleted".into(),
                ));
            }
            let in_use = txn.tables.jobs.keys().any(|(ns, _)| ns == name);
            if in_use {
                return Err(RpcError::Validation(format!(
                    "namespace {:?} still contains jobs",
                    name
                )));
            }
            txn.tables.namespaces.remove(name);
        }
        txn.bump(Table::Namespaces);
        Ok(Effects::default())
    }

    fn apply_service_register(
        &self,
        txn: &mut Txn,
        req: ServiceRegisterRequest,
    ) -> Result<Effects, RpcError> {
        for mut svc in req.services {
            let key = (svc.namespace.clone(), svc.id.clone());
            match txn.tables.services.get(&key) {
                Some(existing) => svc.create_index = existing.create_index,
                None => svc.create_index = txn.index(),
            }
            svc.modify_index = txn.index();
            txn.tables.services.insert(key, Arc::new(svc));
        }
        txn.bump(Table::Services);
        Ok(Effects::default())
    }

    fn apply_service_deregister(
        &self,
        txn: &mut Txn,
        req: ServiceDeregisterRequest,
    ) -> Result<Effects, RpcError> {
        for id in &req.service_ids {
            txn.tables
                .services
                .remove(&(req.namespace.clone(), id.clone()));
        }
        txn.bump(Table::Services);
        Ok(Effects::default())
    }

    // ── Variables ────────────────────────────────────────────────────────

    fn apply_variable(
        &self,
        txn: &mut Txn,
        req: VariableApplyRequest,
    ) -> Result<Effects, RpcError> {
        let key = (req.var.namespace.clone(), req.var.path.clone());
        let existing = txn.tables.variables.get(&key).cloned();

        let conflict = |existing: &Option<Arc<Variable>>| RpcError::Conflict {
            conflict_index: existing.as_ref().map(|v| v.modify_index).unwrap_or(0),
            conflict: existing
                .as_ref()
                .map(|v| serde_json::to_string(&**v).unwrap_or_default())
                .unwrap_or_default(),
        };

        match req.op {
            VarOp::Set | VarOp::Cas => {
                if req.op == VarOp::Cas {
                    let current = existing.as_ref().map(|v| v.modify_index).unwrap_or(0);
                    if current != req.cas_index {
                        return Err(conflict(&existing));
                    }
                }
                if let Some(existing) = &existing {
                    if let Some(holder) = &existing.lock_holder {
                        if *holder != req.lock_id {
                            return Err(RpcError::Validation(
                                "variable is locked by another holder".into(),
                            ));
                        }
                    }
                }
                let mut var = req.var;
                match &existing {
                    Some(e) => {
                        var.create_index = e.create_index;
                        var.lock_holder = e.lock_holder.clone();
                    }
                    None => var.create_index = txn.index(),
                }
                var.modify_index = txn.index();
                txn.tables.variables.insert(key, Arc::new(var));
            }
            VarOp::Delete | VarOp::DeleteCas => {
                if req.op == VarOp::DeleteCas {
                    let current = existing.as_ref().map(|v| v.modify_index).unwrap_or(0);
                    if current != req.cas_index {
                        return Err(conflict(&existing));
                    }
                }
                txn.tables.variables.remove(&key);
            }
            VarOp::LockAcquire => {
                let mut var = match &existing {
                    Some(e) => (**e).clone(),
                    None => {
                        let mut v = req.var;
                        v.create_index = txn.index();
                        v
                    }
                };
                if let Some(holder) = &var.lock_holder {
                    if *holder != req.lock_id {
                        return Err(conflict(&existing));
                    }
                }
                var.lock_holder = Some(req.lock_id);
                var.modify_index = txn.index();
                txn.tables.variables.insert(key, Arc::new(var));
            }
            VarOp::LockRelease => {
                let Some(e) = &existing else {
                    return Err(RpcError::Validation("variable does not exist".into()));
                };
                if e.lock_holder.as_deref() != Some(req.lock_id.as_str()) {
                    return Err(RpcError::Validation(
                        "lock is not held by this holder".into(),
                    ));
                }
                let mut var = (**e).clone();
                var.lock_holder = None;
                var.modify_index = txn.index();
                txn.tables.variables.insert(key, Arc::new(var));
            }
        }
        txn.bump(Table::Variables);
        Ok(Effects::default())
    }

    fn apply_periodic_launch(
        &self,
        txn: &mut Txn,
        req: PeriodicLaunchUpsertRequest,
    ) -> Result<Effects, RpcError> {
        let key = (req.namespace.clone(), req.job_id.clone());
        let create_index = txn
            .tables
            .periodic_launches
            .get(&key)
            .map(|l| l.create_index)
            .unwrap_or(txn.index());
        txn.tables.periodic_launches.insert(
            key,
            Arc::new(PeriodicLaunch {
                namespace: req.namespace,
                job_id: req.job_id,
                launch_millis: req.launch_millis,
                create_index,
                modify_index: txn.index(),
            }),
        );
        txn.bump(Table::PeriodicLaunches);
        Ok(Effects::default())
    }

    // ── Summaries ────────────────────────────────────────────────────────

    fn ensure_job_summary(&self, txn: &mut Txn, job: &Job) {
        let key = job.key();
        if txn.tables.job_summaries.contains_key(&key) {
            return;
        }
        let mut task_groups = HashMap::new();
        for tg in &job.task_groups {
            task_groups.insert(tg.name.clone(), TaskGroupSummary::default());
        }
        txn.tables.job_summaries.insert(
            key,
            Arc::new(JobSummary {
                namespace: job.namespace.clone(),
                job_id: job.id.clone(),
                task_groups,
                create_index: txn.index(),
                modify_index: txn.index(),
            }),
        );
    }

    /// Recompute a job's placement counts from the alloc table. Queued
    /// counts come from evals and are preserved.
    fn recompute_job_summary(&self, txn: &mut Txn, namespace: &str, job_id: &str) {
        let key = (namespace.to_string(), job_id.to_string());
        let mut summary = match txn.tables.job_summaries.get(&key) {
            Some(s) => (**s).clone(),
            None => JobSummary {
                namespace: namespace.to_string(),
                job_id: job_id.to_string(),
                task_groups: HashMap::new(),
                create_index: txn.index(),
                modify_index: txn.index(),
            },
        };
        for state in summary.task_groups.values_mut() {
            let queued = state.queued;
            *state = TaskGroupSummary {
                queued,
                ..Default::default()
            };
        }
        for alloc in txn.tables.allocs.values() {
            if alloc.namespace != namespace || alloc.job_id != job_id {
                continue;
            }
            let state = summary
                .task_groups
                .entry(alloc.task_group.clone())
                .or_default();
            match alloc.client_status {
                AllocClientStatus::Pending => state.starting += 1,
                AllocClientStatus::Running => state.running += 1,
                AllocClientStatus::Complete => state.complete += 1,
                AllocClientStatus::Failed => state.failed += 1,
                AllocClientStatus::Lost => state.lost += 1,
            }
        }
        summary.modify_index = txn.index();
        txn.tables.job_summaries.insert(key, Arc::new(summary));
    }

    // ── Snapshot persist / restore ───────────────────────────────────────

    /// Serialize the given generation. Deterministic: table iteration is
    /// ordered and the time table comes from the log.
    pub fn persist(&self, tables: &StateTables) -> Vec<u8> {
        let time_table = self.time_table.lock().unwrap().clone();
        snapshot::persist(tables, &time_table)
    }

    /// Decode a snapshot, swap the store, and reconcile summaries whose
    /// queued counts were lost to the distillation of eval history.
    pub fn restore(&self, data: &[u8]) -> Result<(), RpcError> {
        let (mut tables, time_table) = snapshot::restore(data)?;
        reconcile_summaries(&mut tables);
        *self.time_table.lock().unwrap() = time_table;
        self.store.swap_all(tables);
        Ok(())
    }
}

/// Side effects accumulated while a transaction is built, run only after
/// the commit succeeds.
#[derive(Default)]
pub struct Effects {
    pub enqueue: Vec<Evaluation>,
    pub block: Vec<Evaluation>,
    pub periodic_add: Vec<Job>,
    pub periodic_remove: Vec<(String, String)>,
    pub unblock_classes: Vec<u64>,
    pub unblock_nodes: Vec<String>,
    pub unblock_quotas: Vec<String>,
    pub untrack: Vec<(String, String)>,
}

impl Effects {
    fn merge(&mut self, other: Effects) {
        self.enqueue.extend(other.enqueue);
        self.block.extend(other.block);
        self.periodic_add.extend(other.periodic_add);
        self.periodic_remove.extend(other.periodic_remove);
        self.unblock_classes.extend(other.unblock_classes);
        self.unblock_nodes.extend(other.unblock_nodes);
        self.unblock_quotas.extend(other.unblock_quotas);
        self.untrack.extend(other.untrack);
    }
}

/// Restore-time pass: any job with a summary but no queued counts gets its
/// queued allocations re-derived from the newest non-terminal eval, the
/// same numbers a scheduler pass against the restored state would produce.
fn reconcile_summaries(tables: &mut StateTables) {
    let keys: Vec<_> = tables.job_summaries.keys().cloned().collect();
    for key in keys {
        let Some(summary) = tables.job_summaries.get(&key) else {
            continue;
        };
        if summary.task_groups.values().any(|tg| tg.queued > 0) {
            continue;
        }
        let newest_eval = tables
            .evals
            .values()
            .filter(|e| {
                e.namespace == key.0 && e.job_id == key.1 && !e.status.is_terminal()
            })
            .max_by_key(|e| e.create_index);
        let Some(eval) = newest_eval else { continue };
        if eval.queued_allocations.is_empty() {
            continue;
        }
        let mut summary = (**summary).clone();
        for (tg, queued) in &eval.queued_allocations {
            summary.task_groups.entry(tg.clone()).or_default().queued = *queued;
        }
        tables.job_summaries.insert(key, Arc::new(summary));
    }
}

// ── Snapshot wire format ──────────────────────────────────────────────────────

pub mod snapshot {
    //! Snapshot layout: an 8-byte magic header, the time table, then
    //! length-prefixed records each tagged with a snapshot-type byte.

    use super::*;

    pub const MAGIC: &[u8; 8] = b"FLOSNAP1";

    /// Record type tags. Wire-stable; append only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum SnapType {
        TimeTable = 0,
        Indexes = 1,
        Node = 2,
        Job = 3,
        Eval = 4,
        Alloc = 5,
        Deployment = 6,
        PeriodicLaunch = 7,
        JobSummary = 8,
        AclPolicy = 9,
        AclToken = 10,
        AclRole = 11,
        Namespace = 12,
        CsiVolume = 13,
        Service = 14,
        Variable = 15,
        SchedulerConfig = 16,
        ClusterMeta = 17,
    }

    fn push_record<T: Serialize>(buf: &mut Vec<u8>, st: SnapType, value: &T) {
        let body = serde_json::to_vec(value).expect("encode snapshot record");
        buf.push(st as u8);
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
    }

    pub fn persist(tables: &StateTables, time_table: &TimeTable) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        push_record(&mut buf, SnapType::TimeTable, time_table);
        push_record(&mut buf, SnapType::Indexes, &tables.indexes);
        for v in tables.nodes.values() {
            push_record(&mut buf, SnapType::Node, &**v);
        }
        for v in tables.jobs.values() {
            push_record(&mut buf, SnapType::Job, &**v);
        }
        for v in tables.evals.values() {
            push_record(&mut buf, SnapType::Eval, &**v);
        }
        for v in tables.allocs.values() {
            push_record(&mut buf, SnapType::Alloc, &**v);
        }
        for v in tables.deployments.values() {
            push_record(&mut buf, SnapType::Deployment, &**v);
        }
        for v in tables.periodic_launches.values() {
            push_record(&mut buf, SnapType::PeriodicLaunch, &**v);
        }
        for v in tables.job_summaries.values() {
            push_record(&mut buf, SnapType::JobSummary, &**v);
        }
        for v in tables.acl_policies.values() {
            push_record(&mut buf, SnapType::AclPolicy, &**v);
        }
        for v in tables.acl_tokens.values() {
            push_record(&mut buf, SnapType::AclToken, &**v);
        }
        for v in tables.acl_roles.values() {
            push_record(&mut buf, SnapType::AclRole, &**v);
        }
        for v in tables.namespaces.values() {
            push_record(&mut buf, SnapType::Namespace, &**v);
        }
        for v in tables.csi_volumes.values() {
            push_record(&mut buf, SnapType::CsiVolume, &**v);
        }
        for v in tables.services.values() {
            push_record(&mut buf, SnapType::Service, &**v);
        }
        for v in tables.variables.values() {
            push_record(&mut buf, SnapType::Variable, &**v);
        }
        if let Some(v) = &tables.scheduler_config {
            push_record(&mut buf, SnapType::SchedulerConfig, &**v);
        }
        if let Some(v) = &tables.cluster_meta {
            push_record(&mut buf, SnapType::ClusterMeta, &**v);
        }
        buf
    }

    pub fn restore(data: &[u8]) -> Result<(StateTables, TimeTable), RpcError> {
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(RpcError::Validation("bad snapshot magic".into()));
        }
        let mut tables = StateTables::default();
        let mut time_table = TimeTable::default();
        let mut pos = MAGIC.len();

        while pos < data.len() {
            if pos + 5 > data.len() {
                return Err(RpcError::Validation("truncated snapshot record".into()));
            }
            let tag = data[pos];
            let len = u32::from_be_bytes(data[pos + 1..pos + 5].try_into().unwrap()) as usize;
            pos += 5;
            if pos + len > data.len() {
                return Err(RpcError::Validation("truncated snapshot record".into()));
            }
            let body = &data[pos..pos + len];
            pos += len;

            let decode_err =
                |e: serde_json::Error| RpcError::Validation(format!("bad snapshot record: {e}"));

            match tag {
                t if t == SnapType::TimeTable as u8 => {
                    time_table = serde_json::from_slice(body).map_err(decode_err)?;
                }
                t if t == SnapType::Indexes as u8 => {
                    let raw: std::collections::BTreeMap<String, u64> =
                        serde_json::from_slice(body).map_err(decode_err)?;
                    for t in Table::ALL {
                        if let Some(v) = raw.get(t.as_str()) {
                            tables.indexes.insert(t.as_str(), *v);
                        }
                    }
                }
                t if t == SnapType::Node as u8 => {
                    let v: Node = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.nodes.insert(v.id.clone(), Arc::new(v));
                }
                t if t == SnapType::Job as u8 => {
                    let v: Job = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.jobs.insert(v.key(), Arc::new(v));
                }
                t if t == SnapType::Eval as u8 => {
                    let v: Evaluation = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.evals.insert(v.id.clone(), Arc::new(v));
                }
                t if t == SnapType::Alloc as u8 => {
                    let v: Allocation = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.allocs.insert(v.id.clone(), Arc::new(v));
                }
                t if t == SnapType::Deployment as u8 => {
                    let v: Deployment = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.deployments.insert(v.id.clone(), Arc::new(v));
                }
                t if t == SnapType::PeriodicLaunch as u8 => {
                    let v: PeriodicLaunch = serde_json::from_slice(body).map_err(decode_err)?;
                    tables
                        .periodic_launches
                        .insert((v.namespace.clone(), v.job_id.clone()), Arc::new(v));
                }
                t if t == SnapType::JobSummary as u8 => {
                    let v: JobSummary = serde_json::from_slice(body).map_err(decode_err)?;
                    tables
                        .job_summaries
                        .insert((v.namespace.clone(), v.job_id.clone()), Arc::new(v));
                }
                t if t == SnapType::AclPolicy as u8 => {
                    let v: AclPolicy = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.acl_policies.insert(v.name.clone(), Arc::new(v));
                }
                t if t == SnapType::AclToken as u8 => {
                    let v: AclToken = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.acl_tokens.insert(v.accessor_id.clone(), Arc::new(v));
                }
                t if t == SnapType::AclRole as u8 => {
                    let v: AclRole = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.acl_roles.insert(v.id.clone(), Arc::new(v));
                }
                t if t == SnapType::Namespace as u8 => {
                    let v: Namespace = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.namespaces.insert(v.name.clone(), Arc::new(v));
                }
                t if t == SnapType::CsiVolume as u8 => {
                    let v: CsiVolume = serde_json::from_slice(body).map_err(decode_err)?;
                    tables
                        .csi_volumes
                        .insert((v.namespace.clone(), v.id.clone()), Arc::new(v));
                }
                t if t == SnapType::Service as u8 => {
                    let v: ServiceRegistration =
                        serde_json::from_slice(body).map_err(decode_err)?;
                    tables
                        .services
                        .insert((v.namespace.clone(), v.id.clone()), Arc::new(v));
                }
                t if t == SnapType::Variable as u8 => {
                    let v: Variable = serde_json::from_slice(body).map_err(decode_err)?;
                    tables
                        .variables
                        .insert((v.namespace.clone(), v.path.clone()), Arc::new(v));
                }
                t if t == SnapType::SchedulerConfig as u8 => {
                    let v: SchedulerConfig = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.scheduler_config = Some(Arc::new(v));
                }
                t if t == SnapType::ClusterMeta as u8 => {
                    let v: ClusterMetadata = serde_json::from_slice(body).map_err(decode_err)?;
                    tables.cluster_meta = Some(Arc::new(v));
                }
                unknown => {
                    return Err(RpcError::Validation(format!(
                        "unknown snapshot record type {unknown}"
                    )));
                }
            }
        }
        Ok((tables, time_table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_fsm, test_job, test_node};

    fn register_node(fsm: &Fsm, index: u64) -> String {
        let node = test_node();
        let id = node.id.clone();
        let resp = fsm.apply(
            index,
            &LogCommand::encode(
                MessageType::NodeRegister,
                &NodeRegisterRequest { node },
                1_000,
            ),
        );
        assert!(resp.error.is_none(), "{:?}", resp.error);
        id
    }

    #[test]
    fn node_register_and_status_update() {
        let (fsm, _sinks) = test_fsm();
        let node_id = register_node(&fsm, 5);

        let snap = fsm.store().snapshot();
        let node = snap.node(&node_id).unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.create_index, 5);
        assert_ne!(node.computed_class, 0);

        let resp = fsm.apply(
            6,
            &LogCommand::encode(
                MessageType::NodeStatusUpdate,
                &NodeStatusUpdateRequest {
                    node_id: node_id.clone(),
                    status: NodeStatus::Down,
                    evals: vec![],
                },
                2_000,
            ),
        );
        assert!(resp.error.is_none());
        let node = fsm.store().snapshot().node(&node_id).unwrap();
        assert_eq!(node.status, NodeStatus::Down);
        assert_eq!(node.create_index, 5);
        assert_eq!(node.modify_index, 6);
    }

    #[test]
    fn unknown_node_update_is_validation_error() {
        let (fsm, _sinks) = test_fsm();
        let resp = fsm.apply(
            2,
            &LogCommand::encode(
                MessageType::NodeStatusUpdate,
                &NodeStatusUpdateRequest {
                    node_id: "missing".into(),
                    status: NodeStatus::Down,
                    evals: vec![],
                },
                1,
            ),
        );
        assert_eq!(resp.error, Some(RpcError::UnknownNode("missing".into())));
        // The failed command must not advance the table index.
        assert_eq!(fsm.store().snapshot().table_index(Table::Nodes), 1);
    }

    #[test]
    fn job_register_enqueues_eval() {
        let (fsm, sinks) = test_fsm();
        let job = test_job("web");
        let eval = Evaluation::new(DEFAULT_NAMESPACE, "web", "service", 50, TRIGGER_JOB_REGISTER);
        let eval_id = eval.id.clone();
        let resp = fsm.apply(
            3,
            &LogCommand::encode(
                MessageType::JobRegister,
                &JobRegisterRequest {
                    job,
                    eval: Some(eval),
                },
                1,
            ),
        );
        assert!(resp.error.is_none());

        let snap = fsm.store().snapshot();
        assert!(snap.job(DEFAULT_NAMESPACE, "web").is_some());
        let stored = snap.eval(&eval_id).unwrap();
        assert_eq!(stored.create_index, 3);
        // The broker side effect fired.
        assert_eq!(sinks.broker.stats().total_ready, 1);
    }

    #[test]
    fn job_version_bumps_on_reregister() {
        let (fsm, _sinks) = test_fsm();
        for index in [3, 4] {
            let resp = fsm.apply(
                index,
                &LogCommand::encode(
                    MessageType::JobRegister,
                    &JobRegisterRequest {
                        job: test_job("web"),
                        eval: None,
                    },
                    1,
                ),
            );
            assert!(resp.error.is_none());
        }
        let job = fsm.store().snapshot().job(DEFAULT_NAMESPACE, "web").unwrap();
        assert_eq!(job.version, 1);
        assert_eq!(job.create_index, 3);
        assert_eq!(job.modify_index, 4);
    }

    #[test]
    fn job_deregister_tombstones_without_purge() {
        let (fsm, _sinks) = test_fsm();
        fsm.apply(
            3,
            &LogCommand::encode(
                MessageType::JobRegister,
                &JobRegisterRequest {
                    job: test_job("web"),
                    eval: None,
                },
                1,
            ),
        );
        let resp = fsm.apply(
            4,
            &LogCommand::encode(
                MessageType::JobDeregister,
                &JobDeregisterRequest {
                    namespace: DEFAULT_NAMESPACE.into(),
                    job_id: "web".into(),
                    purge: false,
                    eval: None,
                },
                1,
            ),
        );
        assert!(resp.error.is_none());
        let job = fsm.store().snapshot().job(DEFAULT_NAMESPACE, "web").unwrap();
        assert!(job.stop);
        assert_eq!(job.status, JobStatus::Dead);

        // Purge actually removes the row.
        fsm.apply(
            5,
            &LogCommand::encode(
                MessageType::JobDeregister,
                &JobDeregisterRequest {
                    namespace: DEFAULT_NAMESPACE.into(),
                    job_id: "web".into(),
                    purge: true,
                    eval: None,
                },
                1,
            ),
        );
        assert!(fsm.store().snapshot().job(DEFAULT_NAMESPACE, "web").is_none());
    }

    #[test]
    fn variable_cas_conflict_carries_object() {
        let (fsm, _sinks) = test_fsm();
        let var = Variable {
            namespace: DEFAULT_NAMESPACE.into(),
            path: "app/db".into(),
            items: HashMap::from([("password".to_string(), "hunter2".to_string())]),
            lock_holder: None,
            create_index: 0,
            modify_index: 0,
        };
        let resp = fsm.apply(
            10,
            &LogCommand::encode(
                MessageType::VariableApply,
                &VariableApplyRequest {
                    op: VarOp::Set,
                    var: var.clone(),
                    cas_index: 0,
                    lock_id: String::new(),
                },
                1,
            ),
        );
        assert!(resp.error.is_none());

        // CAS at a stale index must conflict and return the live object.
        let resp = fsm.apply(
            11,
            &LogCommand::encode(
                MessageType::VariableApply,
                &VariableApplyRequest {
                    op: VarOp::Cas,
                    var,
                    cas_index: 3,
                    lock_id: String::new(),
                },
                1,
            ),
        );
        match resp.error {
            Some(RpcError::Conflict {
                conflict_index,
                conflict,
            }) => {
                assert_eq!(conflict_index, 10);
                assert!(conflict.contains("app/db"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn variable_lock_cycle() {
        let (fsm, _sinks) = test_fsm();
        let var = Variable {
            namespace: DEFAULT_NAMESPACE.into(),
            path: "locks/leader".into(),
            items: HashMap::new(),
            lock_holder: None,
            create_index: 0,
            modify_index: 0,
        };
        let acquire = |fsm: &Fsm, index: u64, lock_id: &str| {
            fsm.apply(
                index,
                &LogCommand::encode(
                    MessageType::VariableApply,
                    &VariableApplyRequest {
                        op: VarOp::LockAcquire,
                        var: var.clone(),
                        cas_index: 0,
                        lock_id: lock_id.into(),
                    },
                    1,
                ),
            )
        };
        assert!(acquire(&fsm, 5, "holder-a").error.is_none());
        // Second holder is rejected with a conflict.
        assert!(matches!(
            acquire(&fsm, 6, "holder-b").error,
            Some(RpcError::Conflict { .. })
        ));
        // Re-acquire by the same holder is idempotent.
        assert!(acquire(&fsm, 7, "holder-a").error.is_none());

        let resp = fsm.apply(
            8,
            &LogCommand::encode(
                MessageType::VariableApply,
                &VariableApplyRequest {
                    op: VarOp::LockRelease,
                    var: var.clone(),
                    cas_index: 0,
                    lock_id: "holder-a".into(),
                },
                1,
            ),
        );
        assert!(resp.error.is_none());
        let stored = fsm
            .store()
            .snapshot()
            .variable(DEFAULT_NAMESPACE, "locks/leader")
            .unwrap();
        assert!(stored.lock_holder.is_none());
    }

    #[test]
    fn unknown_message_type_with_flag_is_ignored() {
        let (fsm, _sinks) = test_fsm();
        let mut raw = vec![0x7f | IGNORE_UNKNOWN_FLAG];
        raw.extend_from_slice(&0i64.to_be_bytes());
        raw.extend_from_slice(b"{}");
        let resp = fsm.apply(2, &LogCommand(raw));
        assert!(resp.error.is_none());
    }

    #[test]
    #[should_panic(expected = "unknown message type")]
    fn unknown_message_type_without_flag_panics() {
        let (fsm, _sinks) = test_fsm();
        let mut raw = vec![0x7f];
        raw.extend_from_slice(&0i64.to_be_bytes());
        raw.extend_from_slice(b"{}");
        fsm.apply(2, &LogCommand(raw));
    }

    #[test]
    fn snapshot_roundtrip_preserves_rows_and_indexes() {
        let (fsm, _sinks) = test_fsm();
        let node_id = register_node(&fsm, 5);
        fsm.apply(
            6,
            &LogCommand::encode(
                MessageType::JobRegister,
                &JobRegisterRequest {
                    job: test_job("web"),
                    eval: Some(Evaluation::new(
                        DEFAULT_NAMESPACE,
                        "web",
                        "service",
                        50,
                        TRIGGER_JOB_REGISTER,
                    )),
                },
                1,
            ),
        );

        let snap = fsm.store().snapshot();
        let bytes = fsm.persist(snap.tables());

        let (fsm2, _sinks2) = test_fsm();
        fsm2.restore(&bytes).unwrap();
        let snap2 = fsm2.store().snapshot();

        assert!(snap2.node(&node_id).is_some());
        assert!(snap2.job(DEFAULT_NAMESPACE, "web").is_some());
        for t in Table::ALL {
            assert_eq!(snap.table_index(t), snap2.table_index(t), "{:?}", t);
        }
        // Determinism: persisting the restored store is byte-identical.
        assert_eq!(bytes, fsm2.persist(snap2.tables()));
    }

    #[test]
    fn command_encode_decode_roundtrip() {
        let cmd = LogCommand::encode(
            MessageType::EvalDelete,
            &EvalDeleteRequest {
                eval_ids: vec!["e1".into()],
                alloc_ids: vec![],
            },
            42_000,
        );
        let (raw, ignorable, ts, body) = cmd.decode_parts();
        assert_eq!(raw, MessageType::EvalDelete as u8);
        assert!(!ignorable);
        assert_eq!(ts, 42_000);
        let req: EvalDeleteRequest = serde_json::from_slice(body).unwrap();
        assert_eq!(req.eval_ids, vec!["e1".to_string()]);
    }
}
