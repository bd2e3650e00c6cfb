//! The RPC dispatch fabric.
//!
//! Every inbound connection opens with one magic byte: regular RPC, raft,
//! mux, tls (wrap and recurse, never twice), stream, or muxV2 (per-stream
//! first byte selects rpc or stream). Unknown bytes drop the connection;
//! unauthenticated connections hold the socket only until the handshake
//! deadline; per-remote-IP limits bound fan-in with a lower sub-limit for
//! streaming.
//!
//! Requests are routed through an explicit method-name dispatch table
//! built at startup. Before a handler runs, the fabric resolves placement:
//! a request for another region is proxied to a random remembered server
//! there; a request needing the leader is forwarded (held up to the RPC
//! hold timeout with jitter while an election settles); reads with
//! `allow_stale` skip the leader hop and run on the local snapshot.
//!
//! Blocking queries subscribe a watch set before snapshotting, run the
//! query function, and park on the watch set or the store's abandon
//! channel until the result index passes `min_query_index` or the jittered
//! `max_query_time` elapses.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::errors::{error_to_wire, RpcError};
use crate::fsm::*;
use crate::metrics;
use crate::mux::{
    read_frame, read_mux_frame, write_frame, write_mux_frame, StreamAck, StreamHeader, MAGIC_MUX,
    MAGIC_MUX_V2, MAGIC_RAFT, MAGIC_RPC, MAGIC_STREAM, MAGIC_TLS,
};
use crate::server::{evals_for_node_jobs, PeerServer, Server};
use crate::state_store::{StateSnapshot, Table};
use crate::structs::*;

/// Ceiling on one blocking query's wait.
const MAX_BLOCKING_MS: u64 = 300_000;
/// Poll cadence while holding a request through a leader transition.
const LEADER_HOLD_POLL: Duration = Duration::from_millis(100);
/// Timeout on one server-initiated call over a node session.
const NODE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ── Wire envelopes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub seq: u64,
    /// Target region; empty means the receiving server's own.
    pub region: String,
    pub auth_token: String,
    /// Stale reads skip the leader hop.
    pub allow_stale: bool,
    /// Blocking query floor; 0 disables blocking.
    pub min_query_index: u64,
    pub max_query_time_ms: u64,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    pub seq: u64,
    pub error: Option<String>,
    /// The index the reply was computed at, for blocking re-queries.
    pub index: u64,
    pub body: serde_json::Value,
}

type HandlerResult = Result<(serde_json::Value, u64), RpcError>;
type BoxFut = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

struct MethodEntry {
    /// Writes and consistent reads run on the leader.
    requires_leader: bool,
    /// Status and node-forwarded methods never leave this server.
    always_local: bool,
    handler: Box<dyn Fn(Arc<Server>, RpcRequest) -> BoxFut + Send + Sync>,
}

fn entry<F, Fut>(requires_leader: bool, always_local: bool, f: F) -> MethodEntry
where
    F: Fn(Arc<Server>, RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    MethodEntry {
        requires_leader,
        always_local,
        handler: Box::new(move |s, r| Box::pin(f(s, r))),
    }
}

fn body<T: DeserializeOwned>(req: &RpcRequest) -> Result<T, RpcError> {
    serde_json::from_value(req.body.clone())
        .map_err(|e| RpcError::Validation(format!("malformed request body: {e}")))
}

fn ok_body<T: Serialize>(value: &T, index: u64) -> HandlerResult {
    Ok((
        serde_json::to_value(value).map_err(|e| RpcError::Validation(e.to_string()))?,
        index,
    ))
}

// ── Dispatch table ────────────────────────────────────────────────────────────

lazy_static::lazy_static! {
    static ref DISPATCH: HashMap<&'static str, MethodEntry> = build_dispatch();
}

/// The explicit name-to-handler table, built once at startup so dispatch
/// stays deterministic and traceable.
fn build_dispatch() -> HashMap<&'static str, MethodEntry> {
    let mut t: HashMap<&'static str, MethodEntry> = HashMap::new();

    t.insert("Status.Ping", entry(false, true, status_ping));
    t.insert("Status.Leader", entry(false, true, status_leader));
    t.insert("Status.Peers", entry(false, true, status_peers));
    t.insert("Status.HasNodeConn", entry(false, true, status_has_node_conn));

    t.insert("Node.Register", entry(true, false, node_register));
    t.insert("Node.Deregister", entry(true, false, node_deregister));
    t.insert("Node.UpdateStatus", entry(true, false, node_update_status));
    t.insert("Node.UpdateDrain", entry(true, false, node_update_drain));
    t.insert(
        "Node.UpdateEligibility",
        entry(true, false, node_update_eligibility),
    );
    t.insert("Node.UpdateAlloc", entry(true, false, node_update_alloc));
    t.insert("Node.GetAllocs", entry(false, false, node_get_allocs));

    t.insert("Job.Register", entry(true, false, job_register));
    t.insert("Job.Deregister", entry(true, false, job_deregister));
    t.insert("Job.Dispatch", entry(true, false, job_dispatch));
    t.insert("Job.SetStability", entry(true, false, job_set_stability));
    t.insert("Job.Get", entry(false, false, job_get));
    t.insert("Job.List", entry(false, false, job_list));

    t.insert("Eval.Get", entry(false, false, eval_get));
    t.insert("Eval.Dequeue", entry(true, false, eval_dequeue));
    t.insert("Eval.Ack", entry(true, false, eval_ack));
    t.insert("Eval.Nack", entry(true, false, eval_nack));

    t.insert("Alloc.Get", entry(false, false, alloc_get));
    t.insert("Plan.Submit", entry(true, false, plan_submit));

    t.insert("Deployment.Promote", entry(true, false, deployment_promote));
    t.insert(
        "Deployment.SetAllocHealth",
        entry(true, false, deployment_set_alloc_health),
    );

    t.insert("Variables.Apply", entry(true, false, variables_apply));
    t.insert("Variables.Read", entry(false, false, variables_read));
    t.insert("Variables.List", entry(false, false, variables_list));

    t.insert("ACL.UpsertPolicies", entry(true, false, acl_upsert_policies));
    t.insert("ACL.DeletePolicies", entry(true, false, acl_delete_policies));
    t.insert("ACL.UpsertTokens", entry(true, false, acl_upsert_tokens));
    t.insert("ACL.DeleteTokens", entry(true, false, acl_delete_tokens));
    t.insert("ACL.UpsertRoles", entry(true, false, acl_upsert_roles));
    t.insert("ACL.DeleteRoles", entry(true, false, acl_delete_roles));

    t.insert("Namespace.Upsert", entry(true, false, namespace_upsert));
    t.insert("Namespace.Delete", entry(true, false, namespace_delete));

    t.insert("CSIVolume.Register", entry(true, false, csi_register));
    t.insert("CSIVolume.Deregister", entry(true, false, csi_deregister));
    t.insert("CSIVolume.Claim", entry(true, false, csi_claim));

    t.insert("Service.Register", entry(true, false, service_register));
    t.insert("Service.Deregister", entry(true, false, service_deregister));

    t.insert("SchedulerConfig.Get", entry(false, false, scheduler_config_get));
    t.insert("SchedulerConfig.Set", entry(true, false, scheduler_config_set));

    t.insert("Agent.PauseSchedulers", entry(false, true, agent_pause_schedulers));
    t.insert("Agent.ResumeSchedulers", entry(false, true, agent_resume_schedulers));
    t.insert("Agent.SchedulerStatus", entry(false, true, agent_scheduler_status));

    // Client-directed calls resolve the owning server themselves.
    for method in [
        "ClientAlloc.GarbageCollect",
        "ClientAlloc.Restart",
        "ClientAlloc.Signal",
        "ClientAlloc.Stats",
        "ClientAlloc.Checks",
    ] {
        t.insert(method, entry(false, true, client_alloc_forward));
    }

    t
}

// ── Request processing ────────────────────────────────────────────────────────

/// Resolve and run one request: cross-region proxy, leader forward, or
/// local dispatch.
pub async fn process_request(server: Arc<Server>, req: RpcRequest) -> RpcResponse {
    metrics::RPC_REQUESTS.with_label_values(&[&req.method]).inc();
    let seq = req.seq;
    match route_request(server, req, true).await {
        Ok((body, index)) => RpcResponse {
            seq,
            error: None,
            index,
            body,
        },
        Err(e) => {
            metrics::RPC_ERRORS.with_label_values(&[e.label()]).inc();
            RpcResponse {
                seq,
                error: Some(error_to_wire(&e)),
                index: 0,
                body: serde_json::Value::Null,
            }
        }
    }
}

fn route_request(
    server: Arc<Server>,
    req: RpcRequest,
    allow_forward: bool,
) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> {
    Box::pin(async move {
        let entry = DISPATCH
            .get(req.method.as_str())
            .ok_or_else(|| RpcError::UnknownMethod(req.method.clone()))?;

        check_acl(&server, &req)?;

        // Cross-region hop first; the remote fabric re-resolves leadership.
        if allow_forward
            && !entry.always_local
            && !req.region.is_empty()
            && req.region != server.config.region
        {
            return forward_to_region(&server, req).await;
        }

        let needs_leader = entry.requires_leader || !(req.allow_stale || entry.always_local);
        if allow_forward && needs_leader && !server.is_leader() {
            return forward_to_leader(&server, req).await;
        }

        (entry.handler)(server, req).await
    })
}

/// Proxy to a random remembered server in the target region.
async fn forward_to_region(server: &Arc<Server>, req: RpcRequest) -> HandlerResult {
    let peer: PeerServer = server
        .peers
        .random_server(&req.region)
        .ok_or_else(|| RpcError::RegionNotFound(req.region.clone()))?;
    debug!(method = %req.method, region = %req.region, peer = %peer.addr, "forwarding cross-region");
    let resp = server.rpc_clients.call(&peer.addr, &req).await?;
    match resp.error {
        Some(e) => Err(crate::errors::error_from_wire(&e)),
        None => Ok((resp.body, resp.index)),
    }
}

/// Forward to the leader, holding the request through an election for up
/// to the hold timeout (with jitter) before giving up with NoLeader.
async fn forward_to_leader(server: &Arc<Server>, req: RpcRequest) -> HandlerResult {
    let hold = server.config.rpc_hold_timeout;
    let jitter = hold / 16 * rand::thread_rng().gen_range(0..4);
    let deadline = tokio::time::Instant::now() + hold + jitter;

    loop {
        if server.is_leader() {
            // Leadership landed here while we were holding.
            return route_request(server.clone(), req, false).await;
        }
        if let Some(addr) = server.leader_addr() {
            match server.rpc_clients.call(&addr, &req).await {
                Ok(resp) => {
                    return match resp.error {
                        Some(e) => Err(crate::errors::error_from_wire(&e)),
                        None => Ok((resp.body, resp.index)),
                    };
                }
                Err(e) if e.is_retryable() => {
                    debug!(error = %e, "leader call failed while holding, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RpcError::NoLeader);
        }
        tokio::time::sleep(LEADER_HOLD_POLL).await;
    }
}

/// Token check against the ACL tables. An empty token table means ACLs
/// are disabled and every caller is allowed.
fn check_acl(server: &Arc<Server>, req: &RpcRequest) -> Result<(), RpcError> {
    let snapshot = server.store.snapshot();
    if snapshot.tables().acl_tokens.is_empty() {
        return Ok(());
    }
    if req.method.starts_with("Status.") {
        return Ok(());
    }
    let authorized = snapshot
        .tables()
        .acl_tokens
        .values()
        .any(|t| t.secret_id == req.auth_token && !t.is_expired(now_millis()));
    // Node secret ids authenticate client->server calls.
    let node_authorized = !req.auth_token.is_empty()
        && snapshot
            .nodes()
            .any(|n| n.secret_id == req.auth_token);
    if authorized || node_authorized {
        Ok(())
    } else {
        Err(RpcError::PermissionDenied)
    }
}

// ── Blocking queries ──────────────────────────────────────────────────────────

/// Run `run` against a snapshot; if the result index has not passed
/// `min_query_index`, park on the watch set (or the abandon channel) and
/// re-run, until the jittered max query time elapses.
pub async fn blocking_query<F>(
    store: &Arc<crate::state_store::StateStore>,
    req: &RpcRequest,
    tables: &[Table],
    run: F,
) -> HandlerResult
where
    F: Fn(&StateSnapshot) -> HandlerResult,
{
    let max_ms = req.max_query_time_ms.min(MAX_BLOCKING_MS);
    let blocking = req.min_query_index > 0 && max_ms > 0;
    if !blocking {
        return run(&store.snapshot());
    }

    // Jitter the deadline down so a thundering herd of identical queries
    // re-fires spread out.
    let jitter_ms = rand::thread_rng().gen_range(0..=(max_ms / 16).max(1));
    let deadline = tokio::time::Instant::now() + Duration::from_millis(max_ms - jitter_ms.min(max_ms));

    loop {
        // Subscribe before snapshotting so a write in between still wakes.
        let mut ws = store.watch(tables);
        let snapshot = store.snapshot();
        let (result, index) = run(&snapshot)?;
        if index > req.min_query_index {
            return Ok((result, index));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok((result, index));
        }
        metrics::BLOCKING_QUERIES.inc();
        let outcome = ws.wait(deadline - now).await;
        metrics::BLOCKING_QUERIES.dec();
        match outcome {
            crate::state_store::WatchOutcome::Timeout => return Ok((result, index)),
            // Changed or abandoned: loop and re-run against fresh state.
            _ => continue,
        }
    }
}

// ── Status handlers ───────────────────────────────────────────────────────────

async fn status_ping(server: Arc<Server>, _req: RpcRequest) -> HandlerResult {
    ok_body(
        &serde_json::json!({"ok": true, "region": server.config.region}),
        server.store.applied_index().max(1),
    )
}

async fn status_leader(server: Arc<Server>, _req: RpcRequest) -> HandlerResult {
    ok_body(
        &serde_json::json!({
            "leader": server.leader_addr(),
            "is_self": server.is_leader(),
        }),
        server.store.applied_index().max(1),
    )
}

async fn status_peers(server: Arc<Server>, _req: RpcRequest) -> HandlerResult {
    let peers: Vec<String> = server
        .peers
        .servers(&server.config.region)
        .into_iter()
        .map(|p| p.addr)
        .collect();
    ok_body(&peers, server.store.applied_index().max(1))
}

#[derive(Deserialize)]
struct HasNodeConnRequest {
    node_id: String,
}

async fn status_has_node_conn(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: HasNodeConnRequest = body(&req)?;
    ok_body(
        &serde_json::json!({"has": server.node_conns.has(&args.node_id)}),
        server.store.applied_index().max(1),
    )
}

// ── Node handlers ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HeartbeatResponse {
    heartbeat_ttl_ms: u64,
}

async fn node_register(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: NodeRegisterRequest = body(&req)?;
    if args.node.id.is_empty() || args.node.secret_id.is_empty() {
        return Err(RpcError::Validation(
            "node id and secret id are required".into(),
        ));
    }
    // A re-registration must present the same secret.
    if let Some(existing) = server.store.snapshot().node(&args.node.id) {
        if existing.secret_id != args.node.secret_id {
            return Err(RpcError::PermissionDenied);
        }
    }
    let node_id = args.node.id.clone();
    let resp = server
        .apply_command(MessageType::NodeRegister, serde_json::to_value(&args).unwrap())
        .await?;
    if let Some(e) = resp.error {
        return Err(e);
    }

    let ttl = server
        .config
        .heartbeat_ttl(server.store.snapshot().nodes().count());
    server.heartbeats.touch(&node_id, ttl);
    ok_body(
        &HeartbeatResponse {
            heartbeat_ttl_ms: ttl.as_millis() as u64,
        },
        resp.index,
    )
}

#[derive(Deserialize)]
struct NodeDeregisterArgs {
    node_ids: Vec<String>,
}

async fn node_deregister(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: NodeDeregisterArgs = body(&req)?;
    let snapshot = server.store.snapshot();
    let mut evals = Vec::new();
    for node_id in &args.node_ids {
        if snapshot.node(node_id).is_none() {
            return Err(RpcError::UnknownNode(node_id.clone()));
        }
        evals.extend(evals_for_node_jobs(&snapshot, node_id, TRIGGER_NODE_UPDATE));
    }
    let cmd = NodeDeregisterRequest {
        node_ids: args.node_ids.clone(),
        evals,
    };
    let resp = server
        .apply_command(MessageType::NodeDeregister, serde_json::to_value(&cmd).unwrap())
        .await?;
    if let Some(e) = resp.error {
        return Err(e);
    }
    for node_id in &args.node_ids {
        server.heartbeats.remove(node_id);
    }
    ok_body(&serde_json::json!({}), resp.index)
}

#[derive(Deserialize)]
struct NodeStatusArgs {
    node_id: String,
    status: NodeStatus,
}

async fn node_update_status(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: NodeStatusArgs = body(&req)?;
    let snapshot = server.store.snapshot();
    let node = snapshot
        .node(&args.node_id)
        .ok_or_else(|| RpcError::UnknownNode(args.node_id.clone()))?;

    // A heartbeat that changes nothing only refreshes the timer.
    if node.status == args.status {
        let ttl = server.config.heartbeat_ttl(snapshot.nodes().count());
        server.heartbeats.touch(&args.node_id, ttl);
        return ok_body(
            &HeartbeatResponse {
                heartbeat_ttl_ms: ttl.as_millis() as u64,
            },
            snapshot.table_index(Table::Nodes),
        );
    }

    let evals = if args.status == NodeStatus::Down {
        evals_for_node_jobs(&snapshot, &args.node_id, TRIGGER_NODE_UPDATE)
    } else {
        Vec::new()
    };
    let cmd = NodeStatusUpdateRequest {
        node_id: args.node_id.clone(),
        status: args.status,
        evals,
    };
    let resp = server
        .apply_command(MessageType::NodeStatusUpdate, serde_json::to_value(&cmd).unwrap())
        .await?;
    if let Some(e) = resp.error {
        return Err(e);
    }

    let ttl = server.config.heartbeat_ttl(snapshot.nodes().count());
    if args.status.is_terminal() {
        server.heartbeats.remove(&args.node_id);
    } else {
        server.heartbeats.touch(&args.node_id, ttl);
    }
    ok_body(
        &HeartbeatResponse {
            heartbeat_ttl_ms: ttl.as_millis() as u64,
        },
        resp.index,
    )
}

#[derive(Deserialize)]
struct NodeDrainArgs {
    node_id: String,
    drain_strategy: Option<DrainStrategy>,
}

async fn node_update_drain(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: NodeDrainArgs = body(&req)?;
    let snapshot = server.store.snapshot();
    if snapshot.node(&args.node_id).is_none() {
        return Err(RpcError::UnknownNode(args.node_id.clone()));
    }
    let evals = if args.drain_strategy.is_some() {
        evals_for_node_jobs(&snapshot, &args.node_id, TRIGGER_NODE_DRAIN)
    } else {
        Vec::new()
    };
    let deadline_ms = args
        .drain_strategy
        .as_ref()
        .map(|d| d.deadline_ms)
        .unwrap_or(0);
    let cmd = NodeDrainUpdateRequest {
        node_id: args.node_id.clone(),
        drain_strategy: args.drain_strategy,
        evals,
    };
    let resp = server
        .apply_command(MessageType::NodeDrainUpdate, serde_json::to_value(&cmd).unwrap())
        .await?;
    if let Some(e) = resp.error {
        return Err(e);
    }

    // Arm the drain deadline. The write above invalidated any previous
    // drain for the node, so at most one live deadline timer exists: the
    // timer re-checks the drain's modify index before forcing.
    if deadline_ms > 0 {
        let server = server.clone();
        let node_id = args.node_id;
        let armed_at = resp.index;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(deadline_ms as u64)).await;
            force_drain_deadline(&server, &node_id, armed_at).await;
        });
    }
    ok_body(&serde_json::json!({}), resp.index)
}

/// Drain deadline passed: migrate whatever is still running on the node
/// and record that the deadline forced it.
async fn force_drain_deadline(server: &Arc<Server>, node_id: &str, armed_at: u64) {
    if !server.is_leader() {
        return;
    }
    let snapshot = server.store.snapshot();
    let Some(node) = snapshot.node(node_id) else {
        return;
    };
    // A newer drain (or a cleared one) owns its own timer.
    let Some(drain) = &node.drain_strategy else {
        return;
    };
    if node.modify_index != armed_at || drain.force_deadline_hit {
        return;
    }

    let transitions: std::collections::HashMap<String, DesiredTransition> = snapshot
        .allocs_by_node(node_id)
        .filter(|a| a.is_live())
        .map(|a| {
            (
                a.id.clone(),
                DesiredTransition {
                    migrate: true,
                    reschedule: true,
                },
            )
        })
        .collect();
    let evals = evals_for_node_jobs(&snapshot, node_id, TRIGGER_NODE_DRAIN);
    info!(
        node_id = %node_id,
        forced_allocs = transitions.len(),
        "drain deadline reached, forcing remaining allocations"
    );

    let mut forced = drain.clone();
    forced.force_deadline_hit = true;
    let drain_cmd = NodeDrainUpdateRequest {
        node_id: node_id.to_string(),
        drain_strategy: Some(forced),
        evals: Vec::new(),
    };
    if let Err(e) = server
        .apply_command(
            MessageType::NodeDrainUpdate,
            serde_json::to_value(&drain_cmd).unwrap(),
        )
        .await
    {
        error!(error = %e, "failed to record forced drain");
        return;
    }
    if transitions.is_empty() {
        return;
    }
    let cmd = AllocDesiredTransitionRequest { transitions, evals };
    if let Err(e) = server
        .apply_command(
            MessageType::AllocDesiredTransition,
            serde_json::to_value(&cmd).unwrap(),
        )
        .await
    {
        error!(error = %e, "failed to force drain transitions");
    }
}

#[derive(Deserialize)]
struct NodeEligibilityArgs {
    node_id: String,
    eligibility: SchedulingEligibility,
}

async fn node_update_eligibility(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: NodeEligibilityArgs = body(&req)?;
    let cmd = NodeEligibilityUpdateRequest {
        node_id: args.node_id,
        eligibility: args.eligibility,
        evals: Vec::new(),
    };
    let resp = server
        .apply_command(
            MessageType::NodeEligibilityUpdate,
            serde_json::to_value(&cmd).unwrap(),
        )
        .await?;
    match resp.error {
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({}), resp.index),
    }
}

#[derive(Deserialize)]
struct NodeUpdateAllocArgs {
    updates: Vec<AllocClientStatusUpdate>,
}

async fn node_update_alloc(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: NodeUpdateAllocArgs = body(&req)?;
    let snapshot = server.store.snapshot();

    // Failed allocs of service jobs reschedule through a fresh eval.
    let mut evals = Vec::new();
    let mut seen_jobs = std::collections::HashSet::new();
    for update in &args.updates {
        if update.client_status != AllocClientStatus::Failed {
            continue;
        }
        let Some(alloc) = snapshot.alloc(&update.alloc_id) else {
            return Err(RpcError::UnknownAlloc(update.alloc_id.clone()));
        };
        let Some(job) = snapshot.job(&alloc.namespace, &alloc.job_id) else {
            continue;
        };
        if job.job_type == JobType::Batch || !seen_jobs.insert(job.key()) {
            continue;
        }
        evals.push(Evaluation::new(
            &alloc.namespace,
            &alloc.job_id,
            job.job_type.scheduler(),
            job.priority,
            TRIGGER_QUEUED_ALLOCS,
        ));
    }

    let cmd = AllocClientUpdateRequest {
        updates: args.updates,
        evals,
    };
    let resp = server
        .apply_command(MessageType::AllocClientUpdate, serde_json::to_value(&cmd).unwrap())
        .await?;
    match resp.error {
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({}), resp.index),
    }
}

#[derive(Deserialize)]
struct NodeGetAllocsArgs {
    node_id: String,
}

async fn node_get_allocs(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: NodeGetAllocsArgs = body(&req)?;
    blocking_query(&server.store, &req, &[Table::Allocs], |snapshot| {
        let allocs: Vec<Allocation> = snapshot
            .allocs_by_node(&args.node_id)
            .map(|a| (**a).clone())
            .collect();
        ok_body(&allocs, snapshot.table_index(Table::Allocs))
    })
    .await
}

// ── Job handlers ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JobRegisterArgs {
    job: Job,
}

async fn job_register(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: JobRegisterArgs = body(&req)?;
    let job = args.job;
    if job.id.is_empty() {
        return Err(RpcError::Validation("job id is required".into()));
    }
    if job.task_groups.is_empty() && job.periodic.is_none() {
        return Err(RpcError::Validation(
            "job requires at least one task group".into(),
        ));
    }
    if !(1..=100).contains(&job.priority) {
        return Err(RpcError::Validation(
            "job priority must be between 1 and 100".into(),
        ));
    }

    // The trigger eval is synthesized here so the FSM stays deterministic.
    let eval = job.is_directly_schedulable().then(|| {
        Evaluation::new(
            &job.namespace,
            &job.id,
            job.job_type.scheduler(),
            job.priority,
            TRIGGER_JOB_REGISTER,
        )
    });
    let eval_id = eval.as_ref().map(|e| e.id.clone());
    let cmd = JobRegisterRequest { job, eval };
    let resp = server
        .apply_command(MessageType::JobRegister, serde_json::to_value(&cmd).unwrap())
        .await?;
    match resp.error {
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({"eval_id": eval_id}), resp.index),
    }
}

#[derive(Deserialize)]
struct JobDeregisterArgs {
    namespace: String,
    job_id: String,
    #[serde(default)]
    purge: bool,
}

async fn job_deregister(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: JobDeregisterArgs = body(&req)?;
    let snapshot = server.store.snapshot();
    let job = snapshot
        .job(&args.namespace, &args.job_id)
        .ok_or_else(|| RpcError::UnknownJob(args.job_id.clone()))?;
    let eval = job.is_directly_schedulable().then(|| {
        Evaluation::new(
            &args.namespace,
            &args.job_id,
            job.job_type.scheduler(),
            job.priority,
            TRIGGER_JOB_DEREGISTER,
        )
    });
    let cmd = JobDeregisterRequest {
        namespace: args.namespace,
        job_id: args.job_id,
        purge: args.purge,
        eval,
    };
    let resp = server
        .apply_command(MessageType::JobDeregister, serde_json::to_value(&cmd).unwrap())
        .await?;
    match resp.error {
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({}), resp.index),
    }
}

#[derive(Deserialize)]
struct JobDispatchArgs {
    namespace: String,
    job_id: String,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    meta: std::collections::HashMap<String, String>,
}

/// Instantiate one run of a parameterized job: a child job named after its
/// parent plus the trigger eval, registered in one command.
async fn job_dispatch(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: JobDispatchArgs = body(&req)?;
    let snapshot = server.store.snapshot();
    let parent = snapshot
        .job(&args.namespace, &args.job_id)
        .ok_or_else(|| RpcError::UnknownJob(args.job_id.clone()))?;
    let Some(parameterized) = &parent.parameterized else {
        return Err(RpcError::Validation(format!(
            "job {:?} is not parameterized",
            args.job_id
        )));
    };
    if parameterized.payload_required && args.payload.is_empty() {
        return Err(RpcError::Validation("dispatch payload is required".into()));
    }
    for key in &parameterized.meta_required {
        if !args.meta.contains_key(key) {
            return Err(RpcError::Validation(format!(
                "required dispatch meta key {:?} missing",
                key
            )));
        }
    }
    if parent.stop {
        return Err(RpcError::Validation("job is stopped".into()));
    }

    let mut child = (*parent).clone();
    child.id = format!("{}/dispatch-{}", parent.id, generate_id());
    child.parameterized = None;
    child.periodic = None;
    let eval = Evaluation::new(
        &child.namespace,
        &child.id,
        child.job_type.scheduler(),
        child.priority,
        TRIGGER_JOB_REGISTER,
    );
    let child_id = child.id.clone();
    let eval_id = eval.id.clone();
    let cmd = JobRegisterRequest {
        job: child,
        eval: Some(eval),
    };
    let resp = server
        .apply_command(MessageType::JobRegister, serde_json::to_value(&cmd).unwrap())
        .await?;
    match resp.error {
        Some(e) => Err(e),
        None => ok_body(
            &serde_json::json!({"dispatched_job_id": child_id, "eval_id": eval_id}),
            resp.index,
        ),
    }
}

#[derive(Deserialize)]
struct JobGetArgs {
    namespace: String,
    job_id: String,
}

async fn job_get(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: JobGetArgs = body(&req)?;
    blocking_query(&server.store, &req, &[Table::Jobs], |snapshot| {
        let job = snapshot.job(&args.namespace, &args.job_id);
        ok_body(
            &job.map(|j| (*j).clone()),
            snapshot.table_index(Table::Jobs),
        )
    })
    .await
}

#[derive(Deserialize)]
struct JobListArgs {
    namespace: String,
}

async fn job_list(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: JobListArgs = body(&req)?;
    blocking_query(&server.store, &req, &[Table::Jobs], |snapshot| {
        let jobs: Vec<Job> = snapshot
            .jobs_by_namespace(&args.namespace)
            .map(|j| (**j).clone())
            .collect();
        ok_body(&jobs, snapshot.table_index(Table::Jobs))
    })
    .await
}

// ── Eval handlers ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EvalGetArgs {
    eval_id: String,
}

async fn eval_get(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: EvalGetArgs = body(&req)?;
    blocking_query(&server.store, &req, &[Table::Evals], |snapshot| {
        ok_body(
            &snapshot.eval(&args.eval_id).map(|e| (*e).clone()),
            snapshot.table_index(Table::Evals),
        )
    })
    .await
}

#[derive(Deserialize)]
struct EvalDequeueArgs {
    schedulers: Vec<String>,
    scheduler_version: u64,
    timeout_ms: u64,
}

async fn eval_dequeue(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: EvalDequeueArgs = body(&req)?;
    let out = server
        .broker
        .dequeue(
            &args.schedulers,
            args.scheduler_version,
            Duration::from_millis(args.timeout_ms.min(10_000)),
        )
        .await?;
    let index = server.store.applied_index().max(1);
    match out {
        Some((eval, token, wait_index)) => {
            // Remote dequeuers get the same lease timer as in-process
            // workers; silence from them redelivers the eval.
            server.broker.start_nack_timer(eval.id.clone(), token.clone());
            ok_body(
                &serde_json::json!({"eval": eval, "token": token, "wait_index": wait_index}),
                index,
            )
        }
        None => ok_body(&serde_json::json!({"eval": null}), index),
    }
}

#[derive(Deserialize)]
struct EvalAckArgs {
    eval_id: String,
    token: String,
}

async fn eval_ack(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: EvalAckArgs = body(&req)?;
    server.broker.ack(&args.eval_id, &args.token)?;
    ok_body(&serde_json::json!({}), server.store.applied_index().max(1))
}

async fn eval_nack(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: EvalAckArgs = body(&req)?;
    server.broker.nack(&args.eval_id, &args.token)?;
    ok_body(&serde_json::json!({}), server.store.applied_index().max(1))
}

// ── Alloc / plan handlers ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AllocGetArgs {
    alloc_id: String,
}

async fn alloc_get(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: AllocGetArgs = body(&req)?;
    blocking_query(&server.store, &req, &[Table::Allocs], |snapshot| {
        ok_body(
            &snapshot.alloc(&args.alloc_id).map(|a| (*a).clone()),
            snapshot.table_index(Table::Allocs),
        )
    })
    .await
}

#[derive(Deserialize)]
struct PlanSubmitArgs {
    plan: Plan,
}

async fn plan_submit(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: PlanSubmitArgs = body(&req)?;
    let result = server.plan_queue.submit(args.plan).await?;
    let index = server.store.applied_index().max(1);
    ok_body(&result, index)
}

// ── Deployment handlers ───────────────────────────────────────────────────────

async fn deployment_promote(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let cmd: DeploymentPromoteRequest = body(&req)?;
    let resp = server
        .apply_command(MessageType::DeploymentPromote, serde_json::to_value(&cmd).unwrap())
        .await?;
    match resp.error {
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({}), resp.index),
    }
}

async fn deployment_set_alloc_health(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let cmd: DeploymentAllocHealthRequest = body(&req)?;
    let resp = server
        .apply_command(
            MessageType::DeploymentAllocHealth,
            serde_json::to_value(&cmd).unwrap(),
        )
        .await?;
    match resp.error {
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({}), resp.index),
    }
}

// ── Variables handlers ────────────────────────────────────────────────────────

async fn variables_apply(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let cmd: VariableApplyRequest = body(&req)?;
    let resp = server
        .apply_command(MessageType::VariableApply, serde_json::to_value(&cmd).unwrap())
        .await?;
    match resp.error {
        // CAS conflicts return the live object instead of a bare error.
        Some(RpcError::Conflict {
            conflict_index,
            conflict,
        }) => ok_body(
            &serde_json::json!({
                "ok": false,
                "conflict_index": conflict_index,
                "conflict": conflict,
            }),
            resp.index,
        ),
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({"ok": true}), resp.index),
    }
}

#[derive(Deserialize)]
struct VariablesReadArgs {
    namespace: String,
    path: String,
}

async fn variables_read(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: VariablesReadArgs = body(&req)?;
    blocking_query(&server.store, &req, &[Table::Variables], |snapshot| {
        ok_body(
            &snapshot
                .variable(&args.namespace, &args.path)
                .map(|v| (*v).clone()),
            snapshot.table_index(Table::Variables),
        )
    })
    .await
}

#[derive(Deserialize)]
struct VariablesListArgs {
    namespace: String,
    #[serde(default)]
    prefix: String,
}

async fn variables_list(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: VariablesListArgs = body(&req)?;
    blocking_query(&server.store, &req, &[Table::Variables], |snapshot| {
        let vars: Vec<Variable> = snapshot
            .variables_by_prefix(&args.namespace, &args.prefix)
            .map(|v| (**v).clone())
            .collect();
        ok_body(&vars, snapshot.table_index(Table::Variables))
    })
    .await
}

// ── ACL / namespace / CSI / service / config handlers ─────────────────────────

macro_rules! passthrough_handler {
    ($name:ident, $args:ty, $mt:expr) => {
        async fn $name(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
            let cmd: $args = body(&req)?;
            let resp = server
                .apply_command($mt, serde_json::to_value(&cmd).unwrap())
                .await?;
            match resp.error {
                Some(e) => Err(e),
                None => ok_body(&serde_json::json!({}), resp.index),
            }
        }
    };
}

passthrough_handler!(job_set_stability, JobStabilityRequest, MessageType::JobStability);
passthrough_handler!(acl_upsert_policies, AclPolicyUpsertRequest, MessageType::AclPolicyUpsert);
passthrough_handler!(acl_delete_policies, AclPolicyDeleteRequest, MessageType::AclPolicyDelete);
passthrough_handler!(acl_upsert_tokens, AclTokenUpsertRequest, MessageType::AclTokenUpsert);
passthrough_handler!(acl_delete_tokens, AclTokenDeleteRequest, MessageType::AclTokenDelete);
passthrough_handler!(acl_upsert_roles, AclRoleUpsertRequest, MessageType::AclRoleUpsert);
passthrough_handler!(acl_delete_roles, AclRoleDeleteRequest, MessageType::AclRoleDelete);
passthrough_handler!(namespace_upsert, NamespaceUpsertRequest, MessageType::NamespaceUpsert);
passthrough_handler!(namespace_delete, NamespaceDeleteRequest, MessageType::NamespaceDelete);
passthrough_handler!(csi_register, CsiVolumeRegisterRequest, MessageType::CsiVolumeRegister);
passthrough_handler!(csi_deregister, CsiVolumeDeregisterRequest, MessageType::CsiVolumeDeregister);
passthrough_handler!(csi_claim, CsiVolumeClaimRequest, MessageType::CsiVolumeClaim);
passthrough_handler!(service_register, ServiceRegisterRequest, MessageType::ServiceRegister);
passthrough_handler!(service_deregister, ServiceDeregisterRequest, MessageType::ServiceDeregister);

async fn scheduler_config_get(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    blocking_query(&server.store, &req, &[Table::SchedulerConfig], |snapshot| {
        ok_body(
            &*snapshot.scheduler_config(),
            snapshot.table_index(Table::SchedulerConfig),
        )
    })
    .await
}

async fn scheduler_config_set(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let cmd: SchedulerConfigSetRequest = body(&req)?;
    let resp = server
        .apply_command(MessageType::SchedulerConfigSet, serde_json::to_value(&cmd).unwrap())
        .await?;
    match resp.error {
        Some(RpcError::Conflict {
            conflict_index,
            conflict,
        }) => ok_body(
            &serde_json::json!({
                "ok": false,
                "conflict_index": conflict_index,
                "conflict": conflict,
            }),
            resp.index,
        ),
        Some(e) => Err(e),
        None => ok_body(&serde_json::json!({"ok": true}), resp.index),
    }
}

// ── Agent handlers ────────────────────────────────────────────────────────────

async fn agent_pause_schedulers(server: Arc<Server>, _req: RpcRequest) -> HandlerResult {
    server.pause_workers();
    ok_body(&serde_json::json!({}), server.store.applied_index().max(1))
}

async fn agent_resume_schedulers(server: Arc<Server>, _req: RpcRequest) -> HandlerResult {
    server.resume_workers();
    ok_body(&serde_json::json!({}), server.store.applied_index().max(1))
}

async fn agent_scheduler_status(server: Arc<Server>, _req: RpcRequest) -> HandlerResult {
    let statuses: Vec<serde_json::Value> = server
        .worker_statuses()
        .into_iter()
        .map(|(id, status, workload)| {
            serde_json::json!({"id": id, "status": status, "workload": workload})
        })
        .collect();
    ok_body(&statuses, server.store.applied_index().max(1))
}

// ── Node-connection forwarding ────────────────────────────────────────────────

#[derive(Deserialize)]
struct ClientAllocArgs {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    alloc_id: String,
}

/// Client-directed RPCs: find which server holds a live session to the
/// target node, locally or among peers, and pipe the call over it.
async fn client_alloc_forward(server: Arc<Server>, req: RpcRequest) -> HandlerResult {
    let args: ClientAllocArgs = body(&req)?;
    let snapshot = server.store.snapshot();
    let node_id = if !args.node_id.is_empty() {
        args.node_id.clone()
    } else if !args.alloc_id.is_empty() {
        snapshot
            .alloc(&args.alloc_id)
            .map(|a| a.node_id.clone())
            .ok_or_else(|| RpcError::UnknownAlloc(args.alloc_id.clone()))?
    } else {
        return Err(RpcError::Validation(
            "node_id or alloc_id is required".into(),
        ));
    };

    // Local session first.
    if let Some(session) = server.node_conns.get(&node_id) {
        let result = session.call(&req.method, req.body.clone()).await?;
        return Ok((result, server.store.applied_index().max(1)));
    }

    // Otherwise find the peer server holding the session.
    if let Some(peer) = server_with_node_conn(&server, &node_id).await {
        debug!(node_id = %node_id, peer = %peer, method = %req.method, "forwarding to node-conn holder");
        let resp = server.rpc_clients.call(&peer, &req).await?;
        return match resp.error {
            Some(e) => Err(crate::errors::error_from_wire(&e)),
            None => Ok((resp.body, resp.index)),
        };
    }
    Err(RpcError::NoNodeConn(node_id))
}

/// Ask every peer in the home region whether it holds the node's session.
async fn server_with_node_conn(server: &Arc<Server>, node_id: &str) -> Option<String> {
    let probe = RpcRequest {
        method: "Status.HasNodeConn".into(),
        region: server.config.region.clone(),
        body: serde_json::json!({"node_id": node_id}),
        ..RpcRequest::default()
    };
    for peer in server.peers.servers(&server.config.region) {
        if peer.addr == server.config.advertise_addr {
            continue;
        }
        match server.rpc_clients.call(&peer.addr, &probe).await {
            Ok(resp) => {
                if resp
                    .body
                    .get("has")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    return Some(peer.addr);
                }
            }
            Err(e) => debug!(peer = %peer.addr, error = %e, "node-conn probe failed"),
        }
    }
    None
}

// ── Node sessions (multiplexed connections) ───────────────────────────────────

type DynConn = Box<dyn AsyncReadWrite>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

enum Inbound {
    Rpc(oneshot::Sender<Vec<u8>>),
    Bridge(mpsc::Sender<Vec<u8>>),
}

/// One multiplexed session to a worker node. The server opens substreams
/// with odd ids for forwarded client RPCs and byte bridges; node-opened
/// substreams carry ordinary RPC requests inbound.
pub struct NodeSession {
    write: tokio::sync::Mutex<WriteHalf<DynConn>>,
    pending: Mutex<HashMap<u32, Inbound>>,
    next_stream_id: AtomicU32,
}

impl NodeSession {
    fn new(write: WriteHalf<DynConn>) -> Arc<Self> {
        Arc::new(Self {
            write: tokio::sync::Mutex::new(write),
            pending: Mutex::new(HashMap::new()),
            // Odd ids are server-initiated.
            next_stream_id: AtomicU32::new(1),
        })
    }

    fn next_id(&self) -> u32 {
        self.next_stream_id.fetch_add(2, Ordering::SeqCst)
    }

    async fn send(&self, stream_id: u32, payload: &[u8]) -> Result<(), RpcError> {
        let mut write = self.write.lock().await;
        write_mux_frame(&mut *write, stream_id, payload)
            .await
            .map_err(|e| RpcError::Io(e.to_string()))
    }

    /// One forwarded request/response over a fresh substream.
    pub async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let stream_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(stream_id, Inbound::Rpc(tx));

        let req = RpcRequest {
            method: method.to_string(),
            seq: stream_id as u64,
            body,
            ..RpcRequest::default()
        };
        let payload = serde_json::to_vec(&req).map_err(|e| RpcError::Io(e.to_string()))?;
        if let Err(e) = self.send(stream_id, &payload).await {
            self.pending.lock().unwrap().remove(&stream_id);
            return Err(e);
        }

        let raw = tokio::time::timeout(NODE_CALL_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.lock().unwrap().remove(&stream_id);
                RpcError::Io("node call timed out".into())
            })?
            .map_err(|_| RpcError::Io("node session closed".into()))?;

        let resp: RpcResponse =
            serde_json::from_slice(&raw).map_err(|e| RpcError::Io(e.to_string()))?;
        match resp.error {
            Some(e) => Err(crate::errors::error_from_wire(&e)),
            None => Ok(resp.body),
        }
    }

    /// Open a byte bridge toward the node: sends the typed header and
    /// returns the stream id plus the inbound chunk channel. The first
    /// inbound chunk is the node's ack frame.
    pub async fn open_bridge(
        &self,
        header: &StreamHeader,
        request: &[u8],
    ) -> Result<(u32, mpsc::Receiver<Vec<u8>>), RpcError> {
        let stream_id = self.next_id();
        let (tx, rx) = mpsc::channel(32);
        self.pending
            .lock()
            .unwrap()
            .insert(stream_id, Inbound::Bridge(tx));

        let header_bytes =
            serde_json::to_vec(header).map_err(|e| RpcError::Io(e.to_string()))?;
        if let Err(e) = self.send(stream_id, &header_bytes).await {
            self.pending.lock().unwrap().remove(&stream_id);
            return Err(e);
        }
        self.send(stream_id, request).await?;
        Ok((stream_id, rx))
    }

    pub async fn send_chunk(&self, stream_id: u32, chunk: &[u8]) -> Result<(), RpcError> {
        self.send(stream_id, chunk).await
    }

    fn close_stream(&self, stream_id: u32) {
        self.pending.lock().unwrap().remove(&stream_id);
    }
}

/// Serve one mux connection. For muxV2 the first byte of each new
/// substream's first frame selects rpc or stream; legacy mux substreams
/// are always rpc.
async fn mux_session(server: Arc<Server>, conn: DynConn, v2: bool) {
    let (mut read, write) = tokio::io::split(conn);
    let session = NodeSession::new(write);
    // Set once the node identifies itself over this session.
    let registered_node: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    loop {
        let (stream_id, mut payload) = match read_mux_frame(&mut read).await {
            Ok(f) => f,
            Err(_) => break,
        };

        // Responses and bridge chunks for server-initiated substreams.
        let routed = {
            let mut pending = session.pending.lock().unwrap();
            match pending.remove(&stream_id) {
                Some(Inbound::Rpc(tx)) => {
                    let _ = tx.send(payload.clone());
                    true
                }
                Some(Inbound::Bridge(tx)) => {
                    // An empty frame closes the bridge; otherwise the chunk
                    // is forwarded and the bridge entry restored.
                    if !payload.is_empty() {
                        let _ = tx.try_send(payload.clone());
                        pending.insert(stream_id, Inbound::Bridge(tx));
                    }
                    true
                }
                None => false,
            }
        };
        if routed {
            continue;
        }

        // A node-initiated substream: one RPC request per frame.
        if v2 {
            match payload.first() {
                Some(&MAGIC_RPC) => {
                    payload.remove(0);
                }
                Some(&MAGIC_STREAM) => {
                    // Node-initiated streams are not part of the server's
                    // surface; drop the substream.
                    warn!(stream_id, "unexpected node-initiated stream substream");
                    continue;
                }
                _ => {
                    warn!(stream_id, "bad muxV2 substream selector, dropping conn");
                    break;
                }
            }
        }
        let req: RpcRequest = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(stream_id, error = %e, "undecodable mux rpc frame, dropping conn");
                break;
            }
        };

        // Session registration binds this connection into the node-conn
        // map, enabling forwarded client RPCs.
        if req.method == "Node.RegisterSession" {
            let resp = register_session(&server, &session, &registered_node, &req);
            let bytes = serde_json::to_vec(&resp).unwrap_or_default();
            if session.send(stream_id, &bytes).await.is_err() {
                break;
            }
            continue;
        }

        let server = server.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let resp = process_request(server, req).await;
            let bytes = serde_json::to_vec(&resp).unwrap_or_default();
            let _ = session.send(stream_id, &bytes).await;
        });
    }

    let closed_node_id = registered_node.lock().unwrap().take();
    if let Some(node_id) = closed_node_id {
        info!(node_id = %node_id, "node session closed");
        server.node_conns.remove(&node_id);
    }
}

#[derive(Deserialize)]
struct RegisterSessionArgs {
    node_id: String,
    secret_id: String,
}

fn register_session(
    server: &Arc<Server>,
    session: &Arc<NodeSession>,
    registered: &Arc<Mutex<Option<String>>>,
    req: &RpcRequest,
) -> RpcResponse {
    let args: Result<RegisterSessionArgs, _> = serde_json::from_value(req.body.clone());
    let resp_err = |seq, e: &RpcError| RpcResponse {
        seq,
        error: Some(error_to_wire(e)),
        index: 0,
        body: serde_json::Value::Null,
    };
    let args = match args {
        Ok(a) => a,
        Err(e) => {
            return resp_err(req.seq, &RpcError::Validation(e.to_string()));
        }
    };
    // The session must present the node's secret when the node is known.
    if let Some(node) = server.store.snapshot().node(&args.node_id) {
        if node.secret_id != args.secret_id {
            return resp_err(req.seq, &RpcError::PermissionDenied);
        }
    }
    server.node_conns.insert(&args.node_id, session.clone());
    *registered.lock().unwrap() = Some(args.node_id.clone());
    info!(node_id = %args.node_id, "node session registered");
    RpcResponse {
        seq: req.seq,
        error: None,
        index: server.store.applied_index().max(1),
        body: serde_json::json!({"ok": true}),
    }
}

// ── Streaming connections ─────────────────────────────────────────────────────

/// A stream-magic connection: typed header, ack, then a transparent byte
/// bridge to the node (or the peer server holding it).
async fn stream_session(server: Arc<Server>, mut conn: DynConn) {
    let header: StreamHeader = match read_frame(&mut conn)
        .await
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
    {
        Some(h) => h,
        None => return,
    };
    let request = match read_frame(&mut conn).await {
        Ok(r) => r,
        Err(_) => return,
    };
    let args: ClientAllocArgs = match serde_json::from_slice(&request) {
        Ok(a) => a,
        Err(e) => {
            let _ = send_stream_ack(&mut conn, &format!("malformed stream request: {e}")).await;
            return;
        }
    };

    let snapshot = server.store.snapshot();
    let node_id = if !args.node_id.is_empty() {
        args.node_id.clone()
    } else {
        match snapshot.alloc(&args.alloc_id) {
            Some(a) => a.node_id.clone(),
            None => {
                let _ = send_stream_ack(
                    &mut conn,
                    &error_to_wire(&RpcError::UnknownAlloc(args.alloc_id.clone())),
                )
                .await;
                return;
            }
        }
    };

    if let Some(session) = server.node_conns.get(&node_id) {
        bridge_to_node(conn, session, &header, &request).await;
        return;
    }

    // Not local: pipe the whole stream to the peer that owns the session.
    if let Some(peer) = server_with_node_conn(&server, &node_id).await {
        bridge_to_peer(conn, &peer, &header, &request).await;
        return;
    }
    let _ = send_stream_ack(&mut conn, &error_to_wire(&RpcError::NoNodeConn(node_id))).await;
}

async fn send_stream_ack(conn: &mut DynConn, error: &str) -> std::io::Result<()> {
    let ack = StreamAck {
        error: error.to_string(),
    };
    write_frame(conn, &serde_json::to_vec(&ack).unwrap_or_default()).await
}

/// Caller <-> node bridge: the node's ack frame is relayed first; an empty
/// error hijacks the stream and bytes flow both ways until either side
/// closes.
async fn bridge_to_node(
    mut conn: DynConn,
    session: Arc<NodeSession>,
    header: &StreamHeader,
    request: &[u8],
) {
    let (stream_id, mut from_node) = match session.open_bridge(header, request).await {
        Ok(out) => out,
        Err(e) => {
            let _ = send_stream_ack(&mut conn, &error_to_wire(&e)).await;
            return;
        }
    };

    // First chunk back is the ack.
    let ack_raw = match from_node.recv().await {
        Some(raw) => raw,
        None => {
            let _ = send_stream_ack(&mut conn, "node closed stream before ack").await;
            session.close_stream(stream_id);
            return;
        }
    };
    if write_frame(&mut conn, &ack_raw).await.is_err() {
        session.close_stream(stream_id);
        return;
    }
    let hijacked = serde_json::from_slice::<StreamAck>(&ack_raw)
        .map(|a| a.error.is_empty())
        .unwrap_or(false);
    if !hijacked {
        session.close_stream(stream_id);
        return;
    }

    // Transparent byte bridge.
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            read = conn.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if session.send_chunk(stream_id, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            chunk = from_node.recv() => match chunk {
                None => break,
                Some(chunk) => {
                    if conn.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    let _ = session.send_chunk(stream_id, &[]).await; // close marker
    session.close_stream(stream_id);
}

/// Caller <-> peer-server bridge: replay the handshake toward the peer's
/// stream endpoint, then copy bytes bidirectionally.
async fn bridge_to_peer(mut conn: DynConn, peer: &str, header: &StreamHeader, request: &[u8]) {
    let mut peer_conn = match tokio::net::TcpStream::connect(peer).await {
        Ok(c) => c,
        Err(e) => {
            let _ = send_stream_ack(&mut conn, &format!("peer dial failed: {e}")).await;
            return;
        }
    };
    let handshake = async {
        peer_conn.write_all(&[MAGIC_STREAM]).await?;
        write_frame(
            &mut peer_conn,
            &serde_json::to_vec(header).unwrap_or_default(),
        )
        .await?;
        write_frame(&mut peer_conn, request).await
    };
    if handshake.await.is_err() {
        let _ = send_stream_ack(&mut conn, "peer handshake failed").await;
        return;
    }
    let _ = tokio::io::copy_bidirectional(&mut conn, &mut peer_conn).await;
}

// ── Connection intake ─────────────────────────────────────────────────────────

/// Per-remote-IP connection accounting with a lower sub-limit for
/// streaming connections.
struct ConnLimits {
    max_per_ip: usize,
    counts: Mutex<HashMap<IpAddr, (usize, usize)>>,
}

impl ConnLimits {
    fn new(max_per_ip: usize) -> Arc<Self> {
        Arc::new(Self {
            max_per_ip,
            counts: Mutex::new(HashMap::new()),
        })
    }

    fn streaming_limit(&self) -> usize {
        (self.max_per_ip / 2).max(1)
    }

    fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(ip).or_insert((0, 0));
        if entry.0 >= self.max_per_ip {
            return false;
        }
        entry.0 += 1;
        true
    }

    /// Streaming connections consume a second, tighter budget.
    fn try_acquire_streaming(&self, ip: IpAddr) -> bool {
        let limit = self.streaming_limit();
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(ip).or_insert((0, 0));
        if entry.1 >= limit {
            return false;
        }
        entry.1 += 1;
        true
    }

    fn release(&self, ip: IpAddr, streaming: bool) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(entry) = counts.get_mut(&ip) {
            entry.0 = entry.0.saturating_sub(1);
            if streaming {
                entry.1 = entry.1.saturating_sub(1);
            }
            if *entry == (0, 0) {
                counts.remove(&ip);
            }
        }
    }
}

fn build_tls_acceptor(config: &crate::config::ServerConfig) -> Option<tokio_rustls::TlsAcceptor> {
    let (cert_path, key_path) = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(c), Some(k)) => (c.clone(), k.clone()),
        _ => return None,
    };
    let load = || -> Result<tokio_rustls::TlsAcceptor, Box<dyn std::error::Error>> {
        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
            &cert_path,
        )?))
        .collect::<Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
            &key_path,
        )?))?
        .ok_or("no private key in file")?;
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config)))
    };
    match load() {
        Ok(acceptor) => Some(acceptor),
        Err(e) => {
            error!(error = %e, "failed to load TLS material, tls magic disabled");
            None
        }
    }
}

/// Bind the fabric listener and spawn the accept loop.
pub async fn start_listener(server: Arc<Server>) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(&server.config.bind_addr).await?;
    let addr = listener.local_addr()?;
    let limits = ConnLimits::new(server.config.rpc_max_conns_per_client);
    let tls = build_tls_acceptor(&server.config).map(Arc::new);
    let mut shutdown = server.shutdown_rx();

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("rpc listener shutting down");
                        return;
                    }
                    continue;
                }
            };
            let (stream, remote) = match accepted {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let ip = remote.ip();
            if !limits.try_acquire(ip) {
                metrics::RPC_CONNS_REJECTED.inc();
                debug!(remote = %remote, "connection limit reached, dropping");
                continue;
            }
            let server = server.clone();
            let limits = limits.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let streaming =
                    handle_connection(server, Box::new(stream), ip, limits.clone(), tls, false)
                        .await;
                limits.release(ip, streaming);
            });
        }
    });
    Ok(addr)
}

/// Route one connection by its magic byte. Returns whether it counted
/// against the streaming sub-limit.
fn handle_connection(
    server: Arc<Server>,
    mut conn: DynConn,
    ip: IpAddr,
    limits: Arc<ConnLimits>,
    tls: Option<Arc<tokio_rustls::TlsAcceptor>>,
    tls_wrapped: bool,
) -> Pin<Box<dyn Future<Output = bool> + Send>> {
    Box::pin(async move {
        // Unauthenticated connections only hold the socket until the
        // handshake deadline.
        let magic = match tokio::time::timeout(
            server.config.rpc_handshake_timeout,
            conn.read_u8(),
        )
        .await
        {
            Ok(Ok(b)) => b,
            _ => {
                metrics::RPC_CONNS_REJECTED.inc();
                return false;
            }
        };

        match magic {
            MAGIC_RPC => {
                rpc_session(server, conn).await;
                false
            }
            MAGIC_RAFT => {
                crate::raft::handle_raft_connection(conn, server.raft.clone()).await;
                false
            }
            MAGIC_MUX => {
                mux_session(server, conn, false).await;
                false
            }
            MAGIC_MUX_V2 => {
                mux_session(server, conn, true).await;
                false
            }
            MAGIC_STREAM => {
                if !limits.try_acquire_streaming(ip) {
                    metrics::RPC_CONNS_REJECTED.inc();
                    return false;
                }
                stream_session(server, conn).await;
                true
            }
            MAGIC_TLS => {
                // TLS-in-TLS is forbidden.
                if tls_wrapped {
                    metrics::RPC_CONNS_REJECTED.inc();
                    return false;
                }
                let Some(acceptor) = tls.clone() else {
                    metrics::RPC_CONNS_REJECTED.inc();
                    return false;
                };
                match acceptor.accept(conn).await {
                    Ok(tls_conn) => {
                        handle_connection(server, Box::new(tls_conn), ip, limits, tls, true)
                            .await
                    }
                    Err(e) => {
                        debug!(error = %e, "tls handshake failed, dropping");
                        metrics::RPC_CONNS_REJECTED.inc();
                        false
                    }
                }
            }
            other => {
                warn!(magic = other, "unknown connection magic byte, dropping");
                metrics::RPC_CONNS_REJECTED.inc();
                false
            }
        }
    })
}

/// One regular RPC connection: a loop of request/response frames.
async fn rpc_session(server: Arc<Server>, mut conn: DynConn) {
    loop {
        let raw = match read_frame(&mut conn).await {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let req: RpcRequest = match serde_json::from_slice(&raw) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "undecodable rpc frame, dropping conn");
                return;
            }
        };
        let resp = process_request(server.clone(), req).await;
        let bytes = match serde_json::to_vec(&resp) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode rpc response");
                return;
            }
        };
        if write_frame(&mut conn, &bytes).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_covers_core_surface() {
        for method in [
            "Status.Ping",
            "Node.Register",
            "Node.UpdateStatus",
            "Job.Register",
            "Eval.Dequeue",
            "Plan.Submit",
            "Variables.Apply",
            "Variables.List",
            "ACL.UpsertTokens",
            "CSIVolume.Claim",
            "SchedulerConfig.Set",
            "ClientAlloc.Exec",
        ] {
            // ClientAlloc.Exec is stream-only; everything else is framed.
            if method == "ClientAlloc.Exec" {
                assert!(!DISPATCH.contains_key(method));
            } else {
                assert!(DISPATCH.contains_key(method), "{method} missing");
            }
        }
    }

    #[test]
    fn write_methods_require_leader() {
        for method in ["Node.Register", "Job.Register", "Variables.Apply"] {
            assert!(DISPATCH[method].requires_leader, "{method}");
        }
        assert!(!DISPATCH["Status.Ping"].requires_leader);
        assert!(DISPATCH["Status.Ping"].always_local);
    }

    #[test]
    fn conn_limits_enforced_per_ip() {
        let limits = ConnLimits::new(2);
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        assert!(limits.try_acquire(ip));
        assert!(limits.try_acquire(ip));
        assert!(!limits.try_acquire(ip));
        limits.release(ip, false);
        assert!(limits.try_acquire(ip));

        // A different IP has its own budget.
        let other: IpAddr = "10.0.0.10".parse().unwrap();
        assert!(limits.try_acquire(other));
    }

    #[test]
    fn streaming_sublimit_is_tighter() {
        let limits = ConnLimits::new(4);
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(limits.streaming_limit(), 2);
        assert!(limits.try_acquire_streaming(ip));
        assert!(limits.try_acquire_streaming(ip));
        assert!(!limits.try_acquire_streaming(ip));
        limits.release(ip, true);
        assert!(limits.try_acquire_streaming(ip));
    }

    #[test]
    fn request_envelope_roundtrip() {
        let req = RpcRequest {
            method: "Job.Get".into(),
            seq: 9,
            region: "eu".into(),
            allow_stale: true,
            min_query_index: 12,
            max_query_time_ms: 5_000,
            body: serde_json::json!({"namespace": "default", "job_id": "web"}),
            ..RpcRequest::default()
        };
        let raw = serde_json::to_vec(&req).unwrap();
        let back: RpcRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.method, "Job.Get");
        assert_eq!(back.min_query_index, 12);
        assert!(back.allow_stale);
    }
}
