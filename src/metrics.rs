//! Prometheus metrics and the HTTP health + metrics endpoint.
//!
//! Counters and histograms are keyed by dotted paths flattened to
//! underscores under the `flotilla` namespace. Absence of a scraper never
//! affects behavior; every metric is fire-and-forget.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};
use tracing::{error, info};

const NAMESPACE: &str = "flotilla";

lazy_static::lazy_static! {
    // === Eval broker ===

    pub static ref EVAL_ENQUEUES: IntCounter =
        IntCounter::with_opts(
            Opts::new("eval_enqueues_total", "Evaluations accepted by the broker")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref EVAL_DEQUEUES: IntCounter =
        IntCounter::with_opts(
            Opts::new("eval_dequeues_total", "Evaluation leases handed to workers")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref EVAL_ACKS: IntCounter =
        IntCounter::with_opts(
            Opts::new("eval_acks_total", "Evaluation leases acknowledged")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref EVAL_NACKS: IntCounter =
        IntCounter::with_opts(
            Opts::new("eval_nacks_total", "Evaluation leases returned for redelivery")
                .namespace(NAMESPACE)
        ).unwrap();

    // === Blocked tracker ===

    pub static ref BLOCKED_EVALS: IntGauge =
        IntGauge::with_opts(
            Opts::new("blocked_evals", "Evaluations held by the blocked tracker")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref BLOCKED_UNBLOCKS: IntCounter =
        IntCounter::with_opts(
            Opts::new("blocked_unblocks_total", "Blocked evaluations republished")
                .namespace(NAMESPACE)
        ).unwrap();

    // === Plan pipeline ===

    pub static ref PLANS_COMMITTED: IntCounter =
        IntCounter::with_opts(
            Opts::new("plans_committed_total", "Plans committed through raft")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref PLANS_REJECTED: IntCounter =
        IntCounter::with_opts(
            Opts::new("plans_rejected_total", "Plans fully rejected at validation")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref PLAN_APPLY_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "plan_apply_seconds",
                "Plan validation plus commit latency in seconds"
            ).namespace(NAMESPACE)
        ).unwrap();

    // === RPC fabric ===

    pub static ref RPC_REQUESTS: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rpc_requests_total", "RPC requests by method")
                .namespace(NAMESPACE),
            &["method"]
        ).unwrap();

    pub static ref RPC_ERRORS: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rpc_errors_total", "RPC errors by kind")
                .namespace(NAMESPACE),
            &["kind"]
        ).unwrap();

    pub static ref RPC_CONNS_REJECTED: IntCounter =
        IntCounter::with_opts(
            Opts::new("rpc_conns_rejected_total", "Connections dropped by limits or bad magic")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref BLOCKING_QUERIES: IntGauge =
        IntGauge::with_opts(
            Opts::new("blocking_queries", "Blocking queries currently parked")
                .namespace(NAMESPACE)
        ).unwrap();

    // === Heartbeats ===

    pub static ref HEARTBEAT_TIMERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("heartbeat_timers", "Live node heartbeat timers")
                .namespace(NAMESPACE)
        ).unwrap();

    pub static ref NODES_MARKED_DOWN: IntCounter =
        IntCounter::with_opts(
            Opts::new("nodes_marked_down_total", "Nodes downed by heartbeat expiry")
                .namespace(NAMESPACE)
        ).unwrap();
}

/// Registers every metric with the default registry. Call once at startup;
/// duplicate registration errors are surfaced to the caller.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(EVAL_ENQUEUES.clone()))?;
    registry.register(Box::new(EVAL_DEQUEUES.clone()))?;
    registry.register(Box::new(EVAL_ACKS.clone()))?;
    registry.register(Box::new(EVAL_NACKS.clone()))?;
    registry.register(Box::new(BLOCKED_EVALS.clone()))?;
    registry.register(Box::new(BLOCKED_UNBLOCKS.clone()))?;
    registry.register(Box::new(PLANS_COMMITTED.clone()))?;
    registry.register(Box::new(PLANS_REJECTED.clone()))?;
    registry.register(Box::new(PLAN_APPLY_SECONDS.clone()))?;
    registry.register(Box::new(RPC_REQUESTS.clone()))?;
    registry.register(Box::new(RPC_ERRORS.clone()))?;
    registry.register(Box::new(RPC_CONNS_REJECTED.clone()))?;
    registry.register(Box::new(BLOCKING_QUERIES.clone()))?;
    registry.register(Box::new(HEARTBEAT_TIMERS.clone()))?;
    registry.register(Box::new(NODES_MARKED_DOWN.clone()))?;
    Ok(())
}

/// JSON body returned by `GET /health/cluster`.
#[derive(Debug, serde::Serialize)]
struct HealthResponse {
    node_id: String,
    region: String,
    state: String,
    leader: bool,
    applied_index: u64,
}

/// Read-only view the health endpoint needs from the server.
pub trait HealthSource: Send + Sync + 'static {
    fn node_id(&self) -> String;
    fn region(&self) -> String;
    fn is_leader(&self) -> bool;
    fn applied_index(&self) -> u64;
}

async fn http_handler(
    req: Request<Body>,
    source: Arc<dyn HealthSource>,
) -> Result<Response<Body>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let families = prometheus::default_registry().gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&families, &mut buffer) {
                error!(error = %e, "failed to encode metrics");
            }
            Response::builder()
                .status(200)
                .header("Content-Type", encoder.format_type())
                .body(Body::from(buffer))
                .unwrap()
        }
        "/health/cluster" => {
            let body = HealthResponse {
                node_id: source.node_id(),
                region: source.region(),
                state: if source.is_leader() {
                    "leader".to_string()
                } else {
                    "follower".to_string()
                },
                leader: source.is_leader(),
                applied_index: source.applied_index(),
            };
            let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
            Response::builder()
                .status(200)
                .header("Content-Type", "application/json")
                .body(Body::from(json))
                .unwrap()
        }
        _ => Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap(),
    };
    Ok(response)
}

/// Serves `/metrics` and `/health/cluster`. Runs until the process exits;
/// spawn it in a background task.
pub async fn start_http_server(addr: SocketAddr, source: Arc<dyn HealthSource>) {
    let make_svc = make_service_fn(move |_conn| {
        let source = source.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let source = source.clone();
                async move { http_handler(req, source).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "health + metrics endpoint started");
    if let Err(e) = server.await {
        error!(error = %e, "health server error");
    }
}
