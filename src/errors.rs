//! Error taxonomy for the control plane.
//!
//! Every fallible path in the core returns [`RpcError`]. The variants fall
//! into five behavioral kinds that callers dispatch on:
//!
//! | Kind       | Variants                                              | Surface                      |
//! |------------|-------------------------------------------------------|------------------------------|
//! | Transient  | NoLeader, PlanQueueDisabled, RaftTimeout, SnapshotWait | retried with backoff         |
//! | Validation | Validation, UnknownMethod, Unknown*, RegionNotFound, VersionMismatch | returned immediately |
//! | Authz      | PermissionDenied                                      | returned immediately, never retried |
//! | Conflict   | Conflict (CAS failures, carries the live object)      | returned with conflict value |
//! | Shutdown   | Shutdown                                              | clean loop exit              |
//!
//! Decode failure on a **committed** Raft entry is not represented here: the
//! log is corrupt and the process panics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by RPC handlers, the plan pipeline and the broker.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum RpcError {
    /// No Raft leader is currently elected or known.
    #[error("No cluster leader")]
    NoLeader,

    /// The plan queue only runs on the leader; it is disabled here.
    #[error("plan queue is disabled")]
    PlanQueueDisabled,

    /// The eval broker only runs on the leader; it is disabled here.
    #[error("eval broker is disabled")]
    BrokerDisabled,

    /// Raft could not accept the proposal within the enqueue timeout.
    #[error("timed out enqueuing operation into raft")]
    RaftTimeout,

    /// A worker gave up waiting for the state store to reach a wait index.
    #[error("timed out waiting for state store to reach index {index}")]
    SnapshotWait { index: u64 },

    /// The request failed logical validation.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The RPC method name is not in the dispatch table.
    #[error("unknown rpc method {0:?}")]
    UnknownMethod(String),

    #[error("unknown node {0:?}")]
    UnknownNode(String),

    #[error("unknown job {0:?}")]
    UnknownJob(String),

    #[error("unknown allocation {0:?}")]
    UnknownAlloc(String),

    #[error("unknown evaluation {0:?}")]
    UnknownEval(String),

    /// No servers are remembered for the requested region.
    #[error("no path to region {0:?}")]
    RegionNotFound(String),

    /// Dequeue with a stale scheduler version, or an eval token that does
    /// not match the current lease.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// Caller is not authorized (including expired tokens). Never retried.
    #[error("Permission denied")]
    PermissionDenied,

    /// Compare-and-swap failure. Carries the live object (possibly redacted)
    /// so the caller can re-base.
    #[error("conflicting modify index {conflict_index}")]
    Conflict {
        conflict_index: u64,
        /// JSON rendering of the conflicting object.
        conflict: String,
    },

    /// No live session to the target node on any server.
    #[error("no server holds a connection to node {0:?}")]
    NoNodeConn(String),

    /// The server is shutting down; long-lived loops exit without error.
    #[error("shutting down")]
    Shutdown,

    /// Transport-level failure talking to a peer server.
    #[error("rpc io: {0}")]
    Io(String),
}

impl RpcError {
    /// True for kinds that callers recover from locally with backoff + retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::NoLeader
                | RpcError::PlanQueueDisabled
                | RpcError::BrokerDisabled
                | RpcError::RaftTimeout
                | RpcError::SnapshotWait { .. }
                | RpcError::Io(_)
        )
    }

    /// Label used for the error counter metric.
    pub fn label(&self) -> &'static str {
        match self {
            RpcError::NoLeader => "no_leader",
            RpcError::PlanQueueDisabled => "plan_queue_disabled",
            RpcError::BrokerDisabled => "broker_disabled",
            RpcError::RaftTimeout => "raft_timeout",
            RpcError::SnapshotWait { .. } => "snapshot_wait",
            RpcError::Validation(_) => "validation",
            RpcError::UnknownMethod(_) => "unknown_method",
            RpcError::UnknownNode(_) => "unknown_node",
            RpcError::UnknownJob(_) => "unknown_job",
            RpcError::UnknownAlloc(_) => "unknown_alloc",
            RpcError::UnknownEval(_) => "unknown_eval",
            RpcError::RegionNotFound(_) => "region_not_found",
            RpcError::VersionMismatch(_) => "version_mismatch",
            RpcError::PermissionDenied => "permission_denied",
            RpcError::Conflict { .. } => "conflict",
            RpcError::NoNodeConn(_) => "no_node_conn",
            RpcError::Shutdown => "shutdown",
            RpcError::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(e.to_string())
    }
}

/// Wire rendering used when an error crosses the RPC fabric. The transient
/// leader errors keep their exact strings because remote callers match on
/// them to pick a backoff.
pub fn error_to_wire(err: &RpcError) -> String {
    err.to_string()
}

/// Inverse of [`error_to_wire`] for the strings remote callers dispatch on.
/// Anything unrecognized comes back as `Io` so it is treated as retryable
/// transport trouble rather than silently dropped.
pub fn error_from_wire(s: &str) -> RpcError {
    match s {
        "No cluster leader" => RpcError::NoLeader,
        "plan queue is disabled" => RpcError::PlanQueueDisabled,
        "eval broker is disabled" => RpcError::BrokerDisabled,
        "Permission denied" => RpcError::PermissionDenied,
        "shutting down" => RpcError::Shutdown,
        other => RpcError::Io(other.to_string()),
    }
}
