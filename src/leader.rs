//! Leadership lifecycle: what turns on when this server wins an election
//! and what drains when it loses one.
//!
//! Establishment: enable the broker, blocked tracker, periodic dispatcher
//! and heartbeat manager; refill the broker from the state store's pending
//! evals; replay missed periodic launches; grant every node the failover
//! TTL; start the plan applier. Revocation tears all of that down; unacked
//! broker leases implicitly revert because the next leader re-enqueues
//! from state.
//!
//! The loop also owns the leader-side channel consumers: evals failed out
//! by the broker (delivery limit), periodic launches, and expired
//! heartbeats. All of them write through Raft.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::fsm::{
    EvalUpdateRequest, MessageType, NodeStatusUpdateRequest, PeriodicLaunchUpsertRequest,
};
use crate::periodic::LaunchRequest;
use crate::plan_apply::run_plan_applier;
use crate::raft::RaftStatus;
use crate::scheduler::{
    CORE_JOB_DEPLOYMENT_GC, CORE_JOB_EVAL_GC, CORE_JOB_JOB_GC, CORE_JOB_NODE_GC,
};
use crate::server::{evals_for_node_jobs, Server};
use crate::structs::{
    now_millis, EvalStatus, Evaluation, NodeStatus, TRIGGER_FAILED_FOLLOWUP, TRIGGER_NODE_UPDATE,
};

/// Cadence of the synthetic core GC evals.
const CORE_GC_INTERVAL: Duration = Duration::from_secs(300);
/// Cadence of blocked-tracker duplicate cancellation.
const DUPLICATE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Priority of core evals; above any user job.
const CORE_JOB_PRIORITY: i32 = 200;

/// Receivers the leader loop consumes; producers only emit while their
/// component is enabled, so these are quiet on followers.
pub struct LeaderChannels {
    pub failed_rx: mpsc::UnboundedReceiver<Evaluation>,
    pub launch_rx: mpsc::UnboundedReceiver<LaunchRequest>,
    pub expired_rx: mpsc::UnboundedReceiver<String>,
}

pub async fn run_leader_loop(
    server: Arc<Server>,
    mut status_rx: watch::Receiver<RaftStatus>,
    mut channels: LeaderChannels,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut was_leader = false;
    let mut gc_timer = tokio::time::interval(CORE_GC_INTERVAL);
    let mut duplicate_timer = tokio::time::interval(DUPLICATE_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            res = status_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let is_leader = status_rx.borrow().is_leader;
                if is_leader && !was_leader {
                    establish_leadership(&server).await;
                } else if !is_leader && was_leader {
                    revoke_leadership(&server);
                }
                was_leader = is_leader;
            }
            Some(eval) = channels.failed_rx.recv() => {
                if was_leader {
                    handle_failed_eval(&server, eval).await;
                }
            }
            Some(launch) = channels.launch_rx.recv() => {
                if was_leader {
                    handle_periodic_launch(&server, launch).await;
                }
            }
            Some(node_id) = channels.expired_rx.recv() => {
                if was_leader {
                    handle_expired_heartbeat(&server, node_id).await;
                }
            }
            _ = gc_timer.tick() => {
                if was_leader {
                    schedule_core_gc(&server);
                }
            }
            _ = duplicate_timer.tick() => {
                if was_leader {
                    cancel_duplicate_blocked(&server).await;
                }
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    if was_leader {
        revoke_leadership(&server);
    }
    info!("leader loop exited");
}

async fn establish_leadership(server: &Arc<Server>) {
    info!("establishing leadership");
    server.broker.set_enabled(true);
    server.blocked.set_enabled(true);
    server.periodic.set_enabled(true);
    server.heartbeats.set_enabled(true);

    // Plan applier: single consumer, leader-only.
    let plan_rx = server.plan_queue.enable();
    tokio::spawn(run_plan_applier(
        server.store.clone(),
        server.raft.clone(),
        plan_rx,
        server.shutdown_rx(),
    ));

    let snapshot = server.store.snapshot();

    // First leadership over a fresh cluster stamps its identity.
    if snapshot.tables().cluster_meta.is_none() {
        let meta = crate::fsm::ClusterMetadataSetRequest {
            meta: crate::structs::ClusterMetadata {
                cluster_id: crate::structs::generate_id(),
                create_millis: now_millis(),
            },
        };
        match serde_json::to_value(&meta) {
            Ok(body) => {
                if let Err(e) = server
                    .apply_command(MessageType::ClusterMetadataSet, body)
                    .await
                {
                    warn!(error = %e, "failed to stamp cluster metadata");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode cluster metadata"),
        }
    }

    // Refill the broker and blocked tracker from persisted evals. Both
    // sinks dedupe, so re-establishment is idempotent.
    let mut restored = 0usize;
    for eval in snapshot.evals() {
        if eval.should_enqueue() {
            server.broker.enqueue((**eval).clone());
            restored += 1;
        } else if eval.should_block() {
            server.blocked.block((**eval).clone());
            restored += 1;
        }
    }

    // Periodic jobs: seed from state and catch up on missed cron ticks.
    server.periodic.restore(&snapshot);
    server.periodic.replay_missed();

    // Every known live node gets the failover TTL to re-find us.
    let ttl = server.config.failover_heartbeat_ttl;
    let mut timers = 0usize;
    for node in snapshot.nodes() {
        if !node.status.is_terminal() {
            server.heartbeats.touch(&node.id, ttl);
            timers += 1;
        }
    }

    info!(
        restored_evals = restored,
        heartbeat_timers = timers,
        "leadership established"
    );
}

fn revoke_leadership(server: &Arc<Server>) {
    info!("revoking leadership");
    server.plan_queue.disable();
    server.broker.set_enabled(false);
    server.blocked.set_enabled(false);
    server.periodic.set_enabled(false);
    server.heartbeats.set_enabled(false);
}

/// An eval exhausted its delivery limit: persist the failure and chain a
/// follow-up eval with a baseline-plus-jitter delay.
async fn handle_failed_eval(server: &Arc<Server>, eval: Evaluation) {
    let mut failed = eval.clone();
    failed.status = EvalStatus::Failed;
    failed.status_description = "maximum attempts reached".to_string();

    let delay_range_ms = server.config.eval_failed_followup_delay_range.as_millis() as i64;
    let jitter = if delay_range_ms > 0 {
        rand::thread_rng().gen_range(0..delay_range_ms)
    } else {
        0
    };
    let mut followup = Evaluation::new(
        &eval.namespace,
        &eval.job_id,
        &eval.eval_type,
        eval.priority,
        TRIGGER_FAILED_FOLLOWUP,
    );
    followup.previous_eval = eval.id.clone();
    followup.wait_until = now_millis()
        + server.config.eval_failed_followup_baseline_delay.as_millis() as i64
        + jitter;

    warn!(
        eval_id = %eval.id,
        followup_id = %followup.id,
        "eval exhausted deliveries, writing failure and follow-up"
    );
    let req = EvalUpdateRequest {
        evals: vec![failed, followup],
    };
    match serde_json::to_value(&req) {
        Ok(body) => {
            if let Err(e) = server.apply_command(MessageType::EvalUpdate, body).await {
                error!(error = %e, "failed to persist eval failure");
            }
        }
        Err(e) => error!(error = %e, "failed to encode eval failure"),
    }
}

/// A periodic tick fired: persist the launch record and the synthetic eval
/// in two commands (the launch record guards replays across failovers).
async fn handle_periodic_launch(server: &Arc<Server>, launch: LaunchRequest) {
    let snapshot = server.store.snapshot();
    let Some(job) = snapshot.job(&launch.namespace, &launch.job_id) else {
        debug!(job_id = %launch.job_id, "periodic launch for a vanished job, skipping");
        return;
    };
    if let Some(periodic) = &job.periodic {
        let overlapping = snapshot
            .evals_by_job(&launch.namespace, &launch.job_id)
            .any(|e| !e.status.is_terminal());
        if periodic.prohibit_overlap && overlapping {
            info!(job_id = %job.id, "skipping periodic launch, previous cycle still active");
            return;
        }
    }

    let launch_body = match serde_json::to_value(PeriodicLaunchUpsertRequest {
        namespace: launch.namespace.clone(),
        job_id: launch.job_id.clone(),
        launch_millis: launch.launch_millis,
    }) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to encode periodic launch");
            return;
        }
    };
    if let Err(e) = server
        .apply_command(MessageType::PeriodicLaunchUpsert, launch_body)
        .await
    {
        error!(error = %e, "failed to persist periodic launch");
        return;
    }

    let eval = Evaluation::new(
        &job.namespace,
        &job.id,
        job.job_type.scheduler(),
        job.priority,
        crate::structs::TRIGGER_PERIODIC,
    );
    let eval_body = match serde_json::to_value(EvalUpdateRequest { evals: vec![eval] }) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to encode periodic eval");
            return;
        }
    };
    if let Err(e) = server.apply_command(MessageType::EvalUpdate, eval_body).await {
        error!(error = %e, "failed to persist periodic eval");
    }
}

/// A node's TTL lapsed: mark it down and reschedule everything it ran.
async fn handle_expired_heartbeat(server: &Arc<Server>, node_id: String) {
    let snapshot = server.store.snapshot();
    if snapshot.node(&node_id).is_none() {
        return;
    }
    let evals = evals_for_node_jobs(&snapshot, &node_id, TRIGGER_NODE_UPDATE);
    info!(node_id = %node_id, evals = evals.len(), "marking node down after missed heartbeats");
    let body = match serde_json::to_value(NodeStatusUpdateRequest {
        node_id: node_id.clone(),
        status: NodeStatus::Down,
        evals,
    }) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to encode node down update");
            return;
        }
    };
    if let Err(e) = server
        .apply_command(MessageType::NodeStatusUpdate, body)
        .await
    {
        error!(error = %e, node_id = %node_id, "failed to mark node down");
    }
}

/// Core GC evals are synthetic leader-local work: they go straight into
/// the broker without touching state.
fn schedule_core_gc(server: &Arc<Server>) {
    for job_id in [
        CORE_JOB_EVAL_GC,
        CORE_JOB_NODE_GC,
        CORE_JOB_JOB_GC,
        CORE_JOB_DEPLOYMENT_GC,
    ] {
        let mut eval = Evaluation::new("-", job_id, "core", CORE_JOB_PRIORITY, "scheduled");
        eval.snapshot_index = server.store.applied_index();
        server.broker.enqueue(eval);
    }
    debug!("core gc evals scheduled");
}

/// Blocked evals displaced by newer ones get cancelled in state.
async fn cancel_duplicate_blocked(server: &Arc<Server>) {
    let duplicates = server.blocked.drain_duplicates();
    if duplicates.is_empty() {
        return;
    }
    let evals: Vec<Evaluation> = duplicates
        .into_iter()
        .map(|mut e| {
            e.status = EvalStatus::Cancelled;
            e.status_description = "cancelled in favor of a newer blocked eval".to_string();
            e
        })
        .collect();
    let count = evals.len();
    match serde_json::to_value(EvalUpdateRequest { evals }) {
        Ok(body) => {
            if let Err(e) = server.apply_command(MessageType::EvalUpdate, body).await {
                error!(error = %e, "failed to cancel duplicate blocked evals");
            } else {
                debug!(count, "cancelled duplicate blocked evals");
            }
        }
        Err(e) => error!(error = %e, "failed to encode duplicate cancellations"),
    }
}
