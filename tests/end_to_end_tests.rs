//! Full scheduling cycles over the in-process control plane: FSM side
//! effects feed the broker, a real worker dequeues and runs the scheduler,
//! plans validate and commit, and the blocked tracker reschedules when
//! capacity appears.

use std::time::Duration;

use flotilla::fsm::{MessageType, NodeStatusUpdateRequest};
use flotilla::structs::{
    AllocDesiredStatus, EvalStatus, NodeStatus, Resources, DEFAULT_NAMESPACE,
};
use flotilla::test_util::{test_job, test_node, LocalHarness};
use flotilla::worker::spawn_worker;

#[tokio::test]
async fn job_registration_places_allocations() {
    let harness = LocalHarness::new();
    harness.become_leader();
    harness.register_node(test_node());

    let mut job = test_job("web");
    job.task_groups[0].count = 3;
    harness.register_job(job, true);

    let handle = spawn_worker(0, harness.clone());
    harness
        .wait_until(
            || {
                let snap = harness.snapshot();
                let placed = snap
                    .allocs_by_job(DEFAULT_NAMESPACE, "web")
                    .filter(|a| a.desired_status == AllocDesiredStatus::Run)
                    .count();
                placed == 3 && snap.evals().all(|e| e.status == EvalStatus::Complete)
            },
            Duration::from_secs(5),
        )
        .await;

    // Committed allocations reference the one schedulable node and carry
    // contiguous alloc indexes.
    let snap = harness.snapshot();
    let mut indexes: Vec<u64> = snap
        .allocs_by_job(DEFAULT_NAMESPACE, "web")
        .map(|a| a.alloc_index)
        .collect();
    indexes.sort();
    assert_eq!(indexes, vec![0, 1, 2]);

    handle.stop();
    handle.join().await;
}

#[tokio::test]
async fn insufficient_capacity_blocks_then_unblocks() {
    let harness = LocalHarness::new();
    harness.become_leader();

    // A node too small for even one instance.
    let mut small = test_node();
    small.resources = Resources {
        cpu_mhz: 50,
        memory_mb: 64,
        disk_mb: 50,
    };
    small.compute_class();
    harness.register_node(small);

    let job = test_job("web");
    harness.register_job(job, true);

    let handle = spawn_worker(0, harness.clone());

    // The scheduler runs, places nothing, and parks a blocked eval.
    harness
        .wait_until(
            || harness.blocked().stats().total_blocked == 1,
            Duration::from_secs(5),
        )
        .await;
    assert_eq!(harness.snapshot().allocs().count(), 0);

    // A capable node arriving unblocks the eval and the placement lands.
    harness.register_node(test_node());
    harness
        .wait_until(
            || {
                harness
                    .snapshot()
                    .allocs_by_job(DEFAULT_NAMESPACE, "web")
                    .count()
                    == 1
            },
            Duration::from_secs(5),
        )
        .await;
    // A successful cycle untracks the job.
    harness
        .wait_until(
            || harness.blocked().stats().total_blocked == 0,
            Duration::from_secs(5),
        )
        .await;

    handle.stop();
    handle.join().await;
}

#[tokio::test]
async fn node_down_triggers_replacement() {
    let harness = LocalHarness::new();
    harness.become_leader();
    let node_a = test_node();
    let node_a_id = node_a.id.clone();
    harness.register_node(node_a);
    harness.register_job(test_job("web"), true);

    let handle = spawn_worker(0, harness.clone());
    harness
        .wait_until(
            || harness.snapshot().allocs_by_job(DEFAULT_NAMESPACE, "web").count() == 1,
            Duration::from_secs(5),
        )
        .await;

    // A second node, then the first goes down with a node-update eval,
    // exactly what the heartbeat expiry path commits.
    let node_b = test_node();
    let node_b_id = node_b.id.clone();
    harness.register_node(node_b);

    let snapshot = harness.snapshot();
    let evals = flotilla::server::evals_for_node_jobs(
        &snapshot,
        &node_a_id,
        flotilla::structs::TRIGGER_NODE_UPDATE,
    );
    assert_eq!(evals.len(), 1);
    harness.apply(
        MessageType::NodeStatusUpdate,
        &NodeStatusUpdateRequest {
            node_id: node_a_id.clone(),
            status: NodeStatus::Down,
            evals,
        },
    );

    // The replacement lands on the surviving node.
    harness
        .wait_until(
            || {
                harness
                    .snapshot()
                    .allocs_by_job(DEFAULT_NAMESPACE, "web")
                    .filter(|a| {
                        a.node_id == node_b_id && a.desired_status == AllocDesiredStatus::Run
                    })
                    .count()
                    == 1
            },
            Duration::from_secs(5),
        )
        .await;

    handle.stop();
    handle.join().await;
}

#[tokio::test]
async fn job_deregistration_stops_allocations() {
    let harness = LocalHarness::new();
    harness.become_leader();
    harness.register_node(test_node());
    harness.register_job(test_job("web"), true);

    let handle = spawn_worker(0, harness.clone());
    harness
        .wait_until(
            || harness.snapshot().allocs_by_job(DEFAULT_NAMESPACE, "web").count() == 1,
            Duration::from_secs(5),
        )
        .await;

    harness.deregister_job(DEFAULT_NAMESPACE, "web", false);
    harness
        .wait_until(
            || {
                harness
                    .snapshot()
                    .allocs_by_job(DEFAULT_NAMESPACE, "web")
                    .all(|a| a.desired_status == AllocDesiredStatus::Stop)
            },
            Duration::from_secs(5),
        )
        .await;

    let job = harness.snapshot().job(DEFAULT_NAMESPACE, "web").unwrap();
    assert!(job.stop);

    handle.stop();
    handle.join().await;
}
