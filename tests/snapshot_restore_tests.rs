//! Snapshot determinism and restore equivalence over long, generated
//! command logs.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flotilla::fsm::{
    EvalUpdateRequest, JobRegisterRequest, LogCommand, MessageType, NodeRegisterRequest,
    NodeStatusUpdateRequest, VarOp, VariableApplyRequest,
};
use flotilla::state_store::Table;
use flotilla::structs::*;
use flotilla::test_util::test_fsm;

/// A canonical, fully deterministic command log: same seed, same bytes.
fn canonical_log(len: usize, seed: u64) -> Vec<LogCommand> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut commands = Vec::with_capacity(len);
    let mut node_ids: Vec<String> = Vec::new();

    for i in 0..len {
        let ts = 1_700_000_000_000 + i as i64 * 1_000;
        let cmd = match rng.gen_range(0..5u8) {
            0 => {
                let node_id = format!("node-{i}");
                node_ids.push(node_id.clone());
                let node = Node {
                    id: node_id,
                    datacenter: format!("dc{}", rng.gen_range(1..3u8)),
                    node_class: "compute".into(),
                    attributes: HashMap::from([(
                        "kernel".to_string(),
                        "linux".to_string(),
                    )]),
                    resources: Resources {
                        cpu_mhz: 4000,
                        memory_mb: 8192,
                        disk_mb: 100_000,
                    },
                    status: NodeStatus::Ready,
                    scheduling_eligibility: SchedulingEligibility::Eligible,
                    drain_strategy: None,
                    secret_id: format!("secret-{i}"),
                    computed_class: 0,
                    status_updated_at: 0,
                    create_index: 0,
                    modify_index: 0,
                };
                LogCommand::encode(MessageType::NodeRegister, &NodeRegisterRequest { node }, ts)
            }
            1 if !node_ids.is_empty() => {
                let node_id = node_ids[rng.gen_range(0..node_ids.len())].clone();
                let status = if rng.gen_bool(0.5) {
                    NodeStatus::Ready
                } else {
                    NodeStatus::Down
                };
                LogCommand::encode(
                    MessageType::NodeStatusUpdate,
                    &NodeStatusUpdateRequest {
                        node_id,
                        status,
                        evals: vec![],
                    },
                    ts,
                )
            }
            2 => {
                let mut job = Job {
                    id: format!("job-{}", rng.gen_range(0..40u32)),
                    namespace: DEFAULT_NAMESPACE.into(),
                    job_type: JobType::Service,
                    priority: rng.gen_range(1..=100),
                    version: 0,
                    task_groups: vec![TaskGroup {
                        name: "app".into(),
                        count: rng.gen_range(1..5u32),
                        resources: Resources {
                            cpu_mhz: 100,
                            memory_mb: 128,
                            disk_mb: 50,
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
                };
                job.task_groups[0].name = "app".into();
                LogCommand::encode(
                    MessageType::JobRegister,
                    &JobRegisterRequest { job, eval: None },
                    ts,
                )
            }
            3 => {
                let mut eval = Evaluation::new(
                    DEFAULT_NAMESPACE,
                    &format!("job-{}", rng.gen_range(0..40u32)),
                    "service",
                    rng.gen_range(1..=100),
                    TRIGGER_JOB_REGISTER,
                );
                eval.id = format!("eval-{i}");
                LogCommand::encode(
                    MessageType::EvalUpdate,
                    &EvalUpdateRequest { evals: vec![eval] },
                    ts,
                )
            }
            _ => {
                let var = Variable {
                    namespace: DEFAULT_NAMESPACE.into(),
                    path: format!("config/app-{}", rng.gen_range(0..20u32)),
                    items: HashMap::from([(
                        "rev".to_string(),
                        format!("{}", rng.gen_range(0..1000u32)),
                    )]),
                    lock_holder: None,
                    create_index: 0,
                    modify_index: 0,
                };
                LogCommand::encode(
                    MessageType::VariableApply,
                    &VariableApplyRequest {
                        op: VarOp::Set,
                        var,
                        cas_index: 0,
                        lock_id: String::new(),
                    },
                    ts,
                )
            }
        };
        commands.push(cmd);
    }
    commands
}

#[test]
fn identical_logs_yield_byte_identical_snapshots() {
    // Determinism: two fresh FSMs fed the same 1000-entry prefix must
    // serialize to the same bytes.
    let log = canonical_log(1000, 42);

    let (fsm_a, _sinks_a) = test_fsm();
    let (fsm_b, _sinks_b) = test_fsm();
    for (i, cmd) in log.iter().enumerate() {
        let index = (i + 1) as u64;
        assert_eq!(
            fsm_a.apply(index, cmd).error,
            fsm_b.apply(index, cmd).error,
            "apply outcomes diverged at {index}"
        );
    }

    let bytes_a = fsm_a.persist(fsm_a.store().snapshot().tables());
    let bytes_b = fsm_b.persist(fsm_b.store().snapshot().tables());
    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn restore_reproduces_rows_and_indexes() {
    // Persist A, restore into a fresh B, compare table by table.
    let log = canonical_log(1000, 7);
    let (fsm_a, _sinks_a) = test_fsm();
    for (i, cmd) in log.iter().enumerate() {
        fsm_a.apply((i + 1) as u64, cmd);
    }
    let snap_a = fsm_a.store().snapshot();
    let bytes = fsm_a.persist(snap_a.tables());

    let (fsm_b, _sinks_b) = test_fsm();
    fsm_b.restore(&bytes).unwrap();
    let snap_b = fsm_b.store().snapshot();

    for table in Table::ALL {
        assert_eq!(
            snap_a.table_index(table),
            snap_b.table_index(table),
            "index mismatch on {:?}",
            table
        );
    }
    assert_eq!(snap_a.nodes().count(), snap_b.nodes().count());
    assert_eq!(snap_a.jobs().count(), snap_b.jobs().count());
    assert_eq!(snap_a.evals().count(), snap_b.evals().count());
    for node in snap_a.nodes() {
        assert_eq!(Some(node), snap_b.node(&node.id).as_ref(), "node row differs");
    }

    // And the restored store re-serializes identically.
    assert_eq!(bytes, fsm_b.persist(snap_b.tables()));
}

#[test]
fn index_invariant_over_generated_history() {
    // ∀ table: index(t) >= max(modify_index) of its rows.
    let log = canonical_log(500, 99);
    let (fsm, _sinks) = test_fsm();
    for (i, cmd) in log.iter().enumerate() {
        fsm.apply((i + 1) as u64, cmd);
    }
    let snap = fsm.store().snapshot();

    let max_node = snap.nodes().map(|n| n.modify_index).max().unwrap_or(0);
    assert!(snap.table_index(Table::Nodes) >= max_node);
    let max_job = snap.jobs().map(|j| j.modify_index).max().unwrap_or(0);
    assert!(snap.table_index(Table::Jobs) >= max_job);
    let max_eval = snap.evals().map(|e| e.modify_index).max().unwrap_or(0);
    assert!(snap.table_index(Table::Evals) >= max_eval);

    // And every row respects create <= modify.
    for eval in snap.evals() {
        assert!(eval.create_index <= eval.modify_index);
    }
    for job in snap.jobs() {
        assert!(job.create_index <= job.modify_index);
    }
}

#[test]
fn reapplied_entry_is_idempotent() {
    // Applying the same entry twice changes nothing observable except the
    // modify index of the written rows, and queues no duplicate work.
    let (fsm, sinks) = test_fsm();
    let eval = {
        let mut e = Evaluation::new(DEFAULT_NAMESPACE, "web", "service", 50, TRIGGER_JOB_REGISTER);
        e.id = "stable-eval".into();
        e
    };
    let cmd = LogCommand::encode(
        MessageType::EvalUpdate,
        &EvalUpdateRequest { evals: vec![eval] },
        1_000,
    );

    fsm.apply(5, &cmd);
    let first = fsm.store().snapshot().eval("stable-eval").unwrap();
    fsm.apply(6, &cmd);
    let second = fsm.store().snapshot().eval("stable-eval").unwrap();

    assert_eq!(first.create_index, second.create_index);
    assert_eq!(second.modify_index, 6);
    let mut normalized = (*second).clone();
    normalized.modify_index = first.modify_index;
    assert_eq!(*first, normalized, "only the index bump may differ");

    // The broker saw the eval exactly once.
    assert_eq!(sinks.broker.stats().total_ready, 1);
}
