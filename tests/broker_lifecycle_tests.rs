//! Broker lifecycle scenarios driven through the FSM, the way evals reach
//! the broker in production: as side effects of applied log commands.

use std::time::Duration;

use flotilla::broker::SCHEDULER_VERSION;
use flotilla::fsm::{EvalUpdateRequest, JobRegisterRequest, MessageType};
use flotilla::structs::{
    EvalStatus, Evaluation, DEFAULT_NAMESPACE, TRIGGER_FAILED_FOLLOWUP, TRIGGER_JOB_REGISTER,
};
use flotilla::test_util::{test_job, LocalHarness};

fn eval_with(id: &str, job: &str) -> Evaluation {
    let mut e = Evaluation::new(DEFAULT_NAMESPACE, job, "service", 50, TRIGGER_JOB_REGISTER);
    e.id = id.to_string();
    e
}

#[tokio::test]
async fn single_node_broker_lifecycle() {
    // Enqueue through the FSM, dequeue with a matching scheduler filter,
    // ack, and verify the queues drain.
    let harness = LocalHarness::new();
    harness.become_leader();
    harness.apply(
        MessageType::EvalUpdate,
        &EvalUpdateRequest {
            evals: vec![eval_with("e1", "j1")],
        },
    );

    let broker = harness.broker();
    let (eval, token, wait_index) = broker
        .dequeue(
            &["service".into()],
            SCHEDULER_VERSION,
            Duration::from_millis(200),
        )
        .await
        .unwrap()
        .expect("eval delivered");
    assert_eq!(eval.id, "e1");
    assert!(!token.is_empty());
    // The wait index is the modify index the FSM stamped at enqueue.
    assert_eq!(wait_index, eval.modify_index);

    broker.ack("e1", &token).unwrap();
    let stats = broker.stats();
    assert_eq!(stats.total_ready, 0);
    assert_eq!(stats.total_unacked, 0);
}

#[tokio::test]
async fn delivery_limit_produces_followup_in_state() {
    // Nack an eval to its delivery limit; the broker emits it on the
    // failed channel and the leader writes the failure plus a follow-up
    // eval. Verify the state-side outcome end to end.
    let harness = LocalHarness::new();
    harness.become_leader();
    harness.apply(
        MessageType::EvalUpdate,
        &EvalUpdateRequest {
            evals: vec![eval_with("e1", "j1")],
        },
    );

    let broker = harness.broker();
    for _ in 0..3 {
        let (_, token, _) = broker
            .dequeue(
                &["service".into()],
                SCHEDULER_VERSION,
                Duration::from_millis(500),
            )
            .await
            .unwrap()
            .expect("redelivery within limit");
        broker.nack("e1", &token).unwrap();
    }

    // Past the limit nothing is redelivered.
    let out = broker
        .dequeue(
            &["service".into()],
            SCHEDULER_VERSION,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    assert!(out.is_none());

    // The leader turns the failed emission into a failed status plus a
    // delayed follow-up eval; apply the same write it would.
    let failed = harness.take_failed_eval().expect("failed eval emitted");
    assert_eq!(failed.id, "e1");
    let mut failed_update = failed.clone();
    failed_update.status = EvalStatus::Failed;
    let mut followup = Evaluation::new(
        &failed.namespace,
        &failed.job_id,
        &failed.eval_type,
        failed.priority,
        TRIGGER_FAILED_FOLLOWUP,
    );
    followup.previous_eval = failed.id.clone();
    let followup_id = followup.id.clone();
    harness.apply(
        MessageType::EvalUpdate,
        &EvalUpdateRequest {
            evals: vec![failed_update, followup],
        },
    );

    let snap = harness.fsm().store().snapshot();
    assert_eq!(snap.eval("e1").unwrap().status, EvalStatus::Failed);
    let chained = snap.eval(&followup_id).unwrap();
    assert_eq!(chained.previous_eval, "e1");
    assert_eq!(chained.triggered_by, TRIGGER_FAILED_FOLLOWUP);
}

#[tokio::test]
async fn serial_jobs_deliver_in_create_index_order() {
    let harness = LocalHarness::new();
    harness.become_leader();
    // Two evals for the same job, committed in order.
    harness.apply(
        MessageType::EvalUpdate,
        &EvalUpdateRequest {
            evals: vec![eval_with("e1", "j")],
        },
    );
    harness.apply(
        MessageType::EvalUpdate,
        &EvalUpdateRequest {
            evals: vec![eval_with("e2", "j")],
        },
    );

    let broker = harness.broker();
    let (first, token1, wait1) = broker
        .dequeue(
            &["service".into()],
            SCHEDULER_VERSION,
            Duration::from_millis(200),
        )
        .await
        .unwrap()
        .expect("older eval first");
    assert_eq!(first.id, "e1");

    // The newer eval is withheld while the older is unacked.
    let held = broker
        .dequeue(
            &["service".into()],
            SCHEDULER_VERSION,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert!(held.is_none());

    broker.ack("e1", &token1).unwrap();
    let (second, _, wait2) = broker
        .dequeue(
            &["service".into()],
            SCHEDULER_VERSION,
            Duration::from_millis(200),
        )
        .await
        .unwrap()
        .expect("released after ack");
    assert_eq!(second.id, "e2");
    assert!(wait2 > wait1, "the newer eval carries the newer wait index");
}

#[tokio::test]
async fn reapplying_a_register_does_not_duplicate_broker_work() {
    // Raft can re-apply after restart; the broker must dedupe by eval id.
    let harness = LocalHarness::new();
    harness.become_leader();

    let job = test_job("web");
    let eval = Evaluation::new(DEFAULT_NAMESPACE, "web", "service", 50, TRIGGER_JOB_REGISTER);
    let req = JobRegisterRequest {
        job,
        eval: Some(eval),
    };
    harness.apply(MessageType::JobRegister, &req);
    harness.apply(MessageType::JobRegister, &req);

    assert_eq!(harness.broker().stats().total_ready, 1);
}
