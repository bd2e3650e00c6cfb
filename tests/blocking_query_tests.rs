//! Blocking-query semantics against the live state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flotilla::fsm::{LogCommand, MessageType, VarOp, VariableApplyRequest};
use flotilla::rpc::{blocking_query, RpcRequest};
use flotilla::state_store::Table;
use flotilla::structs::{Variable, DEFAULT_NAMESPACE};
use flotilla::test_util::test_fsm;

fn set_var_cmd(path: &str, rev: &str) -> LogCommand {
    LogCommand::encode(
        MessageType::VariableApply,
        &VariableApplyRequest {
            op: VarOp::Set,
            var: Variable {
                namespace: DEFAULT_NAMESPACE.into(),
                path: path.into(),
                items: HashMap::from([("rev".to_string(), rev.to_string())]),
                lock_holder: None,
                create_index: 0,
                modify_index: 0,
            },
            cas_index: 0,
            lock_id: String::new(),
        },
        1_000,
    )
}

#[tokio::test]
async fn blocking_query_wakes_on_write() {
    // A query parked at min index N returns promptly once a write raises
    // the variables table to N+1.
    let (fsm, _sinks) = test_fsm();
    let fsm = Arc::new(fsm);
    let store = fsm.store().clone();

    let min_index = store.snapshot().table_index(Table::Variables);
    let writer = {
        let fsm = fsm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fsm.apply(min_index + 1, &set_var_cmd("app/config", "r2"));
        })
    };

    let req = RpcRequest {
        method: "Variables.List".into(),
        min_query_index: min_index,
        max_query_time_ms: 5_000,
        ..RpcRequest::default()
    };
    let start = Instant::now();
    let (body, index) = blocking_query(&store, &req, &[Table::Variables], |snapshot| {
        let rows: Vec<Variable> = snapshot
            .variables_by_prefix(DEFAULT_NAMESPACE, "")
            .map(|v| (**v).clone())
            .collect();
        Ok((
            serde_json::to_value(&rows).unwrap(),
            snapshot.table_index(Table::Variables),
        ))
    })
    .await
    .unwrap();

    assert!(
        start.elapsed() < Duration::from_millis(200),
        "query should wake with the write, took {:?}",
        start.elapsed()
    );
    assert_eq!(index, min_index + 1);
    let rows: Vec<Variable> = serde_json::from_value(body).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path, "app/config");
    writer.await.unwrap();
}

#[tokio::test]
async fn blocking_query_times_out_without_write() {
    let (fsm, _sinks) = test_fsm();
    let store = fsm.store().clone();
    let min_index = store.snapshot().table_index(Table::Variables);

    let req = RpcRequest {
        min_query_index: min_index,
        max_query_time_ms: 100,
        ..RpcRequest::default()
    };
    let start = Instant::now();
    let (_, index) = blocking_query(&store, &req, &[Table::Variables], |snapshot| {
        Ok((
            serde_json::Value::Null,
            snapshot.table_index(Table::Variables),
        ))
    })
    .await
    .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(index, min_index, "no write, same index returned");
}

#[tokio::test]
async fn nonblocking_query_returns_immediately() {
    let (fsm, _sinks) = test_fsm();
    fsm.apply(2, &set_var_cmd("app/config", "r1"));
    let store = fsm.store().clone();

    let req = RpcRequest::default(); // min_query_index 0: no blocking
    let start = Instant::now();
    let (_, index) = blocking_query(&store, &req, &[Table::Variables], |snapshot| {
        Ok((
            serde_json::Value::Null,
            snapshot.table_index(Table::Variables),
        ))
    })
    .await
    .unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(index, 2);
}

#[tokio::test]
async fn writes_to_other_tables_do_not_satisfy_the_query() {
    // An unrelated table write wakes nothing; the query must keep waiting
    // and ultimately time out at its original index.
    let (fsm, _sinks) = test_fsm();
    let fsm = Arc::new(fsm);
    let store = fsm.store().clone();
    let min_index = store.snapshot().table_index(Table::Variables);

    let writer = {
        let fsm = fsm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // Jobs table, not variables.
            fsm.apply(
                min_index + 1,
                &LogCommand::encode(
                    MessageType::JobRegister,
                    &flotilla::fsm::JobRegisterRequest {
                        job: flotilla::test_util::test_job("web"),
                        eval: None,
                    },
                    1_000,
                ),
            );
        })
    };

    let req = RpcRequest {
        min_query_index: min_index,
        max_query_time_ms: 150,
        ..RpcRequest::default()
    };
    let (_, index) = blocking_query(&store, &req, &[Table::Variables], |snapshot| {
        Ok((
            serde_json::Value::Null,
            snapshot.table_index(Table::Variables),
        ))
    })
    .await
    .unwrap();
    assert_eq!(index, min_index);
    writer.await.unwrap();
}
