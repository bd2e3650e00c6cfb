//! Live-socket tests of the RPC fabric: magic-byte routing, framed
//! request/response, the handshake deadline, and node sessions over the
//! multiplexed protocol.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use flotilla::config::ServerConfig;
use flotilla::mux::{
    read_frame, read_mux_frame, write_frame, write_mux_frame, MAGIC_MUX_V2, MAGIC_RPC,
};
use flotilla::rpc::{RpcRequest, RpcResponse};
use flotilla::server::Server;

async fn start_test_server() -> std::sync::Arc<Server> {
    let config = ServerConfig::for_testing();
    Server::start(config).await.expect("server starts")
}

async fn rpc_conn(server: &Server) -> TcpStream {
    let addr = server.rpc_addr().expect("listener bound");
    let mut conn = TcpStream::connect(addr).await.expect("dial");
    conn.write_all(&[MAGIC_RPC]).await.unwrap();
    conn
}

async fn roundtrip(conn: &mut TcpStream, req: &RpcRequest) -> RpcResponse {
    write_frame(conn, &serde_json::to_vec(req).unwrap())
        .await
        .unwrap();
    let raw = read_frame(conn).await.unwrap();
    serde_json::from_slice(&raw).unwrap()
}

#[tokio::test]
async fn ping_roundtrips_over_the_wire() {
    let server = start_test_server().await;
    let mut conn = rpc_conn(&server).await;

    let resp = roundtrip(
        &mut conn,
        &RpcRequest {
            method: "Status.Ping".into(),
            seq: 7,
            ..RpcRequest::default()
        },
    )
    .await;

    assert_eq!(resp.seq, 7);
    assert!(resp.error.is_none());
    assert_eq!(resp.body["ok"], serde_json::json!(true));
    assert!(resp.index >= 1);
    server.shutdown();
}

#[tokio::test]
async fn unknown_method_is_reported() {
    let server = start_test_server().await;
    let mut conn = rpc_conn(&server).await;
    let resp = roundtrip(
        &mut conn,
        &RpcRequest {
            method: "Nope.Nothing".into(),
            ..RpcRequest::default()
        },
    )
    .await;
    let err = resp.error.expect("error expected");
    assert!(err.contains("unknown rpc method"), "{err}");
    server.shutdown();
}

#[tokio::test]
async fn unknown_magic_byte_drops_the_connection() {
    let server = start_test_server().await;
    let addr = server.rpc_addr().unwrap();
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(&[0xEE]).await.unwrap();

    // The server closes; the read returns EOF.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
        .await
        .expect("close within deadline")
        .unwrap_or(0);
    assert_eq!(n, 0);
    server.shutdown();
}

#[tokio::test]
async fn handshake_deadline_closes_silent_connections() {
    // The testing handshake timeout is 500ms; a connection that never
    // sends its magic byte is dropped.
    let server = start_test_server().await;
    let addr = server.rpc_addr().unwrap();
    let mut conn = TcpStream::connect(addr).await.unwrap();

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(3), conn.read(&mut buf)).await;
    match read {
        Ok(Ok(0)) => {}
        other => panic!("expected EOF from handshake deadline, got {:?}", other),
    }
    server.shutdown();
}

#[tokio::test]
async fn multiple_requests_share_one_connection() {
    let server = start_test_server().await;
    let mut conn = rpc_conn(&server).await;
    for seq in 0..5u64 {
        let resp = roundtrip(
            &mut conn,
            &RpcRequest {
                method: "Status.Peers".into(),
                seq,
                ..RpcRequest::default()
            },
        )
        .await;
        assert_eq!(resp.seq, seq);
        assert!(resp.error.is_none());
    }
    server.shutdown();
}

#[tokio::test]
async fn mux_session_registers_node_conn_and_forwards_calls() {
    let server = start_test_server().await;
    let addr = server.rpc_addr().unwrap();

    // A fake worker node: muxV2 session, register, then answer one
    // forwarded call.
    let mut node_conn = TcpStream::connect(addr).await.unwrap();
    node_conn.write_all(&[MAGIC_MUX_V2]).await.unwrap();

    // Substream 2 (node-initiated), first byte selects rpc.
    let register = RpcRequest {
        method: "Node.RegisterSession".into(),
        seq: 1,
        body: serde_json::json!({"node_id": "node-xyz", "secret_id": "s3cret"}),
        ..RpcRequest::default()
    };
    let mut payload = vec![MAGIC_RPC];
    payload.extend_from_slice(&serde_json::to_vec(&register).unwrap());
    write_mux_frame(&mut node_conn, 2, &payload).await.unwrap();

    let (stream_id, raw) = read_mux_frame(&mut node_conn).await.unwrap();
    assert_eq!(stream_id, 2);
    let resp: RpcResponse = serde_json::from_slice(&raw).unwrap();
    assert!(resp.error.is_none(), "{:?}", resp.error);

    // The session is now discoverable.
    let mut probe = rpc_conn(&server).await;
    let has = roundtrip(
        &mut probe,
        &RpcRequest {
            method: "Status.HasNodeConn".into(),
            body: serde_json::json!({"node_id": "node-xyz"}),
            ..RpcRequest::default()
        },
    )
    .await;
    assert_eq!(has.body["has"], serde_json::json!(true));

    // A client-directed call forwards over the session: the server opens
    // an odd substream carrying the request; answer it like a node agent.
    let node_task = tokio::spawn(async move {
        let (stream_id, raw) = read_mux_frame(&mut node_conn).await.unwrap();
        assert_eq!(stream_id % 2, 1, "server-initiated ids are odd");
        let req: RpcRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(req.method, "ClientAlloc.Stats");
        let resp = RpcResponse {
            seq: req.seq,
            error: None,
            index: 1,
            body: serde_json::json!({"cpu": 12}),
        };
        write_mux_frame(&mut node_conn, stream_id, &serde_json::to_vec(&resp).unwrap())
            .await
            .unwrap();
        node_conn
    });

    let stats = roundtrip(
        &mut probe,
        &RpcRequest {
            method: "ClientAlloc.Stats".into(),
            body: serde_json::json!({"node_id": "node-xyz"}),
            ..RpcRequest::default()
        },
    )
    .await;
    assert!(stats.error.is_none(), "{:?}", stats.error);
    assert_eq!(stats.body["cpu"], serde_json::json!(12));

    node_task.await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn client_rpc_without_node_conn_fails_cleanly() {
    let server = start_test_server().await;
    let mut conn = rpc_conn(&server).await;
    let resp = roundtrip(
        &mut conn,
        &RpcRequest {
            method: "ClientAlloc.Stats".into(),
            body: serde_json::json!({"node_id": "ghost"}),
            ..RpcRequest::default()
        },
    )
    .await;
    let err = resp.error.expect("no session exists");
    assert!(err.contains("no server holds a connection"), "{err}");
    server.shutdown();
}
