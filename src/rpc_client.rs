//! Pooled framed-RPC clients for server-to-server calls.
//!
//! One persistent connection per peer address, dialed lazily and replaced
//! on any transport error. Requests on a connection are serialized; the
//! fabric's cross-server traffic (forwarding, node-connection lookups) is
//! low-rate control traffic, so one in-flight request per peer is enough.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::RpcError;
use crate::mux::{read_frame, write_frame, MAGIC_RPC};
use crate::rpc::{RpcRequest, RpcResponse};

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
/// Floor on the per-call timeout; blocking queries extend it.
const CALL_TIMEOUT_FLOOR: Duration = Duration::from_secs(10);

struct PooledConn {
    stream: tokio::sync::Mutex<TcpStream>,
}

#[derive(Clone, Default)]
pub struct RpcClientPool {
    conns: Arc<Mutex<HashMap<String, Arc<PooledConn>>>>,
}

impl RpcClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn conn_for(&self, addr: &str) -> Result<Arc<PooledConn>, RpcError> {
        if let Some(conn) = self.conns.lock().unwrap().get(addr).cloned() {
            return Ok(conn);
        }
        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Io(format!("dial {addr} timed out")))??;
        stream.write_all(&[MAGIC_RPC]).await?;
        let conn = Arc::new(PooledConn {
            stream: tokio::sync::Mutex::new(stream),
        });
        self.conns
            .lock()
            .unwrap()
            .insert(addr.to_string(), conn.clone());
        debug!(peer = %addr, "connected to peer server");
        Ok(conn)
    }

    fn evict(&self, addr: &str) {
        self.conns.lock().unwrap().remove(addr);
    }

    /// One request/response roundtrip against `addr`. Transport errors
    /// evict the pooled connection so the next call redials.
    pub async fn call(&self, addr: &str, req: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let conn = self.conn_for(addr).await?;
        let payload =
            serde_json::to_vec(req).map_err(|e| RpcError::Validation(e.to_string()))?;

        // Blocking queries legitimately hold the line open; give them
        // their query time plus slack.
        let timeout = CALL_TIMEOUT_FLOOR
            .max(Duration::from_millis(req.max_query_time_ms) + Duration::from_secs(2));

        let result = tokio::time::timeout(timeout, async {
            let mut stream = conn.stream.lock().await;
            write_frame(&mut *stream, &payload).await?;
            read_frame(&mut *stream).await
        })
        .await;

        let raw = match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.evict(addr);
                return Err(RpcError::Io(e.to_string()));
            }
            Err(_) => {
                self.evict(addr);
                return Err(RpcError::Io(format!("rpc to {addr} timed out")));
            }
        };
        serde_json::from_slice(&raw).map_err(|e| RpcError::Io(format!("bad response frame: {e}")))
    }

    pub fn connected_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_empty() {
        let pool = RpcClientPool::new();
        assert_eq!(pool.connected_count(), 0);
    }

    #[test]
    fn pool_clone_shares_state() {
        let pool1 = RpcClientPool::new();
        let pool2 = pool1.clone();
        assert_eq!(pool1.connected_count(), pool2.connected_count());
    }

    #[tokio::test]
    async fn dial_failure_is_io_error() {
        let pool = RpcClientPool::new();
        let req = RpcRequest {
            method: "Status.Ping".into(),
            ..RpcRequest::default()
        };
        // Reserved port nobody listens on.
        let err = pool.call("127.0.0.1:1", &req).await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
        assert_eq!(pool.connected_count(), 0);
    }
}
