//! Node heartbeat TTL tracking, leader-side.
//!
//! Every ready node holds exactly one live timer. A heartbeat (or any
//! status-advancing RPC) resets it to the fleet-scaled TTL; expiry emits
//! the node id on the expired channel and the leader loop marks the node
//! down through Raft and synthesizes evals for its jobs. On leadership
//! establishment every known node is granted the failover TTL, which gives
//! clients one window to find the new leader before being declared down.
//!
//! Timers are generation-counted: resetting a timer invalidates the
//! previously spawned sleep instead of racing it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::metrics;

#[derive(Default)]
struct TimerState {
    enabled: bool,
    /// node id -> current generation; a sleep only fires if its generation
    /// is still current when it wakes.
    generations: HashMap<String, u64>,
    next_generation: u64,
}

pub struct HeartbeatManager {
    weak: std::sync::Weak<HeartbeatManager>,
    inner: Mutex<TimerState>,
    expired_tx: mpsc::UnboundedSender<String>,
    grace: Duration,
}

impl HeartbeatManager {
    /// Returns the manager and the channel of node ids whose TTL lapsed.
    pub fn new(grace: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        (
            Arc::new_cyclic(|weak| Self {
                weak: weak.clone(),
                inner: Mutex::new(TimerState::default()),
                expired_tx,
                grace,
            }),
            expired_rx,
        )
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;
        if !enabled {
            // Bumping past every handed-out generation invalidates all
            // outstanding sleeps.
            inner.generations.clear();
            metrics::HEARTBEAT_TIMERS.set(0);
            info!("heartbeat tracking disabled");
        }
    }

    /// (Re)arm the timer for `node_id` with `ttl` + grace. The previous
    /// timer, if any, is invalidated; a node never has two live timers.
    pub fn touch(&self, node_id: &str, ttl: Duration) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.enabled {
                return;
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.generations.insert(node_id.to_string(), generation);
            metrics::HEARTBEAT_TIMERS.set(inner.generations.len() as i64);
            generation
        };

        let manager = self.weak.upgrade().expect("manager alive while borrowed");
        let node_id = node_id.to_string();
        let deadline = ttl + self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let expired = {
                let mut inner = manager.inner.lock().unwrap();
                if inner.enabled && inner.generations.get(&node_id) == Some(&generation) {
                    inner.generations.remove(&node_id);
                    metrics::HEARTBEAT_TIMERS.set(inner.generations.len() as i64);
                    true
                } else {
                    false
                }
            };
            if expired {
                warn!(node_id = %node_id, "heartbeat ttl expired");
                metrics::NODES_MARKED_DOWN.inc();
                let _ = manager.expired_tx.send(node_id);
            }
        });
    }

    /// Drop a node's timer (deregistration, terminal status).
    pub fn remove(&self, node_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.generations.remove(node_id).is_some() {
            metrics::HEARTBEAT_TIMERS.set(inner.generations.len() as i64);
        }
    }

    pub fn timer_count(&self) -> usize {
        self.inner.lock().unwrap().generations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(grace_ms: u64) -> (Arc<HeartbeatManager>, mpsc::UnboundedReceiver<String>) {
        let (m, rx) = HeartbeatManager::new(Duration::from_millis(grace_ms));
        m.set_enabled(true);
        (m, rx)
    }

    #[tokio::test]
    async fn expiry_emits_node_id() {
        let (m, mut rx) = manager(0);
        m.touch("node-1", Duration::from_millis(20));
        let expired = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired, "node-1");
        assert_eq!(m.timer_count(), 0);
    }

    #[tokio::test]
    async fn touch_resets_the_timer() {
        let (m, mut rx) = manager(0);
        m.touch("node-1", Duration::from_millis(60));
        // Keep touching faster than the TTL; no expiry may fire.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            m.touch("node-1", Duration::from_millis(60));
        }
        assert!(rx.try_recv().is_err());
        // One live timer despite six touches.
        assert_eq!(m.timer_count(), 1);
    }

    #[tokio::test]
    async fn remove_cancels_expiry() {
        let (m, mut rx) = manager(0);
        m.touch("node-1", Duration::from_millis(30));
        m.remove("node-1");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disable_cancels_everything() {
        let (m, mut rx) = manager(0);
        m.touch("node-1", Duration::from_millis(30));
        m.touch("node-2", Duration::from_millis(30));
        m.set_enabled(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(m.timer_count(), 0);
    }

    #[tokio::test]
    async fn disabled_manager_ignores_touch() {
        let (m, _rx) = HeartbeatManager::new(Duration::ZERO);
        m.touch("node-1", Duration::from_millis(10));
        assert_eq!(m.timer_count(), 0);
    }
}
