//! Server assembly: constructs the subsystems, wires their channels, and
//! carries the shared maps (peers by region, live node connections).
//!
//! Subsystems never hold a pointer to the whole server; each is built with
//! the minimal capability interface it needs ([`crate::worker::WorkerContext`],
//! [`crate::plan_apply::RaftProposer`], [`crate::metrics::HealthSource`]),
//! all of which `Server` implements. Tests substitute fakes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::blocked::BlockedEvals;
use crate::broker::EvalBroker;
use crate::config::ServerConfig;
use crate::errors::RpcError;
use crate::fsm::{AppliedResponse, Fsm, LogCommand, MessageType, SideEffects};
use crate::heartbeat::HeartbeatManager;
use crate::leader::{run_leader_loop, LeaderChannels};
use crate::metrics::HealthSource;
use crate::periodic::{PeriodicDispatcher, SystemClock};
use crate::plan_apply::PlanQueue;
use crate::raft::{start_raft_node, RaftNode, RaftStatus, SnapshotStore};
use crate::rpc::NodeSession;
use crate::rpc_client::RpcClientPool;
use crate::state_store::{StateSnapshot, StateStore};
use crate::structs::{Evaluation, Plan, PlanResult};
use crate::worker::{spawn_worker, WorkerContext, WorkerHandle};

/// One remembered server in some region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerServer {
    pub addr: String,
    pub region: String,
    /// Build version advertised by membership; used by version gates.
    pub version: String,
}

/// Region-keyed peer set behind an RW lock. Never leaks the container.
#[derive(Default)]
pub struct PeerMap {
    inner: RwLock<HashMap<String, Vec<PeerServer>>>,
}

impl PeerMap {
    pub fn set_peers(&self, region: &str, peers: Vec<PeerServer>) {
        self.inner
            .write()
            .unwrap()
            .insert(region.to_string(), peers);
    }

    pub fn servers(&self, region: &str) -> Vec<PeerServer> {
        self.inner
            .read()
            .unwrap()
            .get(region)
            .cloned()
            .unwrap_or_default()
    }

    /// A random server for the region, for cross-region forwarding.
    pub fn random_server(&self, region: &str) -> Option<PeerServer> {
        use rand::seq::SliceRandom;
        let guard = self.inner.read().unwrap();
        guard.get(region)?.choose(&mut rand::thread_rng()).cloned()
    }

    /// Every known server meets `min_version`. Versions are dotted triples;
    /// anything unparseable fails the gate.
    pub fn all_meet_minimum_version(&self, min_version: &str) -> bool {
        let Some(min) = parse_version(min_version) else {
            return false;
        };
        let guard = self.inner.read().unwrap();
        guard
            .values()
            .flatten()
            .all(|p| parse_version(&p.version).map(|v| v >= min).unwrap_or(false))
    }
}

fn parse_version(v: &str) -> Option<(u64, u64, u64)> {
    let mut parts = v.trim_start_matches('v').splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts
        .next()
        .map(|p| {
            p.split(|c: char| !c.is_ascii_digit())
                .next()
                .unwrap_or("0")
                .parse()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    Some((major, minor, patch))
}

/// Live sessions to worker nodes behind an RW lock.
#[derive(Default)]
pub struct NodeConnMap {
    inner: RwLock<HashMap<String, Arc<NodeSession>>>,
}

impl NodeConnMap {
    pub fn insert(&self, node_id: &str, session: Arc<NodeSession>) {
        self.inner
            .write()
            .unwrap()
            .insert(node_id.to_string(), session);
    }

    pub fn remove(&self, node_id: &str) {
        self.inner.write().unwrap().remove(node_id);
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<NodeSession>> {
        self.inner.read().unwrap().get(node_id).cloned()
    }

    pub fn has(&self, node_id: &str) -> bool {
        self.inner.read().unwrap().contains_key(node_id)
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct Server {
    pub config: ServerConfig,
    pub store: Arc<StateStore>,
    pub fsm: Arc<Fsm>,
    pub raft: Arc<RaftNode>,
    pub broker: Arc<EvalBroker>,
    pub blocked: Arc<BlockedEvals>,
    pub periodic: Arc<PeriodicDispatcher>,
    pub heartbeats: Arc<HeartbeatManager>,
    pub plan_queue: PlanQueue,
    pub peers: PeerMap,
    pub node_conns: NodeConnMap,
    pub rpc_clients: RpcClientPool,
    raft_status: watch::Receiver<RaftStatus>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<WorkerHandle>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Build and start a server: raft, RPC listener, scheduler workers,
    /// the leader loop, and the health endpoint.
    pub async fn start(config: ServerConfig) -> std::io::Result<Arc<Server>> {
        let store = Arc::new(StateStore::new());
        let (broker, failed_rx) = EvalBroker::new(&config);
        let blocked = BlockedEvals::new(broker.clone());
        let (periodic, launch_rx) = PeriodicDispatcher::new(Arc::new(SystemClock));
        let (heartbeats, expired_rx) = HeartbeatManager::new(config.heartbeat_grace);

        let fsm = Arc::new(Fsm::new(
            store.clone(),
            SideEffects {
                broker: broker.clone(),
                blocked: blocked.clone(),
                periodic: periodic.clone(),
            },
        ));

        let snapshots = match SnapshotStore::new(&config.data_dir) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                warn!(error = %e, data_dir = %config.data_dir, "snapshot store unavailable, running memory-only");
                None
            }
        };

        let (raft, raft_status) = start_raft_node(&config, fsm.clone(), snapshots).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(Server {
            store,
            fsm,
            raft,
            broker,
            blocked,
            periodic: periodic.clone(),
            heartbeats,
            plan_queue: PlanQueue::new(),
            peers: PeerMap::default(),
            node_conns: NodeConnMap::default(),
            rpc_clients: RpcClientPool::new(),
            raft_status: raft_status.clone(),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            bound_addr: Mutex::new(None),
            config,
        });

        // The home region's peer set comes from static configuration; a
        // gossip collaborator would keep this map fresh instead.
        let own_region_peers: Vec<PeerServer> = server
            .config
            .peers
            .iter()
            .map(|addr| PeerServer {
                addr: addr.clone(),
                region: server.config.region.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .collect();
        server
            .peers
            .set_peers(&server.config.region.clone(), own_region_peers);

        let bound = crate::rpc::start_listener(server.clone()).await?;
        *server.bound_addr.lock().unwrap() = Some(bound);

        // Scheduler worker pool.
        {
            let mut workers = server.workers.lock().unwrap();
            for id in 0..server.config.num_schedulers {
                workers.push(spawn_worker(id, server.clone()));
            }
        }

        tokio::spawn(periodic.run(shutdown_rx.clone()));
        tokio::spawn(run_leader_loop(
            server.clone(),
            raft_status,
            LeaderChannels {
                failed_rx,
                launch_rx,
                expired_rx,
            },
            shutdown_rx,
        ));

        if let Ok(addr) = server.config.health_addr.parse() {
            let source: Arc<dyn HealthSource> = server.clone();
            tokio::spawn(crate::metrics::start_http_server(addr, source));
        }

        info!(
            node_id = %server.config.node_id,
            region = %server.config.region,
            rpc_addr = %bound,
            schedulers = server.config.num_schedulers,
            "server started"
        );
        Ok(server)
    }

    /// The address the RPC listener actually bound (useful with port 0).
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    pub fn is_leader(&self) -> bool {
        self.raft_status.borrow().is_leader
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.raft_status.borrow().leader_id
    }

    /// The remembered address of the current leader, if any.
    pub fn leader_addr(&self) -> Option<String> {
        let leader_id = self.leader_id()?;
        if leader_id == self.raft.node_id {
            return Some(self.config.advertise_addr.clone());
        }
        self.peers
            .servers(&self.config.region)
            .into_iter()
            .find(|p| crate::raft::node_id_from_str(&p.addr) == leader_id)
            .map(|p| p.addr)
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Root cancellation: every long-lived loop observes this and exits
    /// cleanly. Workers nack in-flight evals on their way out.
    pub fn shutdown(&self) {
        info!("server shutting down");
        let _ = self.shutdown_tx.send(true);
        let workers = self.workers.lock().unwrap();
        for w in workers.iter() {
            w.stop();
        }
        self.broker.set_enabled(false);
        self.blocked.set_enabled(false);
        self.periodic.set_enabled(false);
        self.heartbeats.set_enabled(false);
        self.plan_queue.disable();
    }

    pub fn pause_workers(&self) {
        for w in self.workers.lock().unwrap().iter() {
            w.pause();
        }
    }

    pub fn resume_workers(&self) {
        for w in self.workers.lock().unwrap().iter() {
            w.resume();
        }
    }

    /// (id, worker status, workload status) per scheduler worker, so
    /// operators can tell "paused" from "backing off" from "waiting for
    /// raft".
    pub fn worker_statuses(&self) -> Vec<(usize, String, String)> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| {
                (
                    w.id,
                    format!("{:?}", w.status()),
                    format!("{:?}", w.workload_status()),
                )
            })
            .collect()
    }

    /// Propose one command, leader-side. Followers get `NoLeader` and the
    /// RPC layer forwards instead.
    pub async fn apply_command(
        &self,
        mt: MessageType,
        body: serde_json::Value,
    ) -> Result<AppliedResponse, RpcError> {
        self.raft
            .propose_command(LogCommand::encode(
                mt,
                &body,
                crate::structs::now_millis(),
            ))
            .await
    }
}

#[async_trait]
impl WorkerContext for Server {
    fn broker(&self) -> Arc<EvalBroker> {
        self.broker.clone()
    }

    fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    fn enabled_schedulers(&self) -> Vec<String> {
        self.config.enabled_schedulers.clone()
    }

    async fn wait_for_index(&self, index: u64, timeout: Duration) -> Option<u64> {
        self.store.wait_for_index(index, timeout).await
    }

    async fn raft_apply(
        &self,
        mt: MessageType,
        body: serde_json::Value,
    ) -> Result<AppliedResponse, RpcError> {
        self.apply_command(mt, body).await
    }

    async fn submit_plan(&self, plan: Plan) -> Result<PlanResult, RpcError> {
        self.plan_queue.submit(plan).await
    }

    fn servers_meet_minimum_version(&self, min_version: &str, _include_failed: bool) -> bool {
        self.peers.all_meet_minimum_version(min_version)
            || self.peers.servers(&self.config.region).is_empty()
    }
}

impl HealthSource for Server {
    fn node_id(&self) -> String {
        self.config.node_id.clone()
    }

    fn region(&self) -> String {
        self.config.region.clone()
    }

    fn is_leader(&self) -> bool {
        Server::is_leader(self)
    }

    fn applied_index(&self) -> u64 {
        self.store.applied_index()
    }
}

/// Evals synthesized for every job with live allocations on a node, used
/// when the node goes down or drains.
pub fn evals_for_node_jobs(snapshot: &StateSnapshot, node_id: &str, trigger: &str) -> Vec<Evaluation> {
    let mut jobs: Vec<(String, String)> = snapshot
        .allocs_by_node(node_id)
        .filter(|a| a.is_live())
        .map(|a| (a.namespace.clone(), a.job_id.clone()))
        .collect();
    jobs.sort();
    jobs.dedup();
    jobs.into_iter()
        .filter_map(|(ns, job_id)| {
            let job = snapshot.job(&ns, &job_id)?;
            Some(Evaluation::new(
                &ns,
                &job_id,
                job.job_type.scheduler(),
                job.priority,
                trigger,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("v0.9.7"), Some((0, 9, 7)));
        assert_eq!(parse_version("1.2.3-beta1"), Some((1, 2, 3)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn peer_map_versions_gate() {
        let peers = PeerMap::default();
        peers.set_peers(
            "global",
            vec![
                PeerServer {
                    addr: "10.0.0.1:4647".into(),
                    region: "global".into(),
                    version: "0.2.0".into(),
                },
                PeerServer {
                    addr: "10.0.0.2:4647".into(),
                    region: "global".into(),
                    version: "0.1.0".into(),
                },
            ],
        );
        assert!(peers.all_meet_minimum_version("0.1.0"));
        assert!(!peers.all_meet_minimum_version("0.2.0"));
    }

    #[test]
    fn peer_map_random_server_respects_region() {
        let peers = PeerMap::default();
        peers.set_peers(
            "eu",
            vec![PeerServer {
                addr: "10.1.0.1:4647".into(),
                region: "eu".into(),
                version: "0.1.0".into(),
            }],
        );
        assert!(peers.random_server("eu").is_some());
        assert!(peers.random_server("ap").is_none());
    }
}
