//! Raft consensus wiring.
//!
//! Provides log replication and leader election via the `openraft` crate
//! (version 0.9). Each server runs an embedded Raft group per region; the
//! state machine half delegates every applied command to [`crate::fsm::Fsm`].
//!
//! ## Storage
//!
//! Uses openraft's `Adaptor` to bridge a combined in-memory `RaftStorage`
//! implementation (v1 API) into the v2 `RaftLogStorage` + `RaftStateMachine`
//! split interface required by `Raft::new`. The log lives in memory;
//! snapshots are persisted under the data directory with a retention of the
//! two most recent, and the newest one is restored on startup.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and carried over the crate's framed TCP transport: the
//! connection opens with the `raft` magic byte, then each message is a
//! one-byte kind followed by a length-prefixed payload.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT (return-position impl Trait in Trait) rather than
//! `async_trait::async_trait`. Implementations of these traits must use
//! plain `async fn` to match the expected signatures.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ServerConfig, RAFT_WARN_SIZE, SNAPSHOT_RETENTION};
use crate::errors::RpcError;
use crate::fsm::{AppliedResponse, Fsm, LogCommand, MessageType};
use crate::mux::{read_frame, write_frame, MAGIC_RAFT};
use crate::plan_apply::RaftProposer;
use crate::structs::now_millis;

// ── Type configuration ─────────────────────────────────────────────────────────

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls.
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = LogCommand,
        R            = AppliedResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Message kinds on a raft-magic connection.
const RAFT_MSG_APPEND: u8 = 0;
const RAFT_MSG_VOTE: u8 = 1;
const RAFT_MSG_SNAPSHOT: u8 = 2;

/// Derive a stable u64 server ID from its advertised address.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── Snapshot store ────────────────────────────────────────────────────────────

/// On-disk snapshot files under `<data_dir>/snapshots`, newest-first
/// retention of [`SNAPSHOT_RETENTION`]. File layout: a 4-byte meta length,
/// the JSON meta, then the snapshot body.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &str) -> std::io::Result<Self> {
        let dir = PathBuf::from(data_dir).join("snapshots");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("snap-{index:020}.bin"))
    }

    pub fn save(
        &self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        data: &[u8],
    ) -> std::io::Result<()> {
        let meta_bytes = serde_json::to_vec(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut buf = Vec::with_capacity(4 + meta_bytes.len() + data.len());
        buf.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&meta_bytes);
        buf.extend_from_slice(data);
        let index = meta.last_log_id.map(|l| l.index).unwrap_or(0);
        std::fs::write(self.path_for(index), buf)?;
        self.prune()
    }

    /// Delete all but the newest [`SNAPSHOT_RETENTION`] snapshots.
    fn prune(&self) -> std::io::Result<()> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "bin").unwrap_or(false))
            .collect();
        files.sort();
        while files.len() > SNAPSHOT_RETENTION {
            let victim = files.remove(0);
            std::fs::remove_file(victim)?;
        }
        Ok(())
    }

    pub fn load_latest(
        &self,
    ) -> std::io::Result<Option<(SnapshotMeta<NodeId, BasicNode>, Vec<u8>)>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "bin").unwrap_or(false))
            .collect();
        files.sort();
        let Some(path) = files.pop() else {
            return Ok(None);
        };
        let raw = std::fs::read(path)?;
        if raw.len() < 4 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated snapshot file",
            ));
        }
        let meta_len = u32::from_be_bytes(raw[..4].try_into().unwrap()) as usize;
        if raw.len() < 4 + meta_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated snapshot meta",
            ));
        }
        let meta = serde_json::from_slice(&raw[4..4 + meta_len])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some((meta, raw[4 + meta_len..].to_vec())))
    }
}

// ── Combined storage (openraft v1 RaftStorage) ────────────────────────────────

/// Combined Raft storage: in-memory log plus the replicated state machine.
///
/// Wrapped by `openraft::storage::Adaptor::new(storage)` to produce the v2
/// `(RaftLogStorage, RaftStateMachine)` split required by `Raft::new`.
pub struct ControlStorage {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    fsm: Arc<Fsm>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl ControlStorage {
    pub fn new(fsm: Arc<Fsm>, snapshots: Option<Arc<SnapshotStore>>) -> Self {
        let mut storage = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            fsm,
            snapshots,
        };
        // Resume from the newest on-disk snapshot, if any.
        if let Some(store) = &storage.snapshots {
            match store.load_latest() {
                Ok(Some((meta, data))) => {
                    storage
                        .fsm
                        .restore(&data)
                        .expect("corrupt snapshot on disk");
                    storage.last_applied = meta.last_log_id;
                    storage.last_purged = meta.last_log_id;
                    storage.last_membership = meta.last_membership;
                    info!(
                        last_applied = ?storage.last_applied,
                        "restored state from on-disk snapshot"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    // An unreadable snapshot dir is a fresh start, not a
                    // crash; replication backfills the state.
                    warn!(error = %e, "ignoring unreadable snapshot store");
                }
            }
        }
        storage
    }

    fn build_snapshot_parts(&self) -> (SnapshotMeta<NodeId, BasicNode>, Vec<u8>) {
        let data = self.fsm.persist(self.fsm.store().snapshot().tables());
        let snapshot_id = self
            .last_applied
            .map(|l| format!("{}-{}", l.leader_id.term, l.index))
            .unwrap_or_else(|| "genesis".to_string());
        (
            SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            data,
        )
    }
}

// RaftStorage v1 requires the storage to implement RaftLogReader directly.
// Plain async fn (no #[async_trait]) because openraft traits use RPITIT.
impl RaftLogReader<TypeConfig> for ControlStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct ControlLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for ControlLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder: serializes the current store generation and persists
/// the file before handing it to openraft.
pub struct ControlSnapshotBuilder {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl RaftSnapshotBuilder<TypeConfig> for ControlSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.save(&self.meta, &self.data) {
                error!(error = %e, "failed to persist snapshot file");
            }
        }
        Ok(Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(self.data.clone())),
        })
    }
}

/// openraft v1 `RaftStorage` implementation.
///
/// Method names follow the v1 API:
///   - `append_to_log` (NOT `append`)
///   - `delete_conflict_logs_since` (NOT `truncate`)
///   - `purge_logs_upto` (NOT `purge`)
///   - `apply_to_state_machine` (NOT `apply`)
impl RaftStorage<TypeConfig> for ControlStorage {
    type LogReader = ControlLogReader;
    type SnapshotBuilder = ControlSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last.or(self.last_purged),
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        ControlLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    /// Apply committed entries. FSM apply order equals Raft commit order,
    /// globally: this is the single writer of the state store.
    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<AppliedResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            let log_id = *entry.get_log_id();
            self.last_applied = Some(log_id);
            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(AppliedResponse {
                        index: log_id.index,
                        error: None,
                    });
                }
                openraft::EntryPayload::Normal(cmd) => {
                    responses.push(self.fsm.apply(log_id.index, cmd));
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership = StoredMembership::new(Some(log_id), m.clone());
                    responses.push(AppliedResponse {
                        index: log_id.index,
                        error: None,
                    });
                }
            }
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let (meta, data) = self.build_snapshot_parts();
        ControlSnapshotBuilder {
            meta,
            data,
            snapshots: self.snapshots.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        // A snapshot that fails to decode is fatal: the leader sent bytes
        // the whole cluster agreed on.
        self.fsm
            .restore(snapshot.get_ref())
            .expect("corrupt raft snapshot");
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.save(meta, snapshot.get_ref()) {
                error!(error = %e, "failed to persist installed snapshot");
            }
        }
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        if self.last_applied.is_none() {
            return Ok(None);
        }
        let (meta, data) = self.build_snapshot_parts();
        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

// ── Framed TCP network transport ──────────────────────────────────────────────

/// Per-peer connection implementing openraft's `RaftNetwork`.
///
/// Serializes openraft request types as JSON over the framed transport.
/// The connection is dialed lazily and dropped on any error; the next call
/// redials. Timeouts keep heartbeats failing fast rather than hanging until
/// a follower's election timer fires.
pub struct RaftTransport {
    target_addr: String,
    conn: Option<TcpStream>,
}

const RAFT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const RAFT_CALL_TIMEOUT: Duration = Duration::from_secs(4);

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftTransport {
    async fn call(&mut self, kind: u8, payload: &[u8]) -> Result<Vec<u8>, String> {
        if self.conn.is_none() {
            let stream = tokio::time::timeout(
                RAFT_DIAL_TIMEOUT,
                TcpStream::connect(&self.target_addr),
            )
            .await
            .map_err(|_| format!("dial {} timed out", self.target_addr))?
            .map_err(|e| e.to_string())?;
            let mut stream = stream;
            stream
                .write_all(&[MAGIC_RAFT])
                .await
                .map_err(|e| e.to_string())?;
            self.conn = Some(stream);
        }
        let stream = self.conn.as_mut().expect("connected above");

        let result = tokio::time::timeout(RAFT_CALL_TIMEOUT, async {
            stream.write_all(&[kind]).await?;
            write_frame(stream, payload).await?;
            read_frame(stream).await
        })
        .await;

        match result {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                self.conn = None;
                Err(e.to_string())
            }
            Err(_) => {
                self.conn = None;
                Err(format!("raft call to {} timed out", self.target_addr))
            }
        }
    }
}

impl RaftNetwork<TypeConfig> for RaftTransport {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let resp = self
            .call(RAFT_MSG_APPEND, &payload)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&resp).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let resp = self
            .call(RAFT_MSG_VOTE, &payload)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&resp).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let resp = self
            .call(RAFT_MSG_SNAPSHOT, &payload)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&resp).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `RaftTransport` instances per target peer.
pub struct RaftTransportFactory;

impl RaftNetworkFactory<TypeConfig> for RaftTransportFactory {
    type Network = RaftTransport;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        RaftTransport {
            target_addr: node.addr.clone(),
            conn: None,
        }
    }
}

/// Server half of the raft transport: drains one raft-magic connection,
/// dispatching each framed message to the local Raft instance. Called by
/// the RPC fabric after it consumed the magic byte.
pub async fn handle_raft_connection<S>(mut stream: S, raft: Arc<RaftNode>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut kind = [0u8; 1];
        if stream.read_exact(&mut kind).await.is_err() {
            return;
        }
        let payload = match read_frame(&mut stream).await {
            Ok(p) => p,
            Err(_) => return,
        };
        let response = match kind[0] {
            RAFT_MSG_APPEND => {
                let req: AppendEntriesRequest<TypeConfig> = match serde_json::from_slice(&payload)
                {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "undecodable append-entries frame, dropping conn");
                        return;
                    }
                };
                raft.raft
                    .append_entries(req)
                    .await
                    .map(|r| serde_json::to_vec(&r).unwrap_or_default())
            }
            RAFT_MSG_VOTE => {
                let req: VoteRequest<NodeId> = match serde_json::from_slice(&payload) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "undecodable vote frame, dropping conn");
                        return;
                    }
                };
                raft.raft
                    .vote(req)
                    .await
                    .map(|r| serde_json::to_vec(&r).unwrap_or_default())
            }
            RAFT_MSG_SNAPSHOT => {
                let req: InstallSnapshotRequest<TypeConfig> =
                    match serde_json::from_slice(&payload) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "undecodable snapshot frame, dropping conn");
                            return;
                        }
                    };
                match raft.raft.install_snapshot(req).await {
                    Ok(r) => Ok(serde_json::to_vec(&r).unwrap_or_default()),
                    Err(e) => {
                        warn!(error = %e, "install snapshot failed");
                        return;
                    }
                }
            }
            other => {
                warn!(kind = other, "unknown raft message kind, dropping conn");
                return;
            }
        };
        match response {
            Ok(bytes) => {
                if write_frame(&mut stream, &bytes).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "raft message failed, dropping conn");
                return;
            }
        }
    }
}

// ── RaftNode public API ────────────────────────────────────────────────────────

/// Leadership as observed through openraft's metrics stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub term: u64,
}

/// A running Raft node.
#[derive(Clone)]
pub struct RaftNode {
    pub raft: Arc<RaftInstance>,
    pub node_id: NodeId,
    raft_timeout: Duration,
}

impl RaftNode {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Propose one encoded command and wait for the FSM's response.
    pub async fn propose_command(&self, cmd: LogCommand) -> Result<AppliedResponse, RpcError> {
        if cmd.0.len() > RAFT_WARN_SIZE {
            warn!(
                size = cmd.0.len(),
                "raft proposal exceeds large-entry warning threshold"
            );
        }
        let write = self.raft.client_write(cmd);
        let resp: ClientWriteResponse<TypeConfig> =
            match tokio::time::timeout(self.raft_timeout, write).await {
                Err(_) => return Err(RpcError::RaftTimeout),
                Ok(Err(e)) => {
                    return Err(match &e {
                        RaftError::APIError(openraft::error::ClientWriteError::ForwardToLeader(
                            _,
                        )) => RpcError::NoLeader,
                        other => RpcError::Io(other.to_string()),
                    })
                }
                Ok(Ok(resp)) => resp,
            };
        Ok(resp.data)
    }
}

#[async_trait]
impl RaftProposer for RaftNode {
    async fn propose(
        &self,
        mt: MessageType,
        body: serde_json::Value,
    ) -> Result<AppliedResponse, RpcError> {
        self.propose_command(LogCommand::encode(mt, &body, now_millis()))
            .await
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Initialize and start the Raft node.
///
/// `peers` is `(node_id, advertised_addr)` for every server including this
/// one. Spawns a task watching `Raft::metrics()` that publishes leadership
/// changes on the returned channel; the leader loop consumes it.
pub async fn start_raft_node(
    config: &ServerConfig,
    fsm: Arc<Fsm>,
    snapshots: Option<Arc<SnapshotStore>>,
) -> (Arc<RaftNode>, watch::Receiver<RaftStatus>) {
    let this_node_id = node_id_from_str(&config.advertise_addr);

    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: format!("flotilla-{}", config.region),
            // Generous timeouts so Raft survives CPU pressure from the
            // scheduler workers sharing the same runtime.
            heartbeat_interval: 500,
            election_timeout_min: 5_000,
            election_timeout_max: 10_000,
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    );

    let storage = ControlStorage::new(fsm, snapshots);
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = Arc::new(
        openraft::Raft::new(
            this_node_id,
            raft_config,
            RaftTransportFactory,
            log_store,
            state_machine,
        )
        .await
        .expect("failed to create Raft instance"),
    );

    // Bootstrap: the lowest-id voter initializes once the expected quorum
    // is present in the static peer list.
    let peers: Vec<(NodeId, String)> = if config.peers.is_empty() {
        vec![(this_node_id, config.advertise_addr.clone())]
    } else {
        config
            .peers
            .iter()
            .map(|addr| (node_id_from_str(addr), addr.clone()))
            .collect()
    };
    let quorum_present =
        config.bootstrap_expect == 0 || peers.len() >= config.bootstrap_expect;
    if !config.non_voter && quorum_present {
        let members: BTreeMap<NodeId, BasicNode> = peers
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();
        let min_id = peers.iter().map(|(id, _)| *id).min().unwrap_or(this_node_id);
        if this_node_id == min_id {
            if let Err(e) = raft.initialize(members).await {
                info!(error = %e, "raft already initialized (ignoring on restart)");
            }
        }
    }

    let node = Arc::new(RaftNode {
        raft: raft.clone(),
        node_id: this_node_id,
        raft_timeout: config.raft_timeout,
    });

    let (status_tx, status_rx) = watch::channel(RaftStatus::default());
    {
        let mut rx = raft.metrics();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let m = rx.borrow().clone();
                let status = RaftStatus {
                    is_leader: m.current_leader == Some(this_node_id),
                    leader_id: m.current_leader,
                    term: m.current_term,
                };
                if *status_tx.borrow() != status {
                    info!(
                        is_leader = status.is_leader,
                        leader = ?status.leader_id,
                        term = status.term,
                        "raft status changed"
                    );
                    if status_tx.send(status).is_err() {
                        break;
                    }
                }
            }
        });
    }

    info!(
        node_id = this_node_id,
        peers = peers.len(),
        "raft node started"
    );
    (node, status_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{EvalUpdateRequest, MessageType};
    use crate::structs::{Evaluation, TRIGGER_JOB_REGISTER};
    use crate::test_util::test_fsm;
    use openraft::CommittedLeaderId;

    fn entry(index: u64, cmd: LogCommand) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: openraft::EntryPayload::Normal(cmd),
        }
    }

    #[test]
    fn node_id_is_deterministic() {
        assert_eq!(
            node_id_from_str("10.0.0.1:4647"),
            node_id_from_str("10.0.0.1:4647")
        );
        assert_ne!(
            node_id_from_str("10.0.0.1:4647"),
            node_id_from_str("10.0.0.2:4647")
        );
    }

    #[tokio::test]
    async fn storage_vote_roundtrip() {
        let (fsm, _sinks) = test_fsm();
        let mut s = ControlStorage::new(Arc::new(fsm), None);
        let vote = Vote::new(1, 42);
        s.save_vote(&vote).await.unwrap();
        assert_eq!(s.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn storage_initial_log_state() {
        let (fsm, _sinks) = test_fsm();
        let mut s = ControlStorage::new(Arc::new(fsm), None);
        let state = s.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(state.last_purged_log_id.is_none());
    }

    #[tokio::test]
    async fn apply_delegates_to_fsm() {
        let (fsm, _sinks) = test_fsm();
        let fsm = Arc::new(fsm);
        let mut s = ControlStorage::new(fsm.clone(), None);

        let eval = Evaluation::new("default", "web", "service", 50, TRIGGER_JOB_REGISTER);
        let eval_id = eval.id.clone();
        let cmd = LogCommand::encode(
            MessageType::EvalUpdate,
            &EvalUpdateRequest { evals: vec![eval] },
            1_000,
        );
        let responses = s.apply_to_state_machine(&[entry(7, cmd)]).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].error.is_none());
        assert_eq!(responses[0].index, 7);

        let stored = fsm.store().snapshot().eval(&eval_id).unwrap();
        assert_eq!(stored.create_index, 7);
    }

    #[tokio::test]
    async fn snapshot_build_and_reinstall() {
        let (fsm_a, _sinks_a) = test_fsm();
        let fsm_a = Arc::new(fsm_a);
        let mut a = ControlStorage::new(fsm_a.clone(), None);

        let eval = Evaluation::new("default", "web", "service", 50, TRIGGER_JOB_REGISTER);
        let cmd = LogCommand::encode(
            MessageType::EvalUpdate,
            &EvalUpdateRequest { evals: vec![eval] },
            1_000,
        );
        a.apply_to_state_machine(&[entry(5, cmd)]).await.unwrap();

        let mut builder = a.get_snapshot_builder().await;
        let snap = builder.build_snapshot().await.unwrap();

        let (fsm_b, _sinks_b) = test_fsm();
        let fsm_b = Arc::new(fsm_b);
        let mut b = ControlStorage::new(fsm_b.clone(), None);
        b.install_snapshot(&snap.meta, snap.snapshot).await.unwrap();

        // Table contents and indexes transferred.
        let snap_a = fsm_a.store().snapshot();
        let snap_b = fsm_b.store().snapshot();
        assert_eq!(
            snap_a.table_index(crate::state_store::Table::Evals),
            snap_b.table_index(crate::state_store::Table::Evals)
        );
        assert_eq!(snap_a.evals().count(), snap_b.evals().count());
        let (applied, _) = b.last_applied_state().await.unwrap();
        assert_eq!(applied, snap.meta.last_log_id);
    }

    #[tokio::test]
    async fn snapshot_store_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_str().unwrap()).unwrap();
        for index in 1..=4u64 {
            let meta = SnapshotMeta {
                last_log_id: Some(LogId::new(CommittedLeaderId::new(1, 1), index)),
                last_membership: StoredMembership::default(),
                snapshot_id: format!("s{index}"),
            };
            store.save(&meta, format!("data-{index}").as_bytes()).unwrap();
        }
        let (meta, data) = store.load_latest().unwrap().unwrap();
        assert_eq!(meta.last_log_id.unwrap().index, 4);
        assert_eq!(data, b"data-4");

        // Only the two newest files survive pruning.
        let files = std::fs::read_dir(dir.path().join("snapshots"))
            .unwrap()
            .count();
        assert_eq!(files, 2);
    }
}
