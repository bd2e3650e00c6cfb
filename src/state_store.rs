//! In-memory multi-version state store: the read side of the FSM.
//!
//! The store keeps every table as an ordered map whose values are `Arc`
//! shared. A write transaction clones the table set (cheap: the values are
//! shared), mutates the clone, bumps the per-table index entries, and
//! publishes the new generation atomically. A [`StateSnapshot`] is an `Arc`
//! handle to one generation: immutable, and it can outlive any number of
//! writes that follow it.
//!
//! Contract: reads never block writes; writes are linearized by the FSM
//! apply path, which is the only caller of [`StateStore::begin`] /
//! [`StateStore::commit`]. Watch granularity is per table: each table has a
//! `watch` channel carrying its last-modified index, and a [`WatchSet`]
//! resolves when any subscribed table moves past the index observed at
//! snapshot time. The abandon channel fires when the entire store is
//! replaced during snapshot restore; blocking queries observe it and
//! restart against the new generation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::structs::{
    AclPolicy, AclRole, AclToken, Allocation, ClusterMetadata, CsiVolume, Deployment, Evaluation,
    Job, JobSummary, Namespace, Node, PeriodicLaunch, SchedulerConfig, ServiceRegistration,
    Variable,
};

/// Namespace-scoped composite key: `(namespace, id)`.
pub type NsKey = (String, String);

// ── Tables ────────────────────────────────────────────────────────────────────

/// Every table in the store. The discriminant doubles as the key of the
/// index table and the watch registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Nodes,
    Jobs,
    Evals,
    Allocs,
    Deployments,
    PeriodicLaunches,
    JobSummaries,
    AclPolicies,
    AclTokens,
    AclRoles,
    Namespaces,
    CsiVolumes,
    Services,
    Variables,
    SchedulerConfig,
    ClusterMeta,
}

impl Table {
    pub const ALL: [Table; 16] = [
        Table::Nodes,
        Table::Jobs,
        Table::Evals,
        Table::Allocs,
        Table::Deployments,
        Table::PeriodicLaunches,
        Table::JobSummaries,
        Table::AclPolicies,
        Table::AclTokens,
        Table::AclRoles,
        Table::Namespaces,
        Table::CsiVolumes,
        Table::Services,
        Table::Variables,
        Table::SchedulerConfig,
        Table::ClusterMeta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Jobs => "jobs",
            Table::Evals => "evals",
            Table::Allocs => "allocs",
            Table::Deployments => "deployments",
            Table::PeriodicLaunches => "periodic_launches",
            Table::JobSummaries => "job_summaries",
            Table::AclPolicies => "acl_policies",
            Table::AclTokens => "acl_tokens",
            Table::AclRoles => "acl_roles",
            Table::Namespaces => "namespaces",
            Table::CsiVolumes => "csi_volumes",
            Table::Services => "services",
            Table::Variables => "variables",
            Table::SchedulerConfig => "scheduler_config",
            Table::ClusterMeta => "cluster_meta",
        }
    }
}

/// One immutable generation of every table.
#[derive(Debug, Clone, Default)]
pub struct StateTables {
    pub nodes: BTreeMap<String, Arc<Node>>,
    pub jobs: BTreeMap<NsKey, Arc<Job>>,
    pub evals: BTreeMap<String, Arc<Evaluation>>,
    pub allocs: BTreeMap<String, Arc<Allocation>>,
    pub deployments: BTreeMap<String, Arc<Deployment>>,
    pub periodic_launches: BTreeMap<NsKey, Arc<PeriodicLaunch>>,
    pub job_summaries: BTreeMap<NsKey, Arc<JobSummary>>,
    pub acl_policies: BTreeMap<String, Arc<AclPolicy>>,
    pub acl_tokens: BTreeMap<String, Arc<AclToken>>,
    pub acl_roles: BTreeMap<String, Arc<AclRole>>,
    pub namespaces: BTreeMap<String, Arc<Namespace>>,
    pub csi_volumes: BTreeMap<NsKey, Arc<CsiVolume>>,
    pub services: BTreeMap<NsKey, Arc<ServiceRegistration>>,
    pub variables: BTreeMap<NsKey, Arc<Variable>>,
    pub scheduler_config: Option<Arc<SchedulerConfig>>,
    pub cluster_meta: Option<Arc<ClusterMetadata>>,
    /// Per-table monotone index, advanced by every write to that table.
    pub indexes: BTreeMap<&'static str, u64>,
}

impl StateTables {
    /// Table index with the floor of 1 that makes blocking queries well
    /// defined on never-written tables.
    pub fn table_index(&self, table: Table) -> u64 {
        self.indexes.get(table.as_str()).copied().unwrap_or(0).max(1)
    }

    /// The highest index any table has been written at.
    pub fn latest_index(&self) -> u64 {
        self.indexes.values().copied().max().unwrap_or(0).max(1)
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// A consistent point-in-time view of the store.
#[derive(Clone)]
pub struct StateSnapshot {
    tables: Arc<StateTables>,
}

impl StateSnapshot {
    pub fn tables(&self) -> &StateTables {
        &self.tables
    }

    pub fn table_index(&self, table: Table) -> u64 {
        self.tables.table_index(table)
    }

    pub fn latest_index(&self) -> u64 {
        self.tables.latest_index()
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.tables.nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.tables.nodes.values()
    }

    pub fn job(&self, namespace: &str, id: &str) -> Option<Arc<Job>> {
        self.tables
            .jobs
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<Job>> {
        self.tables.jobs.values()
    }

    /// All jobs in one namespace, in id order.
    pub fn jobs_by_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Arc<Job>> {
        self.ns_range(&self.tables.jobs, namespace)
    }

    pub fn eval(&self, id: &str) -> Option<Arc<Evaluation>> {
        self.tables.evals.get(id).cloned()
    }

    pub fn evals(&self) -> impl Iterator<Item = &Arc<Evaluation>> {
        self.tables.evals.values()
    }

    pub fn evals_by_job<'a>(
        &'a self,
        namespace: &'a str,
        job_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Evaluation>> {
        self.tables
            .evals
            .values()
            .filter(move |e| e.namespace == namespace && e.job_id == job_id)
    }

    pub fn alloc(&self, id: &str) -> Option<Arc<Allocation>> {
        self.tables.allocs.get(id).cloned()
    }

    pub fn allocs(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.tables.allocs.values()
    }

    pub fn allocs_by_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Arc<Allocation>> {
        self.tables
            .allocs
            .values()
            .filter(move |a| a.node_id == node_id)
    }

    pub fn allocs_by_job<'a>(
        &'a self,
        namespace: &'a str,
        job_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Allocation>> {
        self.tables
            .allocs
            .values()
            .filter(move |a| a.namespace == namespace && a.job_id == job_id)
    }

    pub fn deployment(&self, id: &str) -> Option<Arc<Deployment>> {
        self.tables.deployments.get(id).cloned()
    }

    pub fn periodic_launch(&self, namespace: &str, job_id: &str) -> Option<Arc<PeriodicLaunch>> {
        self.tables
            .periodic_launches
            .get(&(namespace.to_string(), job_id.to_string()))
            .cloned()
    }

    pub fn job_summary(&self, namespace: &str, job_id: &str) -> Option<Arc<JobSummary>> {
        self.tables
            .job_summaries
            .get(&(namespace.to_string(), job_id.to_string()))
            .cloned()
    }

    pub fn variable(&self, namespace: &str, path: &str) -> Option<Arc<Variable>> {
        self.tables
            .variables
            .get(&(namespace.to_string(), path.to_string()))
            .cloned()
    }

    /// Prefix scan over variable paths within a namespace.
    pub fn variables_by_prefix<'a>(
        &'a self,
        namespace: &'a str,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Variable>> {
        self.ns_range(&self.tables.variables, namespace)
            .filter(move |v| v.path.starts_with(prefix))
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.tables.namespaces.get(name).cloned()
    }

    pub fn csi_volume(&self, namespace: &str, id: &str) -> Option<Arc<CsiVolume>> {
        self.tables
            .csi_volumes
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }

    pub fn acl_token_by_accessor(&self, accessor: &str) -> Option<Arc<AclToken>> {
        self.tables.acl_tokens.get(accessor).cloned()
    }

    pub fn scheduler_config(&self) -> Arc<SchedulerConfig> {
        self.tables
            .scheduler_config
            .clone()
            .unwrap_or_else(|| Arc::new(SchedulerConfig::default()))
    }

    fn ns_range<'a, V>(
        &'a self,
        map: &'a BTreeMap<NsKey, V>,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a V> {
        // Range over (namespace, "") ..= (namespace, MAX) without allocating
        // the upper bound: take while the namespace component matches.
        map.range((namespace.to_string(), String::new())..)
            .take_while(move |((ns, _), _)| ns == namespace)
            .map(|(_, v)| v)
    }
}

// ── Write transactions ────────────────────────────────────────────────────────

/// A mutable clone of the current generation, produced by
/// [`StateStore::begin`] and published by [`StateStore::commit`].
pub struct Txn {
    pub tables: StateTables,
    index: u64,
    touched: Vec<Table>,
}

impl Txn {
    /// The Raft index this transaction commits at.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Record a write to `table`: advances its index entry to the commit
    /// index and schedules its watch channel for notification.
    pub fn bump(&mut self, table: Table) {
        self.tables.indexes.insert(table.as_str(), self.index);
        if !self.touched.contains(&table) {
            self.touched.push(table);
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

struct Watches {
    tables: BTreeMap<Table, watch::Sender<u64>>,
    applied: watch::Sender<u64>,
}

/// The store itself. Exactly one writer (the FSM) at a time; any number of
/// snapshot readers.
pub struct StateStore {
    current: Mutex<Arc<StateTables>>,
    watches: Watches,
    abandon: Mutex<watch::Sender<bool>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for t in Table::ALL {
            tables.insert(t, watch::channel(0u64).0);
        }
        let (abandon_tx, _) = watch::channel(false);
        Self {
            current: Mutex::new(Arc::new(StateTables::default())),
            watches: Watches {
                tables,
                applied: watch::channel(0u64).0,
            },
            abandon: Mutex::new(abandon_tx),
        }
    }

    /// A consistent point-in-time view.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            tables: self.current.lock().unwrap().clone(),
        }
    }

    /// The highest Raft index applied to the store.
    pub fn applied_index(&self) -> u64 {
        *self.watches.applied.borrow()
    }

    /// Begin a write transaction at `index`. FSM-only.
    pub fn begin(&self, index: u64) -> Txn {
        let tables = (**self.current.lock().unwrap()).clone();
        Txn {
            tables,
            index,
            touched: Vec::new(),
        }
    }

    /// Publish a transaction: swap in the new generation, then wake the
    /// watchers of every touched table. Watchers registered before this
    /// call observe the close no later than their next poll.
    pub fn commit(&self, txn: Txn) {
        let Txn {
            tables,
            index,
            touched,
        } = txn;
        {
            let mut cur = self.current.lock().unwrap();
            *cur = Arc::new(tables);
        }
        for t in touched {
            if let Some(tx) = self.watches.tables.get(&t) {
                let _ = tx.send(index);
            }
        }
        let _ = self.watches.applied.send_if_modified(|v| {
            if index > *v {
                *v = index;
                true
            } else {
                false
            }
        });
    }

    /// Replace the entire store (snapshot restore). Closes the old abandon
    /// channel so in-flight blocking queries restart, then wakes every
    /// table watcher.
    pub fn swap_all(&self, tables: StateTables) {
        let index = tables.latest_index();
        {
            let mut cur = self.current.lock().unwrap();
            *cur = Arc::new(tables);
        }
        {
            let mut abandon = self.abandon.lock().unwrap();
            let _ = abandon.send(true);
            let (tx, _) = watch::channel(false);
            *abandon = tx;
        }
        for tx in self.watches.tables.values() {
            let _ = tx.send(index);
        }
        let _ = self.watches.applied.send(index);
    }

    /// Subscribe to the abandon signal of the current generation.
    pub fn abandon_rx(&self) -> watch::Receiver<bool> {
        self.abandon.lock().unwrap().subscribe()
    }

    /// Build a watch set over the given tables. Subscribe **before** taking
    /// the snapshot the query runs against.
    pub fn watch(&self, tables: &[Table]) -> WatchSet {
        WatchSet {
            rxs: tables
                .iter()
                .filter_map(|t| self.watches.tables.get(t))
                .map(|tx| tx.subscribe())
                .collect(),
            abandon: self.abandon_rx(),
        }
    }

    /// Block until the applied index reaches `min`, the timeout passes, or
    /// the store is abandoned. Returns the applied index on success.
    pub async fn wait_for_index(&self, min: u64, timeout: Duration) -> Option<u64> {
        let mut rx = self.watches.applied.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let cur = *rx.borrow_and_update();
            if cur >= min {
                return Some(cur);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }
}

// ── Watch sets ────────────────────────────────────────────────────────────────

/// Outcome of waiting on a watch set.
#[derive(Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A subscribed table was written.
    Changed,
    /// The store was replaced; restart against a fresh snapshot.
    Abandoned,
    Timeout,
}

/// A set of table subscriptions plus the abandon signal.
pub struct WatchSet {
    rxs: Vec<watch::Receiver<u64>>,
    abandon: watch::Receiver<bool>,
}

impl WatchSet {
    /// Wait until any subscribed table changes, the store is abandoned, or
    /// the timeout elapses. Writes that landed between subscription and
    /// this call count as changes.
    pub async fn wait(&mut self, timeout: Duration) -> WatchOutcome {
        if self.rxs.is_empty() {
            tokio::time::sleep(timeout).await;
            return WatchOutcome::Timeout;
        }
        let changes = self.rxs.iter_mut().map(|rx| Box::pin(rx.changed()));
        // Biased so a restore that also touches tables reports Abandoned,
        // not Changed: the caller must drop its snapshot, not just re-read.
        tokio::select! {
            biased;
            res = self.abandon.changed() => {
                match res {
                    Ok(()) if !*self.abandon.borrow() => WatchOutcome::Changed,
                    _ => WatchOutcome::Abandoned,
                }
            }
            (res, _, _) = futures_select_all(changes) => match res {
                Ok(()) => WatchOutcome::Changed,
                // Sender dropped: the store is going away.
                Err(_) => WatchOutcome::Abandoned,
            },
            _ = tokio::time::sleep(timeout) => WatchOutcome::Timeout,
        }
    }
}

/// Minimal select-all over a set of futures, first-completed wins.
/// (The futures crate is not in the dependency set; this is the only place
/// that needs the combinator.)
async fn futures_select_all<F, T>(futures: impl Iterator<Item = F>) -> (T, usize, Vec<F>)
where
    F: std::future::Future<Output = T> + Unpin,
{
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct SelectAll<F> {
        inner: Vec<F>,
    }

    impl<F: Future + Unpin> Future for SelectAll<F> {
        type Output = (F::Output, usize);

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            for (i, f) in self.inner.iter_mut().enumerate() {
                if let Poll::Ready(out) = Pin::new(f).poll(cx) {
                    return Poll::Ready((out, i));
                }
            }
            Poll::Pending
        }
    }

    let mut sel = SelectAll {
        inner: futures.collect(),
    };
    let (out, idx) = (&mut sel).await;
    sel.inner.remove(idx);
    (out, idx, sel.inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{
        generate_id, EvalStatus, Evaluation, NodeStatus, Resources, SchedulingEligibility,
    };
    use std::collections::HashMap;

    fn store_with_node(index: u64) -> (StateStore, String) {
        let store = StateStore::new();
        let mut node = crate::structs::Node {
            id: generate_id(),
            datacenter: "dc1".into(),
            node_class: String::new(),
            attributes: HashMap::new(),
            resources: Resources {
                cpu_mhz: 1000,
                memory_mb: 1024,
                disk_mb: 10_000,
            },
            status: NodeStatus::Ready,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain_strategy: None,
            secret_id: generate_id(),
            computed_class: 0,
            status_updated_at: 0,
            create_index: index,
            modify_index: index,
        };
        node.compute_class();
        let id = node.id.clone();
        let mut txn = store.begin(index);
        txn.tables.nodes.insert(id.clone(), Arc::new(node));
        txn.bump(Table::Nodes);
        store.commit(txn);
        (store, id)
    }

    #[test]
    fn snapshot_outlives_later_writes() {
        let (store, id) = store_with_node(5);
        let snap = store.snapshot();
        assert!(snap.node(&id).is_some());

        let mut txn = store.begin(6);
        txn.tables.nodes.remove(&id);
        txn.bump(Table::Nodes);
        store.commit(txn);

        // The old snapshot still sees the node; a new one does not.
        assert!(snap.node(&id).is_some());
        assert!(store.snapshot().node(&id).is_none());
    }

    #[test]
    fn table_index_floor_is_one() {
        let store = StateStore::new();
        let snap = store.snapshot();
        assert_eq!(snap.table_index(Table::Variables), 1);
        assert_eq!(snap.latest_index(), 1);
    }

    #[test]
    fn commit_bumps_only_touched_tables() {
        let (store, _) = store_with_node(5);
        let snap = store.snapshot();
        assert_eq!(snap.table_index(Table::Nodes), 5);
        assert_eq!(snap.table_index(Table::Jobs), 1);
    }

    #[test]
    fn index_invariant_holds() {
        // ∀ table: index(t) >= max(obj.modify_index for obj in t)
        let (store, id) = store_with_node(7);
        let snap = store.snapshot();
        let node = snap.node(&id).unwrap();
        assert!(snap.table_index(Table::Nodes) >= node.modify_index);
    }

    #[tokio::test]
    async fn watch_fires_on_write() {
        let store = StateStore::new();
        let mut ws = store.watch(&[Table::Evals]);

        let mut txn = store.begin(2);
        let eval = Evaluation::new("default", "j1", "service", 50, "job-register");
        txn.tables.evals.insert(eval.id.clone(), Arc::new(eval));
        txn.bump(Table::Evals);
        store.commit(txn);

        assert_eq!(ws.wait(Duration::from_millis(100)).await, WatchOutcome::Changed);
    }

    #[tokio::test]
    async fn watch_times_out_without_write() {
        let store = StateStore::new();
        let mut ws = store.watch(&[Table::Evals]);
        assert_eq!(ws.wait(Duration::from_millis(20)).await, WatchOutcome::Timeout);
    }

    #[tokio::test]
    async fn watch_ignores_unrelated_table() {
        let (store, _) = store_with_node(3);
        let mut ws = store.watch(&[Table::Variables]);

        let mut txn = store.begin(4);
        txn.bump(Table::Nodes);
        store.commit(txn);

        assert_eq!(ws.wait(Duration::from_millis(20)).await, WatchOutcome::Timeout);
    }

    #[tokio::test]
    async fn abandon_wakes_watchers() {
        let store = StateStore::new();
        let mut ws = store.watch(&[Table::Jobs]);
        store.swap_all(StateTables::default());
        assert_eq!(
            ws.wait(Duration::from_millis(100)).await,
            WatchOutcome::Abandoned
        );
    }

    #[tokio::test]
    async fn wait_for_index_returns_once_applied() {
        let store = Arc::new(StateStore::new());
        let s2 = store.clone();
        let waiter = tokio::spawn(async move {
            s2.wait_for_index(10, Duration::from_secs(1)).await
        });

        let mut txn = store.begin(10);
        txn.bump(Table::Jobs);
        store.commit(txn);

        assert_eq!(waiter.await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn wait_for_index_times_out() {
        let store = StateStore::new();
        assert_eq!(
            store.wait_for_index(99, Duration::from_millis(20)).await,
            None
        );
    }

    #[test]
    fn eval_status_helper() {
        let mut e = Evaluation::new("default", "j1", "service", 50, "job-register");
        assert!(e.should_enqueue());
        e.status = EvalStatus::Blocked;
        assert!(e.should_block());
    }
}
