//! Periodic dispatcher: a timer wheel over cron-driven jobs.
//!
//! Tracked jobs fire at their cron times; each firing emits a
//! [`LaunchRequest`] on the dispatcher's channel. The leader loop consumes
//! the channel, persists a `PeriodicLaunch` record and the synthetic eval in
//! one Raft write, and the launch table guards against double launches: the
//! record survives failovers, and [`PeriodicDispatcher::replay_missed`]
//! walks it on leadership establishment to catch up on ticks that fired
//! while no leader was serving.
//!
//! The clock is injectable so tests drive time deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use croner::Cron;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

use crate::state_store::StateSnapshot;
use crate::structs::Job;

type JobKey = (String, String);

/// Wall clock seam.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A cron tick that should be turned into a launch record plus an eval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub namespace: String,
    pub job_id: String,
    pub launch_millis: i64,
}

/// The next cron occurrence strictly after `after`, if the spec parses.
pub fn next_launch(spec: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let cron = Cron::new(spec).parse().ok()?;
    cron.find_next_occurrence(&after, false).ok()
}

struct DispatcherInner {
    enabled: bool,
    tracked: HashMap<JobKey, Job>,
    /// Millis of the last launch emitted or restored, per job.
    last_launch: HashMap<JobKey, i64>,
}

pub struct PeriodicDispatcher {
    inner: Mutex<DispatcherInner>,
    wakeup: Notify,
    launch_tx: mpsc::UnboundedSender<LaunchRequest>,
    clock: Arc<dyn Clock>,
}

impl PeriodicDispatcher {
    pub fn new(clock: Arc<dyn Clock>) -> (Arc<Self>, mpsc::UnboundedReceiver<LaunchRequest>) {
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            inner: Mutex::new(DispatcherInner {
                enabled: false,
                tracked: HashMap::new(),
                last_launch: HashMap::new(),
            }),
            wakeup: Notify::new(),
            launch_tx,
            clock,
        });
        (dispatcher, launch_rx)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.enabled == enabled {
            return;
        }
        inner.enabled = enabled;
        if !enabled {
            inner.tracked.clear();
            inner.last_launch.clear();
        }
        drop(inner);
        self.wakeup.notify_waiters();
    }

    /// Track a periodic job. Replaces any previous version. Idempotent, so
    /// FSM replay is safe.
    pub fn add(&self, job: Job) {
        if !job.is_periodic_active() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return;
        }
        debug!(namespace = %job.namespace, job_id = %job.id, "tracking periodic job");
        inner.tracked.insert(job.key(), job);
        drop(inner);
        self.wakeup.notify_waiters();
    }

    pub fn remove(&self, namespace: &str, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = (namespace.to_string(), job_id.to_string());
        if inner.tracked.remove(&key).is_some() {
            inner.last_launch.remove(&key);
            drop(inner);
            self.wakeup.notify_waiters();
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().unwrap().tracked.len()
    }

    /// Seed the dispatcher from a state snapshot on leadership
    /// establishment: every active periodic job plus its launch record.
    pub fn restore(&self, snapshot: &StateSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return;
        }
        for job in snapshot.jobs() {
            if !job.is_periodic_active() {
                continue;
            }
            let key = job.key();
            if let Some(launch) = snapshot.periodic_launch(&key.0, &key.1) {
                inner.last_launch.insert(key.clone(), launch.launch_millis);
            }
            inner.tracked.insert(key, (**job).clone());
        }
        info!(tracked = inner.tracked.len(), "periodic dispatcher restored");
        drop(inner);
        self.wakeup.notify_waiters();
    }

    /// Emit launches for ticks that passed while no leader was serving.
    /// At most one catch-up launch per job: the newest missed tick.
    pub fn replay_missed(&self) {
        let now = self.clock.now();
        let mut to_launch = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            if !inner.enabled {
                return;
            }
            for (key, job) in &inner.tracked {
                let Some(periodic) = &job.periodic else { continue };
                let last = inner.last_launch.get(key).copied().unwrap_or(0);
                let after = Utc
                    .timestamp_millis_opt(last)
                    .single()
                    .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
                let mut newest_missed = None;
                let mut cursor = after;
                // Walk forward through missed ticks; bounded in practice by
                // the catch-up horizon of one leader gap.
                for _ in 0..10_000 {
                    match next_launch(&periodic.spec, cursor) {
                        Some(t) if t <= now => {
                            newest_missed = Some(t);
                            cursor = t;
                        }
                        _ => break,
                    }
                }
                if let Some(tick) = newest_missed {
                    to_launch.push((key.clone(), tick.timestamp_millis()));
                }
            }
        }
        for ((namespace, job_id), launch_millis) in to_launch {
            info!(namespace = %namespace, job_id = %job_id, launch_millis, "replaying missed periodic launch");
            self.emit(namespace, job_id, launch_millis);
        }
    }

    fn emit(&self, namespace: String, job_id: String, launch_millis: i64) {
        {
            let mut inner = self.inner.lock().unwrap();
            let key = (namespace.clone(), job_id.clone());
            let last = inner.last_launch.get(&key).copied().unwrap_or(0);
            if launch_millis <= last {
                return; // already launched this tick
            }
            inner.last_launch.insert(key, launch_millis);
        }
        let _ = self.launch_tx.send(LaunchRequest {
            namespace,
            job_id,
            launch_millis,
        });
    }

    /// The timer loop. Runs until `shutdown` flips; spawned once at server
    /// start and inert while the dispatcher is disabled.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let next = self.next_fire();
            let sleep = match next {
                Some((_, _, at)) => {
                    let now = self.clock.now();
                    (at - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                }
                // Nothing tracked; wait for a wakeup.
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {
                    if let Some((namespace, job_id, at)) = next {
                        // Re-verify against the clock; a wakeup may have
                        // rescheduled us.
                        if self.clock.now() >= at {
                            self.emit(namespace, job_id, at.timestamp_millis());
                        }
                    }
                }
                _ = self.wakeup.notified() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// The earliest upcoming (job, tick) across tracked jobs.
    fn next_fire(&self) -> Option<(String, String, DateTime<Utc>)> {
        let inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return None;
        }
        let now = self.clock.now();
        let mut best: Option<(String, String, DateTime<Utc>)> = None;
        for (key, job) in &inner.tracked {
            let Some(periodic) = &job.periodic else { continue };
            let last = inner.last_launch.get(key).copied().unwrap_or(0);
            let after_millis = last.max(now.timestamp_millis() - 1);
            let after = Utc
                .timestamp_millis_opt(after_millis)
                .single()
                .unwrap_or(now);
            let Some(next) = next_launch(&periodic.spec, after) else {
                error!(job_id = %key.1, spec = %periodic.spec, "invalid cron spec on tracked job");
                continue;
            };
            if best.as_ref().map(|(_, _, t)| next < *t).unwrap_or(true) {
                best = Some((key.0.clone(), key.1.clone(), next));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{JobStatus, JobType, PeriodicConfig, DEFAULT_NAMESPACE};

    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn at(s: &str) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(s.parse().unwrap()),
            })
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn periodic_job(id: &str, spec: &str) -> Job {
        Job {
            id: id.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_type: JobType::Batch,
            priority: 50,
            version: 0,
            task_groups: vec![],
            periodic: Some(PeriodicConfig {
                enabled: true,
                spec: spec.to_string(),
                prohibit_overlap: false,
            }),
            parameterized: None,
            status: JobStatus::Pending,
            stop: false,
            stable: false,
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn next_launch_parses_cron() {
        let after: DateTime<Utc> = "2024-03-01T10:30:00Z".parse().unwrap();
        let next = next_launch("0 * * * *", after).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-01T11:00:00+00:00");
    }

    #[test]
    fn next_launch_rejects_garbage() {
        let after: DateTime<Utc> = "2024-03-01T10:30:00Z".parse().unwrap();
        assert!(next_launch("not a cron", after).is_none());
    }

    #[tokio::test]
    async fn add_requires_enabled_and_periodic() {
        let clock = ManualClock::at("2024-03-01T10:00:00Z");
        let (dispatcher, _rx) = PeriodicDispatcher::new(clock);

        dispatcher.add(periodic_job("cron-job", "0 * * * *"));
        assert_eq!(dispatcher.tracked_count(), 0); // disabled

        dispatcher.set_enabled(true);
        dispatcher.add(periodic_job("cron-job", "0 * * * *"));
        assert_eq!(dispatcher.tracked_count(), 1);

        let mut stopped = periodic_job("stopped", "0 * * * *");
        stopped.stop = true;
        dispatcher.add(stopped);
        assert_eq!(dispatcher.tracked_count(), 1);
    }

    #[tokio::test]
    async fn remove_untracks() {
        let clock = ManualClock::at("2024-03-01T10:00:00Z");
        let (dispatcher, _rx) = PeriodicDispatcher::new(clock);
        dispatcher.set_enabled(true);
        dispatcher.add(periodic_job("cron-job", "0 * * * *"));
        dispatcher.remove(DEFAULT_NAMESPACE, "cron-job");
        assert_eq!(dispatcher.tracked_count(), 0);
    }

    #[tokio::test]
    async fn replay_missed_emits_newest_missed_tick() {
        // Last launch at 08:00, clock at 10:30: ticks 09:00 and 10:00 were
        // missed while no leader served; only 10:00 is replayed.
        let clock = ManualClock::at("2024-03-01T10:30:00Z");
        let (dispatcher, mut rx) = PeriodicDispatcher::new(clock);
        dispatcher.set_enabled(true);
        dispatcher.add(periodic_job("cron-job", "0 * * * *"));
        {
            let mut inner = dispatcher.inner.lock().unwrap();
            let last: DateTime<Utc> = "2024-03-01T08:00:00Z".parse().unwrap();
            inner.last_launch.insert(
                (DEFAULT_NAMESPACE.to_string(), "cron-job".to_string()),
                last.timestamp_millis(),
            );
        }

        dispatcher.replay_missed();
        let launch = rx.try_recv().expect("one replayed launch");
        let expected: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();
        assert_eq!(launch.launch_millis, expected.timestamp_millis());
        assert!(rx.try_recv().is_err(), "only the newest missed tick fires");
    }

    #[tokio::test]
    async fn replay_with_no_missed_ticks_is_silent() {
        let clock = ManualClock::at("2024-03-01T10:30:00Z");
        let (dispatcher, mut rx) = PeriodicDispatcher::new(clock.clone());
        dispatcher.set_enabled(true);
        dispatcher.add(periodic_job("cron-job", "0 * * * *"));
        {
            let mut inner = dispatcher.inner.lock().unwrap();
            inner.last_launch.insert(
                (DEFAULT_NAMESPACE.to_string(), "cron-job".to_string()),
                clock.now().timestamp_millis(),
            );
        }
        dispatcher.replay_missed();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_emit_is_suppressed() {
        let clock = ManualClock::at("2024-03-01T10:30:00Z");
        let (dispatcher, mut rx) = PeriodicDispatcher::new(clock);
        dispatcher.set_enabled(true);
        dispatcher.add(periodic_job("cron-job", "0 * * * *"));

        dispatcher.emit(DEFAULT_NAMESPACE.into(), "cron-job".into(), 1_000_000);
        dispatcher.emit(DEFAULT_NAMESPACE.into(), "cron-job".into(), 1_000_000);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
