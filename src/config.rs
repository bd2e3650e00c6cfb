//! Server configuration parsed from environment variables.
//!
//! Every option has a default so the struct is always constructable; the
//! recognized variables map one-to-one onto the tuning knobs of the core:
//!
//! | Variable | Default | Governs |
//! |---|---|---|
//! | `NODE_ID` | `HOSTNAME`, then `"unknown-node"` | stable server identity |
//! | `REGION` | `"global"` | federation boundary for RPC forwarding |
//! | `BIND_ADDR` | `0.0.0.0:4647` | framed RPC + Raft listener |
//! | `HEALTH_ADDR` | `0.0.0.0:4646` | HTTP health + metrics endpoint |
//! | `PEERS` | empty | static `addr1,addr2,...` peer set |
//! | `DATA_DIR` | `/var/lib/flotilla` | snapshot store |
//! | `BOOTSTRAP_EXPECT` | `0` | auto-bootstrap quorum size, 0 disables |
//! | `NUM_SCHEDULERS` | host CPU count | scheduler worker pool size |
//! | `ENABLED_SCHEDULERS` | `service,batch,system,core` | sub-scheduler set |
//! | `EVAL_*` | see below | broker redelivery behavior |
//! | `*_HEARTBEAT_*` | see below | node TTL tracking |
//! | `RPC_*` | see below | fabric timeouts and limits |
//! | `NON_VOTER` | `false` | join Raft without a vote |

use std::time::Duration;

/// Sub-scheduler names accepted in `ENABLED_SCHEDULERS`.
pub const ALL_SCHEDULERS: [&str; 4] = ["service", "batch", "system", "core"];

/// Raft proposals larger than this log a warning before being enqueued.
pub const RAFT_WARN_SIZE: usize = 1024 * 1024;

/// How many completed snapshots the snapshot store retains.
pub const SNAPSHOT_RETENTION: usize = 2;

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Stable server identity used in Raft and log fields.
    pub node_id: String,

    /// Region this server belongs to; each region has its own Raft group.
    pub region: String,

    /// Address for the framed RPC + Raft listener.
    pub bind_addr: String,

    /// Address peers dial this server at; must match the entry for this
    /// server in every peer's `PEERS` list. Defaults to `bind_addr`.
    pub advertise_addr: String,

    /// Address for the HTTP health + metrics endpoint.
    pub health_addr: String,

    /// Static peer addresses (including this server's own `bind_addr`).
    pub peers: Vec<String>,

    /// Data directory for the snapshot store.
    pub data_dir: String,

    /// Number of servers expected before auto-bootstrapping. 0 disables.
    pub bootstrap_expect: usize,

    /// Size of the scheduler worker pool.
    pub num_schedulers: usize,

    /// Which sub-schedulers this server runs.
    pub enabled_schedulers: Vec<String>,

    /// Visibility timeout on an unacked eval lease.
    pub eval_nack_timeout: Duration,

    /// Total deliveries allowed per eval before it is failed out.
    pub eval_delivery_limit: u32,

    /// Reenqueue delay after the first Nack.
    pub eval_nack_initial_reenqueue_delay: Duration,

    /// Reenqueue delay after every subsequent Nack.
    pub eval_nack_subsequent_reenqueue_delay: Duration,

    /// Baseline delay before a failed eval's follow-up becomes eligible.
    pub eval_failed_followup_baseline_delay: Duration,

    /// Random range added to the follow-up baseline.
    pub eval_failed_followup_delay_range: Duration,

    /// Floor on the per-node heartbeat TTL.
    pub min_heartbeat_ttl: Duration,

    /// Cap on aggregate heartbeat rate; TTLs stretch as the fleet grows.
    pub max_heartbeats_per_second: f64,

    /// Grace added on top of each TTL before the node is marked down.
    pub heartbeat_grace: Duration,

    /// TTL granted to every known node when leadership is established.
    pub failover_heartbeat_ttl: Duration,

    /// How long an RPC is held while leadership is in transition.
    pub rpc_hold_timeout: Duration,

    /// Deadline for the first byte on an unauthenticated connection.
    pub rpc_handshake_timeout: Duration,

    /// Per-remote-IP connection limit.
    pub rpc_max_conns_per_client: usize,

    /// Raft apply enqueue timeout.
    pub raft_timeout: Duration,

    /// Join the Raft group without a vote.
    pub non_voter: bool,

    /// Optional TLS material for the `tls` framing byte.
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
}

impl ServerConfig {
    /// Parse the configuration from environment variables.
    pub fn from_env() -> Self {
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-node".to_string())
        });

        let region = std::env::var("REGION").unwrap_or_else(|_| "global".to_string());

        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4647".to_string());
        let advertise_addr =
            std::env::var("ADVERTISE_ADDR").unwrap_or_else(|_| bind_addr.clone());
        let health_addr =
            std::env::var("HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:4646".to_string());

        let peers = std::env::var("PEERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let data_dir =
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/flotilla".to_string());

        let enabled_schedulers = std::env::var("ENABLED_SCHEDULERS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|_| ALL_SCHEDULERS.iter().map(|s| s.to_string()).collect());

        Self {
            node_id,
            region,
            bind_addr,
            advertise_addr,
            health_addr,
            peers,
            data_dir,
            bootstrap_expect: env_usize("BOOTSTRAP_EXPECT", 0),
            num_schedulers: env_usize("NUM_SCHEDULERS", num_cpus()),
            enabled_schedulers,
            eval_nack_timeout: env_duration("EVAL_NACK_TIMEOUT", Duration::from_secs(60)),
            eval_delivery_limit: env_usize("EVAL_DELIVERY_LIMIT", 3) as u32,
            eval_nack_initial_reenqueue_delay: env_duration(
                "EVAL_NACK_INITIAL_REENQUEUE_DELAY",
                Duration::from_secs(1),
            ),
            eval_nack_subsequent_reenqueue_delay: env_duration(
                "EVAL_NACK_SUBSEQUENT_REENQUEUE_DELAY",
                Duration::from_secs(20),
            ),
            eval_failed_followup_baseline_delay: env_duration(
                "EVAL_FAILED_FOLLOWUP_BASELINE_DELAY",
                Duration::from_secs(60),
            ),
            eval_failed_followup_delay_range: env_duration(
                "EVAL_FAILED_FOLLOWUP_DELAY_RANGE",
                Duration::from_secs(300),
            ),
            min_heartbeat_ttl: env_duration("MIN_HEARTBEAT_TTL", Duration::from_secs(10)),
            max_heartbeats_per_second: std::env::var("MAX_HEARTBEATS_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50.0),
            heartbeat_grace: env_duration("HEARTBEAT_GRACE", Duration::from_secs(10)),
            failover_heartbeat_ttl: env_duration(
                "FAILOVER_HEARTBEAT_TTL",
                Duration::from_secs(300),
            ),
            rpc_hold_timeout: env_duration("RPC_HOLD_TIMEOUT", Duration::from_secs(5)),
            rpc_handshake_timeout: env_duration("RPC_HANDSHAKE_TIMEOUT", Duration::from_secs(5)),
            rpc_max_conns_per_client: env_usize("RPC_MAX_CONNS_PER_CLIENT", 100),
            raft_timeout: env_duration("RAFT_TIMEOUT", Duration::from_secs(30)),
            non_voter: std::env::var("NON_VOTER")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            tls_cert_file: std::env::var("TLS_CERT_FILE").ok(),
            tls_key_file: std::env::var("TLS_KEY_FILE").ok(),
        }
    }

    /// A config suitable for unit tests: short timeouts, no peers.
    pub fn for_testing() -> Self {
        Self {
            node_id: "test-server".to_string(),
            region: "global".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_addr: "127.0.0.1:0".to_string(),
            health_addr: "127.0.0.1:0".to_string(),
            peers: vec![],
            // Unique per call so tests never restore each other's
            // snapshot files.
            data_dir: std::env::temp_dir()
                .join(format!("flotilla-test-{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
            bootstrap_expect: 0,
            num_schedulers: 2,
            enabled_schedulers: ALL_SCHEDULERS.iter().map(|s| s.to_string()).collect(),
            eval_nack_timeout: Duration::from_millis(200),
            eval_delivery_limit: 3,
            eval_nack_initial_reenqueue_delay: Duration::from_millis(5),
            eval_nack_subsequent_reenqueue_delay: Duration::from_millis(20),
            eval_failed_followup_baseline_delay: Duration::from_millis(50),
            eval_failed_followup_delay_range: Duration::from_millis(50),
            min_heartbeat_ttl: Duration::from_millis(50),
            max_heartbeats_per_second: 50.0,
            heartbeat_grace: Duration::from_millis(50),
            failover_heartbeat_ttl: Duration::from_millis(500),
            rpc_hold_timeout: Duration::from_millis(200),
            rpc_handshake_timeout: Duration::from_millis(500),
            rpc_max_conns_per_client: 100,
            raft_timeout: Duration::from_secs(5),
            non_voter: false,
            tls_cert_file: None,
            tls_key_file: None,
        }
    }

    /// The per-node heartbeat TTL for a fleet of `node_count` nodes.
    ///
    /// TTLs stretch so the aggregate heartbeat rate stays under
    /// `max_heartbeats_per_second`, with `min_heartbeat_ttl` as the floor.
    pub fn heartbeat_ttl(&self, node_count: usize) -> Duration {
        let spread = Duration::from_secs_f64(node_count as f64 / self.max_heartbeats_per_second);
        spread.max(self.min_heartbeat_ttl)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_duration_string(&v).ok())
        .unwrap_or(default)
}

/// Parses duration strings like `"500ms"`, `"30s"`, `"5m"`, `"2h"`.
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let (value_str, mult_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1u64)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else {
        return Err(format!(
            "Unknown duration unit in {:?}. Use 'ms', 's', 'm', or 'h'.",
            s
        ));
    };

    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("Invalid numeric value in duration: {:?}", value_str))?;

    Ok(Duration::from_millis(value * mult_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(
            parse_duration_string("500ms").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(parse_duration_string("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_string("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration_string("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration_string("").is_err());
        assert!(parse_duration_string("10x").is_err());
        assert!(parse_duration_string("abcms").is_err());
    }

    #[test]
    fn testing_config_defaults() {
        let cfg = ServerConfig::for_testing();
        assert_eq!(cfg.region, "global");
        assert_eq!(cfg.eval_delivery_limit, 3);
        assert_eq!(cfg.enabled_schedulers.len(), 4);
        assert!(!cfg.non_voter);
    }

    #[test]
    fn heartbeat_ttl_has_floor() {
        let cfg = ServerConfig::for_testing();
        // A tiny fleet never drops below the configured minimum.
        assert_eq!(cfg.heartbeat_ttl(1), cfg.min_heartbeat_ttl);
    }

    #[test]
    fn heartbeat_ttl_stretches_with_fleet_size() {
        let mut cfg = ServerConfig::for_testing();
        cfg.min_heartbeat_ttl = Duration::from_secs(10);
        cfg.max_heartbeats_per_second = 50.0;
        // 10_000 nodes / 50 per second = 200s per node.
        assert_eq!(cfg.heartbeat_ttl(10_000), Duration::from_secs(200));
    }
}
