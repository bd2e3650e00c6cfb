//! Environment-variable configuration tests. Serialized because they
//! mutate process-global state.

use std::time::Duration;

use serial_test::serial;

use flotilla::config::ServerConfig;

fn clear_env() {
    for key in [
        "NODE_ID",
        "REGION",
        "BIND_ADDR",
        "ADVERTISE_ADDR",
        "PEERS",
        "BOOTSTRAP_EXPECT",
        "NUM_SCHEDULERS",
        "ENABLED_SCHEDULERS",
        "EVAL_NACK_TIMEOUT",
        "EVAL_DELIVERY_LIMIT",
        "MIN_HEARTBEAT_TTL",
        "RPC_HOLD_TIMEOUT",
        "RPC_MAX_CONNS_PER_CLIENT",
        "NON_VOTER",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn defaults_without_environment() {
    clear_env();
    let cfg = ServerConfig::from_env();
    assert_eq!(cfg.region, "global");
    assert_eq!(cfg.bind_addr, "0.0.0.0:4647");
    assert_eq!(cfg.advertise_addr, cfg.bind_addr);
    assert!(cfg.peers.is_empty());
    assert_eq!(cfg.bootstrap_expect, 0);
    assert_eq!(cfg.eval_delivery_limit, 3);
    assert_eq!(cfg.eval_nack_timeout, Duration::from_secs(60));
    assert_eq!(cfg.rpc_max_conns_per_client, 100);
    assert_eq!(
        cfg.enabled_schedulers,
        vec!["service", "batch", "system", "core"]
    );
    assert!(!cfg.non_voter);
}

#[test]
#[serial]
fn environment_overrides_apply() {
    clear_env();
    std::env::set_var("REGION", "eu-west");
    std::env::set_var("PEERS", "10.0.0.1:4647, 10.0.0.2:4647,");
    std::env::set_var("BOOTSTRAP_EXPECT", "3");
    std::env::set_var("NUM_SCHEDULERS", "6");
    std::env::set_var("ENABLED_SCHEDULERS", "service,core");
    std::env::set_var("EVAL_NACK_TIMEOUT", "30s");
    std::env::set_var("EVAL_DELIVERY_LIMIT", "5");
    std::env::set_var("MIN_HEARTBEAT_TTL", "500ms");
    std::env::set_var("NON_VOTER", "true");

    let cfg = ServerConfig::from_env();
    assert_eq!(cfg.region, "eu-west");
    assert_eq!(cfg.peers, vec!["10.0.0.1:4647", "10.0.0.2:4647"]);
    assert_eq!(cfg.bootstrap_expect, 3);
    assert_eq!(cfg.num_schedulers, 6);
    assert_eq!(cfg.enabled_schedulers, vec!["service", "core"]);
    assert_eq!(cfg.eval_nack_timeout, Duration::from_secs(30));
    assert_eq!(cfg.eval_delivery_limit, 5);
    assert_eq!(cfg.min_heartbeat_ttl, Duration::from_millis(500));
    assert!(cfg.non_voter);

    clear_env();
}

#[test]
#[serial]
fn malformed_values_fall_back_to_defaults() {
    clear_env();
    std::env::set_var("NUM_SCHEDULERS", "not-a-number");
    std::env::set_var("EVAL_NACK_TIMEOUT", "soon");

    let cfg = ServerConfig::from_env();
    assert!(cfg.num_schedulers >= 1);
    assert_eq!(cfg.eval_nack_timeout, Duration::from_secs(60));

    clear_env();
}

#[test]
#[serial]
fn advertise_addr_defaults_to_bind_addr() {
    clear_env();
    std::env::set_var("BIND_ADDR", "10.9.8.7:4647");
    let cfg = ServerConfig::from_env();
    assert_eq!(cfg.advertise_addr, "10.9.8.7:4647");

    std::env::set_var("ADVERTISE_ADDR", "198.51.100.4:4647");
    let cfg = ServerConfig::from_env();
    assert_eq!(cfg.advertise_addr, "198.51.100.4:4647");
    clear_env();
}
