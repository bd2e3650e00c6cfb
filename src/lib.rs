//! Flotilla: a consensus-replicated control plane that schedules jobs
//! onto a fleet of worker nodes.
//!
//! The core is four subsystems: the Raft-fronted state machine
//! ([`fsm`] + [`state_store`] + [`raft`]), the evaluation broker and
//! scheduler worker pool ([`broker`], [`blocked`], [`worker`],
//! [`scheduler`]), the leader-side plan application pipeline
//! ([`plan_apply`]), and the byte-framed RPC dispatch fabric ([`rpc`],
//! [`mux`]). [`server`] assembles them; [`leader`] flips the leader-only
//! machinery on and off as elections come and go.

pub mod blocked;
pub mod broker;
pub mod config;
pub mod errors;
pub mod fsm;
pub mod heartbeat;
pub mod leader;
pub mod metrics;
pub mod mux;
pub mod periodic;
pub mod plan_apply;
pub mod raft;
pub mod rpc;
pub mod rpc_client;
pub mod scheduler;
pub mod server;
pub mod state_store;
pub mod structs;
pub mod worker;

#[doc(hidden)]
pub mod test_util;
