//! Core library for `agentctl`: a multi-tenant controller that owns a
//! population of long-lived interactive CLI subprocess sessions and
//! dispatches prompts into them over an RPC bridge.
//!
//! `main.rs` is thin glue: it loads a [`config::Config`] from disk, restores
//! a [`manager::SessionManager`] from the persisted state file, wires a
//! [`scheduler::Scheduler`] to it, and optionally serves the [`rpc`] bridge.
//! Everything here is the core the spec actually describes; none of it reads
//! a config file or a chat transport directly.

pub mod config;
pub mod driver;
pub mod error;
pub mod fingerprint;
pub mod manager;
pub mod matcher;
pub mod output;
pub mod persistence;
pub mod rpc;
pub mod scheduler;
pub mod session;
pub mod toolhelp;
