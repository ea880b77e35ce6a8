//! migrad - hosting account migration and restore agent
//!
//! Turns a control-panel account backup into a reviewed restore plan and
//! applies it to the local host behind an approval gate.
//!
//! - `archive`: safe inspection and extraction of backup archives
//! - `plan`: backup parsing, structure mapping and conflict detection
//! - `job`: durable job records, state machine and approval tokens
//! - `services`: host collaborators the engine restores through
//! - `engine`: analysis, apply, rollback and the apply worker pool
//! - `agent`: the privileged request handler and its Unix socket
//! - `cli`: command-line entry points

pub mod agent;
pub mod archive;
pub mod cli;
pub mod config;
pub mod engine;
pub mod job;
pub mod observability;
pub mod plan;
pub mod services;
