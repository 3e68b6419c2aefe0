//! The consensus engines (C2-C6): transport-agnostic Raft and Paxos
//! implementations plus the transaction engine and node runtime that
//! drive them. Nothing in this crate touches a socket — see
//! `concord-node` for that.

#[macro_use]
extern crate slog;

pub mod engine;
pub mod log;
pub mod message;
pub mod paxos;
pub mod raft;
pub mod runtime;
pub mod transaction;

pub use concord_core::clock;
