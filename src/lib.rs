//! # Replis
//!
//! A RESP2 in-memory key/value server with leader/follower replication,
//! built from scratch in Rust.
//!
//! A process runs either as a master, accepting client commands and
//! fanning writes out to its replicas, or as a replica that performs
//! the PSYNC handshake against its master, applies the propagated write
//! stream, and serves its own reads. No existing Redis or RESP libraries
//! are used.

pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod replication;
pub mod resp;
pub mod server;
pub mod store;
pub mod trie;
