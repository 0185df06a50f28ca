//! Thread-per-core in-memory key/value cache speaking the memcache
//! ASCII protocol.
//!
//! Each worker thread owns a disjoint shard of the key space and a
//! disjoint slice of memory: one epoll reactor, one log-structured
//! memory shard, and its own listening socket (reuseport balancing
//! keeps connections sticky to a core). A command whose key hashes to
//! another core travels there as a descriptor over the wait-free SPSC
//! mesh and its reply travels back the same way; nothing is ever locked
//! across cores.

#[macro_use]
extern crate log;

mod buffer;
mod command;
mod config;
mod hash;
mod pool;
mod protocol;
mod server;

pub use crate::config::Config;
pub use crate::pool::{serve, spawn};
