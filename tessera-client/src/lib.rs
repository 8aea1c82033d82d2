//! Tessera Client - The cluster connection core.
//!
//! This crate answers, for every client operation: *which server currently
//! hosts the region containing this row?* — and routes the call there,
//! tolerating moves, splits, server death, and transient failures. It owns
//! all shared mutable state between tasks of a client process: the region
//! location cache, the coordination-quorum session, the master proxy, and
//! the RPC stub pool.
//!
//! # Design
//!
//! - **Cache-first routing**: lookups hit the per-table ordered cache;
//!   misses resolve through the catalog regions (root via the quorum, meta
//!   via root, user regions via meta)
//! - **Staleness is recovered, not prevented**: a stale location fails the
//!   RPC, the failure invalidates exactly the stale state, and the retry
//!   re-resolves
//! - **Explicit limits**: every retry loop is bounded by a count or a
//!   deadline; the connection registry is a bounded LRU
//!
//! # Entry points
//!
//! [`Connection::open`] builds a standalone connection;
//! [`Connection::shared`] goes through the process-wide registry, one
//! connection per configuration fingerprint.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod batch;
mod cache;
mod config;
mod connection;
mod locator;
mod master;
mod meta;
mod quorum;
mod retry;

pub use cache::LocationCache;
pub use config::ClientConfig;
pub use connection::{shutdown_all, ClusterBindings, Connection};
pub use retry::ServerOp;
