//! Tessera RPC - Remote interfaces of the cluster, as capability traits.
//!
//! The wire codec is an external collaborator: this crate defines WHAT the
//! client needs from a shard server, the master, and the coordination
//! quorum, as `async` traits an implementation may satisfy in any way
//! (generated client stub, hand-written codec, in-memory mock). It also
//! provides the proxy registry that caches one stub per server address.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Capability traits at the seams**: production and simulated
//!   transports are interchangeable
//! - **Explicit limits**: stubs carry the configured per-RPC deadline
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod message;
mod registry;
mod service;

pub use message::{
    Cell, Delete, Get, IndexedOp, MetaRow, MultiAction, MultiResponse, Mutation, Put, RegionOps,
    RegionOutcome, RegionResult, RowOp, RowResult,
};
pub use registry::ProxyRegistry;
pub use service::{
    MasterService, QuorumClient, QuorumConnector, SessionEvent, ShardService, StubFactory,
};
