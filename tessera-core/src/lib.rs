//! Tessera Core - Strongly-typed primitives for the Tessera client.
//!
//! This crate provides the vocabulary shared by every other Tessera crate:
//! row keys and table names, region descriptors and server addresses, the
//! error kinds the connection core classifies failures into, and the retry
//! limits that bound every loop in the client.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Strongly-typed keys**: a `RowKey` is not a `TableName` is not a
//!   region name
//! - **Explicit limits**: every retry loop and cache has a bounded maximum
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod key;
mod limits;
mod region;

pub use error::{Error, NetworkErrorKind, Result};
pub use key::{RowKey, TableName, META_TABLE_NAME, ROOT_TABLE_NAME};
pub use limits::{
    backoff_multiplier, CONNECTIONS_CACHED_MAX, DEFAULT_CLIENT_PAUSE_MS, DEFAULT_CLIENT_RETRIES,
    DEFAULT_META_SCAN_BATCH, DEFAULT_PREFETCH_LIMIT, DEFAULT_QUORUM_RECONNECTS_MAX,
    DEFAULT_RPC_TIMEOUT_MS, RETRY_BACKOFF,
};
pub use region::{
    decode_region_name, probe_region_name, region_name_for, RegionInfo, RegionLocation,
    ServerAddress, TableDescriptor,
};
