//! Capability traits for the cluster's remote interfaces.
//!
//! Three remote parties exist: shard servers (data and region admin), the
//! master (schema and liveness), and the coordination quorum (bootstrap
//! addresses and session events). The client core only ever talks to them
//! through these traits; the `StubFactory` / `QuorumConnector` seams are
//! where a deployment plugs in its wire protocol, and where tests plug in
//! an in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use tessera_core::{
    RegionInfo, Result, RowKey, ServerAddress, TableDescriptor, TableName,
};

use crate::message::{Delete, Get, MetaRow, MultiAction, MultiResponse, Mutation, Put, RowResult};

/// Operations a shard server exposes to clients.
///
/// A stub is bound to one server address and carries the configured
/// per-RPC deadline; every method is one RPC.
#[async_trait]
pub trait ShardService: Send + Sync {
    /// Returns the descriptor of a region hosted by this server.
    ///
    /// Used as a liveness probe for the root region: a server that answers
    /// for the root region name is serving it.
    ///
    /// # Errors
    ///
    /// `RegionNotServing` if this server does not host the region; network
    /// kinds on connectivity failures.
    async fn region_info(&self, region_name: &Bytes) -> Result<RegionInfo>;

    /// Returns the catalog row with the greatest key not exceeding `probe`
    /// within the given catalog region, or `None` when the region has no
    /// row at or below the probe.
    ///
    /// # Errors
    ///
    /// `RegionNotServing` if this server does not host the region; network
    /// kinds on connectivity failures.
    async fn closest_row_before(&self, region_name: &Bytes, probe: &RowKey)
        -> Result<Option<MetaRow>>;

    /// Returns up to `limit` catalog rows with keys at or after `start`,
    /// ascending, from the given catalog region.
    ///
    /// # Errors
    ///
    /// `RegionNotServing` if this server does not host the region; network
    /// kinds on connectivity failures.
    async fn scan_meta_rows(
        &self,
        region_name: &Bytes,
        start: &RowKey,
        limit: usize,
    ) -> Result<Vec<MetaRow>>;

    /// Executes a heterogeneous batch of row operations grouped by region,
    /// returning one outcome per region.
    ///
    /// # Errors
    ///
    /// Network kinds when the whole call fails; per-region failures are
    /// reported inside the response instead.
    async fn multi_action(&self, action: MultiAction) -> Result<MultiResponse>;

    /// Reads rows from one region. One slot per get, `None` for absent
    /// rows.
    ///
    /// # Errors
    ///
    /// `RegionNotServing` if this server does not host the region; network
    /// kinds on connectivity failures.
    async fn get_rows(&self, region_name: &Bytes, gets: Vec<Get>)
        -> Result<Vec<Option<RowResult>>>;

    /// Applies puts to one region, returning how many were applied
    /// counting from the front of the list.
    ///
    /// # Errors
    ///
    /// `RegionNotServing` if this server does not host the region; network
    /// kinds on connectivity failures.
    async fn put_rows(&self, region_name: &Bytes, puts: Vec<Put>) -> Result<usize>;

    /// Applies deletes to one region, returning how many were applied
    /// counting from the front of the list.
    ///
    /// # Errors
    ///
    /// `RegionNotServing` if this server does not host the region; network
    /// kinds on connectivity failures.
    async fn delete_rows(&self, region_name: &Bytes, deletes: Vec<Delete>) -> Result<usize>;

    /// Applies a set of mutations to a single row atomically.
    ///
    /// # Errors
    ///
    /// `RegionNotServing` if this server does not host the region; network
    /// kinds on connectivity failures.
    async fn mutate_row(&self, region_name: &Bytes, mutations: Vec<Mutation>) -> Result<()>;

    /// Returns every region currently assigned to this server.
    ///
    /// # Errors
    ///
    /// Network kinds on connectivity failures.
    async fn regions_assignment(&self) -> Result<Vec<RegionInfo>>;
}

/// Operations the master exposes to clients.
#[async_trait]
pub trait MasterService: Send + Sync {
    /// Returns true if the master is up and serving.
    ///
    /// # Errors
    ///
    /// Network kinds on connectivity failures.
    async fn is_master_running(&self) -> Result<bool>;

    /// Lists every user table's descriptor.
    ///
    /// # Errors
    ///
    /// Network kinds on connectivity failures.
    async fn list_tables(&self) -> Result<Vec<TableDescriptor>>;

    /// Returns the descriptor of one table.
    ///
    /// # Errors
    ///
    /// `TableNotFound` if the table does not exist; network kinds on
    /// connectivity failures.
    async fn table_descriptor(&self, table: &TableName) -> Result<TableDescriptor>;
}

/// Events delivered by the coordination-service session thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session (re-)connected to the quorum.
    Connected,
    /// The quorum expired the session; it must be recreated.
    Expired,
}

/// Reads served by one coordination-service session.
#[async_trait]
pub trait QuorumClient: Send + Sync {
    /// Reads the currently published master address, if any.
    ///
    /// # Errors
    ///
    /// Network kinds when the quorum cannot be reached.
    async fn read_master_address(&self) -> Result<Option<ServerAddress>>;

    /// Reads the currently published root-region server address, if any.
    ///
    /// # Errors
    ///
    /// Network kinds when the quorum cannot be reached.
    async fn read_root_region_address(&self) -> Result<Option<ServerAddress>>;
}

/// Creates coordination-service sessions.
///
/// Each successful connect returns the client plus the receiver its
/// session events arrive on.
#[async_trait]
pub trait QuorumConnector: Send + Sync {
    /// Establishes a new session with the quorum.
    ///
    /// # Errors
    ///
    /// Network kinds when no quorum member can be reached.
    async fn connect(&self) -> Result<(Arc<dyn QuorumClient>, mpsc::Receiver<SessionEvent>)>;
}

/// Creates RPC stubs bound to a server address.
///
/// This is the deployment seam standing in for dynamic stub loading: a
/// concrete codec, a generated client, or an in-memory mock all satisfy
/// it.
#[async_trait]
pub trait StubFactory: Send + Sync {
    /// Creates a stub for a shard server.
    ///
    /// # Errors
    ///
    /// Network kinds when the stub cannot be constructed.
    async fn shard_stub(
        &self,
        addr: &ServerAddress,
        rpc_timeout: Duration,
    ) -> Result<Arc<dyn ShardService>>;

    /// Creates a stub for the master.
    ///
    /// # Errors
    ///
    /// Network kinds when the stub cannot be constructed.
    async fn master_stub(
        &self,
        addr: &ServerAddress,
        rpc_timeout: Duration,
    ) -> Result<Arc<dyn MasterService>>;
}
