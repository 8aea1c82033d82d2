//! The cluster connection and the process-wide connection registry.
//!
//! A `Connection` bundles everything one cluster needs: the location
//! cache, the quorum session, the master holder, the stub pool, and the
//! retry/batch drivers on top of them. Connections are cheap to clone
//! (one shared inner) and are usually obtained through
//! [`Connection::shared`], which keeps one connection per configuration
//! fingerprint in a bounded process-wide registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use once_cell::sync::Lazy;
use tracing::{error, info};

use tessera_core::{
    Error, RegionInfo, RegionLocation, Result, RowKey, ServerAddress, TableDescriptor, TableName,
    CONNECTIONS_CACHED_MAX,
};
use tessera_rpc::{
    Get, MasterService, Mutation, ProxyRegistry, QuorumConnector, RowResult, ShardService,
    StubFactory,
};

use crate::batch::BatchRunner;
use crate::cache::LocationCache;
use crate::config::ClientConfig;
use crate::locator::Locator;
use crate::master::MasterHolder;
use crate::meta;
use crate::quorum::QuorumSession;
use crate::retry::{DeadServers, OpRunner, ServerOp};

/// The deployment-provided seams a connection is built from: how to make
/// RPC stubs, and how to open coordination-quorum sessions.
#[derive(Clone)]
pub struct ClusterBindings {
    /// Creates RPC stubs bound to server addresses.
    pub stubs: Arc<dyn StubFactory>,
    /// Opens coordination-quorum sessions.
    pub quorum: Arc<dyn QuorumConnector>,
}

impl ClusterBindings {
    /// Creates bindings from the two factories.
    #[must_use]
    pub fn new(stubs: Arc<dyn StubFactory>, quorum: Arc<dyn QuorumConnector>) -> Self {
        Self { stubs, quorum }
    }
}

struct ConnectionInner {
    config: ClientConfig,
    cache: Arc<LocationCache>,
    proxies: Arc<ProxyRegistry>,
    quorum: QuorumSession,
    master: MasterHolder,
    runner: OpRunner,
    batch: BatchRunner,
    dead: Arc<DeadServers>,
    closed: AtomicBool,
}

/// A connection to one cluster.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Builds a standalone connection (no registry involvement).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the configuration fails validation.
    pub fn open(config: ClientConfig, bindings: &ClusterBindings) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(LocationCache::new());
        let proxies = Arc::new(ProxyRegistry::new(
            Arc::clone(&bindings.stubs),
            config.rpc_timeout,
        ));
        let quorum = QuorumSession::new(Arc::clone(&bindings.quorum), config.max_quorum_reconnects);
        let locator = Arc::new(Locator::new(
            config.clone(),
            Arc::clone(&cache),
            Arc::clone(&proxies),
            quorum.clone(),
        ));
        let master = MasterHolder::new(config.clone(), quorum.clone(), Arc::clone(&proxies));
        let dead = Arc::new(DeadServers::default());
        let runner = OpRunner {
            config: config.clone(),
            locator,
            cache: Arc::clone(&cache),
            proxies: Arc::clone(&proxies),
            dead: Arc::clone(&dead),
        };
        let batch = BatchRunner::new(runner.clone());

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                config,
                cache,
                proxies,
                quorum,
                master,
                runner,
                batch,
                dead,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the registry's connection for this configuration, creating
    /// it on first use. One connection per configuration fingerprint; the
    /// registry evicts (and closes) its least-recently-used entry past
    /// [`CONNECTIONS_CACHED_MAX`].
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` after [`shutdown_all`]; otherwise any `open`
    /// failure.
    pub async fn shared(config: ClientConfig, bindings: &ClusterBindings) -> Result<Self> {
        let key = config.fingerprint();
        let evicted;
        let connection;
        {
            let mut registry = CONNECTIONS.lock().expect("connection registry lock");
            if registry.shut_down {
                return Err(Error::ConnectionClosed);
            }
            registry.use_seq += 1;
            let seq = registry.use_seq;
            if let Some(entry) = registry.entries.get_mut(&key) {
                entry.last_used = seq;
                return Ok(entry.connection.clone());
            }
            connection = Self::open(config, bindings)?;
            registry.entries.insert(
                key,
                RegistryEntry {
                    connection: connection.clone(),
                    last_used: seq,
                },
            );
            evicted = registry.evict_if_over_capacity();
        }
        if let Some(old) = evicted {
            old.close().await;
        }
        Ok(connection)
    }

    /// The configuration this connection was built from.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Master
    // -------------------------------------------------------------------

    /// Returns true if a live master could be discovered.
    pub async fn is_master_running(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.inner.master.is_master_running().await
    }

    /// The shared master proxy for monitoring reads, kept alive by the
    /// connection.
    ///
    /// # Errors
    ///
    /// `MasterNotRunning` when discovery exhausts its budget.
    pub async fn keep_alive_master_monitor(&self) -> Result<Arc<dyn MasterService>> {
        self.ensure_open()?;
        self.inner.master.master().await
    }

    /// The shared master proxy for administrative calls, kept alive by
    /// the connection.
    ///
    /// # Errors
    ///
    /// `MasterNotRunning` when discovery exhausts its budget.
    pub async fn keep_alive_master_admin(&self) -> Result<Arc<dyn MasterService>> {
        self.ensure_open()?;
        self.inner.master.master().await
    }

    // -------------------------------------------------------------------
    // Tables
    // -------------------------------------------------------------------

    /// Lists every user table's descriptor, via the master.
    ///
    /// # Errors
    ///
    /// Master discovery or RPC failures.
    pub async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        self.ensure_open()?;
        let master = self.inner.master.master().await?;
        master.list_tables().await
    }

    /// Returns a table's descriptor. The catalog tables have built-in
    /// descriptors; everything else comes from the master.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the table does not exist.
    pub async fn table_descriptor(&self, table: &TableName) -> Result<TableDescriptor> {
        self.ensure_open()?;
        if table.is_root() {
            return Ok(TableDescriptor::root());
        }
        if table.is_meta() {
            return Ok(TableDescriptor::meta());
        }
        let master = self.inner.master.master().await?;
        master.table_descriptor(table).await
    }

    /// Counts a table's catalog rows and how many are offline.
    async fn table_region_counts(&self, table: &TableName) -> Result<(usize, usize)> {
        let mut scanned = 0usize;
        let mut offline = 0usize;
        meta::scan_table_regions(self.inner.runner.locator.as_ref(), table, |meta_row| {
            if let Some(region) = &meta_row.region {
                scanned += 1;
                if region.is_offline() {
                    offline += 1;
                }
            }
            true
        })
        .await?;
        Ok((scanned, offline))
    }

    /// Returns true if every region of the table is online.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the catalog has no rows for the table.
    pub async fn is_table_enabled(&self, table: &TableName) -> Result<bool> {
        self.ensure_open()?;
        if table.is_catalog() {
            // The catalog tables are always enabled.
            return Ok(true);
        }
        let (scanned, offline) = self.table_region_counts(table).await?;
        if scanned == 0 {
            return Err(Error::TableNotFound {
                table: table.clone(),
            });
        }
        Ok(offline == 0)
    }

    /// Returns true if every region of the table is offline.
    ///
    /// # Errors
    ///
    /// `TableNotFound` when the catalog has no rows for the table.
    pub async fn is_table_disabled(&self, table: &TableName) -> Result<bool> {
        self.ensure_open()?;
        if table.is_catalog() {
            return Ok(false);
        }
        let (scanned, offline) = self.table_region_counts(table).await?;
        if scanned == 0 {
            return Err(Error::TableNotFound {
                table: table.clone(),
            });
        }
        Ok(offline == scanned)
    }

    /// Returns true if every region of the table has an assigned server.
    pub async fn is_table_available(&self, table: &TableName) -> Result<bool> {
        self.ensure_open()?;
        if table.is_catalog() {
            return Ok(true);
        }
        let mut scanned = 0usize;
        let mut unassigned = 0usize;
        meta::scan_table_regions(self.inner.runner.locator.as_ref(), table, |meta_row| {
            if meta_row.region.is_some() {
                scanned += 1;
                if meta_row.server.is_none() {
                    unassigned += 1;
                }
            }
            true
        })
        .await?;
        Ok(scanned > 0 && unassigned == 0)
    }

    /// Like [`Self::is_table_available`], additionally requiring that
    /// every given split key is the start key of some region.
    pub async fn is_table_available_with_splits(
        &self,
        table: &TableName,
        split_keys: &[RowKey],
    ) -> Result<bool> {
        self.ensure_open()?;
        if table.is_catalog() {
            return Ok(true);
        }
        let mut scanned = 0usize;
        let mut unassigned = 0usize;
        let mut starts: Vec<RowKey> = Vec::new();
        meta::scan_table_regions(self.inner.runner.locator.as_ref(), table, |meta_row| {
            if let Some(region) = &meta_row.region {
                scanned += 1;
                if meta_row.server.is_none() {
                    unassigned += 1;
                }
                starts.push(region.start_key().clone());
            }
            true
        })
        .await?;
        if scanned == 0 || unassigned > 0 {
            return Ok(false);
        }
        Ok(split_keys
            .iter()
            .filter(|key| !key.is_empty())
            .all(|key| starts.contains(key)))
    }

    // -------------------------------------------------------------------
    // Region location
    // -------------------------------------------------------------------

    /// Resolves the region location covering `(table, row)`, cache first.
    ///
    /// # Errors
    ///
    /// `NoServerForRegion` after the retry budget, `TableNotFound`,
    /// `RegionOffline`, or any do-not-retry failure.
    pub async fn locate_region(&self, table: &TableName, row: &RowKey) -> Result<RegionLocation> {
        self.ensure_open()?;
        self.inner.runner.locator.locate(table, row, true).await
    }

    /// Re-resolves the region location covering `(table, row)`, evicting
    /// any cached entry first.
    ///
    /// # Errors
    ///
    /// As [`Self::locate_region`].
    pub async fn relocate_region(&self, table: &TableName, row: &RowKey) -> Result<RegionLocation> {
        self.ensure_open()?;
        self.inner.runner.locator.locate(table, row, false).await
    }

    /// Resolves a region by its binary name.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a malformed name; otherwise as
    /// [`Self::locate_region`].
    pub async fn locate_region_by_name(&self, region_name: &[u8]) -> Result<RegionLocation> {
        self.ensure_open()?;
        self.inner.runner.locator.locate_by_name(region_name).await
    }

    /// Lists every located region of a table in start-key order.
    ///
    /// # Errors
    ///
    /// Catalog walk failures.
    pub async fn locate_regions(&self, table: &TableName) -> Result<Vec<RegionLocation>> {
        self.locate_regions_opts(table, true, false).await
    }

    /// Lists a table's regions with explicit cache and offline handling.
    /// `use_cache = false` clears the table's cached entries first;
    /// `include_offlined` also reports regions that are offline.
    ///
    /// # Errors
    ///
    /// Catalog walk failures.
    pub async fn locate_regions_opts(
        &self,
        table: &TableName,
        use_cache: bool,
        include_offlined: bool,
    ) -> Result<Vec<RegionLocation>> {
        self.ensure_open()?;
        self.inner
            .runner
            .locator
            .locate_regions(table, use_cache, include_offlined)
            .await
    }

    /// Bulk-loads known region locations into the cache.
    pub fn prewarm_region_cache(
        &self,
        table: &TableName,
        regions: Vec<(RegionInfo, ServerAddress)>,
    ) {
        self.inner.runner.locator.prewarm(table, regions);
    }

    // -------------------------------------------------------------------
    // Cache control
    // -------------------------------------------------------------------

    /// Flushes the whole region cache, the separately held root location,
    /// and the dead-server list.
    pub fn clear_region_cache(&self) {
        self.inner.cache.drop_all();
        self.inner.runner.locator.unset_root_location();
        self.inner.dead.clear();
    }

    /// Flushes one table's cached locations.
    pub fn clear_region_cache_for_table(&self, table: &TableName) {
        self.inner.cache.drop_table(table);
    }

    /// Evicts one cached location, if it is still current.
    pub fn drop_cached_location(&self, location: &RegionLocation) {
        self.inner.cache.invalidate(
            location.region().table(),
            location.region().start_key(),
            Some(location.server()),
        );
    }

    /// Drops every cached location hosted by `server`.
    pub fn clear_caches(&self, server: &ServerAddress) {
        self.inner.cache.drop_server(server);
    }

    /// Returns true if `server` was declared dead by a connectivity
    /// failure and has not been cleared since.
    #[must_use]
    pub fn is_dead_server(&self, server: &ServerAddress) -> bool {
        self.inner.dead.contains(server)
    }

    /// Enables or disables region-cache prefetch for a table.
    pub fn set_region_cache_prefetch(&self, table: &TableName, enabled: bool) {
        self.inner
            .runner
            .locator
            .set_region_cache_prefetch(table, enabled);
    }

    /// Returns true when prefetch is enabled for the table (the default).
    #[must_use]
    pub fn region_cache_prefetch(&self, table: &TableName) -> bool {
        self.inner.runner.locator.region_cache_prefetch(table)
    }

    /// Number of cached locations for a table. Exposed for tests that
    /// verify prefetch behavior.
    #[must_use]
    pub fn cached_region_count(&self, table: &TableName) -> usize {
        self.inner.cache.cached_region_count(table)
    }

    /// Returns true if some cached region covers `(table, row)`. Exposed
    /// for tests that verify prefetch behavior.
    #[must_use]
    pub fn is_region_cached(&self, table: &TableName, row: &RowKey) -> bool {
        self.inner.cache.is_region_cached(table, row)
    }

    // -------------------------------------------------------------------
    // Proxies
    // -------------------------------------------------------------------

    /// The data-path stub for a shard server.
    ///
    /// # Errors
    ///
    /// Stub construction failures.
    pub async fn get_shard_client(&self, server: &ServerAddress) -> Result<Arc<dyn ShardService>> {
        self.ensure_open()?;
        self.inner.proxies.shard(server).await
    }

    /// The admin stub for a shard server.
    ///
    /// # Errors
    ///
    /// Stub construction failures.
    pub async fn get_shard_admin(&self, server: &ServerAddress) -> Result<Arc<dyn ShardService>> {
        self.get_shard_admin_checked(server, false).await
    }

    /// The admin stub for a shard server, optionally verifying first that
    /// a live master is known.
    ///
    /// # Errors
    ///
    /// `MasterNotRunning` when `check_master` is set and discovery fails;
    /// stub construction failures.
    pub async fn get_shard_admin_checked(
        &self,
        server: &ServerAddress,
        check_master: bool,
    ) -> Result<Arc<dyn ShardService>> {
        self.ensure_open()?;
        if check_master {
            let _ = self.inner.master.master().await?;
        }
        self.inner.proxies.shard(server).await
    }

    // -------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------

    /// Runs a server-addressed operation with the full retry policy.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` with the ordered failure trail; do-not-retry
    /// failures immediately.
    pub async fn with_retries<O: ServerOp>(&self, op: &mut O) -> Result<O::Output> {
        self.ensure_open()?;
        self.inner.runner.with_retries(op).await
    }

    /// Runs a server-addressed operation exactly once. A connectivity
    /// failure declares the target server dead and drops its cached
    /// entries.
    ///
    /// # Errors
    ///
    /// Whatever the single attempt produced.
    pub async fn without_retries<O: ServerOp>(&self, op: &mut O) -> Result<O::Output> {
        self.ensure_open()?;
        self.inner.runner.without_retries(op).await
    }

    /// Executes reads across servers in parallel. `results` must be the
    /// same length as `gets`; slots of items that ultimately failed are
    /// left `None`.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` when items remain unsatisfied after every
    /// round; do-not-retry failures immediately.
    pub async fn batch_gets(
        &self,
        gets: &[Get],
        table: &TableName,
        results: &mut [Option<RowResult>],
    ) -> Result<()> {
        self.ensure_open()?;
        self.inner.batch.batch_gets(gets, table, results).await
    }

    /// Executes mutations across servers in parallel. Items that could
    /// not be applied are appended to `failures`.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` when items remain unapplied after every round;
    /// do-not-retry failures immediately.
    pub async fn batch_mutations(
        &self,
        mutations: Vec<Mutation>,
        table: &TableName,
        failures: &mut Vec<Mutation>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .batch
            .batch_mutations(mutations, table, failures)
            .await
    }

    /// Applies each row's mutation set atomically, row by row, through
    /// the retry driver.
    ///
    /// # Errors
    ///
    /// The first row failure aborts the remainder.
    pub async fn batch_row_mutations(
        &self,
        rows: Vec<(RowKey, Vec<Mutation>)>,
        table: &TableName,
    ) -> Result<()> {
        self.ensure_open()?;
        for (row, mutations) in rows {
            let mut op = RowMutationsOp {
                table: table.clone(),
                row,
                mutations,
            };
            self.inner.runner.with_retries(&mut op).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    /// Returns true once the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes the connection: drops the cache, the stub pool, the master
    /// proxy, and the quorum session. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cache.drop_all();
        self.inner.proxies.clear();
        self.inner.master.reset().await;
        self.inner.quorum.close().await;
        info!("Closed cluster connection");
    }

    /// Logs a fatal condition and closes the connection.
    pub async fn abort(&self, message: &str, cause: Option<&Error>) {
        match cause {
            Some(cause) => error!(cause = %cause, "{message}"),
            None => error!("{message}"),
        }
        self.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

/// Atomic mutations for one row, driven through the retry loop.
struct RowMutationsOp {
    table: TableName,
    row: RowKey,
    mutations: Vec<Mutation>,
}

#[async_trait::async_trait]
impl ServerOp for RowMutationsOp {
    type Output = ();

    fn table(&self) -> &TableName {
        &self.table
    }

    fn row(&self) -> &RowKey {
        &self.row
    }

    async fn call(
        &mut self,
        shard: Arc<dyn ShardService>,
        location: &RegionLocation,
    ) -> Result<()> {
        shard
            .mutate_row(location.region().region_name(), self.mutations.clone())
            .await
    }
}

// -----------------------------------------------------------------------
// Process-wide registry
// -----------------------------------------------------------------------

struct RegistryEntry {
    connection: Connection,
    last_used: u64,
}

struct RegistryState {
    entries: HashMap<u64, RegistryEntry>,
    use_seq: u64,
    shut_down: bool,
}

impl RegistryState {
    /// Evicts the least-recently-used entry once over capacity, returning
    /// it for the caller to close outside the lock.
    fn evict_if_over_capacity(&mut self) -> Option<Connection> {
        if self.entries.len() <= CONNECTIONS_CACHED_MAX {
            return None;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| *key)?;
        self.entries
            .remove(&oldest)
            .map(|entry| entry.connection)
    }
}

static CONNECTIONS: Lazy<StdMutex<RegistryState>> = Lazy::new(|| {
    StdMutex::new(RegistryState {
        entries: HashMap::new(),
        use_seq: 0,
        shut_down: false,
    })
});

/// Closes every registered connection and bars new ones. The process-exit
/// counterpart of per-connection `close`.
pub async fn shutdown_all() {
    let drained: Vec<Connection> = {
        let mut registry = CONNECTIONS.lock().expect("connection registry lock");
        registry.shut_down = true;
        registry
            .entries
            .drain()
            .map(|(_, entry)| entry.connection)
            .collect()
    };
    for connection in drained {
        connection.close().await;
    }
    info!("Connection registry shut down");
}
