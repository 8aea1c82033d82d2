//! Region location resolution.
//!
//! Resolution is layered by table class. The root table's single region is
//! the only one discovered via the coordination quorum; meta regions are
//! found by a closest-row-before probe against the root region; user
//! regions by the same probe against the covering meta region. Every level
//! caches what it finds, and contending cache misses are serialized per
//! level so at most one discovery per level runs at a time in the process
//! (the losers re-check the cache after acquiring the lock).

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use tessera_core::{
    decode_region_name, probe_region_name, region_name_for, Error, RegionInfo, RegionLocation,
    Result, RowKey, ServerAddress, TableName,
};
use tessera_rpc::{ProxyRegistry, ShardService};

use crate::cache::LocationCache;
use crate::config::ClientConfig;
use crate::meta;
use crate::quorum::QuorumSession;

/// Resolves `(table, row)` to the region location covering the row.
pub(crate) struct Locator {
    config: ClientConfig,
    cache: Arc<LocationCache>,
    proxies: Arc<ProxyRegistry>,
    quorum: QuorumSession,
    /// The root region's location, stored apart from the per-table cache:
    /// it is the only location that comes from the quorum.
    root_location: StdMutex<Option<RegionLocation>>,
    /// Per-level discovery serialization.
    root_lock: Mutex<()>,
    meta_lock: Mutex<()>,
    user_lock: Mutex<()>,
    /// Tables whose region-cache prefetch is disabled.
    prefetch_disabled: StdMutex<HashSet<TableName>>,
}

impl Locator {
    pub(crate) fn new(
        config: ClientConfig,
        cache: Arc<LocationCache>,
        proxies: Arc<ProxyRegistry>,
        quorum: QuorumSession,
    ) -> Self {
        Self {
            config,
            cache,
            proxies,
            quorum,
            root_location: StdMutex::new(None),
            root_lock: Mutex::new(()),
            meta_lock: Mutex::new(()),
            user_lock: Mutex::new(()),
            prefetch_disabled: StdMutex::new(HashSet::new()),
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn cache(&self) -> &Arc<LocationCache> {
        &self.cache
    }

    pub(crate) fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    /// Resolves the region location covering `row`, consulting the cache
    /// first when `use_cache` is set. `use_cache = false` evicts any stale
    /// entry and re-resolves from the parent catalog.
    pub(crate) async fn locate(
        &self,
        table: &TableName,
        row: &RowKey,
        use_cache: bool,
    ) -> Result<RegionLocation> {
        if table.is_root() {
            self.locate_root(use_cache).await
        } else if table.is_meta() {
            self.locate_in_parent(&TableName::root(), table, row, use_cache, &self.meta_lock)
                .await
        } else {
            self.locate_in_parent(&TableName::meta(), table, row, use_cache, &self.user_lock)
                .await
        }
    }

    /// Type-erased `locate` for the recursion from a child level into its
    /// parent level.
    fn locate_boxed<'a>(
        &'a self,
        table: &'a TableName,
        row: &'a RowKey,
        use_cache: bool,
    ) -> Pin<Box<dyn Future<Output = Result<RegionLocation>> + Send + 'a>> {
        Box::pin(self.locate(table, row, use_cache))
    }

    /// Clears the separately held root location.
    pub(crate) fn unset_root_location(&self) {
        *self.root_location.lock().expect("root location lock") = None;
    }

    /// Root resolution: one lookup at a time; the second of two racing
    /// tasks finds the location the first one stored.
    async fn locate_root(&self, use_cache: bool) -> Result<RegionLocation> {
        let _serialize = self.root_lock.lock().await;
        if use_cache {
            let held = self.root_location.lock().expect("root location lock").clone();
            if let Some(location) = held {
                return Ok(location);
            }
        }
        let located = self.locate_root_via_quorum().await?;
        *self.root_location.lock().expect("root location lock") = Some(located.clone());
        Ok(located)
    }

    /// Repeatedly reads the root-region address from the quorum and
    /// verifies the server is actually serving the root region.
    async fn locate_root_via_quorum(&self) -> Result<RegionLocation> {
        for tries in 0..self.config.num_retries {
            // The address may not be published yet (cluster still
            // assigning catalog regions). Poll before giving this try up.
            let mut address = None;
            for _ in 0..self.config.num_retries {
                address = self.quorum.root_region_address().await?;
                if address.is_some() {
                    break;
                }
                debug!(
                    pause = ?self.config.backoff_pause(tries),
                    "Root region address not published yet, sleeping"
                );
                tokio::time::sleep(self.config.backoff_pause(tries)).await;
            }
            let Some(address) = address else {
                return Err(Error::NoServerForRegion {
                    message: "timed out waiting for the quorum to publish the root region".into(),
                });
            };

            match self.verify_root(&address).await {
                Ok(location) => {
                    debug!(address = %address, "Found root region");
                    return Ok(location);
                }
                Err(e) if e.is_do_not_retry() => return Err(e),
                Err(e) => {
                    if tries + 1 >= self.config.num_retries {
                        return Err(Error::NoServerForRegion {
                            message: format!("timed out locating the root region: {e}"),
                        });
                    }
                    debug!(error = %e, "Root region location changed, sleeping");
                    tokio::time::sleep(self.config.backoff_pause(tries)).await;
                }
            }
        }
        Err(Error::NoServerForRegion {
            message: "unable to locate the root region server".into(),
        })
    }

    /// Asks the server at `address` for the root region's descriptor; an
    /// answer proves it is serving the region.
    async fn verify_root(&self, address: &ServerAddress) -> Result<RegionLocation> {
        let stub = self.proxies.shard(address).await?;
        let root = RegionInfo::root();
        let info = stub.region_info(root.region_name()).await?;
        Ok(RegionLocation::new(Arc::new(info), address.clone()))
    }

    /// Searches a parent catalog region for the location covering
    /// `(table, row)`, retrying with backoff and re-resolving upward on
    /// failures that implicate the parent entry.
    async fn locate_in_parent(
        &self,
        parent: &TableName,
        table: &TableName,
        row: &RowKey,
        use_cache: bool,
        level_lock: &Mutex<()>,
    ) -> Result<RegionLocation> {
        if use_cache {
            if let Some(hit) = self.cache.lookup(table, row) {
                return Ok(hit);
            }
        }

        let probe = probe_region_name(table, row);
        let mut tries: u32 = 0;
        loop {
            if tries >= self.config.num_retries {
                return Err(Error::NoServerForRegion {
                    message: format!(
                        "unable to find region for row {row} in {table} after {tries} tries"
                    ),
                });
            }

            match self
                .probe_parent(parent, table, row, &probe, use_cache, level_lock)
                .await
            {
                Ok(location) => return Ok(location),
                Err(e) if e.is_do_not_retry() => return Err(e),
                Err(e) => {
                    if tries + 1 >= self.config.num_retries {
                        return Err(e);
                    }
                    debug!(
                        tries,
                        max = self.config.num_retries,
                        error = %e,
                        "Parent catalog lookup failed, retrying after sleep"
                    );
                    // These two kinds implicate the target region, not the
                    // parent entry used to find it.
                    if !matches!(
                        e,
                        Error::RegionOffline { .. } | Error::NoServerForRegion { .. }
                    ) {
                        self.invalidate_parent(parent, &probe);
                    }
                    tokio::time::sleep(self.config.backoff_pause(tries)).await;
                }
            }
            tries += 1;
        }
    }

    /// One closest-row-before probe against the parent catalog.
    async fn probe_parent(
        &self,
        parent: &TableName,
        table: &TableName,
        row: &RowKey,
        probe: &RowKey,
        use_cache: bool,
        level_lock: &Mutex<()>,
    ) -> Result<RegionLocation> {
        let parent_location = self.locate_boxed(parent, probe, true).await?;
        let stub = self.proxies.shard(parent_location.server()).await?;

        // One discovery per level at a time. The closest-row-before runs
        // under the lock so racing tasks coalesce onto one RPC.
        let level = level_lock.lock().await;

        if parent.is_meta() && self.region_cache_prefetch(table) {
            self.prefetch(&parent_location, stub.as_ref(), table, row)
                .await;
        }

        if use_cache {
            // A peer may have resolved this while we waited on the lock.
            if let Some(hit) = self.cache.lookup(table, row) {
                return Ok(hit);
            }
        } else {
            // Forced reload: make sure the stale entry cannot answer.
            self.cache.invalidate(table, row, None);
        }

        let meta_row = stub
            .closest_row_before(parent_location.region().region_name(), probe)
            .await?;
        drop(level);

        let Some(meta_row) = meta_row else {
            return Err(Error::TableNotFound {
                table: table.clone(),
            });
        };
        let Some(region) = meta_row.region else {
            return Err(Error::io(
                tessera_core::NetworkErrorKind::UnexpectedEof,
                format!(
                    "catalog row {} in {parent} carries no region descriptor",
                    meta_row.row_key
                ),
            ));
        };
        if region.table() != table {
            // Walked past the table's last region into a neighbor.
            return Err(Error::TableNotFound {
                table: table.clone(),
            });
        }
        if region.is_offline() {
            return Err(Error::RegionOffline {
                region: region.to_string(),
            });
        }
        let Some(server) = meta_row.server else {
            return Err(Error::NoServerForRegion {
                message: format!(
                    "no server address listed in {parent} for region {region} containing row {row}"
                ),
            });
        };

        let location = RegionLocation::new(Arc::new(region), server);
        self.cache.insert(table, location.clone());
        Ok(location)
    }

    /// Invalidates the parent catalog entry used to find `probe`, so the
    /// next attempt re-resolves upward.
    fn invalidate_parent(&self, parent: &TableName, probe: &RowKey) {
        if parent.is_root() {
            self.unset_root_location();
        } else {
            self.cache.invalidate(parent, probe, None);
        }
    }

    /// Reads up to the prefetch window of region descriptors following
    /// `(table, row)` from the covering meta region into the cache.
    ///
    /// Best-effort: failures are logged and swallowed; the closest-row-
    /// before that follows still resolves the requested row.
    async fn prefetch(
        &self,
        meta_location: &RegionLocation,
        stub: &dyn ShardService,
        table: &TableName,
        row: &RowKey,
    ) {
        let start = RowKey::new(region_name_for(table, row, 0));
        let scanned = stub
            .scan_meta_rows(
                meta_location.region().region_name(),
                &start,
                self.config.prefetch_limit,
            )
            .await;
        let rows = match scanned {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, table = %table, "Problems prefetching catalog rows");
                return;
            }
        };
        let mut cached = 0usize;
        for meta_row in rows {
            let Some(region) = meta_row.region else {
                continue;
            };
            // A row of another table, or an offline region, ends the
            // window.
            if region.table() != table || region.is_offline() {
                break;
            }
            let Some(server) = meta_row.server else {
                continue;
            };
            self.cache
                .insert(table, RegionLocation::new(Arc::new(region), server));
            cached += 1;
        }
        if cached > 0 {
            debug!(table = %table, cached, "Prefetched region locations");
        }
    }

    /// Lists every region of a table in start-key order, caching the
    /// located ones as it goes.
    pub(crate) async fn locate_regions(
        &self,
        table: &TableName,
        use_cache: bool,
        include_offlined: bool,
    ) -> Result<Vec<RegionLocation>> {
        if table.is_root() {
            return Ok(vec![self.locate_root(use_cache).await?]);
        }
        if !use_cache {
            self.cache.drop_table(table);
        }
        let mut locations = Vec::new();
        meta::scan_table_regions(self, table, |meta_row| {
            let Some(region) = meta_row.region else {
                return true;
            };
            if region.is_offline() && !include_offlined {
                return true;
            }
            // Rows with no assigned server have no location to report.
            let Some(server) = meta_row.server else {
                return true;
            };
            let location = RegionLocation::new(Arc::new(region), server);
            if !location.region().is_offline() {
                self.cache.insert(table, location.clone());
            }
            locations.push(location);
            true
        })
        .await?;
        Ok(locations)
    }

    /// Resolves a region by its name: decode the table and start key out
    /// of the name, then locate normally.
    pub(crate) async fn locate_by_name(&self, region_name: &[u8]) -> Result<RegionLocation> {
        let (table, start_key) = decode_region_name(region_name)?;
        self.locate(&table, &start_key, true).await
    }

    /// Bulk-inserts known locations, e.g. from a saved region map.
    pub(crate) fn prewarm(&self, table: &TableName, regions: Vec<(RegionInfo, ServerAddress)>) {
        for (region, server) in regions {
            self.cache
                .insert(table, RegionLocation::new(Arc::new(region), server));
        }
    }

    /// Enables or disables region-cache prefetch for a table.
    pub(crate) fn set_region_cache_prefetch(&self, table: &TableName, enabled: bool) {
        let mut disabled = self.prefetch_disabled.lock().expect("prefetch lock");
        if enabled {
            disabled.remove(table);
        } else {
            disabled.insert(table.clone());
        }
    }

    /// Returns true when prefetch is enabled for the table (the default).
    pub(crate) fn region_cache_prefetch(&self, table: &TableName) -> bool {
        !self
            .prefetch_disabled
            .lock()
            .expect("prefetch lock")
            .contains(table)
    }
}

impl std::fmt::Debug for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locator")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
