//! Region-location cache.
//!
//! Per-table ordered maps from region start key to the region's current
//! location, plus the reverse index of servers that may appear as a value.
//! One mutex guards both structures; every call into the cache is short
//! and never blocks on a remote call, so the single lock is cheap next to
//! the O(ms) RPCs around it.
//!
//! The `known_servers` set upholds one guarantee: a server absent from the
//! set has no cache entry mapping to it. Presence only means "likely has
//! entries", which is all `drop_server` needs for its short-circuit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use tessera_core::{RegionLocation, RowKey, ServerAddress, TableName};

/// Both cache structures, guarded together.
#[derive(Default)]
struct CacheInner {
    /// table -> start key -> location. Start keys are strictly increasing
    /// and regions non-overlapping within a table.
    tables: HashMap<TableName, BTreeMap<RowKey, RegionLocation>>,
    /// Every server that may appear as a value in `tables`.
    servers: HashSet<ServerAddress>,
}

/// The per-cluster region-location cache.
#[derive(Default)]
pub struct LocationCache {
    inner: Mutex<CacheInner>,
}

impl LocationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached location whose half-open range covers `row`, or
    /// `None` on a miss.
    ///
    /// Finds the greatest start key not exceeding `row`, then verifies
    /// `row` is below the end key (an empty end key is "+infinity").
    #[must_use]
    pub fn lookup(&self, table: &TableName, row: &RowKey) -> Option<RegionLocation> {
        let inner = self.inner.lock().expect("cache lock");
        let locations = inner.tables.get(table)?;
        locations
            .range(..=row.clone())
            .next_back()
            .filter(|(_, loc)| {
                let end = loc.region().end_key();
                end.is_empty() || row < end
            })
            .map(|(_, loc)| loc.clone())
    }

    /// Inserts a location, overwriting any entry with the same start key,
    /// and records its server. Idempotent.
    pub fn insert(&self, table: &TableName, location: RegionLocation) {
        let start_key = location.region().start_key().clone();
        let mut inner = self.inner.lock().expect("cache lock");
        inner.servers.insert(location.server().clone());
        let previous = inner
            .tables
            .entry(table.clone())
            .or_default()
            .insert(start_key, location.clone());
        drop(inner);
        if previous.is_none() {
            debug!(location = %location, "Cached region location");
        }
    }

    /// Removes the entry covering `row`, but only if its server matches
    /// `expected_server`. Passing `None` forces the removal.
    ///
    /// The check keeps a delayed invalidation from undoing a fresher fix
    /// installed by a peer task.
    pub fn invalidate(
        &self,
        table: &TableName,
        row: &RowKey,
        expected_server: Option<&ServerAddress>,
    ) {
        let mut inner = self.inner.lock().expect("cache lock");
        let Some(locations) = inner.tables.get_mut(table) else {
            return;
        };
        let Some((start_key, location)) = locations
            .range(..=row.clone())
            .next_back()
            .filter(|(_, loc)| {
                let end = loc.region().end_key();
                end.is_empty() || row < end
            })
            .map(|(k, loc)| (k.clone(), loc.clone()))
        else {
            return;
        };

        if let Some(expected) = expected_server {
            // Somebody else already cleared and repopulated this entry.
            if expected != location.server() {
                return;
            }
        }

        locations.remove(&start_key);
        drop(inner);
        debug!(location = %location, row = %row, "Invalidated cached region location");
    }

    /// Removes every entry mapping to `server` and forgets the server.
    ///
    /// Short-circuits when the server was never recorded, which by the
    /// `known_servers` guarantee means no entry can map to it.
    pub fn drop_server(&self, server: &ServerAddress) {
        let mut inner = self.inner.lock().expect("cache lock");
        if !inner.servers.contains(server) {
            return;
        }
        let mut dropped = 0usize;
        for locations in inner.tables.values_mut() {
            let before = locations.len();
            locations.retain(|_, loc| loc.server() != server);
            dropped += before - locations.len();
        }
        inner.servers.remove(server);
        drop(inner);
        debug!(server = %server, dropped, "Dropped all cached locations for server");
    }

    /// Empties the cache entirely.
    pub fn drop_all(&self) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.tables.clear();
        inner.servers.clear();
    }

    /// Removes every entry of one table.
    pub fn drop_table(&self, table: &TableName) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.tables.remove(table);
    }

    /// Returns true if a server is recorded as possibly having entries.
    #[must_use]
    pub fn knows_server(&self, server: &ServerAddress) -> bool {
        self.inner.lock().expect("cache lock").servers.contains(server)
    }

    /// Number of cached locations for one table.
    #[must_use]
    pub fn cached_region_count(&self, table: &TableName) -> usize {
        self.inner
            .lock()
            .expect("cache lock")
            .tables
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if some cached region covers `row`.
    #[must_use]
    pub fn is_region_cached(&self, table: &TableName, row: &RowKey) -> bool {
        self.lookup(table, row).is_some()
    }

    /// Number of entries mapping to `server`, across all tables.
    #[must_use]
    pub fn entries_for_server(&self, server: &ServerAddress) -> usize {
        let inner = self.inner.lock().expect("cache lock");
        inner
            .tables
            .values()
            .flat_map(BTreeMap::values)
            .filter(|loc| loc.server() == server)
            .count()
    }
}

impl std::fmt::Debug for LocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("cache lock");
        let entries: usize = inner.tables.values().map(BTreeMap::len).sum();
        f.debug_struct("LocationCache")
            .field("tables", &inner.tables.len())
            .field("entries", &entries)
            .field("servers", &inner.servers.len())
            .finish()
    }
}
