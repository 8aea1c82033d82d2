//! In-memory mock cluster for integration tests.
//!
//! One `MockCluster` plays the quorum, the master, and every shard server
//! at once. Tests script region layouts, moves, partial failures, and
//! server death, then drive a real `Connection` against it.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use tessera_client::{ClientConfig, ClusterBindings, Connection};
use tessera_core::{
    Error, NetworkErrorKind, RegionInfo, Result, RowKey, ServerAddress, TableDescriptor, TableName,
};
use tessera_rpc::{
    Cell, Delete, Get, MasterService, MetaRow, MultiAction, MultiResponse, Mutation, Put,
    QuorumClient, QuorumConnector, RegionOutcome, RegionResult, RowResult, SessionEvent,
    ShardService, StubFactory,
};

/// Per-method RPC counters, keyed by server where useful.
#[derive(Default)]
pub struct Counters {
    pub root_closest: AtomicUsize,
    pub meta_closest: AtomicUsize,
    pub meta_scans: AtomicUsize,
    pub region_info_calls: AtomicUsize,
    pub master_probes: AtomicUsize,
    pub quorum_master_reads: AtomicUsize,
    pub quorum_root_reads: AtomicUsize,
    pub quorum_connects: AtomicUsize,
    pub get_rows_by_server: Mutex<HashMap<ServerAddress, usize>>,
    pub multi_actions_by_server: Mutex<HashMap<ServerAddress, usize>>,
}

impl Counters {
    pub fn get_rows_on(&self, server: &str) -> usize {
        let addr: ServerAddress = server.parse().unwrap();
        *self.get_rows_by_server.lock().unwrap().get(&addr).unwrap_or(&0)
    }

    pub fn multi_actions_on(&self, server: &str) -> usize {
        let addr: ServerAddress = server.parse().unwrap();
        *self
            .multi_actions_by_server
            .lock()
            .unwrap()
            .get(&addr)
            .unwrap_or(&0)
    }

    fn bump(map: &Mutex<HashMap<ServerAddress, usize>>, addr: &ServerAddress) {
        *map.lock().unwrap().entry(addr.clone()).or_insert(0) += 1;
    }
}

struct ClusterState {
    /// Rows of each catalog region, keyed by the catalog region's name.
    catalog: Mutex<HashMap<Bytes, BTreeMap<RowKey, MetaRow>>>,
    /// Every region's descriptor.
    regions: Mutex<HashMap<Bytes, RegionInfo>>,
    /// Which server serves which region.
    assignments: Mutex<HashMap<Bytes, ServerAddress>>,
    /// User data, keyed by region name.
    data: Mutex<HashMap<Bytes, BTreeMap<RowKey, Vec<Cell>>>>,
    /// Servers that refuse every call.
    dead: Mutex<HashSet<ServerAddress>>,
    /// One-shot injected failures per server, popped per call.
    injected: Mutex<HashMap<ServerAddress, VecDeque<Error>>>,
    /// One-shot partial-apply override per region (mutations only).
    partial_mutations: Mutex<HashMap<Bytes, usize>>,
    /// One-shot short-response override per region (gets only).
    partial_gets: Mutex<HashMap<Bytes, usize>>,
    /// Known user tables (for the master).
    tables: Mutex<Vec<TableDescriptor>>,

    master_addr: Mutex<Option<ServerAddress>>,
    root_addr: Mutex<Option<ServerAddress>>,
    /// Quorum master reads answering `None` before the address appears.
    master_hidden_reads: AtomicUsize,
    master_running: AtomicBool,

    event_senders: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    next_region_id: AtomicUsize,
    pub counters: Counters,
}

pub struct MockCluster {
    state: Arc<ClusterState>,
    root_region_name: Bytes,
    meta_region_name: Bytes,
}

pub const ROOT_SERVER: &str = "root-1:8020";
pub const META_SERVER: &str = "meta-1:8020";
pub const MASTER: &str = "master-1:6000";

impl MockCluster {
    /// A cluster with the root region on `ROOT_SERVER`, one meta region
    /// covering everything on `META_SERVER`, and a live master.
    pub fn new() -> Self {
        let state = Arc::new(ClusterState {
            catalog: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
            data: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            injected: Mutex::new(HashMap::new()),
            partial_mutations: Mutex::new(HashMap::new()),
            partial_gets: Mutex::new(HashMap::new()),
            tables: Mutex::new(Vec::new()),
            master_addr: Mutex::new(Some(MASTER.parse().unwrap())),
            root_addr: Mutex::new(Some(ROOT_SERVER.parse().unwrap())),
            master_hidden_reads: AtomicUsize::new(0),
            master_running: AtomicBool::new(true),
            event_senders: Mutex::new(Vec::new()),
            next_region_id: AtomicUsize::new(100),
            counters: Counters::default(),
        });

        let root_region = RegionInfo::root();
        let root_region_name = root_region.region_name().clone();
        let meta_region = RegionInfo::new(TableName::meta(), RowKey::empty(), RowKey::empty(), 1);
        let meta_region_name = meta_region.region_name().clone();

        {
            let mut catalog = state.catalog.lock().unwrap();
            catalog.insert(root_region_name.clone(), BTreeMap::new());
            catalog.insert(meta_region_name.clone(), BTreeMap::new());
            // The root region's one row: the meta region.
            catalog.get_mut(&root_region_name).unwrap().insert(
                RowKey::new(meta_region_name.clone()),
                MetaRow {
                    row_key: RowKey::new(meta_region_name.clone()),
                    region: Some(meta_region.clone()),
                    server: Some(META_SERVER.parse().unwrap()),
                },
            );

            let mut regions = state.regions.lock().unwrap();
            regions.insert(root_region_name.clone(), root_region);
            regions.insert(meta_region_name.clone(), meta_region);

            let mut assignments = state.assignments.lock().unwrap();
            assignments.insert(root_region_name.clone(), ROOT_SERVER.parse().unwrap());
            assignments.insert(meta_region_name.clone(), META_SERVER.parse().unwrap());
        }

        Self {
            state,
            root_region_name,
            meta_region_name,
        }
    }

    pub fn bindings(&self) -> ClusterBindings {
        ClusterBindings::new(
            Arc::new(MockFactory {
                state: Arc::clone(&self.state),
            }),
            Arc::new(MockConnector {
                state: Arc::clone(&self.state),
            }),
        )
    }

    /// A connection with test-speed timing against this cluster.
    pub fn connect(&self) -> Connection {
        Connection::open(
            ClientConfig::fast_for_testing("mock-quorum:2181"),
            &self.bindings(),
        )
        .unwrap()
    }

    pub fn connect_with(&self, config: ClientConfig) -> Connection {
        Connection::open(config, &self.bindings()).unwrap()
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }

    // -- region scripting ------------------------------------------------

    /// Registers a user region and its catalog row; returns the region
    /// name.
    pub fn add_user_region(&self, table: &str, start: &str, end: &str, server: &str) -> Bytes {
        self.add_user_region_inner(table, start, end, server, false)
    }

    pub fn add_offline_region(&self, table: &str, start: &str, end: &str, server: &str) -> Bytes {
        self.add_user_region_inner(table, start, end, server, true)
    }

    fn add_user_region_inner(
        &self,
        table: &str,
        start: &str,
        end: &str,
        server: &str,
        offline: bool,
    ) -> Bytes {
        let table_name = TableName::new(table);
        let id = self.state.next_region_id.fetch_add(1, Ordering::SeqCst) as u64;
        let region = RegionInfo::new(
            table_name.clone(),
            RowKey::from(start),
            RowKey::from(end),
            id,
        )
        .with_offline(offline);
        let name = region.region_name().clone();
        let addr: ServerAddress = server.parse().unwrap();

        self.state
            .regions
            .lock()
            .unwrap()
            .insert(name.clone(), region.clone());
        self.state
            .assignments
            .lock()
            .unwrap()
            .insert(name.clone(), addr.clone());
        self.state
            .catalog
            .lock()
            .unwrap()
            .get_mut(&self.meta_region_name)
            .unwrap()
            .insert(
                RowKey::new(name.clone()),
                MetaRow {
                    row_key: RowKey::new(name.clone()),
                    region: Some(region),
                    server: Some(addr),
                },
            );

        let mut tables = self.state.tables.lock().unwrap();
        if !tables.iter().any(|t| t.name == table_name) {
            tables.push(TableDescriptor::new(table_name).with_family("d"));
        }
        name
    }

    /// Registers a catalog row whose server column is empty.
    pub fn add_unassigned_region(&self, table: &str, start: &str, end: &str) -> Bytes {
        let name = self.add_user_region(table, start, end, "unassigned:1");
        self.state
            .assignments
            .lock()
            .unwrap()
            .remove(&name);
        self.state
            .catalog
            .lock()
            .unwrap()
            .get_mut(&self.meta_region_name)
            .unwrap()
            .get_mut(&RowKey::new(name.clone()))
            .unwrap()
            .server = None;
        name
    }

    /// Reassigns a region to another server, updating its catalog row.
    pub fn move_region(&self, region_name: &Bytes, new_server: &str) {
        let addr: ServerAddress = new_server.parse().unwrap();
        self.state
            .assignments
            .lock()
            .unwrap()
            .insert(region_name.clone(), addr.clone());
        let mut catalog = self.state.catalog.lock().unwrap();
        for rows in catalog.values_mut() {
            if let Some(row) = rows.get_mut(&RowKey::new(region_name.clone())) {
                row.server = Some(addr.clone());
            }
        }
    }

    /// Removes only the catalog row; the region stays assigned and keeps
    /// answering for its name, like a split parent mid-transition.
    pub fn remove_catalog_row(&self, region_name: &Bytes) {
        let mut catalog = self.state.catalog.lock().unwrap();
        for rows in catalog.values_mut() {
            rows.remove(&RowKey::new(region_name.clone()));
        }
    }

    /// Drops a region's catalog row and assignment (e.g. the parent of a
    /// split).
    pub fn remove_region(&self, region_name: &Bytes) {
        self.state.assignments.lock().unwrap().remove(region_name);
        self.state.regions.lock().unwrap().remove(region_name);
        let mut catalog = self.state.catalog.lock().unwrap();
        for rows in catalog.values_mut() {
            rows.remove(&RowKey::new(region_name.clone()));
        }
    }

    /// Every call to this server now fails with connect-refused.
    pub fn kill_server(&self, server: &str) {
        self.state
            .dead
            .lock()
            .unwrap()
            .insert(server.parse().unwrap());
    }

    /// The next `applied` override for one region's mutations (one-shot).
    pub fn set_partial_mutations(&self, region_name: &Bytes, applied: usize) {
        self.state
            .partial_mutations
            .lock()
            .unwrap()
            .insert(region_name.clone(), applied);
    }

    /// The next get response for one region answers only the first
    /// `returned` rows (one-shot).
    pub fn set_partial_gets(&self, region_name: &Bytes, returned: usize) {
        self.state
            .partial_gets
            .lock()
            .unwrap()
            .insert(region_name.clone(), returned);
    }

    /// Queues an error returned by this server's next call.
    pub fn inject_error(&self, server: &str, error: Error) {
        self.state
            .injected
            .lock()
            .unwrap()
            .entry(server.parse().unwrap())
            .or_default()
            .push_back(error);
    }

    /// Seeds one data cell directly into a region.
    pub fn put_row(&self, region_name: &Bytes, row: &str, column: &str, value: &str) {
        self.state
            .data
            .lock()
            .unwrap()
            .entry(region_name.clone())
            .or_default()
            .insert(
                RowKey::from(row),
                vec![Cell::new(column, value.as_bytes().to_vec())],
            );
    }

    pub fn read_row(&self, region_name: &Bytes, row: &str) -> Option<Vec<Cell>> {
        self.state
            .data
            .lock()
            .unwrap()
            .get(region_name)
            .and_then(|rows| rows.get(&RowKey::from(row)))
            .cloned()
    }

    // -- quorum and master scripting -------------------------------------

    /// The next `reads` quorum master reads answer `None`.
    pub fn hide_master_for(&self, reads: usize) {
        self.state.master_hidden_reads.store(reads, Ordering::SeqCst);
    }

    pub fn set_master_running(&self, running: bool) {
        self.state.master_running.store(running, Ordering::SeqCst);
    }

    /// Fires a session-expired event at the most recent session.
    pub async fn expire_session(&self) {
        let sender = self
            .state
            .event_senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no quorum session to expire");
        sender.send(SessionEvent::Expired).await.unwrap();
    }

    pub fn quorum_connects(&self) -> usize {
        self.state.counters.quorum_connects.load(Ordering::SeqCst)
    }
}

// -----------------------------------------------------------------------
// Shard stubs
// -----------------------------------------------------------------------

struct MockShard {
    addr: ServerAddress,
    state: Arc<ClusterState>,
}

impl MockShard {
    fn check_reachable(&self) -> Result<()> {
        if self.state.dead.lock().unwrap().contains(&self.addr) {
            return Err(Error::io(
                NetworkErrorKind::ConnectionRefused,
                format!("connect to {} refused", self.addr),
            ));
        }
        if let Some(queue) = self.state.injected.lock().unwrap().get_mut(&self.addr) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn check_serving(&self, region_name: &Bytes) -> Result<()> {
        let assignments = self.state.assignments.lock().unwrap();
        match assignments.get(region_name) {
            Some(addr) if *addr == self.addr => Ok(()),
            _ => Err(Error::RegionNotServing {
                region: String::from_utf8_lossy(region_name).into_owned(),
            }),
        }
    }

    fn is_root_region(&self, region_name: &Bytes) -> bool {
        self.state
            .regions
            .lock()
            .unwrap()
            .get(region_name)
            .is_some_and(|r| r.table().is_root())
    }

    fn apply_get(&self, region_name: &Bytes, get: &Get) -> Option<RowResult> {
        self.state
            .data
            .lock()
            .unwrap()
            .get(region_name)
            .and_then(|rows| rows.get(&get.row))
            .map(|cells| RowResult::new(get.row.clone(), cells.clone()))
    }

    fn apply_mutation(&self, region_name: &Bytes, mutation: &Mutation) {
        let mut data = self.state.data.lock().unwrap();
        let rows = data.entry(region_name.clone()).or_default();
        match mutation {
            Mutation::Put(put) => {
                rows.insert(put.row.clone(), put.cells.clone());
            }
            Mutation::Delete(delete) => {
                rows.remove(&delete.row);
            }
        }
    }
}

#[async_trait]
impl ShardService for MockShard {
    async fn region_info(&self, region_name: &Bytes) -> Result<RegionInfo> {
        self.check_reachable()?;
        self.state
            .counters
            .region_info_calls
            .fetch_add(1, Ordering::SeqCst);
        self.check_serving(region_name)?;
        Ok(self
            .state
            .regions
            .lock()
            .unwrap()
            .get(region_name)
            .cloned()
            .expect("serving an unknown region"))
    }

    async fn closest_row_before(
        &self,
        region_name: &Bytes,
        probe: &RowKey,
    ) -> Result<Option<MetaRow>> {
        self.check_reachable()?;
        if self.is_root_region(region_name) {
            self.state
                .counters
                .root_closest
                .fetch_add(1, Ordering::SeqCst);
        } else {
            self.state
                .counters
                .meta_closest
                .fetch_add(1, Ordering::SeqCst);
        }
        self.check_serving(region_name)?;
        let catalog = self.state.catalog.lock().unwrap();
        let rows = catalog.get(region_name).expect("catalog region");
        Ok(rows
            .range(..=probe.clone())
            .next_back()
            .map(|(_, row)| row.clone()))
    }

    async fn scan_meta_rows(
        &self,
        region_name: &Bytes,
        start: &RowKey,
        limit: usize,
    ) -> Result<Vec<MetaRow>> {
        self.check_reachable()?;
        self.state.counters.meta_scans.fetch_add(1, Ordering::SeqCst);
        self.check_serving(region_name)?;
        let catalog = self.state.catalog.lock().unwrap();
        let rows = catalog.get(region_name).expect("catalog region");
        Ok(rows
            .range(start.clone()..)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn multi_action(&self, action: MultiAction) -> Result<MultiResponse> {
        Counters::bump(&self.state.counters.multi_actions_by_server, &self.addr);
        self.check_reachable()?;
        let mut response = MultiResponse::default();
        for group in action.regions {
            if let Err(e) = self.check_serving(&group.region_name) {
                response.regions.push(RegionOutcome {
                    region_name: group.region_name,
                    result: Err(e),
                });
                continue;
            }

            let partial = self
                .state
                .partial_mutations
                .lock()
                .unwrap()
                .remove(&group.region_name);
            let short_gets = self
                .state
                .partial_gets
                .lock()
                .unwrap()
                .remove(&group.region_name);

            let mut gets: Vec<Option<RowResult>> = Vec::new();
            let mut is_gets = false;
            let mut applied = 0usize;
            for (position, item) in group.ops.iter().enumerate() {
                match &item.op {
                    tessera_rpc::RowOp::Get(get) => {
                        is_gets = true;
                        if short_gets.map_or(true, |limit| gets.len() < limit) {
                            gets.push(self.apply_get(&group.region_name, get));
                        }
                    }
                    tessera_rpc::RowOp::Mutate(mutation) => {
                        if let Some(limit) = partial {
                            if position >= limit {
                                continue;
                            }
                        }
                        self.apply_mutation(&group.region_name, mutation);
                        applied += 1;
                    }
                }
            }
            let result = if is_gets {
                RegionResult::Gets(gets)
            } else {
                RegionResult::Mutations { applied }
            };
            response.regions.push(RegionOutcome {
                region_name: group.region_name,
                result: Ok(result),
            });
        }
        Ok(response)
    }

    async fn get_rows(
        &self,
        region_name: &Bytes,
        gets: Vec<Get>,
    ) -> Result<Vec<Option<RowResult>>> {
        Counters::bump(&self.state.counters.get_rows_by_server, &self.addr);
        self.check_reachable()?;
        self.check_serving(region_name)?;
        Ok(gets
            .iter()
            .map(|get| self.apply_get(region_name, get))
            .collect())
    }

    async fn put_rows(&self, region_name: &Bytes, puts: Vec<Put>) -> Result<usize> {
        self.check_reachable()?;
        self.check_serving(region_name)?;
        let count = puts.len();
        for put in puts {
            self.apply_mutation(region_name, &Mutation::Put(put));
        }
        Ok(count)
    }

    async fn delete_rows(&self, region_name: &Bytes, deletes: Vec<Delete>) -> Result<usize> {
        self.check_reachable()?;
        self.check_serving(region_name)?;
        let count = deletes.len();
        for delete in deletes {
            self.apply_mutation(region_name, &Mutation::Delete(delete));
        }
        Ok(count)
    }

    async fn mutate_row(&self, region_name: &Bytes, mutations: Vec<Mutation>) -> Result<()> {
        self.check_reachable()?;
        self.check_serving(region_name)?;
        for mutation in &mutations {
            self.apply_mutation(region_name, mutation);
        }
        Ok(())
    }

    async fn regions_assignment(&self) -> Result<Vec<RegionInfo>> {
        self.check_reachable()?;
        let assignments = self.state.assignments.lock().unwrap();
        let regions = self.state.regions.lock().unwrap();
        Ok(assignments
            .iter()
            .filter(|(_, addr)| **addr == self.addr)
            .filter_map(|(name, _)| regions.get(name).cloned())
            .collect())
    }
}

// -----------------------------------------------------------------------
// Master, quorum, factory
// -----------------------------------------------------------------------

struct MockMaster {
    state: Arc<ClusterState>,
}

#[async_trait]
impl MasterService for MockMaster {
    async fn is_master_running(&self) -> Result<bool> {
        self.state
            .counters
            .master_probes
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.state.master_running.load(Ordering::SeqCst))
    }

    async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        Ok(self.state.tables.lock().unwrap().clone())
    }

    async fn table_descriptor(&self, table: &TableName) -> Result<TableDescriptor> {
        self.state
            .tables
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.name == *table)
            .cloned()
            .ok_or_else(|| Error::TableNotFound {
                table: table.clone(),
            })
    }
}

struct MockQuorumClient {
    state: Arc<ClusterState>,
}

#[async_trait]
impl QuorumClient for MockQuorumClient {
    async fn read_master_address(&self) -> Result<Option<ServerAddress>> {
        self.state
            .counters
            .quorum_master_reads
            .fetch_add(1, Ordering::SeqCst);
        let hidden = self.state.master_hidden_reads.load(Ordering::SeqCst);
        if hidden > 0 {
            self.state
                .master_hidden_reads
                .store(hidden - 1, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(self.state.master_addr.lock().unwrap().clone())
    }

    async fn read_root_region_address(&self) -> Result<Option<ServerAddress>> {
        self.state
            .counters
            .quorum_root_reads
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.state.root_addr.lock().unwrap().clone())
    }
}

struct MockConnector {
    state: Arc<ClusterState>,
}

#[async_trait]
impl QuorumConnector for MockConnector {
    async fn connect(&self) -> Result<(Arc<dyn QuorumClient>, mpsc::Receiver<SessionEvent>)> {
        self.state
            .counters
            .quorum_connects
            .fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        self.state.event_senders.lock().unwrap().push(tx);
        Ok((
            Arc::new(MockQuorumClient {
                state: Arc::clone(&self.state),
            }),
            rx,
        ))
    }
}

/// A single-row read driven through the retry machinery, for tests.
pub struct GetRowOp {
    pub table: TableName,
    pub row: RowKey,
}

impl GetRowOp {
    pub fn new(table: &str, row: &str) -> Self {
        Self {
            table: TableName::new(table),
            row: RowKey::from(row),
        }
    }
}

#[async_trait]
impl tessera_client::ServerOp for GetRowOp {
    type Output = Option<RowResult>;

    fn table(&self) -> &TableName {
        &self.table
    }

    fn row(&self) -> &RowKey {
        &self.row
    }

    async fn call(
        &mut self,
        shard: Arc<dyn ShardService>,
        location: &tessera_core::RegionLocation,
    ) -> Result<Option<RowResult>> {
        let mut rows = shard
            .get_rows(
                location.region().region_name(),
                vec![Get::new(self.row.clone())],
            )
            .await?;
        Ok(rows.pop().flatten())
    }
}

struct MockFactory {
    state: Arc<ClusterState>,
}

#[async_trait]
impl StubFactory for MockFactory {
    async fn shard_stub(
        &self,
        addr: &ServerAddress,
        _rpc_timeout: Duration,
    ) -> Result<Arc<dyn ShardService>> {
        Ok(Arc::new(MockShard {
            addr: addr.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn master_stub(
        &self,
        _addr: &ServerAddress,
        _rpc_timeout: Duration,
    ) -> Result<Arc<dyn MasterService>> {
        Ok(Arc::new(MockMaster {
            state: Arc::clone(&self.state),
        }))
    }
}
