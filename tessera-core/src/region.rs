//! Region descriptors, server addresses, and region-name encoding.
//!
//! A region is a contiguous, half-open `[start_key, end_key)` slice of one
//! table, hosted by exactly one shard server at a time. Region names embed
//! `table,start_key,creation-id` so that the catalog tables, which are
//! keyed by region name, sort regions of the same table by start key.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::key::{RowKey, TableName};

/// Sentinel creation id used in probe keys for closest-row-before lookups.
///
/// Real creation ids are zero-padded to the same width, so a probe for
/// `(table, row)` sorts strictly after every real region name whose start
/// key equals `row`, and the predecessor lookup lands on the covering
/// region.
const PROBE_ID_SENTINEL: &str = "99999999999999";

/// Width real creation ids are zero-padded to in region names.
const REGION_ID_WIDTH: usize = PROBE_ID_SENTINEL.len();

/// The address of a cluster process, serialized as `host:port`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerAddress {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddress {
    /// Creates an address from host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server({}:{})", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or(Error::InvalidArgument {
            name: "address",
            reason: "expected host:port",
        })?;
        if host.is_empty() {
            return Err(Error::InvalidArgument {
                name: "address",
                reason: "host cannot be empty",
            });
        }
        let port = port.parse::<u16>().map_err(|_| Error::InvalidArgument {
            name: "address",
            reason: "port is not a valid u16",
        })?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Schema-level description of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    /// The table name.
    pub name: TableName,
    /// Column family names.
    pub families: Vec<String>,
}

impl TableDescriptor {
    /// Creates a descriptor with no column families.
    #[must_use]
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            families: Vec::new(),
        }
    }

    /// Adds a column family.
    #[must_use]
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.families.push(family.into());
        self
    }

    /// The built-in descriptor of the root catalog table.
    #[must_use]
    pub fn root() -> Self {
        Self::new(TableName::root()).with_family("region")
    }

    /// The built-in descriptor of the meta catalog table.
    #[must_use]
    pub fn meta() -> Self {
        Self::new(TableName::meta()).with_family("region")
    }
}

/// Immutable descriptor of a region at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Unique binary name: `table,start_key,creation-id`.
    region_name: Bytes,
    /// The table this region belongs to.
    table: TableName,
    /// Inclusive start of the key range.
    start_key: RowKey,
    /// Exclusive end of the key range; empty means "+infinity".
    end_key: RowKey,
    /// Creation id, unique within the table.
    region_id: u64,
    /// True once the region has been taken out of service.
    offline: bool,
    /// True once the region has been split into daughters.
    split: bool,
    /// Short opaque id derived from the region name.
    encoded_name: String,
}

impl RegionInfo {
    /// Creates a region descriptor.
    #[must_use]
    pub fn new(table: TableName, start_key: RowKey, end_key: RowKey, region_id: u64) -> Self {
        let region_name = region_name_for(&table, &start_key, region_id);
        let encoded_name = format!("{:016x}", xxh3_64(&region_name));
        Self {
            region_name,
            table,
            start_key,
            end_key,
            region_id,
            offline: false,
            split: false,
            encoded_name,
        }
    }

    /// The root catalog region. There is exactly one, covering the whole
    /// key space of `sys.root`.
    #[must_use]
    pub fn root() -> Self {
        Self::new(TableName::root(), RowKey::empty(), RowKey::empty(), 0)
    }

    /// Marks the region offline.
    #[must_use]
    pub const fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Marks the region split.
    #[must_use]
    pub const fn with_split(mut self, split: bool) -> Self {
        self.split = split;
        self
    }

    /// The unique binary region name.
    #[must_use]
    pub fn region_name(&self) -> &Bytes {
        &self.region_name
    }

    /// The table this region belongs to.
    #[must_use]
    pub const fn table(&self) -> &TableName {
        &self.table
    }

    /// Inclusive start key.
    #[must_use]
    pub const fn start_key(&self) -> &RowKey {
        &self.start_key
    }

    /// Exclusive end key; empty means "+infinity".
    #[must_use]
    pub const fn end_key(&self) -> &RowKey {
        &self.end_key
    }

    /// Creation id.
    #[must_use]
    pub const fn region_id(&self) -> u64 {
        self.region_id
    }

    /// True once the region has been taken out of service.
    #[must_use]
    pub const fn is_offline(&self) -> bool {
        self.offline
    }

    /// True once the region has been split into daughters.
    #[must_use]
    pub const fn is_split(&self) -> bool {
        self.split
    }

    /// Short opaque id derived from the region name.
    #[must_use]
    pub fn encoded_name(&self) -> &str {
        &self.encoded_name
    }

    /// Returns true if the half-open key range covers `row`.
    #[must_use]
    pub fn contains(&self, row: &RowKey) -> bool {
        *row >= self.start_key && (self.end_key.is_empty() || *row < self.end_key)
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{:0width$}",
            self.table,
            self.start_key,
            self.region_id,
            width = REGION_ID_WIDTH
        )
    }
}

/// A region and the server currently hosting it.
///
/// Transient: any region movement or server death makes a location stale.
/// Staleness is recovered by retry, not prevented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLocation {
    region: Arc<RegionInfo>,
    server: ServerAddress,
}

impl RegionLocation {
    /// Creates a location binding a region to a server.
    #[must_use]
    pub fn new(region: Arc<RegionInfo>, server: ServerAddress) -> Self {
        Self { region, server }
    }

    /// The region descriptor.
    #[must_use]
    pub fn region(&self) -> &Arc<RegionInfo> {
        &self.region
    }

    /// The server hosting the region.
    #[must_use]
    pub const fn server(&self) -> &ServerAddress {
        &self.server
    }
}

impl fmt::Display for RegionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.region, self.server)
    }
}

/// Encodes a region name: `table,start_key,creation-id` with the id
/// zero-padded to a fixed width so probe keys sort above real names.
#[must_use]
pub fn region_name_for(table: &TableName, start_key: &RowKey, region_id: u64) -> Bytes {
    let mut name = Vec::with_capacity(table.as_str().len() + start_key.as_bytes().len() + 16);
    name.extend_from_slice(table.as_str().as_bytes());
    name.push(b',');
    name.extend_from_slice(start_key.as_bytes());
    name.push(b',');
    name.extend_from_slice(format!("{region_id:0width$}", width = REGION_ID_WIDTH).as_bytes());
    Bytes::from(name)
}

/// Builds the probe key used for closest-row-before lookups against a
/// catalog region: the region name a region of `table` starting exactly at
/// `row` would sort just below.
#[must_use]
pub fn probe_region_name(table: &TableName, row: &RowKey) -> RowKey {
    let mut name = Vec::with_capacity(table.as_str().len() + row.as_bytes().len() + 16);
    name.extend_from_slice(table.as_str().as_bytes());
    name.push(b',');
    name.extend_from_slice(row.as_bytes());
    name.push(b',');
    name.extend_from_slice(PROBE_ID_SENTINEL.as_bytes());
    RowKey::new(name)
}

/// Decodes a region name back into its table and start key.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` if the name is not of the
/// `table,start_key,creation-id` form.
pub fn decode_region_name(name: &[u8]) -> Result<(TableName, RowKey)> {
    let first = name
        .iter()
        .position(|&b| b == b',')
        .ok_or(Error::InvalidArgument {
            name: "region_name",
            reason: "missing table delimiter",
        })?;
    let last = name
        .iter()
        .rposition(|&b| b == b',')
        .ok_or(Error::InvalidArgument {
            name: "region_name",
            reason: "missing id delimiter",
        })?;
    if last <= first {
        return Err(Error::InvalidArgument {
            name: "region_name",
            reason: "missing start key segment",
        });
    }
    let table = std::str::from_utf8(&name[..first]).map_err(|_| Error::InvalidArgument {
        name: "region_name",
        reason: "table segment is not utf-8",
    })?;
    if table.is_empty() {
        return Err(Error::InvalidArgument {
            name: "region_name",
            reason: "table segment is empty",
        });
    }
    let start_key = RowKey::from(&name[first + 1..last]);
    Ok((TableName::new(table), start_key))
}
