//! Row keys and table names.
//!
//! A row key is an opaque, lexicographically ordered byte sequence. The
//! empty key is overloaded the way the cluster overloads it: it is both the
//! minimum key (the first region's start) and the past-the-end sentinel (an
//! empty end key means "to +infinity").

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Name of the root catalog table. Its single region indexes the meta
/// regions and is the only region discovered via the coordination quorum.
pub const ROOT_TABLE_NAME: &str = "sys.root";

/// Name of the meta catalog table. Its rows are the region descriptors of
/// every user table.
pub const META_TABLE_NAME: &str = "sys.meta";

/// An opaque, ordered row key.
///
/// Comparison is bytewise lexicographic. Cloning is cheap (`Bytes` is
/// reference-counted).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RowKey(Bytes);

impl RowKey {
    /// Creates a row key from raw bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The empty key: minimum row, and the "+infinity" end sentinel.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Returns true if this is the empty key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw bytes of the key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the underlying shared buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Returns the smallest key strictly greater than this one.
    ///
    /// Used to continue a forward scan past a row that has already been
    /// seen.
    #[must_use]
    pub fn successor(&self) -> Self {
        let mut next = Vec::with_capacity(self.0.len() + 1);
        next.extend_from_slice(&self.0);
        next.push(0);
        Self(Bytes::from(next))
    }
}

impl From<&[u8]> for RowKey {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for RowKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl Borrow<[u8]> for RowKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key(")?;
        write_escaped(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.0)
    }
}

/// Writes bytes as printable ASCII, escaping the rest as `\xNN`.
fn write_escaped(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            write!(f, "{}", b as char)?;
        } else {
            write!(f, "\\x{b:02x}")?;
        }
    }
    Ok(())
}

/// The name of a table.
///
/// Table names may not contain `,` (the region-name delimiter) and may not
/// be empty. The two catalog tables have reserved names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName(Arc<str>);

impl TableName {
    /// Creates a table name.
    ///
    /// # Panics
    ///
    /// Panics if the name is empty or contains `,`.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        assert!(!name.is_empty(), "table name cannot be empty");
        assert!(!name.contains(','), "table name cannot contain ','");
        Self(Arc::from(name))
    }

    /// The root catalog table.
    #[must_use]
    pub fn root() -> Self {
        Self(Arc::from(ROOT_TABLE_NAME))
    }

    /// The meta catalog table.
    #[must_use]
    pub fn meta() -> Self {
        Self(Arc::from(META_TABLE_NAME))
    }

    /// Returns true for the root catalog table.
    #[must_use]
    pub fn is_root(&self) -> bool {
        &*self.0 == ROOT_TABLE_NAME
    }

    /// Returns true for the meta catalog table.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        &*self.0 == META_TABLE_NAME
    }

    /// Returns true for either catalog table.
    #[must_use]
    pub fn is_catalog(&self) -> bool {
        self.is_root() || self.is_meta()
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table({})", self.0)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
