//! Wire-level request and response types.
//!
//! These are the shapes the client hands to a stub; how they are encoded
//! on the wire is the stub's business. The batch types keep the original
//! index of every row operation so partial results can be placed back at
//! the caller's positions after any number of retry rounds.

use bytes::Bytes;

use tessera_core::{RegionInfo, RowKey, ServerAddress};

/// One row of a catalog (root or meta) region.
///
/// A catalog row is keyed by a region name and carries the region's
/// descriptor plus the address of the server currently hosting it. Either
/// column may be absent mid-transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRow {
    /// The catalog row key (a region name).
    pub row_key: RowKey,
    /// The region descriptor, when present.
    pub region: Option<RegionInfo>,
    /// The hosting server, when one is assigned.
    pub server: Option<ServerAddress>,
}

/// A single column cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Column name, `family:qualifier`.
    pub column: String,
    /// Cell value.
    pub value: Bytes,
}

impl Cell {
    /// Creates a cell.
    #[must_use]
    pub fn new(column: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// A read of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Get {
    /// The row to read.
    pub row: RowKey,
    /// Columns to fetch; empty means every column.
    pub columns: Vec<String>,
}

impl Get {
    /// Creates a whole-row read.
    #[must_use]
    pub fn new(row: impl Into<RowKey>) -> Self {
        Self {
            row: row.into(),
            columns: Vec::new(),
        }
    }

    /// Restricts the read to a column.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self
    }
}

/// A write of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Put {
    /// The row to write.
    pub row: RowKey,
    /// Cells to write.
    pub cells: Vec<Cell>,
}

impl Put {
    /// Creates an empty put for a row.
    #[must_use]
    pub fn new(row: impl Into<RowKey>) -> Self {
        Self {
            row: row.into(),
            cells: Vec::new(),
        }
    }

    /// Adds a cell to write.
    #[must_use]
    pub fn with_cell(mut self, column: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.cells.push(Cell::new(column, value));
        self
    }
}

/// A delete of one row, or of some of its columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    /// The row to delete from.
    pub row: RowKey,
    /// Columns to delete; empty means the whole row.
    pub columns: Vec<String>,
}

impl Delete {
    /// Creates a whole-row delete.
    #[must_use]
    pub fn new(row: impl Into<RowKey>) -> Self {
        Self {
            row: row.into(),
            columns: Vec::new(),
        }
    }

    /// Restricts the delete to a column.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self
    }
}

/// A write or delete of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Write the given cells.
    Put(Put),
    /// Delete columns, or the whole row.
    Delete(Delete),
}

impl Mutation {
    /// Creates a put of one cell.
    #[must_use]
    pub fn put(row: impl Into<RowKey>, column: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::Put(Put::new(row).with_cell(column, value))
    }

    /// Creates a whole-row delete.
    #[must_use]
    pub fn delete(row: impl Into<RowKey>) -> Self {
        Self::Delete(Delete::new(row))
    }

    /// The row this mutation applies to.
    #[must_use]
    pub const fn row(&self) -> &RowKey {
        match self {
            Self::Put(put) => &put.row,
            Self::Delete(delete) => &delete.row,
        }
    }
}

/// The cells of one fetched row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowResult {
    /// The row key.
    pub row: RowKey,
    /// The fetched cells.
    pub cells: Vec<Cell>,
}

impl RowResult {
    /// Creates a row result.
    #[must_use]
    pub const fn new(row: RowKey, cells: Vec<Cell>) -> Self {
        Self { row, cells }
    }

    /// Returns the value of a column, if present.
    #[must_use]
    pub fn value(&self, column: &str) -> Option<&Bytes> {
        self.cells
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
    }
}

/// One row operation inside a batch.
#[derive(Debug, Clone)]
pub enum RowOp {
    /// A read.
    Get(Get),
    /// A write or delete.
    Mutate(Mutation),
}

impl RowOp {
    /// The row this operation targets.
    #[must_use]
    pub const fn row(&self) -> &RowKey {
        match self {
            Self::Get(get) => &get.row,
            Self::Mutate(mutation) => mutation.row(),
        }
    }
}

/// A row operation tagged with its position in the caller's list.
#[derive(Debug, Clone)]
pub struct IndexedOp {
    /// Position in the caller's original list.
    pub index: usize,
    /// The operation.
    pub op: RowOp,
}

/// The operations a batch round sends to one region.
#[derive(Debug, Clone, Default)]
pub struct RegionOps {
    /// The target region's name.
    pub region_name: Bytes,
    /// Operations for rows in that region, in submission order.
    pub ops: Vec<IndexedOp>,
}

/// Everything a batch round sends to one server: operations grouped by
/// region, each keeping its original index.
#[derive(Debug, Clone, Default)]
pub struct MultiAction {
    /// Per-region operation groups.
    pub regions: Vec<RegionOps>,
}

impl MultiAction {
    /// Adds an operation for a region, creating the group on first use.
    pub fn add(&mut self, region_name: &Bytes, index: usize, op: RowOp) {
        if let Some(group) = self
            .regions
            .iter_mut()
            .find(|g| g.region_name == *region_name)
        {
            group.ops.push(IndexedOp { index, op });
            return;
        }
        self.regions.push(RegionOps {
            region_name: region_name.clone(),
            ops: vec![IndexedOp { index, op }],
        });
    }

    /// Total operation count across all regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.iter().map(|g| g.ops.len()).sum()
    }

    /// Returns true if no operations have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Per-region outcome of a `MultiAction`.
#[derive(Debug)]
pub struct RegionOutcome {
    /// The region this outcome is for.
    pub region_name: Bytes,
    /// The result, or the failure that stopped the region's operations.
    pub result: tessera_core::Result<RegionResult>,
}

/// The successful part of a region's outcome.
#[derive(Debug, Clone)]
pub enum RegionResult {
    /// Fetched rows, one slot per submitted get, in submission order.
    Gets(Vec<Option<RowResult>>),
    /// How many mutations were applied, counting from the front of the
    /// submitted list. `applied < submitted` means the tail failed.
    Mutations {
        /// Count of applied mutations.
        applied: usize,
    },
}

/// Response to a `MultiAction`: one outcome per region.
#[derive(Debug, Default)]
pub struct MultiResponse {
    /// Per-region outcomes.
    pub regions: Vec<RegionOutcome>,
}

impl MultiResponse {
    /// Returns the outcome for a region, if the server reported one.
    #[must_use]
    pub fn region(&self, region_name: &Bytes) -> Option<&RegionOutcome> {
        self.regions.iter().find(|o| o.region_name == *region_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_action_groups_by_region() {
        let region_a = Bytes::from_static(b"users,a,00000000000001");
        let region_m = Bytes::from_static(b"users,m,00000000000002");

        let mut action = MultiAction::default();
        action.add(&region_a, 0, RowOp::Get(Get::new("alice")));
        action.add(&region_m, 1, RowOp::Get(Get::new("mallory")));
        action.add(&region_a, 2, RowOp::Get(Get::new("bob")));

        assert_eq!(action.regions.len(), 2);
        assert_eq!(action.len(), 3);

        let group = &action.regions[0];
        assert_eq!(group.region_name, region_a);
        assert_eq!(group.ops.len(), 2);
        assert_eq!(group.ops[0].index, 0);
        assert_eq!(group.ops[1].index, 2);
    }

    #[test]
    fn test_mutation_row_accessor() {
        let put = Mutation::put("alice", "d:name", "Alice");
        let delete = Mutation::delete("bob");

        assert_eq!(put.row(), &RowKey::from("alice"));
        assert_eq!(delete.row(), &RowKey::from("bob"));
    }

    #[test]
    fn test_row_result_column_lookup() {
        let result = RowResult::new(
            RowKey::from("alice"),
            vec![Cell::new("d:name", "Alice"), Cell::new("d:age", "30")],
        );

        assert_eq!(result.value("d:age").unwrap().as_ref(), b"30");
        assert!(result.value("d:missing").is_none());
    }
}
