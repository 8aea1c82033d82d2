//! Catalog (meta) table walking.
//!
//! A forward walk over the catalog rows of one table, batched by the
//! configured scan size and crossing catalog-region boundaries as needed.
//! The walk feeds a visitor; visitors stop the walk by returning false.

use tracing::debug;

use tessera_core::{region_name_for, Result, RowKey, TableName};
use tessera_rpc::MetaRow;

use crate::locator::Locator;

/// Walks the catalog rows describing `table`'s regions, in key order,
/// invoking `visit` for each row whose descriptor belongs to the table.
/// Rows with no descriptor are skipped; the first row of another table
/// ends the walk.
///
/// Each batch re-locates the covering catalog region, so the walk survives
/// catalog region moves: on a retryable scan failure the stale catalog
/// entry is invalidated and the batch retried with backoff.
pub(crate) async fn scan_table_regions<F>(
    locator: &Locator,
    table: &TableName,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(MetaRow) -> bool,
{
    let parent = if table.is_meta() {
        TableName::root()
    } else {
        TableName::meta()
    };
    let batch = locator.config().meta_scan_batch;
    let mut cursor = RowKey::new(region_name_for(table, &RowKey::empty(), 0));
    let mut tries: u32 = 0;

    loop {
        let parent_location = locator.locate(&parent, &cursor, true).await?;
        let stub = locator.proxies().shard(parent_location.server()).await?;
        let rows = match stub
            .scan_meta_rows(parent_location.region().region_name(), &cursor, batch)
            .await
        {
            Ok(rows) => rows,
            Err(e) if e.is_do_not_retry() => return Err(e),
            Err(e) => {
                tries += 1;
                if tries >= locator.config().num_retries {
                    return Err(e);
                }
                debug!(
                    tries,
                    error = %e,
                    "Catalog scan batch failed, re-resolving and retrying"
                );
                locator
                    .cache()
                    .invalidate(&parent, &cursor, Some(parent_location.server()));
                tokio::time::sleep(locator.config().backoff_pause(tries - 1)).await;
                continue;
            }
        };

        let fetched = rows.len();
        let mut last_key: Option<RowKey> = None;
        for meta_row in rows {
            last_key = Some(meta_row.row_key.clone());
            let belongs = match &meta_row.region {
                Some(region) if region.table() == table => true,
                // Walked past the table's regions.
                Some(_) => return Ok(()),
                // A row mid-update; skip it.
                None => false,
            };
            if belongs && !visit(meta_row) {
                return Ok(());
            }
        }

        if fetched >= batch {
            if let Some(last) = last_key {
                cursor = last.successor();
                continue;
            }
        }

        // This catalog region is exhausted; continue into the next one,
        // or finish at the end of the key space.
        let end = parent_location.region().end_key().clone();
        if end.is_empty() {
            return Ok(());
        }
        cursor = end;
    }
}
