//! Multi-row batch fan-out.
//!
//! A batch round splits the working list by located server, dispatches one
//! `multi_action` per server in parallel, then gathers partial results:
//! fully applied items leave the working list, everything else is requeued
//! for the next round after the stale cache entries are invalidated.
//! Rounds repeat until the list drains or the retry budget is spent.

use std::collections::HashMap;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use tessera_core::{Error, Result, RowKey, ServerAddress, TableName};
use tessera_rpc::{
    Get, IndexedOp, MultiAction, MultiResponse, Mutation, RegionResult, RowOp, RowResult,
};

use crate::retry::OpRunner;

/// Outcome of one server's dispatch in one round.
struct ServerOutcome {
    server: ServerAddress,
    action: MultiAction,
    response: Result<MultiResponse>,
}

/// Runs batched reads and mutations on top of an [`OpRunner`].
pub(crate) struct BatchRunner {
    runner: OpRunner,
}

impl BatchRunner {
    pub(crate) const fn new(runner: OpRunner) -> Self {
        Self { runner }
    }

    /// Executes a list of reads, placing each fetched row at its original
    /// index in `results`. Slots of items that ultimately failed are left
    /// `None`.
    ///
    /// `results` must be the same length as `gets`.
    pub(crate) async fn batch_gets(
        &self,
        gets: &[Get],
        table: &TableName,
        results: &mut [Option<RowResult>],
    ) -> Result<()> {
        if results.len() != gets.len() {
            return Err(Error::InvalidArgument {
                name: "results",
                reason: "results must be the same length as the get list",
            });
        }
        let working = gets
            .iter()
            .enumerate()
            .map(|(index, get)| IndexedOp {
                index,
                op: RowOp::Get(get.clone()),
            })
            .collect();

        let leftover = self
            .run_rounds(table, working, &mut |index, row| results[index] = row)
            .await?;
        if leftover.is_empty() {
            Ok(())
        } else {
            Err(Error::RetriesExhausted {
                tries: self.runner.config.num_retries,
                trail: vec![Error::NoServerForRegion {
                    message: format!(
                        "{} get operations remained unsatisfied in {table}",
                        leftover.len()
                    ),
                }],
            })
        }
    }

    /// Executes a list of mutations. Items that could not be applied after
    /// every round are appended to `failures`, and the call errors.
    pub(crate) async fn batch_mutations(
        &self,
        mutations: Vec<Mutation>,
        table: &TableName,
        failures: &mut Vec<Mutation>,
    ) -> Result<()> {
        let working = mutations
            .into_iter()
            .enumerate()
            .map(|(index, mutation)| IndexedOp {
                index,
                op: RowOp::Mutate(mutation),
            })
            .collect();

        let mut leftover = self.run_rounds(table, working, &mut |_, _| {}).await?;
        if leftover.is_empty() {
            return Ok(());
        }
        // Report failures in the caller's original order.
        leftover.sort_by_key(|item| item.index);
        let count = leftover.len();
        failures.extend(leftover.into_iter().filter_map(|item| match item.op {
            RowOp::Mutate(mutation) => Some(mutation),
            RowOp::Get(_) => None,
        }));
        Err(Error::RetriesExhausted {
            tries: self.runner.config.num_retries,
            trail: vec![Error::NoServerForRegion {
                message: format!("{count} mutations remained unapplied in {table}"),
            }],
        })
    }

    /// The round loop shared by reads and mutations.
    async fn run_rounds(
        &self,
        table: &TableName,
        mut working: Vec<IndexedOp>,
        place: &mut dyn FnMut(usize, Option<RowResult>),
    ) -> Result<Vec<IndexedOp>> {
        for tries in 0..self.runner.config.num_retries {
            if working.is_empty() {
                break;
            }
            // No sleep before the first retry: the region likely just
            // moved and the re-resolve already fixed it.
            if tries >= 2 {
                let pause = self.runner.config.backoff_pause(tries);
                debug!(tries, pause = ?pause, "Batch round sleeping before retry");
                tokio::time::sleep(pause).await;
            }

            let by_server = self.split(table, &working).await?;
            let outcomes = self.dispatch(by_server).await;
            working = self.gather(table, outcomes, place)?;
        }
        Ok(working)
    }

    /// Groups the working list by the server hosting each row's region.
    async fn split(
        &self,
        table: &TableName,
        working: &[IndexedOp],
    ) -> Result<HashMap<ServerAddress, MultiAction>> {
        let mut by_server: HashMap<ServerAddress, MultiAction> = HashMap::new();
        for item in working {
            let location = self.runner.locator.locate(table, item.op.row(), true).await?;
            by_server
                .entry(location.server().clone())
                .or_default()
                .add(
                    location.region().region_name(),
                    item.index,
                    item.op.clone(),
                );
        }
        Ok(by_server)
    }

    /// Dispatches one `multi_action` per server. A single-server round
    /// runs inline in the caller's task; otherwise each server gets its
    /// own task and the round awaits them all.
    async fn dispatch(&self, by_server: HashMap<ServerAddress, MultiAction>) -> Vec<ServerOutcome> {
        if by_server.len() == 1 {
            let mut outcomes = Vec::with_capacity(1);
            for (server, action) in by_server {
                let response = self
                    .runner
                    .call_server(&server, |shard| {
                        let request = action.clone();
                        async move { shard.multi_action(request).await }
                    })
                    .await;
                outcomes.push(ServerOutcome {
                    server,
                    action,
                    response,
                });
            }
            return outcomes;
        }

        let mut handles = Vec::with_capacity(by_server.len());
        for (server, action) in by_server {
            let runner = self.runner.clone();
            let request = action.clone();
            let addr = server.clone();
            let handle = tokio::spawn(async move {
                runner
                    .call_server(&addr, |shard| async move {
                        shard.multi_action(request).await
                    })
                    .await
            });
            handles.push((server, action, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let joined = join_all(handles.into_iter().map(|(server, action, handle)| async move {
            let response = match handle.await {
                Ok(response) => response,
                // The task was cancelled or panicked out from under us.
                Err(_) => Err(Error::Interrupted),
            };
            ServerOutcome {
                server,
                action,
                response,
            }
        }))
        .await;
        outcomes.extend(joined);
        outcomes
    }

    /// Walks every server's outcome, placing results and building the next
    /// round's working list from whatever failed.
    fn gather(
        &self,
        table: &TableName,
        outcomes: Vec<ServerOutcome>,
        place: &mut dyn FnMut(usize, Option<RowResult>),
    ) -> Result<Vec<IndexedOp>> {
        let mut requeued: Vec<IndexedOp> = Vec::new();

        for outcome in outcomes {
            let ServerOutcome {
                server,
                action,
                response,
            } = outcome;

            let response = match response {
                Ok(response) => response,
                Err(e) if e.is_do_not_retry() => return Err(e),
                Err(e) => {
                    // The whole server failed; every region it was sent
                    // retries next round.
                    warn!(server = %server, error = %e, "Batch dispatch to server failed");
                    for region in action.regions {
                        self.invalidate_representative(table, &region.ops, &server);
                        requeued.extend(region.ops);
                    }
                    continue;
                }
            };

            let mut by_region: HashMap<Bytes, Result<RegionResult>> = response
                .regions
                .into_iter()
                .map(|r| (r.region_name, r.result))
                .collect();

            for region in action.regions {
                match by_region.remove(&region.region_name) {
                    Some(Ok(RegionResult::Gets(rows))) => {
                        let returned = rows.len();
                        let mut rows = rows.into_iter();
                        let mut tail: Vec<IndexedOp> = Vec::new();
                        for item in region.ops {
                            match rows.next() {
                                Some(row) => place(item.index, row),
                                // The response came up short; retry the
                                // tail.
                                None => tail.push(item),
                            }
                        }
                        if !tail.is_empty() {
                            debug!(
                                region = ?region.region_name,
                                returned,
                                requeued = tail.len(),
                                "Batch region answered short, requeueing tail"
                            );
                            self.invalidate_representative(table, &tail, &server);
                            requeued.extend(tail);
                        }
                    }
                    Some(Ok(RegionResult::Mutations { applied })) => {
                        if applied < region.ops.len() {
                            debug!(
                                region = ?region.region_name,
                                applied,
                                submitted = region.ops.len(),
                                "Batch region partially applied, requeueing tail"
                            );
                            let tail: Vec<IndexedOp> =
                                region.ops.into_iter().skip(applied).collect();
                            self.invalidate_representative(table, &tail, &server);
                            requeued.extend(tail);
                        }
                    }
                    Some(Err(e)) if e.is_do_not_retry() => return Err(e),
                    Some(Err(e)) => {
                        debug!(
                            region = ?region.region_name,
                            error = %e,
                            "Batch region failed, requeueing"
                        );
                        self.invalidate_representative(table, &region.ops, &server);
                        requeued.extend(region.ops);
                    }
                    // The server reported nothing for the region; treat as
                    // a region failure.
                    None => {
                        self.invalidate_representative(table, &region.ops, &server);
                        requeued.extend(region.ops);
                    }
                }
            }
        }
        Ok(requeued)
    }

    /// Invalidating one representative row is enough to evict a region's
    /// cache entry.
    fn invalidate_representative(&self, table: &TableName, ops: &[IndexedOp], server: &ServerAddress) {
        if let Some(first) = ops.first() {
            let row: &RowKey = first.op.row();
            self.runner.cache.invalidate(table, row, Some(server));
        }
    }
}
