//! The retry driver for server-addressed operations.
//!
//! A `ServerOp` carries a table and row and knows how to invoke itself
//! against a shard stub once the driver has bound it to a location. The
//! driver owns everything around the call: resolution, the backoff
//! schedule, cache invalidation on region movement, dropping a dead
//! server's entries on connectivity failure, and the classification of
//! fatal versus retryable outcomes.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use tessera_core::{Error, RegionLocation, Result, RowKey, ServerAddress, TableName};
use tessera_rpc::{ProxyRegistry, ShardService};

use crate::cache::LocationCache;
use crate::config::ClientConfig;
use crate::locator::Locator;

/// A single-row operation the retry driver can re-bind to a freshly
/// resolved location between attempts.
#[async_trait]
pub trait ServerOp: Send {
    /// What the operation produces.
    type Output: Send;

    /// The table the row lives in.
    fn table(&self) -> &TableName;

    /// The row being operated on.
    fn row(&self) -> &RowKey;

    /// Invokes the operation against the given stub and location. Called
    /// once per attempt; `location` covers [`Self::row`] as of this
    /// attempt.
    async fn call(
        &mut self,
        shard: Arc<dyn ShardService>,
        location: &RegionLocation,
    ) -> Result<Self::Output>;
}

/// Servers declared dead after a connectivity failure.
#[derive(Default)]
pub(crate) struct DeadServers(Mutex<HashSet<ServerAddress>>);

impl DeadServers {
    pub(crate) fn mark(&self, server: ServerAddress) {
        self.0.lock().expect("dead servers lock").insert(server);
    }

    pub(crate) fn contains(&self, server: &ServerAddress) -> bool {
        self.0.lock().expect("dead servers lock").contains(server)
    }

    pub(crate) fn clear(&self) {
        self.0.lock().expect("dead servers lock").clear();
    }
}

/// Executes server-addressed operations with the shared failure policy.
#[derive(Clone)]
pub(crate) struct OpRunner {
    pub(crate) config: ClientConfig,
    pub(crate) locator: Arc<Locator>,
    pub(crate) cache: Arc<LocationCache>,
    pub(crate) proxies: Arc<ProxyRegistry>,
    pub(crate) dead: Arc<DeadServers>,
}

impl OpRunner {
    /// Runs `op` with retries: bounded by the retry count and, when
    /// configured, by the `rpc_retry_timeout` wall clock.
    ///
    /// Region movement is retried immediately (the re-resolved server
    /// differs); a failure that re-resolves to the same server sleeps one
    /// backoff rung first. The ordered failure trail rides along in the
    /// final `RetriesExhausted`.
    pub(crate) async fn with_retries<O: ServerOp>(&self, op: &mut O) -> Result<O::Output> {
        let started = Instant::now();
        let mut trail: Vec<Error> = Vec::new();
        // Resolution gets no extra retries here: the locator retries
        // internally.
        let mut location = self.locator.locate(op.table(), op.row(), true).await?;

        let mut tries: u32 = 0;
        loop {
            let failure = match self.attempt(op, &location).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };

            if failure.is_do_not_retry() {
                // A fatal envelope around region-not-serving still tells
                // us the cached entry is stale; fix the cache before
                // re-raising.
                if failure.region_not_serving().is_some() {
                    self.cache
                        .invalidate(op.table(), op.row(), Some(location.server()));
                }
                return Err(failure);
            }

            trail.push(failure);
            if tries + 1 >= self.config.num_retries {
                return Err(Error::RetriesExhausted {
                    tries: tries + 1,
                    trail,
                });
            }

            // Evict the binding this attempt used (unless a peer already
            // replaced it), then re-resolve without forcing a reload: the
            // cache may have been fixed while we were failing.
            self.cache
                .invalidate(op.table(), op.row(), Some(location.server()));
            let next = self.locator.locate(op.table(), op.row(), true).await?;

            if next.server() == location.server() {
                let pause = self.config.backoff_pause(tries);
                if let Some(deadline) = self.config.rpc_retry_timeout {
                    if started.elapsed() + pause > deadline {
                        return Err(Error::RetriesExhausted {
                            tries: tries + 1,
                            trail,
                        });
                    }
                }
                debug!(
                    tries,
                    server = %next.server(),
                    pause = ?pause,
                    "Retrying on the same server after sleep"
                );
                tokio::time::sleep(pause).await;
                // Re-resolve again: the sleep is exactly the window in
                // which a peer repopulates the cache.
                location = self.locator.locate(op.table(), op.row(), true).await?;
            } else {
                debug!(
                    tries,
                    from = %location.server(),
                    to = %next.server(),
                    "Region moved, retrying immediately"
                );
                location = next;
            }
            tries += 1;
        }
    }

    /// Runs `op` exactly once. Connectivity failures still declare the
    /// target server dead and drop its cached entries.
    pub(crate) async fn without_retries<O: ServerOp>(&self, op: &mut O) -> Result<O::Output> {
        let location = self.locator.locate(op.table(), op.row(), true).await?;
        self.attempt(op, &location).await
    }

    /// One attempt at an already-resolved location.
    async fn attempt<O: ServerOp>(
        &self,
        op: &mut O,
        location: &RegionLocation,
    ) -> Result<O::Output> {
        self.call_server(location.server(), |shard| op.call(shard, location))
            .await
    }

    /// Invokes `call` against the stub for `server`, applying the
    /// dead-server policy: any connectivity failure drops every cached
    /// entry for the server and records it dead.
    pub(crate) async fn call_server<T, F, Fut>(&self, server: &ServerAddress, call: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Arc<dyn ShardService>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let result = match self.proxies.shard(server).await {
            Ok(shard) => call(shard).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.is_connectivity() {
                debug!(server = %server, error = %e, "Connectivity failure, dropping server from cache");
                self.cache.drop_server(server);
                self.dead.mark(server.clone());
            }
        }
        result
    }
}
