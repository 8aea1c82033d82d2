//! Client configuration.
//!
//! Every knob is optional; defaults come from `tessera_core::limits`. The
//! fingerprint incorporates every setting that affects cluster identity or
//! timing, so the process-wide connection registry keys connections by it.

use std::time::Duration;

use xxhash_rust::xxh3::Xxh3;

use tessera_core::{
    Error, Result, DEFAULT_CLIENT_PAUSE_MS, DEFAULT_CLIENT_RETRIES, DEFAULT_META_SCAN_BATCH,
    DEFAULT_PREFETCH_LIMIT, DEFAULT_QUORUM_RECONNECTS_MAX, DEFAULT_RPC_TIMEOUT_MS,
};

/// Configuration for one cluster connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Comma-separated quorum member addresses; the cluster's identity.
    pub quorum: String,
    /// Retry count for the locator, master discovery, and the batch
    /// engine.
    pub num_retries: u32,
    /// Base pause between retries; multiplied by the backoff ladder.
    pub pause: Duration,
    /// Wall-clock deadline for a single-row retry loop. `None` means
    /// unbounded.
    pub rpc_retry_timeout: Option<Duration>,
    /// Per-RPC deadline carried by every stub.
    pub rpc_timeout: Duration,
    /// Number of adjacent region descriptors a meta-scan pass caches.
    pub prefetch_limit: usize,
    /// Cap on transparent quorum-session reconnects.
    pub max_quorum_reconnects: u32,
    /// Rows fetched per meta-scan batch.
    pub meta_scan_batch: usize,
}

impl ClientConfig {
    /// Creates a configuration for the given quorum with every other
    /// setting at its default.
    #[must_use]
    pub fn new(quorum: impl Into<String>) -> Self {
        Self {
            quorum: quorum.into(),
            num_retries: DEFAULT_CLIENT_RETRIES,
            pause: Duration::from_millis(DEFAULT_CLIENT_PAUSE_MS),
            rpc_retry_timeout: None,
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            max_quorum_reconnects: DEFAULT_QUORUM_RECONNECTS_MAX,
            meta_scan_batch: DEFAULT_META_SCAN_BATCH,
        }
    }

    /// Sets the retry count.
    #[must_use]
    pub const fn with_retries(mut self, num_retries: u32) -> Self {
        self.num_retries = num_retries;
        self
    }

    /// Sets the base pause between retries.
    #[must_use]
    pub const fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Sets the wall-clock deadline for single-row retry loops.
    #[must_use]
    pub const fn with_rpc_retry_timeout(mut self, deadline: Duration) -> Self {
        self.rpc_retry_timeout = Some(deadline);
        self
    }

    /// Sets the per-RPC deadline.
    #[must_use]
    pub const fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Sets the prefetch window.
    #[must_use]
    pub const fn with_prefetch_limit(mut self, limit: usize) -> Self {
        self.prefetch_limit = limit;
        self
    }

    /// Sets the quorum reconnect cap.
    #[must_use]
    pub const fn with_max_quorum_reconnects(mut self, max: u32) -> Self {
        self.max_quorum_reconnects = max;
        self
    }

    /// Sets the meta-scan batch size.
    #[must_use]
    pub const fn with_meta_scan_batch(mut self, batch: usize) -> Self {
        self.meta_scan_batch = batch;
        self
    }

    /// Creates a config with tight timing, suitable for tests.
    #[must_use]
    pub fn fast_for_testing(quorum: impl Into<String>) -> Self {
        Self::new(quorum)
            .with_retries(4)
            .with_pause(Duration::from_millis(1))
            .with_rpc_timeout(Duration::from_secs(1))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when a setting is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.quorum.is_empty() {
            return Err(Error::InvalidArgument {
                name: "quorum",
                reason: "quorum address cannot be empty",
            });
        }
        if self.num_retries == 0 {
            return Err(Error::InvalidArgument {
                name: "num_retries",
                reason: "at least one attempt is required",
            });
        }
        if self.meta_scan_batch == 0 {
            return Err(Error::InvalidArgument {
                name: "meta_scan_batch",
                reason: "meta scans need a non-zero batch size",
            });
        }
        Ok(())
    }

    /// Pause before retry attempt `tries + 1`: the base pause times the
    /// backoff ladder rung for `tries`.
    #[must_use]
    pub fn backoff_pause(&self, tries: u32) -> Duration {
        self.pause
            .saturating_mul(u32::try_from(tessera_core::backoff_multiplier(tries)).unwrap_or(u32::MAX))
    }

    /// Stable fingerprint over every setting that affects cluster identity
    /// and timing. Two configs with equal fingerprints share a connection
    /// in the process-wide registry (capacity
    /// [`tessera_core::CONNECTIONS_CACHED_MAX`]).
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(self.quorum.as_bytes());
        hasher.update(&self.num_retries.to_le_bytes());
        hasher.update(&u64::try_from(self.pause.as_millis()).unwrap_or(u64::MAX).to_le_bytes());
        let retry_deadline_ms = self
            .rpc_retry_timeout
            .map_or(u64::MAX, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        hasher.update(&retry_deadline_ms.to_le_bytes());
        hasher.update(
            &u64::try_from(self.rpc_timeout.as_millis())
                .unwrap_or(u64::MAX)
                .to_le_bytes(),
        );
        hasher.update(&(self.prefetch_limit as u64).to_le_bytes());
        hasher.update(&self.max_quorum_reconnects.to_le_bytes());
        hasher.update(&(self.meta_scan_batch as u64).to_le_bytes());
        hasher.digest()
    }
}
