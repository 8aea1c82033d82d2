//! Retry limits and client defaults.
//!
//! Following `TigerStyle`: put limits on everything. Every retry loop in
//! the client is bounded by an explicit count or deadline, and every cache
//! has an explicit maximum size.

/// Multipliers applied to the base pause between retries.
///
/// Attempt `n` sleeps `RETRY_BACKOFF[min(n, len - 1)] * pause`. The ladder
/// ramps slowly at first (regions usually reappear within a few seconds of
/// a move) and tops out at 32x.
pub const RETRY_BACKOFF: [u64; 10] = [1, 1, 1, 2, 2, 4, 4, 8, 16, 32];

/// Default number of retries for the locator, master discovery, and the
/// batch engine.
pub const DEFAULT_CLIENT_RETRIES: u32 = 10;

/// Default base pause between retries, in milliseconds.
pub const DEFAULT_CLIENT_PAUSE_MS: u64 = 500;

/// Default per-RPC deadline, in milliseconds.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 60_000;

/// Default number of adjacent region descriptors fetched into the cache
/// per meta-scan pass.
pub const DEFAULT_PREFETCH_LIMIT: usize = 10;

/// Default cap on transparent quorum-session reconnects before the session
/// is permanently aborted.
pub const DEFAULT_QUORUM_RECONNECTS_MAX: u32 = 3;

/// Default number of meta rows fetched per scan batch.
pub const DEFAULT_META_SCAN_BATCH: usize = 100;

/// Maximum number of connections the process-wide registry keeps.
///
/// The quorum library's default connection cap is 30, so the registry
/// limit is hit only after the quorum starts refusing sessions anyway.
pub const CONNECTIONS_CACHED_MAX: usize = 31;

/// Returns the backoff multiplier for the given attempt number, clamped to
/// the last rung of the ladder.
#[must_use]
pub fn backoff_multiplier(tries: u32) -> u64 {
    let index = (tries as usize).min(RETRY_BACKOFF.len() - 1);
    RETRY_BACKOFF[index]
}
