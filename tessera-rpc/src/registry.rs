//! Keyed pool of RPC stubs.
//!
//! One stub per `(address, interface)` pair, created lazily and reused by
//! every caller in the process. Stub construction happens outside the
//! registry lock; when two callers race, the first insert wins and the
//! loser's stub is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use tessera_core::{Error, Result, ServerAddress};

use crate::service::{MasterService, ShardService, StubFactory};

/// Cached stubs, both interfaces under one lock.
#[derive(Default)]
struct Stubs {
    shard: HashMap<ServerAddress, Arc<dyn ShardService>>,
    master: HashMap<ServerAddress, Arc<dyn MasterService>>,
}

/// Process-wide pool of RPC stubs for one cluster.
pub struct ProxyRegistry {
    factory: Arc<dyn StubFactory>,
    rpc_timeout: Duration,
    stubs: Mutex<Stubs>,
}

impl ProxyRegistry {
    /// Creates a registry that builds stubs via `factory` with the given
    /// per-RPC deadline.
    #[must_use]
    pub fn new(factory: Arc<dyn StubFactory>, rpc_timeout: Duration) -> Self {
        Self {
            factory,
            rpc_timeout,
            stubs: Mutex::new(Stubs::default()),
        }
    }

    /// Returns the shard stub for `addr`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Propagates stub-construction failures; these are retryable unless
    /// classified do-not-retry.
    pub async fn shard(&self, addr: &ServerAddress) -> Result<Arc<dyn ShardService>> {
        if let Some(stub) = self.stubs.lock().expect("proxy lock").shard.get(addr) {
            return Ok(Arc::clone(stub));
        }

        let stub = self.factory.shard_stub(addr, self.rpc_timeout).await?;

        let mut stubs = self.stubs.lock().expect("proxy lock");
        let entry = stubs
            .shard
            .entry(addr.clone())
            .or_insert_with(|| Arc::clone(&stub));
        Ok(Arc::clone(entry))
    }

    /// Returns the master stub for `addr`, creating and liveness-probing
    /// it on first use. Only a stub that answered `is_master_running() ==
    /// true` is cached.
    ///
    /// # Errors
    ///
    /// `MasterNotRunning` when the probe answers false; otherwise the
    /// construction or probe failure.
    pub async fn master(&self, addr: &ServerAddress) -> Result<Arc<dyn MasterService>> {
        if let Some(stub) = self.stubs.lock().expect("proxy lock").master.get(addr) {
            return Ok(Arc::clone(stub));
        }

        let stub = self.factory.master_stub(addr, self.rpc_timeout).await?;
        if !stub.is_master_running().await? {
            debug!(addr = %addr, "master stub answered not-running, not caching");
            return Err(Error::MasterNotRunning {
                address: Some(addr.clone()),
            });
        }

        let mut stubs = self.stubs.lock().expect("proxy lock");
        let entry = stubs
            .master
            .entry(addr.clone())
            .or_insert_with(|| Arc::clone(&stub));
        Ok(Arc::clone(entry))
    }

    /// Drops the cached master stub for `addr`, if any, so the next caller
    /// re-probes.
    pub fn forget_master(&self, addr: &ServerAddress) {
        self.stubs.lock().expect("proxy lock").master.remove(addr);
    }

    /// Number of cached shard stubs.
    #[must_use]
    pub fn shard_stub_count(&self) -> usize {
        self.stubs.lock().expect("proxy lock").shard.len()
    }

    /// Drops every cached stub. Used at connection teardown.
    pub fn clear(&self) {
        let mut stubs = self.stubs.lock().expect("proxy lock");
        let dropped = stubs.shard.len() + stubs.master.len();
        stubs.shard.clear();
        stubs.master.clear();
        if dropped > 0 {
            info!(dropped, "Cleared RPC proxy registry");
        }
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stubs = self.stubs.lock().expect("proxy lock");
        f.debug_struct("ProxyRegistry")
            .field("shard_stubs", &stubs.shard.len())
            .field("master_stubs", &stubs.master.len())
            .field("rpc_timeout", &self.rpc_timeout)
            .finish()
    }
}
