//! Master discovery and the shared master proxy.
//!
//! Many tasks may race to discover the master; discovery is serialized
//! under one async mutex so exactly one performs the probes while the rest
//! queue on the lock and reuse the cached proxy. The proxy stays cached
//! until `reset()`, keeping it alive for monitor and admin borrowers.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use tessera_core::{Error, Result, ServerAddress};
use tessera_rpc::{MasterService, ProxyRegistry};

use crate::config::ClientConfig;
use crate::quorum::QuorumSession;

/// Discovery state behind the serialization lock.
struct MasterState {
    /// The verified live proxy, if discovery has succeeded.
    proxy: Option<Arc<dyn MasterService>>,
    /// Set once a discovery pass has completed, successful or not.
    checked: bool,
}

/// Discovers the master via the quorum and holds the shared proxy.
pub(crate) struct MasterHolder {
    config: ClientConfig,
    quorum: QuorumSession,
    proxies: Arc<ProxyRegistry>,
    state: Mutex<MasterState>,
}

impl MasterHolder {
    pub(crate) fn new(
        config: ClientConfig,
        quorum: QuorumSession,
        proxies: Arc<ProxyRegistry>,
    ) -> Self {
        Self {
            config,
            quorum,
            proxies,
            state: Mutex::new(MasterState {
                proxy: None,
                checked: false,
            }),
        }
    }

    /// Returns the live master proxy, running discovery if needed.
    ///
    /// Bounded by `num_retries` probes with the shared backoff ladder. A
    /// pass that ends without a published address still marks the holder
    /// checked; the next call re-runs discovery.
    pub(crate) async fn master(&self) -> Result<Arc<dyn MasterService>> {
        // A permanently lost quorum session poisons everything downstream
        // of it, the held proxy included.
        if self.quorum.is_aborted().await {
            return Err(Error::QuorumSessionLost);
        }
        let mut state = self.state.lock().await;
        if let Some(proxy) = &state.proxy {
            return Ok(Arc::clone(proxy));
        }

        let mut last_address: Option<ServerAddress> = None;
        for tries in 0..self.config.num_retries {
            match self.probe(&mut last_address).await {
                Ok(Some(proxy)) => {
                    state.proxy = Some(Arc::clone(&proxy));
                    state.checked = true;
                    info!(address = ?last_address, "Discovered master");
                    return Ok(proxy);
                }
                Ok(None) => {
                    debug!(
                        tries,
                        max = self.config.num_retries,
                        "Master discovery attempt found no live master"
                    );
                }
                Err(e) if e.is_do_not_retry() => return Err(e),
                Err(e) => {
                    debug!(
                        tries,
                        max = self.config.num_retries,
                        error = %e,
                        "Master discovery attempt failed"
                    );
                }
            }
            if tries + 1 < self.config.num_retries {
                tokio::time::sleep(self.config.backoff_pause(tries)).await;
            }
        }

        state.checked = true;
        Err(Error::MasterNotRunning {
            address: last_address,
        })
    }

    /// One discovery probe: read the published address, then construct and
    /// liveness-check a stub for it.
    async fn probe(
        &self,
        last_address: &mut Option<ServerAddress>,
    ) -> Result<Option<Arc<dyn MasterService>>> {
        let Some(address) = self.quorum.master_address().await? else {
            return Ok(None);
        };
        *last_address = Some(address.clone());

        match self.proxies.master(&address).await {
            Ok(proxy) => Ok(Some(proxy)),
            // Not running yet; keep probing.
            Err(Error::MasterNotRunning { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `master()` wrapped to a boolean.
    pub(crate) async fn is_master_running(&self) -> bool {
        self.master().await.is_ok()
    }

    /// Drops the cached proxy so the next caller rediscovers.
    pub(crate) async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let Some(proxy) = state.proxy.take() {
            drop(proxy);
            state.checked = false;
        }
    }
}

impl std::fmt::Debug for MasterHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterHolder").finish_non_exhaustive()
    }
}
