//! Coordination-quorum session management.
//!
//! One logical session per connection, shared by every task in the
//! process. The session exposes two reads (master address, root-region
//! address) and recovers session expiry locally: up to the configured cap,
//! an expired session is closed and transparently recreated; past the cap
//! the session is permanently aborted and every dependent call fails fast.
//!
//! A listener task owns the event receiver of the current client; on
//! reconnect it swaps to the new client's receiver and keeps running.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use tessera_core::{Error, Result, ServerAddress};
use tessera_rpc::{QuorumClient, QuorumConnector, SessionEvent};

/// Mutable session state, guarded by one async mutex.
struct SessionState {
    /// The live client, if a session is established.
    client: Option<Arc<dyn QuorumClient>>,
    /// How many times the session has expired since the last clean
    /// connect.
    reconnects: u32,
    /// Set once the reconnect cap is exceeded; permanent.
    aborted: bool,
}

struct SessionShared {
    connector: Arc<dyn QuorumConnector>,
    max_reconnects: u32,
    state: Mutex<SessionState>,
}

/// A lazily established, self-healing session to the coordination quorum.
#[derive(Clone)]
pub struct QuorumSession {
    shared: Arc<SessionShared>,
}

impl QuorumSession {
    /// Creates a session that will connect via `connector` on first use
    /// and tolerate up to `max_reconnects` expiries.
    #[must_use]
    pub fn new(connector: Arc<dyn QuorumConnector>, max_reconnects: u32) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                connector,
                max_reconnects,
                state: Mutex::new(SessionState {
                    client: None,
                    reconnects: 0,
                    aborted: false,
                }),
            }),
        }
    }

    /// Returns the live client, establishing the session if necessary.
    ///
    /// # Errors
    ///
    /// `QuorumSessionLost` once the session is permanently aborted; the
    /// connect failure otherwise.
    pub async fn acquire(&self) -> Result<Arc<dyn QuorumClient>> {
        let mut state = self.shared.state.lock().await;
        if state.aborted {
            return Err(Error::QuorumSessionLost);
        }
        if let Some(client) = &state.client {
            return Ok(Arc::clone(client));
        }
        if state.reconnects > self.shared.max_reconnects {
            state.aborted = true;
            return Err(Error::QuorumSessionLost);
        }

        let (client, events) = self.shared.connector.connect().await?;
        state.client = Some(Arc::clone(&client));
        drop(state);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            listen(shared, events).await;
        });

        Ok(client)
    }

    /// Snapshot read of the published master address.
    ///
    /// # Errors
    ///
    /// Session-establishment and quorum read failures.
    pub async fn master_address(&self) -> Result<Option<ServerAddress>> {
        self.acquire().await?.read_master_address().await
    }

    /// Snapshot read of the published root-region server address.
    ///
    /// # Errors
    ///
    /// Session-establishment and quorum read failures.
    pub async fn root_region_address(&self) -> Result<Option<ServerAddress>> {
        self.acquire().await?.read_root_region_address().await
    }

    /// Returns true once the session is permanently aborted.
    pub async fn is_aborted(&self) -> bool {
        self.shared.state.lock().await.aborted
    }

    /// Releases the session. The listener task ends when the dropped
    /// client's event channel closes.
    pub async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        state.client = None;
    }
}

impl std::fmt::Debug for QuorumSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumSession")
            .field("max_reconnects", &self.shared.max_reconnects)
            .finish_non_exhaustive()
    }
}

/// Consumes session events, recovering expiries until the cap.
async fn listen(shared: Arc<SessionShared>, mut events: mpsc::Receiver<SessionEvent>) {
    loop {
        let Some(event) = events.recv().await else {
            // Channel closed: the client was dropped (session closed or
            // replaced). A replacement has its own listener.
            return;
        };
        match event {
            SessionEvent::Connected => {
                let mut state = shared.state.lock().await;
                state.reconnects = 0;
                drop(state);
                info!("Reconnected to coordination quorum");
            }
            SessionEvent::Expired => {
                let mut state = shared.state.lock().await;
                state.reconnects += 1;
                state.client = None;
                if state.reconnects > shared.max_reconnects {
                    state.aborted = true;
                    drop(state);
                    error!("Coordination session expired past the reconnect cap, aborting");
                    return;
                }
                let attempt = state.reconnects;
                warn!(
                    attempt,
                    max = shared.max_reconnects,
                    "Coordination session expired, reconnecting"
                );
                match shared.connector.connect().await {
                    Ok((client, new_events)) => {
                        state.client = Some(client);
                        drop(state);
                        info!("Coordination session re-established");
                        events = new_events;
                    }
                    Err(e) => {
                        state.aborted = true;
                        drop(state);
                        error!(error = %e, "Could not reconnect after session expiry, aborting");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Connector whose clients answer fixed addresses and whose event
    /// senders are retained so tests can expire sessions at will.
    struct ScriptedConnector {
        connects: AtomicUsize,
        fail_connects_after: usize,
        senders: std::sync::Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    }

    impl ScriptedConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                fail_connects_after: usize::MAX,
                senders: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        async fn expire_current(&self) {
            let sender = self
                .senders
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("no session to expire");
            sender.send(SessionEvent::Expired).await.unwrap();
        }
    }

    struct ScriptedClient;

    #[async_trait]
    impl QuorumClient for ScriptedClient {
        async fn read_master_address(&self) -> Result<Option<ServerAddress>> {
            Ok(Some("master:6000".parse().unwrap()))
        }

        async fn read_root_region_address(&self) -> Result<Option<ServerAddress>> {
            Ok(Some("root:8020".parse().unwrap()))
        }
    }

    #[async_trait]
    impl QuorumConnector for ScriptedConnector {
        async fn connect(&self) -> Result<(Arc<dyn QuorumClient>, mpsc::Receiver<SessionEvent>)> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_connects_after {
                return Err(Error::io(
                    tessera_core::NetworkErrorKind::ConnectionRefused,
                    "quorum unreachable",
                ));
            }
            let (tx, rx) = mpsc::channel(4);
            self.senders.lock().unwrap().push(tx);
            Ok((Arc::new(ScriptedClient), rx))
        }
    }

    /// Polls until the session has reconnected (listener runs async).
    async fn wait_for_connects(connector: &ScriptedConnector, want: usize) {
        for _ in 0..100 {
            if connector.connect_count() >= want {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("never reached {want} connects");
    }

    #[tokio::test]
    async fn test_session_is_lazy_and_shared() {
        let connector = ScriptedConnector::new();
        let session = QuorumSession::new(connector.clone(), 3);

        assert_eq!(connector.connect_count(), 0);
        let addr = session.master_address().await.unwrap();
        assert_eq!(addr, Some("master:6000".parse().unwrap()));
        let _ = session.root_region_address().await.unwrap();

        // One session serves both reads.
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_expiry_under_cap_reconnects_transparently() {
        let connector = ScriptedConnector::new();
        let session = QuorumSession::new(connector.clone(), 3);

        session.acquire().await.unwrap();
        connector.expire_current().await;
        wait_for_connects(&connector, 2).await;

        // No user-visible failure.
        assert!(session.master_address().await.is_ok());
        assert!(!session.is_aborted().await);
    }

    #[tokio::test]
    async fn test_expiry_past_cap_aborts_permanently() {
        let connector = ScriptedConnector::new();
        let session = QuorumSession::new(connector.clone(), 2);

        session.acquire().await.unwrap();
        for round in 0..3 {
            connector.expire_current().await;
            if round < 2 {
                wait_for_connects(&connector, round + 2).await;
            }
        }

        // The third expiry exceeds the cap of 2.
        for _ in 0..100 {
            if session.is_aborted().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(session.is_aborted().await);
        assert!(matches!(
            session.master_address().await,
            Err(Error::QuorumSessionLost)
        ));
    }

    #[tokio::test]
    async fn test_connected_event_resets_counter() {
        let connector = ScriptedConnector::new();
        let session = QuorumSession::new(connector.clone(), 1);

        session.acquire().await.unwrap();

        // Expire once (at the cap), then signal a clean reconnect.
        connector.expire_current().await;
        wait_for_connects(&connector, 2).await;
        let sender = connector.senders.lock().unwrap().last().cloned().unwrap();
        sender.send(SessionEvent::Connected).await.unwrap();

        // Counter reset: another expiry is again within the cap.
        for _ in 0..100 {
            if session.shared.state.lock().await.reconnects == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        connector.expire_current().await;
        wait_for_connects(&connector, 3).await;
        assert!(!session.is_aborted().await);
    }
}
