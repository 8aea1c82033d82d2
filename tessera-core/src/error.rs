//! Error kinds for the connection core.
//!
//! Every failure is classified into one of these kinds before it leaves
//! the core; the retry driver and the batch engine branch on the
//! classifiers, never on type names or string matching. Remote-exception
//! envelopes are unwrapped by the stub layer, so the cause chain here is
//! always the local one.

use thiserror::Error;

use crate::key::TableName;
use crate::region::ServerAddress;

/// The result type for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Kinds of network failures.
///
/// The connectivity kinds (everything except `MessageTooLarge`) are the
/// signal that a server is slow or dead: on seeing one, the caller drops
/// every cached location for that server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// The RPC timed out.
    Timeout,
    /// Connection refused by the peer.
    ConnectionRefused,
    /// Connection reset by the peer.
    ConnectionReset,
    /// The channel was closed mid-call.
    ChannelClosed,
    /// The stream ended before the response was complete.
    UnexpectedEof,
    /// A flush or sync to the peer failed.
    SyncFailed,
    /// The message exceeded the transport's size limit.
    MessageTooLarge,
}

impl NetworkErrorKind {
    /// Returns true for the kinds that mean the server itself is
    /// unreachable (as opposed to this one request being malformed).
    #[must_use]
    pub const fn is_connectivity(self) -> bool {
        !matches!(self, Self::MessageTooLarge)
    }
}

/// Errors surfaced by the connection core.
#[derive(Debug, Error)]
pub enum Error {
    /// A network operation failed.
    #[error("I/O failure ({kind:?}): {context}")]
    Io {
        /// What kind of network failure.
        kind: NetworkErrorKind,
        /// What was being attempted.
        context: String,
        /// The underlying cause, when one exists.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The server no longer hosts the region the request named.
    #[error("region not serving: {region}")]
    RegionNotServing {
        /// The region name the server rejected.
        region: String,
    },

    /// The catalog says the region is offline (mid-split or disabled).
    #[error("region offline: {region}")]
    RegionOffline {
        /// The offline region's name.
        region: String,
    },

    /// No server is listed for the region covering the requested row.
    #[error("no server for region: {message}")]
    NoServerForRegion {
        /// Which lookup failed and why.
        message: String,
    },

    /// The catalog has no rows for the table.
    #[error("table not found: {table}")]
    TableNotFound {
        /// The missing table.
        table: TableName,
    },

    /// A failure the server or the client flagged as hopeless to retry.
    #[error("do not retry: {message}")]
    DoNotRetry {
        /// Why the failure is fatal.
        message: String,
        /// The originating failure, when one exists.
        #[source]
        cause: Option<Box<Error>>,
    },

    /// Master discovery exhausted its retry budget.
    #[error("master not running{}", .address.as_ref().map(|a| format!(" at {a}")).unwrap_or_default())]
    MasterNotRunning {
        /// The last address the quorum published, if any.
        address: Option<ServerAddress>,
    },

    /// The coordination-service session exceeded its reconnect cap and is
    /// permanently aborted; every dependent call fails fast.
    #[error("coordination session lost permanently")]
    QuorumSessionLost,

    /// A retry loop ran out of budget.
    #[error("retries exhausted after {tries} tries: {}", describe_trail(.trail))]
    RetriesExhausted {
        /// How many attempts were made.
        tries: u32,
        /// Every failure observed, in order.
        trail: Vec<Error>,
    },

    /// The task was interrupted during a sleep or await.
    #[error("interrupted")]
    Interrupted,

    /// An invalid argument was provided.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },

    /// The connection has been closed.
    #[error("connection is closed")]
    ConnectionClosed,
}

impl Error {
    /// Builds a network failure with a cause.
    #[must_use]
    pub fn io(kind: NetworkErrorKind, context: impl Into<String>) -> Self {
        Self::Io {
            kind,
            context: context.into(),
            source: None,
        }
    }

    /// Builds a network failure preserving the underlying I/O cause.
    #[must_use]
    pub fn io_caused(
        kind: NetworkErrorKind,
        context: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            kind,
            context: context.into(),
            source: Some(source),
        }
    }

    /// Wraps a failure as do-not-retry, preserving it as the cause.
    #[must_use]
    pub fn do_not_retry(message: impl Into<String>, cause: Self) -> Self {
        Self::DoNotRetry {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Returns true for network failures that mean the target server is
    /// slow or dead: timeout, connect refused, reset, channel closed,
    /// unexpected EOF, sync failed.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Io { kind, .. } if kind.is_connectivity())
    }

    /// Returns true for failures that must never be retried: explicit
    /// do-not-retry envelopes, missing tables, a permanently lost quorum
    /// session, interruption, contract breaches, and use after close.
    #[must_use]
    pub fn is_do_not_retry(&self) -> bool {
        matches!(
            self,
            Self::DoNotRetry { .. }
                | Self::TableNotFound { .. }
                | Self::QuorumSessionLost
                | Self::Interrupted
                | Self::InvalidArgument { .. }
                | Self::ConnectionClosed
        )
    }

    /// Returns the rejected region name when this failure is, or wraps, a
    /// region-not-serving signal. The retry driver uses this to invalidate
    /// exactly one cache entry before giving up or retrying.
    #[must_use]
    pub fn region_not_serving(&self) -> Option<&str> {
        match self {
            Self::RegionNotServing { region } => Some(region),
            Self::DoNotRetry {
                cause: Some(cause), ..
            } => cause.region_not_serving(),
            _ => None,
        }
    }
}

/// Summarizes an exception trail for display: count plus the last failure.
fn describe_trail(trail: &[Error]) -> String {
    trail.last().map_or_else(
        || "no failures recorded".to_string(),
        |last| format!("{} failures, last: {last}", trail.len()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(Error::io(NetworkErrorKind::Timeout, "rpc").is_connectivity());
        assert!(Error::io(NetworkErrorKind::ConnectionRefused, "rpc").is_connectivity());
        assert!(Error::io(NetworkErrorKind::UnexpectedEof, "rpc").is_connectivity());
        assert!(!Error::io(NetworkErrorKind::MessageTooLarge, "rpc").is_connectivity());
        assert!(!Error::RegionNotServing {
            region: "r".into()
        }
        .is_connectivity());
    }

    #[test]
    fn test_do_not_retry_classification() {
        let fatal = Error::DoNotRetry {
            message: "serialization mismatch".into(),
            cause: None,
        };
        assert!(fatal.is_do_not_retry());
        assert!(Error::TableNotFound {
            table: TableName::new("gone")
        }
        .is_do_not_retry());
        assert!(Error::QuorumSessionLost.is_do_not_retry());
        assert!(Error::Interrupted.is_do_not_retry());
        assert!(!Error::io(NetworkErrorKind::Timeout, "rpc").is_do_not_retry());
        assert!(!Error::RegionNotServing {
            region: "r".into()
        }
        .is_do_not_retry());
    }

    #[test]
    fn test_region_not_serving_unwraps_cause() {
        let raw = Error::RegionNotServing {
            region: "users,a,00000000000001".into(),
        };
        assert_eq!(raw.region_not_serving(), Some("users,a,00000000000001"));

        let wrapped = Error::do_not_retry("server flagged fatal", raw);
        assert_eq!(
            wrapped.region_not_serving(),
            Some("users,a,00000000000001")
        );

        assert_eq!(Error::Interrupted.region_not_serving(), None);
    }

    #[test]
    fn test_retries_exhausted_display_names_last_failure() {
        let err = Error::RetriesExhausted {
            tries: 3,
            trail: vec![
                Error::io(NetworkErrorKind::Timeout, "call"),
                Error::RegionNotServing {
                    region: "r".into(),
                },
            ],
        };
        let msg = format!("{err}");
        assert!(msg.contains("3 tries"));
        assert!(msg.contains("region not serving"));
    }

    #[test]
    fn test_io_cause_is_preserved() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::io_caused(NetworkErrorKind::ConnectionRefused, "connect", cause);
        assert!(std::error::Error::source(&err).is_some());
    }
}
