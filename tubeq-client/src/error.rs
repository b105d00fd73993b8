//! # Client Errors
//!
//! Purpose: Classify failures so callers (and the pool) can tell a broken
//! transport from a request the broker merely refused.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by connections and the pool.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Dial, write, or read failure. Taints the owning connection.
    #[error("{op}: network error: {source}")]
    Network {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// The broker answered with something other than the success reply.
    /// The raw reply line is kept for diagnostics.
    #[error("{op}: broker replied {reply:?}")]
    Broker { op: &'static str, reply: String },
    /// No pool slot became available within the caller's timeout.
    #[error("no pooled connection available within {0:?}")]
    DeadlineExceeded(Duration),
    /// The pool has begun shutting down.
    #[error("connection pool is shut down")]
    Shutdown,
    /// Tube name would not survive the line protocol.
    #[error("invalid tube name {0:?}")]
    InvalidTube(String),
}

impl ClientError {
    pub(crate) fn network(op: &'static str, source: io::Error) -> Self {
        ClientError::Network { op, source }
    }

    pub(crate) fn broker(op: &'static str, reply: &[u8]) -> Self {
        ClientError::Broker {
            op,
            reply: String::from_utf8_lossy(reply).into_owned(),
        }
    }

    /// True when the transport failed and the connection must be discarded.
    pub fn is_network(&self) -> bool {
        matches!(self, ClientError::Network { .. })
    }

    /// True when the broker rejected a well-formed request.
    pub fn is_broker(&self) -> bool {
        matches!(self, ClientError::Broker { .. })
    }

    /// Raw broker reply, if this is a broker rejection.
    pub fn reply(&self) -> Option<&str> {
        match self {
            ClientError::Broker { reply, .. } => Some(reply),
            _ => None,
        }
    }

    /// Fault this error leaves behind on the connection that produced it.
    pub fn fault(&self) -> Fault {
        match self {
            ClientError::Network { .. } => Fault::Network,
            ClientError::Broker { .. } => Fault::Broker,
            _ => Fault::None,
        }
    }
}

/// Sticky classification of the most recent failure on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Transport is unusable; the pool closes the connection on release.
    Network,
    /// Broker refused the last request; the connection stays reusable.
    Broker,
}
