//! Error taxonomy. `ConfigError` is fatal at construction; the rest drive a
//! recoverable disconnect-and-reconnect cycle (see `connection::worker`).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("socketOrigin must start with ws:// or wss:// (got {0:?})")]
    BadOrigin(String),
    #[error("userID must be non-empty")]
    EmptyUserId,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected downstream tag {0:?}")]
    UnexpectedTag(String),
    #[error("fatal server error: {0}")]
    ServerError(String),
    #[error("unexpected base cookie for poke")]
    UnexpectedBaseCookie,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket closed")]
    Closed,
    #[error("ping deadline exceeded")]
    PingTimeout,
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Wraps whatever error type the external `Store` collaborator returns from
/// `poke`/`mutate`/`query`. The "unexpected base cookie" signature is the one
/// message this crate inspects; everything else propagates as-is.
#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    /// Per spec §4.5 step 6 / §7: a store rejection whose message denotes an
    /// unexpected base cookie is recoverable via disconnect, not fatal.
    pub fn is_unexpected_base_cookie(&self) -> bool {
        self.0.contains("unexpected base cookie for poke")
    }
}
