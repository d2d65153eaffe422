//! The `Store` trait captures the external offline-first replica collaborator
//! this crate wraps (§1, §6). Its shape intentionally differs from any one
//! pre-existing library's exact API: it is designed fresh for this crate, so
//! it exposes a direct `current_cookie()` accessor rather than the puller-
//! shim workaround described in the distilled spec §4.7 (see SPEC_FULL.md
//! §4.7/§9 for the rationale).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::{
    error::StoreError,
    types::{
        CombinedPoke,
        Mutation,
        Version,
    },
};

/// A batch of mutations the store wants pushed to the server, mirroring the
/// upstream `push` envelope's body (§6.3) minus the fields this crate stamps
/// itself (`timestamp`, single-mutation framing).
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone)]
pub struct PushResponse {
    pub http_status_code: u16,
    pub error_message: String,
}

impl PushResponse {
    pub fn ok() -> Self {
        Self {
            http_status_code: 200,
            error_message: String::new(),
        }
    }
}

/// The store's pluggable outbound plugin (GLOSSARY: "Pusher"). The facade
/// installs a [`crate::pusher::MutationPusher`] implementing this hook at
/// construction time; the store invokes it whenever it has a batch of
/// mutations ready to send.
#[async_trait]
pub trait PusherHook: Send + Sync {
    async fn push(&self, request: PushRequest) -> PushResponse;
}

/// A subscription handle; dropping it unsubscribes.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_drop)))
    }

    pub fn noop() -> Self {
        Self(None)
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// The local offline-first replica store this crate wraps. Out of this
/// crate's scope: persistence, conflict resolution, cross-tab coordination
/// (§1 Non-goals).
#[async_trait]
pub trait Store: Send + Sync + 'static {
    fn client_id(&self) -> &str;

    fn auth(&self) -> Option<&str>;

    /// A stable name identifying the store's local persisted replica (e.g.
    /// the name of its on-disk/IndexedDB-backed database), forwarded
    /// verbatim by [`crate::client::PokeSync::idb_name`] (spec.md:138).
    /// Persistence itself stays delegated (§1 Non-goals); this is just the
    /// store's own handle name, not a mechanism this crate manages.
    fn idb_name(&self) -> &str;

    /// The store's current base cookie. Read once per `connect()` (§4.4) to
    /// build the reconnect URL.
    fn current_cookie(&self) -> Version;

    /// The highest mutation id the server has acknowledged, persisted across
    /// reconnects and sent back to the server as `lmid` (§4.3, §8 S6).
    fn last_mutation_id_received(&self) -> u64;

    /// Applies a combined poke as a single atomic `baseCookie -> cookie`
    /// transition (§4.5). Rejections whose message denotes an unexpected
    /// base cookie are recoverable; all others are fatal store errors.
    async fn poke(&self, combined: CombinedPoke) -> Result<(), StoreError>;

    /// Registers the connection's mutation pusher. Called once, at
    /// construction.
    fn install_pusher(&self, hook: Arc<dyn PusherHook>);

    async fn query(&self, body: Json) -> Result<Json, StoreError>;

    fn subscribe(&self, body: Json, on_data: mpsc::UnboundedSender<Json>) -> Unsubscribe;

    async fn mutate(&self, name: &str, args: Json) -> Result<Json, StoreError>;

    /// Releases any resources the store holds (e.g. a persisted replica
    /// handle). Called once by [`crate::client::PokeSync::close`]. Default
    /// no-op: persistence lifecycle is delegated and out of scope (§1).
    fn close(&self) {}
}
