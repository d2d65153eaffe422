//! Public façade (§4.8): the surface a host application actually holds.
//!
//! Shape and doc-comment density are modeled on the teacher's `ConvexClient`
//! (`client/mod.rs`) — a thin, cloneable handle wrapping a background worker
//! task, with subscribe/query/mutate forwarded to the embedded collaborator
//! and a `close`/`Drop` pair guarding against double-cleanup.

use std::{
    sync::Arc,
    time::Duration,
};

use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::{
    connection::{
        self,
        ConnectionHandle,
    },
    error::{
        ConfigError,
        StoreError,
    },
    pusher::MutationPusher,
    store::{
        Store,
        Unsubscribe,
    },
    types::DEFAULT_JITTER_BUFFER,
};

/// Construction-time configuration (§6.4). `mutators` is not modeled here:
/// the embedded [`Store`] is constructed already knowing its mutators, so
/// this crate never needs to see them directly.
pub struct Config {
    /// Required, non-empty (§6.4); fails [`ConfigError::EmptyUserId`]
    /// otherwise.
    pub user_id: String,
    pub room_id: String,
    /// Must start with `ws://` or `wss://` (§4.3).
    pub socket_origin: String,
    pub auth: Option<String>,
    /// Token refresh callback (§6.4 `getAuth`). When set, consulted in place
    /// of the static `auth` field every time the connection is about to
    /// (re)connect, so a token that expired between reconnects is replaced
    /// rather than resent stale. Mirrors the teacher's imperative
    /// `ConvexClient::set_auth` in shape (an injected callback rather than a
    /// one-shot value) rather than its exact push-based call signature,
    /// since this crate's connect attempts are driven internally by the
    /// watchdog, not by the host.
    pub get_auth: Option<Arc<dyn Fn() -> Option<String> + Send + Sync>>,
    pub schema_version: Option<u64>,
    /// Jitter buffer, ms (default 250, §6.4).
    pub jitter_buffer: Duration,
    /// Testing-only random push delay, ms (default 0, §6.4).
    pub max_random_push_latency: Duration,
    pub on_online_change: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            room_id: String::new(),
            socket_origin: String::new(),
            auth: None,
            get_auth: None,
            schema_version: None,
            jitter_buffer: DEFAULT_JITTER_BUFFER,
            max_random_push_latency: Duration::ZERO,
            on_online_change: None,
        }
    }
}

/// A real-time, room-scoped synchronization client (§1). Wraps an embedded
/// [`Store`] with a connection lifecycle, a poke playback pipeline, and a
/// mutation pusher; see the crate root for the high-level picture.
///
/// Cloning shares the same background connection and the same embedded
/// store, the way [`ConvexClient`](https://docs.rs/convex) cloning shares
/// one worker task.
#[derive(Clone)]
pub struct PokeSync {
    store: Arc<dyn Store>,
    connection: ConnectionHandle,
    schema_version: Option<u64>,
}

impl PokeSync {
    /// Validates `config`, spawns the background connection worker, and
    /// wires a [`MutationPusher`] into `store` (§4.6/§4.7). The connection
    /// does not attempt to connect until the store drives a mutation push or
    /// the watchdog's first tick fires.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Result<Self, ConfigError> {
        let max_random_push_latency = config.max_random_push_latency;
        let conn_config = connection::Config {
            user_id: config.user_id,
            room_id: config.room_id,
            socket_origin: config.socket_origin,
            auth: config.auth,
            get_auth: config.get_auth,
            jitter_buffer: config.jitter_buffer,
            max_random_push_latency,
            on_online_change: config.on_online_change,
        };
        conn_config.validate()?;
        let handle = connection::spawn(conn_config, store.clone());

        let pusher = Arc::new(MutationPusher::new(handle.clone(), max_random_push_latency));
        store.install_pusher(pusher);

        Ok(Self {
            store,
            connection: handle,
            schema_version: config.schema_version,
        })
    }

    pub fn client_id(&self) -> &str {
        self.store.client_id()
    }

    pub fn auth(&self) -> Option<&str> {
        self.store.auth()
    }

    /// Forwarded to the embedded store (spec.md:138).
    pub fn idb_name(&self) -> &str {
        self.store.idb_name()
    }

    pub fn schema_version(&self) -> Option<u64> {
        self.schema_version
    }

    /// `true` once [`PokeSync::close`] has been called. Never reverts.
    pub fn closed(&self) -> bool {
        self.connection.closed()
    }

    /// Forwarded to the embedded store.
    pub async fn query(&self, body: Json) -> Result<Json, StoreError> {
        self.store.query(body).await
    }

    /// Forwarded to the embedded store. The returned [`Unsubscribe`] drops
    /// the subscription when dropped.
    pub fn subscribe(&self, body: Json, on_data: mpsc::UnboundedSender<Json>) -> Unsubscribe {
        self.store.subscribe(body, on_data)
    }

    /// Alias for [`PokeSync::subscribe`]: this crate's embedded [`Store`]
    /// does not distinguish a separate "experimental watch" query-set
    /// mechanism from an ordinary subscription, so both forward identically
    /// (see DESIGN.md).
    pub fn experimental_watch(&self, body: Json, on_data: mpsc::UnboundedSender<Json>) -> Unsubscribe {
        self.store.subscribe(body, on_data)
    }

    /// Forwarded to the embedded store's registered mutators.
    pub async fn mutate(&self, name: &str, args: Json) -> Result<Json, StoreError> {
        self.store.mutate(name, args).await
    }

    /// Disconnects and closes the store. Idempotent (§5, §8: "idempotent
    /// close").
    pub fn close(&self) {
        self.connection.close();
        self.store.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        store::{
            PushRequest,
            PushResponse,
            PusherHook,
        },
        types::{
            CombinedPoke,
            Version,
        },
    };

    struct NullStore {
        client_id: String,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Store for NullStore {
        fn client_id(&self) -> &str {
            &self.client_id
        }

        fn auth(&self) -> Option<&str> {
            None
        }

        fn idb_name(&self) -> &str {
            "null-store"
        }

        fn current_cookie(&self) -> Version {
            None
        }

        fn last_mutation_id_received(&self) -> u64 {
            0
        }

        async fn poke(&self, _combined: CombinedPoke) -> Result<(), StoreError> {
            Ok(())
        }

        fn install_pusher(&self, _hook: Arc<dyn PusherHook>) {}

        async fn query(&self, _body: Json) -> Result<Json, StoreError> {
            Ok(json!(null))
        }

        fn subscribe(&self, _body: Json, _on_data: mpsc::UnboundedSender<Json>) -> Unsubscribe {
            Unsubscribe::noop()
        }

        async fn mutate(&self, _name: &str, _args: Json) -> Result<Json, StoreError> {
            Ok(json!(null))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> Config {
        Config {
            user_id: "u1".to_string(),
            room_id: "r1".to_string(),
            socket_origin: "ws://127.0.0.1:1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_empty_user_id() {
        let store = Arc::new(NullStore {
            client_id: "c".to_string(),
            closed: AtomicBool::new(false),
        });
        let mut cfg = config();
        cfg.user_id = String::new();
        assert_eq!(PokeSync::new(cfg, store).unwrap_err(), ConfigError::EmptyUserId);
    }

    #[test]
    fn rejects_bad_origin_scheme() {
        let store = Arc::new(NullStore {
            client_id: "c".to_string(),
            closed: AtomicBool::new(false),
        });
        let mut cfg = config();
        cfg.socket_origin = "https://example.test".to_string();
        assert!(matches!(PokeSync::new(cfg, store).unwrap_err(), ConfigError::BadOrigin(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_store() {
        let store = Arc::new(NullStore {
            client_id: "c".to_string(),
            closed: AtomicBool::new(false),
        });
        let client = PokeSync::new(config(), store.clone()).expect("valid config");
        assert!(!client.closed());
        client.close();
        client.close();
        assert!(client.closed());
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn accessors_forward_to_store() {
        let store = Arc::new(NullStore {
            client_id: "client-xyz".to_string(),
            closed: AtomicBool::new(false),
        });
        let client = PokeSync::new(config(), store).expect("valid config");
        assert_eq!(client.client_id(), "client-xyz");
        assert_eq!(client.auth(), None);
    }
}
