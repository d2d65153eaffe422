//! Connection state machine: ties the authenticated socket, the
//! pending-connect deferred, the ping/pong watchdog, and the playback
//! pipeline together (§4.4). Implemented as a single spawned task pumping a
//! `tokio::select!` loop, mirroring the teacher's `client/worker.rs`
//! `_worker_once` shape.

use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex as StdMutex,
    },
    time::Duration,
};

use tokio::time::Instant;

use futures::{
    stream::{
        SplitSink,
        SplitStream,
    },
    SinkExt,
    StreamExt,
};
use tokio::sync::{
    mpsc,
    Notify,
};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    deferred::{
        deferred,
        Deferred,
        Resolver,
    },
    playback::{
        Playback,
        PlaybackEvent,
    },
    sleep::{
        sleep_cancellable,
        SleepOutcome,
    },
    socket::{
        self,
        Socket,
    },
    store::Store,
    types::{
        ConnectionState,
        Downstream,
        PokeList,
        Upstream,
        PING_DEADLINE,
        WATCHDOG_INTERVAL,
    },
};

/// Construction-time configuration (§6.4).
pub struct Config {
    pub user_id: String,
    pub room_id: String,
    pub socket_origin: String,
    pub auth: Option<String>,
    /// Token refresh callback (`getAuth`), consulted in place of `auth` on
    /// every connect attempt when present (§6.4, §4.3).
    pub get_auth: Option<Arc<dyn Fn() -> Option<String> + Send + Sync>>,
    /// Jitter buffer, ms (default 250).
    pub jitter_buffer: Duration,
    /// Testing-only random push delay, ms (default 0).
    pub max_random_push_latency: Duration,
    pub on_online_change: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

impl Config {
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.user_id.is_empty() {
            return Err(crate::error::ConfigError::EmptyUserId);
        }
        if !(self.socket_origin.starts_with("ws://") || self.socket_origin.starts_with("wss://")) {
            return Err(crate::error::ConfigError::BadOrigin(self.socket_origin.clone()));
        }
        Ok(())
    }

    /// Resolves the auth token to use for the next connect attempt: the
    /// `getAuth` refresh callback when supplied, else the static `auth`
    /// token (§6.4).
    fn resolve_auth(&self) -> Option<String> {
        match &self.get_auth {
            Some(get_auth) => get_auth(),
            None => self.auth.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            room_id: String::new(),
            socket_origin: String::new(),
            auth: None,
            get_auth: None,
            jitter_buffer: crate::types::DEFAULT_JITTER_BUFFER,
            max_random_push_latency: Duration::ZERO,
            on_online_change: None,
        }
    }
}

/// State shared between the worker task and the outside world (the pusher
/// and the public facade). Guarded by a plain sync mutex: every access is a
/// short, non-blocking read/write.
pub(crate) struct Shared {
    pending_connect: Deferred<mpsc::UnboundedSender<Upstream>>,
    resolver: Resolver<mpsc::UnboundedSender<Upstream>>,
    /// Reset to -1 on every disconnect (§4.4).
    last_mutation_id_sent: i64,
}

/// Handle the mutation pusher and the public facade use to talk to the
/// connection worker without owning the socket themselves.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) shared: Arc<StdMutex<Shared>>,
    connect_requests: mpsc::UnboundedSender<()>,
    close_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub(crate) fn pending_connect(&self) -> Deferred<mpsc::UnboundedSender<Upstream>> {
        self.shared.lock().expect("connection shared state poisoned").pending_connect.clone()
    }

    pub(crate) fn last_mutation_id_sent(&self) -> i64 {
        self.shared.lock().expect("connection shared state poisoned").last_mutation_id_sent
    }

    pub(crate) fn set_last_mutation_id_sent(&self, v: i64) {
        self.shared.lock().expect("connection shared state poisoned").last_mutation_id_sent = v;
    }

    /// Fire-and-forget connect request (§4.6 step 1).
    pub fn request_connect(&self) {
        let _ = self.connect_requests.send(());
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_one();
        }
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn spawn(
    config: Config,
    store: Arc<dyn Store>,
) -> ConnectionHandle {
    let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
    let (pending_connect, resolver) = deferred();
    let shared = Arc::new(StdMutex::new(Shared {
        pending_connect,
        resolver,
        last_mutation_id_sent: -1,
    }));
    let (connect_tx, connect_rx) = mpsc::unbounded_channel();
    let close_notify = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));

    let handle = ConnectionHandle {
        shared: shared.clone(),
        connect_requests: connect_tx,
        close_notify: close_notify.clone(),
        closed: closed.clone(),
    };

    let (playback_events_tx, playback_events_rx) = mpsc::unbounded_channel();
    let playback = Arc::new(Playback::new(store.clone(), config.jitter_buffer, playback_events_tx));

    let worker = Worker {
        config,
        store,
        shared,
        state: ConnectionState::Disconnected,
        sink: None,
        stream: None,
        upstream_tx,
        upstream_rx,
        connect_rx,
        close_notify,
        closed,
        playback,
        playback_events_rx,
        ping_rendezvous: None,
        next_watchdog: Instant::now() + WATCHDOG_INTERVAL,
    };
    tokio::spawn(worker.run());

    handle
}

struct Worker {
    config: Config,
    store: Arc<dyn Store>,
    shared: Arc<StdMutex<Shared>>,
    state: ConnectionState,
    sink: Option<SplitSink<Socket, Message>>,
    stream: Option<SplitStream<Socket>>,
    upstream_tx: mpsc::UnboundedSender<Upstream>,
    upstream_rx: mpsc::UnboundedReceiver<Upstream>,
    connect_rx: mpsc::UnboundedReceiver<()>,
    close_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    playback: Arc<Playback>,
    playback_events_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    ping_rendezvous: Option<Resolver<()>>,
    /// Absolute deadline for the next watchdog tick (§4.4: "every 5000 ms
    /// while not closed"). Anchored to an `Instant` rather than a fresh
    /// `Duration` so that a `select!` iteration won by some other branch
    /// (a frame, a connect request, an upstream push, a playback event)
    /// does not push the watchdog's next fire time back out by a full
    /// interval — only the watchdog arm itself advances this field.
    next_watchdog: Instant,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                self.disconnect("closed").await;
                return;
            }

            tokio::select! {
                biased;

                _ = self.close_notify.notified() => {
                    self.disconnect("closed").await;
                    return;
                }

                frame = next_frame(&mut self.stream), if self.stream.is_some() => {
                    match frame {
                        Some(Ok(msg)) => self.handle_frame(msg).await,
                        Some(Err(e)) => {
                            tracing::info!("{}", crate::error::TransportError::from(e));
                            self.disconnect("socket closed").await;
                        },
                        None => {
                            tracing::info!("{}", crate::error::TransportError::Closed);
                            self.disconnect("socket closed").await;
                        },
                    }
                }

                Some(()) = self.connect_rx.recv() => {
                    self.connect().await;
                }

                Some(upstream) = self.upstream_rx.recv() => {
                    // Best-effort: if there's no live socket the message is
                    // simply dropped (§4.6 step 5 rationale) and the store
                    // is expected to re-invoke the pusher on its own retry
                    // cycle.
                    self.send(upstream).await;
                }

                Some(event) = self.playback_events_rx.recv() => {
                    match event {
                        PlaybackEvent::RecoverableError => self.disconnect("unexpected base cookie").await,
                        PlaybackEvent::FatalError(e) => {
                            tracing::error!("fatal store error: {e}");
                            self.disconnect("fatal store error").await;
                        },
                    }
                }

                outcome = self.watchdog_wait() => {
                    match outcome {
                        SleepOutcome::Cancelled => {},
                        SleepOutcome::Elapsed => {
                            self.next_watchdog = Instant::now() + WATCHDOG_INTERVAL;
                            self.watchdog_tick().await;
                        },
                    }
                }
            }
        }
    }

    /// Sleeps until `self.next_watchdog`, recomputed from the stored
    /// absolute deadline every time this is called so that losing a
    /// `select!` race to another branch doesn't reset the watchdog's
    /// cadence (§4.4).
    async fn watchdog_wait(&self) -> SleepOutcome {
        let remaining = self.next_watchdog.saturating_duration_since(Instant::now());
        sleep_cancellable(remaining, &self.close_notify).await
    }

    async fn watchdog_tick(&mut self) {
        match self.state {
            ConnectionState::Connected => self.ping().await,
            ConnectionState::Disconnected => self.connect().await,
            ConnectionState::Connecting => {},
        }
    }

    async fn ping(&mut self) {
        let (rendezvous, resolver) = deferred::<()>();
        self.ping_rendezvous = Some(resolver);
        if self.send(Upstream::Ping).await.is_none() {
            return;
        }
        let deadline = tokio::time::sleep(PING_DEADLINE);
        tokio::select! {
            got = rendezvous.wait() => {
                if got.is_none() {
                    self.disconnect("ping rendezvous dropped").await;
                }
            }
            _ = deadline => {
                tracing::info!("{}", crate::error::TransportError::PingTimeout);
                self.disconnect("ping deadline exceeded").await;
            }
        }
    }

    async fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Connecting;

        let base_cookie = self.store.current_cookie();
        let now_ms = now_ms();
        let url = match socket::build_url(
            &self.config.socket_origin,
            self.store.client_id(),
            &self.config.room_id,
            base_cookie,
            now_ms,
            self.store.last_mutation_id_received() as i64,
        ) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("bad socket origin: {e}");
                self.state = ConnectionState::Disconnected;
                return;
            },
        };

        let auth = self.config.resolve_auth().unwrap_or_default();
        match socket::connect(url, &auth).await {
            Ok(socket) => {
                let (sink, stream) = socket.split();
                self.sink = Some(sink);
                self.stream = Some(stream);
            },
            Err(e) => {
                tracing::info!("connect failed: {e}");
                self.state = ConnectionState::Disconnected;
            },
        }
    }

    async fn handle_frame(&mut self, msg: Message) {
        let Message::Text(text) = msg else {
            return;
        };
        let downstream: Downstream = match serde_json::from_str(&text) {
            Ok(d) => d,
            Err(e) => {
                let err = crate::error::ProtocolError::UnexpectedTag(e.to_string());
                tracing::error!("protocol violation: {err}");
                self.disconnect("malformed envelope").await;
                return;
            },
        };
        match downstream {
            Downstream::Connected => self.on_connected().await,
            Downstream::Error(message) => {
                let err = crate::error::ProtocolError::ServerError(message);
                tracing::error!("{err}");
                self.disconnect("server error").await;
            },
            Downstream::Pong => {
                if let Some(r) = self.ping_rendezvous.take() {
                    r.resolve(());
                }
            },
            Downstream::Poke(list) => {
                self.playback.enqueue(list.into_vec()).await;
            },
        }
    }

    async fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        {
            let mut shared = self.shared.lock().expect("connection shared state poisoned");
            shared.last_mutation_id_sent = -1;
            let tx = self.upstream_tx.clone();
            let (pending, resolver) = deferred();
            shared.pending_connect = pending;
            shared.resolver = resolver;
            shared.resolver.resolve(tx);
        }
        if let Some(cb) = &self.config.on_online_change {
            cb(true);
        }
    }

    /// Any -> Disconnected (§4.4). Idempotent in effect: calling this while
    /// already disconnected still clears state but does not re-fire
    /// `on_online_change`.
    async fn disconnect(&mut self, reason: &str) {
        let was_connected = self.state == ConnectionState::Connected;
        tracing::info!("disconnecting: {reason}");

        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        self.stream = None;
        self.state = ConnectionState::Disconnected;
        self.playback.clear().await;
        self.ping_rendezvous = None;

        {
            let mut shared = self.shared.lock().expect("connection shared state poisoned");
            shared.last_mutation_id_sent = -1;
            if was_connected {
                let (pending, resolver) = deferred();
                shared.pending_connect = pending;
                shared.resolver = resolver;
            }
        }

        if was_connected {
            if let Some(cb) = &self.config.on_online_change {
                cb(false);
            }
        }
    }

    async fn send(&mut self, msg: Upstream) -> Option<()> {
        let Some(sink) = self.sink.as_mut() else {
            return None;
        };
        let text = serde_json::to_string(&msg).ok()?;
        match sink.send(Message::Text(text.into())).await {
            Ok(()) => Some(()),
            Err(e) => {
                tracing::info!("send failed: {e}");
                self.disconnect("send failed").await;
                None
            },
        }
    }
}

async fn next_frame(
    stream: &mut Option<SplitStream<Socket>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match stream.as_mut() {
        Some(s) => s.next().await,
        None => futures::future::pending().await,
    }
}

fn now_ms() -> i64 {
    use std::time::{
        SystemTime,
        UNIX_EPOCH,
    };
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
