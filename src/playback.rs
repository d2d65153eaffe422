//! Poke playback pipeline: buffering, per-source clock-offset estimation,
//! jitter-buffered pacing, and frame-paced merge-and-apply against the store.
//!
//! This is the least delegatable part of the whole connection: the teacher's
//! `base_client.rs` plays an analogous buffering role for query transitions,
//! but the source-clock-offset estimation and jitter pacing here have no
//! direct counterpart in the teacher and are built from the distilled spec's
//! drain-step algorithm directly (§4.5).

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

use tokio::sync::mpsc;

use crate::{
    error::StoreError,
    ordered_mutex::OrderedMutex,
    store::Store,
    types::{
        CombinedPoke,
        PokeBody,
    },
};

/// Events the playback loop raises back to the connection state machine. It
/// never disconnects directly: the connection owns the socket and buffer
/// lifecycle, so playback only requests the transition.
#[derive(Debug)]
pub enum PlaybackEvent {
    /// The store rejected a poke with the "unexpected base cookie" signature
    /// (§4.5 step 6 / §7). Recoverable: disconnect and let the watchdog
    /// reconnect.
    RecoverableError,
    /// Any other store rejection. Surfaced to the host; the connection still
    /// disconnects since playback cannot make progress.
    FatalError(StoreError),
}

struct PlaybackState {
    pokes: VecDeque<PokeBody>,
    /// Reset on every reconnect by constructing a fresh `Playback`.
    offsets: HashMap<String, i64>,
}

pub struct Playback {
    store: Arc<dyn Store>,
    state: Arc<OrderedMutex<PlaybackState>>,
    jitter_buffer: Duration,
    frame_interval: Duration,
    loop_active: Arc<AtomicBool>,
    epoch: Instant,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Playback {
    pub fn new(
        store: Arc<dyn Store>,
        jitter_buffer: Duration,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        // Design Notes §9: no native frame tick exists in a server/CLI-hosted
        // client, so this timer substitute is the only cadence implemented.
        let frame_interval = Duration::from_millis(16).max(jitter_buffer / 4);
        Self {
            store,
            state: Arc::new(OrderedMutex::new(PlaybackState {
                pokes: VecDeque::new(),
                offsets: HashMap::new(),
            })),
            jitter_buffer,
            frame_interval,
            loop_active: Arc::new(AtomicBool::new(false)),
            epoch: Instant::now(),
            events,
        }
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Enqueues newly received pokes, preserving receive order, and starts
    /// the playback loop if it isn't already running.
    pub async fn enqueue(self: &Arc<Self>, pokes: Vec<PokeBody>) {
        if pokes.is_empty() {
            return;
        }
        self.state
            .with_lock(|s| {
                let pokes = pokes;
                async move {
                    s.pokes.extend(pokes);
                }
            })
            .await;
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let this = self.clone();
            tokio::spawn(async move { this.run_loop().await });
        }
    }

    /// Drops all buffered pokes without applying them, and forgets every
    /// per-source clock-offset calibration (§4.4: `_disconnect` clears the
    /// `PokeBuffer`; §3: `ClientTimestampOffsets` is "reset on reconnect").
    /// A stale offset left behind for the next connection would mis-pace
    /// that source's first poke against a clock reading from the prior one.
    pub async fn clear(&self) {
        self.state
            .with_lock(|s| {
                s.pokes.clear();
                s.offsets.clear();
                async move {}
            })
            .await;
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.frame_interval).await;
            let keep_going = self.drain_once().await;
            if !keep_going {
                self.loop_active.store(false, Ordering::SeqCst);
                return;
            }
        }
    }

    /// Runs one drain step inside the mutex and reports whether another
    /// frame tick should be scheduled.
    async fn drain_once(&self) -> bool {
        let now_ms = self.now_ms();
        let jitter_ms = self.jitter_buffer.as_millis() as i64;
        let store = self.store.clone();
        let events = self.events.clone();
        self.state
            .with_lock(move |s| {
                let store = store.clone();
                let events = events.clone();
                async move {
                    let batch = drain_step(s, now_ms, jitter_ms);
                    let Some(batch) = batch else {
                        return !s.pokes.is_empty();
                    };
                    let combined = combine(&batch);
                    match store.poke(combined).await {
                        Ok(()) => !s.pokes.is_empty(),
                        Err(e) if e.is_unexpected_base_cookie() => {
                            tracing::info!("poke rejected: {e}; disconnecting to recover");
                            s.pokes.clear();
                            let _ = events.send(PlaybackEvent::RecoverableError);
                            false
                        },
                        Err(e) => {
                            tracing::error!("poke rejected fatally: {e}");
                            s.pokes.clear();
                            let _ = events.send(PlaybackEvent::FatalError(e));
                            false
                        },
                    }
                }
            })
            .await
    }
}

/// Steps 1-4 of §4.5's drain step: pulls ripe pokes off the buffer head in
/// order, stopping at the first poke whose jitter-buffer deadline hasn't
/// elapsed. Returns `None` if nothing is ripe yet.
fn drain_step(state: &mut PlaybackState, now_ms: i64, jitter_ms: i64) -> Option<Vec<PokeBody>> {
    let mut batch = Vec::new();
    while let Some(p) = state.pokes.front() {
        if let Some(ref client_id) = p.client_id {
            // First-observation calibration: the absolute offset may be
            // wrong, but the same offset is reapplied to every subsequent
            // poke from this source, preserving relative pacing. Known
            // limitation (unresolved upstream): this can apply pokes too
            // early if a gap opens between observation and next delivery.
            let offset = *state
                .offsets
                .entry(client_id.clone())
                .or_insert_with(|| now_ms - p.timestamp);
            let deadline = offset + p.timestamp + jitter_ms;
            if deadline > now_ms {
                break;
            }
        }
        batch.push(state.pokes.pop_front().expect("front() just returned Some"));
    }
    if batch.is_empty() {
        None
    } else {
        Some(batch)
    }
}

/// Step 5 of §4.5's drain step: merges a contiguous ripe batch into one
/// atomic transition.
fn combine(batch: &[PokeBody]) -> CombinedPoke {
    let first = batch.first().expect("combine called with non-empty batch");
    let last = batch.last().expect("combine called with non-empty batch");
    CombinedPoke {
        base_cookie: first.base_cookie,
        cookie: last.cookie,
        last_mutation_id: last.last_mutation_id,
        patch: batch.iter().flat_map(|p| p.patch.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::types::PushBody;

    struct RecordingStore {
        applied: Mutex<Vec<CombinedPoke>>,
        reject_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Store for RecordingStore {
        fn client_id(&self) -> &str {
            "store"
        }

        fn auth(&self) -> Option<&str> {
            None
        }

        fn idb_name(&self) -> &str {
            "recording-store"
        }

        fn current_cookie(&self) -> crate::types::Version {
            None
        }

        fn last_mutation_id_received(&self) -> u64 {
            0
        }

        async fn poke(&self, combined: CombinedPoke) -> Result<(), StoreError> {
            if let Some(msg) = self.reject_with.lock().clone() {
                return Err(StoreError(msg));
            }
            self.applied.lock().push(combined);
            Ok(())
        }

        fn install_pusher(&self, _hook: Arc<dyn crate::store::PusherHook>) {}

        async fn query(&self, _body: serde_json::Value) -> Result<serde_json::Value, StoreError> {
            Ok(json!(null))
        }

        fn subscribe(
            &self,
            _body: serde_json::Value,
            _on_data: mpsc::UnboundedSender<serde_json::Value>,
        ) -> crate::store::Unsubscribe {
            crate::store::Unsubscribe::noop()
        }

        async fn mutate(
            &self,
            _name: &str,
            _args: serde_json::Value,
        ) -> Result<serde_json::Value, StoreError> {
            Ok(json!(null))
        }
    }

    fn poke(base: Option<i64>, cookie: Option<i64>, lmid: u64, ts: i64, patch: serde_json::Value) -> PokeBody {
        PokeBody {
            base_cookie: base,
            cookie,
            last_mutation_id: lmid,
            patch: vec![patch],
            timestamp: ts,
            client_id: Some("c".to_string()),
        }
    }

    #[allow(dead_code)]
    fn unused(_: PushBody) {}

    #[tokio::test(start_paused = true)]
    async fn merges_contiguous_pokes_within_a_frame() {
        let store = Arc::new(RecordingStore {
            applied: Mutex::new(Vec::new()),
            reject_with: Mutex::new(None),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let playback = Arc::new(Playback::new(store.clone(), Duration::ZERO, tx));

        let now = playback.now_ms();
        playback
            .enqueue(vec![
                poke(Some(0), Some(1), 5, now, json!("A")),
                poke(Some(1), Some(2), 6, now, json!("B")),
            ])
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let applied = store.applied.lock().clone();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].base_cookie, Some(0));
        assert_eq!(applied[0].cookie, Some(2));
        assert_eq!(applied[0].last_mutation_id, 6);
        assert_eq!(applied[0].patch, vec![json!("A"), json!("B")]);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_buffer_holds_pokes_until_deadline() {
        let store = Arc::new(RecordingStore {
            applied: Mutex::new(Vec::new()),
            reject_with: Mutex::new(None),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let playback = Arc::new(Playback::new(store.clone(), Duration::from_millis(250), tx));

        let now = playback.now_ms();
        playback
            .enqueue(vec![poke(None, Some(1), 1, now, json!("A"))])
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.applied.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.applied.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_base_cookie_emits_recoverable_error_and_clears_buffer() {
        let store = Arc::new(RecordingStore {
            applied: Mutex::new(Vec::new()),
            reject_with: Mutex::new(Some("unexpected base cookie for poke".to_string())),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = Arc::new(Playback::new(store.clone(), Duration::ZERO, tx));

        let now = playback.now_ms();
        playback
            .enqueue(vec![poke(Some(0), Some(1), 1, now, json!("A"))])
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(rx.recv().await, Some(PlaybackEvent::RecoverableError)));
    }
}
