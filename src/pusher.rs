//! Mutation pusher (§4.6): the store's outbound plugin. Drains a batch of
//! mutations onto the connection in id order, guarding against re-sending an
//! id already transmitted on this connection.
//!
//! Grounded on the teacher's `_worker_once` "communicate" loop
//! (`client/worker.rs`), which also drains a local buffer onto the wire in
//! order and tolerates the transport racing ahead; the per-connection
//! monotonic-id guard here has no teacher counterpart and is built directly
//! from the distilled spec's step-by-step contract.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use crate::{
    connection::ConnectionHandle,
    store::{
        PushRequest,
        PushResponse,
        PusherHook,
    },
    types::{
        PushBody,
        Upstream,
    },
};

pub struct MutationPusher {
    connection: ConnectionHandle,
    max_random_push_latency: Duration,
}

impl MutationPusher {
    pub fn new(connection: ConnectionHandle, max_random_push_latency: Duration) -> Self {
        Self {
            connection,
            max_random_push_latency,
        }
    }

    async fn random_latency(&self) {
        if self.max_random_push_latency.is_zero() {
            return;
        }
        let millis = rand::rng().random_range(0..self.max_random_push_latency.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl PusherHook for MutationPusher {
    /// §4.6 steps 1-5.
    async fn push(&self, request: PushRequest) -> PushResponse {
        // Step 1: fire-and-forget connect request if nothing is in flight.
        self.connection.request_connect();

        // Step 2: await a connected socket.
        let Some(upstream) = self.connection.pending_connect().wait().await else {
            // The connection was torn down before it ever connected (e.g.
            // `close()` raced ahead). The store will re-invoke the pusher on
            // its own retry cycle per §4.6 step 5's rationale.
            return PushResponse::ok();
        };

        // Step 3: test/simulation-only jitter.
        self.random_latency().await;

        // Steps 4-5: single-flight-per-connection, strictly ascending ids.
        for mutation in request.mutations {
            if mutation.id <= self.connection.last_mutation_id_sent() {
                continue;
            }
            self.connection.set_last_mutation_id_sent(mutation.id);
            let body = PushBody {
                mutations: vec![mutation],
                client_group_id: None,
                profile_id: None,
                timestamp: now_ms(),
            };
            if upstream.send(Upstream::Push(body)).is_err() {
                // Worker task gone (connection torn down mid-drain); stop.
                // The store re-drives the remaining mutations on retry.
                break;
            }
        }

        PushResponse::ok()
    }
}

fn now_ms() -> i64 {
    use std::time::{
        SystemTime,
        UNIX_EPOCH,
    };
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
