//! A real-time, room-scoped synchronization client for an offline-first
//! replica store.
//!
//! [`PokeSync`] connects to a server over a persistent WebSocket, streams
//! ordered state deltas ("pokes") into an embedded [`Store`], and pushes the
//! store's local optimistic mutations back out. The two hardest pieces are
//! the connection/push lifecycle (module [`connection`] internally, exposed
//! through [`PokeSync`]) and the poke playback pipeline ([`playback`]
//! internally), which buffers, paces, and merges incoming pokes before
//! handing them to the store as atomic `baseCookie -> cookie` transitions.
//!
//! Persistence, conflict resolution, cross-tab coordination, and
//! authentication token minting are out of scope and delegated to the
//! embedded [`Store`] implementation a host application supplies.

mod client;
mod connection;
mod deferred;
pub mod error;
mod ordered_mutex;
mod playback;
mod pusher;
mod sleep;
mod socket;
pub mod store;
pub mod types;

pub use client::{
    Config,
    PokeSync,
};
pub use store::Store;
