//! Transport-agnostic pub/sub engine: event trie, subscription table,
//! per-client state, callback slots, broadcast pipeline, heartbeat sweep,
//! and the event router tying them together. Protocol framing and socket
//! I/O live in `qio-wire` and the server binary respectively; this crate
//! only ever hands finished frames to a [`transport::SocketWriter`].

pub mod broadcast;
pub mod callback;
pub mod client;
pub mod config;
pub mod engine;
pub mod heartbeat;
pub mod registry;
pub mod sub;
pub mod transport;
pub mod trie;
pub mod types;

pub use client::{AcceptOutcome, AddOutcome, Client, ClientId, FairnessGate, HttpState, Protocol};
pub use config::{EngineConfig, EngineConfigError, RawEngineConfig};
pub use engine::Engine;
pub use sub::Subscription;
pub use transport::{CloseReason, SocketWriter};
pub use trie::{Event, EventTrie};
pub use types::{HandlerFn, HandlerStatus, OffFn, OnFn};
