//! Wire-level codecs for the event/subscription/broadcast broker.
//!
//! Everything in this crate is pure and synchronous: path canonicalization,
//! the raw-dialect event text grammar, raw/WebSocket/HTTP/Flash framing,
//! and the `/qio/callback` JSON envelope shape. No sockets, no locks, no
//! async — `qio-core` and the server binary own those concerns.

pub mod callback;
pub mod event_text;
pub mod flash;
pub mod http;
pub mod path;
pub mod raw;
pub mod ws;

pub use event_text::{decode as decode_event_text, encode as encode_event_text, EventText, EventTextError};
pub use path::clean_path;
