//! Shared handler/status types threaded through the trie, router, and
//! callback slots.

use std::sync::Arc;

use crate::client::Client;

/// Outcome of a handler invocation (on-request, on-subscribe). Mirrors
/// spec §4.9's `OK` / `ERR` / `HANDLED` vocabulary; `Err` carries the
/// code and message the router turns into a callback envelope.
#[derive(Debug, Clone)]
pub enum HandlerStatus {
    Ok,
    Err { code: u16, message: String },
    /// The handler already wrote its own reply; the router must not.
    Handled,
}

/// `on-request`: invoked when a client routes an event at this path.
pub type HandlerFn = Arc<dyn Fn(&Client, &str, u32, &str) -> HandlerStatus + Send + Sync>;

/// `on-subscribe`: invoked when a client's subscription is accepted by
/// the fairness policy and is about to go active.
pub type OnFn = Arc<dyn Fn(&Client, &str) -> HandlerStatus + Send + Sync>;

/// `on-unsubscribe`: invoked after a subscription is actually removed.
pub type OffFn = Arc<dyn Fn(&Client, &str) + Send + Sync>;
