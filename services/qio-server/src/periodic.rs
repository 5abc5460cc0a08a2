//! The two background loops the core needs: draining the broadcast
//! queue (spec.md §4.7, "runs on an event-loop thread") and the
//! `periodic-interval`-cadence heartbeat/timeout sweep (§4.8). Kept as
//! separate tasks since the two run on genuinely different cadences.

use std::sync::Arc;
use std::time::Duration;

use qio_core::{Client, Engine, Protocol};

use crate::surrogate::SurrogateTable;

/// How often the broadcast queue is drained. Not a named config knob;
/// broadcasts should reach subscribers far faster than one heartbeat
/// tick apart, so this runs on its own short, fixed cadence.
const BROADCAST_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

pub fn spawn_broadcast_loop(engine: Arc<Engine>, shutdown: Arc<tokio::sync::Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BROADCAST_DRAIN_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.broadcast_tick().await;
                }
                _ = shutdown.notified() => {
                    // Final drain so nothing queued right before shutdown
                    // is silently dropped (spec.md §6 "drain the
                    // broadcast queue" exit policy).
                    engine.broadcast_tick().await;
                    return;
                }
            }
        }
    })
}

pub fn spawn_heartbeat_loop(
    engine: Arc<Engine>,
    surrogates: Arc<SurrogateTable>,
    periodic_interval: Duration,
    client_timeout: Duration,
    shutdown: Arc<tokio::sync::Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(periodic_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let closed = engine.heartbeat_tick(client_timeout).await;
                    reconcile_surrogates(&surrogates, &closed);
                }
                _ = shutdown.notified() => return,
            }
        }
    })
}

/// The engine doesn't know about the server's sid-keyed surrogate
/// table; after a tick closes clients for inactivity, remove any closed
/// surrogates from it so a later request with the same `sid` doesn't
/// find a dead entry.
fn reconcile_surrogates(surrogates: &SurrogateTable, closed: &[Arc<Client>]) {
    for client in closed {
        if client.protocol() != Protocol::HttpSurrogate {
            continue;
        }
        if let Some(http) = &client.http {
            let sid = http.lock().unwrap().session_id;
            surrogates.remove(sid);
        }
    }
}
