//! Heartbeat & timer sweep (L8): a per-tick snapshot of five time
//! thresholds, applied to every handshaked client.

use std::time::{Duration, Instant};

use crate::client::{Client, Protocol};
use crate::transport::CloseReason;

/// The heartbeat intervals baked into the source (spec §4.8, Design
/// Notes: "parameterize if targeting a different operational profile").
const POLL_BASE_SECS: u64 = 55;
const HEARTBEAT_BASE_SECS: u64 = 61;
const CHALLENGE_SECS: u64 = 15 * 60;
const DEAD_SECS: u64 = 16 * 60;

/// Precomputed thresholds for one sweep, recomputed every tick from
/// `now` and the configured `periodic-interval` (spec §11 supplement,
/// matching `periodic.c`'s per-tick recompute).
pub struct HeartbeatIntervals {
    pub timeout: Instant,
    pub poll: Instant,
    pub heartbeat: Instant,
    pub challenge: Instant,
    pub dead: Instant,
}

impl HeartbeatIntervals {
    pub fn compute(now: Instant, client_timeout: Duration, periodic_interval: Duration) -> Self {
        let back = |secs: u64| now.checked_sub(Duration::from_secs(secs)).unwrap_or(now);
        HeartbeatIntervals {
            timeout: now.checked_sub(client_timeout).unwrap_or(now),
            poll: now
                .checked_sub(Duration::from_secs(POLL_BASE_SECS))
                .and_then(|t| t.checked_add(periodic_interval))
                .unwrap_or(now),
            heartbeat: now
                .checked_sub(Duration::from_secs(HEARTBEAT_BASE_SECS))
                .and_then(|t| t.checked_add(periodic_interval))
                .unwrap_or(now),
            challenge: back(CHALLENGE_SECS),
            dead: back(DEAD_SECS),
        }
    }
}

/// The action the caller (which owns the socket) must take after a
/// heartbeat decision for one client.
#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatAction {
    None,
    /// Send a plain liveness ping (no reply expected).
    SendHeartbeatFrame,
    /// Send a challenge the client must reply to before `dead` passes.
    SendChallenge { server_cb: u32 },
    /// Flush an empty 200 response to the attached HTTP poller.
    FlushEmptyPoll,
    Close(CloseReason),
}

/// Run the per-client heartbeat decision (spec §4.8). Only called for
/// clients with `handshaked == true`; pruning callback slots happens
/// unconditionally before the protocol-specific check.
pub fn sweep_client(client: &Client, intervals: &HeartbeatIntervals, cb_max_age: Duration) -> HeartbeatAction {
    client.cb.prune_older_than(cb_max_age);

    match client.protocol() {
        Protocol::Raw | Protocol::WebSocket => {
            if client.last_recv() < intervals.dead {
                HeartbeatAction::Close(CloseReason::Heartattack)
            } else if client.last_recv() < intervals.challenge {
                let server_cb = client.cb.callback_new(Box::new(|_c, _cb, _j| crate::types::HandlerStatus::Ok));
                HeartbeatAction::SendChallenge { server_cb }
            } else if client.last_send() < intervals.heartbeat {
                HeartbeatAction::SendHeartbeatFrame
            } else {
                HeartbeatAction::None
            }
        }
        Protocol::HttpSurrogate => {
            let has_poller = client.http.as_ref().map(|h| h.lock().unwrap().peer.is_some()).unwrap_or(false);
            if !has_poller && client.last_send() < intervals.timeout {
                HeartbeatAction::Close(CloseReason::Heartattack)
            } else {
                HeartbeatAction::None
            }
        }
        Protocol::HttpPoller => {
            let has_surrogate = client.http.as_ref().map(|h| h.lock().unwrap().peer.is_some()).unwrap_or(false);
            if !has_surrogate && client.last_send() < intervals.heartbeat {
                HeartbeatAction::Close(CloseReason::Heartattack)
            } else if has_surrogate && client.last_send() < intervals.poll {
                HeartbeatAction::FlushEmptyPoll
            } else {
                HeartbeatAction::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientId;
    use std::sync::Arc;

    fn far_future_now() -> Instant {
        // Push `now` well past process start so `checked_sub` for the
        // largest interval (16 minutes) never underflows in a fast test run.
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn fresh_client_needs_no_action() {
        let client = Client::new(ClientId(1), Protocol::Raw, None);
        let now = far_future_now();
        let intervals = HeartbeatIntervals::compute(now, Duration::from_secs(300), Duration::from_secs(30));
        assert_eq!(sweep_client(&client, &intervals, Duration::from_secs(300)), HeartbeatAction::None);
    }

    #[test]
    fn stale_send_triggers_heartbeat_frame() {
        let client = Client::new(ClientId(1), Protocol::Raw, None);
        let now = far_future_now();
        // last_send defaults to client creation time (now - 3600s), well
        // before `now - 61 + periodic_interval`.
        let intervals = HeartbeatIntervals::compute(now, Duration::from_secs(300), Duration::from_secs(30));
        assert_eq!(
            sweep_client(&client, &intervals, Duration::from_secs(300)),
            HeartbeatAction::SendHeartbeatFrame
        );
    }

    #[test]
    fn very_stale_recv_past_challenge_sends_challenge() {
        let client = Client::new(ClientId(1), Protocol::Raw, None);
        client.touch_send();
        let now = far_future_now() + Duration::from_secs(20 * 60);
        let intervals = HeartbeatIntervals::compute(now, Duration::from_secs(300), Duration::from_secs(30));
        match sweep_client(&client, &intervals, Duration::from_secs(300)) {
            HeartbeatAction::SendChallenge { .. } => {}
            other => panic!("expected SendChallenge, got {other:?}"),
        }
    }

    #[test]
    fn dead_client_is_closed_as_heartattack() {
        let client = Client::new(ClientId(1), Protocol::Raw, None);
        let now = far_future_now() + Duration::from_secs(20 * 60);
        let intervals = HeartbeatIntervals::compute(now, Duration::from_secs(300), Duration::from_secs(30));
        assert_eq!(
            sweep_client(&client, &intervals, Duration::from_secs(300)),
            HeartbeatAction::Close(CloseReason::Heartattack)
        );
    }

    #[test]
    fn surrogate_without_poller_past_timeout_closes() {
        let client = Client::new(ClientId(1), Protocol::HttpSurrogate, None);
        let now = far_future_now();
        let intervals = HeartbeatIntervals::compute(now, Duration::from_secs(10), Duration::from_secs(30));
        assert_eq!(
            sweep_client(&client, &intervals, Duration::from_secs(300)),
            HeartbeatAction::Close(CloseReason::Heartattack)
        );
    }

    #[test]
    fn surrogate_with_poller_is_left_alone() {
        let client = Arc::new(Client::new(ClientId(1), Protocol::HttpSurrogate, None));
        let poller = Arc::new(Client::new(ClientId(2), Protocol::HttpPoller, None));
        client.http.as_ref().unwrap().lock().unwrap().peer = Some(poller);
        let now = far_future_now();
        let intervals = HeartbeatIntervals::compute(now, Duration::from_secs(10), Duration::from_secs(30));
        assert_eq!(sweep_client(&client, &intervals, Duration::from_secs(300)), HeartbeatAction::None);
    }
}
