//! Event Router (L9): ties the trie, subscription table, client state,
//! callback slots, broadcast pipeline, and heartbeat sweep together.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qio_wire::event_text::{encode as encode_event_text, EventText};

use crate::broadcast::BroadcastPipeline;
use crate::callback::{CallbackBody, NO_CALLBACK};
use crate::client::{AcceptOutcome, AddOutcome, Client, FairnessGate, Protocol};
use crate::config::EngineConfig;
use crate::heartbeat::{self, HeartbeatAction, HeartbeatIntervals};
use crate::registry::ClientRegistry;
use crate::sub::{sub_get, sub_unref, Subscription};
use crate::transport::CloseReason;
use crate::trie::{Event, EventTrie};
use crate::types::{HandlerFn, HandlerStatus, OffFn, OnFn};

pub struct Engine {
    pub trie: EventTrie,
    pub fairness: FairnessGate,
    pub config: EngineConfig,
    pub broadcast: BroadcastPipeline,
    pub registry: ClientRegistry,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let fairness = FairnessGate::new(
            config.clients_subs_total,
            config.clients_subs_pressure_pct,
            config.max_clients,
            config.clients_subs_min,
        );
        Arc::new(Engine {
            trie: EventTrie::new(),
            fairness,
            config,
            broadcast: BroadcastPipeline::new(),
            registry: ClientRegistry::new(),
        })
    }

    pub fn register_event(
        &self,
        path: &str,
        handler_fn: Option<HandlerFn>,
        on_fn: Option<OnFn>,
        off_fn: Option<OffFn>,
        handles_children: bool,
    ) -> Option<Arc<Event>> {
        self.trie.insert(path, handler_fn, on_fn, off_fn, handles_children)
    }

    fn sub_get_for(&self, event: &Arc<Event>, ev_extra: &str, or_create: bool) -> Option<Arc<Subscription>> {
        sub_get(event, ev_extra, or_create, self.config.broadcast_threads, self.config.max_clients as usize)
    }

    /// `route(C, path, client_cb, json)` (spec §4.9), including the
    /// built-in `/qio/*` endpoints dispatched here rather than through
    /// the generic `handler_fn` slot, since they need engine-level
    /// (async, cross-client) state the synchronous handler type doesn't
    /// carry. See DESIGN.md.
    pub async fn route(&self, client: &Arc<Client>, path: &str, client_cb: u32, json: &str) {
        let cleaned = qio_wire::clean_path(path);

        if cleaned == "/qio/ping" {
            self.cb(client, client_cb, 200, None, None, None).await;
            return;
        }
        if cleaned == "/qio/hostname" {
            let data = self
                .config
                .public_address
                .as_ref()
                .map(|addr| serde_json::to_string(addr).unwrap_or_else(|_| "null".to_owned()));
            self.cb(client, client_cb, 200, data.as_deref(), None, None).await;
            return;
        }
        if cleaned == "/qio/on" || cleaned == "/qio/off" {
            self.route_on_off(client, &cleaned, client_cb, json).await;
            return;
        }
        if let Some(id_str) = cleaned.strip_prefix("/qio/callback/") {
            self.route_callback(client, id_str, client_cb, json).await;
            return;
        }

        let Some((event, ev_extra)) = self.trie.query(&cleaned) else {
            self.cb(client, client_cb, 404, None, Some("not found"), None).await;
            return;
        };
        let status = match &event.handler_fn {
            Some(f) => f(client, &ev_extra, client_cb, json),
            None => HandlerStatus::Ok,
        };
        self.apply_status(client, client_cb, status).await;
    }

    async fn route_on_off(&self, client: &Arc<Client>, which: &str, client_cb: u32, json: &str) {
        let Ok(target) = serde_json::from_str::<String>(json) else {
            self.cb(client, client_cb, 400, None, Some("malformed path argument"), None).await;
            return;
        };
        let Some((event, ev_extra)) = self.trie.query(&target) else {
            self.cb(client, client_cb, 404, None, Some("not found"), None).await;
            return;
        };
        if which == "/qio/on" {
            self.on(client, &event, &ev_extra, client_cb).await;
        } else {
            self.off(client, &event, &ev_extra).await;
            self.cb(client, client_cb, 200, None, None, None).await;
        }
    }

    async fn route_callback(&self, client: &Arc<Client>, id_str: &str, client_cb: u32, json: &str) {
        let Ok(server_cb) = id_str.parse::<u32>() else {
            self.cb(client, client_cb, 400, None, Some("malformed callback id"), None).await;
            return;
        };
        match client.cb.callback_fire(client, server_cb, client_cb, json) {
            Ok(status) => self.apply_status(client, client_cb, status).await,
            Err(_) => self.cb(client, client_cb, 404, None, Some("callback not found"), None).await,
        }
    }

    async fn apply_status(&self, client: &Arc<Client>, client_cb: u32, status: HandlerStatus) {
        match status {
            HandlerStatus::Ok => self.cb(client, client_cb, 200, None, None, None).await,
            HandlerStatus::Err { code, message } => self.cb(client, client_cb, code, None, Some(&message), None).await,
            HandlerStatus::Handled => {}
        }
    }

    /// `on(C, E, ev_extra, client_cb)` (spec §4.9). `client_sub_add` is
    /// the single admission point (it already distinguishes
    /// created/pending/active/denied per §4.3); `on_fn` only runs for a
    /// genuinely new subscription, reconciling §4.9 step 3's "already
    /// has this sub" wording with the pending-race worked example in
    /// §8 scenario 3 (see DESIGN.md).
    pub async fn on(&self, client: &Arc<Client>, event: &Arc<Event>, ev_extra: &str, client_cb: u32) {
        let Some(sub) = self.sub_get_for(event, ev_extra, true) else {
            self.cb(client, client_cb, 404, None, Some("not found"), None).await;
            return;
        };

        match client.client_sub_add(Arc::clone(&sub), &self.fairness) {
            AddOutcome::Active => {
                sub_unref(&sub);
                self.cb(client, client_cb, 200, None, None, None).await;
            }
            AddOutcome::Pending => {
                sub_unref(&sub);
                self.cb(client, client_cb, 202, None, Some("subscription pending"), None).await;
            }
            AddOutcome::Null => {
                sub_unref(&sub);
                self.cb(client, client_cb, 429, None, Some("enhance your calm"), None).await;
            }
            AddOutcome::Created => {
                let status = match &event.on_fn {
                    Some(f) => f(client, ev_extra),
                    None => HandlerStatus::Ok,
                };
                match status {
                    HandlerStatus::Handled => {
                        // Deferred: the handler owns finishing the
                        // subscription (accept/reject) and replying,
                        // asynchronously, later. Do not release the
                        // query hold here; whoever finishes the
                        // subscription also unrefs it.
                    }
                    HandlerStatus::Ok => {
                        match client.client_sub_accept(&sub) {
                            AcceptOutcome::Active => self.cb(client, client_cb, 200, None, None, None).await,
                            AcceptOutcome::Tombstoned => {
                                if let Some(off_fn) = &event.off_fn {
                                    off_fn(client, ev_extra);
                                }
                                self.cb(client, client_cb, 200, None, None, None).await;
                            }
                            AcceptOutcome::Null => self.cb(client, client_cb, 429, None, Some("enhance your calm"), None).await,
                        }
                        sub_unref(&sub);
                    }
                    HandlerStatus::Err { code, message } => {
                        client.client_sub_reject(&sub);
                        sub_unref(&sub);
                        self.cb(client, client_cb, code, None, Some(&message), None).await;
                    }
                }
            }
        }
    }

    /// `off(C, E, ev_extra)` (spec §4.9).
    pub async fn off(&self, client: &Arc<Client>, event: &Arc<Event>, ev_extra: &str) {
        let Some(sub) = self.sub_get_for(event, ev_extra, false) else {
            return;
        };
        if let Some(true) = client.client_sub_remove(&sub) {
            if let Some(off_fn) = &event.off_fn {
                off_fn(client, ev_extra);
            }
        }
        sub_unref(&sub);
    }

    /// `send(C, E, extra, json, cb, cb_data, free_fn)` (spec §4.9):
    /// server-initiated delivery to one already-subscribed client.
    pub async fn send(&self, client: &Arc<Client>, sub: &Arc<Subscription>, json: &str, reply_body: Option<CallbackBody>) {
        if !client.client_sub_active(sub) {
            tracing::warn!(client_id = client.id.0, path = %sub.parent.path, "send to a client without an active subscription");
        }
        let server_cb = match reply_body {
            Some(body) => client.cb.callback_new(body),
            None => NO_CALLBACK,
        };
        self.deliver(client, &sub.parent.path, server_cb, json).await;
    }

    /// `cb(C, client_cb, code, err_msg, json, cb_fn, cb_data, free_fn)`.
    pub async fn cb(&self, client: &Arc<Client>, client_cb: u32, code: u16, data: Option<&str>, err_msg: Option<&str>, reply_body: Option<CallbackBody>) {
        if client_cb == 0 {
            return;
        }
        let path = qio_wire::callback::callback_path(client_cb);
        let json = match err_msg {
            Some(msg) => qio_wire::callback::error_envelope(code, data, msg),
            None => qio_wire::callback::success_envelope(code, data),
        };
        let server_cb = match reply_body {
            Some(body) => client.cb.callback_new(body),
            None => NO_CALLBACK,
        };
        self.deliver(client, &path, server_cb, &json).await;
    }

    async fn deliver(&self, client: &Arc<Client>, path: &str, server_cb: u32, json: &str) {
        let text = encode_event_text(&EventText {
            path: path.to_owned(),
            client_cb: server_cb,
            json: json.to_owned(),
        });
        match client.protocol() {
            Protocol::Raw => {
                if let Some(sock) = &client.socket {
                    sock.write(qio_wire::raw::frame(text.as_bytes())).await;
                    client.touch_send();
                }
            }
            Protocol::WebSocket => {
                if let Some(sock) = &client.socket {
                    sock.write(qio_wire::ws::frame_text(text.as_bytes())).await;
                    client.touch_send();
                }
            }
            Protocol::HttpSurrogate => self.deliver_to_surrogate(client, &text).await,
            // Pollers are never a `send`/`cb` target directly; they are
            // only ever flushed via `flush_poller` on behalf of their
            // paired surrogate.
            Protocol::HttpPoller => {}
        }
    }

    async fn deliver_to_surrogate(&self, surrogate: &Arc<Client>, line: &str) {
        let Some(http) = &surrogate.http else { return };
        let poller_and_body = {
            let mut state = http.lock().unwrap();
            if state.receiving {
                state.outgoing.push(line.to_owned());
                return;
            }
            match state.peer.take() {
                Some(poller) => {
                    let mut body = state.outgoing.join("\n");
                    if !body.is_empty() {
                        body.push('\n');
                    }
                    body.push_str(line);
                    body.push('\n');
                    state.outgoing.clear();
                    Some((poller, body))
                }
                None => {
                    state.outgoing.push(line.to_owned());
                    None
                }
            }
        };
        if let Some((poller, body)) = poller_and_body {
            self.flush_poller(&poller, body).await;
        }
    }

    /// Flush `body` as a `200 OK` to `poller` and release it. Used both
    /// for real content and for the empty-body "unblock the proxy"
    /// heartbeat flush (spec §4.8) and the "replace any previous
    /// poller" step of attaching a new one (spec §4.6).
    pub async fn flush_poller(&self, poller: &Arc<Client>, body: String) {
        let keep_alive = poller.http.as_ref().map(|h| h.lock().unwrap().keep_alive).unwrap_or(true);
        if let Some(sock) = &poller.socket {
            let resp = qio_wire::http::response_200(body.as_bytes(), "text/plain", keep_alive);
            sock.write(resp).await;
            poller.touch_send();
            if !keep_alive {
                sock.close(CloseReason::Exit).await;
            }
        }
    }

    /// Attach `poller` to `surrogate` (spec §4.6 response coupling): if
    /// content is already buffered, flush it immediately; otherwise
    /// replace any previously-attached poller (flushed empty) and wait.
    pub async fn attach_poller(&self, surrogate: &Arc<Client>, poller: Arc<Client>) {
        let Some(http) = &surrogate.http else { return };
        let outcome = {
            let mut state = http.lock().unwrap();
            if state.outgoing.is_empty() {
                let previous = state.peer.replace(Arc::clone(&poller));
                Ok(previous)
            } else {
                let mut body = state.outgoing.join("\n");
                body.push('\n');
                state.outgoing.clear();
                Err(body)
            }
        };
        match outcome {
            Ok(Some(previous)) => self.flush_poller(&previous, String::new()).await,
            Ok(None) => {}
            Err(body) => self.flush_poller(&poller, body).await,
        }
    }

    /// Periodic heartbeat/timer sweep (spec §4.8), run once per
    /// `periodic-interval` tick. Returns every client removed this tick
    /// so the caller can reconcile its own tables (e.g. the server's
    /// sid-keyed surrogate table, which this crate doesn't know about).
    pub async fn heartbeat_tick(&self, client_timeout: Duration) -> Vec<Arc<Client>> {
        let now = Instant::now();
        let intervals = HeartbeatIntervals::compute(now, client_timeout, Duration::from_secs(self.config.periodic_interval_secs));
        let cb_max_age = Duration::from_secs(self.config.clients_cb_max_age_secs);
        let mut closed = Vec::new();

        for client in self.registry.snapshot() {
            if !client.handshaked.load(Ordering::SeqCst) {
                continue;
            }
            match heartbeat::sweep_client(&client, &intervals, cb_max_age) {
                HeartbeatAction::None => {}
                HeartbeatAction::SendHeartbeatFrame => {
                    if let Some(sock) = &client.socket {
                        let bytes = match client.protocol() {
                            Protocol::Raw => qio_wire::raw::HEARTBEAT_FRAME.to_vec(),
                            Protocol::WebSocket => qio_wire::ws::frame_text(b"/qio/heartbeat:0=null"),
                            _ => continue,
                        };
                        sock.write(bytes).await;
                        client.touch_send();
                    }
                }
                HeartbeatAction::SendChallenge { server_cb } => {
                    self.deliver(&client, "/qio/heartbeat", server_cb, "null").await;
                }
                HeartbeatAction::FlushEmptyPoll => {
                    self.flush_poller(&client, String::new()).await;
                }
                HeartbeatAction::Close(reason) => {
                    if let Some(sock) = &client.socket {
                        if client.protocol() == Protocol::WebSocket {
                            if let Some(ws_reason) = reason.to_ws_close_reason() {
                                sock.write(qio_wire::ws::frame_close(&ws_reason)).await;
                            }
                        }
                        sock.close(reason).await;
                    }
                    self.registry.remove(client.id);
                    closed.push(client);
                }
            }
        }
        closed
    }

    /// Drain the broadcast queue, fanning frames out to every subscriber
    /// across `broadcast-threads` shards in parallel (spec §4.7 step 2).
    ///
    /// Raw/WS writes are spawned so the shard walk never blocks on a slow
    /// socket; HTTP surrogates need the poller-coupling logic in
    /// `deliver_to_surrogate`, which takes `&self` and can't be spawned
    /// off a borrowed `&self` tick, so those are collected during the
    /// walk and delivered (sequentially, per entry) right after.
    pub async fn broadcast_tick(&self) -> usize {
        let mut http_deliveries: Vec<(Arc<Client>, String)> = Vec::new();
        let count = self
            .broadcast
            .tick(|sub, frames| {
                for shard in sub.subscribers.shard_snapshots() {
                    for subscriber in shard {
                        match frames.for_protocol(subscriber.protocol()) {
                            crate::broadcast::FrameRef::Bytes(bytes) => {
                                if let Some(sock) = subscriber.socket.clone() {
                                    let bytes = bytes.to_vec();
                                    let subscriber = Arc::clone(&subscriber);
                                    tokio::spawn(async move {
                                        if sock.write(bytes).await {
                                            subscriber.touch_send();
                                        }
                                    });
                                }
                            }
                            crate::broadcast::FrameRef::Line(line) => {
                                http_deliveries.push((Arc::clone(&subscriber), line.to_owned()));
                            }
                        }
                    }
                }
            })
            .await;

        for (subscriber, line) in http_deliveries {
            self.deliver_to_surrogate(&subscriber, &line).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientId;
    use crate::config::RawEngineConfig;
    use crate::transport::SocketWriter;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingSocket {
        written: StdMutex<Vec<Vec<u8>>>,
        closed: StdMutex<Option<CloseReason>>,
    }

    impl RecordingSocket {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSocket {
                written: StdMutex::new(Vec::new()),
                closed: StdMutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SocketWriter for RecordingSocket {
        async fn write(&self, bytes: Vec<u8>) -> bool {
            self.written.lock().unwrap().push(bytes);
            true
        }
        async fn close(&self, reason: CloseReason) {
            *self.closed.lock().unwrap() = Some(reason);
        }
    }

    fn test_engine() -> Arc<Engine> {
        Engine::new(EngineConfig::from_raw(RawEngineConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn ping_replies_with_200_success_envelope() {
        let engine = test_engine();
        let sock = RecordingSocket::new();
        let client = Arc::new(Client::new(ClientId::next(), Protocol::Raw, Some(sock.clone())));
        engine.route(&client, "/qio/ping", 1, "null").await;

        let written = sock.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        let (body, _consumed) = match qio_wire::raw::try_decode_frame(&written[0]) {
            qio_wire::raw::FrameResult::Complete { body, consumed } => (body, consumed),
            other => panic!("expected complete frame, got {other:?}"),
        };
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text, "/qio/callback/1:0={\"code\":200,\"data\":null}");
    }

    #[tokio::test]
    async fn hostname_returns_configured_public_address() {
        let mut raw = RawEngineConfig::default();
        raw.public_address = Some("qio.example.com".to_owned());
        let engine = Engine::new(EngineConfig::from_raw(raw).unwrap());
        let sock = RecordingSocket::new();
        let client = Arc::new(Client::new(ClientId::next(), Protocol::Raw, Some(sock.clone())));
        engine.route(&client, "/qio/hostname", 1, "null").await;

        let written = sock.written.lock().unwrap();
        let body = match qio_wire::raw::try_decode_frame(&written[0]) {
            qio_wire::raw::FrameResult::Complete { body, .. } => body,
            other => panic!("{other:?}"),
        };
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("\"qio.example.com\""));
    }

    #[tokio::test]
    async fn subscribe_then_broadcast_reaches_subscriber() {
        let engine = test_engine();
        engine.register_event("/room", None, None, None, false);
        let sock = RecordingSocket::new();
        let client = Arc::new(Client::new(ClientId::next(), Protocol::Raw, Some(sock.clone())));

        engine.route(&client, "/qio/on", 1, "\"/room\"").await;
        {
            let written = sock.written.lock().unwrap();
            let body = match qio_wire::raw::try_decode_frame(&written[0]) {
                qio_wire::raw::FrameResult::Complete { body, .. } => body,
                other => panic!("{other:?}"),
            };
            assert_eq!(String::from_utf8(body).unwrap(), "/qio/callback/1:0={\"code\":200,\"data\":null}");
        }

        engine.broadcast.broadcast(&engine.trie, "/room", "\"hi\"");
        engine.broadcast_tick().await;
        // fan-out is spawned onto tokio tasks; yield so they run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let written = sock.written.lock().unwrap();
        assert!(written.iter().any(|w| {
            matches!(qio_wire::raw::try_decode_frame(w), qio_wire::raw::FrameResult::Complete { body, .. } if body == b"/room:0=\"hi\"")
        }));
    }

    #[tokio::test]
    async fn unknown_event_path_gets_404_callback() {
        let engine = test_engine();
        let sock = RecordingSocket::new();
        let client = Arc::new(Client::new(ClientId::next(), Protocol::Raw, Some(sock.clone())));
        engine.route(&client, "/nope", 5, "null").await;

        let written = sock.written.lock().unwrap();
        let body = match qio_wire::raw::try_decode_frame(&written[0]) {
            qio_wire::raw::FrameResult::Complete { body, .. } => body,
            other => panic!("{other:?}"),
        };
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("\"code\":404"));
    }

    #[tokio::test]
    async fn callback_zero_is_discarded_without_writing() {
        let engine = test_engine();
        let sock = RecordingSocket::new();
        let client = Arc::new(Client::new(ClientId::next(), Protocol::Raw, Some(sock.clone())));
        engine.cb(&client, 0, 200, None, None, None).await;
        assert!(sock.written.lock().unwrap().is_empty());
    }
}
