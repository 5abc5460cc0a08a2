//! Behavioral coverage of the trie/subscription/router stack end-to-end,
//! through `Engine::route`/`on`/`off` rather than the individual module
//! unit tests. Exercises the pending-subscription race from spec.md §8
//! scenario 3 and the fairness admission boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use qio_core::client::{Client, ClientId};
use qio_core::config::{EngineConfig, RawEngineConfig};
use qio_core::transport::{CloseReason, SocketWriter};
use qio_core::{Engine, Protocol};

struct RecordingSocket {
    written: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSocket {
    fn new() -> Arc<Self> {
        Arc::new(RecordingSocket { written: Mutex::new(Vec::new()) })
    }

    fn bodies(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|w| match qio_wire::raw::try_decode_frame(w) {
                qio_wire::raw::FrameResult::Complete { body, .. } => String::from_utf8(body).unwrap(),
                other => panic!("expected complete raw frame, got {other:?}"),
            })
            .collect()
    }
}

#[async_trait]
impl SocketWriter for RecordingSocket {
    async fn write(&self, bytes: Vec<u8>) -> bool {
        self.written.lock().unwrap().push(bytes);
        true
    }
    async fn close(&self, _reason: CloseReason) {}
}

fn engine() -> Arc<Engine> {
    Engine::new(EngineConfig::from_raw(RawEngineConfig::default()).unwrap())
}

fn raw_client(engine: &Engine) -> (Arc<Client>, Arc<RecordingSocket>) {
    let sock = RecordingSocket::new();
    let client = Arc::new(Client::new(ClientId::next(), Protocol::Raw, Some(sock.clone())));
    engine.registry.insert(Arc::clone(&client));
    (client, sock)
}

#[tokio::test]
async fn on_then_broadcast_delivers_to_subscriber_only() {
    let engine = engine();
    engine.register_event("/room", None, None, None, false);
    let (subscriber, sub_sock) = raw_client(&engine);
    let (bystander, bystander_sock) = raw_client(&engine);

    engine.route(&subscriber, "/qio/on", 1, "\"/room\"").await;
    assert!(sub_sock.bodies()[0].contains("\"code\":200"));

    engine.broadcast.broadcast(&engine.trie, "/room", "\"hi\"");
    engine.broadcast_tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(sub_sock.bodies().iter().any(|b| b == "/room:0=\"hi\""));
    assert!(bystander_sock.bodies().is_empty());
    let _ = bystander;
}

#[tokio::test]
async fn off_stops_further_delivery() {
    let engine = engine();
    let event = engine.register_event("/room", None, None, None, false);
    assert!(event.is_none()); // freshly inserted, no prior handler set
    let (event, _) = engine.trie.query("/room").unwrap();
    let (client, sock) = raw_client(&engine);

    engine.route(&client, "/qio/on", 1, "\"/room\"").await;
    engine.off(&client, &event, "").await;

    engine.broadcast.broadcast(&engine.trie, "/room", "\"hi\"");
    engine.broadcast_tick().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(!sock.bodies().iter().any(|b| b == "/room:0=\"hi\""));
}

#[tokio::test]
async fn concurrent_on_while_pending_gets_202_not_200() {
    // spec.md §8 scenario 3: a second `on()` for the same subscription
    // while the `on_fn` for the first is still outstanding must see
    // "subscription pending", not be silently treated as already active.
    let engine = engine();
    let on_fn_entered = Arc::new(AtomicUsize::new(0));
    let entered = Arc::clone(&on_fn_entered);
    engine.register_event(
        "/slow",
        None,
        Some(Arc::new(move |_c: &Client, _extra: &str| {
            entered.fetch_add(1, Ordering::SeqCst);
            // never calls client_sub_accept/reject — simulates a
            // handler still doing async work elsewhere.
            qio_core::types::HandlerStatus::Handled
        })),
        None,
        false,
    );
    let (client, sock) = raw_client(&engine);
    let (event, extra) = engine.trie.query("/slow").unwrap();

    engine.on(&client, &event, &extra, 1).await;
    engine.on(&client, &event, &extra, 2).await;

    assert_eq!(on_fn_entered.load(Ordering::SeqCst), 1);
    // the first `on()`'s handler is still outstanding (HandlerStatus::Handled
    // defers the reply), so the only callback written so far is the second
    // call's "pending" rejection.
    let bodies = sock.bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].starts_with("/qio/callback/2:"));
    assert!(bodies[0].contains("\"code\":202"));
}

#[tokio::test]
async fn fairness_denies_new_subscriptions_past_cap() {
    let mut raw = RawEngineConfig::default();
    raw.clients_subs_total = Some(1);
    let engine = Engine::new(EngineConfig::from_raw(raw).unwrap());
    engine.register_event("/room", None, None, None, false);
    let (first, first_sock) = raw_client(&engine);
    let (second, second_sock) = raw_client(&engine);

    engine.route(&first, "/qio/on", 1, "\"/room\"").await;
    engine.route(&second, "/qio/on", 1, "\"/room\"").await;

    assert!(first_sock.bodies()[0].contains("\"code\":200"));
    assert!(second_sock.bodies()[0].contains("\"code\":429"));
}

#[tokio::test]
async fn unknown_target_path_in_on_is_404() {
    let engine = engine();
    let (client, sock) = raw_client(&engine);
    engine.route(&client, "/qio/on", 9, "\"/nope\"").await;
    assert!(sock.bodies()[0].contains("\"code\":404"));
}
