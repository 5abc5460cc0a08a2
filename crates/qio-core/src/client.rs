//! Per-client state (L3): subscriptions held, callback slots, and the
//! fairness admission policy gating new subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::callback::CallbackSlots;
use crate::sub::{sub_ref, sub_unref, Subscription};
use crate::transport::SocketWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    pub fn next() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Raw = 0,
    WebSocket = 1,
    HttpPoller = 2,
    /// The spec's "HTTP Surrogate": `is_surrogate = true`, no socket.
    HttpSurrogate = 3,
}

impl Protocol {
    fn from_u8(v: u8) -> Protocol {
        match v {
            0 => Protocol::Raw,
            1 => Protocol::WebSocket,
            2 => Protocol::HttpPoller,
            _ => Protocol::HttpSurrogate,
        }
    }
}

/// HTTP-specific fields (spec §3): session id, the paired poller or
/// surrogate, and the in-flight request bookkeeping needed to avoid
/// interleaving a response with a concurrently-arriving body.
pub struct HttpState {
    pub session_id: u128,
    /// For a poller: the surrogate it is attached to. For a surrogate:
    /// the poller currently attached to it, if any.
    pub peer: Option<Arc<Client>>,
    /// True while a surrogate is actively parsing a POST body; outbound
    /// sends buffer into `outgoing` instead of flushing directly.
    pub receiving: bool,
    /// Buffered `path:cb=json` lines awaiting the next poller flush
    /// (surrogate only).
    pub outgoing: Vec<String>,
    /// Whether the poller's underlying connection should stay open
    /// after its response is written.
    pub keep_alive: bool,
}

impl HttpState {
    pub fn new(session_id: u128) -> Self {
        HttpState {
            session_id,
            peer: None,
            receiving: false,
            outgoing: Vec::new(),
            keep_alive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubKey {
    event_path: String,
    ev_extra: String,
}

impl SubKey {
    fn of(sub: &Subscription) -> SubKey {
        SubKey {
            event_path: sub.parent.path.clone(),
            ev_extra: sub.ev_extra.clone(),
        }
    }
}

struct ClientSub {
    sub: Arc<Subscription>,
    slot: Option<u32>,
    pending: bool,
    tombstone: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Pending,
    Active,
    Null,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Active,
    Tombstoned,
    Null,
}

pub struct Client {
    pub id: ClientId,
    protocol: AtomicU8,
    pub handshaked: AtomicBool,
    pub socket: Option<Arc<dyn SocketWriter>>,
    last_send: Mutex<Instant>,
    last_recv: Mutex<Instant>,
    subs: Mutex<HashMap<SubKey, ClientSub>>,
    pub cb: CallbackSlots,
    pub http: Option<Mutex<HttpState>>,
}

impl Client {
    pub fn new(id: ClientId, protocol: Protocol, socket: Option<Arc<dyn SocketWriter>>) -> Self {
        let now = Instant::now();
        let http = matches!(protocol, Protocol::HttpPoller | Protocol::HttpSurrogate).then(|| Mutex::new(HttpState::new(0)));
        Client {
            id,
            protocol: AtomicU8::new(protocol as u8),
            handshaked: AtomicBool::new(false),
            socket,
            last_send: Mutex::new(now),
            last_recv: Mutex::new(now),
            subs: Mutex::new(HashMap::new()),
            cb: CallbackSlots::new(),
            http,
        }
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol.load(Ordering::SeqCst))
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        self.protocol.store(protocol as u8, Ordering::SeqCst);
    }

    pub fn is_surrogate(&self) -> bool {
        self.protocol() == Protocol::HttpSurrogate
    }

    /// Stamp the session id onto an HTTP client after construction (the
    /// transport layer learns `sid` from the query string, after the
    /// surrogate/poller itself has already been built).
    pub fn set_session_id(&self, session_id: u128) {
        if let Some(http) = &self.http {
            http.lock().unwrap().session_id = session_id;
        }
    }

    pub fn touch_recv(&self) {
        *self.last_recv.lock().unwrap() = Instant::now();
    }

    pub fn touch_send(&self) {
        *self.last_send.lock().unwrap() = Instant::now();
    }

    pub fn last_recv(&self) -> Instant {
        *self.last_recv.lock().unwrap()
    }

    pub fn last_send(&self) -> Instant {
        *self.last_send.lock().unwrap()
    }

    pub fn sub_count(&self) -> u64 {
        self.subs.lock().unwrap().len() as u64
    }

    /// `client_sub_add(C, S)` (spec §4.3), gated by the fairness policy.
    ///
    /// On `Created`, takes a persistent "client is subscribed" ref on
    /// `sub` (spec §3: "refs count is incremented for every concurrent
    /// hold, including... every subscribed client"), released again by
    /// whichever of `client_sub_accept`/`client_sub_reject`/
    /// `client_sub_remove` ends that membership. The caller's own
    /// `sub_get` hold is a separate, always-balanced ref it must release
    /// itself regardless of the outcome returned here.
    pub fn client_sub_add(&self, sub: Arc<Subscription>, fairness: &FairnessGate) -> AddOutcome {
        let key = SubKey::of(&sub);
        let mut subs = self.subs.lock().unwrap();
        if let Some(existing) = subs.get(&key) {
            return if existing.pending { AddOutcome::Pending } else { AddOutcome::Active };
        }
        if !fairness.admit(self.sub_count()) {
            return AddOutcome::Null;
        }
        sub_ref(&sub);
        subs.insert(
            key,
            ClientSub {
                sub,
                slot: None,
                pending: true,
                tombstone: false,
            },
        );
        fairness.record_added();
        AddOutcome::Created
    }

    /// `client_sub_accept(C, S)`. Needs `self` behind an `Arc` since the
    /// subscriber list stores an `Arc<Client>` for broadcast fan-out.
    pub fn client_sub_accept(self: &Arc<Self>, sub: &Arc<Subscription>) -> AcceptOutcome {
        let key = SubKey::of(sub);
        let slot = match sub.subscribers.try_add(self.id.0, Arc::clone(self)) {
            Some(s) => s,
            None => {
                self.subs.lock().unwrap().remove(&key);
                return AcceptOutcome::Null;
            }
        };
        let mut subs = self.subs.lock().unwrap();
        match subs.get_mut(&key) {
            Some(entry) => {
                entry.slot = Some(slot);
                if entry.tombstone {
                    subs.remove(&key);
                    drop(subs);
                    sub.subscribers.remove(slot);
                    sub_unref(sub);
                    AcceptOutcome::Tombstoned
                } else {
                    entry.pending = false;
                    AcceptOutcome::Active
                }
            }
            None => {
                drop(subs);
                sub.subscribers.remove(slot);
                sub_unref(sub);
                AcceptOutcome::Null
            }
        }
    }

    /// `client_sub_reject(C, S)`: unconditional cleanup of a pending
    /// entry whose admission was denied or whose `on_fn` failed.
    pub fn client_sub_reject(&self, sub: &Arc<Subscription>) {
        let key = SubKey::of(sub);
        if self.subs.lock().unwrap().remove(&key).is_some() {
            sub_unref(sub);
        }
    }

    /// `client_sub_remove(C, S)`: returns `true` if removed now, `false`
    /// if deferred via tombstone (still pending).
    pub fn client_sub_remove(&self, sub: &Arc<Subscription>) -> Option<bool> {
        let key = SubKey::of(sub);
        let mut subs = self.subs.lock().unwrap();
        match subs.get_mut(&key) {
            Some(entry) if entry.pending => {
                entry.tombstone = true;
                Some(false)
            }
            Some(entry) => {
                if let Some(slot) = entry.slot {
                    sub.subscribers.remove(slot);
                }
                subs.remove(&key);
                drop(subs);
                sub_unref(sub);
                Some(true)
            }
            None => None,
        }
    }

    /// `client_sub_active(C, S)`.
    pub fn client_sub_active(&self, sub: &Subscription) -> bool {
        let key = SubKey::of(sub);
        matches!(self.subs.lock().unwrap().get(&key), Some(e) if !e.pending && !e.tombstone)
    }
}

/// Global counters and parameters for the §4.3 fairness admission
/// policy, shared across all clients.
pub struct FairnessGate {
    total: AtomicU64,
    added: AtomicU64,
    removed: AtomicU64,
    max_subs_total: u64,
    fairness_pct: u8,
    max_clients: u64,
    per_client_min: u64,
}

impl FairnessGate {
    pub fn new(max_subs_total: u64, fairness_pct: u8, max_clients: u64, per_client_min: u64) -> Self {
        FairnessGate {
            total: AtomicU64::new(0),
            added: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            max_subs_total,
            fairness_pct,
            max_clients: max_clients.max(1),
            per_client_min,
        }
    }

    /// Spec §4.3's admission formula, evaluated against `client_subs` (the
    /// requesting client's current subscription count).
    pub fn admit(&self, client_subs: u64) -> bool {
        let used = self.total.load(Ordering::SeqCst);
        if used >= self.max_subs_total {
            return false;
        }
        if self.fairness_pct == 0 {
            self.total.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        let threshold = (100 - u64::from(self.fairness_pct)) as f64 / 100.0 * self.max_subs_total as f64;
        if (used as f64) >= threshold {
            let base_cap = (self.max_subs_total / self.max_clients).max(1) as f64;
            let cap = base_cap * (20.0 / (0.05 * f64::from(self.fairness_pct)) - 3.0);
            let cap = (cap.max(0.0) as u64).max(self.per_client_min).max(1);
            if client_subs >= cap {
                return false;
            }
        }
        self.total.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn record_added(&self) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::Event;
    use std::collections::HashMap as StdHashMap;
    use std::sync::RwLock;

    fn test_sub() -> Arc<Subscription> {
        let ev = Arc::new(Event {
            path: "/room".to_owned(),
            handler_fn: None,
            on_fn: None,
            off_fn: None,
            handles_children: false,
            subs: RwLock::new(StdHashMap::new()),
        });
        crate::sub::sub_get(&ev, "", true, 1, 16).unwrap()
    }

    #[test]
    fn add_accept_then_active() {
        let client = Arc::new(Client::new(ClientId(1), Protocol::Raw, None));
        let sub = test_sub();
        let fairness = FairnessGate::new(100, 0, 10, 1);
        assert_eq!(client.client_sub_add(Arc::clone(&sub), &fairness), AddOutcome::Created);
        assert_eq!(client.client_sub_accept(&sub), AcceptOutcome::Active);
        assert!(client.client_sub_active(&sub));
    }

    #[test]
    fn add_twice_while_pending_returns_pending() {
        let client = Arc::new(Client::new(ClientId(1), Protocol::Raw, None));
        let sub = test_sub();
        let fairness = FairnessGate::new(100, 0, 10, 1);
        assert_eq!(client.client_sub_add(Arc::clone(&sub), &fairness), AddOutcome::Created);
        assert_eq!(client.client_sub_add(Arc::clone(&sub), &fairness), AddOutcome::Pending);
    }

    #[test]
    fn add_when_already_active_returns_active() {
        let client = Arc::new(Client::new(ClientId(1), Protocol::Raw, None));
        let sub = test_sub();
        let fairness = FairnessGate::new(100, 0, 10, 1);
        client.client_sub_add(Arc::clone(&sub), &fairness);
        client.client_sub_accept(&sub);
        assert_eq!(client.client_sub_add(Arc::clone(&sub), &fairness), AddOutcome::Active);
    }

    #[test]
    fn remove_while_pending_tombstones_instead_of_removing() {
        let client = Arc::new(Client::new(ClientId(1), Protocol::Raw, None));
        let sub = test_sub();
        let fairness = FairnessGate::new(100, 0, 10, 1);
        client.client_sub_add(Arc::clone(&sub), &fairness);
        assert_eq!(client.client_sub_remove(&sub), Some(false));
        // accept now sees the tombstone and cleans up instead of activating
        assert_eq!(client.client_sub_accept(&sub), AcceptOutcome::Tombstoned);
        assert!(!client.client_sub_active(&sub));
    }

    #[test]
    fn remove_while_active_removes_and_frees_slot() {
        let client = Arc::new(Client::new(ClientId(1), Protocol::Raw, None));
        let sub = test_sub();
        let fairness = FairnessGate::new(100, 0, 10, 1);
        client.client_sub_add(Arc::clone(&sub), &fairness);
        client.client_sub_accept(&sub);
        assert_eq!(client.client_sub_remove(&sub), Some(true));
        assert!(!client.client_sub_active(&sub));
        assert_eq!(sub.subscribers.snapshot().len(), 0);
    }

    #[test]
    fn fairness_denies_past_total_cap() {
        let fairness = FairnessGate::new(1, 0, 10, 1);
        assert!(fairness.admit(0));
        assert!(!fairness.admit(0));
    }

    #[test]
    fn fairness_zero_always_admits_under_total_cap() {
        let fairness = FairnessGate::new(1000, 0, 10, 1);
        for _ in 0..50 {
            assert!(fairness.admit(0));
        }
    }

    #[test]
    fn fairness_caps_heavy_client_under_pressure() {
        // max_subs_total=100, pressure triggers at used>=20 (fairness=80 -> threshold 20%).
        let fairness = FairnessGate::new(100, 80, 10, 1);
        for _ in 0..20 {
            assert!(fairness.admit(0));
        }
        // base_cap = max(1, 100/10) = 10; cap = 10 * (20/(0.05*80) - 3) = 10*(5-3)=20
        // a client already holding 20 subs should now be denied.
        assert!(!fairness.admit(20));
        // a light client under the cap is still admitted.
        assert!(fairness.admit(2));
    }
}
