//! Subscription table (L2): per-event ref-counted subscriber sets with a
//! sharded, contention-aware free-list for subscriber slots.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::Client;
use crate::trie::Event;

/// One concrete broadcast target: an event plus its `ev_extra` suffix.
pub struct Subscription {
    pub parent: Arc<Event>,
    pub ev_extra: String,
    refs: AtomicI64,
    pub subscribers: SubscriberList,
}

impl Subscription {
    fn new(parent: Arc<Event>, ev_extra: String, shard_count: usize, capacity: usize) -> Self {
        Subscription {
            parent,
            ev_extra,
            refs: AtomicI64::new(1),
            subscribers: SubscriberList::with_capacity(shard_count, capacity),
        }
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }
}

/// `sub_get(E, ev_extra, or_create)` (spec §4.2). `shard_count` and
/// `capacity` size a freshly-created subscription's subscriber list
/// (`broadcast-threads` and `max-clients`, respectively); they are
/// ignored when an existing subscription is reused.
pub fn sub_get(event: &Arc<Event>, ev_extra: &str, or_create: bool, shard_count: usize, capacity: usize) -> Option<Arc<Subscription>> {
    {
        let subs = event.subs.read().unwrap();
        if let Some(existing) = subs.get(ev_extra) {
            if try_increment_from_nonzero(&existing.refs) {
                return Some(Arc::clone(existing));
            }
        }
    }
    if !or_create {
        return None;
    }
    let mut subs = event.subs.write().unwrap();
    if let Some(existing) = subs.get(ev_extra) {
        if try_increment_from_nonzero(&existing.refs) {
            return Some(Arc::clone(existing));
        }
    }
    let created = Arc::new(Subscription::new(Arc::clone(event), ev_extra.to_owned(), shard_count, capacity));
    subs.insert(ev_extra.to_owned(), Arc::clone(&created));
    Some(created)
}

fn try_increment_from_nonzero(refs: &AtomicI64) -> bool {
    let mut current = refs.load(Ordering::SeqCst);
    loop {
        if current <= 0 {
            return false;
        }
        match refs.compare_exchange_weak(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Unconditional increment, used when handing a hold across a thread
/// boundary (enqueueing into broadcast, caller already knows refs > 0).
pub fn sub_ref(sub: &Subscription) {
    sub.refs.fetch_add(1, Ordering::SeqCst);
}

/// Decrement; on reaching 0, remove the map entry *iff it still points
/// at this subscription* (a concurrent `sub_get` may have replaced it).
pub fn sub_unref(sub: &Arc<Subscription>) {
    if sub.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
        return;
    }
    let mut subs = sub.parent.subs.write().unwrap();
    if let Some(current) = subs.get(&sub.ev_extra) {
        if Arc::ptr_eq(current, sub) {
            subs.remove(&sub.ev_extra);
        }
    }
}

const SHARD_INDEX_BITS: u32 = 24;

struct Shard {
    slots: Vec<Option<Arc<Client>>>,
    free: Vec<u32>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

/// A contention-aware sharded free-list of subscriber slots. Slot ids
/// pack `(shard_index << 24) | local_index` so a single `u32` identifies
/// a subscriber anywhere in the list. Bounded by `capacity` (the
/// `max-clients` config, spec §3: "sized by a `max-clients` bound so
/// indices are stable while a subscriber lives") — once full, `try_add`
/// returns `None` rather than growing unboundedly.
pub struct SubscriberList {
    shards: Vec<Mutex<Shard>>,
    capacity: usize,
    len: std::sync::atomic::AtomicUsize,
}

impl SubscriberList {
    pub fn with_capacity(shard_count: usize, capacity: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count).map(|_| Mutex::new(Shard::new())).collect();
        SubscriberList {
            shards,
            capacity,
            len: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Insert `client`, returning the packed slot id, or `None` if the
    /// list is at `capacity`. Shard choice is the client's id modulo the
    /// shard count, spreading writers/readers of the same shard only
    /// when clients happen to collide.
    pub fn try_add(&self, client_id: u64, client: Arc<Client>) -> Option<u32> {
        use std::sync::atomic::Ordering;
        loop {
            let current = self.len.load(Ordering::SeqCst);
            if current >= self.capacity {
                return None;
            }
            if self
                .len
                .compare_exchange_weak(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        let shard_idx = (client_id as usize) % self.shard_count();
        let mut shard = self.shards[shard_idx].lock().unwrap();
        let local_idx = if let Some(free_idx) = shard.free.pop() {
            shard.slots[free_idx as usize] = Some(client);
            free_idx
        } else {
            shard.slots.push(Some(client));
            (shard.slots.len() - 1) as u32
        };
        Some(((shard_idx as u32) << SHARD_INDEX_BITS) | local_idx)
    }

    pub fn remove(&self, slot: u32) {
        let (shard_idx, local_idx) = Self::unpack(slot);
        let mut shard = self.shards[shard_idx].lock().unwrap();
        if let Some(entry) = shard.slots.get_mut(local_idx) {
            if entry.take().is_some() {
                shard.free.push(local_idx as u32);
                self.len.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    fn unpack(slot: u32) -> (usize, usize) {
        ((slot >> SHARD_INDEX_BITS) as usize, (slot & ((1 << SHARD_INDEX_BITS) - 1)) as usize)
    }

    /// Snapshot every occupied slot. Each shard is locked independently,
    /// so the overall result is a consistent-per-shard view rather than
    /// one instant across the whole list — adequate for broadcast fan-out,
    /// which only needs "every subscriber present at dequeue time".
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            out.extend(shard.slots.iter().flatten().cloned());
        }
        out
    }

    /// Iterate shards individually so broadcast fan-out can spread work
    /// across `broadcast-threads` shards in parallel (spec §4.7).
    pub fn shard_snapshots(&self) -> Vec<Vec<Arc<Client>>> {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.lock().unwrap();
                shard.slots.iter().flatten().cloned().collect()
            })
            .collect()
    }
}
