//! Callback slots (L4): a fixed 4-slot array of outstanding server ->
//! client callbacks, bounded FIFO with random eviction.
//!
//! The raw source stores `fn + opaque data + free_fn`; here the captured
//! data lives inside a `FnOnce` closure, and eviction or an unused slot
//! simply drops the closure — Rust's destructor for the captured state
//! *is* the `free_fn`, so "runs exactly once" falls out of ownership
//! instead of needing a second, separately-tracked function pointer.

use std::time::Instant;

use rand::Rng;

use crate::client::Client;
use crate::types::HandlerStatus;

pub const NO_CALLBACK: u32 = 0;
const NUM_SLOTS: usize = 4;

pub type CallbackBody = Box<dyn FnOnce(&Client, u32, &str) -> HandlerStatus + Send>;

struct Slot {
    id: u16,
    created_at: Instant,
    body: CallbackBody,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FireError {
    NotFound,
}

/// Per-client bounded callback table.
pub struct CallbackSlots {
    slots: std::sync::Mutex<[Option<Slot>; NUM_SLOTS]>,
    counter: std::sync::atomic::AtomicU16,
}

impl Default for CallbackSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackSlots {
    pub fn new() -> Self {
        CallbackSlots {
            slots: std::sync::Mutex::new([None, None, None, None]),
            counter: std::sync::atomic::AtomicU16::new(0),
        }
    }

    fn next_id(&self) -> u16 {
        loop {
            let id = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// `callback_new(C, fn, data, free_fn)` with `data`/`free_fn` folded
    /// into the closure's captures (see module docs). Finds an empty
    /// slot, or evicts a random one (its previous closure is dropped,
    /// running its destructor) and returns the composite `(slot << 16) |
    /// counter` id.
    pub fn callback_new(&self, body: CallbackBody) -> u32 {
        let mut slots = self.slots.lock().unwrap();
        let slot_idx = match slots.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => rand::thread_rng().gen_range(0..NUM_SLOTS),
        };
        let id = self.next_id();
        slots[slot_idx] = Some(Slot {
            id,
            created_at: Instant::now(),
            body,
        });
        ((slot_idx as u32) << 16) | u32::from(id)
    }

    /// `callback_fire(C, server_cb, client_cb, json)`.
    pub fn callback_fire(&self, client: &Client, server_cb: u32, client_cb: u32, json: &str) -> Result<HandlerStatus, FireError> {
        let slot_idx = (server_cb >> 16) as usize;
        let id = (server_cb & 0xFFFF) as u16;
        let body = {
            let mut slots = self.slots.lock().unwrap();
            if slot_idx >= NUM_SLOTS {
                return Err(FireError::NotFound);
            }
            match &slots[slot_idx] {
                Some(s) if s.id == id => slots[slot_idx].take().unwrap().body,
                _ => return Err(FireError::NotFound),
            }
        };
        Ok(body(client, client_cb, json))
    }

    /// Age pruning (spec §4.8): drop entries older than `max_age`. Each
    /// dropped closure's destructor runs, satisfying "free_fn always
    /// runs exactly once, including on eviction and on unused callbacks".
    pub fn prune_older_than(&self, max_age: std::time::Duration) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let mut pruned = 0;
        for slot in slots.iter_mut() {
            if let Some(s) = slot {
                if s.created_at.elapsed() > max_age {
                    *slot = None;
                    pruned += 1;
                }
            }
        }
        pruned
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientId, Protocol};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fake_client() -> Client {
        Client::new(ClientId(1), Protocol::Raw, None)
    }

    #[test]
    fn callback_new_then_fire_invokes_closure_once() {
        let slots = CallbackSlots::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let id = slots.callback_new(Box::new(move |_c, client_cb, json| {
            fired2.store(true, Ordering::SeqCst);
            assert_eq!(client_cb, 7);
            assert_eq!(json, "null");
            HandlerStatus::Ok
        }));
        let client = fake_client();
        let status = slots.callback_fire(&client, id, 7, "null").unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(status, HandlerStatus::Ok));
    }

    #[test]
    fn fire_with_stale_id_after_refire_is_not_found() {
        let slots = CallbackSlots::new();
        let id = slots.callback_new(Box::new(|_c, _cb, _j| HandlerStatus::Ok));
        let client = fake_client();
        slots.callback_fire(&client, id, 0, "null").unwrap();
        // slot freed; firing the same composite id again finds nothing.
        assert_eq!(slots.callback_fire(&client, id, 0, "null").unwrap_err(), FireError::NotFound);
    }

    #[test]
    fn four_slots_then_eviction_drops_evicted_closure() {
        let slots = CallbackSlots::new();
        let dropped = Arc::new(AtomicBool::new(false));
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let flag = DropFlag(Arc::clone(&dropped));
        slots.callback_new(Box::new(move |_c, _cb, _j| {
            let _keep = &flag;
            HandlerStatus::Ok
        }));
        for _ in 0..3 {
            slots.callback_new(Box::new(|_c, _cb, _j| HandlerStatus::Ok));
        }
        assert_eq!(slots.active_count(), 4);
        // a 5th insert must evict one of the four, including possibly ours.
        slots.callback_new(Box::new(|_c, _cb, _j| HandlerStatus::Ok));
        assert_eq!(slots.active_count(), 4);
        // can't deterministically assert `dropped` fired since eviction is
        // random, but active_count staying at 4 proves exactly one freed.
    }

    #[test]
    fn prune_older_than_drops_stale_entries() {
        let slots = CallbackSlots::new();
        slots.callback_new(Box::new(|_c, _cb, _j| HandlerStatus::Ok));
        assert_eq!(slots.prune_older_than(Duration::from_secs(0)), 1);
        assert_eq!(slots.active_count(), 0);
    }

    #[test]
    fn wrapping_counter_skips_zero() {
        let slots = CallbackSlots::new();
        slots.counter.store(u16::MAX, Ordering::SeqCst);
        let id = slots.next_id();
        assert_ne!(id, 0);
    }
}
