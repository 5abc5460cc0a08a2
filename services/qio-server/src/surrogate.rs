//! Session table for HTTP long-poll surrogates (L6), keyed by the
//! 128-bit session id clients carry in `?sid=`. Sharded the way
//! `qio-core`'s subscriber lists are, to keep any one lock's hold time
//! short under concurrent long-poll traffic.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use qio_core::Client;

const SHARDS: usize = 64;

fn bucket(sid: u128) -> usize {
    (sid % SHARDS as u128) as usize
}

/// Table of live surrogates, `sid mod 64` bucketed (spec.md §4.6).
pub struct SurrogateTable {
    shards: Vec<RwLock<HashMap<u128, Arc<Client>>>>,
}

impl Default for SurrogateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SurrogateTable {
    pub fn new() -> Self {
        SurrogateTable {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    pub fn get(&self, sid: u128) -> Option<Arc<Client>> {
        self.shards[bucket(sid)].read().unwrap().get(&sid).cloned()
    }

    /// Find the surrogate for `sid`, creating one via `make` if absent
    /// and `connect` is true. Re-checks under the write lock so two
    /// concurrent `connect=true` requests for the same `sid` never
    /// create two surrogates.
    pub fn get_or_create(&self, sid: u128, connect: bool, make: impl FnOnce() -> Arc<Client>) -> Option<Arc<Client>> {
        if let Some(existing) = self.get(sid) {
            return Some(existing);
        }
        if !connect {
            return None;
        }
        let shard = &self.shards[bucket(sid)];
        let mut guard = shard.write().unwrap();
        if let Some(existing) = guard.get(&sid) {
            return Some(Arc::clone(existing));
        }
        let client = make();
        guard.insert(sid, Arc::clone(&client));
        Some(client)
    }

    pub fn remove(&self, sid: u128) -> Option<Arc<Client>> {
        self.shards[bucket(sid)].write().unwrap().remove(&sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qio_core::{Client, ClientId, Protocol};

    fn client() -> Arc<Client> {
        Arc::new(Client::new(ClientId::next(), Protocol::HttpSurrogate, None))
    }

    #[test]
    fn miss_without_connect_returns_none() {
        let table = SurrogateTable::new();
        assert!(table.get_or_create(42, false, client).is_none());
    }

    #[test]
    fn miss_with_connect_creates_once() {
        let table = SurrogateTable::new();
        let first = table.get_or_create(7, true, client).unwrap();
        let second = table.get_or_create(7, true, client).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn remove_then_miss() {
        let table = SurrogateTable::new();
        table.get_or_create(1, true, client);
        assert!(table.remove(1).is_some());
        assert!(table.get(1).is_none());
    }
}
