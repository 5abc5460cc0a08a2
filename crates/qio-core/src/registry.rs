//! Process-wide table of every live client (raw/WS sockets, HTTP
//! pollers, and HTTP surrogates alike), iterated by the heartbeat sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::{Client, ClientId};

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: Arc<Client>) {
        self.clients.lock().unwrap().insert(client.id, client);
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every client for the heartbeat sweep or shutdown drain.
    /// Taken once per tick so the sweep never holds the table lock while
    /// invoking per-client logic.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Protocol;

    #[test]
    fn insert_snapshot_remove() {
        let reg = ClientRegistry::new();
        let c = Arc::new(Client::new(ClientId(1), Protocol::Raw, None));
        reg.insert(Arc::clone(&c));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot().len(), 1);
        reg.remove(c.id);
        assert!(reg.is_empty());
    }
}
