//! Event trie (L1): O(|path|) insert and lookup of a handler set by path.
//!
//! Nodes key children by byte rather than the spec's flat 255-slot array;
//! Design Notes §9 calls a hash-table-per-node an acceptable alternative
//! as long as `handles_children` tie-break semantics are preserved.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use qio_wire::path::{clean_path, is_legal_event_path};

use crate::sub::Subscription;
use crate::types::{HandlerFn, OffFn, OnFn};

/// A node in the trie (§3 "Event").
pub struct Event {
    pub path: String,
    pub handler_fn: Option<HandlerFn>,
    pub on_fn: Option<OnFn>,
    pub off_fn: Option<OffFn>,
    pub handles_children: bool,
    pub subs: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl Event {
    fn new(path: String, handler_fn: Option<HandlerFn>, on_fn: Option<OnFn>, off_fn: Option<OffFn>, handles_children: bool) -> Self {
        Event {
            path,
            handler_fn,
            on_fn,
            off_fn,
            handles_children,
            subs: RwLock::new(HashMap::new()),
        }
    }
}

struct TrieNode {
    children: HashMap<u8, Box<TrieNode>>,
    event: Option<Arc<Event>>,
}

impl TrieNode {
    fn empty() -> Self {
        TrieNode {
            children: HashMap::new(),
            event: None,
        }
    }
}

/// Process-wide event registry. One global mutex guards the whole tree
/// during insert; queries take a read lock (an approximation of the
/// spec's "lock-free after insert completes" — see DESIGN.md).
pub struct EventTrie {
    root: RwLock<TrieNode>,
}

impl Default for EventTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTrie {
    pub fn new() -> Self {
        EventTrie {
            root: RwLock::new(TrieNode::empty()),
        }
    }

    /// Register handlers at `path`. Returns `None` (installed) or
    /// `Some(existing)` if a node at that exact path already carries a
    /// handler set.
    pub fn insert(
        &self,
        path: &str,
        handler_fn: Option<HandlerFn>,
        on_fn: Option<OnFn>,
        off_fn: Option<OffFn>,
        handles_children: bool,
    ) -> Option<Arc<Event>> {
        let cleaned = clean_path(path);
        if !is_legal_event_path(&cleaned) {
            return None;
        }

        let mut root = self.root.write().unwrap();
        let mut node = &mut *root;
        for &b in cleaned.as_bytes() {
            node = node.children.entry(b).or_insert_with(|| Box::new(TrieNode::empty()));
        }
        if let Some(existing) = &node.event {
            return Some(Arc::clone(existing));
        }
        node.event = Some(Arc::new(Event::new(cleaned, handler_fn, on_fn, off_fn, handles_children)));
        None
    }

    /// Descend `path` byte by byte. On a missing child, fall back to the
    /// nearest ancestor with `handles_children == true`, exposing the
    /// unmatched remainder as `ev_extra`. The deepest node carrying a
    /// handler set always wins over a shallower `handles_children` node.
    pub fn query(&self, path: &str) -> Option<(Arc<Event>, String)> {
        let cleaned = clean_path(path);
        if !is_legal_event_path(&cleaned) {
            return None;
        }
        let bytes = cleaned.as_bytes();

        let root = self.root.read().unwrap();
        let mut node = &*root;
        let mut fallback: Option<(Arc<Event>, usize)> = None;

        for (i, &b) in bytes.iter().enumerate() {
            if let Some(ev) = &node.event {
                if ev.handles_children {
                    fallback = Some((Arc::clone(ev), i));
                }
            }
            match node.children.get(&b) {
                Some(child) => node = child,
                None => {
                    return fallback.map(|(ev, cut)| (ev, cleaned[cut..].to_owned()));
                }
            }
        }

        if let Some(ev) = &node.event {
            return Some((Arc::clone(ev), String::new()));
        }
        fallback.map(|(ev, cut)| (ev, cleaned[cut..].to_owned()))
    }
}
