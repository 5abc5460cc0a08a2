//! Broadcast pipeline (L7): lock-free enqueue onto an MPSC channel, a
//! periodic tick that drains it, and per-protocol frame materialization.

use std::sync::Arc;

use qio_wire::event_text::{encode, EventText};

use crate::client::Protocol;
use crate::sub::{sub_unref, Subscription};
use crate::trie::EventTrie;

/// One queued broadcast: a held subscription reference plus its JSON
/// payload, materialized into frames once per tick (spec §4.7 step 1).
struct Entry {
    sub: Arc<Subscription>,
    json: String,
}

pub struct BroadcastPipeline {
    tx: tokio::sync::mpsc::UnboundedSender<Entry>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Entry>>,
}

impl Default for BroadcastPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastPipeline {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        BroadcastPipeline {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Resolve `path` against the trie and enqueue if it names a live
    /// event. Takes a fresh ref on the subscription for the queue hold,
    /// mirroring the C source's `sub_ref`-before-handoff discipline
    /// (spec §5 "Reference counting").
    pub fn broadcast(&self, trie: &EventTrie, path: &str, json: &str) -> bool {
        let Some((event, ev_extra)) = trie.query(path) else {
            return false;
        };
        let Some(sub) = crate::sub::sub_get(&event, &ev_extra, false, 1, 1) else {
            return false;
        };
        self.broadcast_sub(sub, json);
        true
    }

    /// `broadcast(E, extra, json)`: enqueue directly against an
    /// already-resolved subscription (used by built-in handlers that
    /// hold a `Subscription` without re-querying the trie).
    pub fn broadcast_sub(&self, sub: Arc<Subscription>, json: &str) {
        let _ = self.tx.send(Entry {
            sub,
            json: json.to_owned(),
        });
    }

    /// Drain every entry currently queued and fan it out. Returns the
    /// number of entries processed. Runs on the periodic timer thread;
    /// serializing dequeue-to-fanout here is what preserves "broadcasts
    /// for a given subscription delivered in enqueue order" (spec §9)
    /// even though fan-out to each shard runs in parallel.
    pub async fn tick<F>(&self, mut deliver: F) -> usize
    where
        F: FnMut(&Arc<Subscription>, &Frames),
    {
        let mut rx = self.rx.lock().await;
        let mut count = 0;
        while let Ok(entry) = rx.try_recv() {
            let frames = Frames::materialize(&entry.sub, &entry.json);
            deliver(&entry.sub, &frames);
            sub_unref(&entry.sub);
            count += 1;
        }
        count
    }
}

/// Pre-materialized per-protocol frames for one broadcast entry, shared
/// across every subscriber delivery so framing happens once, not once
/// per subscriber.
pub struct Frames {
    pub raw: Vec<u8>,
    pub ws: Vec<u8>,
    pub http_line: String,
}

impl Frames {
    fn materialize(sub: &Subscription, json: &str) -> Self {
        let text = encode(&EventText {
            path: sub.parent.path.clone(),
            client_cb: 0,
            json: json.to_owned(),
        });
        Frames {
            raw: qio_wire::raw::frame(text.as_bytes()),
            ws: qio_wire::ws::frame_text(text.as_bytes()),
            http_line: text,
        }
    }

    /// Pick the frame appropriate for `protocol`. HTTP surrogates/
    /// pollers use `http_line` (one event per response line); the
    /// caller owns joining multiple lines with `\n`.
    pub fn for_protocol(&self, protocol: Protocol) -> FrameRef<'_> {
        match protocol {
            Protocol::Raw => FrameRef::Bytes(&self.raw),
            Protocol::WebSocket => FrameRef::Bytes(&self.ws),
            Protocol::HttpPoller | Protocol::HttpSurrogate => FrameRef::Line(&self.http_line),
        }
    }
}

pub enum FrameRef<'a> {
    Bytes(&'a [u8]),
    Line(&'a str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::EventTrie;

    #[tokio::test]
    async fn broadcast_on_unknown_path_is_noop() {
        let trie = EventTrie::new();
        let pipeline = BroadcastPipeline::new();
        assert!(!pipeline.broadcast(&trie, "/nope", "null"));
        assert_eq!(pipeline.tick(|_, _| {}).await, 0);
    }

    #[tokio::test]
    async fn broadcast_enqueues_and_tick_drains_in_order() {
        let trie = EventTrie::new();
        trie.insert("/room", None, None, None, false);
        let pipeline = BroadcastPipeline::new();
        assert!(pipeline.broadcast(&trie, "/room", "1"));
        assert!(pipeline.broadcast(&trie, "/room", "2"));

        let mut seen = Vec::new();
        let n = pipeline
            .tick(|_sub, frames| {
                if let FrameRef::Line(line) = frames.for_protocol(Protocol::HttpPoller) {
                    seen.push(line.to_owned());
                }
            })
            .await;
        assert_eq!(n, 2);
        assert_eq!(seen, vec!["/room:0=1", "/room:0=2"]);
    }

    #[tokio::test]
    async fn materialized_frames_cover_all_protocols() {
        let trie = EventTrie::new();
        trie.insert("/room", None, None, None, false);
        let pipeline = BroadcastPipeline::new();
        pipeline.broadcast(&trie, "/room", "\"hi\"");
        pipeline
            .tick(|_sub, frames| {
                assert!(matches!(frames.for_protocol(Protocol::Raw), FrameRef::Bytes(_)));
                assert!(matches!(frames.for_protocol(Protocol::WebSocket), FrameRef::Bytes(_)));
                assert!(matches!(frames.for_protocol(Protocol::HttpSurrogate), FrameRef::Line(_)));
            })
            .await;
    }
}
