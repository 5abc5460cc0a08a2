//! Raw dialect framing (spec §4.5.1, §6).
//!
//! Handshake is the literal `/qio/ohai`, echoed back verbatim. Framing is
//! an 8-byte big-endian length header followed by that many bytes of
//! UTF-8 event text.

/// The raw handshake literal, sent by the client and echoed by the server.
pub const HANDSHAKE: &[u8] = b"/qio/ohai";

/// Fixed 29-byte heartbeat challenge frame, server -> client, used when no
/// reply tracking is needed (plain liveness ping, spec §4.5.1 / §6).
pub const HEARTBEAT_FRAME: &[u8] = b"\x00\x00\x00\x00\x00\x00\x00\x15/qio/heartbeat:0=null";

/// Maximum frame body the server is willing to buffer before treating the
/// client as abusive. Not named directly in spec.md's length-overflow
/// boundary case, but required to give `PAYLOAD_TOO_LARGE` (413, via the
/// HTTP transport) and the raw overflow-fatal case a concrete ceiling.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Result of attempting to find one complete frame at the head of `buf`.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// Not enough bytes buffered yet for even the length header.
    Incomplete,
    /// Header present but body not fully buffered yet.
    NeedMore { total_len: usize },
    /// Header length + header size overflowed a `u64` — fatal, close the
    /// connection (spec §8 boundary behavior).
    Overflow,
    /// Declared length exceeds [`MAX_FRAME_LEN`] — treat as fatal too.
    TooLarge,
    /// A complete frame's body and the number of bytes (header + body) it
    /// occupied in `buf`.
    Complete { body: Vec<u8>, consumed: usize },
}

/// Try to decode one frame from the head of `buf`. Does not mutate `buf`;
/// callers drain `consumed` bytes themselves once ready to route.
pub fn try_decode_frame(buf: &[u8]) -> FrameResult {
    const HEADER_LEN: usize = 8;
    if buf.len() < HEADER_LEN {
        return FrameResult::Incomplete;
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[..HEADER_LEN]);
    let body_len = u64::from_be_bytes(len_bytes);

    let total_len = match body_len.checked_add(HEADER_LEN as u64) {
        Some(t) => t,
        None => return FrameResult::Overflow,
    };
    if body_len > MAX_FRAME_LEN {
        return FrameResult::TooLarge;
    }
    // total_len fits in usize on all supported targets given MAX_FRAME_LEN.
    let total_len = total_len as usize;
    if buf.len() < total_len {
        return FrameResult::NeedMore { total_len };
    }
    FrameResult::Complete {
        body: buf[HEADER_LEN..total_len].to_vec(),
        consumed: total_len,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    Yes,
    Maybe,
    No,
}

/// Sniff `buf` against the raw handshake literal `/qio/ohai` (spec §4.5:
/// `YES` on full match, `MAYBE` on a valid prefix).
pub fn sniff(buf: &[u8]) -> Sniff {
    if buf.is_empty() {
        return Sniff::Maybe;
    }
    let n = buf.len().min(HANDSHAKE.len());
    if buf[..n] != HANDSHAKE[..n] {
        return Sniff::No;
    }
    if buf.len() >= HANDSHAKE.len() {
        Sniff::Yes
    } else {
        Sniff::Maybe
    }
}

/// Frame a UTF-8 event text payload with the 8-byte big-endian length header.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
