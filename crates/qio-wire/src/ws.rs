//! RFC 6455 WebSocket framing (spec §4.5.2).
//!
//! Only what the broker's raw-over-WS dialect needs: masked client->server
//! TEXT/CLOSE frames in, unmasked server->client TEXT/CLOSE frames out.
//! Any opcode other than TEXT/CLOSE is rejected per spec (this is not a
//! general-purpose WebSocket implementation).

use sha1::{Digest, Sha1};

/// Magic GUID appended to the client's `Sec-WebSocket-Key` before hashing,
/// fixed by RFC 6455.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Close,
    Unsupported(u8),
}

impl Opcode {
    fn from_byte(b: u8) -> Self {
        match b {
            0x1 => Opcode::Text,
            0x8 => Opcode::Close,
            other => Opcode::Unsupported(other),
        }
    }
}

/// Outcome of scanning the head of a buffer for one WebSocket frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    Incomplete,
    /// Client sent an unmasked frame — fatal per spec (`NO_MASK`).
    MissingMask,
    /// Declared payload length overflowed while computing total frame size.
    Overflow,
    Complete {
        opcode: Opcode,
        /// Unmasked payload bytes.
        payload: Vec<u8>,
        consumed: usize,
    },
}

/// Apply the RFC 6455 masking XOR. Self-inverse: applying it twice with the
/// same key restores the original bytes. The spec's "three-pass" masking
/// (128-bit/64-bit/byte-tail blocks) is a performance detail only — any
/// implementation producing the same `out[i] = in[i] XOR mask[i % 4]` is
/// equivalent, so a plain byte loop is used here.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

/// Decode one frame from the head of `buf`, if a complete one is present.
pub fn try_decode_frame(buf: &[u8]) -> FrameResult {
    if buf.len() < 2 {
        return FrameResult::Incomplete;
    }
    let opcode = Opcode::from_byte(buf[0] & 0x0F);
    let masked = buf[1] & 0x80 != 0;
    let len7 = buf[1] & 0x7F;

    let (payload_len, header_len): (u64, usize) = if len7 < 126 {
        (len7 as u64, 2)
    } else if len7 == 126 {
        if buf.len() < 4 {
            return FrameResult::Incomplete;
        }
        (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
    } else {
        if buf.len() < 10 {
            return FrameResult::Incomplete;
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[2..10]);
        (u64::from_be_bytes(len_bytes), 10)
    };

    if !masked {
        // We still need to know whether there's enough of the header
        // buffered before declaring this fatal, so a truncated unmasked
        // frame is reported the same way regardless; real clients always
        // mask, so this path is rejection, not a framing race.
        return FrameResult::MissingMask;
    }

    let mask_offset = header_len;
    let payload_offset = match mask_offset.checked_add(4) {
        Some(o) => o,
        None => return FrameResult::Overflow,
    };
    let total_len = match payload_offset.checked_add(payload_len as usize) {
        Some(t) => t,
        None => return FrameResult::Overflow,
    };
    if buf.len() < payload_offset {
        return FrameResult::Incomplete;
    }
    if buf.len() < total_len {
        return FrameResult::Incomplete;
    }

    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[mask_offset..payload_offset]);
    let mut payload = buf[payload_offset..total_len].to_vec();
    apply_mask(&mut payload, mask);

    FrameResult::Complete {
        opcode,
        payload,
        consumed: total_len,
    }
}

/// Build a server -> client frame. `opcode_byte` is `0x81` for TEXT,
/// `0x88` for CLOSE (spec §4.5.2 frame output).
fn build_frame(opcode_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(opcode_byte);
    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Build an unmasked TEXT frame carrying `payload` (the raw-dialect event
/// bytes, spec §4.5.2).
pub fn frame_text(payload: &[u8]) -> Vec<u8> {
    build_frame(0x81, payload)
}

/// RFC 6455 close codes this server can emit (spec §4.5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Exit,
    InvalidHandshake,
    InvalidEvent,
    MissingMask,
    UnsupportedOpcode,
    NotUtf8,
    OutOfMemory,
    Timeout(String),
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Exit => 1001,
            CloseReason::InvalidHandshake | CloseReason::InvalidEvent | CloseReason::MissingMask => 1002,
            CloseReason::UnsupportedOpcode => 1003,
            CloseReason::NotUtf8 => 1007,
            CloseReason::OutOfMemory => 1009,
            CloseReason::Timeout(_) => 1008,
        }
    }

    pub fn reason_text(&self) -> String {
        match self {
            CloseReason::Exit => "exit".to_owned(),
            CloseReason::InvalidHandshake => "invalid handshake".to_owned(),
            CloseReason::InvalidEvent => "invalid event".to_owned(),
            CloseReason::MissingMask => "missing mask".to_owned(),
            CloseReason::UnsupportedOpcode => "unsupported opcode".to_owned(),
            CloseReason::NotUtf8 => "not utf-8".to_owned(),
            CloseReason::OutOfMemory => "out of memory".to_owned(),
            CloseReason::Timeout(reason) => reason.clone(),
        }
    }
}

/// Build a close frame with the RFC 6455 2-byte big-endian code prefix
/// followed by the UTF-8 reason text.
pub fn frame_close(reason: &CloseReason) -> Vec<u8> {
    let mut payload = reason.code().to_be_bytes().to_vec();
    payload.extend_from_slice(reason.reason_text().as_bytes());
    build_frame(0x88, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_frame(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode];
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        let mut masked_payload = payload.to_vec();
        apply_mask(&mut masked_payload, mask);
        out.extend_from_slice(&masked_payload);
        out
    }

    #[test]
    fn mask_is_self_inverse() {
        let original = b"/qio/ping:1=null".to_vec();
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut once = original.clone();
        apply_mask(&mut once, mask);
        assert_ne!(once, original);
        apply_mask(&mut once, mask);
        assert_eq!(once, original);
    }

    #[test]
    fn decodes_small_masked_text_frame() {
        let frame = masked_frame(0x1, b"hello", [1, 2, 3, 4]);
        match try_decode_frame(&frame) {
            FrameResult::Complete { opcode, payload, consumed } => {
                assert_eq!(opcode, Opcode::Text);
                assert_eq!(payload, b"hello");
                assert_eq!(consumed, frame.len());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unmasked_frame_is_rejected() {
        let mut frame = vec![0x81, 0x05];
        frame.extend_from_slice(b"hello");
        assert_eq!(try_decode_frame(&frame), FrameResult::MissingMask);
    }

    #[test]
    fn length_encoding_boundaries() {
        for &len in &[0usize, 125, 126, 65535, 65536] {
            let payload = vec![0x41u8; len];
            let frame = masked_frame(0x1, &payload, [9, 9, 9, 9]);
            match try_decode_frame(&frame) {
                FrameResult::Complete { payload: decoded, consumed, .. } => {
                    assert_eq!(decoded.len(), len, "len {len}");
                    assert_eq!(consumed, frame.len());
                }
                other => panic!("len {len}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unsupported_opcode_is_tagged() {
        let frame = masked_frame(0x2, b"bin", [1, 1, 1, 1]);
        match try_decode_frame(&frame) {
            FrameResult::Complete { opcode, .. } => assert_eq!(opcode, Opcode::Unsupported(0x2)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn incomplete_header_waits_for_more_bytes() {
        assert_eq!(try_decode_frame(&[0x81]), FrameResult::Incomplete);
    }

    #[test]
    fn frame_text_then_decode_as_server_would_not_mask() {
        let framed = frame_text(b"/room:0=\"hi\"");
        assert_eq!(framed[0], 0x81);
        assert_eq!(framed[1] & 0x80, 0, "server frames must not be masked");
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let framed = frame_close(&CloseReason::Timeout("no recv".to_owned()));
        assert_eq!(framed[0], 0x88);
        let code_offset = 2; // small-length close frames have a 1-byte length field
        let code = u16::from_be_bytes([framed[code_offset], framed[code_offset + 1]]);
        assert_eq!(code, 1008);
        assert!(String::from_utf8(framed[code_offset + 2..].to_vec())
            .unwrap()
            .contains("no recv"));
    }

    #[test]
    fn accept_key_matches_known_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
