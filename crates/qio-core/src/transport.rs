//! The one trait boundary between the engine and socket I/O. `qio-core`
//! frames bytes itself (via `qio-wire`) and hands finished frames to
//! whatever implements this trait; it never touches a `TcpStream`.

use async_trait::async_trait;

/// Why a client connection is being closed. Protocol-neutral; each
/// transport implementation maps this to its own wire representation
/// (WS close code + reason text, plain TCP close, HTTP 403).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Exit,
    NotSupported,
    InvalidHandshake,
    InvalidEventFormat,
    MissingMask,
    UnsupportedOpcode,
    NotUtf8,
    OutOfMemory,
    Heartattack,
    Timeout(String),
}

impl CloseReason {
    /// Map to the wire-level WS close reason, for transports that want to
    /// send an RFC 6455 close frame before shutting the socket down.
    /// `NotSupported` has no WS equivalent — it only fires before a client
    /// has completed any handshake, raw or WS, so there's never a WS peer
    /// on the other end to frame a close for.
    pub fn to_ws_close_reason(&self) -> Option<qio_wire::ws::CloseReason> {
        match self {
            CloseReason::Exit => Some(qio_wire::ws::CloseReason::Exit),
            CloseReason::NotSupported => None,
            CloseReason::InvalidHandshake => Some(qio_wire::ws::CloseReason::InvalidHandshake),
            CloseReason::InvalidEventFormat => Some(qio_wire::ws::CloseReason::InvalidEvent),
            CloseReason::MissingMask => Some(qio_wire::ws::CloseReason::MissingMask),
            CloseReason::UnsupportedOpcode => Some(qio_wire::ws::CloseReason::UnsupportedOpcode),
            CloseReason::NotUtf8 => Some(qio_wire::ws::CloseReason::NotUtf8),
            CloseReason::OutOfMemory => Some(qio_wire::ws::CloseReason::OutOfMemory),
            CloseReason::Heartattack => Some(qio_wire::ws::CloseReason::Timeout("heartbeat timeout".to_owned())),
            CloseReason::Timeout(msg) => Some(qio_wire::ws::CloseReason::Timeout(msg.clone())),
        }
    }
}

/// A sink for already-framed outbound bytes, implemented by the server
/// binary over a real socket (or, in tests, an in-memory buffer).
#[async_trait]
pub trait SocketWriter: Send + Sync {
    /// Write `bytes` verbatim. `false` means the write failed and the
    /// caller should treat the connection as closed.
    async fn write(&self, bytes: Vec<u8>) -> bool;

    async fn close(&self, reason: CloseReason);
}
