//! Socket-level `SocketWriter` implementation over a real `TcpStream`
//! half. The engine only ever sees this trait; it never touches tokio's
//! net types directly.

use async_trait::async_trait;
use qio_core::{CloseReason, SocketWriter};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Wraps the write half of a client's TCP connection. `None` once closed,
/// so a second `close()` (or a write racing a close) is a harmless no-op
/// rather than a double-shutdown panic.
pub struct TcpWriter {
    half: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        TcpWriter { half: Mutex::new(Some(half)) }
    }
}

#[async_trait]
impl SocketWriter for TcpWriter {
    async fn write(&self, bytes: Vec<u8>) -> bool {
        let mut guard = self.half.lock().await;
        match guard.as_mut() {
            Some(half) => half.write_all(&bytes).await.is_ok(),
            None => false,
        }
    }

    async fn close(&self, reason: CloseReason) {
        tracing::debug!(?reason, "closing client socket");
        let mut guard = self.half.lock().await;
        if let Some(mut half) = guard.take() {
            let _ = half.shutdown().await;
        }
    }
}
