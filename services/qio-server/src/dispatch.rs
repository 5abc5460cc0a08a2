//! Per-connection protocol dispatch (L5): sniff → handshake → frame loop,
//! for raw, WebSocket, Flash policy, and HTTP (upgrade-or-long-poll).
//! One task per accepted TCP connection.

use std::net::SocketAddr;
use std::sync::Arc;

use qio_core::transport::CloseReason as EngineCloseReason;
use qio_core::{Client, ClientId, Engine, Protocol};
use qio_wire::{decode_event_text, flash, http, raw, ws};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::config::ServerConfig;
use crate::surrogate::SurrogateTable;
use crate::transport::TcpWriter;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    Yes,
    Maybe,
    No,
}

/// HTTP has no single literal to prefix-match against like raw/Flash do;
/// approximate the same tri-state by checking whether `buf` is still a
/// viable prefix of `<METHOD> /`.
fn sniff_http(buf: &[u8]) -> Sniff {
    const METHODS: &[&str] = &["GET /", "POST /", "OPTIONS /", "PUT /", "HEAD /", "DELETE /"];
    if buf.is_empty() {
        return Sniff::Maybe;
    }
    for m in METHODS {
        let m = m.as_bytes();
        let n = buf.len().min(m.len());
        if buf[..n] == m[..n] {
            return if buf.len() >= m.len() { Sniff::Yes } else { Sniff::Maybe };
        }
    }
    Sniff::No
}

struct Conn {
    read_half: tokio::net::tcp::OwnedReadHalf,
    buf: Vec<u8>,
}

impl Conn {
    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        match self.read_half.read(&mut chunk).await {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
        }
    }

    fn drain(&mut self, n: usize) {
        self.buf.drain(..n);
    }
}

pub async fn handle_connection(engine: Arc<Engine>, surrogates: Arc<SurrogateTable>, config: Arc<ServerConfig>, stream: TcpStream, peer: SocketAddr) {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let sock: Arc<dyn qio_core::SocketWriter> = Arc::new(TcpWriter::new(write_half));
    let mut conn = Conn { read_half, buf: Vec::new() };

    loop {
        match flash::sniff(&conn.buf) {
            flash::Sniff::Yes => {
                handle_flash(&sock).await;
                return;
            }
            flash::Sniff::Maybe => {
                if !conn.fill().await {
                    return;
                }
                continue;
            }
            flash::Sniff::No => {}
        }

        match raw::sniff(&conn.buf) {
            raw::Sniff::Yes => {
                conn.drain(raw::HANDSHAKE.len());
                sock.write(raw::HANDSHAKE.to_vec()).await;
                let client = Arc::new(Client::new(ClientId::next(), Protocol::Raw, Some(sock.clone())));
                client.handshaked.store(true, std::sync::atomic::Ordering::SeqCst);
                client.touch_recv();
                engine.registry.insert(Arc::clone(&client));
                run_raw_loop(&engine, &client, conn).await;
                return;
            }
            raw::Sniff::Maybe => {
                if !conn.fill().await {
                    return;
                }
                continue;
            }
            raw::Sniff::No => {}
        }

        match sniff_http(&conn.buf) {
            Sniff::Yes => {
                run_http_loop(&engine, &surrogates, &config, &sock, conn, peer).await;
                return;
            }
            Sniff::Maybe => {
                if !conn.fill().await {
                    return;
                }
                continue;
            }
            Sniff::No => {
                sock.close(EngineCloseReason::NotSupported).await;
                return;
            }
        }
    }
}

async fn handle_flash(sock: &Arc<dyn qio_core::SocketWriter>) {
    sock.write(flash::POLICY_BODY.as_bytes().to_vec()).await;
    sock.close(EngineCloseReason::Exit).await;
}

// ---------------------------------------------------------------------------
// Raw (and, after a successful upgrade, WebSocket) frame loop
// ---------------------------------------------------------------------------

async fn run_raw_loop(engine: &Arc<Engine>, client: &Arc<Client>, mut conn: Conn) {
    loop {
        match raw::try_decode_frame(&conn.buf) {
            raw::FrameResult::Complete { body, consumed } => {
                conn.drain(consumed);
                client.touch_recv();
                match std::str::from_utf8(&body).ok().and_then(|t| decode_event_text(t).ok()) {
                    Some(ev) => engine.route(client, &ev.path, ev.client_cb, &ev.json).await,
                    None => {
                        close_client(engine, client, EngineCloseReason::InvalidEventFormat).await;
                        return;
                    }
                }
            }
            raw::FrameResult::Incomplete | raw::FrameResult::NeedMore { .. } => {
                if !conn.fill().await {
                    engine.registry.remove(client.id);
                    return;
                }
            }
            raw::FrameResult::Overflow | raw::FrameResult::TooLarge => {
                close_client(engine, client, EngineCloseReason::OutOfMemory).await;
                return;
            }
        }
    }
}

async fn run_ws_loop(engine: &Arc<Engine>, client: &Arc<Client>, mut conn: Conn) {
    loop {
        match ws::try_decode_frame(&conn.buf) {
            ws::FrameResult::Complete { opcode, payload, consumed } => {
                conn.drain(consumed);
                client.touch_recv();
                match opcode {
                    ws::Opcode::Close => {
                        close_client(engine, client, EngineCloseReason::Exit).await;
                        return;
                    }
                    ws::Opcode::Unsupported(_) => {
                        close_client(engine, client, EngineCloseReason::UnsupportedOpcode).await;
                        return;
                    }
                    ws::Opcode::Text => {
                        let Ok(text) = std::str::from_utf8(&payload) else {
                            close_client(engine, client, EngineCloseReason::NotUtf8).await;
                            return;
                        };
                        if !client.handshaked.load(std::sync::atomic::Ordering::SeqCst) {
                            if text == "/qio/ohai" {
                                if let Some(sock) = &client.socket {
                                    sock.write(ws::frame_text(b"/qio/ohai")).await;
                                }
                                client.handshaked.store(true, std::sync::atomic::Ordering::SeqCst);
                            } else {
                                close_client(engine, client, EngineCloseReason::InvalidHandshake).await;
                                return;
                            }
                            continue;
                        }
                        match decode_event_text(text) {
                            Ok(ev) => engine.route(client, &ev.path, ev.client_cb, &ev.json).await,
                            Err(_) => {
                                close_client(engine, client, EngineCloseReason::InvalidEventFormat).await;
                                return;
                            }
                        }
                    }
                }
            }
            ws::FrameResult::Incomplete => {
                if !conn.fill().await {
                    engine.registry.remove(client.id);
                    return;
                }
            }
            ws::FrameResult::MissingMask => {
                close_client(engine, client, EngineCloseReason::MissingMask).await;
                return;
            }
            ws::FrameResult::Overflow => {
                close_client(engine, client, EngineCloseReason::OutOfMemory).await;
                return;
            }
        }
    }
}

async fn close_client(engine: &Arc<Engine>, client: &Arc<Client>, reason: EngineCloseReason) {
    if let Some(sock) = &client.socket {
        if client.protocol() == Protocol::WebSocket {
            if let Some(ws_reason) = reason.to_ws_close_reason() {
                sock.write(ws::frame_close(&ws_reason)).await;
            }
        }
        sock.close(reason).await;
    }
    engine.registry.remove(client.id);
}

// ---------------------------------------------------------------------------
// HTTP: WS upgrade negotiation or long-poll request loop
// ---------------------------------------------------------------------------

async fn run_http_loop(engine: &Arc<Engine>, surrogates: &Arc<SurrogateTable>, config: &Arc<ServerConfig>, sock: &Arc<dyn qio_core::SocketWriter>, mut conn: Conn, peer: SocketAddr) {
    loop {
        let header_end = loop {
            if let Some(end) = http::header_end(&conn.buf) {
                break end;
            }
            if !conn.fill().await {
                return;
            }
        };
        let Ok(req) = http::parse_request(&conn.buf[..header_end]) else {
            sock.write(http::response_400()).await;
            return;
        };

        match try_upgrade(engine, sock, &req).await {
            UpgradeOutcome::Upgraded(client) => {
                conn.drain(header_end);
                run_ws_loop(engine, &client, conn).await;
                return;
            }
            UpgradeOutcome::Rejected => return,
            UpgradeOutcome::NotRequested => {}
        }

        let body_len = req.content_length().unwrap_or(0);
        if req.method == http::Method::Post && req.content_length().is_none() {
            sock.write(http::response_411()).await;
            return;
        }
        if body_len as u64 > raw::MAX_FRAME_LEN {
            sock.write(http::response_413()).await;
            return;
        }
        let total = header_end + body_len;
        while conn.buf.len() < total {
            if !conn.fill().await {
                return;
            }
        }
        let body = conn.buf[header_end..total].to_vec();
        conn.drain(total);

        let keep_alive = req.keep_alive();

        if req.path == "/iframe" {
            if !config.http_enabled() {
                sock.write(http::response_501()).await;
            } else {
                sock.write(http::response_200(http::IFRAME_HTML.as_bytes(), "text/html", keep_alive)).await;
            }
            if !keep_alive {
                return;
            }
            continue;
        }

        if !config.http_enabled() {
            sock.write(http::response_501()).await;
            return;
        }

        if req.method != http::Method::Post {
            sock.write(http::response_405()).await;
            if !keep_alive {
                return;
            }
            continue;
        }

        let Some(sid_raw) = req.query.get("sid") else {
            sock.write(http::response_403()).await;
            return;
        };
        let Some(sid) = http::parse_session_id(sid_raw) else {
            sock.write(http::response_403()).await;
            return;
        };

        let connect = req.query.get("connect").map(String::as_str) == Some("true");
        let Some(surrogate) = surrogates.get_or_create(sid, connect, || {
            let s = Arc::new(Client::new(ClientId::next(), Protocol::HttpSurrogate, None));
            s.set_session_id(sid);
            s.handshaked.store(true, std::sync::atomic::Ordering::SeqCst);
            engine.registry.insert(Arc::clone(&s));
            s
        }) else {
            sock.write(http::response_403()).await;
            return;
        };

        if let Some(http_state) = &surrogate.http {
            http_state.lock().unwrap().receiving = true;
        }
        if let Ok(text) = std::str::from_utf8(&body) {
            for line in text.split('\n') {
                if line.is_empty() {
                    continue;
                }
                match decode_event_text(line) {
                    Ok(ev) => engine.route(&surrogate, &ev.path, ev.client_cb, &ev.json).await,
                    Err(_) => tracing::debug!(%peer, "malformed long-poll event line dropped"),
                }
            }
        }
        if let Some(http_state) = &surrogate.http {
            http_state.lock().unwrap().receiving = false;
        }

        let poller = Arc::new(Client::new(ClientId::next(), Protocol::HttpPoller, Some(sock.clone())));
        poller.set_session_id(sid);
        poller.handshaked.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(http_state) = &poller.http {
            http_state.lock().unwrap().keep_alive = keep_alive;
        }
        engine.registry.insert(Arc::clone(&poller));
        engine.attach_poller(&surrogate, poller).await;

        if !keep_alive {
            return;
        }
    }
}

enum UpgradeOutcome {
    /// No `Sec-WebSocket-Key` header; this is an ordinary long-poll request.
    NotRequested,
    /// Key present but the rest of the upgrade headers didn't match; a
    /// 426 has already been written and the connection is done.
    Rejected,
    Upgraded(Arc<Client>),
}

async fn try_upgrade(engine: &Arc<Engine>, sock: &Arc<dyn qio_core::SocketWriter>, req: &http::Request) -> UpgradeOutcome {
    let Some(key) = req.header("sec-websocket-key") else {
        return UpgradeOutcome::NotRequested;
    };
    let upgrade_ok = req.header("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
    let connection_ok = req.header("connection").map(|v| v.to_ascii_lowercase().contains("upgrade")).unwrap_or(false);
    let protocol_ok = req.header("sec-websocket-protocol").map(|v| v.eq_ignore_ascii_case("quickio")).unwrap_or(false);
    let version_ok = req.header("sec-websocket-version") == Some("13");

    if !(upgrade_ok && connection_ok && protocol_ok && version_ok) {
        sock.write(http::response_426()).await;
        return UpgradeOutcome::Rejected;
    }

    let accept = ws::accept_key(key);
    sock.write(http::response_101_upgrade(&accept)).await;
    let client = Arc::new(Client::new(ClientId::next(), Protocol::WebSocket, Some(sock.clone())));
    client.touch_recv();
    engine.registry.insert(Arc::clone(&client));
    UpgradeOutcome::Upgraded(client)
}
