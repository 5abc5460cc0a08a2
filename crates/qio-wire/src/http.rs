//! HTTP framing: header scan, request-line parsing, and fixed error
//! responses (spec §4.5, §4.6).
//!
//! No external HTTP library is used, matching spec §4.6's assumption —
//! the broker only ever needs to parse its own narrow request shape
//! (method, path, query, a handful of headers) and emit a handful of
//! fixed-shape responses.

use std::collections::HashMap;

/// Scan `buf` for the end of the HTTP header block (`\r\n\r\n` or `\n\n`).
/// Returns the byte offset just past the terminator, if present.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = find(buf, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    find(buf, b"\n\n").map(|pos| pos + 2)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Options,
    Put,
    Head,
    Delete,
    Other,
}

impl Method {
    fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "OPTIONS" => Some(Method::Options),
            "PUT" => Some(Method::Put),
            "HEAD" => Some(Method::Head),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

/// True if `buf` starts with a request line recognized by the sniffer
/// (spec §4.5: `GET/POST/OPTIONS/PUT/HEAD/DELETE /`).
pub fn looks_like_request_line(buf: &[u8]) -> bool {
    let text = match std::str::from_utf8(buf) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let first_line = text.split("\r\n").next().unwrap_or(text);
    let first_line = first_line.split('\n').next().unwrap_or(first_line);
    let mut parts = first_line.splitn(2, ' ');
    let Some(method) = parts.next() else { return false };
    let Some(rest) = parts.next() else { return false };
    Method::parse(method).is_some() && rest.starts_with('/')
}

/// A parsed HTTP request (headers + body are supplied by the caller once
/// `Content-Length` bytes have been buffered).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path component only (no query string).
    pub path: String,
    /// Parsed `key=value` query parameters.
    pub query: HashMap<String, String>,
    pub version: HttpVersion,
    /// Case-insensitive header lookup.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Keep-alive per spec §4.6: HTTP/1.1 defaults to keep-alive unless
    /// `Connection: close`; HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").map(|v| v.to_ascii_lowercase());
        match self.version {
            HttpVersion::Http11 => connection.as_deref() != Some("close"),
            HttpVersion::Http10 => connection.as_deref() == Some("keep-alive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestParseError {
    Malformed,
}

/// Parse the header block (everything up to and including the blank line).
/// `header_block` must already be the bytes returned by [`header_end`]
/// (i.e. it includes the terminating blank line).
pub fn parse_request(header_block: &[u8]) -> Result<Request, RequestParseError> {
    let text = std::str::from_utf8(header_block).map_err(|_| RequestParseError::Malformed)?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));
    let request_line = lines.next().ok_or(RequestParseError::Malformed)?;

    let mut parts = request_line.split(' ');
    let method_str = parts.next().ok_or(RequestParseError::Malformed)?;
    let target = parts.next().ok_or(RequestParseError::Malformed)?;
    let version_str = parts.next().unwrap_or("HTTP/1.1").trim();

    let method = Method::parse(method_str).ok_or(RequestParseError::Malformed)?;
    let version = match version_str {
        "HTTP/1.0" => HttpVersion::Http10,
        _ => HttpVersion::Http11,
    };

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_owned(), parse_query(q)),
        None => (target.to_owned(), HashMap::new()),
    };

    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    Ok(Request {
        method,
        path,
        query,
        version,
        headers,
    })
}

fn parse_query(q: &str) -> HashMap<String, String> {
    q.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

/// Parse a 32-hex-nibble session id (spec §4.6 "Session id parsing").
/// Any other length or non-hex content is rejected.
pub fn parse_session_id(raw: &str) -> Option<u128> {
    if raw.len() != 32 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u128::from_str_radix(raw, 16).ok()
}

// ---------------------------------------------------------------------------
// Fixed error responses (spec §4.6)
// ---------------------------------------------------------------------------

const COMMON_HEADERS: &str = "Cache-Control: private, max-age=0\r\n\
Expires: -1\r\n\
Connection: Keep-Alive\r\n\
Keep-Alive: timeout=60\r\n\
Content-Type: text/plain\r\n";

fn fixed_response(status_line: &str, body: &str) -> Vec<u8> {
    format!(
        "{status_line}\r\n{COMMON_HEADERS}Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub fn response_400() -> Vec<u8> {
    fixed_response("HTTP/1.0 400 Bad Request", "")
}

pub fn response_403() -> Vec<u8> {
    fixed_response("HTTP/1.0 403 Forbidden", "")
}

pub fn response_405() -> Vec<u8> {
    fixed_response("HTTP/1.0 405 Method Not Allowed", "")
}

pub fn response_411() -> Vec<u8> {
    fixed_response("HTTP/1.0 411 Length Required", "")
}

pub fn response_413() -> Vec<u8> {
    fixed_response("HTTP/1.0 413 Payload Too Large", "")
}

pub fn response_426() -> Vec<u8> {
    fixed_response("HTTP/1.0 426 Upgrade Required", "")
}

/// 501 carries the postMessage HTML body so an `<iframe>` embed can report
/// "HTTP transport disabled" to its parent window (spec §4.6).
pub fn response_501() -> Vec<u8> {
    fixed_response("HTTP/1.0 501 Not Implemented", POST_MESSAGE_DISABLED_HTML)
}

const POST_MESSAGE_DISABLED_HTML: &str = "<!doctype html><html><body><script>\
window.parent.postMessage('qio:disabled', '*');\
</script></body></html>";

/// `GET /iframe` response body (spec §4.6, §6).
pub const IFRAME_HTML: &str = "<!doctype html><html><body><script>\
window.parent.postMessage('qio:ready', '*');\
</script></body></html>";

/// Build a `200 OK` response carrying `body` (a long-poll flush or an
/// iframe page), honoring the connection's keep-alive decision.
pub fn response_200(body: &[u8], content_type: &str, keep_alive: bool) -> Vec<u8> {
    let connection = if keep_alive { "Keep-Alive" } else { "close" };
    let mut out = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: {content_type}\r\nConnection: {connection}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Build the `101 Switching Protocols` WebSocket upgrade response.
pub fn response_101_upgrade(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: {accept}\r\n\
Sec-WebSocket-Protocol: quickio\r\n\r\n"
    )
    .into_bytes()
}
