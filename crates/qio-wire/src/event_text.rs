//! Raw-dialect event text: `<path>:<client_cb_uint>=<json>` (spec §4.5.1, §6).
//!
//! Parsed by splitting at the first `:` and the first `=` after it.
//! Malformed text is reported as [`EventTextError::Malformed`], which
//! protocol drivers map to closing the connection with
//! `INVALID_EVENT_FORMAT` (spec §4.5.1).

use std::fmt;

/// A decoded event text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventText {
    pub path: String,
    pub client_cb: u32,
    /// Raw JSON text, unparsed (callers decide whether/how to parse it).
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTextError {
    Malformed,
}

impl fmt::Display for EventTextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTextError::Malformed => write!(f, "malformed event text"),
        }
    }
}

impl std::error::Error for EventTextError {}

/// Parse `<path>:<client_cb_uint>=<json>`.
///
/// Splits at the first `:`, then at the first `=` in the remainder.
/// Everything after `=` is the JSON payload, taken verbatim (including
/// any further `=` or `:` characters it may contain).
pub fn decode(text: &str) -> Result<EventText, EventTextError> {
    let colon = text.find(':').ok_or(EventTextError::Malformed)?;
    let (path, rest) = (&text[..colon], &text[colon + 1..]);
    let eq = rest.find('=').ok_or(EventTextError::Malformed)?;
    let (cb_str, json) = (&rest[..eq], &rest[eq + 1..]);
    let client_cb = cb_str.parse::<u32>().map_err(|_| EventTextError::Malformed)?;
    if path.is_empty() {
        return Err(EventTextError::Malformed);
    }
    Ok(EventText {
        path: path.to_owned(),
        client_cb,
        json: json.to_owned(),
    })
}

/// Encode back into `<path>:<client_cb_uint>=<json>`.
pub fn encode(ev: &EventText) -> String {
    format!("{}:{}={}", ev.path, ev.client_cb, ev.json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_event() {
        let ev = decode("/room:42=\"hi\"").unwrap();
        assert_eq!(ev.path, "/room");
        assert_eq!(ev.client_cb, 42);
        assert_eq!(ev.json, "\"hi\"");
    }

    #[test]
    fn json_payload_may_contain_colons_and_equals() {
        let ev = decode("/room:1={\"a\":\"b=c\"}").unwrap();
        assert_eq!(ev.json, "{\"a\":\"b=c\"}");
    }

    #[test]
    fn missing_colon_is_malformed() {
        assert_eq!(decode("no-colon-here"), Err(EventTextError::Malformed));
    }

    #[test]
    fn missing_equals_is_malformed() {
        assert_eq!(decode("/room:42"), Err(EventTextError::Malformed));
    }

    #[test]
    fn non_numeric_callback_is_malformed() {
        assert_eq!(decode("/room:abc=null"), Err(EventTextError::Malformed));
    }

    #[test]
    fn empty_path_is_malformed() {
        assert_eq!(decode(":1=null"), Err(EventTextError::Malformed));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let original = "/qio/ping:1=null";
        let decoded = decode(original).unwrap();
        assert_eq!(encode(&decoded), original);
    }
}
