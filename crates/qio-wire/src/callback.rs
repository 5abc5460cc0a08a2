//! `/qio/callback/<id>` JSON envelope formatting (spec §4.9).

/// Path prefix for server-side callback replies.
pub const CALLBACK_PATH_PREFIX: &str = "/qio/callback/";

pub fn callback_path(client_cb: u32) -> String {
    format!("{CALLBACK_PATH_PREFIX}{client_cb}")
}

/// `json` is raw JSON text already (or `None` for `null`).
fn json_or_null(json: Option<&str>) -> &str {
    match json {
        Some(j) if !j.is_empty() => j,
        _ => "null",
    }
}

/// Build the success envelope: `{"code":<code>,"data":<json_or_null>}`.
pub fn success_envelope(code: u16, data: Option<&str>) -> String {
    format!("{{\"code\":{code},\"data\":{}}}", json_or_null(data))
}

/// Build the error envelope:
/// `{"code":<code>,"data":<json_or_null>,"err_msg":<json-encoded msg>}`.
pub fn error_envelope(code: u16, data: Option<&str>, err_msg: &str) -> String {
    format!(
        "{{\"code\":{code},\"data\":{},\"err_msg\":{}}}",
        json_or_null(data),
        serde_json::to_string(err_msg).unwrap_or_else(|_| "\"\"".to_owned())
    )
}
