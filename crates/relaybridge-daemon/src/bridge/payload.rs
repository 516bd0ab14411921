//! Relay event content in both directions.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Message text used when an inbound event carries none.
pub const EMPTY_MESSAGE: &str = "Empty message";

/// `type` field of every published response.
pub const RESPONSE_TYPE: &str = "mcp-response";

/// Extract the request text from inbound event content.
///
/// Content is normally a JSON object with a `message` field. Content that
/// is not JSON at all is taken verbatim. JSON without a usable `message`
/// yields [`EMPTY_MESSAGE`].
pub fn inbound_message_text(content: &str) -> String {
    let message = match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(mut fields)) => match fields.remove("message") {
            Some(Value::String(text)) => text,
            None | Some(Value::Null | Value::Bool(false)) => String::new(),
            Some(Value::Number(n)) if is_zero(&n) => String::new(),
            Some(other) => other.to_string(),
        },
        Ok(_) => String::new(),
        Err(_) => content.to_string(),
    };

    if message.is_empty() {
        EMPTY_MESSAGE.to_string()
    } else {
        message
    }
}

fn is_zero(n: &serde_json::Number) -> bool {
    n.as_f64()
        .is_some_and(|f| f.classify() == std::num::FpCategory::Zero)
}

#[derive(Serialize)]
struct ResponseContent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'a str,
    timestamp: String,
}

/// Content of a published response event.
pub fn response_content(message: &str, at: DateTime<Utc>) -> serde_json::Result<String> {
    serde_json::to_string(&ResponseContent {
        kind: RESPONSE_TYPE,
        message,
        timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", text.get(..cut).unwrap_or(text)),
        None => text.to_string(),
    }
}
