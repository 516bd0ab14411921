//! Request envelope written to the worker's stdin.
//!
//! The worker speaks a JSON-RPC-like protocol. Each request carries the
//! reply address in `params.metadata.replyTo`; the worker must echo the
//! metadata back unchanged so the response can be routed.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Protocol version string carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Default request method.
pub const DEFAULT_METHOD: &str = "resource.create";

/// Default request template.
pub const DEFAULT_TEMPLATE: &str = "chat";

/// Routing metadata round-tripped through the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(rename = "replyTo")]
    pub reply_to: String,
}

/// `params` object of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub template: String,
    pub body: Value,
    pub metadata: RequestMetadata,
}

/// A single request record, serialized as one NDJSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub jsonrpc: String,
    pub method: String,
    pub id: u64,
    pub params: RequestParams,
}

impl RequestEnvelope {
    /// Build a chat request for `content`, addressed back to `reply_to`.
    pub fn chat(
        id: u64,
        method: impl Into<String>,
        template: impl Into<String>,
        content: &str,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            id,
            params: RequestParams {
                template: template.into(),
                body: chat_body(content),
                metadata: RequestMetadata {
                    reply_to: reply_to.into(),
                },
            },
        }
    }

    /// Reply address carried in the metadata.
    pub fn reply_to(&self) -> &str {
        &self.params.metadata.reply_to
    }

    /// Serialize to a single line without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Chat body with a single user message.
pub fn chat_body(content: &str) -> Value {
    json!({
        "messages": [
            { "role": "user", "content": content }
        ]
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn chat_envelope_wire_shape() {
        let env = RequestEnvelope::chat(42, DEFAULT_METHOD, DEFAULT_TEMPLATE, "hello", "abc");
        let value: Value = serde_json::from_str(&env.to_line().unwrap()).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "resource.create");
        assert_eq!(value["id"], 42);
        assert_eq!(value["params"]["template"], "chat");
        assert_eq!(value["params"]["body"]["messages"][0]["role"], "user");
        assert_eq!(value["params"]["body"]["messages"][0]["content"], "hello");
        assert_eq!(value["params"]["metadata"]["replyTo"], "abc");
    }

    #[test]
    fn line_has_no_embedded_newline() {
        let env = RequestEnvelope::chat(1, "m", "t", "multi\nline\ntext", "abc");
        let line = env.to_line().unwrap();
        assert!(!line.contains('\n'));
        let back: RequestEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(back.params.body["messages"][0]["content"], "multi\nline\ntext");
        assert_eq!(back.reply_to(), "abc");
    }
}
