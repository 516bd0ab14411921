//! Worker response interpretation.
//!
//! Workers are not required to follow one exact response shape. The
//! human-readable text is located by walking an ordered list of JSON
//! pointers; the first one that resolves to a string wins. Order matters
//! for compatibility with existing workers.

use serde_json::Value;

/// Text used when no rule matches.
pub const PLACEHOLDER_MESSAGE: &str = "Response from worker";

/// Prefix applied to messages taken from an error form.
pub const ERROR_PREFIX: &str = "Error: ";

/// Where the reply address may be found, in priority order.
const REPLY_TO_POINTERS: &[&str] = &["/params/metadata/replyTo", "/params/metadata/senderPubkey"];

/// Whether a rule reads from the success or the error form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Success,
    Error,
}

/// One message-extraction rule: a JSON pointer and the form it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionRule {
    pub pointer: &'static str,
    pub kind: RuleKind,
}

impl ExtractionRule {
    const fn success(pointer: &'static str) -> Self {
        Self {
            pointer,
            kind: RuleKind::Success,
        }
    }

    const fn error(pointer: &'static str) -> Self {
        Self {
            pointer,
            kind: RuleKind::Error,
        }
    }

    /// Apply the rule, returning the formatted message if it matches.
    pub fn apply(&self, raw: &Value) -> Option<String> {
        let text = raw.pointer(self.pointer)?.as_str()?;
        Some(match self.kind {
            RuleKind::Success => text.to_string(),
            RuleKind::Error => format!("{ERROR_PREFIX}{text}"),
        })
    }
}

/// Message-extraction rules in acceptance order.
pub const MESSAGE_RULES: &[ExtractionRule] = &[
    ExtractionRule::success("/result/output/message/content"),
    ExtractionRule::success("/result/message"),
    ExtractionRule::error("/error/message"),
    ExtractionRule::error("/error"),
    ExtractionRule::success("/output/message/content"),
    ExtractionRule::success("/message"),
];

/// Success or error form of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    Error,
}

/// A worker response reduced to what the bridge needs for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResponse {
    pub kind: ResponseKind,
    /// Human-readable message, already prefixed for errors.
    pub message: String,
    /// Round-tripped reply address, if the worker echoed it.
    pub reply_to: Option<String>,
    /// JSON-RPC id, when present and numeric.
    pub id: Option<u64>,
}

impl WorkerResponse {
    /// Interpret an arbitrary JSON record from the worker.
    ///
    /// Never fails: missing fields fall back to the placeholder message and
    /// an absent reply address.
    pub fn from_value(raw: &Value) -> Self {
        let kind = if raw.get("error").is_some_and(|e| !e.is_null()) {
            ResponseKind::Error
        } else {
            ResponseKind::Success
        };

        Self {
            kind,
            message: extract_message(raw),
            reply_to: extract_reply_to(raw),
            id: raw.get("id").and_then(Value::as_u64),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// Reply address, or `default` when the worker dropped the metadata.
    pub fn reply_to_or<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.reply_to.as_deref().or(default)
    }
}

/// Apply [`MESSAGE_RULES`] in order.
pub fn extract_message(raw: &Value) -> String {
    MESSAGE_RULES
        .iter()
        .find_map(|rule| rule.apply(raw))
        .unwrap_or_else(|| PLACEHOLDER_MESSAGE.to_string())
}

/// Find the round-tripped reply address. Empty strings count as absent.
pub fn extract_reply_to(raw: &Value) -> Option<String> {
    REPLY_TO_POINTERS
        .iter()
        .filter_map(|p| raw.pointer(p).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_content_preferred_over_result_message() {
        let raw = json!({
            "result": {
                "message": "second",
                "output": { "message": { "content": "hi" } }
            },
            "params": { "metadata": { "replyTo": "abc" } }
        });
        let resp = WorkerResponse::from_value(&raw);
        assert_eq!(resp.kind, ResponseKind::Success);
        assert_eq!(resp.message, "hi");
        assert_eq!(resp.reply_to.as_deref(), Some("abc"));
    }

    #[test]
    fn result_message_used_when_no_output() {
        let raw = json!({ "result": { "message": "plain" } });
        assert_eq!(extract_message(&raw), "plain");
    }

    #[test]
    fn error_message_is_prefixed() {
        let raw = json!({ "error": { "code": -32603, "message": "boom" } });
        let resp = WorkerResponse::from_value(&raw);
        assert!(resp.is_error());
        assert_eq!(resp.message, "Error: boom");
        assert!(resp.reply_to.is_none());
        assert_eq!(resp.reply_to_or(Some("default")), Some("default"));
    }

    #[test]
    fn bare_error_string_accepted() {
        let raw = json!({ "error": "worker exploded" });
        assert_eq!(extract_message(&raw), "Error: worker exploded");
    }

    #[test]
    fn rule_order_applies_when_both_forms_present() {
        let raw = json!({
            "result": { "message": "ok" },
            "error": { "message": "ignored" }
        });
        let resp = WorkerResponse::from_value(&raw);
        assert_eq!(resp.kind, ResponseKind::Error);
        assert_eq!(resp.message, "ok");
    }

    #[test]
    fn legacy_top_level_forms() {
        assert_eq!(
            extract_message(&json!({ "output": { "message": { "content": "legacy" } } })),
            "legacy"
        );
        assert_eq!(extract_message(&json!({ "message": "top" })), "top");
    }

    #[test]
    fn non_string_values_fall_through() {
        let raw = json!({ "result": { "message": 12 }, "message": { "nested": true } });
        assert_eq!(extract_message(&raw), PLACEHOLDER_MESSAGE);
    }

    #[test]
    fn placeholder_when_nothing_matches() {
        let resp = WorkerResponse::from_value(&json!({ "jsonrpc": "2.0", "id": 9 }));
        assert_eq!(resp.message, PLACEHOLDER_MESSAGE);
        assert_eq!(resp.id, Some(9));
        assert_eq!(resp.reply_to_or(None), None);
    }

    #[test]
    fn legacy_sender_pubkey_metadata() {
        let raw = json!({ "params": { "metadata": { "senderPubkey": "def" } } });
        assert_eq!(extract_reply_to(&raw).as_deref(), Some("def"));
    }

    #[test]
    fn empty_reply_to_counts_as_absent() {
        let raw = json!({ "params": { "metadata": { "replyTo": "" } } });
        assert_eq!(extract_reply_to(&raw), None);
    }

    #[test]
    fn null_error_is_success() {
        let raw = json!({ "error": null, "result": { "message": "fine" } });
        assert_eq!(WorkerResponse::from_value(&raw).kind, ResponseKind::Success);
    }
}
