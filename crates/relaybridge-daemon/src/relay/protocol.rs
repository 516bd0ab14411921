//! Relay wire messages.
//!
//! Every frame is a JSON array whose first element names the message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relaybridge_crypto::Event;

use super::error::RelayError;

/// Subscription filter: event kinds plus recipient (`p`) tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub kinds: Vec<u16>,
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub p_tags: Vec<String>,
}

impl Filter {
    /// Events of `kind` tagged with `pubkey` as recipient.
    pub fn addressed_to(kind: u16, pubkey: impl Into<String>) -> Self {
        Self {
            kinds: vec![kind],
            p_tags: vec![pubkey.into()],
        }
    }

    /// Whether `event` passes this filter. Empty lists match anything.
    pub fn matches(&self, event: &Event) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        let tag_ok = self.p_tags.is_empty()
            || self.p_tags.iter().any(|wanted| event.is_addressed_to(wanted));
        kind_ok && tag_ok
    }
}

/// Client-to-relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filter: Filter,
    },
    Event(Event),
    Close {
        subscription_id: String,
    },
}

impl ClientMessage {
    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, RelayError> {
        let encode = |e: serde_json::Error| RelayError::Protocol(e.to_string());
        let frame = match self {
            Self::Req {
                subscription_id,
                filter,
            } => vec![
                Value::from("REQ"),
                Value::from(subscription_id.as_str()),
                serde_json::to_value(filter).map_err(encode)?,
            ],
            Self::Event(event) => vec![
                Value::from("EVENT"),
                serde_json::to_value(event).map_err(encode)?,
            ],
            Self::Close { subscription_id } => {
                vec![Value::from("CLOSE"), Value::from(subscription_id.as_str())]
            }
        };
        serde_json::to_string(&frame).map_err(encode)
    }
}

/// Relay-to-client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    /// End of stored events: the subscription now only receives live events.
    Eose {
        subscription_id: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    /// Decode a JSON text frame.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let frame: Vec<Value> =
            serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))?;
        let Some((label, rest)) = frame.split_first() else {
            return Err(RelayError::Protocol("empty frame".into()));
        };

        match (label.as_str(), rest) {
            (Some("EVENT"), [sub, event, ..]) => Ok(Self::Event {
                subscription_id: string_field(sub, "subscription id")?,
                event: serde_json::from_value(event.clone())
                    .map_err(|e| RelayError::Protocol(format!("invalid event: {e}")))?,
            }),
            (Some("EOSE"), [sub, ..]) => Ok(Self::Eose {
                subscription_id: string_field(sub, "subscription id")?,
            }),
            (Some("OK"), [id, accepted, rest @ ..]) => Ok(Self::Ok {
                event_id: string_field(id, "event id")?,
                accepted: accepted
                    .as_bool()
                    .ok_or_else(|| RelayError::Protocol("OK status is not a boolean".into()))?,
                message: optional_message(rest),
            }),
            (Some("NOTICE"), [message, ..]) => Ok(Self::Notice {
                message: string_field(message, "notice")?,
            }),
            (Some("CLOSED"), [sub, rest @ ..]) => Ok(Self::Closed {
                subscription_id: string_field(sub, "subscription id")?,
                message: optional_message(rest),
            }),
            (Some(other), _) => Err(RelayError::Protocol(format!(
                "unsupported or malformed {other} frame"
            ))),
            (None, _) => Err(RelayError::Protocol("frame label is not a string".into())),
        }
    }
}

fn string_field(value: &Value, what: &str) -> Result<String, RelayError> {
    value
        .as_str()
        .map(String::from)
        .ok_or_else(|| RelayError::Protocol(format!("{what} is not a string")))
}

fn optional_message(rest: &[Value]) -> String {
    rest.first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
