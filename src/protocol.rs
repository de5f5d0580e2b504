//! JSON frames exchanged with clients.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

pub const STATUS_PUBLISHED: &str = "Message published successfully!";
pub const STATUS_SUBSCRIBED: &str = "Subscribed successfully!";
pub const STATUS_UNSUBSCRIBED: &str = "Unsubscribed successfully!";

const INVALID_JSON: &str = "Invalid JSON message.";
const MISSING_TOKEN: &str = "Authentication required.";
const MISSING_TOPIC: &str = "Missing topic.";
const INVALID_ACTION: &str = "Invalid action or missing message for publish.";

/// Requested operation of a client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Unsubscribe,
    Publish { message: String },
}

/// A validated client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub action: Action,
    pub topic: String,
    pub token: String,
}

/// Frame as it appears on the wire, before schema checks.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

impl ClientFrame {
    /// Parse and validate a text frame.
    ///
    /// Checks run in a fixed order: JSON shape, token, topic, then action. A publish
    /// without a non-empty `message` never reaches token verification or the broker.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| {
            tracing::debug!("Unparseable frame: {}", e);
            validation(INVALID_JSON)
        })?;

        let token = non_empty(raw.token).ok_or_else(|| validation(MISSING_TOKEN))?;
        let topic = non_empty(raw.topic).ok_or_else(|| validation(MISSING_TOPIC))?;

        let action = match raw.action.as_deref() {
            Some("subscribe") => Action::Subscribe,
            Some("unsubscribe") => Action::Unsubscribe,
            Some("publish") => match non_empty(raw.message) {
                Some(message) => Action::Publish { message },
                None => return Err(validation(INVALID_ACTION)),
            },
            _ => return Err(validation(INVALID_ACTION)),
        };

        Ok(Self {
            action,
            topic,
            token,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn validation(message: &str) -> RelayError {
    RelayError::Validation(message.to_string())
}

/// Frames sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Fan-out of a broker message.
    Delivery { topic: String, message: String },
    Status { status: String },
    Error { error: String },
}

impl ServerFrame {
    pub fn delivery(topic: impl Into<String>, message: impl Into<String>) -> Self {
        ServerFrame::Delivery {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        ServerFrame::Status {
            status: status.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Socket(format!("Failed to encode frame: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_err(text: &str) -> String {
        match ClientFrame::parse(text) {
            Err(RelayError::Validation(message)) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscribe() {
        let frame =
            ClientFrame::parse(r#"{"action":"subscribe","topic":"news","token":"t"}"#).unwrap();
        assert_eq!(frame.action, Action::Subscribe);
        assert_eq!(frame.topic, "news");
        assert_eq!(frame.token, "t");
    }

    #[test]
    fn test_subscribe_ignores_message() {
        let frame = ClientFrame::parse(
            r#"{"action":"subscribe","topic":"news","message":"x","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(frame.action, Action::Subscribe);
    }

    #[test]
    fn test_parse_publish() {
        let frame = ClientFrame::parse(
            r#"{"action":"publish","topic":"news","message":"hello","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(
            frame.action,
            Action::Publish {
                message: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_publish_requires_message() {
        assert_eq!(
            parse_err(r#"{"action":"publish","topic":"news","token":"t"}"#),
            INVALID_ACTION
        );
        assert_eq!(
            parse_err(r#"{"action":"publish","topic":"news","message":"","token":"t"}"#),
            INVALID_ACTION
        );
    }

    #[test]
    fn test_invalid_json() {
        assert_eq!(parse_err("{not json"), INVALID_JSON);
        assert_eq!(parse_err(""), INVALID_JSON);
    }

    #[test]
    fn test_schema_mismatch() {
        assert_eq!(
            parse_err(r#"{"action":"subscribe","topic":42,"token":"t"}"#),
            INVALID_JSON
        );
        assert_eq!(parse_err(r#""subscribe""#), INVALID_JSON);
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            parse_err(r#"{"action":"subscribe","topic":"news"}"#),
            MISSING_TOKEN
        );
        assert_eq!(
            parse_err(r#"{"action":"subscribe","topic":"news","token":""}"#),
            MISSING_TOKEN
        );
        assert_eq!(parse_err(r#"{"action":"subscribe","token":"t"}"#), MISSING_TOPIC);
        assert_eq!(
            parse_err(r#"{"action":"delete","topic":"news","token":"t"}"#),
            INVALID_ACTION
        );
        assert_eq!(parse_err(r#"{"topic":"news","token":"t"}"#), INVALID_ACTION);
    }

    #[test]
    fn test_server_frame_shapes() {
        assert_eq!(
            ServerFrame::status(STATUS_PUBLISHED).to_json().unwrap(),
            r#"{"status":"Message published successfully!"}"#
        );
        assert_eq!(
            ServerFrame::delivery("news", "hello").to_json().unwrap(),
            r#"{"topic":"news","message":"hello"}"#
        );
        assert_eq!(
            ServerFrame::error("Invalid token.").to_json().unwrap(),
            r#"{"error":"Invalid token."}"#
        );
    }

    #[test]
    fn test_server_frame_decodes_by_shape() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"topic":"news","message":"hello"}"#).unwrap();
        assert_eq!(frame, ServerFrame::delivery("news", "hello"));
        let frame: ServerFrame = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(frame, ServerFrame::error("boom"));
    }
}
