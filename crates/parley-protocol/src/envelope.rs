use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Numeric event codes carried in the `event_type` field of the envelope
/// and in the `type` field of the socket frame header.
///
/// - `1001` user utterance entering the router
/// - `1002` user terminates the current dialog turn chain
/// - `2001` reply bound for the user
/// - `2002` handler finished, session may be torn down
/// - `2003` handler rejects the turn, re-route it
/// - `3000` tool-memory operation (HTTP surface only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum EventType {
    UserIn,
    UserTerminate,
    Reply,
    HandlerDone,
    HandlerReject,
    MemoryOp,
}

impl From<EventType> for u16 {
    fn from(e: EventType) -> u16 {
        match e {
            EventType::UserIn => 1001,
            EventType::UserTerminate => 1002,
            EventType::Reply => 2001,
            EventType::HandlerDone => 2002,
            EventType::HandlerReject => 2003,
            EventType::MemoryOp => 3000,
        }
    }
}

impl TryFrom<u16> for EventType {
    type Error = ProtocolError;

    fn try_from(v: u16) -> Result<Self, ProtocolError> {
        match v {
            1001 => Ok(Self::UserIn),
            1002 => Ok(Self::UserTerminate),
            2001 => Ok(Self::Reply),
            2002 => Ok(Self::HandlerDone),
            2003 => Ok(Self::HandlerReject),
            3000 => Ok(Self::MemoryOp),
            other => Err(ProtocolError::UnknownEvent(other)),
        }
    }
}

/// A scored intent candidate, as produced by the matcher ensemble and
/// forwarded to the clarifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    #[serde(rename = "intent_name")]
    pub name: String,
    #[serde(rename = "intent_description", default)]
    pub description: String,
    pub probability: f64,
}

/// A file or media reference attached to an utterance. Opaque to the
/// router; passed through to handlers unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<Value>,
}

/// Utterance body of an [`Envelope`].
///
/// `history` is only populated on dispatch to the clarifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<String>,
}

/// The single message structure every pipe in the router carries.
///
/// `intention` is set by the coordinator when dispatching to a worker;
/// `possible_intentions` when dispatching to the clarifier. `dialog_id`
/// and `user_id` are opaque strings the router never parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: EventType,
    pub dialog_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub intention: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_intentions: Vec<IntentScore>,
    #[serde(default)]
    pub messages: Payload,
}

impl Envelope {
    /// A bare envelope of the given type addressed to a dialog.
    pub fn new(event_type: EventType, dialog_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            event_type,
            dialog_id: dialog_id.into(),
            user_id: user_id.into(),
            message_id: String::new(),
            intention: String::new(),
            possible_intentions: Vec::new(),
            messages: Payload::default(),
        }
    }

    /// Decode from a JSON text blob.
    pub fn from_json_str(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode from JSON bytes.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode to a JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        let mut env = Envelope::new(EventType::UserIn, "d1", "u1");
        env.message_id = "m1".into();
        env.messages.content = "查看自动构建状态".into();
        env.messages.attachments.push(Attachment {
            kind: "file".into(),
            name: "build.log".into(),
            file_id: "f-9".into(),
            option: Some(json!({"lines": 40})),
        });
        env
    }

    #[test]
    fn envelope_roundtrip() {
        let env = sample();
        let encoded = env.to_json().unwrap();
        let decoded = Envelope::from_json_str(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn event_type_encodes_as_number() {
        let env = Envelope::new(EventType::Reply, "d", "u");
        let text = env.to_json().unwrap();
        assert!(text.contains("\"event_type\":2001"));
    }

    #[test]
    fn unknown_event_code_fails_decode() {
        let err = Envelope::from_json_str(r#"{"event_type":4242,"dialog_id":"d","user_id":"u"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn empty_optional_fields_are_omitted() {
        let env = Envelope::new(EventType::UserIn, "d", "u");
        let text = env.to_json().unwrap();
        assert!(!text.contains("message_id"));
        assert!(!text.contains("intention"));
        assert!(!text.contains("possible_intentions"));
        assert!(!text.contains("history"));
    }

    #[test]
    fn intent_score_uses_wire_field_names() {
        let score = IntentScore {
            name: "checkStatus".into(),
            description: "queries build status".into(),
            probability: 0.95,
        };
        let text = serde_json::to_string(&score).unwrap();
        assert!(text.contains("\"intent_name\":\"checkStatus\""));
        assert!(text.contains("\"intent_description\""));
    }

    #[test]
    fn clarifier_fields_roundtrip() {
        let mut env = sample();
        env.possible_intentions.push(IntentScore {
            name: "checkStatus".into(),
            description: String::new(),
            probability: 0.7,
        });
        env.messages.history = vec!["User: 帮我看看".into()];
        let decoded = Envelope::from_json_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn from_json_bytes_matches_str() {
        let env = sample();
        let text = env.to_json().unwrap();
        assert_eq!(
            Envelope::from_json_bytes(text.as_bytes()).unwrap(),
            Envelope::from_json_str(&text).unwrap()
        );
    }
}
