//! JSON hub protocol framing.
//!
//! Every message is a JSON object terminated by the record separator (0x1E).
//! A single transport frame may carry several records. The connection starts
//! with a handshake record in each direction before any typed message flows.

use serde::Deserialize;
use serde_json::{json, Value};

/// Record terminator
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub protocol spoken by this client
pub const PROTOCOL_NAME: &str = "json";

/// Hub protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum accepted frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Message type identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl TryFrom<u64> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, <Self as TryFrom<u64>>::Error> {
        match value {
            1 => Ok(MessageType::Invocation),
            2 => Ok(MessageType::StreamItem),
            3 => Ok(MessageType::Completion),
            4 => Ok(MessageType::StreamInvocation),
            5 => Ok(MessageType::CancelInvocation),
            6 => Ok(MessageType::Ping),
            7 => Ok(MessageType::Close),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Incomplete record: missing record separator")]
    IncompleteRecord,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// A decoded hub message
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Server-to-client method call; `target` is the event name as sent
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Ping,
    /// Server is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Well-formed but irrelevant to this client (streams, completions, cancels)
    Ignored(MessageType),
}

/// Server answer to the handshake request
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<u64>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    invocation_id: Option<String>,
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

/// Protocol codec for encoding/decoding hub records
pub struct HubProtocol;

impl HubProtocol {
    /// Handshake record the client sends first
    pub fn handshake_request() -> String {
        let body = json!({ "protocol": PROTOCOL_NAME, "version": PROTOCOL_VERSION });
        Self::terminate(body.to_string())
    }

    /// Split the handshake response off the first frame.
    ///
    /// Returns the response and whatever records followed it in the same
    /// frame.
    pub fn parse_handshake(frame: &str) -> Result<(HandshakeResponse, &str), ProtocolError> {
        let end = frame
            .find(RECORD_SEPARATOR)
            .ok_or(ProtocolError::IncompleteRecord)?;
        let response: HandshakeResponse = serde_json::from_str(&frame[..end])?;
        let rest = &frame[end + RECORD_SEPARATOR.len_utf8()..];
        Ok((response, rest))
    }

    /// Decode every record in a frame
    pub fn decode(frame: &str) -> Result<Vec<HubMessage>, ProtocolError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame.len(), MAX_FRAME_SIZE));
        }
        if frame.is_empty() {
            return Ok(Vec::new());
        }
        if !frame.ends_with(RECORD_SEPARATOR) {
            return Err(ProtocolError::IncompleteRecord);
        }

        frame
            .split_terminator(RECORD_SEPARATOR)
            .filter(|record| !record.trim().is_empty())
            .map(Self::decode_record)
            .collect()
    }

    /// Decode a single record (without its separator)
    pub fn decode_record(record: &str) -> Result<HubMessage, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(record)?;
        let kind = raw
            .kind
            .ok_or_else(|| ProtocolError::InvalidFormat("missing message type".to_string()))?;

        match MessageType::try_from(kind)? {
            MessageType::Invocation => {
                let target = raw.target.filter(|t| !t.is_empty()).ok_or_else(|| {
                    ProtocolError::InvalidFormat("invocation without target".to_string())
                })?;
                Ok(HubMessage::Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments,
                })
            }
            MessageType::Ping => Ok(HubMessage::Ping),
            MessageType::Close => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect,
            }),
            other => Ok(HubMessage::Ignored(other)),
        }
    }

    /// Encode a non-blocking invocation (no invocation id)
    pub fn encode_invocation(target: &str, arguments: &[Value]) -> String {
        let body = json!({
            "type": MessageType::Invocation as u8,
            "target": target,
            "arguments": arguments,
        });
        Self::terminate(body.to_string())
    }

    pub fn encode_ping() -> String {
        Self::terminate(json!({ "type": MessageType::Ping as u8 }).to_string())
    }

    pub fn encode_close(error: Option<&str>, allow_reconnect: bool) -> String {
        let mut body = json!({ "type": MessageType::Close as u8 });
        if let Some(error) = error {
            body["error"] = Value::from(error);
        }
        if allow_reconnect {
            body["allowReconnect"] = Value::Bool(true);
        }
        Self::terminate(body.to_string())
    }

    fn terminate(mut record: String) -> String {
        record.push(RECORD_SEPARATOR);
        record
    }
}

/// Canonical spelling of an event name: first character lowercased.
///
/// The server emits some events PascalCased (`CategoryCreated`); handlers are
/// keyed by the camelCase form so one handler covers both.
pub fn normalize_event_name(name: &str) -> String {
    let name = name.trim();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_request() {
        let request = HubProtocol::handshake_request();
        assert!(request.ends_with(RECORD_SEPARATOR));
        let body: Value = serde_json::from_str(request.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(body["protocol"], "json");
        assert_eq!(body["version"], 1);
    }

    #[test]
    fn test_parse_handshake_with_trailing_records() {
        let frame = "{}\u{1e}{\"type\":6}\u{1e}";
        let (response, rest) = HubProtocol::parse_handshake(frame).unwrap();
        assert_eq!(response.error, None);
        assert_eq!(HubProtocol::decode(rest).unwrap(), vec![HubMessage::Ping]);
    }

    #[test]
    fn test_parse_handshake_rejection() {
        let (response, rest) =
            HubProtocol::parse_handshake("{\"error\":\"Unauthorized\"}\u{1e}").unwrap();
        assert_eq!(response.error.as_deref(), Some("Unauthorized"));
        assert!(rest.is_empty());

        assert_eq!(
            HubProtocol::parse_handshake("{}"),
            Err(ProtocolError::IncompleteRecord)
        );
    }

    #[test]
    fn test_decode_multi_record_frame() {
        let frame = concat!(
            "{\"type\":1,\"target\":\"itemCreated\",\"arguments\":[{\"id\":1}]}\u{1e}",
            "{\"type\":6}\u{1e}",
            "{\"type\":3,\"invocationId\":\"7\"}\u{1e}",
        );
        let messages = HubProtocol::decode(frame).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0],
            HubMessage::Invocation {
                invocation_id: None,
                target: "itemCreated".to_string(),
                arguments: vec![json!({"id": 1})],
            }
        );
        assert_eq!(messages[1], HubMessage::Ping);
        assert_eq!(messages[2], HubMessage::Ignored(MessageType::Completion));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            HubProtocol::decode("{\"type\":99}\u{1e}"),
            Err(ProtocolError::UnknownMessageType(99))
        );
        assert_eq!(
            HubProtocol::decode("{\"type\":6}"),
            Err(ProtocolError::IncompleteRecord)
        );
        assert!(matches!(
            HubProtocol::decode("{\"type\":1}\u{1e}"),
            Err(ProtocolError::InvalidFormat(_))
        ));
        assert!(matches!(
            HubProtocol::decode("not json\u{1e}"),
            Err(ProtocolError::Serialization(_))
        ));
    }

    #[test]
    fn test_close_message() {
        let messages =
            HubProtocol::decode("{\"type\":7,\"error\":\"bye\",\"allowReconnect\":true}\u{1e}")
                .unwrap();
        assert_eq!(
            messages,
            vec![HubMessage::Close {
                error: Some("bye".to_string()),
                allow_reconnect: true,
            }]
        );

        // allowReconnect defaults to false
        let encoded = HubProtocol::encode_close(None, false);
        assert_eq!(
            HubProtocol::decode(&encoded).unwrap(),
            vec![HubMessage::Close {
                error: None,
                allow_reconnect: false,
            }]
        );
    }

    #[test]
    fn test_encode_invocation() {
        let encoded = HubProtocol::encode_invocation("itemCreated", &[json!({"id": 3})]);
        match HubProtocol::decode(&encoded).unwrap().pop() {
            Some(HubMessage::Invocation { target, arguments, .. }) => {
                assert_eq!(target, "itemCreated");
                assert_eq!(arguments, vec![json!({"id": 3})]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_normalize_event_name() {
        assert_eq!(normalize_event_name("CategoryCreated"), "categoryCreated");
        assert_eq!(normalize_event_name("categoryCreated"), "categoryCreated");
        assert_eq!(normalize_event_name("ItemLoopToggled"), "itemLoopToggled");
        assert_eq!(normalize_event_name(""), "");
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(1).unwrap(), MessageType::Invocation);
        assert_eq!(MessageType::try_from(7).unwrap(), MessageType::Close);
        assert!(MessageType::try_from(0).is_err());
    }
}
