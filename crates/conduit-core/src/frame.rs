//! JSON-RPC frame model exchanged over every Conduit connection.
//!
//! Frames travel as JSON text messages. A frame is a request (`id` and
//! `method`), a notification (`method` only) or a response (`id` plus
//! `result` or `error`). Agents additionally send out-of-band control
//! messages tagged with a `_control` member.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::FrameError;

/// Protocol version stamped on frames that do not carry one.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Member that marks an agent control message.
pub const CONTROL_KEY: &str = "_control";

/// Control type announcing the managed endpoint's capability schema.
pub const CONTROL_DISCOVER: &str = "discover";

/// One request, notification or response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "jsonrpc", default)]
    pub protocol_version: String,

    /// Correlation id. A JSON `null` id is treated as absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Value>,

    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,

    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<Value>,
}

/// Keeps an explicit `null` as `Some(Value::Null)`; only a missing member is `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Shape of a well-formed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Notification,
    Response,
}

impl Frame {
    /// Build a request frame with the given id.
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            ..Default::default()
        }
    }

    /// Build a notification frame.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            method: Some(method.into()),
            params: Some(params),
            ..Default::default()
        }
    }

    /// Build a successful response frame.
    pub fn response(id: impl Into<Value>, result: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            id: Some(id.into()),
            result: Some(result),
            ..Default::default()
        }
    }

    /// Build an error response frame.
    pub fn error_response(id: impl Into<Value>, code: i64, message: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            id: Some(id.into()),
            error: Some(serde_json::json!({ "code": code, "message": message })),
            ..Default::default()
        }
    }

    /// Classify the frame, rejecting shapes that match none of the three kinds.
    pub fn kind(&self) -> Result<FrameKind, FrameError> {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => Ok(FrameKind::Request),
            (None, Some(_)) => Ok(FrameKind::Notification),
            (Some(_), None) if self.result.is_some() || self.error.is_some() => {
                Ok(FrameKind::Response)
            }
            _ => Err(FrameError::Malformed),
        }
    }

    /// Correlation key of this frame's id, if it has one.
    pub fn correlation_key(&self) -> Option<String> {
        self.id.as_ref().map(correlation_key)
    }
}

/// Canonical JSON text of an id. The string `"42"` and the number `42` map
/// to different keys.
pub fn correlation_key(id: &Value) -> String {
    id.to_string()
}

/// Out-of-band message sent by an agent to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Capability discovery result. `schema` is `None` when the member is missing.
    Discover { schema: Option<Value> },
    /// A control type this build does not understand.
    Unknown(String),
}

impl ControlMessage {
    fn from_object(kind: &Value, object: &mut Map<String, Value>) -> Result<Self, FrameError> {
        let kind = kind.as_str().ok_or(FrameError::InvalidControl)?;
        match kind {
            CONTROL_DISCOVER => Ok(Self::Discover {
                schema: object.remove("schema"),
            }),
            other => Ok(Self::Unknown(other.to_string())),
        }
    }

    /// Encode a discovery announcement carrying `schema`.
    pub fn encode_discover(schema: &Value) -> String {
        serde_json::json!({ CONTROL_KEY: CONTROL_DISCOVER, "schema": schema }).to_string()
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlMessage),
    Frame(Frame),
}

/// Decode one text message. Control messages take priority over frames.
pub fn decode(text: &str) -> Result<Inbound, FrameError> {
    let mut object: Map<String, Value> = serde_json::from_str(text)?;
    if let Some(kind) = object.remove(CONTROL_KEY) {
        return ControlMessage::from_object(&kind, &mut object).map(Inbound::Control);
    }
    let frame: Frame = serde_json::from_value(Value::Object(object))?;
    Ok(Inbound::Frame(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(text: &str) -> Frame {
        match decode(text).unwrap() {
            Inbound::Frame(f) => f,
            Inbound::Control(c) => panic!("unexpected control message {c:?}"),
        }
    }

    #[test]
    fn classifies_request_notification_response() {
        let req = frame(r#"{"jsonrpc":"2.0","id":1,"method":"players.list"}"#);
        assert_eq!(req.kind().unwrap(), FrameKind::Request);

        let note = frame(r#"{"jsonrpc":"2.0","method":"players.joined","params":{}}"#);
        assert_eq!(note.kind().unwrap(), FrameKind::Notification);

        let resp = frame(r#"{"jsonrpc":"2.0","id":"a","result":[]}"#);
        assert_eq!(resp.kind().unwrap(), FrameKind::Response);

        let err = frame(r#"{"jsonrpc":"2.0","id":"a","error":{"code":-1,"message":"x"}}"#);
        assert_eq!(err.kind().unwrap(), FrameKind::Response);
    }

    #[test]
    fn null_result_still_counts_as_response() {
        let resp = frame(r#"{"jsonrpc":"2.0","id":7,"result":null}"#);
        assert_eq!(resp.result, Some(Value::Null));
        assert_eq!(resp.kind().unwrap(), FrameKind::Response);
    }

    #[test]
    fn rejects_shapeless_frames() {
        let only_id = frame(r#"{"jsonrpc":"2.0","id":3}"#);
        assert!(matches!(only_id.kind(), Err(FrameError::Malformed)));

        let empty = frame(r#"{"jsonrpc":"2.0"}"#);
        assert!(matches!(empty.kind(), Err(FrameError::Malformed)));

        let null_id = frame(r#"{"jsonrpc":"2.0","id":null,"result":1}"#);
        assert!(null_id.id.is_none());
        assert!(matches!(null_id.kind(), Err(FrameError::Malformed)));
    }

    #[test]
    fn undecodable_text_is_an_error() {
        assert!(matches!(decode("not json"), Err(FrameError::Json(_))));
        assert!(matches!(decode("[1,2,3]"), Err(FrameError::Json(_))));
    }

    #[test]
    fn decodes_control_messages() {
        let msg = decode(r#"{"_control":"discover","schema":{"methods":[]}}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Control(ControlMessage::Discover {
                schema: Some(json!({"methods": []}))
            })
        );

        let unknown = decode(r#"{"_control":"reboot"}"#).unwrap();
        assert_eq!(
            unknown,
            Inbound::Control(ControlMessage::Unknown("reboot".into()))
        );

        assert!(matches!(
            decode(r#"{"_control":5}"#),
            Err(FrameError::InvalidControl)
        ));
    }

    #[test]
    fn encode_discover_is_decodable() {
        let text = ControlMessage::encode_discover(&json!({"v": 1}));
        assert_eq!(
            decode(&text).unwrap(),
            Inbound::Control(ControlMessage::Discover {
                schema: Some(json!({"v": 1}))
            })
        );
    }

    #[test]
    fn string_and_numeric_ids_are_distinct_keys() {
        assert_eq!(correlation_key(&json!("42")), "\"42\"");
        assert_eq!(correlation_key(&json!(42)), "42");
        assert_ne!(correlation_key(&json!("42")), correlation_key(&json!(42)));
    }

    #[test]
    fn serialization_omits_absent_members() {
        let text = serde_json::to_string(&Frame::notification("tick", json!([]))).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","method":"tick","params":[]}"#);
    }
}
