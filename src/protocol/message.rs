//! Protocol messages: a tagged sum keyed on the numeric `type` code, with
//! one payload record per message family. Encoding flattens the header and
//! the family payload into a single JSON object; decoding dispatches on the
//! code and is total.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ot::OpKind;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown message type code {0}")]
    UnknownType(u16),

    #[error("message body does not belong to type code {code}")]
    BodyMismatch { code: u16 },
}

macro_rules! message_types {
    ($($variant:ident = $code:literal => $family:ident),+ $(,)?) => {
        /// Every recognised frame type, by numeric wire code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant,)+
        }

        impl MessageType {
            pub fn code(self) -> u16 {
                match self {
                    $(MessageType::$variant => $code,)+
                }
            }

            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(MessageType::$variant),)+
                    _ => None,
                }
            }

            pub fn family(self) -> Family {
                match self {
                    $(MessageType::$variant => Family::$family,)+
                }
            }
        }
    };
}

message_types! {
    AuthLogin = 100 => Auth,
    AuthLogout = 101 => Auth,
    AuthRegister = 102 => Auth,
    AuthSuccess = 103 => Auth,
    AuthFailure = 104 => Auth,

    DocCreate = 200 => Document,
    DocOpen = 201 => Document,
    DocClose = 202 => Document,
    DocList = 203 => Document,
    DocInfo = 204 => Document,
    DocDelete = 205 => Document,
    DocRename = 206 => Document,
    DocResponse = 207 => Document,

    EditInsert = 300 => Edit,
    EditDelete = 301 => Edit,
    EditReplace = 302 => Edit,
    EditApply = 303 => Edit,
    EditReject = 304 => Edit,

    SyncRequest = 400 => Sync,
    SyncResponse = 401 => Sync,
    SyncState = 402 => Sync,
    SyncAck = 403 => Sync,

    PresenceJoin = 500 => Presence,
    PresenceLeave = 501 => Presence,
    PresenceCursor = 502 => Presence,
    PresenceSelection = 503 => Presence,
    PresenceUpdate = 504 => Presence,

    SysError = 900 => System,
    SysInfo = 901 => System,
    SysHeartbeat = 902 => System,
    SysDisconnect = 903 => System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Auth,
    Document,
    Edit,
    Sync,
    Presence,
    System,
}

/// Fields every frame carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocPayload {
    #[serde(default)]
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub document_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPayload {
    #[serde(default)]
    pub document_id: String,
    /// Base revision the edit was made against; the new revision on acks
    /// and broadcasts.
    #[serde(default)]
    pub document_version: u64,
    #[serde(default)]
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Canonical operation record on broadcasts; transformed composites do
    /// not fit the positional shorthand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OpKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_version: Option<u64>,
    /// Canonicalised operation records, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Auth(AuthPayload),
    Document(DocPayload),
    Edit(EditPayload),
    Sync(SyncPayload),
    Presence(PresencePayload),
    System(SystemPayload),
}

impl Body {
    fn family(&self) -> Family {
        match self {
            Body::Auth(_) => Family::Auth,
            Body::Document(_) => Family::Document,
            Body::Edit(_) => Family::Edit,
            Body::Sync(_) => Family::Sync,
            Body::Presence(_) => Family::Presence,
            Body::System(_) => Family::System,
        }
    }

    fn to_object(&self) -> Result<serde_json::Map<String, Value>, ProtocolError> {
        let value = match self {
            Body::Auth(p) => serde_json::to_value(p),
            Body::Document(p) => serde_json::to_value(p),
            Body::Edit(p) => serde_json::to_value(p),
            Body::Sync(p) => serde_json::to_value(p),
            Body::Presence(p) => serde_json::to_value(p),
            Body::System(p) => serde_json::to_value(p),
        }
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ProtocolError::Malformed("payload is not an object".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    pub header: Header,
    pub body: Body,
}

impl Message {
    pub fn new(kind: MessageType, header: Header, body: Body) -> Self {
        Self { kind, header, body }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        if self.kind.family() != self.body.family() {
            return Err(ProtocolError::BodyMismatch {
                code: self.kind.code(),
            });
        }
        let header = serde_json::to_value(&self.header)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(mut map) = header else {
            return Err(ProtocolError::Malformed("header is not an object".into()));
        };
        map.insert("type".into(), Value::from(self.kind.code()));
        for (key, value) in self.body.to_object()? {
            map.insert(key, value);
        }
        serde_json::to_string(&Value::Object(map))
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Message, ProtocolError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let code = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::Malformed("missing numeric 'type' field".into()))?;
        let code = u16::try_from(code).map_err(|_| ProtocolError::Malformed("type code out of range".into()))?;
        let kind =
            MessageType::from_code(code).ok_or(ProtocolError::UnknownType(code))?;

        let header: Header = serde_json::from_value(value.clone())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let malformed = |e: serde_json::Error| ProtocolError::Malformed(e.to_string());
        let body = match kind.family() {
            Family::Auth => Body::Auth(serde_json::from_value(value).map_err(malformed)?),
            Family::Document => Body::Document(serde_json::from_value(value).map_err(malformed)?),
            Family::Edit => Body::Edit(serde_json::from_value(value).map_err(malformed)?),
            Family::Sync => Body::Sync(serde_json::from_value(value).map_err(malformed)?),
            Family::Presence => Body::Presence(serde_json::from_value(value).map_err(malformed)?),
            Family::System => Body::System(serde_json::from_value(value).map_err(malformed)?),
        };

        Ok(Message { kind, header, body })
    }

    pub fn auth(&self) -> Option<&AuthPayload> {
        match &self.body {
            Body::Auth(p) => Some(p),
            _ => None,
        }
    }

    pub fn edit(&self) -> Option<&EditPayload> {
        match &self.body {
            Body::Edit(p) => Some(p),
            _ => None,
        }
    }

    pub fn document(&self) -> Option<&DocPayload> {
        match &self.body {
            Body::Document(p) => Some(p),
            _ => None,
        }
    }

    pub fn sync(&self) -> Option<&SyncPayload> {
        match &self.body {
            Body::Sync(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            client_id: "client-1".into(),
            session_id: "session-1".into(),
            sequence_number: 7,
            timestamp: 1234,
        }
    }

    #[test]
    fn edit_frame_round_trip() {
        let message = Message::new(
            MessageType::EditInsert,
            header(),
            Body::Edit(EditPayload {
                document_id: "doc-1".into(),
                document_version: 3,
                operation_id: "alice#9".into(),
                position: Some(4),
                text: Some("hi".into()),
                ..Default::default()
            }),
        );
        let raw = message.encode().unwrap();
        assert_eq!(Message::decode(&raw).unwrap(), message);
    }

    #[test]
    fn encoded_frame_carries_required_fields() {
        let raw = Message::new(
            MessageType::SysHeartbeat,
            header(),
            Body::System(SystemPayload::default()),
        )
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], 902);
        assert_eq!(value["clientId"], "client-1");
        assert_eq!(value["sessionId"], "session-1");
        assert_eq!(value["sequenceNumber"], 7);
        assert_eq!(value["timestamp"], 1234);
    }

    #[test]
    fn decodes_every_family() {
        let cases = [
            (100, "{\"type\":100,\"username\":\"alice\"}"),
            (201, "{\"type\":201,\"documentId\":\"d\"}"),
            (301, "{\"type\":301,\"documentId\":\"d\",\"documentVersion\":2,\"operationId\":\"a#1\",\"position\":0,\"length\":3}"),
            (400, "{\"type\":400,\"documentId\":\"d\",\"fromVersion\":1}"),
            (502, "{\"type\":502,\"documentId\":\"d\",\"username\":\"alice\",\"cursorPosition\":5}"),
            (903, "{\"type\":903,\"message\":\"idle timeout\"}"),
        ];
        for (code, raw) in cases {
            let message = Message::decode(raw).unwrap();
            assert_eq!(message.kind.code(), code);
        }
    }

    #[test]
    fn broadcast_edit_carries_a_full_operation_record() {
        let message = Message::new(
            MessageType::EditApply,
            Header::default(),
            Body::Edit(EditPayload {
                document_id: "doc".into(),
                document_version: 5,
                operation_id: "bob#2".into(),
                operation: Some(OpKind::composite(vec![
                    OpKind::delete(0, 2),
                    OpKind::insert(0, "yo"),
                ])),
                ..Default::default()
            }),
        );
        let raw = message.encode().unwrap();
        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(decoded.edit().unwrap().operation, message.edit().unwrap().operation);
    }

    #[test]
    fn unknown_and_missing_type_codes_are_rejected() {
        assert!(matches!(
            Message::decode("{\"type\":777}").unwrap_err(),
            ProtocolError::UnknownType(777)
        ));
        assert!(matches!(
            Message::decode("{\"clientId\":\"x\"}").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
        assert!(matches!(
            Message::decode("no json").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn mismatched_body_family_fails_to_encode() {
        let message = Message::new(
            MessageType::AuthLogin,
            Header::default(),
            Body::System(SystemPayload::default()),
        );
        assert!(matches!(
            message.encode().unwrap_err(),
            ProtocolError::BodyMismatch { code: 100 }
        ));
    }

    #[test]
    fn unknown_extra_fields_are_tolerated() {
        let raw = "{\"type\":100,\"username\":\"alice\",\"password\":\"ignored\",\"metadata\":{}}";
        let message = Message::decode(raw).unwrap();
        assert_eq!(message.auth().unwrap().username, "alice");
    }
}
