//! Envelope model and the hub's JSON dialect.
//!
//! Every message exchanged with the hub is one JSON object. The `cmd` field
//! selects the kind; the handshake and its reply carry no `cmd` at all.

use crate::WireError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Heartbeat command
pub const CMD_HEARTBEAT: &str = "HTBM";
/// Application event command
pub const CMD_EVENT: &str = "EVNT";
/// Push notification command
pub const CMD_NOTIFICATION: &str = "NTFY";
/// Hub-initiated call command
pub const CMD_CALL: &str = "CALL";
/// Call result command
pub const CMD_RETURN: &str = "RETN";
/// Firmware update command
pub const CMD_FOTA: &str = "OTA";

/// Envelope kinds as understood by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Credentials sent right after the transport opens
    Hello,
    /// Hub reply to the handshake
    HelloAck,
    /// Liveness ping (outbound) or acknowledgment (inbound)
    Heartbeat,
    /// Application event
    Event,
    /// Push notification `{title, text}`
    Notification,
    /// Hub-initiated function call
    RpcCall,
    /// Result or error of a call
    RpcResult,
    /// Firmware update traffic
    Fota,
    /// Hub asks the device to drop the connection
    Terminate,
    /// Application dictionary passed through unchanged
    Raw,
}

impl EnvelopeKind {
    /// Hub `cmd` spelling, if the kind has one
    pub fn command(self) -> Option<&'static str> {
        match self {
            EnvelopeKind::Heartbeat => Some(CMD_HEARTBEAT),
            EnvelopeKind::Event => Some(CMD_EVENT),
            EnvelopeKind::Notification => Some(CMD_NOTIFICATION),
            EnvelopeKind::RpcCall => Some(CMD_CALL),
            EnvelopeKind::RpcResult => Some(CMD_RETURN),
            EnvelopeKind::Fota => Some(CMD_FOTA),
            EnvelopeKind::Hello
            | EnvelopeKind::HelloAck
            | EnvelopeKind::Terminate
            | EnvelopeKind::Raw => None,
        }
    }
}

/// Opaque call identifier, echoed back exactly as the hub sent it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Value);

impl CallId {
    /// Wrap an identifier received from the hub
    pub fn new(raw: Value) -> Self {
        Self(raw)
    }

    /// The identifier in its wire form
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(Value::String(id.to_string()))
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(Value::from(id))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

/// One discrete message unit exchanged with the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// What the message is
    pub kind: EnvelopeKind,
    /// Kind-specific body
    pub payload: Value,
    /// Correlation for calls and their results
    pub call_id: Option<CallId>,
}

impl Envelope {
    /// Create an envelope without correlation
    pub fn new(kind: EnvelopeKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            call_id: None,
        }
    }

    /// Handshake carrying credentials and device information
    pub fn hello(payload: Value) -> Self {
        Self::new(EnvelopeKind::Hello, payload)
    }

    /// Outbound liveness ping
    pub fn heartbeat() -> Self {
        Self::new(EnvelopeKind::Heartbeat, Value::Object(Map::new()))
    }

    /// Application event
    pub fn event(payload: Value) -> Self {
        Self::new(EnvelopeKind::Event, payload)
    }

    /// Push notification for connected apps
    pub fn notification(title: &str, text: &str) -> Self {
        Self::new(
            EnvelopeKind::Notification,
            json!({ "title": title, "text": text }),
        )
    }

    /// Application dictionary sent as-is
    pub fn raw(payload: Value) -> Self {
        Self::new(EnvelopeKind::Raw, payload)
    }

    /// Firmware update reply
    pub fn fota(payload: Value) -> Self {
        Self::new(EnvelopeKind::Fota, payload)
    }

    /// Hub-initiated call
    pub fn rpc_call(call_id: CallId, method: &str, args: Vec<Value>) -> Self {
        Self {
            kind: EnvelopeKind::RpcCall,
            payload: json!({ "method": method, "args": args }),
            call_id: Some(call_id),
        }
    }

    /// Result of a call: `{res}` on success, `{error}` on failure
    pub fn rpc_result(call_id: CallId, outcome: Result<Value, String>) -> Self {
        let payload = match outcome {
            Ok(res) => json!({ "res": res }),
            Err(error) => json!({ "error": error }),
        };
        Self {
            kind: EnvelopeKind::RpcResult,
            payload,
            call_id: Some(call_id),
        }
    }

    /// Look up a field of an object payload
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.as_object().and_then(|obj| obj.get(key))
    }

    /// Heartbeat interval override (`htbm`) carried by hub replies, in seconds
    pub fn interval_override(&self) -> Option<u64> {
        match self.kind {
            EnvelopeKind::Heartbeat | EnvelopeKind::HelloAck => self
                .field("htbm")
                .and_then(Value::as_u64)
                .filter(|secs| *secs > 0),
            _ => None,
        }
    }

    /// Render the envelope in the hub dialect
    pub fn to_wire(&self) -> Value {
        match self.kind {
            EnvelopeKind::Hello
            | EnvelopeKind::HelloAck
            | EnvelopeKind::Terminate
            | EnvelopeKind::Raw => self.payload.clone(),
            EnvelopeKind::Event | EnvelopeKind::Notification | EnvelopeKind::Fota => {
                let mut obj = Map::new();
                obj.insert("cmd".into(), Value::from(self.kind.command().unwrap_or_default()));
                obj.insert("payload".into(), self.payload.clone());
                Value::Object(obj)
            }
            EnvelopeKind::Heartbeat | EnvelopeKind::RpcCall | EnvelopeKind::RpcResult => {
                let mut obj = match &self.payload {
                    Value::Object(fields) => fields.clone(),
                    _ => Map::new(),
                };
                obj.insert("cmd".into(), Value::from(self.kind.command().unwrap_or_default()));
                if let Some(id) = &self.call_id {
                    obj.insert("id".into(), id.as_value().clone());
                }
                Value::Object(obj)
            }
        }
    }

    /// Classify an object received from the hub
    pub fn from_wire(value: Value) -> Result<Self, WireError> {
        let Value::Object(mut obj) = value else {
            return Err(WireError::Malformed("expected a JSON object".into()));
        };

        let cmd = match obj.get("cmd") {
            Some(Value::String(cmd)) => Some(cmd.clone()),
            _ => None,
        };

        let Some(cmd) = cmd else {
            let kind = if obj.contains_key("terminate") {
                EnvelopeKind::Terminate
            } else if obj.contains_key("uid") && obj.contains_key("token") {
                EnvelopeKind::Hello
            } else if ["err", "ts", "htbm"].iter().any(|k| obj.contains_key(*k)) {
                EnvelopeKind::HelloAck
            } else {
                EnvelopeKind::Raw
            };
            return Ok(Self::new(kind, Value::Object(obj)));
        };

        let envelope = match cmd.as_str() {
            CMD_HEARTBEAT => {
                obj.remove("cmd");
                Self::new(EnvelopeKind::Heartbeat, Value::Object(obj))
            }
            CMD_EVENT => Self::new(
                EnvelopeKind::Event,
                obj.remove("payload").unwrap_or(Value::Null),
            ),
            CMD_NOTIFICATION => Self::new(
                EnvelopeKind::Notification,
                obj.remove("payload").unwrap_or(Value::Null),
            ),
            CMD_CALL | CMD_RETURN => {
                let id = obj.remove("id").ok_or(WireError::MissingField("id"))?;
                obj.remove("cmd");
                let kind = if cmd == CMD_CALL {
                    if !obj.get("method").is_some_and(Value::is_string) {
                        return Err(WireError::MissingField("method"));
                    }
                    EnvelopeKind::RpcCall
                } else {
                    EnvelopeKind::RpcResult
                };
                Self {
                    kind,
                    payload: Value::Object(obj),
                    call_id: Some(CallId::new(id)),
                }
            }
            CMD_FOTA => {
                obj.remove("cmd");
                // Device-originated replies wrap their fields; hub directives do not.
                let payload = if obj.len() == 1 && obj.contains_key("payload") {
                    obj.remove("payload").unwrap_or(Value::Null)
                } else {
                    Value::Object(obj)
                };
                Self::new(EnvelopeKind::Fota, payload)
            }
            _ => Self::new(EnvelopeKind::Raw, Value::Object(obj)),
        };

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let env = Envelope::event(json!({"my_button": "pressed"}));
        assert_eq!(
            env.to_wire(),
            json!({"cmd": "EVNT", "payload": {"my_button": "pressed"}})
        );
    }

    #[test]
    fn test_notification_wire_shape() {
        let env = Envelope::notification("BUTTON!", "PRESSED!");
        assert_eq!(
            env.to_wire(),
            json!({"cmd": "NTFY", "payload": {"title": "BUTTON!", "text": "PRESSED!"}})
        );
    }

    #[test]
    fn test_rpc_result_preserves_numeric_id() {
        let env = Envelope::rpc_result(CallId::from(7), Ok(json!(42)));
        assert_eq!(env.to_wire(), json!({"cmd": "RETN", "id": 7, "res": 42}));

        let env = Envelope::rpc_result(CallId::from("1"), Err("not found".into()));
        assert_eq!(
            env.to_wire(),
            json!({"cmd": "RETN", "id": "1", "error": "not found"})
        );
    }

    #[test]
    fn test_classify_call() {
        let env = Envelope::from_wire(json!({
            "cmd": "CALL", "id": "1", "method": "double", "args": [21]
        }))
        .unwrap();
        assert_eq!(env.kind, EnvelopeKind::RpcCall);
        assert_eq!(env.call_id, Some(CallId::from("1")));
        assert_eq!(env.field("method"), Some(&json!("double")));
    }

    #[test]
    fn test_call_without_id_is_rejected() {
        let err = Envelope::from_wire(json!({"cmd": "CALL", "method": "x"})).unwrap_err();
        assert!(matches!(err, WireError::MissingField("id")));
    }

    #[test]
    fn test_classify_handshake_reply_and_terminate() {
        let ack = Envelope::from_wire(json!({"ts": 1000, "htbm": 30})).unwrap();
        assert_eq!(ack.kind, EnvelopeKind::HelloAck);
        assert_eq!(ack.interval_override(), Some(30));

        let term = Envelope::from_wire(json!({"terminate": true})).unwrap();
        assert_eq!(term.kind, EnvelopeKind::Terminate);
    }

    #[test]
    fn test_heartbeat_override() {
        let hb = Envelope::from_wire(json!({"cmd": "HTBM", "htbm": 2})).unwrap();
        assert_eq!(hb.kind, EnvelopeKind::Heartbeat);
        assert_eq!(hb.interval_override(), Some(2));

        let plain = Envelope::from_wire(json!({"cmd": "HTBM"})).unwrap();
        assert_eq!(plain.interval_override(), None);
        assert_eq!(Envelope::heartbeat().to_wire(), json!({"cmd": "HTBM"}));
    }

    #[test]
    fn test_fota_directive_keeps_top_level_fields() {
        let env = Envelope::from_wire(json!({"cmd": "OTA", "bin": "AA==", "t": "b"})).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Fota);
        assert_eq!(env.field("t"), Some(&json!("b")));
    }

    #[test]
    fn test_unknown_cmd_is_raw() {
        let env = Envelope::from_wire(json!({"cmd": "WHAT", "x": 1})).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Raw);
        assert_eq!(env.field("cmd"), Some(&json!("WHAT")));
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert!(matches!(
            Envelope::from_wire(json!([1, 2, 3])),
            Err(WireError::Malformed(_))
        ));
    }
}
