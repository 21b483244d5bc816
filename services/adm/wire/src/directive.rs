//! Typed views over envelopes whose payload carries protocol fields.

use crate::envelope::{CallId, Envelope, EnvelopeKind};
use crate::WireError;
use base64::Engine;
use serde_json::{json, Map, Value};

/// Device identity and capabilities sent in the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Device UID
    pub uid: String,
    /// Device token
    pub token: String,
    /// Platform name reported to the hub
    pub platform: Option<String>,
    /// Runtime identifier reported to the hub
    pub vm_uid: Option<String>,
    /// Requested heartbeat interval in seconds
    pub heartbeat: u64,
    /// Running firmware record, when updates are supported
    pub fota: Option<FotaRecord>,
    /// Whether the device can be updated at all
    pub fota_capable: bool,
}

impl Hello {
    /// Build the handshake envelope
    pub fn into_envelope(self) -> Envelope {
        let mut obj = Map::new();
        obj.insert("uid".into(), Value::from(self.uid));
        obj.insert("token".into(), Value::from(self.token));
        obj.insert("platform".into(), self.platform.map_or(Value::Null, Value::from));
        obj.insert("vmuid".into(), self.vm_uid.map_or(Value::Null, Value::from));
        // The hub reads the interval under this spelling.
        obj.insert("hearbeat".into(), Value::from(self.heartbeat));
        obj.insert("ota".into(), Value::from(self.fota_capable));
        if let Some(record) = self.fota.filter(|r| r.valid) {
            obj.insert("bc".into(), Value::from(record.bc_slot));
            obj.insert("vm".into(), Value::from(record.vm_slot));
            obj.insert("chunk".into(), Value::from(record.chunk));
        }
        Envelope::hello(Value::Object(obj))
    }
}

/// Summary of the firmware currently running on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FotaRecord {
    /// Whether the running runtime is a valid, accepted image
    pub valid: bool,
    /// Bytecode slot in use
    pub bc_slot: u32,
    /// VM slot in use
    pub vm_slot: u32,
    /// Preferred transfer block size
    pub chunk: u32,
}

/// Hub reply to the handshake
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HelloAck {
    /// Rejection reason
    pub error: Option<String>,
    /// Hub timestamp
    pub hub_time: Option<u64>,
    /// Heartbeat interval imposed by the hub, in seconds
    pub heartbeat: Option<u64>,
}

impl TryFrom<&Envelope> for HelloAck {
    type Error = WireError;

    fn try_from(env: &Envelope) -> Result<Self, Self::Error> {
        // Any object without a `cmd` answers the login; every field is optional.
        let cmdless_raw = env.kind == EnvelopeKind::Raw && env.field("cmd").is_none();
        if env.kind != EnvelopeKind::HelloAck && !cmdless_raw {
            return Err(WireError::Malformed(format!(
                "expected handshake reply, got {:?}",
                env.kind
            )));
        }
        Ok(Self {
            error: env.field("err").map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            hub_time: env.field("ts").and_then(Value::as_u64),
            heartbeat: env
                .field("htbm")
                .and_then(Value::as_u64)
                .filter(|secs| *secs > 0),
        })
    }
}

/// Hub-initiated call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    /// Correlation identifier
    pub call_id: CallId,
    /// Function name
    pub method: String,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Whether the hub waits for the result
    pub want_reply: bool,
}

impl TryFrom<&Envelope> for RpcCall {
    type Error = WireError;

    fn try_from(env: &Envelope) -> Result<Self, Self::Error> {
        if env.kind != EnvelopeKind::RpcCall {
            return Err(WireError::Malformed(format!(
                "expected call, got {:?}",
                env.kind
            )));
        }
        let call_id = env.call_id.clone().ok_or(WireError::MissingField("id"))?;
        let method = env
            .field("method")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingField("method"))?
            .to_string();
        let args = match env.field("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(single) => vec![single.clone()],
        };
        let want_reply = match env.field("ret") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(ret)) => *ret,
            Some(Value::Number(ret)) => ret.as_f64().map_or(true, |n| n != 0.0),
            Some(_) => true,
        };
        Ok(Self {
            call_id,
            method,
            args,
            want_reply,
        })
    }
}

/// Firmware image kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Image {
    /// Application bytecode
    Bytecode,
    /// Virtual machine
    Vm,
}

impl Image {
    /// Single-letter tag used on the wire
    pub fn tag(self) -> &'static str {
        match self {
            Image::Bytecode => "b",
            Image::Vm => "v",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "b" => Some(Image::Bytecode),
            "v" => Some(Image::Vm),
            _ => None,
        }
    }
}

/// Parameters of an update offered by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FotaOffer {
    /// Transfer block size
    pub chunk: u32,
    /// Bytecode image size
    pub bc_size: u64,
    /// VM image size; zero for bytecode-only updates
    pub vm_size: u64,
    /// Target bytecode slot
    pub bc_slot: u32,
    /// Target VM slot
    pub vm_slot: u32,
}

/// Firmware update directive received from the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FotaDirective {
    /// Begin an update
    Start(FotaOffer),
    /// One block of image data
    Block {
        /// Image the block belongs to
        image: Image,
        /// Decoded block bytes
        data: Vec<u8>,
    },
    /// Expected checksum of a completed image
    Checksum {
        /// Image the checksum covers
        image: Image,
        /// Expected digest bytes
        crc: Vec<u8>,
    },
    /// Hub asks whether the device runs the given slots
    Confirm {
        /// Expected bytecode slot
        bc_slot: u32,
        /// Expected VM slot
        vm_slot: u32,
    },
    /// Cancel the running update
    Abort,
}

impl TryFrom<&Envelope> for FotaDirective {
    type Error = WireError;

    fn try_from(env: &Envelope) -> Result<Self, Self::Error> {
        if env.kind != EnvelopeKind::Fota {
            return Err(WireError::Malformed(format!(
                "expected update directive, got {:?}",
                env.kind
            )));
        }

        if env.field("abort").is_some() {
            return Ok(FotaDirective::Abort);
        }

        if env.field("chunk").is_some() {
            return Ok(FotaDirective::Start(FotaOffer {
                chunk: require_u32(env, "chunk")?,
                bc_size: require_u64(env, "bcsize")?,
                vm_size: env
                    .field("vmsize")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    .max(0) as u64,
                bc_slot: require_u32(env, "bc")?,
                vm_slot: require_u32(env, "vm")?,
            }));
        }

        if let Some(bin) = env.field("bin") {
            let data = bin
                .as_str()
                .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
                .ok_or(WireError::MissingField("bin"))?;
            return Ok(FotaDirective::Block {
                image: require_image(env)?,
                data,
            });
        }

        if let Some(crc) = env.field("crc") {
            let crc = crc
                .as_str()
                .and_then(|digest| hex::decode(digest).ok())
                .ok_or(WireError::MissingField("crc"))?;
            return Ok(FotaDirective::Checksum {
                image: require_image(env)?,
                crc,
            });
        }

        if env.field("ok").is_some() {
            return Ok(FotaDirective::Confirm {
                bc_slot: require_u32(env, "bc")?,
                vm_slot: require_u32(env, "vm")?,
            });
        }

        Err(WireError::Malformed("unknown update directive".into()))
    }
}

/// Replies the device sends during an update
pub struct FotaReply;

impl FotaReply {
    /// Ask for block `index` of `image`
    pub fn request_block(image: Image, index: u32) -> Envelope {
        Envelope::fota(json!({ "b": index, "t": image.tag() }))
    }

    /// Ask for the checksum of `image`
    pub fn request_checksum(image: Image) -> Envelope {
        Envelope::fota(json!({ "c": 0, "t": image.tag() }))
    }

    /// Report a failed or refused update
    pub fn failure(reason: &str) -> Envelope {
        Envelope::fota(json!({ "ko": 1, "reason": reason }))
    }

    /// Confirm the device runs the expected slots
    pub fn confirmed() -> Envelope {
        Envelope::fota(json!({ "ok": 1 }))
    }
}

fn require_u64(env: &Envelope, key: &'static str) -> Result<u64, WireError> {
    env.field(key)
        .and_then(Value::as_u64)
        .ok_or(WireError::MissingField(key))
}

fn require_image(env: &Envelope) -> Result<Image, WireError> {
    env.field("t")
        .and_then(Value::as_str)
        .and_then(Image::from_tag)
        .ok_or(WireError::MissingField("t"))
}

fn require_u32(env: &Envelope, key: &'static str) -> Result<u32, WireError> {
    u32::try_from(require_u64(env, key)?).map_err(|_| WireError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fota_env(value: Value) -> Envelope {
        let mut value = value;
        value["cmd"] = json!("OTA");
        Envelope::from_wire(value).unwrap()
    }

    #[test]
    fn test_hello_shape() {
        let hello = Hello {
            uid: "dev-1".into(),
            token: "secret".into(),
            platform: Some("linux".into()),
            vm_uid: None,
            heartbeat: 60,
            fota: Some(FotaRecord {
                valid: true,
                bc_slot: 0,
                vm_slot: 1,
                chunk: 512,
            }),
            fota_capable: true,
        }
        .into_envelope();

        let wire = hello.to_wire();
        assert_eq!(wire["uid"], json!("dev-1"));
        assert_eq!(wire["hearbeat"], json!(60));
        assert_eq!(wire["ota"], json!(true));
        assert_eq!(wire["chunk"], json!(512));
        assert!(wire.get("cmd").is_none());
    }

    #[test]
    fn test_hello_ack_rejection() {
        let env = Envelope::from_wire(json!({"err": "bad token"})).unwrap();
        let ack = HelloAck::try_from(&env).unwrap();
        assert_eq!(ack.error.as_deref(), Some("bad token"));
    }

    #[test]
    fn test_hello_ack_fields_optional() {
        let env = Envelope::from_wire(json!({})).unwrap();
        assert_eq!(HelloAck::try_from(&env).unwrap(), HelloAck::default());

        let unknown_cmd = Envelope::from_wire(json!({"cmd": "WHAT"})).unwrap();
        assert!(HelloAck::try_from(&unknown_cmd).is_err());

        let event = Envelope::from_wire(json!({"cmd": "EVNT", "payload": {}})).unwrap();
        assert!(HelloAck::try_from(&event).is_err());
    }

    #[test]
    fn test_call_defaults() {
        let env = Envelope::from_wire(json!({"cmd": "CALL", "id": 3, "method": "ping"})).unwrap();
        let call = RpcCall::try_from(&env).unwrap();
        assert!(call.args.is_empty());
        assert!(call.want_reply);
        assert_eq!(call.call_id, CallId::from(3));

        let env = Envelope::from_wire(
            json!({"cmd": "CALL", "id": 4, "method": "ping", "args": [1, 2], "ret": false}),
        )
        .unwrap();
        let call = RpcCall::try_from(&env).unwrap();
        assert_eq!(call.args, vec![json!(1), json!(2)]);
        assert!(!call.want_reply);

        let env = Envelope::from_wire(json!({"cmd": "CALL", "id": 5, "method": "ping", "ret": 0}))
            .unwrap();
        assert!(!RpcCall::try_from(&env).unwrap().want_reply);

        let env = Envelope::from_wire(json!({"cmd": "CALL", "id": 6, "method": "ping", "ret": 1}))
            .unwrap();
        assert!(RpcCall::try_from(&env).unwrap().want_reply);
    }

    #[test]
    fn test_fota_directives() {
        let start = fota_env(json!({"chunk": 256, "bcsize": 1024, "vmsize": 0, "bc": 1, "vm": 0}));
        assert_eq!(
            FotaDirective::try_from(&start).unwrap(),
            FotaDirective::Start(FotaOffer {
                chunk: 256,
                bc_size: 1024,
                vm_size: 0,
                bc_slot: 1,
                vm_slot: 0,
            })
        );

        let block = fota_env(json!({"bin": "AQID", "t": "b"}));
        assert_eq!(
            FotaDirective::try_from(&block).unwrap(),
            FotaDirective::Block {
                image: Image::Bytecode,
                data: vec![1, 2, 3],
            }
        );

        let crc = fota_env(json!({"crc": "0a0B", "t": "v"}));
        assert_eq!(
            FotaDirective::try_from(&crc).unwrap(),
            FotaDirective::Checksum {
                image: Image::Vm,
                crc: vec![0x0a, 0x0b],
            }
        );

        let abort = fota_env(json!({"abort": 1}));
        assert_eq!(FotaDirective::try_from(&abort).unwrap(), FotaDirective::Abort);
    }

    #[test]
    fn test_fota_bad_fields() {
        let bad_image = fota_env(json!({"bin": "AQID", "t": "x"}));
        assert!(matches!(
            FotaDirective::try_from(&bad_image),
            Err(WireError::MissingField("t"))
        ));

        let bad_hex = fota_env(json!({"crc": "zz", "t": "b"}));
        assert!(matches!(
            FotaDirective::try_from(&bad_hex),
            Err(WireError::MissingField("crc"))
        ));

        let odd_hex = fota_env(json!({"crc": "abc", "t": "b"}));
        assert!(matches!(
            FotaDirective::try_from(&odd_hex),
            Err(WireError::MissingField("crc"))
        ));

        let huge_chunk = fota_env(
            json!({"chunk": 4_294_967_296u64, "bcsize": 1024, "vmsize": 0, "bc": 1, "vm": 0}),
        );
        assert!(matches!(
            FotaDirective::try_from(&huge_chunk),
            Err(WireError::MissingField("chunk"))
        ));

        let huge_slot = fota_env(json!({"ok": 1, "bc": 4_294_967_297u64, "vm": 0}));
        assert!(matches!(
            FotaDirective::try_from(&huge_slot),
            Err(WireError::MissingField("bc"))
        ));
    }

    #[test]
    fn test_replies() {
        assert_eq!(
            FotaReply::request_block(Image::Vm, 3).to_wire(),
            json!({"cmd": "OTA", "payload": {"b": 3, "t": "v"}})
        );
        assert_eq!(
            FotaReply::failure("Bad CRC").to_wire(),
            json!({"cmd": "OTA", "payload": {"ko": 1, "reason": "Bad CRC"}})
        );
    }
}
