//! Envelope model, hub wire dialect and framing for ADM devices.
//!
//! This crate provides the low-level wire protocol used between a device and
//! the hub: the [`Envelope`] unit, its mapping to the hub's JSON objects, a
//! newline-delimited framer, and typed views over handshake, call and
//! firmware update traffic.
//!
//! ## Wire Format
//!
//! ```text
//! {"cmd":"HTBM"}\n
//! {"cmd":"EVNT","payload":{...}}\n
//! {"cmd":"CALL","id":1,"method":"double","args":[21]}\n
//! {"cmd":"RETN","id":1,"res":42}\n
//! ```
//!
//! One compact JSON object per line. The handshake and its reply carry no
//! `cmd` field.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod directive;
pub mod envelope;
pub mod error;
pub mod frame;

// Re-export main types
pub use directive::{
    FotaDirective, FotaOffer, FotaRecord, FotaReply, Hello, HelloAck, Image, RpcCall,
};
pub use envelope::{CallId, Envelope, EnvelopeKind};
pub use error::WireError;
pub use frame::{encode, FrameDecoder, DEFAULT_MAX_LINE_LEN, FRAME_DELIMITER};
