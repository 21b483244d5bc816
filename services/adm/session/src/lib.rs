//! Hub connection lifecycle for ADM devices: login, heartbeat, reconnect,
//! RPC dispatch and FOTA sequencing.
//!
//! This crate keeps one device logged in to the hub over an unreliable
//! transport. It enforces liveness under a hub-negotiated heartbeat,
//! serializes every outbound frame through a single writer, runs hub-initiated
//! calls against registered functions and drives firmware updates through
//! application checkpoints.
//!
//! ## Features
//!
//! - **Transport**: TCP, or TLS with the `tls` feature, behind a [`Transport`] seam
//! - **Handshake**: credential login with bounded wait for the reply
//! - **Heartbeat**: hub-adjustable interval, two missed intervals drop the link
//! - **Auto-reconnect**: exponential backoff with jitter
//! - **RPC**: name-based dispatch, handlers never block liveness
//! - **FOTA**: checkpointed update state machine
//!
//! ## Example
//!
//! ```rust,no_run
//! use adm_session::{Device, DeviceConfig, DeviceEvent, RpcTable};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut rpc = RpcTable::new();
//! rpc.register("add", |args| {
//!     let sum: i64 = args.iter().filter_map(|a| a.as_i64()).sum();
//!     Ok(json!(sum))
//! });
//!
//! let config = DeviceConfig::new("device-uid", "device-token").with_rpc(rpc);
//! let (device, mut events) = Device::new(config);
//! device.start();
//!
//! device.send_event(json!({ "temperature": 21.5 }));
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         DeviceEvent::Connected { peer } => println!("Connected to {}", peer),
//!         DeviceEvent::Disconnected { reason } => println!("Disconnected: {}", reason),
//!         DeviceEvent::Message(envelope) => println!("From hub: {}", envelope.payload),
//!         DeviceEvent::Backpressure { dropped } => println!("{} messages dropped", dropped),
//!     }
//! }
//! device.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod failure_tracker;
pub mod fota;
pub mod handshake;
pub mod keepalive;
pub mod queue;
pub mod rpc;
pub mod session;
pub mod transport;

// Re-export main types
pub use backoff::{Backoff, BackoffConfig};
pub use config::{
    Credentials, DeviceConfig, DeviceInfo, EndpointConfig, Liveness, DEFAULT_HEARTBEAT,
    DEFAULT_HOSTNAME, DEFAULT_PORT,
};
pub use error::SessionError;
pub use failure_tracker::FrameFailureTracker;
pub use fota::{
    Checkpoint, FirmwareStore, FotaCallback, FotaController, FotaError, FotaState, FotaStep,
    MemoryFirmwareStore, SyncCallback,
};
pub use handshake::{await_hello_ack, recv_envelope, send_hello};
pub use keepalive::HeartbeatSupervisor;
pub use queue::OutboundQueue;
pub use rpc::{RpcDispatcher, RpcFn, RpcTable};
pub use session::{ConnectionState, Device, DeviceEvent, SessionStats};
pub use transport::{
    connect_tcp, resolve, AsyncStream, BoxedStream, Connection, IoStream, TcpTransport,
    TlsClientConfig, Transport,
};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config};
