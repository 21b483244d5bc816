//! Device configuration.

use crate::backoff::BackoffConfig;
use crate::fota::{FirmwareStore, FotaCallback};
use crate::rpc::RpcTable;
use crate::transport::{TcpTransport, Transport};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default hub hostname
pub const DEFAULT_HOSTNAME: &str = "things.zerynth.com";
/// Default hub port
pub const DEFAULT_PORT: u16 = 12345;
/// Default requested heartbeat interval
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Identity of the device on the hub
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Device UID
    pub uid: String,
    /// Device token
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("uid", &self.uid)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Where the hub lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Literal address, used when the network stack cannot resolve names
    pub ip: Option<IpAddr>,
    /// Hub hostname
    pub hostname: String,
    /// Hub port
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ip: None,
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// What proves the hub is alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    /// Only heartbeat acknowledgments from the hub
    #[default]
    Ack,
    /// Any decoded inbound envelope
    AnyTraffic,
}

/// Optional identifiers reported in the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Platform name
    pub platform: Option<String>,
    /// Runtime identifier
    pub vm_uid: Option<String>,
}

/// Configuration for a device session
#[derive(Clone)]
pub struct DeviceConfig {
    /// Device identity
    pub credentials: Credentials,
    /// Hub location
    pub endpoint: EndpointConfig,
    /// Requested heartbeat interval; the hub may impose another
    pub heartbeat_interval: Duration,
    /// What resets the liveness timer
    pub liveness: Liveness,
    /// Bound on opening the transport and on the handshake reply
    pub handshake_timeout: Duration,
    /// Bound on a single frame write
    pub write_timeout: Duration,
    /// Reconnect schedule
    pub backoff: BackoffConfig,
    /// Outbound messages buffered while disconnected or busy
    pub queue_capacity: usize,
    /// Application events buffered before dropping
    pub event_capacity: usize,
    /// Malformed frames tolerated before the connection is torn down
    pub frame_error_threshold: u32,
    /// Window over which malformed frames are counted
    pub frame_error_window: Duration,
    /// Maximum inbound line length
    pub max_line_len: usize,
    /// Functions the hub may call
    pub rpc: RpcTable,
    /// Notified at each update checkpoint
    pub fota_callback: Option<Arc<dyn FotaCallback>>,
    /// Flash access for updates; without it updates are refused
    pub firmware: Option<Arc<dyn FirmwareStore>>,
    /// Extra handshake fields
    pub device_info: DeviceInfo,
    /// Opens connections to the hub
    pub transport: Arc<dyn Transport>,
}

impl DeviceConfig {
    /// Configuration with defaults for everything but the credentials
    pub fn new(uid: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                uid: uid.into(),
                token: token.into(),
            },
            endpoint: EndpointConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            liveness: Liveness::default(),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            queue_capacity: 32,
            event_capacity: 64,
            frame_error_threshold: 5,
            frame_error_window: Duration::from_secs(30),
            max_line_len: adm_wire::DEFAULT_MAX_LINE_LEN,
            rpc: RpcTable::new(),
            fota_callback: None,
            firmware: None,
            device_info: DeviceInfo::default(),
            transport: Arc::new(TcpTransport::new()),
        }
    }

    /// Use a literal hub address
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.endpoint.ip = Some(ip);
        self
    }

    /// Use another hub hostname
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.endpoint.hostname = hostname.into();
        self
    }

    /// Use another hub port
    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint.port = port;
        self
    }

    /// Request a heartbeat interval
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Choose the liveness rule
    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    /// Register the callable functions
    pub fn with_rpc(mut self, rpc: RpcTable) -> Self {
        self.rpc = rpc;
        self
    }

    /// Install the update checkpoint callback
    pub fn with_fota_callback(mut self, callback: Arc<dyn FotaCallback>) -> Self {
        self.fota_callback = Some(callback);
        self
    }

    /// Enable updates through the given firmware store
    pub fn with_firmware_store(mut self, store: Arc<dyn FirmwareStore>) -> Self {
        self.firmware = Some(store);
        self
    }

    /// Report platform identifiers in the handshake
    pub fn with_device_info(mut self, info: DeviceInfo) -> Self {
        self.device_info = info;
        self
    }

    /// Replace the network transport
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Change the outbound buffer size
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Change the reconnect schedule
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("credentials", &self.credentials)
            .field("endpoint", &self.endpoint)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("liveness", &self.liveness)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("backoff", &self.backoff)
            .field("queue_capacity", &self.queue_capacity)
            .field("frame_error_threshold", &self.frame_error_threshold)
            .field("rpc", &self.rpc)
            .field("fota_callback", &self.fota_callback.is_some())
            .field("firmware", &self.firmware.is_some())
            .finish_non_exhaustive()
    }
}
