//! Configuration handling for the device agent.
//!
//! Settings come from the `device:` section of a YAML file, then from
//! `ADM_*` environment variables, then from command-line flags.

use adm_session::{DeviceConfig, DeviceInfo, Liveness, DEFAULT_HOSTNAME, DEFAULT_PORT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Device UID
    pub uid: String,
    /// Device token
    pub token: String,
    /// Hub hostname
    pub hostname: String,
    /// Literal hub address, bypasses name resolution
    pub ip: Option<IpAddr>,
    /// Hub port
    pub port: u16,
    /// Requested heartbeat interval in seconds
    pub heartbeat: u64,
    /// `ack` or `any`
    pub liveness: LivenessSetting,
    /// Outbound messages buffered while offline
    pub queue_capacity: usize,
    /// Platform name reported at login
    pub platform: Option<String>,
    /// Accept firmware updates into memory
    pub fota: bool,
    /// Transport security
    pub tls: TlsConfig,
}

/// Liveness rule as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessSetting {
    /// Heartbeat acknowledgments only
    #[default]
    Ack,
    /// Any inbound message
    Any,
}

impl From<LivenessSetting> for Liveness {
    fn from(setting: LivenessSetting) -> Self {
        match setting {
            LivenessSetting::Ack => Liveness::Ack,
            LivenessSetting::Any => Liveness::AnyTraffic,
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to the CA bundle trusted for the hub
    pub ca_file: Option<PathBuf>,
    /// SNI override
    pub server_name: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            uid: String::new(),
            token: String::new(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            ip: None,
            port: DEFAULT_PORT,
            heartbeat: 60,
            liveness: LivenessSetting::default(),
            queue_capacity: 32,
            platform: None,
            fota: false,
            tls: TlsConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    device: Option<AgentConfig>,
}

impl AgentConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("invalid config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.device.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Device configuration: uid={}, hub={}:{}, heartbeat={}s",
            config.uid, config.hostname, config.port, config.heartbeat
        );
        Ok(config)
    }

    /// Apply `ADM_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(uid) = lookup("ADM_UID") {
            self.uid = uid;
            info!("UID overridden by environment: {}", self.uid);
        }

        if let Some(token) = lookup("ADM_TOKEN") {
            self.token = token;
            info!("Token overridden by environment");
        }

        if let Some(hostname) = lookup("ADM_HOSTNAME") {
            self.hostname = hostname;
            info!("Hostname overridden by environment: {}", self.hostname);
        }

        if let Some(ip) = lookup("ADM_IP") {
            match ip.parse::<IpAddr>() {
                Ok(ip) => {
                    self.ip = Some(ip);
                    info!("Hub address overridden by environment: {}", ip);
                }
                Err(e) => warn!("Ignoring ADM_IP={}: {}", ip, e),
            }
        }

        if let Some(port) = lookup("ADM_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(e) => warn!("Ignoring ADM_PORT={}: {}", port, e),
            }
        }

        if let Some(heartbeat) = lookup("ADM_HEARTBEAT") {
            match heartbeat.parse::<u64>() {
                Ok(secs) => {
                    self.heartbeat = secs;
                    info!("Heartbeat overridden by environment: {}s", secs);
                }
                Err(e) => warn!("Ignoring ADM_HEARTBEAT={}: {}", heartbeat, e),
            }
        }
    }

    /// Session configuration without application hooks
    pub fn to_device_config(&self) -> Result<DeviceConfig> {
        anyhow::ensure!(!self.uid.is_empty(), "device uid is not configured");
        anyhow::ensure!(!self.token.is_empty(), "device token is not configured");

        let mut config = DeviceConfig::new(&self.uid, &self.token)
            .with_hostname(&self.hostname)
            .with_port(self.port)
            .with_heartbeat(Duration::from_secs(self.heartbeat.max(1)))
            .with_liveness(self.liveness.into())
            .with_queue_capacity(self.queue_capacity)
            .with_device_info(DeviceInfo {
                platform: self.platform.clone(),
                vm_uid: None,
            });
        if let Some(ip) = self.ip {
            config = config.with_ip(ip);
        }
        if self.tls.enabled {
            config = self.with_tls(config)?;
        }
        Ok(config)
    }

    #[cfg(feature = "tls")]
    fn with_tls(&self, config: DeviceConfig) -> Result<DeviceConfig> {
        use adm_session::{make_client_config, TcpTransport, TlsClientConfig};
        use std::sync::Arc;

        let ca_file = self
            .tls
            .ca_file
            .as_ref()
            .context("tls.ca_file is required when TLS is enabled")?;
        let ca_pem = std::fs::read_to_string(ca_file)
            .with_context(|| format!("cannot read CA bundle {:?}", ca_file))?;
        let client_config = make_client_config(&ca_pem)?;
        let transport = TcpTransport::new().with_tls(TlsClientConfig {
            client_config: Arc::new(client_config),
            server_name: self.tls.server_name.clone(),
        });
        Ok(config.with_transport(Arc::new(transport)))
    }

    #[cfg(not(feature = "tls"))]
    fn with_tls(&self, _config: DeviceConfig) -> Result<DeviceConfig> {
        anyhow::bail!("TLS is enabled in the configuration but support was not compiled in")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.hostname, "things.zerynth.com");
        assert_eq!(config.port, 12345);
        assert_eq!(config.heartbeat, 60);
        assert_eq!(config.liveness, LivenessSetting::Ack);
        assert!(config.to_device_config().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
device:
  uid: "dev-42"
  token: "s3cret"
  ip: 10.1.2.3
  heartbeat: 30
  liveness: any
  fota: true
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config = AgentConfig::load_from_file(temp_file.path()).unwrap();
        config.apply_overrides(|_| None);

        assert_eq!(config.uid, "dev-42");
        assert_eq!(config.token, "s3cret");
        assert_eq!(config.ip, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(config.port, 12345);
        assert_eq!(config.heartbeat, 30);
        assert_eq!(config.liveness, LivenessSetting::Any);
        assert!(config.fota);

        let device = config.to_device_config().unwrap();
        assert_eq!(device.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(device.liveness, Liveness::AnyTraffic);
        assert_eq!(device.endpoint.ip, config.ip);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"device: [not, a, map]").unwrap();
        assert!(AgentConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("ADM_UID", "env-uid"),
            ("ADM_PORT", "2000"),
            ("ADM_IP", "not-an-ip"),
            ("ADM_HEARTBEAT", "15"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.uid, "env-uid");
        assert_eq!(config.port, 2000);
        assert_eq!(config.ip, None);
        assert_eq!(config.heartbeat, 15);
    }
}
