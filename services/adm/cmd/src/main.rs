//! ADM device agent binary.
//!
//! Logs a device in to the hub, keeps it connected, answers a couple of
//! demo RPCs and publishes a periodic uptime event.

use adm_session::{
    Checkpoint, Device, DeviceEvent, FotaCallback, MemoryFirmwareStore, RpcTable,
};
use adm_wire::FotaRecord;
use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde_json::json;
use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::AgentConfig;
use logging::AdmLogFormatter;

/// ADM device agent
#[derive(Parser, Debug)]
#[command(name = "adm-device", version, about = "Keeps a device connected to the ADM hub")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "adm.yaml")]
    config: PathBuf,

    /// Device UID
    #[arg(long)]
    uid: Option<String>,

    /// Device token
    #[arg(long)]
    token: Option<String>,

    /// Hub hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Literal hub address, skips name resolution
    #[arg(long)]
    ip: Option<std::net::IpAddr>,

    /// Hub port
    #[arg(long)]
    port: Option<u16>,

    /// Requested heartbeat interval, e.g. 60s
    #[arg(long)]
    heartbeat: Option<humantime::Duration>,

    /// Interval between uptime events, e.g. 30s
    #[arg(long, default_value = "30s")]
    event_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(uid) = &self.uid {
            config.uid = uid.clone();
        }
        if let Some(token) = &self.token {
            config.token = token.clone();
        }
        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(ip) = self.ip {
            config.ip = Some(ip);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat = heartbeat.as_secs();
        }
    }
}

/// Lets every update through and reports progress
struct LoggingCallback;

#[async_trait]
impl FotaCallback for LoggingCallback {
    async fn checkpoint(&self, checkpoint: Checkpoint) -> bool {
        match checkpoint {
            Checkpoint::Started => component_info!("fota", "Firmware update started"),
            Checkpoint::UpdateRecord => {
                component_info!("fota", "Firmware received, switching boot record")
            }
            Checkpoint::Reset => component_info!("fota", "Firmware committed, resetting"),
        }
        true
    }
}

fn rpc_table() -> RpcTable {
    let mut rpc = RpcTable::new();
    rpc.register("echo", |args| Ok(json!(args)))
        .register("random", |args| {
            let upper = args.first().and_then(|v| v.as_i64()).unwrap_or(100).max(1);
            Ok(json!(rand::thread_rng().gen_range(0..upper)))
        });
    rpc
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("adm_device={}", args.log_level).parse()?)
        .add_directive(format!("adm_session={}", args.log_level).parse()?)
        .add_directive(format!("adm_wire={}", args.log_level).parse()?)
        .add_directive(format!("backpressure={}", args.log_level).parse()?);

    let formatter = AdmLogFormatter::new("adm");

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(formatter)
        .init();

    info!("Starting ADM device agent v{}", env!("CARGO_PKG_VERSION"));

    let mut agent_config = AgentConfig::load_from_file(&args.config)?;
    args.apply(&mut agent_config);
    if agent_config.uid.is_empty() || agent_config.token.is_empty() {
        anyhow::bail!("device uid and token are required (config file, ADM_UID/ADM_TOKEN or --uid/--token)");
    }

    let mut device_config = agent_config
        .to_device_config()?
        .with_rpc(rpc_table())
        .with_fota_callback(Arc::new(LoggingCallback));
    if agent_config.fota {
        let store = MemoryFirmwareStore::new(FotaRecord {
            valid: true,
            bc_slot: 0,
            vm_slot: 0,
            chunk: 4096,
        });
        device_config = device_config.with_firmware_store(Arc::new(store));
        component_info!("fota", "Firmware updates enabled (in-memory store)");
    }

    let (device, mut events) = Device::new(device_config);
    device.start();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DeviceEvent::Connected { peer } => {
                    component_info!("agent", "Connected to hub at {}", peer)
                }
                DeviceEvent::Disconnected { reason } => {
                    component_warn!("agent", "Disconnected from hub: {}", reason)
                }
                DeviceEvent::Message(envelope) => {
                    component_info!("agent", "Hub message ({:?}): {}", envelope.kind, envelope.payload)
                }
                DeviceEvent::Backpressure { dropped } => {
                    component_warn!("agent", "{} outbound messages dropped", dropped)
                }
            }
        }
    });

    let started = Instant::now();
    let mut ticker = tokio::time::interval(args.event_interval.into());
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                device.send_event(json!({
                    "uptime": started.elapsed().as_secs(),
                    "ts": chrono::Utc::now().to_rfc3339(),
                }));
                let stats = device.stats();
                component_debug!(
                    "agent",
                    "state={} sent={} received={} dropped={}",
                    device.state(),
                    stats.frames_sent,
                    stats.frames_received,
                    stats.dropped
                );
            }
        }
    }

    device.stop().await;
    info!("ADM device agent stopped");
    Ok(())
}
