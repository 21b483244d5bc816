//! Device session management.
//!
//! A [`Device`] owns one logical connection to the hub. `start` spawns a
//! background task that connects, logs in, and then runs the connection
//! until it fails, after which it reconnects with backoff. While connected
//! four tasks cooperate:
//!
//! - the writer, the only code that touches the write half of the stream
//! - the reader, which turns bytes into envelopes
//! - the RPC worker and the FOTA worker, which may block for a long time
//!
//! The connection loop itself owns the heartbeat schedule and routes inbound
//! envelopes, so neither slow handlers nor a stalled application can delay
//! liveness signaling.

use crate::backoff::Backoff;
use crate::config::DeviceConfig;
use crate::failure_tracker::FrameFailureTracker;
use crate::fota::{self, FotaController, FotaError, FotaState, FotaStep};
use crate::handshake::{await_hello_ack, send_hello};
use crate::keepalive::HeartbeatSupervisor;
use crate::queue::OutboundQueue;
use crate::rpc::{self, RpcDispatcher};
use crate::transport::{BoxedStream, Connection};
use crate::SessionError;
use adm_wire::{
    encode, Envelope, EnvelopeKind, FrameDecoder, Hello, HelloAck, RpcCall, WireError,
};
use bytes::BytesMut;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Envelopes waiting for the writer besides the application queue
const WRITER_BACKLOG: usize = 64;
/// Decoded envelopes waiting for the connection loop
const INBOUND_BACKLOG: usize = 64;
/// Calls waiting for the RPC worker
const RPC_BACKLOG: usize = 16;
/// Directives waiting for the FOTA worker
const FOTA_BACKLOG: usize = 16;
/// Initial read buffer size
const READ_BUFFER: usize = 8 * 1024;

/// Connection lifecycle as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection; either not started or waiting to retry
    #[default]
    Disconnected,
    /// Opening the transport or logging in
    Connecting,
    /// Logged in and healthy
    Connected,
    /// Logged in, but the hub has been silent for more than an interval
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Statistics for a device session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Number of envelopes received
    pub frames_received: u64,
    /// Number of envelopes sent
    pub frames_sent: u64,
    /// Timestamp of last received envelope
    pub last_frame_in: Option<Instant>,
    /// Timestamp of last sent envelope
    pub last_frame_out: Option<Instant>,
    /// Outbound envelopes dropped because the queue was full
    pub dropped: u64,
    /// Malformed inbound frames discarded
    pub frame_errors: u64,
    /// Reconnect attempts after the first connection attempt
    pub reconnects: u64,
    /// Hub timestamp from the last login reply
    pub hub_time: Option<u64>,
    /// Last heartbeat acknowledgment from the hub
    pub last_heartbeat_ack: Option<Instant>,
    /// Heartbeat interval in force on the current connection
    pub heartbeat_interval: Option<Duration>,
    /// Why the last connection or attempt ended
    pub last_error: Option<String>,
}

/// Notifications for the application
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Logged in to the hub
    Connected {
        /// Peer description
        peer: String,
    },
    /// An established connection ended
    Disconnected {
        /// Why it ended
        reason: String,
    },
    /// Event or raw message from the hub
    Message(Envelope),
    /// The outbound queue overflowed
    Backpressure {
        /// Total envelopes dropped so far
        dropped: u64,
    },
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: DeviceConfig,
    queue: OutboundQueue,
    state: watch::Sender<ConnectionState>,
    stats: Mutex<SessionStats>,
    events: mpsc::Sender<DeviceEvent>,
    rpc: RpcDispatcher,
    fota: Arc<tokio::sync::Mutex<FotaController>>,
    fota_state: watch::Receiver<FotaState>,
    run: Mutex<Option<RunHandle>>,
}

/// Login transport ready for the connection loop
struct Established {
    stream: BoxedStream,
    peer: String,
    decoder: FrameDecoder,
    buffer: BytesMut,
    ack: HelloAck,
}

/// Handle to a device session; clones share the same session
#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl Device {
    /// Create a session and the channel its events are delivered on.
    ///
    /// Nothing happens on the network until [`Device::start`].
    pub fn new(config: DeviceConfig) -> (Self, mpsc::Receiver<DeviceEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let controller = FotaController::new(config.fota_callback.clone(), config.firmware.clone());
        let fota_state = controller.subscribe();

        let inner = Inner {
            queue: OutboundQueue::new(config.queue_capacity),
            rpc: RpcDispatcher::new(config.rpc.clone()),
            fota: Arc::new(tokio::sync::Mutex::new(controller)),
            fota_state,
            state,
            stats: Mutex::new(SessionStats::default()),
            events,
            run: Mutex::new(None),
            config,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Begin background connection management and return immediately.
    ///
    /// Calling `start` on a running device does nothing. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let mut run = self.inner.lock_run();
        if run.is_some() {
            debug!("Device already started");
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot start device outside a tokio runtime: {}", e);
                return;
            }
        };

        info!(
            "Starting device {} for {}:{}",
            self.inner.config.credentials.uid,
            self.inner.config.endpoint.hostname,
            self.inner.config.endpoint.port
        );
        let cancel = CancellationToken::new();
        let task = handle.spawn(self.inner.clone().run(cancel.clone()));
        *run = Some(RunHandle { cancel, task });
    }

    /// Tear the session down: cancel retries, close the transport and
    /// abandon any update in progress
    pub async fn stop(&self) {
        let run = self.inner.lock_run().take();
        let Some(run) = run else {
            return;
        };

        info!("Stopping device {}", self.inner.config.credentials.uid);
        run.cancel.cancel();
        if let Err(e) = run.task.await {
            if e.is_panic() {
                error!("Session task panicked: {}", e);
            }
        }
        self.inner.fota.lock().await.abort("device stopped");
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Queue a raw message
    pub fn send(&self, message: Value) {
        self.inner.enqueue(Envelope::raw(message));
    }

    /// Queue an event
    pub fn send_event(&self, payload: Value) {
        self.inner.enqueue(Envelope::event(payload));
    }

    /// Queue a notification
    pub fn send_notification(&self, title: &str, text: &str) {
        self.inner.enqueue(Envelope::notification(title, text));
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Current update state
    pub fn fota_state(&self) -> FotaState {
        *self.inner.fota_state.borrow()
    }

    /// Observe update state changes
    pub fn watch_fota(&self) -> watch::Receiver<FotaState> {
        self.inner.fota_state.clone()
    }

    /// Signal update progress made outside the hub transfer.
    ///
    /// A failure abandons the update and is reported to the hub.
    pub async fn fota_advance(&self, step: FotaStep) -> Result<(), FotaError> {
        let mut controller = self.inner.fota.lock().await;
        let outcome = controller.advance(step).await;
        if let Err(e) = &outcome {
            let reply = controller.fail(e);
            self.inner.enqueue(reply);
        }
        outcome
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        self.inner.stats().clone()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("uid", &self.inner.config.credentials.uid)
            .field("state", &self.state())
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

impl Inner {
    fn lock_run(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, SessionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Connection {} -> {}", prev, next);
        }
    }

    fn emit(&self, event: DeviceEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("No event receiver");
            }
        }
    }

    fn enqueue(&self, envelope: Envelope) {
        if let Some(oldest) = self.queue.push(envelope) {
            let dropped = {
                let mut stats = self.stats();
                stats.dropped += 1;
                stats.dropped
            };
            warn!(
                target: "backpressure",
                "Outbound queue full ({}), dropped oldest {:?} (total {})",
                self.queue.capacity(),
                oldest.kind,
                dropped
            );
            self.emit(DeviceEvent::Backpressure { dropped });
        }
    }

    fn hello(&self) -> Hello {
        let config = &self.config;
        let record = config.firmware.as_ref().and_then(|store| store.record());
        Hello {
            uid: config.credentials.uid.clone(),
            token: config.credentials.token.clone(),
            platform: config.device_info.platform.clone(),
            vm_uid: config.device_info.vm_uid.clone(),
            heartbeat: config.heartbeat_interval.as_secs(),
            fota: record,
            fota_capable: record.is_some(),
        }
    }

    /// Reconnect loop; runs until cancelled
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff);

        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.connect_and_login() => attempt,
            };

            match attempt {
                Ok(established) => {
                    backoff.reset();
                    let reason = self.run_connected(established, &cancel).await;
                    self.on_disconnect(&reason).await;
                    if matches!(reason, SessionError::Cancelled) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    self.stats().last_error = Some(e.to_string());
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            let delay = backoff.next_delay();
            info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempts());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.stats().reconnects += 1;
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("Session task finished");
    }

    async fn connect_and_login(&self) -> Result<Established, SessionError> {
        let config = &self.config;
        let Connection { mut stream, peer } = tokio::time::timeout(
            config.handshake_timeout,
            config.transport.connect(&config.endpoint),
        )
        .await
        .map_err(|_| SessionError::ConnectTimeout(config.handshake_timeout))??;
        debug!("Transport open to {}", peer);

        tokio::time::timeout(config.write_timeout, send_hello(&mut stream, self.hello()))
            .await
            .map_err(|_| SessionError::WriteTimeout(config.write_timeout))??;

        let mut decoder = FrameDecoder::with_max_line_len(config.max_line_len);
        let mut buffer = BytesMut::with_capacity(READ_BUFFER);
        let ack =
            await_hello_ack(&mut stream, &mut decoder, &mut buffer, config.handshake_timeout)
                .await?;

        if let Some(store) = &config.firmware {
            if let Err(e) = store.accept() {
                warn!("Failed to accept running firmware: {}", e);
            }
        }

        Ok(Established {
            stream,
            peer,
            decoder,
            buffer,
            ack,
        })
    }

    /// Drive one logged-in connection; returns why it ended
    async fn run_connected(
        self: &Arc<Self>,
        established: Established,
        cancel: &CancellationToken,
    ) -> SessionError {
        let Established {
            stream,
            peer,
            decoder,
            buffer,
            ack,
        } = established;
        let config = &self.config;

        let now = Instant::now();
        let mut heartbeat = HeartbeatSupervisor::new(config.heartbeat_interval, config.liveness, now);
        if let Some(secs) = ack.heartbeat {
            heartbeat.apply_override(Duration::from_secs(secs), now);
        }
        {
            let mut stats = self.stats();
            stats.hub_time = ack.hub_time.or(stats.hub_time);
            stats.heartbeat_interval = Some(heartbeat.effective_interval());
        }

        info!(
            "Connected to hub at {} (heartbeat {:?})",
            peer,
            heartbeat.effective_interval()
        );
        self.set_state(ConnectionState::Connected);
        self.emit(DeviceEvent::Connected { peer: peer.clone() });

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel::<Envelope>(WRITER_BACKLOG);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        let (rpc_tx, rpc_rx) = mpsc::channel::<RpcCall>(RPC_BACKLOG);
        let (fota_tx, fota_rx) = mpsc::channel::<Envelope>(FOTA_BACKLOG);

        let mut writer = tokio::spawn(self.clone().write_loop(write_half, writer_rx));
        let mut reader = tokio::spawn(self.clone().read_loop(read_half, decoder, buffer, inbound_tx));
        let rpc_worker = tokio::spawn(rpc::run_worker(self.rpc.clone(), rpc_rx, writer_tx.clone()));
        let fota_worker = tokio::spawn(fota::run_worker(
            self.fota.clone(),
            fota_rx,
            writer_tx.clone(),
        ));

        let mut failures =
            FrameFailureTracker::new(config.frame_error_threshold, config.frame_error_window);
        let mut degraded = false;

        let reason = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break SessionError::Cancelled,

                _ = tokio::time::sleep_until(heartbeat.dead_at()) => {
                    warn!("No sign of life from hub for {:?}", heartbeat.timeout());
                    break SessionError::HeartbeatTimeout(heartbeat.timeout());
                }

                _ = tokio::time::sleep_until(heartbeat.next_ping_at()) => {
                    match writer_tx.try_send(Envelope::heartbeat()) {
                        Ok(()) => trace!("Heartbeat queued"),
                        Err(TrySendError::Full(_)) => warn!("Writer backlog full, skipping heartbeat"),
                        Err(TrySendError::Closed(_)) => {}
                    }
                    heartbeat.on_ping_sent(Instant::now());
                }

                _ = tokio::time::sleep_until(heartbeat.suspect_at()), if !degraded => {
                    warn!("Hub silent for more than {:?}", heartbeat.effective_interval());
                    degraded = true;
                    self.set_state(ConnectionState::Degraded);
                }

                Some(inbound) = inbound_rx.recv() => {
                    let now = Instant::now();
                    let envelope = match inbound {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            self.stats().frame_errors += 1;
                            warn!("Discarding malformed frame: {}", e);
                            let (count, exceeded) = failures.record_failure(now);
                            if exceeded {
                                break SessionError::FrameErrors(count);
                            }
                            continue;
                        }
                    };

                    failures.record_success();
                    heartbeat.on_traffic(now);
                    {
                        let mut stats = self.stats();
                        stats.frames_received += 1;
                        stats.last_frame_in = Some(now);
                    }

                    match envelope.kind {
                        EnvelopeKind::Heartbeat => {
                            heartbeat.on_ack(now);
                            if let Some(secs) = envelope.interval_override() {
                                heartbeat.apply_override(Duration::from_secs(secs), now);
                            }
                            let mut stats = self.stats();
                            stats.last_heartbeat_ack = Some(now);
                            stats.heartbeat_interval = Some(heartbeat.effective_interval());
                            if let Some(ts) = envelope.field("ts").and_then(Value::as_u64) {
                                stats.hub_time = Some(ts);
                            }
                        }
                        EnvelopeKind::RpcCall => match RpcCall::try_from(&envelope) {
                            Ok(call) => {
                                if let Err(TrySendError::Full(call)) = rpc_tx.try_send(call) {
                                    warn!("RPC backlog full, refusing call {}", call.call_id);
                                    if call.want_reply {
                                        let busy = Envelope::rpc_result(call.call_id, Err("busy".into()));
                                        if writer_tx.try_send(busy).is_err() {
                                            debug!("Writer backlog full, busy reply dropped");
                                        }
                                    }
                                }
                            }
                            Err(e) => warn!("Discarding malformed call: {}", e),
                        },
                        EnvelopeKind::Fota => {
                            if fota_tx.try_send(envelope).is_err() {
                                warn!("FOTA backlog full, directive dropped");
                            }
                        }
                        EnvelopeKind::Event | EnvelopeKind::Notification | EnvelopeKind::Raw => {
                            self.emit(DeviceEvent::Message(envelope));
                        }
                        // Login replies only mean something during the handshake
                        EnvelopeKind::HelloAck => {
                            self.emit(DeviceEvent::Message(Envelope::raw(envelope.payload)));
                        }
                        EnvelopeKind::Terminate => {
                            info!("Hub requested termination");
                            break SessionError::Terminated;
                        }
                        EnvelopeKind::Hello | EnvelopeKind::RpcResult => {
                            debug!("Ignoring unexpected {:?} from hub", envelope.kind);
                        }
                    }

                    if degraded && now < heartbeat.suspect_at() {
                        degraded = false;
                        self.set_state(ConnectionState::Connected);
                    }
                }

                res = &mut writer => break task_outcome(res),

                res = &mut reader => break task_outcome(res),
            }
        };

        writer.abort();
        reader.abort();
        rpc_worker.abort();
        fota_worker.abort();
        reason
    }

    async fn on_disconnect(&self, reason: &SessionError) {
        match reason {
            SessionError::Cancelled => info!("Connection closed: {}", reason),
            _ => warn!("Connection lost: {}", reason),
        }
        self.set_state(ConnectionState::Disconnected);
        self.stats().last_error = Some(reason.to_string());
        self.fota.lock().await.abort("connection lost");
        self.emit(DeviceEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Single writer: replies and heartbeats first, then application traffic
    async fn write_loop(
        self: Arc<Self>,
        mut writer: WriteHalf<BoxedStream>,
        mut rx: mpsc::Receiver<Envelope>,
    ) -> SessionError {
        let write_timeout = self.config.write_timeout;
        loop {
            let envelope = tokio::select! {
                biased;
                Some(envelope) = rx.recv() => envelope,
                envelope = self.queue.recv() => envelope,
            };

            let frame = match encode(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping unencodable {:?}: {}", envelope.kind, e);
                    continue;
                }
            };

            let write = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            };
            match tokio::time::timeout(write_timeout, write).await {
                Err(_) => return SessionError::WriteTimeout(write_timeout),
                Ok(Err(e)) => return SessionError::Transport(e),
                Ok(Ok(())) => {
                    let mut stats = self.stats();
                    stats.bytes_out += frame.len() as u64;
                    stats.frames_sent += 1;
                    stats.last_frame_out = Some(Instant::now());
                    trace!("Sent {:?} ({} bytes)", envelope.kind, frame.len());
                }
            }
        }
    }

    /// Decode frames until the stream fails; malformed lines are passed on
    /// so the connection loop can count them
    async fn read_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxedStream>,
        mut decoder: FrameDecoder,
        mut buffer: BytesMut,
        tx: mpsc::Sender<Result<Envelope, WireError>>,
    ) -> SessionError {
        loop {
            loop {
                let decoded = match decoder.decode(&mut buffer) {
                    Ok(Some(envelope)) => Ok(envelope),
                    Ok(None) => break,
                    Err(e) => Err(e),
                };
                if tx.send(decoded).await.is_err() {
                    return SessionError::Cancelled;
                }
            }

            match reader.read_buf(&mut buffer).await {
                Ok(0) => {
                    return SessionError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "hub closed the connection",
                    ))
                }
                Ok(n) => {
                    self.stats().bytes_in += n as u64;
                    trace!("Read {} bytes, buffer now has {} bytes", n, buffer.len());
                }
                Err(e) => return SessionError::Transport(e),
            }
        }
    }
}

fn task_outcome(res: Result<SessionError, tokio::task::JoinError>) -> SessionError {
    res.unwrap_or_else(|e| SessionError::Transport(std::io::Error::other(e.to_string())))
}
