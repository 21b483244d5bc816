//! Firmware-over-the-air update sequencing.
//!
//! The controller never flashes or resets anything itself. It validates the
//! hub's directives, moves image blocks into a [`FirmwareStore`] and asks the
//! application's [`FotaCallback`] for permission at each checkpoint:
//!
//! ```text
//! idle --start/cb(0)--> started --payload/cb(1)--> record_update_pending
//!      --persisted/cb(2)--> reset_pending --reset--> done
//! ```
//!
//! Abort and transport loss return the controller to idle from any state.

use adm_wire::{Envelope, FotaDirective, FotaOffer, FotaRecord, FotaReply, Image};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Upper bound on an image held by [`MemoryFirmwareStore`]
const MAX_MEMORY_IMAGE: u64 = 16 * 1024 * 1024;

/// Update progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FotaState {
    /// No update running
    #[default]
    Idle,
    /// Images are being transferred
    Started,
    /// Payload received, waiting for the new record to be persisted
    RecordUpdatePending,
    /// Record persisted, waiting for the reset
    ResetPending,
    /// Reset issued; only an abort leaves this state
    Done,
}

impl fmt::Display for FotaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FotaState::Idle => "idle",
            FotaState::Started => "started",
            FotaState::RecordUpdatePending => "record_update_pending",
            FotaState::ResetPending => "reset_pending",
            FotaState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Points at which the application is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Checkpoint {
    /// An update is about to begin
    Started = 0,
    /// The payload is complete and the update record is about to change
    UpdateRecord = 1,
    /// The device is about to reset into the new firmware
    Reset = 2,
}

impl Checkpoint {
    /// Numeric checkpoint as exposed to applications
    pub fn index(self) -> u8 {
        self as u8
    }
}

/// Application hook consulted at each checkpoint.
///
/// The controller awaits the returned future before advancing. Returning
/// `false` stops the update.
#[async_trait]
pub trait FotaCallback: Send + Sync {
    /// Decide whether the update may continue past `checkpoint`
    async fn checkpoint(&self, checkpoint: Checkpoint) -> bool;
}

/// Adapter for plain closures
pub struct SyncCallback<F>(F);

impl<F> SyncCallback<F>
where
    F: Fn(Checkpoint) -> bool + Send + Sync,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> FotaCallback for SyncCallback<F>
where
    F: Fn(Checkpoint) -> bool + Send + Sync,
{
    async fn checkpoint(&self, checkpoint: Checkpoint) -> bool {
        (self.0)(checkpoint)
    }
}

/// Device flash primitives used during an update
pub trait FirmwareStore: Send + Sync {
    /// Currently running firmware, `None` if the record cannot be read
    fn record(&self) -> Option<FotaRecord>;
    /// Mark the running firmware as good
    fn accept(&self) -> anyhow::Result<()>;
    /// Erase `slot` and get it ready for `size` bytes of `image`
    fn prepare(&self, image: Image, slot: u32, size: u64) -> anyhow::Result<()>;
    /// Write `data` at `offset` inside the prepared slot for `image`
    fn write(&self, image: Image, offset: u64, data: &[u8]) -> anyhow::Result<()>;
    /// Digest over the first `size` bytes of `image`; empty skips the check
    fn checksum(&self, image: Image, size: u64) -> anyhow::Result<Vec<u8>>;
    /// Persist a record that boots the given slots next
    fn commit(&self, bc_slot: u32, vm_slot: u32) -> anyhow::Result<()>;
    /// Reset the device
    fn reset(&self) -> anyhow::Result<()>;
}

/// Reasons an update directive is refused; the display text is the reason
/// reported to the hub
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FotaError {
    /// No firmware store or unreadable record
    #[error("OTA unsupported")]
    Unsupported,
    /// Target slots are the ones currently running
    #[error("Bad slots")]
    BadSlots,
    /// The application refused a checkpoint
    #[error("stopped by callback")]
    StoppedByCallback,
    /// Image digest mismatch
    #[error("Bad CRC")]
    BadChecksum,
    /// Directive does not fit the current step
    #[error("not ready")]
    NotReady,
    /// Block for an image that is not being transferred
    #[error("BC only ota")]
    WrongImage,
    /// An update is already running or finished
    #[error("busy")]
    Busy,
    /// Flash primitive failed
    #[error("flash: {0}")]
    Store(String),
}

impl From<anyhow::Error> for FotaError {
    fn from(err: anyhow::Error) -> Self {
        FotaError::Store(err.to_string())
    }
}

/// Externally signaled progress, for embedders that drive the transfer
/// themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaStep {
    /// The whole payload is on the device
    PayloadReceived,
    /// The new update record is persisted
    RecordPersisted,
    /// The reset primitive ran
    ResetInvoked,
}

#[derive(Debug)]
struct Transfer {
    offer: FotaOffer,
    image: Image,
    block: u32,
    received: u64,
    awaiting_checksum: bool,
}

impl Transfer {
    fn new(offer: FotaOffer) -> Self {
        Self {
            offer,
            image: Image::Bytecode,
            block: 0,
            received: 0,
            awaiting_checksum: false,
        }
    }

    fn size(&self, image: Image) -> u64 {
        match image {
            Image::Bytecode => self.offer.bc_size,
            Image::Vm => self.offer.vm_size,
        }
    }

    fn switch_to(&mut self, image: Image) {
        self.image = image;
        self.block = 0;
        self.received = 0;
        self.awaiting_checksum = false;
    }
}

/// Update state machine for one device
pub struct FotaController {
    callback: Option<Arc<dyn FotaCallback>>,
    store: Option<Arc<dyn FirmwareStore>>,
    state: watch::Sender<FotaState>,
    transfer: Option<Transfer>,
}

impl FotaController {
    /// Create an idle controller
    pub fn new(
        callback: Option<Arc<dyn FotaCallback>>,
        store: Option<Arc<dyn FirmwareStore>>,
    ) -> Self {
        let (state, _) = watch::channel(FotaState::Idle);
        Self {
            callback,
            store,
            state,
            transfer: None,
        }
    }

    /// Current state
    pub fn state(&self) -> FotaState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<FotaState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: FotaState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("FOTA {} -> {}", prev, next);
        }
    }

    async fn consult(&self, checkpoint: Checkpoint) -> Result<(), FotaError> {
        let Some(callback) = &self.callback else {
            return Ok(());
        };
        debug!("FOTA checkpoint {}", checkpoint.index());
        if callback.checkpoint(checkpoint).await {
            Ok(())
        } else {
            warn!("FOTA stopped by callback at checkpoint {}", checkpoint.index());
            Err(FotaError::StoppedByCallback)
        }
    }

    fn store(&self) -> Result<Arc<dyn FirmwareStore>, FotaError> {
        self.store.clone().ok_or(FotaError::Unsupported)
    }

    /// Return to idle, dropping any partial transfer
    pub fn abort(&mut self, reason: &str) {
        if self.state() != FotaState::Idle || self.transfer.is_some() {
            warn!("FOTA aborted: {}", reason);
        }
        self.transfer = None;
        self.set_state(FotaState::Idle);
    }

    /// Turn a failure into the reply for the hub; everything but `busy`
    /// also abandons the running update
    pub fn fail(&mut self, err: &FotaError) -> Envelope {
        if *err != FotaError::Busy {
            self.abort(&err.to_string());
        }
        FotaReply::failure(&err.to_string())
    }

    /// Process one directive and return the replies for the hub
    pub async fn handle_directive(&mut self, directive: FotaDirective) -> Vec<Envelope> {
        match directive {
            FotaDirective::Abort => {
                self.abort("hub request");
                Vec::new()
            }
            FotaDirective::Confirm { bc_slot, vm_slot } => match self.confirm(bc_slot, vm_slot) {
                Ok(reply) => vec![reply],
                Err(err) => vec![FotaReply::failure(&err.to_string())],
            },
            directive => {
                let outcome = if self.store.is_none() {
                    Err(FotaError::Unsupported)
                } else if self.state() == FotaState::Done {
                    Err(FotaError::Busy)
                } else {
                    match directive {
                        FotaDirective::Start(offer) => self.start(offer).await,
                        FotaDirective::Block { image, data } => self.block(image, &data),
                        FotaDirective::Checksum { image, crc } => self.checksum(image, &crc).await,
                        FotaDirective::Abort | FotaDirective::Confirm { .. } => Ok(Vec::new()),
                    }
                };
                outcome.unwrap_or_else(|err| vec![self.fail(&err)])
            }
        }
    }

    fn confirm(&self, bc_slot: u32, vm_slot: u32) -> Result<Envelope, FotaError> {
        let store = self.store()?;
        if self.state() == FotaState::Done {
            return Err(FotaError::Busy);
        }
        let record = store.record().ok_or(FotaError::Unsupported)?;
        if record.bc_slot == bc_slot && record.vm_slot == vm_slot {
            Ok(FotaReply::confirmed())
        } else {
            Err(FotaError::NotReady)
        }
    }

    /// Begin the update described by `offer`
    pub async fn start(&mut self, offer: FotaOffer) -> Result<Vec<Envelope>, FotaError> {
        if self.state() != FotaState::Idle {
            return Err(FotaError::Busy);
        }
        let store = self.store()?;
        let running = store.record().ok_or(FotaError::Unsupported)?;
        if offer.bc_slot == running.bc_slot || (offer.vm_size > 0 && offer.vm_slot == running.vm_slot)
        {
            warn!(
                "FOTA targets running slots (bc {}, vm {})",
                offer.bc_slot, offer.vm_slot
            );
            return Err(FotaError::BadSlots);
        }

        self.consult(Checkpoint::Started).await?;

        store.prepare(Image::Bytecode, offer.bc_slot, offer.bc_size)?;
        if offer.vm_size > 0 {
            store.prepare(Image::Vm, offer.vm_slot, offer.vm_size)?;
        }

        info!(
            "FOTA started: bytecode {} bytes to slot {}, vm {} bytes to slot {}, chunk {}",
            offer.bc_size, offer.bc_slot, offer.vm_size, offer.vm_slot, offer.chunk
        );
        self.transfer = Some(Transfer::new(offer));
        self.set_state(FotaState::Started);
        Ok(vec![FotaReply::request_block(Image::Bytecode, 0)])
    }

    fn block(&mut self, image: Image, data: &[u8]) -> Result<Vec<Envelope>, FotaError> {
        if self.state() != FotaState::Started {
            return Err(FotaError::NotReady);
        }
        let store = self.store()?;
        let transfer = self.transfer.as_mut().ok_or(FotaError::NotReady)?;
        if transfer.awaiting_checksum {
            return Err(FotaError::NotReady);
        }
        if image != transfer.image {
            return Err(FotaError::WrongImage);
        }

        let offset = u64::from(transfer.offer.chunk) * u64::from(transfer.block);
        debug!(
            "FOTA writing {} block {} at {} ({} bytes)",
            image.tag(),
            transfer.block,
            offset,
            data.len()
        );
        store.write(image, offset, data)?;
        transfer.block += 1;
        transfer.received += data.len() as u64;

        if transfer.received < transfer.size(image) {
            Ok(vec![FotaReply::request_block(image, transfer.block)])
        } else {
            transfer.awaiting_checksum = true;
            Ok(vec![FotaReply::request_checksum(image)])
        }
    }

    async fn checksum(&mut self, image: Image, expected: &[u8]) -> Result<Vec<Envelope>, FotaError> {
        if self.state() != FotaState::Started {
            return Err(FotaError::NotReady);
        }
        let store = self.store()?;
        let transfer = self.transfer.as_mut().ok_or(FotaError::NotReady)?;
        if !transfer.awaiting_checksum || image != transfer.image {
            return Err(FotaError::NotReady);
        }

        let actual = store.checksum(image, transfer.size(image))?;
        if actual.is_empty() {
            debug!("FOTA store has no digest for {}, skipping check", image.tag());
        } else if expected.get(..actual.len()) != Some(actual.as_slice()) {
            return Err(FotaError::BadChecksum);
        }

        if image == Image::Bytecode && transfer.offer.vm_size > 0 {
            transfer.switch_to(Image::Vm);
            return Ok(vec![FotaReply::request_block(Image::Vm, 0)]);
        }

        let (bc_slot, vm_slot) = (transfer.offer.bc_slot, transfer.offer.vm_slot);
        self.payload_received().await?;
        store.commit(bc_slot, vm_slot)?;
        self.record_persisted().await?;
        Ok(Vec::new())
    }

    /// The whole payload is on the device: consult checkpoint 1
    pub async fn payload_received(&mut self) -> Result<(), FotaError> {
        if self.state() != FotaState::Started {
            return Err(FotaError::NotReady);
        }
        self.consult(Checkpoint::UpdateRecord).await?;
        self.set_state(FotaState::RecordUpdatePending);
        Ok(())
    }

    /// The new record is persisted: consult checkpoint 2 and reset
    pub async fn record_persisted(&mut self) -> Result<(), FotaError> {
        if self.state() != FotaState::RecordUpdatePending {
            return Err(FotaError::NotReady);
        }
        self.consult(Checkpoint::Reset).await?;
        self.set_state(FotaState::ResetPending);
        self.reset_invoked()
    }

    /// The reset primitive ran: the sequence is complete
    pub fn reset_invoked(&mut self) -> Result<(), FotaError> {
        if self.state() != FotaState::ResetPending {
            return Err(FotaError::NotReady);
        }
        if let Some(store) = &self.store {
            info!("FOTA resetting device");
            store.reset()?;
        }
        self.transfer = None;
        self.set_state(FotaState::Done);
        Ok(())
    }

    /// Apply an externally signaled step
    pub async fn advance(&mut self, step: FotaStep) -> Result<(), FotaError> {
        match step {
            FotaStep::PayloadReceived => self.payload_received().await,
            FotaStep::RecordPersisted => self.record_persisted().await,
            FotaStep::ResetInvoked => self.reset_invoked(),
        }
    }
}

impl fmt::Debug for FotaController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FotaController")
            .field("state", &self.state())
            .field("transfer", &self.transfer)
            .field("callback", &self.callback.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Serve update directives for one connection.
///
/// Directives are handled one at a time; the callback may take as long as it
/// needs without holding up the read loop or the heartbeat.
pub async fn run_worker(
    controller: Arc<tokio::sync::Mutex<FotaController>>,
    mut rx: mpsc::Receiver<Envelope>,
    out: mpsc::Sender<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let directive = match FotaDirective::try_from(&envelope) {
            Ok(directive) => directive,
            Err(e) => {
                warn!("Ignoring malformed FOTA directive: {}", e);
                continue;
            }
        };
        let replies = controller.lock().await.handle_directive(directive).await;
        for reply in replies {
            if out.send(reply).await.is_err() {
                debug!("Writer gone, FOTA worker exiting");
                return;
            }
        }
    }
}

#[derive(Debug)]
struct MemoryFlash {
    record: FotaRecord,
    images: HashMap<Image, Vec<u8>>,
    committed: Option<(u32, u32)>,
    accepted: bool,
    resets: u32,
}

/// RAM-backed [`FirmwareStore`] for hosts without flash.
///
/// Digests are CRC-32 in big-endian byte order. A reset switches the
/// record to the committed slots.
#[derive(Debug)]
pub struct MemoryFirmwareStore {
    flash: Mutex<MemoryFlash>,
}

impl MemoryFirmwareStore {
    /// Store whose running firmware is `record`
    pub fn new(record: FotaRecord) -> Self {
        Self {
            flash: Mutex::new(MemoryFlash {
                record,
                images: HashMap::new(),
                committed: None,
                accepted: false,
                resets: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFlash> {
        self.flash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Contents of the prepared slot for `image`
    pub fn image(&self, image: Image) -> Option<Vec<u8>> {
        self.lock().images.get(&image).cloned()
    }

    /// Number of resets requested so far
    pub fn resets(&self) -> u32 {
        self.lock().resets
    }

    /// Whether the running firmware was accepted
    pub fn accepted(&self) -> bool {
        self.lock().accepted
    }

    /// Digest the store would compute over `data`
    pub fn digest(data: &[u8]) -> Vec<u8> {
        crc32fast::hash(data).to_be_bytes().to_vec()
    }
}

impl FirmwareStore for MemoryFirmwareStore {
    fn record(&self) -> Option<FotaRecord> {
        Some(self.lock().record)
    }

    fn accept(&self) -> anyhow::Result<()> {
        self.lock().accepted = true;
        Ok(())
    }

    fn prepare(&self, image: Image, _slot: u32, size: u64) -> anyhow::Result<()> {
        anyhow::ensure!(
            size <= MAX_MEMORY_IMAGE,
            "image of {} bytes exceeds {}",
            size,
            MAX_MEMORY_IMAGE
        );
        self.lock().images.insert(image, vec![0xFF; size as usize]);
        Ok(())
    }

    fn write(&self, image: Image, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut flash = self.lock();
        let slot = flash
            .images
            .get_mut(&image)
            .ok_or_else(|| anyhow::anyhow!("slot for {} not prepared", image.tag()))?;
        let start = usize::try_from(offset)?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= slot.len())
            .ok_or_else(|| anyhow::anyhow!("write past end of {} slot", image.tag()))?;
        slot[start..end].copy_from_slice(data);
        Ok(())
    }

    fn checksum(&self, image: Image, size: u64) -> anyhow::Result<Vec<u8>> {
        let flash = self.lock();
        let slot = flash
            .images
            .get(&image)
            .ok_or_else(|| anyhow::anyhow!("slot for {} not prepared", image.tag()))?;
        let len = usize::try_from(size)?.min(slot.len());
        Ok(Self::digest(&slot[..len]))
    }

    fn commit(&self, bc_slot: u32, vm_slot: u32) -> anyhow::Result<()> {
        self.lock().committed = Some((bc_slot, vm_slot));
        Ok(())
    }

    fn reset(&self) -> anyhow::Result<()> {
        let mut flash = self.lock();
        if let Some((bc_slot, vm_slot)) = flash.committed.take() {
            flash.record.bc_slot = bc_slot;
            flash.record.vm_slot = vm_slot;
            flash.accepted = false;
        }
        flash.resets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adm_wire::EnvelopeKind;
    use serde_json::json;

    fn running() -> FotaRecord {
        FotaRecord {
            valid: true,
            bc_slot: 0,
            vm_slot: 0,
            chunk: 4,
        }
    }

    fn offer(bc_size: u64, vm_size: u64) -> FotaOffer {
        FotaOffer {
            chunk: 4,
            bc_size,
            vm_size,
            bc_slot: 1,
            vm_slot: 1,
        }
    }

    /// Callback that records checkpoints and refuses the configured one
    fn recorder(refuse: Option<Checkpoint>) -> (Arc<dyn FotaCallback>, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let callback: Arc<dyn FotaCallback> = Arc::new(SyncCallback::new(move |cp: Checkpoint| {
            log.lock().unwrap().push(cp.index());
            Some(cp) != refuse
        }));
        (callback, seen)
    }

    fn controller(
        refuse: Option<Checkpoint>,
    ) -> (FotaController, Arc<MemoryFirmwareStore>, Arc<Mutex<Vec<u8>>>) {
        let store = Arc::new(MemoryFirmwareStore::new(running()));
        let (callback, seen) = recorder(refuse);
        let ctrl = FotaController::new(Some(callback), Some(store.clone()));
        (ctrl, store, seen)
    }

    fn reason(env: &Envelope) -> Option<&str> {
        env.field("reason").and_then(|r| r.as_str())
    }

    #[tokio::test]
    async fn test_checkpoint_sequence() {
        let (mut ctrl, _store, seen) = controller(None);

        let replies = ctrl.handle_directive(FotaDirective::Start(offer(8, 0))).await;
        assert_eq!(replies, vec![FotaReply::request_block(Image::Bytecode, 0)]);
        assert_eq!(ctrl.state(), FotaState::Started);
        assert_eq!(*seen.lock().unwrap(), vec![0]);

        ctrl.advance(FotaStep::PayloadReceived).await.unwrap();
        assert_eq!(ctrl.state(), FotaState::RecordUpdatePending);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);

        ctrl.advance(FotaStep::RecordPersisted).await.unwrap();
        assert_eq!(ctrl.state(), FotaState::Done);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_done_rejects_until_abort() {
        let (mut ctrl, _store, _seen) = controller(None);
        ctrl.handle_directive(FotaDirective::Start(offer(8, 0))).await;
        ctrl.payload_received().await.unwrap();
        ctrl.record_persisted().await.unwrap();
        assert_eq!(ctrl.state(), FotaState::Done);

        for directive in [
            FotaDirective::Start(offer(8, 0)),
            FotaDirective::Block {
                image: Image::Bytecode,
                data: vec![0; 4],
            },
            FotaDirective::Confirm { bc_slot: 1, vm_slot: 1 },
        ] {
            let replies = ctrl.handle_directive(directive).await;
            assert_eq!(reason(&replies[0]), Some("busy"));
            assert_eq!(ctrl.state(), FotaState::Done);
        }

        assert!(ctrl.handle_directive(FotaDirective::Abort).await.is_empty());
        assert_eq!(ctrl.state(), FotaState::Idle);
    }

    #[tokio::test]
    async fn test_full_transfer() {
        let (mut ctrl, store, seen) = controller(None);
        let bytecode = b"0123456789".to_vec();
        let vm = b"vmvmvm".to_vec();

        let mut replies = ctrl
            .handle_directive(FotaDirective::Start(offer(bytecode.len() as u64, vm.len() as u64)))
            .await;

        for (image, data) in [(Image::Bytecode, &bytecode), (Image::Vm, &vm)] {
            assert_eq!(replies, vec![FotaReply::request_block(image, 0)]);
            for (idx, block) in data.chunks(4).enumerate() {
                replies = ctrl
                    .handle_directive(FotaDirective::Block {
                        image,
                        data: block.to_vec(),
                    })
                    .await;
                if (idx + 1) * 4 < data.len() {
                    assert_eq!(replies, vec![FotaReply::request_block(image, idx as u32 + 1)]);
                }
            }
            assert_eq!(replies, vec![FotaReply::request_checksum(image)]);
            replies = ctrl
                .handle_directive(FotaDirective::Checksum {
                    image,
                    crc: MemoryFirmwareStore::digest(data),
                })
                .await;
        }

        assert!(replies.is_empty());
        assert_eq!(ctrl.state(), FotaState::Done);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(store.image(Image::Bytecode).unwrap(), bytecode);
        assert_eq!(store.image(Image::Vm).unwrap(), vm);
        assert_eq!(store.resets(), 1);
        let record = store.record().unwrap();
        assert_eq!((record.bc_slot, record.vm_slot), (1, 1));
    }

    #[tokio::test]
    async fn test_callback_refusal() {
        let (mut ctrl, _store, _seen) = controller(Some(Checkpoint::Started));
        let replies = ctrl.handle_directive(FotaDirective::Start(offer(8, 0))).await;
        assert_eq!(reason(&replies[0]), Some("stopped by callback"));
        assert_eq!(ctrl.state(), FotaState::Idle);

        let (mut ctrl, _store, _seen) = controller(Some(Checkpoint::UpdateRecord));
        ctrl.start(offer(8, 0)).await.unwrap();
        assert_eq!(
            ctrl.payload_received().await,
            Err(FotaError::StoppedByCallback)
        );
    }

    #[tokio::test]
    async fn test_bad_checksum_returns_to_idle() {
        let (mut ctrl, _store, _seen) = controller(None);
        ctrl.start(offer(4, 0)).await.unwrap();
        ctrl.handle_directive(FotaDirective::Block {
            image: Image::Bytecode,
            data: b"abcd".to_vec(),
        })
        .await;
        let replies = ctrl
            .handle_directive(FotaDirective::Checksum {
                image: Image::Bytecode,
                crc: vec![0, 0, 0, 0],
            })
            .await;
        assert_eq!(reason(&replies[0]), Some("Bad CRC"));
        assert_eq!(ctrl.state(), FotaState::Idle);
    }

    #[tokio::test]
    async fn test_rejections() {
        let (mut ctrl, _store, seen) = controller(None);
        let mut same_slot = offer(4, 0);
        same_slot.bc_slot = 0;
        let replies = ctrl.handle_directive(FotaDirective::Start(same_slot)).await;
        assert_eq!(reason(&replies[0]), Some("Bad slots"));
        assert!(seen.lock().unwrap().is_empty());

        let replies = ctrl
            .handle_directive(FotaDirective::Block {
                image: Image::Bytecode,
                data: vec![1],
            })
            .await;
        assert_eq!(reason(&replies[0]), Some("not ready"));

        ctrl.start(offer(4, 0)).await.unwrap();
        let replies = ctrl.handle_directive(FotaDirective::Start(offer(4, 0))).await;
        assert_eq!(reason(&replies[0]), Some("busy"));
        assert_eq!(ctrl.state(), FotaState::Started);
    }

    #[tokio::test]
    async fn test_without_store() {
        let mut ctrl = FotaController::new(None, None);
        let replies = ctrl.handle_directive(FotaDirective::Start(offer(4, 0))).await;
        assert_eq!(replies[0].kind, EnvelopeKind::Fota);
        assert_eq!(reason(&replies[0]), Some("OTA unsupported"));
    }

    #[tokio::test]
    async fn test_confirm() {
        let (mut ctrl, _store, _seen) = controller(None);
        let replies = ctrl
            .handle_directive(FotaDirective::Confirm { bc_slot: 0, vm_slot: 0 })
            .await;
        assert_eq!(replies, vec![FotaReply::confirmed()]);

        let replies = ctrl
            .handle_directive(FotaDirective::Confirm { bc_slot: 1, vm_slot: 0 })
            .await;
        assert_eq!(reason(&replies[0]), Some("not ready"));
    }

    #[tokio::test]
    async fn test_worker_replies() {
        let (ctrl, _store, _seen) = controller(None);
        let ctrl = Arc::new(tokio::sync::Mutex::new(ctrl));
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let worker = tokio::spawn(run_worker(ctrl.clone(), rx, out_tx));

        tx.send(Envelope::fota(json!({ "chunk": 4, "bcsize": 4, "vmsize": 0, "bc": 1, "vm": 1 })))
            .await
            .unwrap();
        let reply = out_rx.recv().await.unwrap();
        assert_eq!(reply, FotaReply::request_block(Image::Bytecode, 0));
        assert_eq!(ctrl.lock().await.state(), FotaState::Started);

        drop(tx);
        worker.await.unwrap();
    }
}
