//! Protocol engine: drives a full CFU transaction over a bound transport.
//!
//! A transaction opens a session, optionally frames the offer list with
//! offer information records, then for each component offers it and, once
//! accepted, streams its payload chunk by chunk. An interrupted transfer
//! leaves a checkpoint behind so the next transaction can pick it up.

pub mod offer;
pub mod state;

use std::sync::Arc;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{CfuEvent, CfuObserver, TracingObserver};
use crate::payload::{ChunkCursor, PayloadChunker, RecordError};
use crate::protocol::constants::{FIRST_SEQUENCE_NUMBER, MAX_BUSY_RETRIES};
use crate::protocol::{
    FirmwareVersions, OfferCommandCode, OfferInformationCode, OfferMessage, OfferResponse,
    OfferStatus, next_sequence_number,
};
use crate::resume::{
    CheckpointField, CheckpointStore, MemoryStore, ResumeCheckpoint, ResumeStore, StoreError,
    UpdateStatus,
};
use crate::transaction::{ResponseMatcher, ResponseSink, TransactionContext};
use crate::transport::{TransportBinding, TransportParameters};

pub use offer::{OfferExchange, OfferKind, classify_offer_response};
pub use state::{EnginePhase, PhaseTracker};

/// Supplies the offer and payload of every component to update.
///
/// Called lazily, once per component, while the transaction runs.
pub trait FirmwareSource: Send + Sync {
    fn component_count(&self) -> usize;

    /// The 16-byte offer of component `index`.
    fn offer(&self, index: usize) -> anyhow::Result<Arc<[u8]>>;

    /// The BinRecord-encoded payload of component `index`.
    fn payload(&self, index: usize) -> anyhow::Result<Arc<[u8]>>;
}

/// Offers and payloads held in memory.
#[derive(Debug, Clone, Default)]
pub struct FirmwareImages {
    components: Vec<(Arc<[u8]>, Arc<[u8]>)>,
}

impl FirmwareImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offer: impl Into<Arc<[u8]>>, payload: impl Into<Arc<[u8]>>) {
        self.components.push((offer.into(), payload.into()));
    }

    /// Read an offer file and its payload file.
    pub fn push_files<P: AsRef<std::path::Path>>(
        &mut self,
        offer_path: P,
        payload_path: P,
    ) -> anyhow::Result<()> {
        use anyhow::Context;
        let offer = std::fs::read(offer_path.as_ref())
            .with_context(|| format!("reading offer {}", offer_path.as_ref().display()))?;
        let payload = std::fs::read(payload_path.as_ref())
            .with_context(|| format!("reading payload {}", payload_path.as_ref().display()))?;
        self.push(offer, payload);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl FirmwareSource for FirmwareImages {
    fn component_count(&self) -> usize {
        self.components.len()
    }

    fn offer(&self, index: usize) -> anyhow::Result<Arc<[u8]>> {
        self.components
            .get(index)
            .map(|(offer, _)| Arc::clone(offer))
            .ok_or_else(|| anyhow::anyhow!("no component at index {index}"))
    }

    fn payload(&self, index: usize) -> anyhow::Result<Arc<[u8]>> {
        self.components
            .get(index)
            .map(|(_, payload)| Arc::clone(payload))
            .ok_or_else(|| anyhow::anyhow!("no component at index {index}"))
    }
}

/// One component as the engine sends it.
#[derive(Debug, Clone)]
pub struct FirmwareComponent {
    pub index: usize,
    pub offer: OfferMessage,
    pub payload: Arc<[u8]>,
}

impl FirmwareComponent {
    /// Fetch component `index`, copying the payload into engine-owned
    /// storage when `copy` is set.
    pub fn load(source: &dyn FirmwareSource, index: usize, copy: bool) -> Result<Self, EngineError> {
        let source_error = |e: anyhow::Error| EngineError::Source {
            index,
            message: format!("{e:#}"),
        };
        let offer_bytes = source.offer(index).map_err(source_error)?;
        let offer = OfferMessage::from_bytes(&offer_bytes)
            .map_err(|source| EngineError::InvalidOffer { index, source })?;
        let mut payload = source.payload(index).map_err(source_error)?;
        if copy {
            payload = Arc::from(payload.to_vec());
        }
        Ok(Self {
            index,
            offer,
            payload,
        })
    }

    pub fn component_id(&self) -> u8 {
        self.offer.component_id()
    }
}

/// What a successful component update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSummary {
    pub component_id: u8,
    /// Chunks acknowledged in this run.
    pub chunks: u32,
    pub resumed_from: Option<ResumeCheckpoint>,
}

/// Outcome of one component within a transaction.
#[derive(Debug)]
pub struct ComponentReport {
    pub index: usize,
    /// Known once the offer has been read.
    pub component_id: Option<u8>,
    pub result: Result<ComponentSummary, EngineError>,
}

impl ComponentReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Cancels the engine's transaction from another thread.
#[derive(Clone)]
pub struct StopHandle {
    ctx: Arc<TransactionContext>,
    transport: Arc<dyn TransportBinding>,
}

impl StopHandle {
    /// Release any waiter and ask the transport to close the session. The
    /// engine returns [`EngineError::Aborted`] from whatever it was doing
    /// and leaves the transport alone when it stops the transaction.
    pub fn stop(&self) {
        info!("Stop requested");
        self.ctx.sync().signal_cancellation();
        if let Err(e) = self.transport.protocol_stop() {
            warn!(error = %e, "Transport failed to stop session");
        }
    }
}

/// Drives CFU transactions over one bound transport.
pub struct ProtocolEngine {
    transport: Arc<dyn TransportBinding>,
    ctx: Arc<TransactionContext>,
    params: TransportParameters,
    chunker: PayloadChunker,
    config: EngineConfig,
    store: ResumeStore,
    observer: Arc<dyn CfuObserver>,
    phase: PhaseTracker,
}

impl ProtocolEngine {
    /// Bind `transport` and validate the parameters it negotiates.
    /// Checkpoints go to an in-memory store until
    /// [`with_checkpoint_store`](Self::with_checkpoint_store) is called.
    pub fn new(transport: Arc<dyn TransportBinding>, config: EngineConfig) -> Result<Self, EngineError> {
        let ctx = Arc::new(TransactionContext::new());
        let params = transport.bind(ResponseSink::new(Arc::clone(&ctx)))?;

        let chunker = params.validate().map_err(EngineError::from).and_then(|()| {
            PayloadChunker::new(
                params.payload_buffer_size,
                params.header_size,
                params.payload_fill_alignment,
            )
            .map_err(EngineError::from)
        });
        let chunker = match chunker {
            Ok(chunker) => chunker,
            Err(e) => {
                transport.unbind();
                return Err(e);
            }
        };

        info!(
            header_size = params.header_size,
            payload_buffer_size = params.payload_buffer_size,
            capacity = chunker.capacity(),
            alignment = chunker.alignment(),
            wait_timeout_ms = params.wait_timeout_ms,
            "Transport bound"
        );

        let store = ResumeStore::new(Box::new(MemoryStore::new()), config.instance_id.clone());
        Ok(Self {
            transport,
            ctx,
            params,
            chunker,
            config,
            store,
            observer: Arc::new(TracingObserver),
            phase: PhaseTracker::new(),
        })
    }

    /// Persist checkpoints and statuses in `backend`, namespaced by the
    /// configured instance id.
    pub fn with_checkpoint_store(mut self, backend: Box<dyn CheckpointStore>) -> Self {
        self.store = ResumeStore::new(backend, self.config.instance_id.clone());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CfuObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn parameters(&self) -> &TransportParameters {
        &self.params
    }

    pub fn chunker(&self) -> &PayloadChunker {
        &self.chunker
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase.phase()
    }

    pub fn store(&self) -> &ResumeStore {
        &self.store
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            ctx: Arc::clone(&self.ctx),
            transport: Arc::clone(&self.transport),
        }
    }

    fn goto(&mut self, to: EnginePhase) -> Result<(), EngineError> {
        let from = self.phase.goto(to)?;
        if from != to {
            self.observer.on_event(&CfuEvent::PhaseChanged { from, to });
        }
        Ok(())
    }

    fn exchange(&self) -> OfferExchange<'_> {
        OfferExchange::new(
            self.transport.as_ref(),
            &self.ctx,
            &self.params,
            self.config.host_token,
        )
    }

    /// Open a protocol session.
    pub fn protocol_start(&mut self) -> Result<(), EngineError> {
        self.goto(EnginePhase::TransactionStarted)?;
        self.ctx.sync().clear_cancellation();
        self.ctx.reset();
        if let Err(e) = self.transport.protocol_start() {
            self.goto(EnginePhase::Idle)?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the session and release any waiter. Does nothing when idle.
    pub fn protocol_stop(&mut self) -> Result<(), EngineError> {
        if self.phase() == EnginePhase::Idle {
            return Ok(());
        }
        if self.phase().is_active() {
            self.goto(EnginePhase::TransactionStopped)?;
        }
        // Set only by a stop handle, which has already stopped the transport.
        let stopped_externally = self.ctx.sync().is_cancelled();
        self.ctx.sync().signal_cancellation();
        let stopped = if stopped_externally {
            debug!("Session already stopped");
            Ok(())
        } else {
            self.transport.protocol_stop()
        };
        self.goto(EnginePhase::Idle)?;
        stopped.map_err(EngineError::from)
    }

    /// Query the versions of the firmware running on the device.
    pub fn firmware_versions(&self) -> Result<FirmwareVersions, EngineError> {
        if !self.phase().is_active() {
            // A previous stop leaves cancellation set.
            self.ctx.sync().clear_cancellation();
        }
        let timeout = Some(self.params.wait_timeout());
        self.ctx.begin_request();
        self.transport.firmware_version_get()?;
        let raw = self
            .ctx
            .wait_for(timeout, |inbox| inbox.firmware_versions.take())
            .map_err(|e| offer::wait_error(e, timeout))?;
        let versions = FirmwareVersions::from_bytes(&raw)?;
        debug!(
            components = versions.components.len(),
            protocol_revision = versions.protocol_revision,
            "Firmware versions"
        );
        Ok(versions)
    }

    /// Update every component `source` provides, in order.
    ///
    /// Returns one report per attempted component. Errors outside any
    /// component (session start, offer information records) fail the call.
    #[instrument(skip(self, source), fields(components = source.component_count()))]
    pub fn update_all(
        &mut self,
        source: &dyn FirmwareSource,
    ) -> Result<Vec<ComponentReport>, EngineError> {
        self.protocol_start()?;
        let outcome = self.run_offer_list(source);
        if let Err(e) = self.protocol_stop() {
            warn!(error = %e, "Failed to stop session");
        }
        let reports = outcome?;
        self.observer.on_event(&CfuEvent::Complete);
        Ok(reports)
    }

    fn run_offer_list(&mut self, source: &dyn FirmwareSource) -> Result<Vec<ComponentReport>, EngineError> {
        if self.config.query_firmware_version {
            self.record_running_versions()?;
        }
        if self.config.send_offer_information {
            let exchange = self.exchange();
            exchange.send_offer_information(OfferInformationCode::StartEntireTransaction)?;
            exchange.send_offer_information(OfferInformationCode::StartOfferList)?;
        }

        let mut reports = Vec::with_capacity(source.component_count());
        for index in 0..source.component_count() {
            let report = self.update_component(source, index);
            let halt = match &report.result {
                Ok(_) => false,
                Err(EngineError::Aborted) => true,
                Err(_) => !self.config.continue_on_component_failure,
            };
            reports.push(report);
            if halt {
                break;
            }
        }

        if self.config.send_offer_information && !self.ctx.sync().is_cancelled() {
            if let Err(e) = self
                .exchange()
                .send_offer_information(OfferInformationCode::EndOfferList)
            {
                warn!(error = %e, "End of offer list not accepted");
            }
        }
        Ok(reports)
    }

    fn record_running_versions(&self) -> Result<(), EngineError> {
        match self.firmware_versions() {
            Ok(versions) => {
                for component in &versions.components {
                    self.observer.on_event(&CfuEvent::VersionReported {
                        component_id: component.component_id,
                        version: component.version,
                    });
                    self.best_effort(
                        self.store.set(
                            component.component_id,
                            CheckpointField::CurrentFwVersion,
                            component.version,
                        ),
                        "current firmware version",
                    );
                }
                Ok(())
            }
            Err(EngineError::Aborted) => Err(EngineError::Aborted),
            Err(e) => {
                warn!(error = %e, "Firmware version query failed");
                Ok(())
            }
        }
    }

    /// Offer component `index` and, once accepted, send its payload.
    /// Requires an open session.
    pub fn update_component(&mut self, source: &dyn FirmwareSource, index: usize) -> ComponentReport {
        let mut component_id = None;
        let result = self.try_update_component(source, index, &mut component_id);
        if let Err(e) = &result {
            if self.phase().is_active() && self.phase() != EnginePhase::Failed {
                if let Err(goto) = self.goto(EnginePhase::Failed) {
                    debug!(error = %goto, "Could not mark component failed");
                }
            }
            self.observer.on_event(&CfuEvent::ComponentFailed {
                index,
                message: e.to_string(),
            });
        }
        ComponentReport {
            index,
            component_id,
            result,
        }
    }

    fn try_update_component(
        &mut self,
        source: &dyn FirmwareSource,
        index: usize,
        component_id: &mut Option<u8>,
    ) -> Result<ComponentSummary, EngineError> {
        self.goto(EnginePhase::OfferExchanging)?;
        let component =
            FirmwareComponent::load(source, index, self.config.firmware_buffers_not_persistent)?;
        let id = component.component_id();
        *component_id = Some(id);

        let version = component.offer.firmware_version();
        self.best_effort(
            self.store.set(id, CheckpointField::OfferFwVersion, version),
            "offer version",
        );
        self.observer.on_event(&CfuEvent::OfferSent {
            component_id: id,
            version,
        });

        if let Err(e) = self.offer_component(&component) {
            self.record_offer_failure(id, &e);
            return Err(e);
        }
        self.record_status(id, UpdateStatus::OfferAccepted);

        self.goto(EnginePhase::PayloadSending)?;
        let resumed_from = self.starting_checkpoint(&component);
        let chunks = self.send_payload(&component, resumed_from)?;

        self.best_effort(self.store.clear(id), "checkpoint disarm");
        if self.config.clear_status_on_success {
            self.store.clear_update_status(id);
        } else {
            self.record_status(id, UpdateStatus::Succeeded);
        }
        self.observer.on_event(&CfuEvent::ComponentComplete {
            component_id: id,
            chunks,
        });
        Ok(ComponentSummary {
            component_id: id,
            chunks,
            resumed_from,
        })
    }

    /// Offer until accepted. A busy device gets a `NotifyOnReady` command
    /// and the offer is repeated, a bounded number of times.
    fn offer_component(&self, component: &FirmwareComponent) -> Result<OfferResponse, EngineError> {
        let id = component.component_id();
        let mut busy = 0u32;
        loop {
            let result = self.exchange().send_offer(
                &component.offer,
                self.config.force_immediate_reset,
                self.config.force_ignore_version,
            );
            match result {
                Ok(response) => {
                    self.observer.on_event(&CfuEvent::OfferAnswered {
                        component_id: id,
                        status: response.status,
                        reason: response.reject_reason,
                    });
                    if response.status != OfferStatus::Accept {
                        return Err(EngineError::UnexpectedOfferStatus {
                            status: response.status,
                        });
                    }
                    return Ok(response);
                }
                Err(EngineError::UnexpectedOfferStatus {
                    status: OfferStatus::Busy,
                }) if busy < MAX_BUSY_RETRIES => {
                    busy += 1;
                    self.observer.on_event(&CfuEvent::DeviceBusy {
                        component_id: id,
                        attempt: busy,
                    });
                    self.exchange()
                        .send_offer_command(OfferCommandCode::NotifyOnReady)?;
                }
                Err(e) => {
                    if let EngineError::OfferRejected { status, reason, .. } = &e {
                        self.observer.on_event(&CfuEvent::OfferAnswered {
                            component_id: id,
                            status: *status,
                            reason: *reason,
                        });
                    }
                    return Err(e);
                }
            }
        }
    }

    /// An armed checkpoint that fits this payload, disarmed before anything
    /// is sent. Without resume support any stored checkpoint is disarmed,
    /// since the full transfer that follows supersedes it.
    fn starting_checkpoint(&self, component: &FirmwareComponent) -> Option<ResumeCheckpoint> {
        let component_id = component.component_id();
        if !self.config.support_resume_on_connect {
            self.best_effort(self.store.clear(component_id), "checkpoint disarm");
            return None;
        }
        match self.store.take(component_id) {
            Ok(Some(checkpoint)) => {
                if let Err(e) = checkpoint.cursor.validate(&component.payload) {
                    warn!(
                        component_id,
                        record_index = checkpoint.cursor.bin_record_start_index,
                        data_offset = checkpoint.cursor.bin_record_data_offset,
                        error = %e,
                        "Checkpoint does not fit the payload, starting over"
                    );
                    return None;
                }
                self.observer.on_event(&CfuEvent::Resumed {
                    component_id,
                    checkpoint,
                });
                Some(checkpoint)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(component_id, error = %e, "Ignoring unreadable checkpoint");
                None
            }
        }
    }

    fn send_payload(
        &self,
        component: &FirmwareComponent,
        start: Option<ResumeCheckpoint>,
    ) -> Result<u32, EngineError> {
        let id = component.component_id();
        let payload: &[u8] = &component.payload;
        if payload.is_empty() {
            self.record_status(id, UpdateStatus::PayloadFailed);
            return Err(RecordError::TruncatedHeader {
                offset: 0,
                remaining: 0,
            }
            .into());
        }

        let (mut cursor, mut sequence_number) = start.map_or(
            (ChunkCursor::default(), FIRST_SEQUENCE_NUMBER),
            |checkpoint| (checkpoint.cursor, checkpoint.sequence_number),
        );
        // Responses left over from an earlier exchange must not match.
        self.ctx.reset();

        let header = self.params.header_size;
        let mut buffer = vec![0u8; self.params.payload_buffer_size];
        let matcher = ResponseMatcher::new(&self.ctx, self.params.wait_timeout());
        let total = payload.len() as u64;
        let mut chunks = 0u32;

        while !cursor.is_done(payload) {
            if self.ctx.sync().is_cancelled() {
                return Err(EngineError::Aborted);
            }

            let before = cursor;
            let chunk = match self.chunker.fill(payload, sequence_number, &mut cursor) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.record_status(id, UpdateStatus::PayloadFailed);
                    return Err(e.into());
                }
            };
            buffer.fill(0);
            chunk.write_to(&mut buffer[header..])?;
            trace!(
                sequence_number,
                address = %format!("0x{:08X}", chunk.address),
                len = chunk.data.len(),
                flags = %format!("0x{:02X}", chunk.flags),
                "Sending chunk"
            );

            if let Err(e) = self.transport.payload_send(&mut buffer, header) {
                return Err(self.interrupted(id, before, sequence_number, e.into()));
            }

            match matcher.await_and_match(sequence_number) {
                Ok(response) if response.status.is_success() => {}
                Ok(response) => {
                    self.record_status(id, UpdateStatus::PayloadFailed);
                    return Err(EngineError::PayloadRejected {
                        component_id: id,
                        sequence_number,
                        status: response.status,
                    });
                }
                Err(e) if e.is_io_interruption() => {
                    return Err(self.interrupted(id, before, sequence_number, e));
                }
                Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                Err(e) => {
                    self.record_status(id, UpdateStatus::PayloadFailed);
                    return Err(e);
                }
            }

            chunks += 1;
            self.observer.on_event(&CfuEvent::Progress {
                component_id: id,
                sequence_number,
                current: u64::from(cursor.bin_record_start_index).min(total),
                total,
            });
            sequence_number = next_sequence_number(sequence_number);
        }

        Ok(chunks)
    }

    /// Save where the unacknowledged chunk started so it is resent on resume.
    fn interrupted(
        &self,
        component_id: u8,
        cursor: ChunkCursor,
        sequence_number: u16,
        source: EngineError,
    ) -> EngineError {
        let checkpoint = ResumeCheckpoint::new(cursor, sequence_number);
        match self.store.save(component_id, &checkpoint) {
            Ok(()) => {
                self.record_status(component_id, UpdateStatus::Interrupted);
                self.observer.on_event(&CfuEvent::CheckpointSaved {
                    component_id,
                    checkpoint,
                });
                EngineError::Interrupted {
                    component_id,
                    checkpoint,
                    source: Box::new(source),
                }
            }
            Err(store) => {
                error!(component_id, error = %store, "Checkpoint lost");
                EngineError::CheckpointLost {
                    component_id,
                    interruption: Box::new(source),
                    store,
                }
            }
        }
    }

    fn record_offer_failure(&self, component_id: u8, error: &EngineError) {
        if let EngineError::OfferRejected { status, reason, .. } = error {
            let status = match status {
                OfferStatus::Skip => UpdateStatus::OfferSkipped,
                _ => UpdateStatus::OfferRejected,
            };
            self.best_effort(
                self.store.set_update_status(component_id, status, Some(*reason)),
                "update status",
            );
        }
    }

    fn record_status(&self, component_id: u8, status: UpdateStatus) {
        self.best_effort(
            self.store.set_update_status(component_id, status, None),
            "update status",
        );
    }

    fn best_effort(&self, result: Result<(), StoreError>, what: &str) {
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist {}", what);
        }
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.ctx.sync().signal_cancellation();
        self.transport.unbind();
    }
}
