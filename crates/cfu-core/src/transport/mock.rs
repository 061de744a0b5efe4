//! Simulated CFU device for testing.
//!
//! Responses are delivered synchronously through the bound sink from inside
//! the `*_send` call, which is indistinguishable for the engine from a fast
//! device answering on another thread.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::traits::{TransportBinding, TransportError, TransportParameters};
use crate::protocol::{
    FirmwareVersions, OfferMessage, OfferResponse, OfferStatus, PayloadResponse, PayloadStatus,
    RejectReason, TransferChunk,
};
use crate::transaction::ResponseSink;

/// How the simulated device reacts to one content request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadAction {
    /// Answer with this status.
    Respond(PayloadStatus),
    /// Accept the chunk but never answer.
    Drop,
    /// Retransmit `count` earlier responses before the real one.
    Stale(u16),
    /// Answer with the next sequence number instead.
    Ahead,
    /// Fail the send itself.
    SendFailure(TransportError),
    /// Report a receive failure through the completion path and drop off
    /// the bus until [`MockTransport::reconnect`].
    Disconnect,
}

#[derive(Debug)]
struct DeviceState {
    params: TransportParameters,
    sink: Option<ResponseSink>,
    offer_replies: VecDeque<Option<OfferResponse>>,
    command_replies: VecDeque<Option<OfferResponse>>,
    information_replies: VecDeque<Option<OfferResponse>>,
    payload_actions: HashMap<u16, PayloadAction>,
    versions: FirmwareVersions,
    offers: Vec<OfferMessage>,
    chunks: Vec<TransferChunk>,
    image: BTreeMap<u32, u8>,
    sessions_started: u32,
    sessions_stopped: u32,
    connected: bool,
}

/// Mock transport implementing a scripted CFU device.
///
/// Unscripted offers are accepted, offer commands answer `CommandReady` and
/// every chunk is acknowledged with `Success`. Scripted payload actions are
/// keyed by sequence number and consumed on first use, so a resent chunk
/// behaves normally.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<DeviceState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_parameters(TransportParameters::default())
    }

    pub fn with_parameters(params: TransportParameters) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                params,
                sink: None,
                offer_replies: VecDeque::new(),
                command_replies: VecDeque::new(),
                information_replies: VecDeque::new(),
                payload_actions: HashMap::new(),
                versions: FirmwareVersions::default(),
                offers: Vec::new(),
                chunks: Vec::new(),
                image: BTreeMap::new(),
                sessions_started: 0,
                sessions_stopped: 0,
                connected: true,
            })),
        }
    }

    /// Queue the answer to the next component offer.
    pub fn queue_offer_response(&self, status: OfferStatus, reason: RejectReason) {
        self.state
            .lock()
            .offer_replies
            .push_back(Some(OfferResponse::new(status, reason)));
    }

    /// Leave the next component offer unanswered.
    pub fn queue_offer_silence(&self) {
        self.state.lock().offer_replies.push_back(None);
    }

    /// Queue the answer to the next offer command.
    pub fn queue_command_response(&self, status: OfferStatus) {
        self.state
            .lock()
            .command_replies
            .push_back(Some(OfferResponse::new(status, RejectReason::OldFirmware)));
    }

    /// Leave the next offer command unanswered.
    pub fn queue_command_silence(&self) {
        self.state.lock().command_replies.push_back(None);
    }

    /// Queue the answer to the next offer information record.
    pub fn queue_information_response(&self, status: OfferStatus) {
        self.state
            .lock()
            .information_replies
            .push_back(Some(OfferResponse::new(status, RejectReason::OldFirmware)));
    }

    /// React to the next chunk carrying `sequence_number` with `action`.
    pub fn script_payload(&self, sequence_number: u16, action: PayloadAction) {
        self.state
            .lock()
            .payload_actions
            .insert(sequence_number, action);
    }

    pub fn set_versions(&self, versions: FirmwareVersions) {
        self.state.lock().versions = versions;
    }

    /// Every offer-channel message received, in order.
    pub fn offers(&self) -> Vec<OfferMessage> {
        self.state.lock().offers.clone()
    }

    /// Every content request received, in order, including unanswered ones.
    pub fn chunks(&self) -> Vec<TransferChunk> {
        self.state.lock().chunks.clone()
    }

    pub fn clear_chunks(&self) {
        self.state.lock().chunks.clear();
    }

    /// Bytes the device acknowledged, by address. A `FirstBlock` chunk
    /// starts a fresh image.
    pub fn written_image(&self) -> BTreeMap<u32, u8> {
        self.state.lock().image.clone()
    }

    pub fn sessions_started(&self) -> u32 {
        self.state.lock().sessions_started
    }

    pub fn sessions_stopped(&self) -> u32 {
        self.state.lock().sessions_stopped
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.state.lock().connected = true;
    }

    fn sink(state: &DeviceState) -> Result<ResponseSink, TransportError> {
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.sink.clone().ok_or(TransportError::NotBound)
    }

    fn read_offer(buffer: &[u8], header_len: usize) -> Result<OfferMessage, TransportError> {
        let body = buffer.get(header_len..).unwrap_or_default();
        OfferMessage::from_bytes(body.get(..OfferMessage::SIZE).unwrap_or(body))
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn answer_offer(
        &self,
        buffer: &[u8],
        header_len: usize,
        queue: fn(&mut DeviceState) -> &mut VecDeque<Option<OfferResponse>>,
        default_status: OfferStatus,
    ) -> Result<(), TransportError> {
        let (sink, reply) = {
            let mut state = self.state.lock();
            let sink = Self::sink(&state)?;
            let offer = Self::read_offer(buffer, header_len)?;
            state.offers.push(offer);
            let reply = queue(&mut state)
                .pop_front()
                .unwrap_or(Some(OfferResponse::new(
                    default_status,
                    RejectReason::OldFirmware,
                )))
                .map(|mut rsp| {
                    rsp.token = offer.token();
                    rsp
                });
            (sink, reply)
        };
        match reply {
            Some(rsp) => {
                trace!(status = %rsp.status, "Mock answering offer");
                sink.deliver_offer_response(&rsp.to_bytes());
            }
            None => debug!("Mock leaving offer unanswered"),
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBinding for MockTransport {
    fn bind(&self, sink: ResponseSink) -> Result<TransportParameters, TransportError> {
        let mut state = self.state.lock();
        state.sink = Some(sink);
        Ok(state.params)
    }

    fn unbind(&self) {
        self.state.lock().sink = None;
    }

    fn protocol_start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::sink(&state)?;
        state.sessions_started += 1;
        Ok(())
    }

    fn protocol_stop(&self) -> Result<(), TransportError> {
        self.state.lock().sessions_stopped += 1;
        Ok(())
    }

    fn offer_send(&self, buffer: &mut [u8], header_len: usize) -> Result<(), TransportError> {
        self.answer_offer(buffer, header_len, |s| &mut s.offer_replies, OfferStatus::Accept)
    }

    fn offer_command_send(
        &self,
        buffer: &mut [u8],
        header_len: usize,
    ) -> Result<(), TransportError> {
        self.answer_offer(
            buffer,
            header_len,
            |s| &mut s.command_replies,
            OfferStatus::CommandReady,
        )
    }

    fn offer_information_send(
        &self,
        buffer: &mut [u8],
        header_len: usize,
    ) -> Result<(), TransportError> {
        self.answer_offer(
            buffer,
            header_len,
            |s| &mut s.information_replies,
            OfferStatus::Accept,
        )
    }

    fn payload_send(&self, buffer: &mut [u8], header_len: usize) -> Result<(), TransportError> {
        let (sink, chunk, action) = {
            let mut state = self.state.lock();
            let sink = Self::sink(&state)?;
            let body = buffer.get(header_len..).unwrap_or_default();
            let chunk = TransferChunk::from_bytes(body)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
            let action = state
                .payload_actions
                .remove(&chunk.sequence_number)
                .unwrap_or(PayloadAction::Respond(PayloadStatus::Success));
            if let PayloadAction::SendFailure(e) = action {
                return Err(e);
            }
            if matches!(action, PayloadAction::Disconnect) {
                state.connected = false;
            }
            state.chunks.push(chunk.clone());
            if matches!(action, PayloadAction::Respond(PayloadStatus::Success) | PayloadAction::Stale(_))
            {
                if chunk.is_first_block() {
                    state.image.clear();
                }
                for (i, byte) in chunk.data.iter().enumerate() {
                    state.image.insert(chunk.address.wrapping_add(i as u32), *byte);
                }
            }
            (sink, chunk, action)
        };

        let seq = chunk.sequence_number;
        trace!(sequence_number = seq, len = chunk.data.len(), action = ?action, "Mock received chunk");
        match action {
            PayloadAction::Respond(status) => {
                sink.deliver_payload_response(&PayloadResponse::new(seq, status).to_bytes());
            }
            PayloadAction::Drop => {}
            PayloadAction::Stale(count) => {
                for back in (1..=count).rev() {
                    let old = seq.wrapping_sub(back);
                    sink.deliver_payload_response(
                        &PayloadResponse::new(old, PayloadStatus::Success).to_bytes(),
                    );
                }
                sink.deliver_payload_response(
                    &PayloadResponse::new(seq, PayloadStatus::Success).to_bytes(),
                );
            }
            PayloadAction::Ahead => {
                sink.deliver_payload_response(
                    &PayloadResponse::new(seq.wrapping_add(1), PayloadStatus::Success).to_bytes(),
                );
            }
            PayloadAction::Disconnect => sink.deliver_failure(TransportError::Disconnected),
            PayloadAction::SendFailure(_) => {}
        }
        Ok(())
    }

    fn firmware_version_get(&self) -> Result<(), TransportError> {
        let (sink, report) = {
            let state = self.state.lock();
            (Self::sink(&state)?, state.versions.to_bytes())
        };
        sink.deliver_firmware_versions(&report);
        Ok(())
    }
}
