//! Per-transport transaction state shared with the completion path.
//!
//! The transport writes responses through a [`ResponseSink`] from its own
//! execution context. Every delivery stores the message first and signals
//! the completion event second, so a waiter that observed the event sees
//! the stored message.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::sync::{TransactionSync, WaitOutcome};
use crate::transport::TransportError;

#[derive(Debug, Default)]
pub(crate) struct Inbox {
    pub(crate) offer_response: Option<Vec<u8>>,
    pub(crate) payload_responses: VecDeque<Vec<u8>>,
    pub(crate) firmware_versions: Option<Vec<u8>>,
    pub(crate) failure: Option<TransportError>,
}

/// Why [`TransactionContext::wait_for`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    TimedOut,
    Cancelled,
    Failed(TransportError),
}

/// Responses, completion status and events of the transaction in flight.
#[derive(Debug, Default)]
pub struct TransactionContext {
    sync: TransactionSync,
    inbox: Mutex<Inbox>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(&self) -> &TransactionSync {
        &self.sync
    }

    /// Forget the previous offer response and completion status before a new
    /// request goes out. Queued payload responses are kept for the matcher.
    pub fn begin_request(&self) {
        {
            let mut inbox = self.inbox.lock();
            inbox.offer_response = None;
            inbox.firmware_versions = None;
            inbox.failure = None;
        }
        self.sync.reset_completion();
    }

    /// Drop everything, including queued payload responses.
    pub fn reset(&self) {
        *self.inbox.lock() = Inbox::default();
        self.sync.reset_completion();
    }

    pub fn pop_payload_response(&self) -> Option<Vec<u8>> {
        self.inbox.lock().payload_responses.pop_front()
    }

    pub fn payload_queue_is_empty(&self) -> bool {
        self.inbox.lock().payload_responses.is_empty()
    }

    pub fn take_failure(&self) -> Option<TransportError> {
        self.inbox.lock().failure.take()
    }

    pub(crate) fn publish(&self, write: impl FnOnce(&mut Inbox)) {
        {
            let mut inbox = self.inbox.lock();
            write(&mut inbox);
        }
        self.sync.signal_completion();
    }

    /// Wait until `take` finds what it is looking for in the inbox.
    ///
    /// `timeout` bounds the whole wait; `None` waits until the item arrives
    /// or the transaction is cancelled.
    pub(crate) fn wait_for<T>(
        &self,
        timeout: Option<Duration>,
        mut take: impl FnMut(&mut Inbox) -> Option<T>,
    ) -> Result<T, WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.sync.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            {
                let mut inbox = self.inbox.lock();
                if let Some(item) = take(&mut inbox) {
                    return Ok(item);
                }
                if let Some(failure) = inbox.failure.take() {
                    return Err(WaitError::Failed(failure));
                }
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(WaitError::TimedOut);
            }
            match self.sync.wait(remaining) {
                WaitOutcome::Completed => continue,
                WaitOutcome::Cancelled => return Err(WaitError::Cancelled),
                WaitOutcome::TimedOut => return Err(WaitError::TimedOut),
            }
        }
    }
}

/// Handle through which a transport delivers device responses.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    ctx: Arc<TransactionContext>,
}

impl ResponseSink {
    pub fn new(ctx: Arc<TransactionContext>) -> Self {
        Self { ctx }
    }

    /// Offer, offer information and offer command responses (message body only).
    pub fn deliver_offer_response(&self, data: &[u8]) {
        self.ctx
            .publish(|inbox| inbox.offer_response = Some(data.to_vec()));
    }

    /// Content responses; several may queue up before the engine wakes.
    pub fn deliver_payload_response(&self, data: &[u8]) {
        self.ctx
            .publish(|inbox| inbox.payload_responses.push_back(data.to_vec()));
    }

    pub fn deliver_firmware_versions(&self, data: &[u8]) {
        self.ctx
            .publish(|inbox| inbox.firmware_versions = Some(data.to_vec()));
    }

    /// The transport failed to receive; wakes the waiter with the error.
    pub fn deliver_failure(&self, error: TransportError) {
        self.ctx.publish(|inbox| inbox.failure = Some(error));
    }
}
