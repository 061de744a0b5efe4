//! Correlates content responses with the chunk just sent.

use std::time::Duration;

use tracing::{trace, warn};

use super::context::TransactionContext;
use super::sync::WaitOutcome;
use crate::error::EngineError;
use crate::protocol::PayloadResponse;
use crate::protocol::constants::MAX_RESPONSE_ATTEMPTS;

/// Whether `received` lies behind `expected` in sequence space.
///
/// Sequence numbers wrap, so "behind" means within half the space before
/// `expected`.
pub fn is_stale(received: u16, expected: u16) -> bool {
    let distance = expected.wrapping_sub(received);
    distance != 0 && distance < 0x8000
}

/// Waits for and validates the response to one content chunk.
#[derive(Debug)]
pub struct ResponseMatcher<'a> {
    ctx: &'a TransactionContext,
    timeout: Duration,
    max_attempts: u32,
}

impl<'a> ResponseMatcher<'a> {
    pub fn new(ctx: &'a TransactionContext, timeout: Duration) -> Self {
        Self {
            ctx,
            timeout,
            max_attempts: MAX_RESPONSE_ATTEMPTS,
        }
    }

    /// Return the response carrying `expected`.
    ///
    /// Older sequence numbers are device retransmissions and are dropped.
    /// Everything queued is drained before waiting again, and only the waits
    /// count against the attempt bound. A newer sequence number is fatal. A
    /// wait that times out is reported as [`EngineError::Timeout`] straight
    /// away.
    pub fn await_and_match(&self, expected: u16) -> Result<PayloadResponse, EngineError> {
        let mut attempts = 0u32;
        loop {
            if self.ctx.sync().is_cancelled() {
                return Err(EngineError::Aborted);
            }

            // Anything delivered from here on is either drained below or
            // wakes the wait.
            self.ctx.sync().reset_completion();
            while let Some(raw) = self.ctx.pop_payload_response() {
                let response = PayloadResponse::from_bytes(&raw)?;
                if response.sequence_number == expected {
                    trace!(
                        sequence_number = expected,
                        status = %response.status,
                        attempts,
                        "Response matched"
                    );
                    return Ok(response);
                }
                if !is_stale(response.sequence_number, expected) {
                    return Err(EngineError::SequenceAhead {
                        expected,
                        received: response.sequence_number,
                    });
                }
                warn!(
                    expected,
                    received = response.sequence_number,
                    "Discarding stale response"
                );
            }

            if let Some(failure) = self.ctx.take_failure() {
                return Err(EngineError::Transport(failure));
            }
            if attempts >= self.max_attempts {
                return Err(EngineError::SequenceNeverMatched { expected, attempts });
            }

            match self.ctx.sync().wait(Some(self.timeout)) {
                WaitOutcome::Completed => attempts += 1,
                WaitOutcome::Cancelled => return Err(EngineError::Aborted),
                WaitOutcome::TimedOut => {
                    return Err(EngineError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
            }
        }
    }
}
