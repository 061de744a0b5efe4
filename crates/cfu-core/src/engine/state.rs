//! Engine phase tracking.

use std::fmt;

use crate::error::EngineError;

/// Phases of a protocol transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePhase {
    /// No transaction.
    #[default]
    Idle,
    /// Session open on the transport.
    TransactionStarted,
    /// Offering a component.
    OfferExchanging,
    /// Sending the accepted component's payload.
    PayloadSending,
    /// Session closed, stop not yet acknowledged.
    TransactionStopped,
    /// The current component failed.
    Failed,
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnginePhase::Idle => write!(f, "IDLE"),
            EnginePhase::TransactionStarted => write!(f, "TRANSACTION_STARTED"),
            EnginePhase::OfferExchanging => write!(f, "OFFER_EXCHANGING"),
            EnginePhase::PayloadSending => write!(f, "PAYLOAD_SENDING"),
            EnginePhase::TransactionStopped => write!(f, "TRANSACTION_STOPPED"),
            EnginePhase::Failed => write!(f, "FAILED"),
        }
    }
}

impl EnginePhase {
    /// Whether a transaction is open.
    pub fn is_active(&self) -> bool {
        !matches!(self, EnginePhase::Idle | EnginePhase::TransactionStopped)
    }

    pub fn can_transition_to(&self, to: EnginePhase) -> bool {
        use EnginePhase::*;
        match (self, to) {
            // Stop requests leave from anywhere.
            (_, Idle) => true,
            (Idle, TransactionStarted) => true,
            (TransactionStarted, OfferExchanging | TransactionStopped | Failed) => true,
            (OfferExchanging, PayloadSending | TransactionStopped | Failed) => true,
            (PayloadSending, OfferExchanging | TransactionStopped | Failed) => true,
            // The caller decides whether the next component is attempted.
            (Failed, OfferExchanging | TransactionStopped) => true,
            _ => false,
        }
    }
}

/// Current phase plus validated transitions.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    phase: EnginePhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Move to `to`, returning the previous phase.
    pub fn goto(&mut self, to: EnginePhase) -> Result<EnginePhase, EngineError> {
        let from = self.phase;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidState { from, to });
        }
        tracing::info!(from = %from, to = %to, "State transition");
        self.phase = to;
        Ok(from)
    }
}
