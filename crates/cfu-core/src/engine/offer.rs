//! Offer, offer command and offer information exchanges.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::EngineError;
use crate::protocol::{
    OfferCommandCode, OfferInformationCode, OfferMessage, OfferResponse, OfferStatus,
    ProtocolError,
};
use crate::transaction::{TransactionContext, WaitError};
use crate::transport::{TransportBinding, TransportError, TransportParameters};

/// Which offer-channel message is being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferKind {
    Offer,
    Command,
    Information,
}

/// Classify a device answer.
///
/// `Accept` and `CommandReady` succeed. `CommandNotSupported` succeeds for
/// commands only. Offer information succeeds on `Accept` alone. `Skip` and
/// `Reject` carry their reason; everything else is unexpected.
pub fn classify_offer_response(
    kind: OfferKind,
    component_id: u8,
    response: OfferResponse,
) -> Result<OfferResponse, EngineError> {
    match (kind, response.status) {
        (_, OfferStatus::Accept) => Ok(response),
        (OfferKind::Offer | OfferKind::Command, OfferStatus::CommandReady) => Ok(response),
        (OfferKind::Command, OfferStatus::CommandNotSupported) => {
            info!("Offer command not supported by device");
            Ok(response)
        }
        (_, status @ (OfferStatus::Skip | OfferStatus::Reject)) => {
            Err(EngineError::OfferRejected {
                component_id,
                status,
                reason: response.reject_reason,
            })
        }
        (_, status) => Err(EngineError::UnexpectedOfferStatus { status }),
    }
}

pub(crate) fn wait_error(error: WaitError, timeout: Option<Duration>) -> EngineError {
    match error {
        WaitError::TimedOut => EngineError::Timeout {
            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
        },
        WaitError::Cancelled => EngineError::Aborted,
        WaitError::Failed(e) => EngineError::Transport(e),
    }
}

/// Sends offer-channel messages and waits for their responses.
pub struct OfferExchange<'a> {
    transport: &'a dyn TransportBinding,
    ctx: &'a TransactionContext,
    params: &'a TransportParameters,
    token: u8,
}

impl<'a> OfferExchange<'a> {
    pub fn new(
        transport: &'a dyn TransportBinding,
        ctx: &'a TransactionContext,
        params: &'a TransportParameters,
        token: u8,
    ) -> Self {
        Self {
            transport,
            ctx,
            params,
            token,
        }
    }

    /// Offer a component. The flags are applied here and nowhere else.
    pub fn send_offer(
        &self,
        offer: &OfferMessage,
        force_immediate_reset: bool,
        force_ignore_version: bool,
    ) -> Result<OfferResponse, EngineError> {
        let message = offer
            .with_token(self.token)
            .with_flags(force_immediate_reset, force_ignore_version);
        let response = self.transact(OfferKind::Offer, &message, Some(self.params.wait_timeout()))?;
        classify_offer_response(OfferKind::Offer, offer.component_id(), response)
    }

    /// Send an offer command. `NotifyOnReady` waits without a timeout until
    /// the device answers or the transaction is cancelled.
    pub fn send_offer_command(&self, code: OfferCommandCode) -> Result<OfferResponse, EngineError> {
        let message = OfferMessage::command(code, self.token);
        let timeout = match code {
            OfferCommandCode::NotifyOnReady => None,
        };
        let response = self.transact(OfferKind::Command, &message, timeout)?;
        classify_offer_response(OfferKind::Command, message.component_id(), response)
    }

    pub fn send_offer_information(
        &self,
        code: OfferInformationCode,
    ) -> Result<OfferResponse, EngineError> {
        let message = OfferMessage::information(code, self.token);
        let response =
            self.transact(OfferKind::Information, &message, Some(self.params.wait_timeout()))?;
        classify_offer_response(OfferKind::Information, message.component_id(), response)
    }

    fn transact(
        &self,
        kind: OfferKind,
        message: &OfferMessage,
        timeout: Option<Duration>,
    ) -> Result<OfferResponse, EngineError> {
        let header = self.params.header_size;
        let mut buffer = vec![0u8; self.params.offer_buffer_size];
        buffer
            .get_mut(header..header + OfferMessage::SIZE)
            .ok_or(ProtocolError::BufferTooSmall {
                expected: header + OfferMessage::SIZE,
                actual: self.params.offer_buffer_size,
            })?
            .copy_from_slice(message.as_bytes());

        self.ctx.begin_request();
        debug!(
            kind = ?kind,
            component_id = %format!("0x{:02X}", message.component_id()),
            "Sending offer message"
        );
        let sent: Result<(), TransportError> = match kind {
            OfferKind::Offer => self.transport.offer_send(&mut buffer, header),
            OfferKind::Command => self.transport.offer_command_send(&mut buffer, header),
            OfferKind::Information => self.transport.offer_information_send(&mut buffer, header),
        };
        sent?;

        let raw = self
            .ctx
            .wait_for(timeout, |inbox| inbox.offer_response.take())
            .map_err(|e| wait_error(e, timeout))?;
        let response = OfferResponse::from_bytes(&raw)?;
        debug!(status = %response.status, reason = %response.reject_reason, "Offer response");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RejectReason;
    use crate::transaction::ResponseSink;
    use crate::transport::MockTransport;
    use std::sync::Arc;

    struct Fixture {
        mock: MockTransport,
        ctx: Arc<TransactionContext>,
        params: TransportParameters,
    }

    fn fixture() -> Fixture {
        let mock = MockTransport::new();
        let ctx = Arc::new(TransactionContext::new());
        let params = mock.bind(ResponseSink::new(Arc::clone(&ctx))).unwrap();
        Fixture { mock, ctx, params }
    }

    fn offer(component_id: u8) -> OfferMessage {
        let mut bytes = [0u8; 16];
        bytes[2] = component_id;
        OfferMessage::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_offer_stamps_token_and_flags() {
        let f = fixture();
        let exchange = OfferExchange::new(&f.mock, &f.ctx, &f.params, 0xA0);
        let rsp = exchange.send_offer(&offer(0x21), true, false).unwrap();
        assert_eq!(rsp.status, OfferStatus::Accept);

        let sent = f.mock.offers()[0];
        assert_eq!(sent.token(), 0xA0);
        assert!(sent.force_immediate_reset());
        assert!(!sent.force_ignore_version());
    }

    #[test]
    fn test_reject_surfaces_reason() {
        let f = fixture();
        f.mock
            .queue_offer_response(OfferStatus::Reject, RejectReason::SwapPending);
        let exchange = OfferExchange::new(&f.mock, &f.ctx, &f.params, 0xA0);
        match exchange.send_offer(&offer(0x21), false, false) {
            Err(EngineError::OfferRejected {
                component_id: 0x21,
                status: OfferStatus::Reject,
                reason: RejectReason::SwapPending,
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_command_not_supported_only_ok_for_commands() {
        let f = fixture();
        let exchange = OfferExchange::new(&f.mock, &f.ctx, &f.params, 0xA0);

        f.mock.queue_command_response(OfferStatus::CommandNotSupported);
        let rsp = exchange
            .send_offer_command(OfferCommandCode::NotifyOnReady)
            .unwrap();
        assert_eq!(rsp.status, OfferStatus::CommandNotSupported);

        f.mock
            .queue_offer_response(OfferStatus::CommandNotSupported, RejectReason::OldFirmware);
        assert!(matches!(
            exchange.send_offer(&offer(1), false, false),
            Err(EngineError::UnexpectedOfferStatus {
                status: OfferStatus::CommandNotSupported
            })
        ));
    }

    #[test]
    fn test_information_accepts_only_accept() {
        let f = fixture();
        let exchange = OfferExchange::new(&f.mock, &f.ctx, &f.params, 0xA0);
        exchange
            .send_offer_information(OfferInformationCode::StartEntireTransaction)
            .unwrap();

        f.mock.queue_information_response(OfferStatus::CommandReady);
        assert!(matches!(
            exchange.send_offer_information(OfferInformationCode::StartOfferList),
            Err(EngineError::UnexpectedOfferStatus { .. })
        ));
        assert_eq!(f.mock.offers()[1].component_id(), 0xFF);
    }

    #[test]
    fn test_silent_device_times_out() {
        let mut f = fixture();
        f.params.wait_timeout_ms = 20;
        f.mock.queue_offer_silence();
        let exchange = OfferExchange::new(&f.mock, &f.ctx, &f.params, 0xA0);
        assert!(matches!(
            exchange.send_offer(&offer(2), false, false),
            Err(EngineError::Timeout { timeout_ms: 20 })
        ));
    }

    #[test]
    fn test_notify_on_ready_waits_until_cancelled() {
        let f = fixture();
        f.mock.queue_command_silence();
        let canceller = Arc::clone(&f.ctx);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            canceller.sync().signal_cancellation();
        });
        let exchange = OfferExchange::new(&f.mock, &f.ctx, &f.params, 0xA0);
        assert!(matches!(
            exchange.send_offer_command(OfferCommandCode::NotifyOnReady),
            Err(EngineError::Aborted)
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_classification_table() {
        let rsp = |status| OfferResponse::new(status, RejectReason::OldFirmware);
        assert!(classify_offer_response(OfferKind::Offer, 1, rsp(OfferStatus::CommandReady)).is_ok());
        assert!(
            classify_offer_response(OfferKind::Information, 1, rsp(OfferStatus::CommandReady))
                .is_err()
        );
        assert!(matches!(
            classify_offer_response(OfferKind::Offer, 1, rsp(OfferStatus::Skip)),
            Err(EngineError::OfferRejected {
                status: OfferStatus::Skip,
                ..
            })
        ));
        assert!(matches!(
            classify_offer_response(OfferKind::Command, 1, rsp(OfferStatus::Busy)),
            Err(EngineError::UnexpectedOfferStatus {
                status: OfferStatus::Busy
            })
        ));
    }
}
