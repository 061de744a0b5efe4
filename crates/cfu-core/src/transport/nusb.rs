//! nusb-based USB HID transport implementation.
//!
//! Offers and content requests go out as output reports on the interrupt OUT
//! endpoint; responses come back as input reports on the interrupt IN
//! endpoint and are handed to the response sink by a reader thread. The
//! firmware version report is a GET_REPORT(Feature) control transfer.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nusb::transfer::{ControlIn, ControlType, In, Interrupt, Out, Recipient};
use nusb::{Interface, MaybeFuture, list_devices};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::traits::{TransportBinding, TransportError, TransportParameters};
use crate::protocol::constants::{
    CONTENT_HEADER_SIZE, CONTENT_RESPONSE_SIZE, OFFER_MESSAGE_SIZE, OFFER_RESPONSE_SIZE,
};
use crate::transaction::ResponseSink;

const HID_GET_REPORT: u8 = 0x01;
const HID_REPORT_TYPE_FEATURE: u16 = 0x03;

/// HID report ids used by the device's CFU collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HidReportIds {
    pub version_feature: u8,
    pub content_output: u8,
    pub content_input: u8,
    pub offer_output: u8,
    pub offer_input: u8,
}

impl Default for HidReportIds {
    fn default() -> Self {
        Self {
            version_feature: 0x20,
            content_output: 0x20,
            content_input: 0x22,
            offer_output: 0x25,
            offer_input: 0x25,
        }
    }
}

/// Open options for [`HidTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HidConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub report_ids: HidReportIds,
    /// Data bytes per content output report, after the 8-byte content header.
    pub content_data_size: usize,
    pub version_report_size: usize,
    pub wait_timeout_ms: u64,
    pub payload_fill_alignment: usize,
}

impl Default for HidConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0,
            product_id: 0,
            interface: 0,
            report_ids: HidReportIds::default(),
            content_data_size: 52,
            version_report_size: 60,
            wait_timeout_ms: 5000,
            payload_fill_alignment: 4,
        }
    }
}

impl HidConfig {
    /// Load HID settings from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn parameters(&self) -> TransportParameters {
        TransportParameters {
            wait_timeout_ms: self.wait_timeout_ms,
            header_size: 1,
            offer_buffer_size: 1 + OFFER_MESSAGE_SIZE,
            payload_buffer_size: 1 + CONTENT_HEADER_SIZE + self.content_data_size,
            firmware_version_buffer_size: 1 + self.version_report_size,
            payload_fill_alignment: self.payload_fill_alignment,
        }
    }
}

/// Input reports are the report id plus one 16-byte response.
const INPUT_REPORT_SIZE: usize = 1 + OFFER_RESPONSE_SIZE;

/// How often a blocked reader checks whether it should exit.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Forward input reports from `reader` to `sink` until `running` is cleared
/// or the read fails. Read timeouts only re-check the flag.
fn pump_input_reports<R: Read>(
    reader: &mut R,
    running: &AtomicBool,
    ids: HidReportIds,
    sink: &ResponseSink,
) {
    let mut report = [0u8; INPUT_REPORT_SIZE];
    while running.load(Ordering::SeqCst) {
        match reader.read_exact(&mut report) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    warn!(error = %e, "Input report read failed");
                    sink.deliver_failure(TransportError::ReadFailed(e.to_string()));
                }
                break;
            }
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let body = &report[1..];
        match report[0] {
            id if id == ids.content_input => {
                sink.deliver_payload_response(&body[..CONTENT_RESPONSE_SIZE])
            }
            id if id == ids.offer_input => sink.deliver_offer_response(body),
            other => debug!(report_id = other, "Ignoring input report"),
        }
    }
    debug!("Reader thread exiting");
}

/// nusb-based CFU HID transport.
pub struct HidTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    config: HidConfig,
    sink: Mutex<Option<ResponseSink>>,
    reader_running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl HidTransport {
    /// Open the device matching the configured VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", config.vendor_id), pid = format!("{:04X}", config.product_id)))]
    pub fn open(config: HidConfig) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == config.vendor_id && d.product_id() == config.product_id)
            .ok_or(TransportError::DeviceNotFound {
                vid: config.vendor_id,
                pid: config.product_id,
            })?;

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device
            .claim_interface(config.interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: config.interface,
                message: e.to_string(),
            })?;

        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for cfg in device.configurations() {
            for iface in cfg.interfaces() {
                if iface.interface_number() != config.interface {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Interrupt {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "HID device opened"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            config,
            sink: Mutex::new(None),
            reader_running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        })
    }

    fn write_report(&self, report_id: u8, buffer: &mut [u8]) -> Result<(), TransportError> {
        if let Some(first) = buffer.first_mut() {
            *first = report_id;
        }
        let ep = self
            .interface
            .endpoint::<Interrupt, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(buffer.len().max(64));
        writer
            .write_all(buffer)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(report_id, len = buffer.len(), "Output report sent");
        Ok(())
    }

    fn spawn_reader(&self, sink: ResponseSink) -> Result<(), TransportError> {
        let ep = self
            .interface
            .endpoint::<Interrupt, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let mut reader = ep.reader(INPUT_REPORT_SIZE.max(64));
        reader.set_read_timeout(READ_POLL_INTERVAL);
        let running = Arc::clone(&self.reader_running);
        let ids = self.config.report_ids;
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("cfu-hid-reader".into())
            .spawn(move || pump_input_reports(&mut reader, &running, ids, &sink))
            .map_err(|e| {
                self.reader_running.store(false, Ordering::SeqCst);
                TransportError::ReadFailed(e.to_string())
            })?;
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    /// Ask the reader to exit and wait for it, releasing the IN endpoint.
    fn stop_reader(&self) {
        self.reader_running.store(false, Ordering::SeqCst);
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Reader thread panicked");
            }
        }
    }

    fn bound_sink(&self) -> Result<ResponseSink, TransportError> {
        self.sink.lock().clone().ok_or(TransportError::NotBound)
    }
}

impl TransportBinding for HidTransport {
    fn bind(&self, sink: ResponseSink) -> Result<TransportParameters, TransportError> {
        let params = self.config.parameters();
        params.validate()?;
        *self.sink.lock() = Some(sink);
        Ok(params)
    }

    fn unbind(&self) {
        self.stop_reader();
        *self.sink.lock() = None;
    }

    fn protocol_start(&self) -> Result<(), TransportError> {
        let sink = self.bound_sink()?;
        if self.reader_running.load(Ordering::SeqCst) {
            return Ok(());
        }
        // A reader that stopped on a read error may still hold the endpoint.
        self.stop_reader();
        self.spawn_reader(sink)
    }

    fn protocol_stop(&self) -> Result<(), TransportError> {
        self.stop_reader();
        Ok(())
    }

    #[instrument(skip(self, buffer), fields(len = buffer.len()))]
    fn offer_send(&self, buffer: &mut [u8], header_len: usize) -> Result<(), TransportError> {
        debug_assert_eq!(header_len, 1);
        self.write_report(self.config.report_ids.offer_output, buffer)
    }

    #[instrument(skip(self, buffer), fields(len = buffer.len()))]
    fn payload_send(&self, buffer: &mut [u8], header_len: usize) -> Result<(), TransportError> {
        debug_assert_eq!(header_len, 1);
        self.write_report(self.config.report_ids.content_output, buffer)
    }

    fn firmware_version_get(&self) -> Result<(), TransportError> {
        let sink = self.bound_sink()?;
        let params = self.config.parameters();
        let report_id = self.config.report_ids.version_feature;
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_GET_REPORT,
                    value: (HID_REPORT_TYPE_FEATURE << 8) | u16::from(report_id),
                    index: u16::from(self.config.interface),
                    length: params.firmware_version_buffer_size as u16,
                },
                Duration::from_millis(params.wait_timeout_ms),
            )
            .wait()
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        debug!(len = data.len(), "Version report received");
        // Strip the report id.
        sink.deliver_firmware_versions(data.get(1..).unwrap_or_default());
        Ok(())
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PayloadResponse, PayloadStatus};
    use crate::transaction::TransactionContext;
    use std::collections::VecDeque;
    use std::io;

    /// Hands out queued reports, then times out; clears `running` after
    /// `timeouts_left` timeouts.
    struct ScriptedReads {
        reports: VecDeque<Vec<u8>>,
        timeouts_left: u32,
        running: Arc<AtomicBool>,
        fail: Option<io::ErrorKind>,
    }

    impl Read for ScriptedReads {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(report) = self.reports.pop_front() {
                buf[..report.len()].copy_from_slice(&report);
                return Ok(report.len());
            }
            if let Some(kind) = self.fail {
                return Err(io::Error::from(kind));
            }
            if self.timeouts_left == 0 {
                self.running.store(false, Ordering::SeqCst);
            } else {
                self.timeouts_left -= 1;
            }
            Err(io::Error::from(io::ErrorKind::TimedOut))
        }
    }

    fn content_report(ids: HidReportIds, seq: u16) -> Vec<u8> {
        let mut report = vec![ids.content_input];
        report.extend_from_slice(&PayloadResponse::new(seq, PayloadStatus::Success).to_bytes());
        report
    }

    #[test]
    fn test_reader_survives_timeouts_and_exits_when_stopped() {
        let ids = HidReportIds::default();
        let ctx = Arc::new(TransactionContext::new());
        let sink = ResponseSink::new(Arc::clone(&ctx));
        let running = Arc::new(AtomicBool::new(true));
        let mut reads = ScriptedReads {
            reports: VecDeque::from([content_report(ids, 1), vec![0x7F; INPUT_REPORT_SIZE]]),
            timeouts_left: 3,
            running: Arc::clone(&running),
            fail: None,
        };

        pump_input_reports(&mut reads, &running, ids, &sink);

        assert!(!running.load(Ordering::SeqCst));
        assert_eq!(
            ctx.pop_payload_response(),
            Some(PayloadResponse::new(1, PayloadStatus::Success).to_bytes().to_vec())
        );
        assert!(ctx.take_failure().is_none());
    }

    #[test]
    fn test_reader_reports_read_error() {
        let ctx = Arc::new(TransactionContext::new());
        let sink = ResponseSink::new(Arc::clone(&ctx));
        let running = Arc::new(AtomicBool::new(true));
        let mut reads = ScriptedReads {
            reports: VecDeque::new(),
            timeouts_left: 0,
            running: Arc::clone(&running),
            fail: Some(io::ErrorKind::BrokenPipe),
        };

        pump_input_reports(&mut reads, &running, HidReportIds::default(), &sink);

        assert!(matches!(
            ctx.take_failure(),
            Some(TransportError::ReadFailed(_))
        ));
    }

    #[test]
    fn test_hid_parameters() {
        let params = HidConfig::default().parameters();
        assert_eq!(params.header_size, 1);
        assert_eq!(params.offer_buffer_size, 17);
        assert_eq!(params.payload_buffer_size, 61);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_hid_config_from_toml() {
        let config: HidConfig = toml::from_str(
            r#"
            vendor_id = 0x045E
            product_id = 0x0922
            [report_ids]
            offer_output = 0x2D
            "#,
        )
        .unwrap();
        assert_eq!(config.vendor_id, 0x045E);
        assert_eq!(config.report_ids.offer_output, 0x2D);
        assert_eq!(config.report_ids.content_input, 0x22);
        assert_eq!(config.wait_timeout_ms, 5000);
    }
}
