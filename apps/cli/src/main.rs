use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cfu_core::payload::BinRecords;
use cfu_core::{
    CheckpointStore, ComponentReport, EngineConfig, EngineError, FirmwareImages, HidConfig,
    HidTransport, MemoryStore, MockTransport, PayloadAction, PayloadChunker, ProtocolEngine,
    TomlFileStore, TransportParameters,
};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Component Firmware Update Tool (Pure Rust)", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the records of a payload and the chunks they would be sent in
    Inspect {
        /// Payload file
        payload: PathBuf,

        /// Transfer buffer size, transport header included
        #[arg(long, default_value_t = 61)]
        buffer_size: usize,

        /// Transport header bytes at the front of the buffer
        #[arg(long, default_value_t = 1)]
        header_size: usize,

        /// Required chunk data alignment
        #[arg(long, default_value_t = 4)]
        alignment: usize,
    },
    /// Run an update against a simulated device
    Simulate {
        #[command(flatten)]
        firmware: FirmwareArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Leave the chunk with this sequence number unanswered, then resume
        #[arg(long)]
        interrupt_at: Option<u16>,

        /// Simulated response timeout
        #[arg(long, default_value_t = 200)]
        timeout_ms: u64,
    },
    /// Update a USB HID device
    Update {
        #[command(flatten)]
        device: DeviceArgs,

        #[command(flatten)]
        firmware: FirmwareArgs,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Print the firmware versions reported by a USB HID device
    Versions {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[derive(Args, Debug)]
struct FirmwareArgs {
    /// Offer file (repeat once per component)
    #[arg(long = "offer", required = true)]
    offers: Vec<PathBuf>,

    /// Payload file (repeat once per component, same order as --offer)
    #[arg(long = "payload", required = true)]
    payloads: Vec<PathBuf>,
}

impl FirmwareArgs {
    fn load(&self) -> Result<FirmwareImages> {
        if self.offers.len() != self.payloads.len() {
            bail!(
                "{} offers but {} payloads given",
                self.offers.len(),
                self.payloads.len()
            );
        }
        let mut images = FirmwareImages::new();
        for (offer, payload) in self.offers.iter().zip(&self.payloads) {
            info!(offer = %offer.display(), payload = %payload.display(), "Loading component");
            images.push_files(offer, payload)?;
        }
        Ok(images)
    }
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint store file (TOML); kept in memory when omitted
    #[arg(long)]
    store: Option<PathBuf>,

    /// Ask the device to reset as soon as the image is written
    #[arg(long)]
    force_reset: bool,

    /// Ask the device to skip its version check
    #[arg(long)]
    force_ignore_version: bool,

    /// Continue interrupted transfers from their checkpoint
    #[arg(long)]
    resume: bool,
}

impl EngineArgs {
    fn config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load_from_file(path)?,
            None => EngineConfig::default(),
        };
        config.force_immediate_reset |= self.force_reset;
        config.force_ignore_version |= self.force_ignore_version;
        config.support_resume_on_connect |= self.resume;
        Ok(config)
    }

    fn checkpoint_store(&self, memory: &Arc<MemoryStore>) -> Box<dyn CheckpointStore> {
        match &self.store {
            Some(path) => Box::new(TomlFileStore::new(path)),
            None => Box::new(Arc::clone(memory)),
        }
    }
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// USB vendor id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: u16,

    /// USB product id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: u16,

    /// HID transport settings file (TOML)
    #[arg(long)]
    hid_config: Option<PathBuf>,
}

impl DeviceArgs {
    fn open(&self) -> Result<HidTransport> {
        let mut config = match &self.hid_config {
            Some(path) => HidConfig::load_from_file(path)?,
            None => HidConfig::default(),
        };
        config.vendor_id = self.vid;
        config.product_id = self.pid;
        HidTransport::open(config).context("opening HID device")
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{s}': {e}"))
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Inspect {
            payload,
            buffer_size,
            header_size,
            alignment,
        } => inspect(&payload, buffer_size, header_size, alignment),
        Commands::Simulate {
            firmware,
            engine,
            interrupt_at,
            timeout_ms,
        } => simulate(&firmware, &engine, interrupt_at, timeout_ms),
        Commands::Update {
            device,
            firmware,
            engine,
        } => update(&device, &firmware, &engine),
        Commands::Versions { device } => versions(&device),
    }
}

fn inspect(path: &Path, buffer_size: usize, header_size: usize, alignment: usize) -> Result<()> {
    let payload = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let chunker = PayloadChunker::new(buffer_size, header_size, alignment)?;

    println!(
        "{}: {} bytes, chunk capacity {} (alignment {})",
        path.display(),
        payload.len(),
        chunker.capacity(),
        chunker.alignment()
    );
    for record in BinRecords::new(&payload) {
        let record = record?;
        println!(
            "  record @{:<6} address 0x{:08X} length {:>3}",
            record.offset,
            record.address,
            record.len()
        );
    }
    for chunk in chunker.chunks(&payload) {
        let chunk = chunk?;
        println!(
            "  chunk {:>5} address 0x{:08X} length {:>3}{}{}",
            chunk.sequence_number,
            chunk.address,
            chunk.data.len(),
            if chunk.is_first_block() { " FIRST" } else { "" },
            if chunk.is_last_block() { " LAST" } else { "" },
        );
    }
    Ok(())
}

fn simulate(
    firmware: &FirmwareArgs,
    args: &EngineArgs,
    interrupt_at: Option<u16>,
    timeout_ms: u64,
) -> Result<()> {
    let images = firmware.load()?;
    let mut config = args.config()?;
    if interrupt_at.is_some() {
        config.support_resume_on_connect = true;
    }

    let device = MockTransport::with_parameters(TransportParameters {
        wait_timeout_ms: timeout_ms,
        ..Default::default()
    });
    if let Some(sequence_number) = interrupt_at {
        device.script_payload(sequence_number, PayloadAction::Drop);
    }
    let memory = Arc::new(MemoryStore::new());

    let mut engine = ProtocolEngine::new(Arc::new(device.clone()), config.clone())?
        .with_checkpoint_store(args.checkpoint_store(&memory));
    let reports = engine.update_all(&images)?;
    drop(engine);
    let interrupted = print_reports(&reports)
        .into_iter()
        .any(|e| matches!(e, EngineError::Interrupted { .. }));

    let reports = if interrupted {
        warn!("Transfer interrupted, resuming");
        let mut engine = ProtocolEngine::new(Arc::new(device.clone()), config)?
            .with_checkpoint_store(args.checkpoint_store(&memory));
        let reports = engine.update_all(&images)?;
        print_reports(&reports);
        reports
    } else {
        reports
    };

    println!("device acknowledged {} bytes", device.written_image().len());
    ensure_success(&reports)
}

fn update(device: &DeviceArgs, firmware: &FirmwareArgs, args: &EngineArgs) -> Result<()> {
    let images = firmware.load()?;
    let config = args.config()?;
    let transport = device.open()?;
    let memory = Arc::new(MemoryStore::new());

    let mut engine = ProtocolEngine::new(Arc::new(transport), config)?
        .with_checkpoint_store(args.checkpoint_store(&memory));
    let reports = engine.update_all(&images)?;
    print_reports(&reports);
    ensure_success(&reports)
}

fn versions(device: &DeviceArgs) -> Result<()> {
    let transport = device.open()?;
    let engine = ProtocolEngine::new(Arc::new(transport), EngineConfig::default())?;
    let versions = engine.firmware_versions()?;
    println!("protocol revision {}", versions.protocol_revision);
    for component in &versions.components {
        println!(
            "  component 0x{:02X}: version 0x{:08X} flags 0x{:02X}",
            component.component_id, component.version, component.flags
        );
    }
    Ok(())
}

/// Print one line per component; returns the failures.
fn print_reports(reports: &[ComponentReport]) -> Vec<&EngineError> {
    let mut failures = Vec::new();
    for report in reports {
        let name = match report.component_id {
            Some(id) => format!("component 0x{id:02X}"),
            None => format!("component #{}", report.index),
        };
        match &report.result {
            Ok(summary) => {
                let resumed = summary
                    .resumed_from
                    .map(|c| format!(" (resumed at sequence {})", c.sequence_number))
                    .unwrap_or_default();
                println!("{name}: updated in {} chunks{resumed}", summary.chunks);
            }
            Err(e) => {
                println!("{name}: {e}");
                failures.push(e);
            }
        }
    }
    failures
}

fn ensure_success(reports: &[ComponentReport]) -> Result<()> {
    let failed = reports.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        bail!("{failed} of {} components failed", reports.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_ids() {
        assert_eq!(parse_hex_u16("0x045E"), Ok(0x045E));
        assert_eq!(parse_hex_u16("0922"), Ok(0x0922));
        assert!(parse_hex_u16("xyz").is_err());
    }

    #[test]
    fn test_mismatched_firmware_args() {
        let args = FirmwareArgs {
            offers: vec![PathBuf::from("a.offer")],
            payloads: vec![],
        };
        assert!(args.load().is_err());
    }

    #[test]
    fn test_simulate_with_interruption_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let offer = dir.path().join("fw.offer.bin");
        let payload = dir.path().join("fw.payload.bin");
        let mut offer_bytes = vec![0u8; 16];
        offer_bytes[2] = 0x21;
        std::fs::write(&offer, offer_bytes).unwrap();
        std::fs::write(
            &payload,
            cfu_core::payload::encode_records([(0x1000, &[0xA5u8; 200][..])]),
        )
        .unwrap();

        let firmware = FirmwareArgs {
            offers: vec![offer],
            payloads: vec![payload],
        };
        let engine = EngineArgs {
            config: None,
            store: Some(dir.path().join("state.toml")),
            force_reset: false,
            force_ignore_version: false,
            resume: false,
        };
        simulate(&firmware, &engine, Some(2), 20).unwrap();
    }
}
