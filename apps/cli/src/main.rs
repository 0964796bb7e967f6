use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use bleota_core::events::{OtaEvent, OtaObserver, ResetReason, TracingObserver};
use bleota_core::protocol::constants::{
    ESP_IMAGE_MAGIC, MAX_ATTR_VALUE_LEN, OTA_RX_CHAR_UUID, OTA_SERVICE_UUID, OTA_TX_CHAR_UUID,
};
use bleota_core::status::NotifyError;
use bleota_core::{
    ApplyOutcome, FileFlash, Framing, FsStagingStore, OtaConfig, OtaService, StatusSink,
    TransferPlan,
};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "BLE OTA firmware receiver (host simulator)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream an image through the receiver into a file-backed partition
    Simulate {
        /// Firmware image to send
        #[arg(long)]
        image: PathBuf,

        /// Directory for the staging store and partition file
        #[arg(long, default_value = "bleota-sim")]
        workdir: PathBuf,

        /// Largest message the sender writes
        #[arg(long, default_value_t = MAX_ATTR_VALUE_LEN)]
        chunk_size: usize,

        /// Use sequence headers and a CRC-32 handshake
        #[arg(long)]
        sequenced: bool,

        /// Reject images not starting with the ESP image magic byte
        #[arg(long)]
        esp_magic: bool,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show the message plan for an image
    Plan {
        #[arg(long)]
        image: PathBuf,

        #[arg(long, default_value_t = MAX_ATTR_VALUE_LEN)]
        chunk_size: usize,

        #[arg(long)]
        sequenced: bool,
    },
    /// Write the default configuration
    InitConfig { path: PathBuf },
}

/// Prints status notifications as JSON lines.
struct StdoutSink;

impl StatusSink for StdoutSink {
    fn has_subscriber(&self) -> bool {
        true
    }

    fn notify(&mut self, payload: &[u8]) -> Result<(), NotifyError> {
        let mut out = std::io::stdout().lock();
        out.write_all(payload)
            .and_then(|_| out.write_all(b"\n"))
            .map_err(|_| NotifyError::Closed)
    }
}

/// Logs every event and forwards the ones that end a simulation.
struct SimObserver {
    done: mpsc::Sender<OtaEvent>,
}

impl OtaObserver for SimObserver {
    fn on_event(&self, event: &OtaEvent) {
        TracingObserver.on_event(event);
        let terminal = matches!(
            event,
            OtaEvent::ApplyFinished { .. }
                | OtaEvent::HandshakeRejected { .. }
                | OtaEvent::SessionReset {
                    reason: ResetReason::Failed | ResetReason::IdleTimeout
                }
        );
        if terminal {
            let _ = self.done.send(event.clone());
        }
    }
}

fn framing(sequenced: bool) -> Framing {
    if sequenced {
        Framing::Sequenced
    } else {
        Framing::Legacy
    }
}

/// Time for the reporter to push the final snapshot.
fn settle_delay(status_interval: Duration) -> Duration {
    status_interval.saturating_mul(2)
}

fn simulate(
    image: PathBuf,
    workdir: PathBuf,
    chunk_size: usize,
    sequenced: bool,
    esp_magic: bool,
    config: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config {
        Some(path) => OtaConfig::load_from_file(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => OtaConfig::default(),
    };
    config.staging_dir = workdir.join("staging");
    config.flash_path = workdir.join("ota_partition.bin");

    let data = std::fs::read(&image)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    let plan = TransferPlan::new(&data, chunk_size.min(config.max_message_len), framing(sequenced))?;
    info!(
        image = %image.display(),
        size = data.len(),
        chunks = plan.chunk_count(),
        handshake = %plan.handshake(),
        "Loaded image"
    );

    let store = FsStagingStore::with_file_name(
        &config.staging_dir,
        &config.staging_file,
        config.staging_capacity,
    )?;
    let mut flash = FileFlash::new(&config.flash_path, config.flash_capacity);
    if esp_magic {
        flash = flash.with_magic(ESP_IMAGE_MAGIC);
    }

    let (done_tx, done_rx) = mpsc::channel();
    let service = OtaService::start(
        &config,
        store,
        flash,
        StdoutSink,
        Arc::new(SimObserver { done: done_tx }),
    )?;

    let inbound = service.inbound();
    for message in plan.messages() {
        inbound.submit(&message)?;
    }

    let wait = config
        .idle_timeout()
        .unwrap_or(Duration::from_secs(30))
        .saturating_add(Duration::from_secs(30));
    let event = done_rx
        .recv_timeout(wait)
        .map_err(|_| anyhow!("No outcome within {:?}", wait))?;

    std::thread::sleep(settle_delay(config.status_interval()));
    let reboot_ready = service.reboot_ready();
    service.shutdown();

    match event {
        OtaEvent::ApplyFinished { attempt } if attempt.outcome == ApplyOutcome::Success => {
            info!(
                partition = %config.flash_path.display(),
                reboot_ready,
                "Update applied"
            );
            Ok(())
        }
        OtaEvent::ApplyFinished { attempt } => bail!("Update failed: {}", attempt.status_message()),
        OtaEvent::HandshakeRejected { reason } => bail!("Handshake rejected: {}", reason),
        other => bail!("Transfer failed: {:?}", other),
    }
}

fn plan(image: PathBuf, chunk_size: usize, sequenced: bool) -> Result<()> {
    let data = std::fs::read(&image)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    let plan = TransferPlan::new(&data, chunk_size, framing(sequenced))?;
    println!("handshake:   {}", plan.handshake());
    println!("framing:     {:?}", plan.framing());
    println!("image bytes: {}", data.len());
    println!("chunks:      {}", plan.chunk_count());
    println!("payload/msg: {}", plan.payload_len());
    println!("service:     {}", OTA_SERVICE_UUID);
    println!("write to:    {}", OTA_RX_CHAR_UUID);
    println!("notify from: {}", OTA_TX_CHAR_UUID);
    Ok(())
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Simulate {
            image,
            workdir,
            chunk_size,
            sequenced,
            esp_magic,
            config,
        } => simulate(image, workdir, chunk_size, sequenced, esp_magic, config),
        Commands::Plan {
            image,
            chunk_size,
            sequenced,
        } => plan(image, chunk_size, sequenced),
        Commands::InitConfig { path } => {
            OtaConfig::default().save_to_file(&path)?;
            info!(path = %path.display(), "Wrote default configuration");
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to install tracing subscriber");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
