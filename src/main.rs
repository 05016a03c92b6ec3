//! CLI entry point for the frame receiver.
//!
//! # Usage
//!
//! Run the receiver with the simulated camera until Ctrl-C:
//! ```bash
//! frame_receiver run --config config/frame_receiver.toml
//! ```
//!
//! Capture a fixed number of frames and exit:
//! ```bash
//! frame_receiver run --frames 1000
//! ```
//!
//! Query a running receiver over its control channel:
//! ```bash
//! frame_receiver status --endpoint tcp://127.0.0.1:5060
//! ```
//!
//! Print the effective configuration (defaults, file and environment merged):
//! ```bash
//! frame_receiver config
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use frame_receiver::config::ReceiverConfig;
use frame_receiver::decoder::{CameraLinkDecoder, SimulatedCamera};
use frame_receiver::ipc::{ChannelType, IpcChannel, IpcContext, IpcMessage, MsgType, MsgVal};
use frame_receiver::logging::{self, OutputFormat, TracingConfig};
use frame_receiver::rx_thread::FrameReceiverRxThread;
use frame_receiver::sink::{FrameSink, SinkEvent};
use shared_buffer::SharedBufferManager;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How long the sink waits for an event before rechecking the stop flag.
const SINK_POLL: Duration = Duration::from_millis(100);

/// How often the sink asks whether the decoder is still running.
const STATUS_PERIOD: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "frame_receiver")]
#[command(about = "Camera frame receiver acquisition core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the receiver with the simulated camera
    Run {
        /// Configuration file (defaults to config/frame_receiver.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop after this many frames (overrides simulator.max_frames)
        #[arg(long)]
        frames: Option<u64>,

        /// Log output format: pretty, compact or json
        #[arg(long, default_value = "pretty")]
        log_format: OutputFormat,
    },

    /// Send a status request to a running receiver's control channel
    Status {
        /// Control channel endpoint
        #[arg(long, default_value = "tcp://127.0.0.1:5060")]
        endpoint: String,

        /// Reply timeout in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (defaults to config/frame_receiver.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            frames,
            log_format,
        } => run_receiver(config, frames, log_format).await,
        Commands::Status {
            endpoint,
            timeout_ms,
        } => query_status(&endpoint, Duration::from_millis(timeout_ms)),
        Commands::Config { config } => {
            let config = load_config(config)?;
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(config_path: Option<PathBuf>) -> Result<ReceiverConfig> {
    Ok(match config_path {
        Some(path) => ReceiverConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ReceiverConfig::load()?,
    })
}

async fn run_receiver(
    config_path: Option<PathBuf>,
    frames: Option<u64>,
    log_format: OutputFormat,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(frames) = frames {
        config.simulator.max_frames = frames;
    }
    config.validate()?;

    let tracing_config = TracingConfig::from_receiver_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    info!(
        ctrl_endpoint = %config.decoder.ctrl_endpoint,
        notify_endpoint = %config.rx.notify_endpoint,
        num_buffers = config.shared_buffer.num_buffers,
        buffer_size = config.shared_buffer.buffer_size,
        "Starting frame receiver"
    );

    let context = IpcContext::global();
    let manager = Arc::new(SharedBufferManager::new(
        &config.shared_buffer.name,
        config.shared_buffer.num_buffers,
        config.shared_buffer.buffer_size,
    )?);

    let sink = FrameSink::bind(&config.rx.rx_channel_endpoint, &context, Arc::clone(&manager))?;

    let mut decoder = CameraLinkDecoder::new(
        SimulatedCamera::new(&config.simulator),
        Arc::clone(&manager),
        &context,
    );
    decoder.init(&config.decoder)?;

    let mut rx_thread = FrameReceiverRxThread::start(&config, &context, decoder)?;
    sink.precharge(0, config.shared_buffer.num_buffers)?;

    let stop = Arc::new(AtomicBool::new(false));
    let max_frames = config.simulator.max_frames;
    let mut sink_task = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        move || drain_frames(sink, &stop, max_frames)
    });

    let sink = tokio::select! {
        joined = &mut sink_task => joined?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            stop.store(true, Ordering::Relaxed);
            sink_task.await?
        }
    };

    rx_thread.stop()?;
    let sink = sink?;
    info!(
        frames = sink.frames_received(),
        header_mismatches = sink.header_mismatches(),
        "Frame receiver stopped"
    );
    Ok(())
}

/// Consume frames until stopped, until `max_frames` (if non-zero) have arrived,
/// or until the decoder reports it has stopped.
fn drain_frames(mut sink: FrameSink, stop: &AtomicBool, max_frames: u64) -> Result<FrameSink> {
    let mut last_status = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        if last_status.elapsed() >= STATUS_PERIOD {
            sink.request_status()?;
            last_status = Instant::now();
        }
        match sink.next_event(SINK_POLL)? {
            Some(SinkEvent::DecoderStopped {
                last_error: Some(error),
            }) => bail!("acquisition stopped: {error}"),
            Some(SinkEvent::DecoderStopped { last_error: None }) => {
                info!(frames = sink.frames_received(), "Decoder stopped, no more frames");
                break;
            }
            Some(SinkEvent::Frame(_)) if max_frames > 0 && sink.frames_received() >= max_frames => {
                info!(frames = max_frames, "Frame limit reached");
                break;
            }
            Some(SinkEvent::Reply(reply)) if reply.msg_type() == MsgType::Nack => {
                warn!(%reply, "Pipeline command rejected");
            }
            _ => {}
        }
    }
    Ok(sink)
}

fn query_status(endpoint: &str, timeout: Duration) -> Result<()> {
    let mut channel = IpcChannel::new(ChannelType::Dealer, &IpcContext::global());
    channel
        .connect(endpoint)
        .with_context(|| format!("connecting to {endpoint}"))?;
    channel.send(IpcMessage::new(MsgType::Cmd, MsgVal::Status).encode()?)?;

    let envelope = channel
        .recv_timeout(timeout)
        .with_context(|| format!("no reply from {endpoint}"))?;
    let reply = IpcMessage::decode(&envelope.payload)?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
