//! uvc_bridge - enumerate USB video devices and stream them as BMP frames.
//!
//! `stream` writes each frame to stdout as a little-endian u32 byte length
//! followed by the BMP file, and debug lines to stderr. Ctrl-C stops the
//! session cleanly.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use uvc_frame_bridge::{BridgeConfig, SessionState, UsbVideoBridge};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream USB video devices as BMP frames")]
struct Args {
    /// Register a stub:// test-pattern device, e.g. stub://demo?fps=30 (repeatable).
    #[arg(long = "stub", global = true)]
    stubs: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capture devices, one JSON object per line.
    List,
    /// Request permission to use a device.
    Permission { device: String },
    /// Stream encoded frames to stdout.
    Stream {
        /// Device id. Defaults to the configured default device.
        device: Option<String>,
        /// Target frame rate. Defaults to the configured rate.
        #[arg(long)]
        fps: Option<u32>,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Debug)]
enum Shutdown {
    Signal,
    OutputClosed,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = BridgeConfig::load().context("load configuration")?;
    for stub in args.stubs {
        if !stub.starts_with("stub://") {
            return Err(anyhow!("--stub expects a stub:// device id, got {}", stub));
        }
        if !config.catalog.stub_devices.contains(&stub) {
            config.catalog.stub_devices.push(stub);
        }
    }
    let bridge = UsbVideoBridge::from_config(&config).context("initialize bridge")?;

    match args.command {
        Command::List => list(&bridge),
        Command::Permission { device } => {
            let state = bridge.request_permission(&device)?;
            println!("{}", serde_json::to_string(&state)?);
            Ok(())
        }
        Command::Stream {
            device,
            fps,
            seconds,
        } => {
            let device = device
                .or_else(|| config.default_device.clone())
                .ok_or_else(|| anyhow!("no device given and no default_device configured"))?;
            stream(&bridge, &device, fps, seconds.map(Duration::from_secs))
        }
    }
}

fn list(bridge: &UsbVideoBridge) -> Result<()> {
    if !bridge.is_supported() {
        log::warn!("hardware capture unavailable in this build; only stub:// devices can stream");
    }
    let devices = bridge.list_devices();
    if devices.is_empty() {
        log::info!("no capture devices found");
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for device in devices {
        writeln!(out, "{}", serde_json::to_string(&device)?)?;
    }
    Ok(())
}

fn stream(
    bridge: &UsbVideoBridge,
    device: &str,
    fps: Option<u32>,
    limit: Option<Duration>,
) -> Result<()> {
    let (tx, rx) = mpsc::sync_channel::<Shutdown>(4);

    bridge.subscribe_debug(|line| eprintln!("{}", line));

    let frame_tx = tx.clone();
    bridge.subscribe_frames(move |image| {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let len = image.len() as u32;
        let written = out
            .write_all(&len.to_le_bytes())
            .and_then(|()| out.write_all(image.as_bytes()))
            .and_then(|()| out.flush());
        if written.is_err() {
            let _ = frame_tx.try_send(Shutdown::OutputClosed);
        }
    });

    ctrlc::set_handler(move || {
        let _ = tx.try_send(Shutdown::Signal);
    })
    .expect("error setting Ctrl-C handler");

    bridge
        .start_stream(device, fps)
        .with_context(|| format!("start stream on {}", device))?;
    log::info!("streaming {} (Ctrl-C to stop)", device);

    let started = Instant::now();
    loop {
        if let Some(limit) = limit {
            if started.elapsed() >= limit {
                log::info!("time limit reached");
                break;
            }
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Shutdown::Signal) => {
                log::info!("shutdown signal received, stopping stream...");
                break;
            }
            Ok(Shutdown::OutputClosed) => {
                log::warn!("stdout closed, stopping stream...");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if bridge.state() != SessionState::Running {
            log::warn!("capture ended by the device");
            break;
        }
    }

    bridge.stop_stream();
    bridge.unsubscribe_frames();
    bridge.flush_events();
    log::info!("stream stats: {}", serde_json::to_string(&bridge.stats())?);
    Ok(())
}
