//! serial_mjpegd - serial MJPEG stream daemon
//!
//! This daemon:
//! 1. Waits the configured start delay, then scans for a known camera port
//! 2. Requests access, opens and configures the port
//! 3. Streams decoded frames, falling back to raw dumps when nothing decodes
//! 4. Takes `retry`, `stop` and `quit` on stdin; Ctrl-C quits
//!
//! Status lines and frame arrivals are logged; `RUST_LOG=debug` adds RX dumps.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use serial_mjpeg::{
    is_stub_uri, link_channel, ConnectionLifecycle, DeviceManager, JpegDecoder, LinkConfig,
    LinkEvent, PresentationView, SerialDeviceManager, StubDeviceManager,
};

const COMMAND_POLL: Duration = Duration::from_millis(50);
const FRAME_LOG_EVERY: u64 = 30;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Reassemble a serial-over-USB MJPEG stream into frames"
)]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "SERIAL_MJPEG_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port path or stub:// URI; skips signature matching.
    #[arg(long)]
    device: Option<String>,

    /// Delay before the first scan, in milliseconds.
    #[arg(long)]
    start_delay_ms: Option<u64>,

    /// Exit after this many decoded frames (0 runs until quit).
    #[arg(long, default_value = "0")]
    max_frames: u64,

    /// Ignore stdin commands.
    #[arg(long)]
    no_stdin: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Retry,
    Stop,
    Quit,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = LinkConfig::load_with(args.config.as_deref()).context("load configuration")?;
    if let Some(device) = &args.device {
        cfg.serial.device = Some(device.clone());
    }
    if let Some(ms) = args.start_delay_ms {
        cfg.timing.start_delay = Duration::from_millis(ms);
    }

    let (tx, commands) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Command::Quit);
    })
    .context("error setting Ctrl-C handler")?;
    if !args.no_stdin {
        spawn_stdin_commands(tx)?;
    }

    log::info!(
        "serial_mjpegd {} starting: {} buffer={} bytes",
        env!("CARGO_PKG_VERSION"),
        cfg.line_params(),
        cfg.buffer.capacity_bytes
    );

    match cfg.serial.device.clone() {
        Some(device) if is_stub_uri(&device) => {
            log::info!("using synthetic device {}", device);
            run(StubDeviceManager::from_uri(&device), &cfg, &args, &commands)
        }
        device => {
            let manager = SerialDeviceManager::new(cfg.prober(), device, cfg.timing.read_timeout);
            run(manager, &cfg, &args, &commands)
        }
    }
}

fn run<D: DeviceManager>(
    devices: D,
    cfg: &LinkConfig,
    args: &Args,
    commands: &mpsc::Receiver<Command>,
) -> Result<()> {
    let (events, receiver) = link_channel();
    let mut lifecycle = ConnectionLifecycle::new(devices, cfg, Arc::new(JpegDecoder), events);
    let mut view = PresentationView::new();

    // Initial kick-off, unless told to quit first.
    match commands.recv_timeout(cfg.timing.start_delay) {
        Ok(Command::Quit) => return Ok(()),
        Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {
            lifecycle.retry();
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
    }

    let started = Instant::now();
    loop {
        match commands.recv_timeout(COMMAND_POLL) {
            Ok(Command::Retry) => {
                lifecycle.retry();
            }
            Ok(Command::Stop) => {
                lifecycle.stop();
            }
            Ok(Command::Quit) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        lifecycle.poll_permission();
        present(&receiver, &mut view);

        if args.max_frames > 0 && view.frames_seen() >= args.max_frames {
            log::info!(
                "{} frames in {:.1}s, exiting",
                view.frames_seen(),
                started.elapsed().as_secs_f64()
            );
            break;
        }
    }

    lifecycle.stop();
    present(&receiver, &mut view);
    log::info!("teardown: {}", lifecycle.stats());
    Ok(())
}

fn present(receiver: &serial_mjpeg::EventReceiver, view: &mut PresentationView) {
    for event in receiver.drain() {
        match &event {
            LinkEvent::State(state) => log::debug!("state: {}", state),
            LinkEvent::Status(status) if status.is_error() => log::error!("status: {}", status),
            LinkEvent::Status(status) => log::info!("status: {}", status),
            LinkEvent::Frame(image) => {
                let n = view.frames_seen() + 1;
                if n == 1 || n % FRAME_LOG_EVERY == 0 {
                    log::info!("frame #{}: {}x{}", n, image.width, image.height);
                }
            }
        }
        view.apply(event);
    }
}

fn spawn_stdin_commands(tx: mpsc::Sender<Command>) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let command = match line.trim() {
                    "retry" | "r" => Command::Retry,
                    "stop" | "s" => Command::Stop,
                    "quit" | "q" | "exit" => Command::Quit,
                    "" => continue,
                    other => {
                        log::warn!("unknown command '{}' (retry, stop, quit)", other);
                        continue;
                    }
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        })
        .context("spawn stdin reader")?;
    Ok(())
}
