//! The read loop: one dedicated thread per connection.
//!
//! Each iteration reads a bounded chunk with a timeout, screens it through
//! the diagnostic fallback, feeds the assembler, and decodes every frame the
//! assembler releases. Stream errors never end the loop; it backs off, resets
//! the buffer and carries on until the running flag is cleared.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::assembler::{AssemblerConfig, FrameAssembler, SOI};
use crate::config::LinkConfig;
use crate::decode::FrameDecoder;
use crate::device::{OwnedPort, PortCloser};
use crate::diagnostic::{DiagnosticFallback, RxDump, Screen};
use crate::error::{ErrorClass, LinkError};
use crate::lifecycle::ConnectionState;
use crate::status::EventSender;

const STREAMING_STATUS: &str = "Streaming...";
const DIAGNOSTIC_STATUS: &str = "No stream detected. Dumping raw data (retry to restart scan)...";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadLoopConfig {
    pub read_timeout: Duration,
    pub idle_sleep: Duration,
    pub error_backoff: Duration,
    pub diagnostic_timeout: Duration,
    pub read_chunk_bytes: usize,
    pub assembler: AssemblerConfig,
}

impl Default for ReadLoopConfig {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

impl ReadLoopConfig {
    pub fn from_config(cfg: &LinkConfig) -> Self {
        Self {
            read_timeout: cfg.timing.read_timeout,
            idle_sleep: cfg.timing.idle_sleep,
            error_backoff: cfg.timing.error_backoff,
            diagnostic_timeout: cfg.timing.diagnostic_timeout,
            read_chunk_bytes: cfg.timing.read_chunk_bytes,
            assembler: cfg.assembler_config(),
        }
    }
}

/// Counters published by the read loop thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub bytes_read: u64,
    pub overflow_resets: u64,
    pub stream_errors: u64,
}

impl std::fmt::Display for ReadStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frames={} decode_failures={} bytes={} overflow_resets={} stream_errors={}",
            self.frames_decoded,
            self.decode_failures,
            self.bytes_read,
            self.overflow_resets,
            self.stream_errors
        )
    }
}

#[derive(Debug, Default)]
struct ReaderShared {
    running: AtomicBool,
    diagnostic: AtomicBool,
    frames_decoded: AtomicU64,
    decode_failures: AtomicU64,
    bytes_read: AtomicU64,
    overflow_resets: AtomicU64,
    stream_errors: AtomicU64,
}

impl ReaderShared {
    fn snapshot(&self) -> ReadStats {
        ReadStats {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            overflow_resets: self.overflow_resets.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

/// What one [`ReadLoop::step`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The read timed out with no data.
    Idle,
    Read { bytes: usize, frames: usize },
    /// The read failed; the loop backed off and reset.
    Recovered,
    /// The port was closed from under the loop.
    Closed,
}

pub struct ReadLoop {
    port: OwnedPort,
    decoder: Arc<dyn FrameDecoder>,
    events: EventSender,
    config: ReadLoopConfig,
    assembler: FrameAssembler,
    fallback: DiagnosticFallback,
    rx_dump: RxDump,
    read_buf: Vec<u8>,
    shared: Arc<ReaderShared>,
    streaming_announced: bool,
}

impl ReadLoop {
    pub fn new(
        port: OwnedPort,
        decoder: Arc<dyn FrameDecoder>,
        events: EventSender,
        config: ReadLoopConfig,
    ) -> Self {
        let shared = Arc::new(ReaderShared::default());
        shared.running.store(true, Ordering::SeqCst);
        Self {
            port,
            decoder,
            events,
            assembler: FrameAssembler::new(config.assembler),
            fallback: DiagnosticFallback::new(config.diagnostic_timeout, Instant::now()),
            rx_dump: RxDump::new(),
            read_buf: vec![0u8; config.read_chunk_bytes.max(1)],
            config,
            shared,
            streaming_announced: false,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.fallback.stream_start()
    }

    pub fn is_diagnostic(&self) -> bool {
        self.fallback.is_active()
    }

    pub fn buffered(&self) -> usize {
        self.assembler.position()
    }

    pub fn stats(&self) -> ReadStats {
        self.shared.snapshot()
    }

    /// One read-and-extract iteration, as seen at `now`.
    pub fn step(&mut self, now: Instant) -> StepOutcome {
        if self.fallback.poll(now) {
            self.enter_diagnostic();
        }

        let mut buf = std::mem::take(&mut self.read_buf);
        let timeout = self.config.read_timeout;
        let outcome = match self.port.with_link(|link| link.read(&mut buf, timeout)) {
            None => StepOutcome::Closed,
            Some(Ok(0)) => {
                thread::sleep(self.config.idle_sleep);
                StepOutcome::Idle
            }
            Some(Ok(n)) => {
                let frames = self.handle_chunk(&buf[..n]);
                StepOutcome::Read { bytes: n, frames }
            }
            Some(Err(err)) => {
                self.on_error(LinkError::from(err));
                StepOutcome::Recovered
            }
        };
        self.read_buf = buf;
        outcome
    }

    /// Loop until the running flag is cleared. The port closes when this returns.
    pub fn run(mut self) -> ReadStats {
        log::info!("read loop started on {}", self.port.name());
        while self.shared.running.load(Ordering::SeqCst) {
            if self.step(Instant::now()) == StepOutcome::Closed {
                log::info!("{} closed under the read loop", self.port.name());
                break;
            }
        }
        let stats = self.stats();
        log::info!("read loop on {} stopped ({})", self.port.name(), stats);
        stats
    }

    pub fn spawn(self) -> io::Result<ReaderHandle> {
        let shared = self.shared.clone();
        let closer = self.port.closer();
        let close_wait = self.config.read_timeout * 2;
        let (done_tx, done_rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("mjpeg-reader".to_string())
            .spawn(move || {
                self.run();
                let _ = done_tx.send(());
            })?;
        Ok(ReaderHandle {
            shared,
            closer,
            close_wait,
            done: done_rx,
            join: Some(join),
        })
    }

    fn handle_chunk(&mut self, chunk: &[u8]) -> usize {
        self.shared
            .bytes_read
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        if let Some(line) = self.rx_dump.push(chunk) {
            log::debug!("{}", line);
            if self.fallback.is_active() {
                self.events.info(line);
            }
        }

        let feed = match self.fallback.screen(chunk) {
            Screen::Pass => chunk,
            Screen::Discard => return 0,
            Screen::Resume { offset, carry } => {
                log::info!("start-of-image seen in diagnostic mode, resuming extraction");
                if carry > 0 {
                    drop(self.assembler.ingest(&SOI[..carry]));
                }
                &chunk[offset..]
            }
        };

        let resets_before = self.assembler.stats().overflow_resets;
        let mut frames = 0;
        let mut failed = false;
        let mut ingest = self.assembler.ingest(feed);
        while let Some(frame) = ingest.next_frame() {
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            frames += 1;
            log::trace!(
                "frame of {} bytes at stream offset {}",
                frame.span.byte_len(),
                frame.stream_offset
            );
            match self.decoder.decode(frame.bytes()) {
                Ok(image) => {
                    self.shared.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    if self.fallback.on_frame_decoded() {
                        log::info!("frame decoded, leaving diagnostic mode");
                        self.shared.diagnostic.store(false, Ordering::SeqCst);
                        self.events.state(ConnectionState::Streaming);
                    }
                    if !self.streaming_announced {
                        self.streaming_announced = true;
                        self.events.info(STREAMING_STATUS);
                    }
                    self.events.frame(image);
                }
                Err(err) => {
                    failed = true;
                    log::warn!("{} at stream offset {}", err, frame.stream_offset);
                    Self::report(&self.shared, &self.events, err);
                }
            }
        }
        drop(ingest);
        let resets = self.assembler.stats().overflow_resets;
        self.shared.overflow_resets.store(resets, Ordering::Relaxed);

        if self.fallback.is_resumed() && (failed || resets > resets_before) {
            log::info!("resumed extraction produced no frame; discarding raw data again");
            self.fallback.abandon_resume();
            self.assembler.reset();
        }
        frames
    }

    fn enter_diagnostic(&mut self) {
        log::warn!(
            "no frame decoded within {:?} of stream start; dumping raw data",
            self.config.diagnostic_timeout
        );
        self.assembler.reset();
        self.shared.diagnostic.store(true, Ordering::SeqCst);
        self.streaming_announced = false;
        self.events.state(ConnectionState::DiagnosticMode);
        self.events.info(DIAGNOSTIC_STATUS);
    }

    fn on_error(&mut self, err: LinkError) {
        match err.class() {
            ErrorClass::Decode => Self::report(&self.shared, &self.events, err),
            _ => self.recover(err),
        }
    }

    /// Per-frame failures: count and surface, nothing else.
    fn report(shared: &ReaderShared, events: &EventSender, err: LinkError) {
        shared.decode_failures.fetch_add(1, Ordering::Relaxed);
        events.error(err.to_string());
    }

    fn recover(&mut self, err: LinkError) {
        if err.is_terminal() {
            log::warn!("unexpected {:?} error in the read loop", err.class());
        }
        self.shared.stream_errors.fetch_add(1, Ordering::Relaxed);
        log::error!("read loop on {}: {}", self.port.name(), err);
        self.events.error(err.to_string());
        thread::sleep(self.config.error_backoff);
        self.assembler.reset();
        let was_diagnostic = self.fallback.is_active();
        self.fallback.restart(Instant::now());
        if was_diagnostic {
            self.shared.diagnostic.store(false, Ordering::SeqCst);
            self.events.state(ConnectionState::Streaming);
        }
    }
}

/// Controller-side handle onto a spawned read loop.
#[derive(Debug)]
pub struct ReaderHandle {
    shared: Arc<ReaderShared>,
    closer: PortCloser,
    close_wait: Duration,
    done: mpsc::Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    pub fn stats(&self) -> ReadStats {
        self.shared.snapshot()
    }

    pub fn is_diagnostic(&self) -> bool {
        self.shared.diagnostic.load(Ordering::SeqCst)
    }

    /// Clear the running flag and wait up to `join_timeout` for the thread.
    /// A thread still running after that is detached and its port closed from
    /// here. Returns true once the port is closed; false only if the link
    /// stayed busy in a read that outlived the close wait.
    pub fn stop(mut self, join_timeout: Duration) -> bool {
        self.shared.running.store(false, Ordering::SeqCst);
        match self.done.recv_timeout(join_timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    if join.join().is_err() {
                        log::error!("read loop thread panicked");
                    }
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "read loop did not exit within {:?}; detaching it",
                    join_timeout
                );
                self.closer.close(self.close_wait)
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}
