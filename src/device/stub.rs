//! Synthetic devices for `stub://` URIs.
//!
//! A stub manager reports a configurable set of candidate ports, answers
//! permission requests per a fixed policy (or leaves them pending for the
//! caller to resolve), and opens links that either replay a scripted read
//! sequence or generate a paced stream of real JPEG frames.
//!
//! Every call that touches "hardware" is recorded so tests can assert on
//! configure parameters, line-state toggles and open/close balance.

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::{self, Cursor};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    CandidatePort, DeviceManager, Driver, LineParams, PermissionOutcome, PermissionResolver,
    PermissionTicket, Prober, SerialLink,
};
use crate::error::LinkError;

const IDLE_READ_CAP: Duration = Duration::from_millis(20);
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CHUNK: usize = 512;

/// One scripted read result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StubRead {
    Data(Vec<u8>),
    /// The read times out with no data.
    Idle,
    /// The read fails with an I/O error carrying this message.
    Fail(String),
    /// The read blocks this long whatever the timeout, then yields nothing.
    Stall(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubPermission {
    AlreadyGranted,
    GrantOnRequest,
    DenyOnRequest,
    /// Requests stay pending until [`StubController::resolve_permission`].
    Manual,
}

#[derive(Clone, Debug)]
enum StubStream {
    Script(Vec<StubRead>),
    Generated {
        width: u32,
        height: u32,
        chunk: usize,
        interval: Duration,
    },
}

#[derive(Debug, Default)]
struct StubRecord {
    opens: usize,
    closes: usize,
    configured: Vec<LineParams>,
    line_states: Vec<(bool, bool)>,
    purges: usize,
    permission_requests: usize,
    granted: bool,
    pending: Vec<PermissionResolver>,
}

fn lock(record: &Mutex<StubRecord>) -> MutexGuard<'_, StubRecord> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StubDeviceManager {
    candidates: Vec<CandidatePort>,
    prober: Prober,
    permission: StubPermission,
    fail_enumerate: bool,
    fail_open: bool,
    fail_configure: bool,
    fail_purge: bool,
    stream: StubStream,
    record: Arc<Mutex<StubRecord>>,
}

impl StubDeviceManager {
    /// One OpenMV-signature port named `stub://openmv`, access already
    /// granted, generating 160x120 frames.
    pub fn new() -> Self {
        Self {
            candidates: vec![CandidatePort::usb("stub://openmv", 0x1209, 0xABD1)],
            prober: Prober::new(super::default_signatures(), false),
            permission: StubPermission::AlreadyGranted,
            fail_enumerate: false,
            fail_open: false,
            fail_configure: false,
            fail_purge: false,
            stream: StubStream::Generated {
                width: 160,
                height: 120,
                chunk: DEFAULT_CHUNK,
                interval: DEFAULT_FRAME_INTERVAL,
            },
            record: Arc::new(Mutex::new(StubRecord::default())),
        }
    }

    /// Build from a `stub://name` URI; the name becomes the port name.
    pub fn from_uri(uri: &str) -> Self {
        let mut manager = Self::new();
        manager.candidates = vec![CandidatePort::usb(uri, 0x1209, 0xABD1)];
        manager
    }

    pub fn with_candidates(mut self, candidates: Vec<CandidatePort>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_prober(mut self, prober: Prober) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_permission(mut self, permission: StubPermission) -> Self {
        self.permission = permission;
        self
    }

    pub fn failing_enumerate(mut self) -> Self {
        self.fail_enumerate = true;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn failing_purge(mut self) -> Self {
        self.fail_purge = true;
        self
    }

    /// Each opened link replays `reads` once, then idles.
    pub fn with_script(mut self, reads: Vec<StubRead>) -> Self {
        self.stream = StubStream::Script(reads);
        self
    }

    pub fn generating(mut self, width: u32, height: u32, interval: Duration) -> Self {
        self.stream = StubStream::Generated {
            width,
            height,
            chunk: DEFAULT_CHUNK,
            interval,
        };
        self
    }

    pub fn controller(&self) -> StubController {
        StubController {
            record: self.record.clone(),
        }
    }
}

impl Default for StubDeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager for StubDeviceManager {
    fn enumerate(&self) -> Result<Vec<CandidatePort>, LinkError> {
        if self.fail_enumerate {
            return Err(LinkError::Enumerate("stub enumeration failure".to_string()));
        }
        Ok(self.candidates.clone())
    }

    fn probe(&self, port: &CandidatePort) -> Option<Driver> {
        self.prober.probe(port)
    }

    fn has_permission(&self, _driver: &Driver) -> bool {
        self.permission == StubPermission::AlreadyGranted || lock(&self.record).granted
    }

    fn request_permission(&self, _driver: &Driver) -> PermissionTicket {
        let mut record = lock(&self.record);
        record.permission_requests += 1;
        match self.permission {
            StubPermission::AlreadyGranted | StubPermission::GrantOnRequest => {
                record.granted = true;
                PermissionTicket::ready(PermissionOutcome::Granted)
            }
            StubPermission::DenyOnRequest => PermissionTicket::ready(PermissionOutcome::Denied),
            StubPermission::Manual => {
                let (resolver, ticket) = PermissionTicket::pending();
                record.pending.push(resolver);
                ticket
            }
        }
    }

    fn open(&self, driver: &Driver) -> Result<Box<dyn SerialLink>, LinkError> {
        if self.fail_open {
            return Err(LinkError::Open {
                port: driver.port.name.clone(),
                reason: "null connection".to_string(),
            });
        }
        lock(&self.record).opens += 1;
        let source = match &self.stream {
            StubStream::Script(reads) => Source::Script(reads.iter().cloned().collect()),
            StubStream::Generated {
                width,
                height,
                chunk,
                interval,
            } => Source::Generated(FrameGenerator {
                width: *width,
                height: *height,
                chunk: *chunk,
                interval: *interval,
                sequence: 0,
                pending: Vec::new(),
                offset: 0,
                last_frame_at: None,
            }),
        };
        log::info!("StubLink: opened {} (synthetic)", driver.port.name);
        Ok(Box::new(StubLink {
            name: driver.port.name.clone(),
            source,
            closed: false,
            fail_configure: self.fail_configure,
            fail_purge: self.fail_purge,
            record: self.record.clone(),
        }))
    }
}

/// Test-side handle onto a stub manager's record.
#[derive(Clone)]
pub struct StubController {
    record: Arc<Mutex<StubRecord>>,
}

impl StubController {
    pub fn opens(&self) -> usize {
        lock(&self.record).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.record).closes
    }

    /// Links opened and not yet closed.
    pub fn open_links(&self) -> usize {
        let record = lock(&self.record);
        record.opens - record.closes
    }

    pub fn configured(&self) -> Vec<LineParams> {
        lock(&self.record).configured.clone()
    }

    pub fn line_states(&self) -> Vec<(bool, bool)> {
        lock(&self.record).line_states.clone()
    }

    pub fn purges(&self) -> usize {
        lock(&self.record).purges
    }

    pub fn permission_requests(&self) -> usize {
        lock(&self.record).permission_requests
    }

    /// Resolve the oldest pending request. Returns false if none was pending.
    pub fn resolve_permission(&self, outcome: PermissionOutcome) -> bool {
        let mut record = lock(&self.record);
        if record.pending.is_empty() {
            return false;
        }
        let resolver = record.pending.remove(0);
        if outcome == PermissionOutcome::Granted {
            record.granted = true;
        }
        resolver.resolve(outcome);
        true
    }
}

enum Source {
    Script(VecDeque<StubRead>),
    Generated(FrameGenerator),
}

struct FrameGenerator {
    width: u32,
    height: u32,
    chunk: usize,
    interval: Duration,
    sequence: u64,
    pending: Vec<u8>,
    offset: usize,
    last_frame_at: Option<Instant>,
}

impl FrameGenerator {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            if let Some(last) = self.last_frame_at {
                let since = last.elapsed();
                if since < self.interval {
                    std::thread::sleep((self.interval - since).min(timeout));
                    return Ok(0);
                }
            }
            self.pending = synthetic_jpeg(self.width, self.height, self.sequence)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.offset = 0;
            self.sequence += 1;
            self.last_frame_at = Some(Instant::now());
        }
        let n = (self.pending.len() - self.offset).min(self.chunk).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

struct StubLink {
    name: String,
    source: Source,
    closed: bool,
    fail_configure: bool,
    fail_purge: bool,
    record: Arc<Mutex<StubRecord>>,
}

impl SerialLink for StubLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &LineParams) -> Result<(), LinkError> {
        if self.fail_configure {
            return Err(LinkError::configure("baud rate", "stub configure failure"));
        }
        lock(&self.record).configured.push(*params);
        Ok(())
    }

    fn set_line_state(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError> {
        lock(&self.record).line_states.push((dtr, rts));
        Ok(())
    }

    fn purge_buffers(&mut self, _input: bool, _output: bool) -> Result<(), LinkError> {
        if self.fail_purge {
            return Err(LinkError::configure("purge", "not supported by driver"));
        }
        lock(&self.record).purges += 1;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        match &mut self.source {
            Source::Script(reads) => match reads.pop_front() {
                Some(StubRead::Data(mut bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        reads.push_front(StubRead::Data(bytes.split_off(n)));
                    }
                    Ok(n)
                }
                Some(StubRead::Fail(message)) => Err(io::Error::new(io::ErrorKind::Other, message)),
                Some(StubRead::Stall(duration)) => {
                    std::thread::sleep(duration);
                    Ok(0)
                }
                Some(StubRead::Idle) | None => {
                    std::thread::sleep(timeout.min(IDLE_READ_CAP));
                    Ok(0)
                }
            },
            Source::Generated(generator) => generator.read(buf, timeout),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.record).closes += 1;
        }
    }
}

/// A small but real JPEG: a gradient shifted by `seed`.
pub fn synthetic_jpeg(width: u32, height: u32, seed: u64) -> Result<Vec<u8>> {
    let shift = (seed % 256) as u32;
    let image = RgbImage::from_fn(width.max(1), height.max(1), |x, y| {
        Rgb([
            ((x * 255 / width.max(1) + shift) % 256) as u8,
            ((y * 255 / height.max(1)) % 256) as u8,
            (shift % 256) as u8,
        ])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .context("encode synthetic jpeg")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{EOI, SOI};

    #[test]
    fn synthetic_jpeg_is_marker_delimited() -> Result<()> {
        let bytes = synthetic_jpeg(16, 16, 3)?;
        assert_eq!(&bytes[..2], &SOI);
        assert_eq!(&bytes[bytes.len() - 2..], &EOI);
        Ok(())
    }

    #[test]
    fn scripted_reads_split_to_buffer_size() -> Result<()> {
        let manager = StubDeviceManager::new().with_script(vec![
            StubRead::Data(vec![1, 2, 3, 4, 5]),
            StubRead::Fail("unplugged".to_string()),
        ]);
        let port = manager.enumerate()?.remove(0);
        let driver = manager.probe(&port).context("driver")?;
        let mut link = manager.open(&driver)?;
        let mut buf = [0u8; 3];
        let timeout = Duration::from_millis(1);
        assert_eq!(link.read(&mut buf, timeout)?, 3);
        assert_eq!(link.read(&mut buf, timeout)?, 2);
        assert!(link.read(&mut buf, timeout).is_err());
        assert_eq!(link.read(&mut buf, timeout)?, 0);
        link.close();
        assert_eq!(manager.controller().open_links(), 0);
        Ok(())
    }

    #[test]
    fn manual_permission_waits_for_controller() -> Result<()> {
        let manager = StubDeviceManager::new().with_permission(StubPermission::Manual);
        let controller = manager.controller();
        let port = manager.enumerate()?.remove(0);
        let driver = manager.probe(&port).context("driver")?;
        assert!(!manager.has_permission(&driver));
        let ticket = manager.request_permission(&driver);
        assert_eq!(ticket.try_outcome(), None);
        assert!(controller.resolve_permission(PermissionOutcome::Granted));
        assert_eq!(ticket.try_outcome(), Some(PermissionOutcome::Granted));
        assert!(manager.has_permission(&driver));
        Ok(())
    }
}
