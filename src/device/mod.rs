//! Device and port capabilities.
//!
//! The lifecycle talks to hardware only through these traits:
//! - [`DeviceManager`]: enumerate candidates, probe for a driver, check and
//!   request access, open a port.
//! - [`SerialLink`]: an open port (configure, line state, purge, read, close).
//!
//! Backends:
//! - `serial`: host serial ports via the `serialport` crate.
//! - `stub`: synthetic `stub://` devices for tests and demos.

pub mod serial;
pub mod stub;

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::error::LinkError;

pub use serial::SerialDeviceManager;
pub use stub::{StubDeviceManager, StubRead};

const CLOSE_POLL: Duration = Duration::from_millis(1);

// ----------------------------------------------------------------------------
// Candidates and drivers
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbIds {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// A port reported by enumeration. Not yet known to speak our protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidatePort {
    pub name: String,
    pub usb: Option<UsbIds>,
}

impl CandidatePort {
    pub fn usb(name: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            name: name.into(),
            usb: Some(UsbIds {
                vid,
                pid,
                manufacturer: None,
                product: None,
            }),
        }
    }

    /// `VID:XXXX PID:XXXX`, or the port name for non-USB ports.
    pub fn describe(&self) -> String {
        match &self.usb {
            Some(ids) => format!("VID:{:04X} PID:{:04X}", ids.vid, ids.pid),
            None => self.name.clone(),
        }
    }
}

/// A vendor/product pair known to carry the JPEG stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignature {
    pub vid: u16,
    pub pid: u16,
    #[serde(default)]
    pub name: String,
}

impl DeviceSignature {
    pub fn new(vid: u16, pid: u16, name: &str) -> Self {
        Self {
            vid,
            pid,
            name: name.to_string(),
        }
    }
}

pub fn default_signatures() -> Vec<DeviceSignature> {
    vec![
        DeviceSignature::new(0x1209, 0xABD1, "OpenMV Cam"),
        DeviceSignature::new(0x0483, 0x5740, "STM32 Virtual COM Port"),
        DeviceSignature::new(0x37C5, 0x924A, "OpenMV Cam RT"),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverKind {
    /// Matched a known signature.
    Known(String),
    /// Any USB serial port, accepted only when nothing known is attached.
    GenericUsb,
    /// The port was named explicitly in configuration.
    Configured,
}

/// A candidate that probing accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Driver {
    pub port: CandidatePort,
    pub kind: DriverKind,
}

/// Signature-table prober. Known signatures always win over the generic
/// USB fallback.
#[derive(Clone, Debug)]
pub struct Prober {
    signatures: Vec<DeviceSignature>,
    allow_generic_usb: bool,
    configured: Option<String>,
}

impl Prober {
    pub fn new(signatures: Vec<DeviceSignature>, allow_generic_usb: bool) -> Self {
        Self {
            signatures,
            allow_generic_usb,
            configured: None,
        }
    }

    /// Accept `port_name` unconditionally.
    pub fn with_configured(mut self, port_name: Option<String>) -> Self {
        self.configured = port_name;
        self
    }

    pub fn probe(&self, port: &CandidatePort) -> Option<Driver> {
        if self.configured.as_deref() == Some(port.name.as_str()) {
            return Some(Driver {
                port: port.clone(),
                kind: DriverKind::Configured,
            });
        }
        let ids = port.usb.as_ref()?;
        if let Some(sig) = self
            .signatures
            .iter()
            .find(|sig| sig.vid == ids.vid && sig.pid == ids.pid)
        {
            return Some(Driver {
                port: port.clone(),
                kind: DriverKind::Known(sig.name.clone()),
            });
        }
        self.allow_generic_usb.then(|| Driver {
            port: port.clone(),
            kind: DriverKind::GenericUsb,
        })
    }
}

/// Pick the driver to use: configured or known matches first, in
/// enumeration order, then generic ones.
pub fn select_driver(drivers: Vec<Driver>) -> Option<Driver> {
    let preferred = drivers
        .iter()
        .position(|d| !matches!(d.kind, DriverKind::GenericUsb));
    match preferred {
        Some(index) => drivers.into_iter().nth(index),
        None => drivers.into_iter().next(),
    }
}

// ----------------------------------------------------------------------------
// Permission
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

/// Pending answer to a permission request.
#[derive(Debug)]
pub struct PermissionTicket {
    rx: mpsc::Receiver<PermissionOutcome>,
}

/// Resolves a [`PermissionTicket`]. Dropping it unresolved denies.
#[derive(Debug)]
pub struct PermissionResolver {
    tx: mpsc::SyncSender<PermissionOutcome>,
}

impl PermissionTicket {
    pub fn pending() -> (PermissionResolver, PermissionTicket) {
        let (tx, rx) = mpsc::sync_channel(1);
        (PermissionResolver { tx }, PermissionTicket { rx })
    }

    pub fn ready(outcome: PermissionOutcome) -> Self {
        let (resolver, ticket) = Self::pending();
        resolver.resolve(outcome);
        ticket
    }

    /// Non-blocking check.
    pub fn try_outcome(&self) -> Option<PermissionOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(PermissionOutcome::Denied),
        }
    }

    pub fn wait(&self, timeout: Duration) -> Option<PermissionOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(PermissionOutcome::Denied),
        }
    }
}

impl PermissionResolver {
    pub fn resolve(self, outcome: PermissionOutcome) {
        let _ = self.tx.try_send(outcome);
    }
}

// ----------------------------------------------------------------------------
// Capabilities
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for LineParams {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl std::fmt::Display for LineParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        write!(
            f,
            "{} baud ({}-{}-{})",
            self.baud_rate, self.data_bits, parity, self.stop_bits
        )
    }
}

pub trait DeviceManager {
    fn enumerate(&self) -> Result<Vec<CandidatePort>, LinkError>;

    fn probe(&self, port: &CandidatePort) -> Option<Driver>;

    fn has_permission(&self, driver: &Driver) -> bool;

    fn request_permission(&self, driver: &Driver) -> PermissionTicket;

    fn open(&self, driver: &Driver) -> Result<Box<dyn SerialLink>, LinkError>;
}

/// An open serial port. Owned by exactly one party at a time.
pub trait SerialLink: Send {
    fn name(&self) -> &str;

    fn configure(&mut self, params: &LineParams) -> Result<(), LinkError>;

    fn set_line_state(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError>;

    /// Best effort; many CDC-ACM drivers do not support it.
    fn purge_buffers(&mut self, input: bool, output: bool) -> Result<(), LinkError>;

    /// Blocking read bounded by `timeout`. A timeout yields `Ok(0)`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn close(&mut self);
}

// ----------------------------------------------------------------------------
// Port ownership
// ----------------------------------------------------------------------------

/// The single-link slot. At most one [`PortLease`] exists per slot.
#[derive(Clone, Debug, Default)]
pub struct PortSlot {
    held: Arc<AtomicBool>,
}

impl PortSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) -> Option<PortLease> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PortLease {
                held: self.held.clone(),
            })
    }
}

#[derive(Debug)]
pub struct PortLease {
    held: Arc<AtomicBool>,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

struct OpenLink {
    link: Box<dyn SerialLink>,
    _lease: PortLease,
}

impl Drop for OpenLink {
    fn drop(&mut self) {
        log::debug!("closing port {}", self.link.name());
        self.link.close();
    }
}

type LinkCell = Arc<Mutex<Option<OpenLink>>>;

fn lock_cell(cell: &LinkCell) -> MutexGuard<'_, Option<OpenLink>> {
    cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An open link plus its slot lease. Dropping it closes the port, then
/// frees the slot. A [`PortCloser`] can do the same from another thread.
pub struct OwnedPort {
    name: String,
    cell: LinkCell,
}

impl OwnedPort {
    pub fn new(link: Box<dyn SerialLink>, lease: PortLease) -> Self {
        Self {
            name: link.name().to_string(),
            cell: Arc::new(Mutex::new(Some(OpenLink {
                link,
                _lease: lease,
            }))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` against the link. `None` once the port has been closed.
    pub fn with_link<R>(&self, f: impl FnOnce(&mut dyn SerialLink) -> R) -> Option<R> {
        let mut guard = lock_cell(&self.cell);
        guard.as_mut().map(|open| f(open.link.as_mut()))
    }

    pub fn is_closed(&self) -> bool {
        lock_cell(&self.cell).is_none()
    }

    pub fn closer(&self) -> PortCloser {
        PortCloser {
            name: self.name.clone(),
            cell: self.cell.clone(),
        }
    }
}

impl Drop for OwnedPort {
    fn drop(&mut self) {
        let open = lock_cell(&self.cell).take();
        drop(open);
    }
}

/// Closes an [`OwnedPort`] from outside its owning thread.
#[derive(Clone)]
pub struct PortCloser {
    name: String,
    cell: LinkCell,
}

impl PortCloser {
    /// Close the port, waiting up to `wait` for an in-flight call on the
    /// link to return. Returns false if the link stayed busy.
    pub fn close(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let open = match self.cell.try_lock() {
                Ok(mut guard) => guard.take(),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        log::warn!("{} still busy after {:?}; not closed", self.name, wait);
                        return false;
                    }
                    std::thread::sleep(CLOSE_POLL);
                    continue;
                }
            };
            if open.is_some() {
                log::info!("{} closed from the controller side", self.name);
            }
            return true;
        }
    }
}

impl std::fmt::Debug for PortCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortCloser").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signature_beats_generic() {
        let prober = Prober::new(default_signatures(), true);
        let generic = CandidatePort::usb("/dev/ttyUSB0", 0x10C4, 0xEA60);
        let openmv = CandidatePort::usb("/dev/ttyACM0", 0x1209, 0xABD1);
        let drivers: Vec<Driver> = [generic, openmv]
            .iter()
            .filter_map(|c| prober.probe(c))
            .collect();
        let chosen = select_driver(drivers).map(|d| d.port.name);
        assert_eq!(chosen.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn unknown_usb_rejected_without_generic_fallback() {
        let prober = Prober::new(default_signatures(), false);
        let port = CandidatePort::usb("/dev/ttyUSB0", 0x10C4, 0xEA60);
        assert!(prober.probe(&port).is_none());
        assert_eq!(port.describe(), "VID:10C4 PID:EA60");
    }

    #[test]
    fn configured_port_needs_no_usb_ids() {
        let prober =
            Prober::new(Vec::new(), false).with_configured(Some("/dev/pts/4".to_string()));
        let port = CandidatePort {
            name: "/dev/pts/4".to_string(),
            usb: None,
        };
        let driver = prober.probe(&port).map(|d| d.kind);
        assert_eq!(driver, Some(DriverKind::Configured));
    }

    #[test]
    fn dropped_resolver_denies() {
        let (resolver, ticket) = PermissionTicket::pending();
        assert_eq!(ticket.try_outcome(), None);
        drop(resolver);
        assert_eq!(ticket.try_outcome(), Some(PermissionOutcome::Denied));
    }

    #[test]
    fn slot_allows_single_lease() {
        let slot = PortSlot::new();
        let lease = slot.acquire();
        assert!(lease.is_some());
        assert!(slot.acquire().is_none());
        drop(lease);
        assert!(!slot.is_held());
        assert!(slot.acquire().is_some());
    }

    #[test]
    fn closer_closes_and_frees_the_slot() -> anyhow::Result<()> {
        let manager = StubDeviceManager::new().with_script(Vec::new());
        let controller = manager.controller();
        let candidate = manager.enumerate()?.remove(0);
        let driver = manager
            .probe(&candidate)
            .ok_or_else(|| anyhow::anyhow!("no driver"))?;
        let slot = PortSlot::new();
        let lease = slot.acquire().ok_or_else(|| anyhow::anyhow!("slot held"))?;
        let port = OwnedPort::new(manager.open(&driver)?, lease);

        assert!(port.closer().close(Duration::from_millis(10)));
        assert!(port.is_closed());
        assert!(!slot.is_held());
        assert_eq!(controller.open_links(), 0);
        assert!(port.with_link(|link| link.name().to_string()).is_none());
        // Closing twice is harmless.
        assert!(port.closer().close(Duration::ZERO));
        drop(port);
        assert_eq!(controller.closes(), 1);
        Ok(())
    }

    #[test]
    fn line_params_display() {
        assert_eq!(LineParams::default().to_string(), "115200 baud (8-N-1)");
    }
}
