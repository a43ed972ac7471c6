//! Connection lifecycle state machine.
//!
//! ```text
//! Idle ──retry──▶ Scanning ──▶ AwaitingPermission ──grant──▶ Opening ──▶ Configuring ──▶ Streaming
//!                    │                 │                       │             │              │
//!                    ▼                 ▼                       ▼             ▼              ▼
//!            Error(no devices,   PermissionDenied       Error(open)  Error(configure)    Closed
//!              no driver, scan)
//! ```
//!
//! Every transition emits a [`ConnectionState`] event and a status line.
//! Terminal failures close whatever port is open and wait for an explicit
//! [`ConnectionLifecycle::retry`]; nothing here retries on its own.
//!
//! `Streaming` and `DiagnosticMode` are sub-states owned by the read loop.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::LinkConfig;
use crate::decode::FrameDecoder;
use crate::device::{
    select_driver, DeviceManager, Driver, LineParams, OwnedPort, PermissionOutcome,
    PermissionTicket, PortSlot,
};
use crate::error::LinkError;
use crate::reader::{ReadLoop, ReadLoopConfig, ReadStats, ReaderHandle};
use crate::status::{EventSender, LinkEvent, StatusSignal};

/// Why the last attempt ended in [`ConnectionState::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    NoDevices,
    NoDriver,
    ScanFailed,
    OpenFailed,
    ConfigureFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureKind::NoDevices => "no devices",
            FailureKind::NoDriver => "no driver",
            FailureKind::ScanFailed => "scan failed",
            FailureKind::OpenFailed => "open failed",
            FailureKind::ConfigureFailed => "configure failed",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    AwaitingPermission,
    PermissionDenied,
    Opening,
    Configuring,
    Streaming,
    DiagnosticMode,
    Error(FailureKind),
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Scanning => f.write_str("scanning"),
            ConnectionState::AwaitingPermission => f.write_str("awaiting permission"),
            ConnectionState::PermissionDenied => f.write_str("permission denied"),
            ConnectionState::Opening => f.write_str("opening"),
            ConnectionState::Configuring => f.write_str("configuring"),
            ConnectionState::Streaming => f.write_str("streaming"),
            ConnectionState::DiagnosticMode => f.write_str("diagnostic"),
            ConnectionState::Error(kind) => write!(f, "error ({})", kind),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

struct PendingPermission {
    driver: Driver,
    ticket: PermissionTicket,
}

pub struct ConnectionLifecycle<D: DeviceManager> {
    devices: D,
    decoder: Arc<dyn FrameDecoder>,
    events: EventSender,
    line: LineParams,
    line_settle: Duration,
    join_timeout: Duration,
    reader_config: ReadLoopConfig,
    slot: PortSlot,
    state: ConnectionState,
    pending: Option<PendingPermission>,
    reader: Option<ReaderHandle>,
    last_stats: ReadStats,
}

impl<D: DeviceManager> ConnectionLifecycle<D> {
    pub fn new(
        devices: D,
        cfg: &LinkConfig,
        decoder: Arc<dyn FrameDecoder>,
        events: EventSender,
    ) -> Self {
        Self {
            devices,
            decoder,
            events,
            line: cfg.line_params(),
            line_settle: cfg.timing.line_settle,
            join_timeout: cfg.timing.join_timeout,
            reader_config: ReadLoopConfig::from_config(cfg),
            slot: PortSlot::new(),
            state: ConnectionState::Idle,
            pending: None,
            reader: None,
            last_stats: ReadStats::default(),
        }
    }

    /// Current state; reports `DiagnosticMode` while the read loop is in it.
    pub fn state(&self) -> ConnectionState {
        match (&self.reader, self.state) {
            (Some(reader), ConnectionState::Streaming) if reader.is_diagnostic() => {
                ConnectionState::DiagnosticMode
            }
            (_, state) => state,
        }
    }

    pub fn devices(&self) -> &D {
        &self.devices
    }

    /// True while a port is open, including one held by a detached reader.
    pub fn port_open(&self) -> bool {
        self.reader.is_some() || self.slot.is_held()
    }

    /// Read statistics of the running loop, or of the last one.
    pub fn stats(&self) -> ReadStats {
        match &self.reader {
            Some(reader) => reader.stats(),
            None => self.last_stats,
        }
    }

    /// Tear down anything running, then scan.
    pub fn retry(&mut self) -> ConnectionState {
        log::info!("retry requested in state {}", self.state);
        self.pending = None;
        self.stop_reader();
        self.scan()
    }

    fn scan(&mut self) -> ConnectionState {
        self.transition(
            ConnectionState::Scanning,
            StatusSignal::info("Checking USB Devices..."),
        );
        let candidates = match self.devices.enumerate() {
            Ok(candidates) => candidates,
            Err(err) => return self.fail(FailureKind::ScanFailed, err),
        };
        if candidates.is_empty() {
            return self.fail(FailureKind::NoDevices, LinkError::NoDevices);
        }
        for candidate in &candidates {
            log::debug!("candidate port {} ({})", candidate.name, candidate.describe());
        }

        let drivers: Vec<Driver> = candidates
            .iter()
            .filter_map(|candidate| self.devices.probe(candidate))
            .collect();
        let Some(driver) = select_driver(drivers) else {
            let attached = candidates
                .iter()
                .map(|candidate| candidate.describe())
                .collect::<Vec<_>>()
                .join(", ");
            return self.fail(FailureKind::NoDriver, LinkError::NoDriver { attached });
        };
        log::info!("selected {} ({:?})", driver.port.name, driver.kind);

        if self.devices.has_permission(&driver) {
            return self.connect(&driver);
        }
        self.transition(
            ConnectionState::AwaitingPermission,
            StatusSignal::info(format!(
                "Found: {}\nRequesting Permission...",
                driver.port.name
            )),
        );
        let ticket = self.devices.request_permission(&driver);
        self.pending = Some(PendingPermission { driver, ticket });
        self.poll_permission()
    }

    /// Non-blocking check of an outstanding permission request.
    pub fn poll_permission(&mut self) -> ConnectionState {
        let Some(pending) = self.pending.take() else {
            return self.state();
        };
        match pending.ticket.try_outcome() {
            Some(outcome) => self.on_permission(pending.driver, outcome),
            None => {
                self.pending = Some(pending);
                self.state()
            }
        }
    }

    /// Block up to `timeout` for an outstanding permission request.
    pub fn await_permission(&mut self, timeout: Duration) -> ConnectionState {
        let Some(pending) = self.pending.take() else {
            return self.state();
        };
        match pending.ticket.wait(timeout) {
            Some(outcome) => self.on_permission(pending.driver, outcome),
            None => {
                self.pending = Some(pending);
                self.state()
            }
        }
    }

    fn on_permission(&mut self, driver: Driver, outcome: PermissionOutcome) -> ConnectionState {
        match outcome {
            PermissionOutcome::Granted => {
                log::info!("permission granted for {}", driver.port.name);
                self.events.info("Permission granted. Connecting...");
                self.connect(&driver)
            }
            PermissionOutcome::Denied => {
                let err = LinkError::PermissionDenied {
                    port: driver.port.name,
                };
                log::warn!("{}", err);
                self.transition(
                    ConnectionState::PermissionDenied,
                    StatusSignal::error(err.to_string()),
                );
                self.state
            }
        }
    }

    /// Open, configure and start streaming from `driver`. A no-op while
    /// streaming; an `OpenFailed` error while a detached read loop still
    /// holds the previous port.
    pub fn connect(&mut self, driver: &Driver) -> ConnectionState {
        if self.reader.is_some() {
            log::info!("connect ignored: already streaming");
            return self.state();
        }
        let Some(lease) = self.slot.acquire() else {
            return self.fail(FailureKind::OpenFailed, LinkError::PortBusy);
        };

        self.transition(
            ConnectionState::Opening,
            StatusSignal::info("Connecting to device..."),
        );
        let link = match self.devices.open(driver) {
            Ok(link) => link,
            Err(err) => {
                drop(lease);
                return self.fail(FailureKind::OpenFailed, err);
            }
        };
        let port = OwnedPort::new(link, lease);

        self.transition(
            ConnectionState::Configuring,
            StatusSignal::info(format!("Configuring {} at {}", port.name(), self.line)),
        );
        if let Err(err) = self.configure(&port) {
            drop(port);
            return self.fail(FailureKind::ConfigureFailed, err);
        }

        let reader = ReadLoop::new(
            port,
            self.decoder.clone(),
            self.events.clone(),
            self.reader_config,
        );
        match reader.spawn() {
            Ok(handle) => self.reader = Some(handle),
            Err(err) => {
                let err = LinkError::Open {
                    port: driver.port.name.clone(),
                    reason: format!("read loop: {}", err),
                };
                return self.fail(FailureKind::OpenFailed, err);
            }
        }
        self.transition(
            ConnectionState::Streaming,
            StatusSignal::info("Connected! Waiting for stream..."),
        );
        self.state()
    }

    fn configure(&self, port: &OwnedPort) -> Result<(), LinkError> {
        let name = port.name();
        let settle = self.line_settle;
        let line = self.line;
        port.with_link(|link| -> Result<(), LinkError> {
            link.configure(&line)?;
            // Dropping DTR/RTS then raising them restarts the peripheral's output.
            link.set_line_state(false, false)?;
            thread::sleep(settle);
            link.set_line_state(true, true)?;
            if let Err(err) = link.purge_buffers(true, true) {
                log::warn!("{}: buffer purge failed, continuing: {}", name, err);
            }
            Ok(())
        })
        .unwrap_or_else(|| Err(LinkError::configure("open", "port closed")))?;
        log::info!("{} configured at {}", name, self.line);
        Ok(())
    }

    /// Stop the read loop, close the port and enter `Closed`.
    pub fn stop(&mut self) -> ConnectionState {
        self.pending = None;
        self.stop_reader();
        self.transition(ConnectionState::Closed, StatusSignal::info("Stopped."));
        self.state
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.last_stats = reader.stats();
            if !reader.stop(self.join_timeout) {
                log::error!("port is still busy; it closes when the detached read loop exits");
            }
            log::info!("read loop stats: {}", self.last_stats);
        }
    }

    fn fail(&mut self, kind: FailureKind, err: LinkError) -> ConnectionState {
        debug_assert!(err.is_terminal(), "{:?} is recovered in the read loop", err);
        log::error!("connect attempt failed ({}, {:?}): {}", kind, err.class(), err);
        self.stop_reader();
        self.transition(
            ConnectionState::Error(kind),
            StatusSignal::error(err.to_string()),
        );
        self.state
    }

    fn transition(&mut self, state: ConnectionState, status: StatusSignal) {
        log::info!("link state {} -> {}", self.state, state);
        self.state = state;
        self.events.state(state);
        self.events.send(LinkEvent::Status(status));
    }
}

impl<D: DeviceManager> Drop for ConnectionLifecycle<D> {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stub::{StubDeviceManager, StubPermission};
    use crate::device::CandidatePort;
    use crate::status::{link_channel, EventReceiver};

    fn quick_config() -> LinkConfig {
        let mut cfg = LinkConfig::default();
        cfg.timing.line_settle = Duration::from_millis(1);
        cfg.timing.read_timeout = Duration::from_millis(5);
        cfg.timing.idle_sleep = Duration::from_millis(1);
        cfg.timing.error_backoff = Duration::from_millis(1);
        cfg
    }

    fn lifecycle(
        manager: StubDeviceManager,
    ) -> (ConnectionLifecycle<StubDeviceManager>, EventReceiver) {
        let (tx, rx) = link_channel();
        let lifecycle = ConnectionLifecycle::new(
            manager,
            &quick_config(),
            Arc::new(crate::decode::JpegDecoder),
            tx,
        );
        (lifecycle, rx)
    }

    fn states(rx: &EventReceiver) -> Vec<ConnectionState> {
        rx.drain()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn starts_idle() {
        let (lifecycle, _rx) = lifecycle(StubDeviceManager::new());
        assert_eq!(lifecycle.state(), ConnectionState::Idle);
        assert!(!lifecycle.port_open());
    }

    #[test]
    fn scan_failure_is_terminal() {
        let (mut lifecycle, rx) = lifecycle(StubDeviceManager::new().failing_enumerate());
        assert_eq!(
            lifecycle.retry(),
            ConnectionState::Error(FailureKind::ScanFailed)
        );
        assert_eq!(
            states(&rx),
            vec![
                ConnectionState::Scanning,
                ConnectionState::Error(FailureKind::ScanFailed)
            ]
        );
    }

    #[test]
    fn configure_failure_closes_the_port() {
        let manager = StubDeviceManager::new().failing_configure();
        let controller = manager.controller();
        let (mut lifecycle, _rx) = lifecycle(manager);
        assert_eq!(
            lifecycle.retry(),
            ConnectionState::Error(FailureKind::ConfigureFailed)
        );
        assert_eq!(controller.opens(), 1);
        assert_eq!(controller.open_links(), 0);
        assert!(!lifecycle.port_open());
    }

    #[test]
    fn purge_failure_is_not_fatal() {
        let manager = StubDeviceManager::new().failing_purge();
        let controller = manager.controller();
        let (mut lifecycle, _rx) = lifecycle(manager);
        assert_eq!(lifecycle.retry(), ConnectionState::Streaming);
        assert_eq!(controller.line_states(), vec![(false, false), (true, true)]);
        assert_eq!(controller.configured(), vec![LineParams::default()]);
        lifecycle.stop();
    }

    #[test]
    fn generic_port_used_when_nothing_known_is_attached() {
        let manager = StubDeviceManager::new()
            .with_candidates(vec![CandidatePort::usb("stub://cp210x", 0x10C4, 0xEA60)])
            .with_prober(crate::device::Prober::new(
                crate::device::default_signatures(),
                true,
            ))
            .with_permission(StubPermission::GrantOnRequest);
        let (mut lifecycle, rx) = lifecycle(manager);
        assert_eq!(lifecycle.retry(), ConnectionState::Streaming);
        assert_eq!(
            states(&rx),
            vec![
                ConnectionState::Scanning,
                ConnectionState::AwaitingPermission,
                ConnectionState::Opening,
                ConnectionState::Configuring,
                ConnectionState::Streaming
            ]
        );
        assert_eq!(lifecycle.stop(), ConnectionState::Closed);
    }
}
