//! Events flowing from the link to the presentation layer.
//!
//! The read loop and the lifecycle never share fields with the UI. They send
//! [`LinkEvent`]s over a one-directional channel, and the UI side folds them
//! into a [`PresentationView`] where the latest frame and the latest status
//! each replace the previous value.

use std::sync::mpsc;
use std::time::{Duration, SystemTime};

use crate::decode::DecodedImage;
use crate::lifecycle::ConnectionState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Timestamped, human-readable status line.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSignal {
    pub message: String,
    pub severity: Severity,
    pub at: SystemTime,
}

impl StatusSignal {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Info,
            at: SystemTime::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
            at: SystemTime::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for StatusSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Clone, Debug)]
pub enum LinkEvent {
    State(ConnectionState),
    Status(StatusSignal),
    Frame(DecodedImage),
}

/// Sending half, cloned into the read loop thread.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<LinkEvent>,
}

impl EventSender {
    pub fn send(&self, event: LinkEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("presentation receiver dropped; event discarded");
        }
    }

    pub fn state(&self, state: ConnectionState) {
        self.send(LinkEvent::State(state));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(LinkEvent::Status(StatusSignal::info(message)));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(LinkEvent::Status(StatusSignal::error(message)));
    }

    pub fn frame(&self, image: DecodedImage) {
        self.send(LinkEvent::Frame(image));
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<LinkEvent>,
}

impl EventReceiver {
    pub fn next_timeout(&self, timeout: Duration) -> Option<LinkEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<LinkEvent> {
        self.rx.try_iter().collect()
    }
}

pub fn link_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// Latest-value view of the link, owned by the presentation side.
#[derive(Debug, Default)]
pub struct PresentationView {
    state: Option<ConnectionState>,
    status: Option<StatusSignal>,
    frame: Option<DecodedImage>,
    frames_seen: u64,
}

impl PresentationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::State(state) => self.state = Some(state),
            LinkEvent::Status(status) => self.status = Some(status),
            LinkEvent::Frame(image) => {
                self.frames_seen += 1;
                self.frame = Some(image);
            }
        }
    }

    /// Apply every queued event; returns how many were applied.
    pub fn drain(&mut self, receiver: &EventReceiver) -> usize {
        let events = receiver.drain();
        let count = events.len();
        for event in events {
            self.apply(event);
        }
        count
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.state
    }

    pub fn status(&self) -> Option<&StatusSignal> {
        self.status.as_ref()
    }

    pub fn frame(&self) -> Option<&DecodedImage> {
        self.frame.as_ref()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}
