//! Serial MJPEG link
//!
//! This crate turns the undelimited byte stream of a serial-over-USB camera
//! into discrete JPEG frames, and manages the connection that carries it.
//!
//! # Architecture
//!
//! The link keeps three guarantees by construction:
//!
//! 1. **Bounded buffering**: frames are reassembled inside one fixed arena;
//!    a stream without markers is discarded rather than grown into.
//! 2. **Single link**: at most one port is open at a time, and connecting
//!    while one is open does nothing.
//! 3. **No retry storms**: discovery, permission, open and configure
//!    failures wait for an explicit retry. Only stream and decode faults are
//!    recovered automatically, inside the read loop.
//!
//! # Module Structure
//!
//! - `assembler`: SOI/EOI frame extraction over a bounded arena
//! - `diagnostic`: fallback to raw-byte dumps when no frame decodes
//! - `decode`: decode capability (JPEG via the `image` crate)
//! - `device`: device and port capabilities, host (`serialport`) and `stub://` backends
//! - `reader`: the read loop thread
//! - `lifecycle`: the connection state machine
//! - `status`: link events and the latest-value presentation view
//! - `config`: layered configuration

pub mod assembler;
pub mod config;
pub mod decode;
pub mod device;
pub mod diagnostic;
pub mod error;
pub mod lifecycle;
pub mod reader;
pub mod status;

pub use assembler::{AssemblerConfig, Frame, FrameAssembler, FrameSpan, Ingest, EOI, SOI};
pub use config::LinkConfig;
pub use decode::{DecodedImage, FrameDecoder, JpegDecoder};
pub use device::{
    CandidatePort, DeviceManager, DeviceSignature, Driver, LineParams, PermissionOutcome,
    PermissionTicket, SerialDeviceManager, SerialLink, StubDeviceManager, StubRead,
};
pub use diagnostic::DiagnosticFallback;
pub use error::{ErrorClass, LinkError};
pub use lifecycle::{ConnectionLifecycle, ConnectionState, FailureKind};
pub use reader::{ReadLoop, ReadStats, ReaderHandle};
pub use status::{link_channel, EventReceiver, EventSender, LinkEvent, PresentationView, StatusSignal};

/// `stub://` URIs select the synthetic device backend.
pub fn is_stub_uri(device: &str) -> bool {
    device.starts_with("stub://")
}
