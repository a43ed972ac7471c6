//! Error taxonomy for the serial MJPEG link.
//!
//! Discovery, permission, open and configure failures are terminal for the
//! current connect attempt and surface as a status until the next explicit
//! retry. Stream I/O and decode failures are recovered inside the read loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("No USB Devices Attached. Check the cable.")]
    NoDevices,

    #[error("No Driver Found. Attached: {attached}")]
    NoDriver { attached: String },

    #[error("Scan Error: {0}")]
    Enumerate(String),

    #[error("Permission DENIED for {port}")]
    PermissionDenied { port: String },

    #[error("Open Failed for {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("Open Failed: previous port is still closing. Retry shortly.")]
    PortBusy,

    #[error("Configure failed ({step}): {reason}")]
    Configure { step: &'static str, reason: String },

    #[error("Stream Err: {0}")]
    StreamIo(#[from] std::io::Error),

    #[error("Failed to decode frame ({len} bytes): {reason}")]
    Decode { len: usize, reason: String },
}

/// Coarse class of a [`LinkError`], used for recovery policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Discovery,
    Permission,
    Open,
    Configure,
    StreamIo,
    Decode,
}

impl LinkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LinkError::NoDevices | LinkError::NoDriver { .. } | LinkError::Enumerate(_) => {
                ErrorClass::Discovery
            }
            LinkError::PermissionDenied { .. } => ErrorClass::Permission,
            LinkError::Open { .. } | LinkError::PortBusy => ErrorClass::Open,
            LinkError::Configure { .. } => ErrorClass::Configure,
            LinkError::StreamIo(_) => ErrorClass::StreamIo,
            LinkError::Decode { .. } => ErrorClass::Decode,
        }
    }

    /// Terminal errors end the current attempt; only an explicit retry restarts it.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.class(), ErrorClass::StreamIo | ErrorClass::Decode)
    }

    pub(crate) fn configure(step: &'static str, err: impl std::fmt::Display) -> Self {
        LinkError::Configure {
            step,
            reason: err.to_string(),
        }
    }
}
