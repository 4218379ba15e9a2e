//! Error type shared by every layer of the multiplexer.
//!
//! Resolution failures (`NoControllers`, `AddressUnresolved`, `Ambiguous`,
//! `DeviceNotFound`) and transfer hiccups (`NoData`, `ShortWrite`,
//! `ShortRead`) are local and leave every link and controller in place, so an
//! interactive caller can simply retry. Hard errors come from the transport
//! or from the scan machinery itself. Even then a controller is never torn
//! down behind the caller's back: only a failed handshake or an explicit
//! close does that.

use std::io;

use thiserror::Error;

use crate::protocol::MAX_GPIB_ADDRESS;

/// Convenience alias for results returned by the GPIB layer.
pub type GpibResult<T> = std::result::Result<T, GpibError>;

/// How a caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recoverable; the same call may succeed later.
    Soft,
    /// Descriptor-level or machinery failure.
    Hard,
}

#[derive(Error, Debug)]
pub enum GpibError {
    #[error("No free controller slot (pool capacity {capacity})")]
    ResourceExhausted { capacity: usize },

    #[error("No compatible GPIB adapter found")]
    NoAdapterFound,

    #[error("Adapter scan failed: {0}")]
    ScanFailed(String),

    #[error("Device \"{0}\" did not answer on any controller")]
    DeviceNotFound(String),

    #[error("No controllers detected")]
    NoControllers,

    #[error("No mapping for device \"{0}\"")]
    AddressUnresolved(String),

    #[error(
        "Device \"{name}\" could be on any of {controllers} controllers and does not answer serial polls"
    )]
    Ambiguous { name: String, controllers: usize },

    #[error("No such device open: \"{0}\"")]
    NotOpen(String),

    #[error("Device \"{0}\" does not support serial poll")]
    PollUnsupported(String),

    #[error("Invalid GPIB address {0} (valid range is 0..={max})", max = MAX_GPIB_ADDRESS)]
    InvalidAddress(i64),

    #[error("Unknown device option \"{0}\"")]
    UnknownOption(String),

    #[error("Controller {0} is not open")]
    ControllerClosed(usize),

    #[error("Controller {0} already carries user data")]
    UserDataPresent(usize),

    #[error("No data from device \"{name}\"")]
    NoData { name: String, status: Option<u8> },

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Short read: {received} of {expected} bytes")]
    ShortRead { received: usize, expected: usize },

    #[error("I/O error: {0}")]
    HardIo(#[from] io::Error),
}

impl GpibError {
    pub fn severity(&self) -> Severity {
        match self {
            GpibError::HardIo(_)
            | GpibError::ScanFailed(_)
            | GpibError::ResourceExhausted { .. }
            | GpibError::ControllerClosed(_) => Severity::Hard,
            _ => Severity::Soft,
        }
    }

    /// True for failures a caller can retry without reopening anything.
    pub fn is_retryable(&self) -> bool {
        self.severity() == Severity::Soft
    }
}
