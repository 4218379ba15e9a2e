//! gpibmux — talk to GPIB instruments through Prologix USB adapters
//!
//! The crate multiplexes any number of named instruments over the adapters
//! plugged into the machine. Adapters are discovered and opened on demand,
//! instruments are bound to the adapter they answer on, and every transfer
//! re-addresses the bus only when the target actually changes.
//!
//! Most callers only need [`Gpib`]. The engine behind it lives in
//! [`core`], the wire protocol and transports in [`protocol`]; the
//! [`protocol::sim`] bench stands in for real hardware in tests.

pub mod api;
#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod error;
pub mod protocol;
#[doc(hidden)]
pub mod utils;

pub use api::*;
pub use error::{GpibError, GpibResult, Severity};
