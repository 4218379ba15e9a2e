//! Wire-level pieces: the Prologix `++` command set, device behaviour flags,
//! the binary escape scheme, the byte transport and adapter enumeration.

pub mod command;
pub mod escape;
pub mod flags;
pub mod sim;
pub mod transport;
pub mod tty;

pub use command::{Command, EosMode, ReadTerminator};
pub use flags::DeviceFlags;
pub use transport::{Candidate, PortProvider, SerialPortProvider, Transport};

/// Highest primary address on a GPIB bus.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Leading bytes of the `++ver` reply of a genuine adapter.
pub const PRODUCT_SIGNATURE: &[u8] = b"Prologix";

/// Minimum number of `++ver` reply bytes needed to authenticate an adapter.
pub const VERSION_REPLY_LEN: usize = 12;

/// Line terminator the adapter expects after every data line.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Payloads at or above this many bytes are written with EOI held back.
pub const LARGE_PAYLOAD_THRESHOLD: usize = 499;

/// Check that an address fits on the bus and narrow it.
pub fn checked_address(address: i64) -> crate::GpibResult<u8> {
    if (0..=MAX_GPIB_ADDRESS as i64).contains(&address) {
        Ok(address as u8)
    } else {
        Err(crate::GpibError::InvalidAddress(address))
    }
}
