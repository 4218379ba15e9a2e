use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::GpibResult;

/// Gap after which an in-progress read is considered finished.
pub const INTER_CHAR_TIMEOUT_MS: u64 = 100;

/// A byte pipe to one adapter.
///
/// The pool is the only owner of a transport; dropping it closes the
/// underlying descriptor.
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Wait up to `timeout_ms` for the first byte, then keep reading until
    /// `buf` is full or the line stays quiet for [`INTER_CHAR_TIMEOUT_MS`].
    ///
    /// A `timeout_ms` of 0 starts reading at once. Returns the number of
    /// bytes read; 0 means nothing arrived in time.
    fn poll_read(&mut self, buf: &mut [u8], timeout_ms: u64) -> io::Result<usize>;

    /// Throw away anything pending in either direction.
    fn discard(&mut self) -> io::Result<()>;
}

/// A serial node that may have an adapter behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: String,
    /// Numeric suffix of the node (`/dev/ttyUSB3` → 3).
    pub node: u32,
}

impl Candidate {
    pub fn new(path: impl Into<String>, node: u32) -> Self {
        Self {
            path: path.into(),
            node,
        }
    }
}

/// Where candidate adapters come from and how they are opened.
pub trait PortProvider: Send {
    fn candidates(&mut self) -> GpibResult<Vec<Candidate>>;

    fn open(&mut self, candidate: &Candidate, baud_rate: u32) -> io::Result<Box<dyn Transport>>;
}

/// Real USB-serial nodes, opened through the `serialport` crate.
#[derive(Debug, Default)]
pub struct SerialPortProvider;

impl PortProvider for SerialPortProvider {
    fn candidates(&mut self) -> GpibResult<Vec<Candidate>> {
        super::tty::adapter_candidates()
    }

    fn open(&mut self, candidate: &Candidate, baud_rate: u32) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(&candidate.path, baud_rate)?))
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open raw 8N1 with hardware flow control, exclusive on Unix.
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let builder = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Hardware)
            .timeout(Duration::from_millis(INTER_CHAR_TIMEOUT_MS));

        #[cfg(unix)]
        let port: Box<dyn SerialPort> = {
            let mut handle = builder.open_native().map_err(io::Error::from)?;
            handle.set_exclusive(true).map_err(io::Error::from)?;
            Box::new(handle)
        };

        #[cfg(not(unix))]
        let port: Box<dyn SerialPort> = builder.open().map_err(io::Error::from)?;

        port.clear(ClearBuffer::All).map_err(io::Error::from)?;
        log::debug!("Opened {path} at {baud_rate} baud");
        Ok(Self { port })
    }

    fn read_some(&mut self, buf: &mut [u8], timeout_ms: u64) -> io::Result<usize> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms))
            .map_err(io::Error::from)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let n = self.port.write(bytes)?;
        self.port.flush()?;
        Ok(n)
    }

    fn poll_read(&mut self, buf: &mut [u8], timeout_ms: u64) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let first_wait = if timeout_ms == 0 {
            INTER_CHAR_TIMEOUT_MS
        } else {
            timeout_ms
        };
        let mut total = self.read_some(buf, first_wait)?;
        if total == 0 {
            return Ok(0);
        }
        while total < buf.len() {
            let n = self.read_some(&mut buf[total..], INTER_CHAR_TIMEOUT_MS)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn discard(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}
