use std::fmt;

/// How the adapter bounds a `++read` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTerminator {
    /// Read until the adapter's own read timeout.
    Timeout,
    /// Read until the instrument asserts EOI.
    Eoi,
    /// Read until the given character.
    Char(u8),
}

/// Characters the adapter appends to data it forwards to an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosMode {
    CrLf = 0,
    Cr = 1,
    Lf = 2,
    None = 3,
}

impl EosMode {
    pub fn from_terminators(cr: bool, lf: bool) -> Self {
        match (cr, lf) {
            (true, true) => EosMode::CrLf,
            (true, false) => EosMode::Cr,
            (false, true) => EosMode::Lf,
            (false, false) => EosMode::None,
        }
    }
}

/// One command of the Prologix controller protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Address(u8),
    SerialPoll,
    Read(ReadTerminator),
    Local,
    Clear,
    Trigger,
    InterfaceClear,
    Auto(bool),
    Eoi(bool),
    Eos(EosMode),
    /// `++mode 1` puts the adapter in controller mode.
    ControllerMode,
    ReadTimeout(u32),
}

impl Command {
    /// Bytes to put on the wire, including the trailing carriage return.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{self}\r").into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Version => write!(f, "++ver"),
            Command::Address(addr) => write!(f, "++addr {addr}"),
            Command::SerialPoll => write!(f, "++spoll"),
            Command::Read(ReadTerminator::Timeout) => write!(f, "++read"),
            Command::Read(ReadTerminator::Eoi) => write!(f, "++read eoi"),
            Command::Read(ReadTerminator::Char(c)) => write!(f, "++read {c}"),
            Command::Local => write!(f, "++loc"),
            Command::Clear => write!(f, "++clr"),
            Command::Trigger => write!(f, "++trg"),
            Command::InterfaceClear => write!(f, "++ifc"),
            Command::Auto(on) => write!(f, "++auto {}", u8::from(*on)),
            Command::Eoi(on) => write!(f, "++eoi {}", u8::from(*on)),
            Command::Eos(mode) => write!(f, "++eos {}", *mode as u8),
            Command::ControllerMode => write!(f, "++mode 1"),
            Command::ReadTimeout(ms) => write!(f, "++read_tmo_ms {ms}"),
        }
    }
}

/// Parse the decimal status byte the adapter returns for `++spoll`.
///
/// Returns `None` when the reply does not start with a number in `0..=255`.
pub fn parse_status_reply(reply: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(reply).ok()?;
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
