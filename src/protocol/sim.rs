//! In-process stand-in for Prologix adapters and the instruments behind them.
//!
//! A [`SimBench`] plays the part of the operating system's serial nodes: it
//! lists one candidate per [`SimAdapter`] and hands out [`SimPort`]
//! transports. Each adapter interprets the `++` command set, forwards data
//! lines to the addressed [`SimInstrument`] and keeps a log of every command
//! it received so tests can assert on the traffic.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    sync::Arc,
};

use parking_lot::Mutex;

use super::{
    command::parse_status_reply,
    escape::ESC,
    flags::STATUS_MESSAGE_AVAILABLE,
    transport::{Candidate, PortProvider, Transport},
};
use crate::GpibResult;

const PROLOGIX_VERSION: &[u8] = b"Prologix GPIB-USB Controller version 6.107\n";
const FOREIGN_VERSION: &[u8] = b"Arduino serial bridge ready\n";

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// One instrument on a simulated bus.
pub struct SimInstrument {
    address: u8,
    status: u8,
    ready_bit: u8,
    output: Vec<u8>,
    partial: Vec<u8>,
    received: Vec<Vec<u8>>,
    triggers: usize,
    clears: usize,
    responder: Responder,
}

impl SimInstrument {
    /// An instrument that answers each complete message through `responder`.
    pub fn new(
        address: u8,
        responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    ) -> Self {
        Self {
            address,
            status: 0,
            ready_bit: STATUS_MESSAGE_AVAILABLE,
            output: Vec::new(),
            partial: Vec::new(),
            received: Vec::new(),
            triggers: 0,
            clears: 0,
            responder: Box::new(responder),
        }
    }

    /// Answers `*IDN?` with `identity` followed by a newline.
    pub fn identity(address: u8, identity: &str) -> Self {
        let reply = format!("{identity}\n").into_bytes();
        Self::new(address, move |msg| {
            let text = String::from_utf8_lossy(msg);
            if text.trim().eq_ignore_ascii_case("*IDN?") {
                Some(reply.clone())
            } else {
                None
            }
        })
    }

    /// Answers every message with the message itself.
    pub fn echo(address: u8) -> Self {
        Self::new(address, |msg| Some(msg.to_vec()))
    }

    /// Answers every message with the same block of bytes.
    pub fn streaming(address: u8, block: Vec<u8>) -> Self {
        Self::new(address, move |_| Some(block.clone()))
    }

    /// Instrument that signals "data ready" with a different status bit.
    pub fn with_ready_bit(mut self, bit: u8) -> Self {
        self.ready_bit = bit;
        self
    }

    pub fn with_status(mut self, status: u8) -> Self {
        self.status = status;
        self
    }

    fn deliver(&mut self, message: Vec<u8>) {
        if let Some(reply) = (self.responder)(&message) {
            self.output = reply;
            self.status |= self.ready_bit;
        }
        self.received.push(message);
    }

    fn talk(&mut self) -> Vec<u8> {
        self.status &= !self.ready_bit;
        std::mem::take(&mut self.output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterKind {
    Prologix,
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    None,
    /// Every write fails with a broken pipe.
    Error,
    /// Every write stops one byte short.
    Short,
}

struct AdapterState {
    kind: AdapterKind,
    open: bool,
    opens: usize,
    deny_access: bool,
    garbled_version_replies: usize,
    write_fault: WriteFault,
    read_fault: bool,
    listed: bool,
    log: Vec<String>,
    line: Vec<u8>,
    escape: bool,
    output: VecDeque<u8>,
    address: Option<u8>,
    auto: bool,
    eoi: bool,
    eos: u8,
    read_timeout_ms: u32,
    instruments: BTreeMap<u8, SimInstrument>,
}

impl AdapterState {
    fn new(kind: AdapterKind) -> Self {
        Self {
            kind,
            open: false,
            opens: 0,
            deny_access: false,
            garbled_version_replies: 0,
            write_fault: WriteFault::None,
            read_fault: false,
            listed: true,
            log: Vec::new(),
            line: Vec::new(),
            escape: false,
            output: VecDeque::new(),
            address: None,
            auto: false,
            eoi: true,
            eos: 0,
            read_timeout_ms: 500,
            instruments: BTreeMap::new(),
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.escape {
                self.line.push(b);
                self.escape = false;
                continue;
            }
            match b {
                ESC => self.escape = true,
                b'\r' | b'\n' => self.finish_line(),
                _ => self.line.push(b),
            }
        }
    }

    fn finish_line(&mut self) {
        if self.line.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.line);
        if line.starts_with(b"++") {
            self.command(String::from_utf8_lossy(&line).into_owned());
        } else if self.kind == AdapterKind::Prologix {
            self.data(line);
        }
    }

    fn command(&mut self, text: String) {
        let mut parts = text.split_whitespace();
        let name = parts.next().unwrap_or_default().to_string();
        let arg = parts.next().map(str::to_string);
        self.log.push(text);

        if name == "++ver" {
            self.reply_version();
            return;
        }
        if self.kind != AdapterKind::Prologix {
            return;
        }
        let numeric = arg.as_deref().and_then(|a| a.parse::<u32>().ok());
        match name.as_str() {
            "++addr" => self.address = numeric.and_then(|n| u8::try_from(n).ok()),
            "++spoll" => {
                if let Some(inst) = self.addressed() {
                    let reply = format!("{}\n", inst.status);
                    self.output.extend(reply.as_bytes());
                }
            }
            "++read" => {
                if let Some(inst) = self.addressed() {
                    let data = inst.talk();
                    self.output.extend(data);
                }
            }
            "++auto" => self.auto = numeric == Some(1),
            "++eoi" => self.eoi = numeric == Some(1),
            "++eos" => self.eos = numeric.unwrap_or(0) as u8,
            "++read_tmo_ms" => self.read_timeout_ms = numeric.unwrap_or(0),
            "++clr" => {
                if let Some(inst) = self.addressed() {
                    inst.clears += 1;
                    inst.output.clear();
                    inst.status = 0;
                }
            }
            "++trg" => {
                if let Some(inst) = self.addressed() {
                    inst.triggers += 1;
                }
            }
            _ => {}
        }
    }

    fn reply_version(&mut self) {
        let reply = match self.kind {
            AdapterKind::Prologix => PROLOGIX_VERSION,
            AdapterKind::Foreign => FOREIGN_VERSION,
        };
        if self.garbled_version_replies > 0 {
            self.garbled_version_replies -= 1;
            self.output.extend(&reply[..4]);
        } else {
            self.output.extend(reply);
        }
    }

    fn data(&mut self, bytes: Vec<u8>) {
        let complete = self.eoi || self.eos != 3;
        let auto = self.auto;
        let Some(inst) = self.addressed() else {
            return;
        };
        inst.partial.extend(bytes);
        if !complete {
            return;
        }
        let message = std::mem::take(&mut inst.partial);
        inst.deliver(message);
        if auto {
            let data = inst.talk();
            self.output.extend(data);
        }
    }

    fn addressed(&mut self) -> Option<&mut SimInstrument> {
        let addr = self.address?;
        self.instruments.get_mut(&addr)
    }
}

/// Handle on one simulated adapter; clones share the same adapter.
#[derive(Clone)]
pub struct SimAdapter {
    node: u32,
    state: Arc<Mutex<AdapterState>>,
}

impl SimAdapter {
    /// A genuine Prologix adapter behind `/dev/ttyUSB<node>`.
    pub fn prologix(node: u32) -> Self {
        Self::with_kind(node, AdapterKind::Prologix)
    }

    /// Some other USB-serial device that fails the identity check.
    pub fn foreign(node: u32) -> Self {
        Self::with_kind(node, AdapterKind::Foreign)
    }

    fn with_kind(node: u32, kind: AdapterKind) -> Self {
        Self {
            node,
            state: Arc::new(Mutex::new(AdapterState::new(kind))),
        }
    }

    pub fn with_instrument(self, instrument: SimInstrument) -> Self {
        self.state
            .lock()
            .instruments
            .insert(instrument.address, instrument);
        self
    }

    /// Opening the node fails with a permission error.
    pub fn deny_access(self) -> Self {
        self.state.lock().deny_access = true;
        self
    }

    /// The first `count` version replies are cut short.
    pub fn garble_version_replies(self, count: usize) -> Self {
        self.state.lock().garbled_version_replies = count;
        self
    }

    pub fn set_write_fault(&self, fault: WriteFault) {
        self.state.lock().write_fault = fault;
    }

    /// Every read fails while set.
    pub fn set_read_fault(&self, on: bool) {
        self.state.lock().read_fault = on;
    }

    /// Whether the bench lists this adapter as a candidate. An open port
    /// keeps working when it is unlisted.
    pub fn set_listed(&self, listed: bool) {
        self.state.lock().listed = listed;
    }

    fn is_listed(&self) -> bool {
        self.state.lock().listed
    }

    pub fn node(&self) -> u32 {
        self.node
    }

    pub fn path(&self) -> String {
        format!("/dev/ttyUSB{}", self.node)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    /// Every `++` command received so far, without the trailing CR.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Number of logged commands starting with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn auto_mode(&self) -> bool {
        self.state.lock().auto
    }

    pub fn read_timeout_ms(&self) -> u32 {
        self.state.lock().read_timeout_ms
    }

    /// Complete messages the instrument at `address` has received.
    pub fn received(&self, address: u8) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .instruments
            .get(&address)
            .map(|i| i.received.clone())
            .unwrap_or_default()
    }

    pub fn triggers(&self, address: u8) -> usize {
        self.state
            .lock()
            .instruments
            .get(&address)
            .map_or(0, |i| i.triggers)
    }

    pub fn clears(&self, address: u8) -> usize {
        self.state
            .lock()
            .instruments
            .get(&address)
            .map_or(0, |i| i.clears)
    }

    /// Serial-poll the instrument directly, bypassing the adapter.
    pub fn instrument_status(&self, address: u8) -> Option<u8> {
        let reply = self
            .state
            .lock()
            .instruments
            .get(&address)
            .map(|i| format!("{}\n", i.status))?;
        parse_status_reply(reply.as_bytes())
    }

    pub fn connect(&self) -> io::Result<SimPort> {
        let mut state = self.state.lock();
        if state.deny_access {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", self.path()),
            ));
        }
        if state.open {
            return Err(io::Error::other(format!("{} is busy", self.path())));
        }
        state.open = true;
        state.opens += 1;
        state.output.clear();
        state.line.clear();
        state.escape = false;
        Ok(SimPort {
            state: Arc::clone(&self.state),
        })
    }
}

/// Transport end of a [`SimAdapter`]. Dropping it closes the adapter.
pub struct SimPort {
    state: Arc<Mutex<AdapterState>>,
}

impl Transport for SimPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        match state.write_fault {
            WriteFault::Error => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "adapter hung up",
            )),
            WriteFault::Short => {
                let n = bytes.len().saturating_sub(1);
                state.feed(&bytes[..n]);
                Ok(n)
            }
            WriteFault::None => {
                state.feed(bytes);
                Ok(bytes.len())
            }
        }
    }

    fn poll_read(&mut self, buf: &mut [u8], _timeout_ms: u64) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.read_fault {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "adapter stopped answering",
            ));
        }
        let n = buf.len().min(state.output.len());
        for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn discard(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.output.clear();
        state.line.clear();
        state.escape = false;
        Ok(())
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        self.state.lock().open = false;
    }
}

/// A set of simulated serial nodes; clones share the same adapters.
#[derive(Clone, Default)]
pub struct SimBench {
    adapters: Vec<SimAdapter>,
}

impl SimBench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: SimAdapter) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn adapter(&self, node: u32) -> Option<&SimAdapter> {
        self.adapters.iter().find(|a| a.node == node)
    }

    /// Number of adapters currently held open by a transport.
    pub fn open_adapters(&self) -> usize {
        self.adapters.iter().filter(|a| a.is_open()).count()
    }
}

impl PortProvider for SimBench {
    fn candidates(&mut self) -> GpibResult<Vec<Candidate>> {
        Ok(self
            .adapters
            .iter()
            .filter(|a| a.is_listed())
            .map(|a| Candidate::new(a.path(), a.node))
            .collect())
    }

    fn open(&mut self, candidate: &Candidate, _baud_rate: u32) -> io::Result<Box<dyn Transport>> {
        let adapter = self
            .adapter(candidate.node)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, candidate.path.clone()))?;
        Ok(Box::new(adapter.connect()?))
    }
}
