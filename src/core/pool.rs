use std::any::Any;

use serde::Serialize;
use strum::Display;

use crate::{
    protocol::{command::parse_status_reply, Candidate, Command, Transport},
    GpibError, GpibResult,
};

/// Longest `++spoll` reply we bother reading ("255\r\n" plus slack).
const STATUS_REPLY_LEN: usize = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    Empty,
    Ready,
}

/// Last soft failure recorded on a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum SlotError {
    #[strum(to_string = "buffer full")]
    BufferFull = 1,
    #[strum(to_string = "no listener")]
    NoListener = 2,
    #[strum(to_string = "read timeout")]
    ReadTimeout = 6,
    #[strum(to_string = "serial poll lost")]
    PollLost = 15,
}

/// One adapter position in the pool.
pub struct ControllerSlot {
    index: usize,
    state: SlotState,
    transport: Option<Box<dyn Transport>>,
    node: Option<u32>,
    port_path: Option<String>,
    version: Option<String>,
    active_address: Option<u8>,
    pub(crate) auto_read: bool,
    pub(crate) last_error: Option<SlotError>,
    user_data: Option<Box<dyn Any + Send>>,
}

impl ControllerSlot {
    fn empty(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Empty,
            transport: None,
            node: None,
            port_path: None,
            version: None,
            active_address: None,
            auto_read: false,
            last_error: None,
            user_data: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SlotState::Ready
    }

    pub fn node(&self) -> Option<u32> {
        self.node
    }

    pub fn port_path(&self) -> Option<&str> {
        self.port_path.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Bus address the adapter was last told to talk to.
    pub fn active_address(&self) -> Option<u8> {
        self.active_address
    }

    pub fn last_error(&self) -> Option<SlotError> {
        self.last_error
    }

    fn transport(&mut self) -> GpibResult<&mut Box<dyn Transport>> {
        let index = self.index;
        self.transport
            .as_mut()
            .ok_or(GpibError::ControllerClosed(index))
    }

    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> GpibResult<()> {
        let written = self.transport()?.write(bytes)?;
        if written != bytes.len() {
            return Err(GpibError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn command(&mut self, command: Command) -> GpibResult<()> {
        log::debug!("controller {}: {command}", self.index);
        self.write_all(&command.to_bytes())
    }

    pub(crate) fn read(&mut self, buf: &mut [u8], timeout_ms: u64) -> GpibResult<usize> {
        Ok(self.transport()?.poll_read(buf, timeout_ms)?)
    }

    pub(crate) fn discard(&mut self) -> GpibResult<()> {
        Ok(self.transport()?.discard()?)
    }

    /// Turn auto-read mode off and drop anything the adapter forwarded on
    /// its own that nobody collected.
    pub(crate) fn leave_auto(&mut self) -> GpibResult<()> {
        if self.auto_read {
            self.command(Command::Auto(false))?;
            self.auto_read = false;
            self.discard()?;
        }
        Ok(())
    }

    /// Point the adapter at `address`, skipping the command when it already
    /// is. Returns whether `++addr` went out.
    ///
    /// Auto-read mode belongs to the device it was armed for and is left
    /// before talking to another one.
    pub(crate) fn select(&mut self, address: u8) -> GpibResult<bool> {
        if self.active_address == Some(address) {
            return Ok(false);
        }
        self.leave_auto()?;
        // Unknown until the write is known to have landed.
        self.active_address = None;
        self.command(Command::Address(address))?;
        self.active_address = Some(address);
        Ok(true)
    }

    pub(crate) fn forget_address(&mut self, address: u8) {
        if self.active_address == Some(address) {
            self.active_address = None;
        }
    }

    /// Serial-poll whatever is currently addressed.
    ///
    /// `None` means no usable answer; the reason is left in `last_error`.
    pub(crate) fn serial_poll(&mut self, timeout_ms: u64) -> GpibResult<Option<u8>> {
        self.command(Command::SerialPoll)?;
        let mut reply = [0u8; STATUS_REPLY_LEN];
        let n = self.read(&mut reply, timeout_ms)?;
        if n == 0 {
            self.last_error = Some(SlotError::PollLost);
            return Ok(None);
        }
        match parse_status_reply(&reply[..n]) {
            Some(status) => {
                self.last_error = None;
                Ok(Some(status))
            }
            None => {
                self.last_error = Some(SlotError::NoListener);
                Ok(None)
            }
        }
    }
}

/// Snapshot of a Ready controller for callers outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerInfo {
    pub index: usize,
    pub node: Option<u32>,
    pub port: Option<String>,
    pub version: Option<String>,
    pub active_address: Option<u8>,
    pub last_error: Option<SlotError>,
}

/// Fixed-capacity set of adapter slots.
pub struct ControllerPool {
    slots: Vec<ControllerSlot>,
}

impl ControllerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(ControllerSlot::empty).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&ControllerSlot> {
        self.slots.get(index)
    }

    /// Mutable access to a Ready slot.
    pub(crate) fn ready_mut(&mut self, index: usize) -> GpibResult<&mut ControllerSlot> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_ready() => Ok(slot),
            _ => Err(GpibError::ControllerClosed(index)),
        }
    }

    pub fn ready_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.is_ready())
            .map(|s| s.index)
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_ready()).count()
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.state == SlotState::Empty)
            .map(|s| s.index)
    }

    /// Index of the Ready slot holding device node `node`, if any.
    pub fn owner_of_node(&self, node: u32) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.is_ready() && s.node == Some(node))
            .map(|s| s.index)
    }

    pub(crate) fn install(
        &mut self,
        index: usize,
        candidate: &Candidate,
        transport: Box<dyn Transport>,
        version: String,
    ) -> GpibResult<&mut ControllerSlot> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(GpibError::ControllerClosed(index))?;
        *slot = ControllerSlot {
            state: SlotState::Ready,
            transport: Some(transport),
            node: Some(candidate.node),
            port_path: Some(candidate.path.clone()),
            version: Some(version),
            ..ControllerSlot::empty(index)
        };
        Ok(slot)
    }

    /// Drop the transport and reset the slot. Returns whether it was Ready.
    pub(crate) fn release(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        let was_ready = slot.is_ready();
        if was_ready {
            log::info!(
                "Closing controller {index} ({})",
                slot.port_path.as_deref().unwrap_or("?")
            );
        }
        *slot = ControllerSlot::empty(index);
        was_ready
    }

    pub fn info(&self) -> Vec<ControllerInfo> {
        self.slots
            .iter()
            .filter(|s| s.is_ready())
            .map(|s| ControllerInfo {
                index: s.index,
                node: s.node,
                port: s.port_path.clone(),
                version: s.version.clone(),
                active_address: s.active_address,
                last_error: s.last_error,
            })
            .collect()
    }

    /// Attach an opaque value to a Ready controller. Fails if one is already
    /// attached; the value is dropped with the controller.
    pub fn set_user_data(&mut self, index: usize, data: Box<dyn Any + Send>) -> GpibResult<()> {
        let slot = self.ready_mut(index)?;
        if slot.user_data.is_some() {
            return Err(GpibError::UserDataPresent(index));
        }
        slot.user_data = Some(data);
        Ok(())
    }

    pub fn user_data(&self, index: usize) -> Option<&(dyn Any + Send)> {
        self.slots.get(index)?.user_data.as_deref()
    }

    pub fn take_user_data(&mut self, index: usize) -> Option<Box<dyn Any + Send>> {
        self.slots.get_mut(index)?.user_data.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sim::{SimAdapter, SimInstrument};

    fn pool_with_adapter(adapter: &SimAdapter) -> ControllerPool {
        let mut pool = ControllerPool::new(3);
        let candidate = Candidate::new(adapter.path(), adapter.node());
        pool.install(
            0,
            &candidate,
            Box::new(adapter.connect().unwrap()),
            "test".into(),
        )
        .unwrap();
        pool
    }

    #[test]
    fn test_select_is_cached() {
        let adapter = SimAdapter::prologix(0);
        let mut pool = pool_with_adapter(&adapter);
        let slot = pool.ready_mut(0).unwrap();

        assert!(slot.select(4).unwrap());
        assert!(!slot.select(4).unwrap());
        assert!(slot.select(7).unwrap());
        assert_eq!(adapter.count_commands("++addr"), 2);

        slot.forget_address(7);
        assert!(slot.select(7).unwrap());
        assert_eq!(adapter.count_commands("++addr"), 3);
    }

    #[test]
    fn test_serial_poll_outcomes() {
        let adapter =
            SimAdapter::prologix(0).with_instrument(SimInstrument::echo(5).with_status(0x42));
        let mut pool = pool_with_adapter(&adapter);
        let slot = pool.ready_mut(0).unwrap();

        slot.select(5).unwrap();
        assert_eq!(slot.serial_poll(0).unwrap(), Some(0x42));
        assert_eq!(slot.last_error(), None);

        slot.select(6).unwrap();
        assert_eq!(slot.serial_poll(0).unwrap(), None);
        assert_eq!(slot.last_error(), Some(SlotError::PollLost));
    }

    #[test]
    fn test_release_and_node_claims() {
        let adapter = SimAdapter::prologix(2);
        let mut pool = pool_with_adapter(&adapter);
        assert_eq!(pool.owner_of_node(2), Some(0));
        assert_eq!(pool.free_slot(), Some(1));
        assert_eq!(pool.ready_count(), 1);

        assert!(pool.release(0));
        assert!(!adapter.is_open());
        assert_eq!(pool.owner_of_node(2), None);
        assert!(!pool.release(0));
        assert!(matches!(pool.ready_mut(0), Err(GpibError::ControllerClosed(0))));
    }

    #[test]
    fn test_user_data_single_occupancy() {
        let adapter = SimAdapter::prologix(0);
        let mut pool = pool_with_adapter(&adapter);

        pool.set_user_data(0, Box::new(42u32)).unwrap();
        assert!(matches!(
            pool.set_user_data(0, Box::new(7u32)),
            Err(GpibError::UserDataPresent(0))
        ));
        let value = pool.user_data(0).and_then(|d| d.downcast_ref::<u32>());
        assert_eq!(value, Some(&42));

        assert!(pool.set_user_data(1, Box::new(1u8)).is_err());

        let taken = pool.take_user_data(0).unwrap();
        assert_eq!(taken.downcast_ref::<u32>(), Some(&42));
        pool.set_user_data(0, Box::new(7u32)).unwrap();
        pool.release(0);
        assert!(pool.user_data(0).is_none());
    }

    #[test]
    fn test_write_failures() {
        let adapter = SimAdapter::prologix(0);
        let mut pool = pool_with_adapter(&adapter);
        let slot = pool.ready_mut(0).unwrap();

        adapter.set_write_fault(crate::protocol::sim::WriteFault::Short);
        assert!(matches!(
            slot.write_all(b"abc"),
            Err(GpibError::ShortWrite { written: 2, expected: 3 })
        ));

        adapter.set_write_fault(crate::protocol::sim::WriteFault::Error);
        assert!(matches!(slot.select(3), Err(GpibError::HardIo(_))));
        assert_eq!(slot.active_address(), None);
    }
}
