//! Moving bytes between callers and instruments.
//!
//! Every operation resolves its device to a link first (opening it on
//! demand), points the owning adapter at the device's address and then talks
//! to it. Failures here never close a controller.

use std::ops::RangeInclusive;

use serde::Serialize;

use super::{
    bus::GpibBus,
    pool::{ControllerSlot, SlotError},
    registry::LinkInfo,
    settings::Timing,
};
use crate::{
    protocol::{
        checked_address,
        escape::{escape, split_last_unit},
        Command, DeviceFlags, EosMode, LARGE_PAYLOAD_THRESHOLD, LINE_TERMINATOR,
        MAX_GPIB_ADDRESS,
    },
    utils::sleep_ms,
    GpibError, GpibResult,
};

/// Bytes requested per read in a buffered receive.
pub const READ_CHUNK: usize = 1024;
/// Starting capacity of a buffered receive.
pub const INITIAL_READ_BUFFER: usize = 2 * READ_CHUNK;

/// Data read from an instrument together with its status byte, when one was
/// polled after the read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub data: Vec<u8>,
    pub status: Option<u8>,
}

/// An address that answered a serial poll during a bus scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub address: u8,
    pub controller: usize,
    pub status: u8,
}

fn set_auto(slot: &mut ControllerSlot, on: bool) -> GpibResult<()> {
    if !on {
        return slot.leave_auto();
    }
    if !slot.auto_read {
        slot.command(Command::Auto(true))?;
        slot.auto_read = true;
    }
    Ok(())
}

fn scan_controller(
    slot: &mut ControllerSlot,
    addresses: RangeInclusive<u8>,
    timing: &Timing,
    found: &mut Vec<Listener>,
) -> GpibResult<()> {
    slot.command(Command::ReadTimeout(timing.scan_read_timeout_ms))?;
    let scanned = poll_addresses(slot, addresses, timing, found);
    let restored = slot.command(Command::ReadTimeout(timing.adapter_read_timeout_ms));
    scanned.and(restored)
}

fn poll_addresses(
    slot: &mut ControllerSlot,
    addresses: RangeInclusive<u8>,
    timing: &Timing,
    found: &mut Vec<Listener>,
) -> GpibResult<()> {
    set_auto(slot, false)?;
    for address in addresses {
        if found.iter().any(|l| l.address == address) {
            continue;
        }
        slot.select(address)?;
        if let Some(status) = slot.serial_poll(timing.status_timeout_ms)? {
            log::info!(
                "Listener at {address} on controller {} (status {status})",
                slot.index()
            );
            found.push(Listener {
                address,
                controller: slot.index(),
                status,
            });
        }
    }
    Ok(())
}

fn write_line(slot: &mut ControllerSlot, data: &[u8]) -> GpibResult<()> {
    let mut line = Vec::with_capacity(data.len() + LINE_TERMINATOR.len());
    line.extend_from_slice(data);
    line.extend_from_slice(LINE_TERMINATOR);
    slot.write_all(&line)
}

impl GpibBus {
    /// Send `payload` to `name`.
    ///
    /// `options` may carry [`DeviceFlags::BINARY`], [`DeviceFlags::AUTO_READ`]
    /// and [`DeviceFlags::NO_TERMINATOR`]; other bits are ignored.
    pub fn send(&mut self, name: &str, payload: &[u8], options: DeviceFlags) -> GpibResult<()> {
        let (controller, address, link_flags) = self.target(name)?;
        let flags = link_flags | options.transient();
        let binary = flags.contains(DeviceFlags::BINARY);
        let data = if binary {
            escape(payload)
        } else {
            payload.to_vec()
        };

        let link = self.registry.link_mut(name)?;
        if flags.contains(DeviceFlags::NO_TERMINATOR) {
            link.defer(&data);
            log::debug!("\"{name}\": holding {} bytes", link.pending().len());
            return Ok(());
        }
        let mut message = link.take_pending();
        message.extend_from_slice(&data);

        let eoi = flags.contains(DeviceFlags::TERM_EOI);
        let eos = if binary {
            EosMode::None
        } else {
            flags.eos_mode()
        };
        let auto = flags.contains(DeviceFlags::AUTO_READ);

        let slot = self.pool.ready_mut(controller)?;
        slot.select(address)?;
        log::debug!("\"{name}\": sending {} bytes", message.len());

        if message.len() < LARGE_PAYLOAD_THRESHOLD {
            slot.command(Command::Eoi(eoi))?;
            slot.command(Command::Eos(eos))?;
            set_auto(slot, auto)?;
            return write_line(slot, &message);
        }

        // Hold back EOI and terminators until the final unit, and keep the
        // adapter from addressing the device to talk mid-message.
        let (bulk, last) = if binary {
            split_last_unit(&message)
        } else {
            message.split_at(message.len() - 1)
        };
        set_auto(slot, false)?;
        slot.command(Command::Eos(EosMode::None))?;
        slot.command(Command::Eoi(false))?;
        write_line(slot, bulk)?;
        slot.command(Command::Eos(eos))?;
        slot.command(Command::Eoi(eoi))?;
        set_auto(slot, auto)?;
        write_line(slot, last)
    }

    /// One read of at most `buf.len()` bytes from the device at `address`.
    fn read_chunk(
        &mut self,
        name: &str,
        controller: usize,
        address: u8,
        flags: DeviceFlags,
        buf: &mut [u8],
    ) -> GpibResult<(usize, Option<u8>)> {
        let timing = self.settings.timing.clone();
        let slot = self.pool.ready_mut(controller)?;
        let mask = flags.ready_mask();

        // Data is already on its way when this link is mid-transfer, or when
        // the adapter's auto mode was armed for this very address.
        let forwarded = flags.contains(DeviceFlags::AUTO_READ)
            || (slot.auto_read && slot.active_address() == Some(address));
        if !forwarded {
            set_auto(slot, false)?;
            if mask != 0 {
                let mut status = None;
                let mut ready = false;
                for attempt in 0..timing.status_retries {
                    if attempt > 0 {
                        sleep_ms(timing.status_interval_ms);
                    }
                    slot.select(address)?;
                    status = slot.serial_poll(timing.status_timeout_ms)?;
                    if status.is_some_and(|s| s & mask != 0) {
                        ready = true;
                        break;
                    }
                }
                if !ready {
                    slot.last_error = Some(SlotError::PollLost);
                    return Err(GpibError::NoData {
                        name: name.to_string(),
                        status,
                    });
                }
            } else {
                sleep_ms(timing.settle_delay_ms);
                slot.select(address)?;
            }
            slot.command(Command::Read(flags.read_terminator()))?;
        }

        sleep_ms(timing.settle_delay_ms);
        let timeout = if mask != 0 { 0 } else { timing.read_timeout_ms };
        let count = match slot.read(buf, timeout) {
            Ok(count) => count,
            Err(err) => {
                slot.last_error = Some(SlotError::ReadTimeout);
                return Err(err);
            }
        };
        if count == 0 {
            slot.last_error = Some(SlotError::NoListener);
            return Err(GpibError::NoData {
                name: name.to_string(),
                status: None,
            });
        }
        slot.last_error = None;

        let status = if count == buf.len() {
            slot.last_error = Some(SlotError::BufferFull);
            None
        } else if mask != 0 {
            slot.serial_poll(timing.status_timeout_ms)?
        } else {
            None
        };
        Ok((count, status))
    }

    /// Read up to `max_bytes` from `name`.
    pub fn receive(&mut self, name: &str, max_bytes: usize) -> GpibResult<Reply> {
        let (controller, address, flags) = self.target(name)?;
        let mut data = vec![0u8; max_bytes];
        let (count, status) = self.read_chunk(name, controller, address, flags, &mut data)?;
        data.truncate(count);
        Ok(Reply { data, status })
    }

    /// Read everything `name` has to say.
    ///
    /// Devices that do not end their output with EOI are cut off once the
    /// initial buffer is full, so a free-running instrument cannot stall us.
    pub fn buffered_receive(&mut self, name: &str) -> GpibResult<Reply> {
        let (controller, address, _) = self.target(name)?;
        let mut data = Vec::with_capacity(INITIAL_READ_BUFFER);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut status = None;

        let outcome = loop {
            let flags = self.registry.link_mut(name)?.flags();
            let (count, polled) =
                match self.read_chunk(name, controller, address, flags, &mut chunk) {
                    Ok(read) => read,
                    Err(err) => break Err(err),
                };
            data.extend_from_slice(&chunk[..count]);
            status = polled;

            if count == READ_CHUNK {
                // The rest of this transfer needs no new read request.
                self.registry.link_mut(name)?.set_auto_read(true);
            } else if flags.contains(DeviceFlags::STICKY_READY)
                || !polled.is_some_and(|s| s & flags.ready_mask() != 0)
            {
                break Ok(());
            }

            if data.len() + READ_CHUNK > data.capacity() {
                if !flags.contains(DeviceFlags::READ_EOI) {
                    log::debug!("\"{name}\": stopping after {} bytes", data.len());
                    break Ok(());
                }
                data.reserve_exact(data.capacity() * 2 - data.len());
            }
        };

        if let Ok(link) = self.registry.link_mut(name) {
            link.set_auto_read(false);
        }
        match outcome {
            Err(err) if data.is_empty() => Err(err),
            Err(err) => {
                log::debug!("\"{name}\": read ended early: {err}");
                Ok(Reply { data, status })
            }
            Ok(()) => Ok(Reply { data, status }),
        }
    }

    /// Send `payload`, then collect the whole answer.
    pub fn query(&mut self, name: &str, payload: &[u8], options: DeviceFlags) -> GpibResult<Reply> {
        self.send(name, payload, options)?;
        self.buffered_receive(name)
    }

    /// Status byte of `name` from a serial poll.
    pub fn status_byte(&mut self, name: &str) -> GpibResult<u8> {
        let (controller, address, flags) = self.target(name)?;
        if !flags.contains(DeviceFlags::HAS_SPOLL) {
            return Err(GpibError::PollUnsupported(name.to_string()));
        }
        let timeout = self.settings.timing.status_timeout_ms;
        let slot = self.pool.ready_mut(controller)?;
        slot.select(address)?;
        slot.serial_poll(timeout)?.ok_or_else(|| GpibError::NoData {
            name: name.to_string(),
            status: None,
        })
    }

    /// Address `name`, which puts it in remote mode.
    pub fn remote(&mut self, name: &str) -> GpibResult<()> {
        let (controller, address, _) = self.target(name)?;
        self.pool.ready_mut(controller)?.select(address)?;
        Ok(())
    }

    /// Return `name` to front-panel control.
    pub fn local(&mut self, name: &str) -> GpibResult<()> {
        let (controller, address, _) = self.target(name)?;
        let slot = self.pool.ready_mut(controller)?;
        slot.select(address)?;
        slot.command(Command::Local)?;
        // The adapter no longer has a talker selected.
        slot.forget_address(address);
        Ok(())
    }

    /// Send a selected device clear to `name`.
    pub fn clear(&mut self, name: &str) -> GpibResult<()> {
        self.addressed_command(name, Command::Clear)
    }

    /// Send a group execute trigger to `name`.
    pub fn trigger(&mut self, name: &str) -> GpibResult<()> {
        self.addressed_command(name, Command::Trigger)
    }

    fn addressed_command(&mut self, name: &str, command: Command) -> GpibResult<()> {
        let (controller, address, _) = self.target(name)?;
        let slot = self.pool.ready_mut(controller)?;
        slot.select(address)?;
        slot.command(command)
    }

    /// Every open link, with a fresh status byte for devices that answer
    /// serial polls.
    pub fn list_links(&mut self) -> Vec<LinkInfo> {
        let timeout = self.settings.timing.status_timeout_ms;
        let mut infos = Vec::new();
        for name in self.registry.link_names() {
            let Some(link) = self.registry.link(&name) else {
                continue;
            };
            let (controller, address, flags) = (link.controller(), link.address(), link.flags());
            let mut status = None;
            if flags.contains(DeviceFlags::HAS_SPOLL) {
                if let Ok(slot) = self.pool.ready_mut(controller) {
                    match slot.select(address).and_then(|_| slot.serial_poll(timeout)) {
                        Ok(polled) => status = polled,
                        Err(err) => log::warn!("Status of \"{name}\" unavailable: {err}"),
                    }
                }
            }
            if let Some(link) = self.registry.link(&name) {
                infos.push(link.info(status));
            }
        }
        infos
    }

    /// Serial-poll every address in `start..=end` on every adapter.
    ///
    /// The range is clamped to the bus; an address found on one adapter is
    /// not polled again on the next. Adapters without links are closed
    /// afterwards.
    pub fn find_listeners(&mut self, start: i64, end: i64) -> GpibResult<Vec<Listener>> {
        let max = MAX_GPIB_ADDRESS as i64;
        let start = checked_address(start.clamp(0, max))?;
        let end = checked_address(end.clamp(0, max))?.max(start);

        if let Err(err) = self.discover() {
            if self.pool.ready_count() == 0 {
                return Err(err);
            }
            log::debug!("Discovery found nothing new: {err}");
        }
        let timing = self.settings.timing.clone();
        let mut found: Vec<Listener> = Vec::new();
        let mut failure = None;

        for controller in self.pool.ready_indices() {
            let slot = self.pool.ready_mut(controller)?;
            if let Err(err) = scan_controller(slot, start..=end, &timing, &mut found) {
                log::warn!("Scan on controller {controller} failed: {err}");
                failure = Some(err);
                break;
            }
        }

        self.close_unused();
        if let Some(err) = failure {
            return Err(err);
        }
        found.sort_by_key(|l| l.address);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::settings::BusSettings,
        protocol::sim::{SimAdapter, SimBench, SimInstrument},
    };

    fn bus_with(instruments: Vec<SimInstrument>) -> (GpibBus, SimAdapter) {
        let mut adapter = SimAdapter::prologix(0);
        for instrument in instruments {
            adapter = adapter.with_instrument(instrument);
        }
        let bench = SimBench::new().with_adapter(adapter.clone());
        (
            GpibBus::new(Box::new(bench), BusSettings::simulated()),
            adapter,
        )
    }

    #[test]
    fn test_short_send_sets_up_termination() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(5)]);
        bus.open("gpib5", DeviceFlags::empty()).unwrap();
        adapter.clear_log();

        bus.send("gpib5", b"VOLT 1.5", DeviceFlags::empty()).unwrap();
        assert_eq!(adapter.commands(), vec!["++addr 5", "++eoi 1", "++eos 0"]);
        assert_eq!(adapter.received(5), vec![b"VOLT 1.5".to_vec()]);
    }

    #[test]
    fn test_long_send_defers_eoi_to_the_last_byte() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(5)]);
        bus.open("gpib5", DeviceFlags::empty()).unwrap();
        adapter.clear_log();

        let payload = vec![b'A'; 600];
        bus.send("gpib5", &payload, DeviceFlags::empty()).unwrap();
        assert_eq!(
            adapter.commands(),
            vec!["++addr 5", "++eos 3", "++eoi 0", "++eos 0", "++eoi 1"]
        );
        assert_eq!(adapter.received(5), vec![payload]);
    }

    #[test]
    fn test_binary_send_arrives_unchanged() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(5)]);
        let mut payload: Vec<u8> = (0..=255u8).collect();
        payload.extend_from_slice(b"\r\n\x1b");

        bus.send("gpib5", &payload, DeviceFlags::BINARY).unwrap();
        assert_eq!(adapter.received(5), vec![payload.clone()]);

        let long: Vec<u8> = payload.iter().copied().cycle().take(1500).collect();
        bus.send("gpib5", &long, DeviceFlags::BINARY).unwrap();
        assert_eq!(adapter.received(5)[1], long);
        assert!(adapter.commands().iter().all(|c| c != "++eos 0"));
    }

    #[test]
    fn test_unterminated_sends_are_joined() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(5)]);
        bus.send("gpib5", b"MEAS:", DeviceFlags::NO_TERMINATOR).unwrap();
        bus.send("gpib5", b"VOLT", DeviceFlags::NO_TERMINATOR).unwrap();
        assert!(adapter.received(5).is_empty());
        assert_eq!(bus.registry().link("gpib5").unwrap().pending(), b"MEAS:VOLT");

        bus.send("gpib5", b"?", DeviceFlags::empty()).unwrap();
        assert_eq!(adapter.received(5), vec![b"MEAS:VOLT?".to_vec()]);
        assert!(bus.registry().link("gpib5").unwrap().pending().is_empty());
    }

    #[test]
    fn test_auto_read_toggles_once() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(5)]);
        bus.send("gpib5", b"A", DeviceFlags::AUTO_READ).unwrap();
        bus.send("gpib5", b"B", DeviceFlags::AUTO_READ).unwrap();
        assert!(adapter.auto_mode());
        bus.send("gpib5", b"C", DeviceFlags::empty()).unwrap();
        assert!(!adapter.auto_mode());
        assert_eq!(adapter.count_commands("++auto 1"), 1);
        // One from initialization, one to leave auto mode.
        assert_eq!(adapter.count_commands("++auto 0"), 2);
    }

    #[test]
    fn test_long_send_leaves_auto_mode_first() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(5)]);
        bus.send("gpib5", b"A", DeviceFlags::AUTO_READ).unwrap();
        adapter.clear_log();

        let payload = vec![b'B'; 600];
        bus.send("gpib5", &payload, DeviceFlags::AUTO_READ).unwrap();
        assert_eq!(
            adapter.commands(),
            vec!["++auto 0", "++eos 3", "++eoi 0", "++eos 0", "++eoi 1", "++auto 1"]
        );
        assert_eq!(adapter.received(5)[1], payload);
        assert!(adapter.auto_mode());

        adapter.clear_log();
        bus.send("gpib5", &payload, DeviceFlags::empty()).unwrap();
        assert_eq!(adapter.commands()[0], "++auto 0");
        assert_eq!(adapter.count_commands("++auto 1"), 0);
    }

    #[test]
    fn test_auto_read_belongs_to_its_device() {
        let (mut bus, adapter) = bus_with(vec![
            SimInstrument::echo(1),
            SimInstrument::identity(2, "ACME,DMM"),
        ]);
        bus.send("gpib2", b"*IDN?", DeviceFlags::empty()).unwrap();
        bus.send("gpib1", b"ping", DeviceFlags::AUTO_READ).unwrap();

        // The forwarded answer is collected without a read request.
        let reply = bus.receive("gpib1", 64).unwrap();
        assert_eq!(reply.data, b"ping");
        assert_eq!(adapter.count_commands("++read eoi"), 0);

        adapter.clear_log();
        let reply = bus.receive("gpib2", 64).unwrap();
        assert_eq!(reply.data, b"ACME,DMM\n");
        assert_eq!(
            adapter.commands(),
            vec!["++auto 0", "++addr 2", "++spoll", "++read eoi", "++spoll"]
        );
        assert!(!adapter.auto_mode());
    }

    #[test]
    fn test_uncollected_auto_reply_is_not_handed_to_another_device() {
        let (mut bus, adapter) = bus_with(vec![
            SimInstrument::echo(1),
            SimInstrument::identity(2, "ACME,DMM"),
        ]);
        bus.send("gpib2", b"*IDN?", DeviceFlags::empty()).unwrap();
        bus.send("gpib1", b"ping", DeviceFlags::AUTO_READ).unwrap();

        let reply = bus.receive("gpib2", 64).unwrap();
        assert_eq!(reply.data, b"ACME,DMM\n");
        assert_eq!(reply.status, Some(0));
        assert!(!adapter.auto_mode());

        // The echo was dropped when auto mode ended.
        assert!(matches!(bus.receive("gpib1", 64), Err(GpibError::NoData { .. })));
    }

    #[test]
    fn test_status_poll_elsewhere_ends_auto_mode() {
        let (mut bus, adapter) = bus_with(vec![
            SimInstrument::echo(1),
            SimInstrument::echo(2).with_status(0x40),
        ]);
        bus.open("gpib2", DeviceFlags::empty()).unwrap();
        bus.send("gpib1", b"ping", DeviceFlags::AUTO_READ).unwrap();
        assert_eq!(bus.status_byte("gpib2").unwrap(), 0x40);
        assert!(!adapter.auto_mode());
    }

    #[test]
    fn test_custom_ready_bit() {
        let (mut bus, _adapter) = bus_with(vec![
            SimInstrument::identity(7, "ACME,SCOPE").with_ready_bit(0x01),
            SimInstrument::identity(8, "ACME,DMM"),
        ]);
        let flags = DeviceFlags::from_options(["stb_bit", "1"]).unwrap();
        bus.declare_mapping("scope", 7, flags).unwrap();
        bus.declare_mapping("dmm", 8, flags).unwrap();

        let reply = bus.query("scope", b"*IDN?", DeviceFlags::empty()).unwrap();
        assert_eq!(reply.data, b"ACME,SCOPE\n");
        assert_eq!(reply.status, Some(0));

        // 0x10 is not what this mapping waits for.
        bus.send("dmm", b"*IDN?", DeviceFlags::empty()).unwrap();
        assert!(matches!(
            bus.receive("dmm", 64),
            Err(GpibError::NoData { status: Some(0x10), .. })
        ));
    }

    #[test]
    fn test_receive_waits_for_the_ready_bit() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::identity(22, "ACME,3458A,0,1")]);
        bus.send("gpib22", b"*IDN?\n", DeviceFlags::empty()).unwrap();

        let reply = bus.receive("gpib22", 256).unwrap();
        assert_eq!(reply.data, b"ACME,3458A,0,1\n");
        assert_eq!(reply.status, Some(0));
        assert!(adapter.commands().contains(&"++read eoi".to_string()));

        let err = bus.receive("gpib22", 256).unwrap_err();
        assert!(matches!(err, GpibError::NoData { status: Some(0), .. }));
        assert_eq!(
            bus.pool().slot(0).unwrap().last_error(),
            Some(SlotError::PollLost)
        );
    }

    #[test]
    fn test_receive_without_ready_mask() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(3)]);
        let flags = DeviceFlags::from_options(["no_stb", "read_lf"]).unwrap();
        bus.declare_mapping("psu", 3, flags).unwrap();
        bus.send("psu", b"hello", DeviceFlags::empty()).unwrap();
        adapter.clear_log();

        let reply = bus.receive("psu", 64).unwrap();
        assert_eq!(reply.data, b"hello");
        assert_eq!(reply.status, None);
        assert_eq!(adapter.commands(), vec!["++read 10"]);

        assert!(matches!(
            bus.receive("psu", 64),
            Err(GpibError::NoData { status: None, .. })
        ));
        assert_eq!(
            bus.pool().slot(0).unwrap().last_error(),
            Some(SlotError::NoListener)
        );
    }

    #[test]
    fn test_full_buffer_reports_no_status() {
        let (mut bus, _adapter) = bus_with(vec![SimInstrument::streaming(5, vec![b'x'; 40])]);
        bus.send("gpib5", b"DATA?", DeviceFlags::empty()).unwrap();
        let reply = bus.receive("gpib5", 16).unwrap();
        assert_eq!(reply.data.len(), 16);
        assert_eq!(reply.status, None);
        assert_eq!(
            bus.pool().slot(0).unwrap().last_error(),
            Some(SlotError::BufferFull)
        );
    }

    #[test]
    fn test_buffered_receive_grows() {
        let block: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let (mut bus, adapter) = bus_with(vec![SimInstrument::streaming(5, block.clone())]);
        bus.send("gpib5", b"CURVE?", DeviceFlags::empty()).unwrap();
        adapter.clear_log();

        let reply = bus.buffered_receive("gpib5").unwrap();
        assert_eq!(reply.data, block);
        assert_eq!(reply.status, Some(0));
        // Only the first chunk needs a read request.
        assert_eq!(adapter.count_commands("++read"), 1);
        assert!(!bus
            .registry()
            .link("gpib5")
            .unwrap()
            .flags()
            .contains(DeviceFlags::AUTO_READ));
    }

    #[test]
    fn test_buffered_receive_cuts_off_non_eoi_devices() {
        let (mut bus, _adapter) = bus_with(vec![SimInstrument::streaming(5, vec![b'z'; 5000])]);
        let flags = DeviceFlags::from_options(["read_lf"]).unwrap();
        bus.declare_mapping("scope", 5, flags).unwrap();
        bus.send("scope", b"CURVE?", DeviceFlags::empty()).unwrap();

        let reply = bus.buffered_receive("scope").unwrap();
        assert_eq!(reply.data.len(), INITIAL_READ_BUFFER);
        assert!(!bus
            .registry()
            .link("scope")
            .unwrap()
            .flags()
            .contains(DeviceFlags::AUTO_READ));
    }

    #[test]
    fn test_query_and_status() {
        let (mut bus, adapter) = bus_with(vec![
            SimInstrument::identity(9, "ACME,PSU").with_status(0x40),
        ]);
        let reply = bus.query("gpib9", b"*IDN?", DeviceFlags::empty()).unwrap();
        assert_eq!(reply.data, b"ACME,PSU\n");
        assert_eq!(bus.status_byte("gpib9").unwrap(), 0x40);
        assert_eq!(adapter.count_commands("++addr"), 1);
    }

    #[test]
    fn test_status_needs_serial_poll() {
        let (mut bus, _adapter) = bus_with(vec![SimInstrument::echo(9)]);
        let flags = DeviceFlags::from_options(["no_spoll"]).unwrap();
        bus.declare_mapping("old", 9, flags).unwrap();
        assert!(matches!(
            bus.status_byte("old"),
            Err(GpibError::PollUnsupported(_))
        ));
    }

    #[test]
    fn test_bus_management_commands() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(4)]);
        bus.trigger("gpib4").unwrap();
        bus.clear("gpib4").unwrap();
        bus.remote("gpib4").unwrap();
        assert_eq!(adapter.triggers(4), 1);
        assert_eq!(adapter.clears(4), 1);
        assert_eq!(adapter.count_commands("++addr"), 1);

        bus.local("gpib4").unwrap();
        assert_eq!(bus.pool().slot(0).unwrap().active_address(), None);
        bus.remote("gpib4").unwrap();
        assert_eq!(adapter.count_commands("++addr"), 2);
        assert_eq!(adapter.count_commands("++loc"), 1);
    }

    #[test]
    fn test_write_errors_leave_the_controller_up() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(4)]);
        bus.open("gpib4", DeviceFlags::empty()).unwrap();

        adapter.set_write_fault(crate::protocol::sim::WriteFault::Short);
        assert!(matches!(
            bus.send("gpib4", b"X", DeviceFlags::empty()),
            Err(GpibError::ShortWrite { .. })
        ));
        adapter.set_write_fault(crate::protocol::sim::WriteFault::Error);
        let err = bus.send("gpib4", b"X", DeviceFlags::empty()).unwrap_err();
        assert_eq!(err.severity(), crate::error::Severity::Hard);
        assert!(bus.pool().slot(0).unwrap().is_ready());
        assert!(bus.registry().link("gpib4").is_some());
    }

    #[test]
    fn test_failed_scan_restores_the_read_timeout() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(1)]);
        bus.open("gpib1", DeviceFlags::empty()).unwrap();

        adapter.set_read_fault(true);
        assert!(matches!(bus.find_listeners(0, 5), Err(GpibError::HardIo(_))));
        assert_eq!(adapter.read_timeout_ms(), 280);
        assert!(adapter.is_open());
    }

    #[test]
    fn test_scan_uses_controllers_already_open() {
        let (mut bus, adapter) = bus_with(vec![SimInstrument::echo(3)]);
        bus.open("gpib3", DeviceFlags::empty()).unwrap();

        // Nothing new to discover, but the open adapter still scans.
        adapter.set_listed(false);
        let listeners = bus.find_listeners(0, 5).unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].address, 3);

        bus.close_all();
        assert!(matches!(bus.find_listeners(0, 5), Err(GpibError::NoAdapterFound)));
    }

    #[test]
    fn test_list_links_reports_status() {
        let (mut bus, _adapter) = bus_with(vec![
            SimInstrument::echo(1).with_status(0x20),
            SimInstrument::echo(2),
        ]);
        bus.open("gpib1", DeviceFlags::empty()).unwrap();
        let flags = DeviceFlags::from_options(["no_spoll"]).unwrap();
        bus.declare_mapping("quiet", 2, flags).unwrap();
        bus.open("quiet", DeviceFlags::empty()).unwrap();

        let links = bus.list_links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].name, "gpib1");
        assert_eq!(links[0].status, Some(0x20));
        assert_eq!(links[1].name, "quiet");
        assert_eq!(links[1].status, None);
    }
}
