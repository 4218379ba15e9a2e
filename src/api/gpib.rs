use std::any::Any;

use parking_lot::Mutex;

use crate::{
    core::{
        bus::GpibBus,
        discovery::DiscoveryReport,
        pool::ControllerInfo,
        registry::{LinkInfo, NameMapping},
        settings::BusSettings,
        transfer::{Listener, Reply},
    },
    protocol::{DeviceFlags, PortProvider},
    GpibResult,
};

/// Thread-safe handle on a set of Prologix adapters and the instruments
/// behind them.
///
/// All calls are serialized on one lock; share the handle through `Arc`.
///
/// ```no_run
/// use gpibmux::{BusSettings, DeviceFlags, Gpib};
///
/// let gpib = Gpib::with_serial_ports(BusSettings::default());
/// gpib.declare_mapping("dmm", 22, DeviceFlags::DEFAULT)?;
/// gpib.send("dmm", b"*IDN?", DeviceFlags::empty())?;
/// let reply = gpib.receive("dmm", 256)?;
/// println!("{}", String::from_utf8_lossy(&reply.data));
/// # Ok::<(), gpibmux::GpibError>(())
/// ```
pub struct Gpib {
    bus: Mutex<GpibBus>,
}

impl Gpib {
    pub fn new(provider: Box<dyn PortProvider>, settings: BusSettings) -> Self {
        Self {
            bus: Mutex::new(GpibBus::new(provider, settings)),
        }
    }

    pub fn with_serial_ports(settings: BusSettings) -> Self {
        Self {
            bus: Mutex::new(GpibBus::with_serial_ports(settings)),
        }
    }

    /// Run `f` with exclusive access to the engine.
    pub fn with_bus<T>(&self, f: impl FnOnce(&mut GpibBus) -> T) -> T {
        f(&mut self.bus.lock())
    }

    pub fn declare_mapping(
        &self,
        name: &str,
        address: i64,
        flags: DeviceFlags,
    ) -> GpibResult<NameMapping> {
        self.bus.lock().declare_mapping(name, address, flags)
    }

    pub fn mapping(&self, name: &str) -> Option<NameMapping> {
        self.bus.lock().registry().mapping(name)
    }

    pub fn resolve(&self, name: &str) -> GpibResult<u8> {
        self.bus.lock().resolve(name)
    }

    pub fn open(&self, name: &str, flags: DeviceFlags) -> GpibResult<LinkInfo> {
        self.bus.lock().open(name, flags)
    }

    pub fn close(&self, name: &str) -> GpibResult<()> {
        self.bus.lock().close_link(name)
    }

    pub fn close_all(&self) {
        self.bus.lock().close_all()
    }

    pub fn close_unused(&self) -> usize {
        self.bus.lock().close_unused()
    }

    pub fn remote(&self, name: &str) -> GpibResult<()> {
        self.bus.lock().remote(name)
    }

    pub fn local(&self, name: &str) -> GpibResult<()> {
        self.bus.lock().local(name)
    }

    pub fn clear(&self, name: &str) -> GpibResult<()> {
        self.bus.lock().clear(name)
    }

    pub fn trigger(&self, name: &str) -> GpibResult<()> {
        self.bus.lock().trigger(name)
    }

    pub fn status_byte(&self, name: &str) -> GpibResult<u8> {
        self.bus.lock().status_byte(name)
    }

    pub fn send(&self, name: &str, payload: &[u8], flags: DeviceFlags) -> GpibResult<()> {
        self.bus.lock().send(name, payload, flags)
    }

    pub fn receive(&self, name: &str, max_bytes: usize) -> GpibResult<Reply> {
        self.bus.lock().receive(name, max_bytes)
    }

    pub fn buffered_receive(&self, name: &str) -> GpibResult<Reply> {
        self.bus.lock().buffered_receive(name)
    }

    pub fn query(&self, name: &str, payload: &[u8], flags: DeviceFlags) -> GpibResult<Reply> {
        self.bus.lock().query(name, payload, flags)
    }

    pub fn list_links(&self) -> Vec<LinkInfo> {
        self.bus.lock().list_links()
    }

    pub fn find_listeners(&self, start: i64, end: i64) -> GpibResult<Vec<Listener>> {
        self.bus.lock().find_listeners(start, end)
    }

    pub fn discover(&self) -> GpibResult<DiscoveryReport> {
        self.bus.lock().discover()
    }

    /// Ready controllers in slot order.
    pub fn controllers(&self) -> Vec<ControllerInfo> {
        self.bus.lock().pool().info()
    }

    pub fn set_controller_data(&self, index: usize, data: Box<dyn Any + Send>) -> GpibResult<()> {
        self.bus.lock().pool_mut().set_user_data(index, data)
    }

    /// Borrow a controller's user data for the duration of `f`.
    pub fn with_controller_data<T>(
        &self,
        index: usize,
        f: impl FnOnce(Option<&(dyn Any + Send)>) -> T,
    ) -> T {
        let bus = self.bus.lock();
        f(bus.pool().user_data(index))
    }
}
