use super::{
    pool::ControllerPool,
    registry::{DeviceLink, DeviceRegistry, LinkInfo, NameMapping},
    settings::BusSettings,
};
use crate::{
    protocol::{DeviceFlags, PortProvider, SerialPortProvider},
    GpibError, GpibResult,
};

/// The single context every operation runs against: the controller pool,
/// the device registry and the source of candidate adapters.
pub struct GpibBus {
    pub(crate) pool: ControllerPool,
    pub(crate) registry: DeviceRegistry,
    pub(crate) provider: Box<dyn PortProvider>,
    pub(crate) settings: BusSettings,
}

impl GpibBus {
    pub fn new(provider: Box<dyn PortProvider>, settings: BusSettings) -> Self {
        Self {
            pool: ControllerPool::new(settings.pool_capacity),
            registry: DeviceRegistry::new(),
            provider,
            settings,
        }
    }

    /// A bus backed by the machine's USB-serial nodes.
    pub fn with_serial_ports(settings: BusSettings) -> Self {
        Self::new(Box::new(SerialPortProvider), settings)
    }

    pub fn pool(&self) -> &ControllerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ControllerPool {
        &mut self.pool
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn declare_mapping(
        &mut self,
        name: &str,
        address: i64,
        flags: DeviceFlags,
    ) -> GpibResult<NameMapping> {
        self.registry.declare_mapping(name, address, flags)
    }

    /// Bus address `name` currently stands for.
    pub fn resolve(&mut self, name: &str) -> GpibResult<u8> {
        Ok(self.registry.resolve(name)?.address())
    }

    /// Pick the controller `name` lives on.
    ///
    /// An existing link decides. Otherwise a single Ready controller is the
    /// answer; with several, devices that answer serial polls are probed for
    /// and anything else is ambiguous.
    pub fn find_controller(
        &mut self,
        name: &str,
        address: u8,
        flags: DeviceFlags,
    ) -> GpibResult<usize> {
        if let Some(link) = self.registry.link(name) {
            return Ok(link.controller());
        }
        let ready = self.pool.ready_indices();
        match ready.as_slice() {
            [] => Err(GpibError::NoControllers),
            [only] => Ok(*only),
            _ if flags.contains(DeviceFlags::HAS_SPOLL) => self.probe(name, address, &ready),
            _ => Err(GpibError::Ambiguous {
                name: name.to_string(),
                controllers: ready.len(),
            }),
        }
    }

    /// Serial-poll `address` on each controller in turn; the first to get
    /// an answer owns the device.
    fn probe(&mut self, name: &str, address: u8, ready: &[usize]) -> GpibResult<usize> {
        let timeout = self.settings.timing.probe_timeout_ms;
        for &index in ready {
            let slot = self.pool.ready_mut(index)?;
            let polled = slot
                .select(address)
                .and_then(|_| slot.serial_poll(timeout));
            match polled {
                Ok(Some(status)) => {
                    log::debug!("\"{name}\" answered on controller {index} (status {status})");
                    return Ok(index);
                }
                Ok(None) => {}
                Err(err) => log::warn!("Probe of controller {index} failed: {err}"),
            }
        }
        Err(GpibError::DeviceNotFound(name.to_string()))
    }

    /// Bind `name` to a controller, opening adapters as needed.
    ///
    /// `extra` is OR-ed into the declared flags; names without a mapping use
    /// `extra`, or the defaults when it is empty. Adapters left without links
    /// afterwards are closed again.
    pub fn open(&mut self, name: &str, extra: DeviceFlags) -> GpibResult<LinkInfo> {
        if let Some(link) = self.registry.link(name) {
            return Ok(link.info(None));
        }
        let resolution = self.registry.resolve(name)?;
        let address = resolution.address();
        let extra = extra.user_settable();
        let flags = match resolution.flags() {
            Some(declared) => declared | extra,
            None if extra.is_empty() => DeviceFlags::DEFAULT,
            None => extra,
        };

        // Adapters come and go, so look again on every open.
        if let Err(err) = self.discover() {
            if self.pool.ready_count() == 0 {
                return Err(err);
            }
            log::debug!("Discovery found nothing new: {err}");
        }

        let result = self.find_controller(name, address, flags).map(|controller| {
            let link = DeviceLink::new(name, controller, address, flags);
            let info = link.info(None);
            log::info!("Opened \"{name}\" at address {address} on controller {controller}");
            self.registry.insert_link(link);
            info
        });
        self.close_unused();
        result
    }

    /// Controller, address and flags of `name`, opening it first if needed.
    pub(crate) fn target(&mut self, name: &str) -> GpibResult<(usize, u8, DeviceFlags)> {
        if self.registry.link(name).is_none() {
            self.open(name, DeviceFlags::empty())?;
        }
        let link = self
            .registry
            .link(name)
            .ok_or_else(|| GpibError::NotOpen(name.to_string()))?;
        Ok((link.controller(), link.address(), link.flags()))
    }
}
