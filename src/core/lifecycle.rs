use super::bus::GpibBus;
use crate::{GpibError, GpibResult};

impl GpibBus {
    /// Forget the link for `name`. The controller goes with it when this was
    /// its last link.
    pub fn close_link(&mut self, name: &str) -> GpibResult<()> {
        let link = self
            .registry
            .remove_link(name)
            .ok_or_else(|| GpibError::NotOpen(name.to_string()))?;
        let controller = link.controller();
        if let Ok(slot) = self.pool.ready_mut(controller) {
            slot.forget_address(link.address());
        }
        if !link.pending().is_empty() {
            log::debug!(
                "\"{name}\": dropping {} unsent bytes",
                link.pending().len()
            );
        }
        if self.registry.links_on(controller) == 0 {
            self.pool.release(controller);
        }
        Ok(())
    }

    /// Close one controller and every link on it.
    pub fn close_controller(&mut self, index: usize) -> bool {
        let dropped = self.registry.remove_links_on(index);
        if dropped > 0 {
            log::debug!("Controller {index}: dropping {dropped} link(s)");
        }
        self.pool.release(index)
    }

    pub fn close_all(&mut self) {
        self.registry.clear_links();
        for index in self.pool.ready_indices() {
            self.pool.release(index);
        }
    }

    /// Close every controller no link refers to. Returns how many closed.
    pub fn close_unused(&mut self) -> usize {
        let idle: Vec<usize> = self
            .pool
            .ready_indices()
            .into_iter()
            .filter(|&index| self.registry.links_on(index) == 0)
            .collect();
        for &index in &idle {
            self.pool.release(index);
        }
        idle.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        core::{bus::GpibBus, settings::BusSettings},
        protocol::{
            sim::{SimAdapter, SimBench, SimInstrument},
            DeviceFlags,
        },
        GpibError,
    };

    fn two_device_bus() -> (GpibBus, SimAdapter) {
        let adapter = SimAdapter::prologix(0)
            .with_instrument(SimInstrument::echo(1))
            .with_instrument(SimInstrument::echo(2));
        let bench = SimBench::new().with_adapter(adapter.clone());
        let mut bus = GpibBus::new(Box::new(bench), BusSettings::simulated());
        bus.open("gpib1", DeviceFlags::empty()).unwrap();
        bus.open("gpib2", DeviceFlags::empty()).unwrap();
        (bus, adapter)
    }

    #[test]
    fn test_last_link_closes_the_controller() {
        let (mut bus, adapter) = two_device_bus();
        bus.remote("gpib1").unwrap();

        bus.close_link("gpib1").unwrap();
        assert!(adapter.is_open());
        assert_eq!(bus.pool().slot(0).unwrap().active_address(), None);

        bus.close_link("gpib2").unwrap();
        assert!(!adapter.is_open());
        assert!(!bus.pool().slot(0).unwrap().is_ready());

        assert!(matches!(
            bus.close_link("gpib2"),
            Err(GpibError::NotOpen(n)) if n == "gpib2"
        ));
    }

    #[test]
    fn test_closing_another_address_keeps_the_cache() {
        let (mut bus, _adapter) = two_device_bus();
        bus.remote("gpib2").unwrap();
        bus.close_link("gpib1").unwrap();
        assert_eq!(bus.pool().slot(0).unwrap().active_address(), Some(2));
    }

    #[test]
    fn test_close_all_and_controller() {
        let (mut bus, adapter) = two_device_bus();
        assert!(bus.close_controller(0));
        assert!(bus.registry().link("gpib1").is_none());
        assert!(!adapter.is_open());

        bus.open("gpib1", DeviceFlags::empty()).unwrap();
        assert!(adapter.is_open());
        bus.close_all();
        assert!(!adapter.is_open());
        assert_eq!(bus.registry().links().count(), 0);
        assert_eq!(adapter.open_count(), 2);
    }

    #[test]
    fn test_close_unused_spares_linked_controllers() {
        let linked = SimAdapter::prologix(0).with_instrument(SimInstrument::echo(1));
        let idle = SimAdapter::prologix(1);
        let bench = SimBench::new()
            .with_adapter(linked.clone())
            .with_adapter(idle.clone());
        let mut bus = GpibBus::new(Box::new(bench), BusSettings::simulated());

        bus.discover().unwrap();
        assert_eq!(bus.pool().ready_count(), 2);
        bus.declare_mapping("dmm", 1, DeviceFlags::DEFAULT).unwrap();
        // Probing finds the instrument on the first adapter.
        bus.open("dmm", DeviceFlags::empty()).unwrap();
        assert!(linked.is_open());
        assert!(!idle.is_open());
        assert_eq!(bus.close_unused(), 0);
    }
}
