/// Controller/device multiplexing engine
///
/// This package contains the state machine behind the public handle:
/// - The controller pool that owns every open adapter
/// - Adapter discovery and initialization
/// - The device registry (name mappings and live links)
/// - The transfer engine (send, receive, serial polls)
/// - Lifecycle management of links and controllers
///
/// Everything hangs off one [`GpibBus`] value; there is no global state.
pub mod bus;
pub mod discovery;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod settings;
pub mod transfer;

pub use bus::GpibBus;
pub use discovery::DiscoveryReport;
pub use pool::{ControllerInfo, ControllerPool, ControllerSlot, SlotError, SlotState};
pub use registry::{DeviceLink, DeviceRegistry, LinkInfo, NameMapping, Resolution};
pub use settings::{BusSettings, Timing};
