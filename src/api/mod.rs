pub mod gpib;

pub use gpib::Gpib;

// Re-export the types callers see in signatures
pub use crate::core::{
    discovery::{DiscoveryReport, Rejection},
    pool::{ControllerInfo, SlotError},
    registry::{LinkInfo, NameMapping},
    settings::{BusSettings, Timing},
    transfer::{Listener, Reply},
};
pub use crate::protocol::{DeviceFlags, PortProvider};
