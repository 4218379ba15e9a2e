use serde::{Deserialize, Serialize};

/// Delays and timeouts used by the engine, all in whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Wait for the `++ver` reply during discovery.
    pub handshake_timeout_ms: u64,
    /// Wait for a serial-poll reply.
    pub status_timeout_ms: u64,
    /// Wait for a serial-poll reply while probing several controllers.
    pub probe_timeout_ms: u64,
    /// Wait for data after `++read` when no ready bit is declared.
    pub read_timeout_ms: u64,
    /// Pause before a read request and before collecting its data.
    pub settle_delay_ms: u64,
    /// Pause between two status polls waiting for the ready bit.
    pub status_interval_ms: u64,
    pub status_retries: u32,
    /// Pause after `++ifc` during adapter initialization.
    pub ifc_settle_ms: u64,
    /// `++read_tmo_ms` programmed into every adapter.
    pub adapter_read_timeout_ms: u32,
    /// `++read_tmo_ms` used while scanning the bus for listeners.
    pub scan_read_timeout_ms: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 250,
            status_timeout_ms: 250,
            probe_timeout_ms: 500,
            read_timeout_ms: 300,
            settle_delay_ms: 100,
            status_interval_ms: 10,
            status_retries: 5,
            ifc_settle_ms: 1,
            adapter_read_timeout_ms: 280,
            scan_read_timeout_ms: 200,
        }
    }
}

impl Timing {
    /// No sleeps at all; for simulated adapters that answer instantly.
    pub fn immediate() -> Self {
        Self {
            settle_delay_ms: 0,
            status_interval_ms: 0,
            ifc_settle_ms: 0,
            ..Self::default()
        }
    }
}

fn default_pool_capacity() -> usize {
    5
}

fn default_baud_rate() -> u32 {
    115_200
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Number of adapters that can be open at the same time.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub timing: Timing,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            baud_rate: default_baud_rate(),
            timing: Timing::default(),
        }
    }
}

impl BusSettings {
    pub fn simulated() -> Self {
        Self {
            timing: Timing::immediate(),
            ..Self::default()
        }
    }
}
