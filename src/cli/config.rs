use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{api::Gpib, core::settings::BusSettings, protocol::DeviceFlags};

/// One `[[devices]]` entry: a name declared at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub address: i64,
    /// Option words applied on top of the default flags.
    #[serde(default)]
    pub options: Vec<String>,
}

impl DeviceEntry {
    pub fn flags(&self) -> Result<DeviceFlags> {
        DeviceFlags::from_options(&self.options)
            .with_context(|| format!("device \"{}\"", self.name))
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl BootConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }

    /// Read configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {path}"))?;
        Self::from_toml(&text).with_context(|| format!("in {path}"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("cannot serialize configuration")
    }

    /// Declare every configured device on `gpib`.
    pub fn declare_devices(&self, gpib: &Gpib) -> Result<()> {
        for device in &self.devices {
            let flags = device.flags()?;
            gpib.declare_mapping(&device.name, device.address, flags)
                .with_context(|| format!("device \"{}\"", device.name))?;
        }
        Ok(())
    }
}
