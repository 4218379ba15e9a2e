use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::{
    protocol::{checked_address, DeviceFlags, MAX_GPIB_ADDRESS},
    GpibError, GpibResult,
};

/// Prefix of the `gpib<N>` address form.
const ADDRESS_TOKEN_PREFIX: &str = "gpib";

/// A declared name → address association, independent of any live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameMapping {
    pub address: u8,
    pub flags: DeviceFlags,
}

/// A name bound to one controller and bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLink {
    name: String,
    controller: usize,
    address: u8,
    flags: DeviceFlags,
    /// Output held back by unterminated sends.
    pending: Vec<u8>,
}

impl DeviceLink {
    pub fn new(
        name: impl Into<String>,
        controller: usize,
        address: u8,
        flags: DeviceFlags,
    ) -> Self {
        Self {
            name: name.into(),
            controller,
            address,
            flags,
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller(&self) -> usize {
        self.controller
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub(crate) fn defer(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn set_auto_read(&mut self, on: bool) {
        self.flags.set(DeviceFlags::AUTO_READ, on);
    }

    pub fn info(&self, status: Option<u8>) -> LinkInfo {
        LinkInfo {
            name: self.name.clone(),
            controller: self.controller,
            address: self.address,
            status,
        }
    }
}

/// Summary of a link as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub name: String,
    pub controller: usize,
    pub address: u8,
    pub status: Option<u8>,
}

/// Where a name's address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Linked { address: u8, flags: DeviceFlags },
    Mapped { address: u8, flags: DeviceFlags },
    /// A bare number or `gpib<N>`; no flags attached.
    Literal { address: u8 },
}

impl Resolution {
    pub fn address(self) -> u8 {
        match self {
            Resolution::Linked { address, .. }
            | Resolution::Mapped { address, .. }
            | Resolution::Literal { address } => address,
        }
    }

    /// Declared flags, if the name was linked or mapped.
    pub fn flags(self) -> Option<DeviceFlags> {
        match self {
            Resolution::Linked { flags, .. } | Resolution::Mapped { flags, .. } => Some(flags),
            Resolution::Literal { .. } => None,
        }
    }
}

/// Name mappings and live links.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    mappings: HashMap<String, NameMapping>,
    links: BTreeMap<String, DeviceLink>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or redeclare) `name` at `address`.
    ///
    /// A live link with the same name picks up the new address and flags; the
    /// adapter is only re-addressed on the next transfer.
    pub fn declare_mapping(
        &mut self,
        name: &str,
        address: i64,
        flags: DeviceFlags,
    ) -> GpibResult<NameMapping> {
        let address = checked_address(address)?;
        let mapping = NameMapping {
            address,
            flags: flags.user_settable(),
        };
        self.mappings.insert(name.to_string(), mapping);

        if let Some(link) = self.links.get_mut(name) {
            if link.address != mapping.address || link.flags.user_settable() != mapping.flags {
                log::debug!(
                    "Link \"{name}\" remapped to address {} (flags {:#x})",
                    mapping.address,
                    mapping.flags.bits()
                );
                link.address = mapping.address;
                link.flags = mapping.flags;
            }
        }
        Ok(mapping)
    }

    pub fn mapping(&self, name: &str) -> Option<NameMapping> {
        self.mappings.get(name).copied()
    }

    /// Work out which bus address `name` refers to.
    pub fn resolve(&self, name: &str) -> GpibResult<Resolution> {
        if let Some(link) = self.links.get(name) {
            return Ok(Resolution::Linked {
                address: link.address,
                flags: link.flags,
            });
        }
        if let Some(mapping) = self.mappings.get(name) {
            return Ok(Resolution::Mapped {
                address: mapping.address,
                flags: mapping.flags,
            });
        }
        parse_address_literal(name)
            .map(|address| Resolution::Literal { address })
            .ok_or_else(|| GpibError::AddressUnresolved(name.to_string()))
    }

    pub fn link(&self, name: &str) -> Option<&DeviceLink> {
        self.links.get(name)
    }

    pub(crate) fn link_mut(&mut self, name: &str) -> GpibResult<&mut DeviceLink> {
        self.links
            .get_mut(name)
            .ok_or_else(|| GpibError::NotOpen(name.to_string()))
    }

    pub fn links(&self) -> impl Iterator<Item = &DeviceLink> {
        self.links.values()
    }

    pub fn link_names(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    /// Number of links held on `controller`.
    pub fn links_on(&self, controller: usize) -> usize {
        self.links
            .values()
            .filter(|l| l.controller == controller)
            .count()
    }

    pub(crate) fn insert_link(&mut self, link: DeviceLink) {
        self.links.insert(link.name.clone(), link);
    }

    pub(crate) fn remove_link(&mut self, name: &str) -> Option<DeviceLink> {
        self.links.remove(name)
    }

    /// Drop every link on `controller`, returning how many went.
    pub(crate) fn remove_links_on(&mut self, controller: usize) -> usize {
        let before = self.links.len();
        self.links.retain(|_, l| l.controller != controller);
        before - self.links.len()
    }

    pub(crate) fn clear_links(&mut self) {
        self.links.clear();
    }
}

/// Parse `"22"` or `"gpib22"` (any case) into a bus address.
pub fn parse_address_literal(name: &str) -> Option<u8> {
    let digits = match name.get(..ADDRESS_TOKEN_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(ADDRESS_TOKEN_PREFIX) => {
            &name[ADDRESS_TOKEN_PREFIX.len()..]
        }
        _ => name,
    };
    let value: i64 = digits.trim().parse().ok()?;
    if (0..=MAX_GPIB_ADDRESS as i64).contains(&value) {
        Some(value as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_address_round_trips_through_a_mapping() {
        let mut registry = DeviceRegistry::new();
        for address in 0..=MAX_GPIB_ADDRESS {
            let name = format!("dev{address}");
            registry
                .declare_mapping(&name, address as i64, DeviceFlags::DEFAULT)
                .unwrap();
            assert_eq!(registry.resolve(&name).unwrap().address(), address);
        }
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        let mut registry = DeviceRegistry::new();
        assert!(matches!(
            registry.declare_mapping("x", 31, DeviceFlags::DEFAULT),
            Err(GpibError::InvalidAddress(31))
        ));
        assert!(registry
            .declare_mapping("x", -1, DeviceFlags::DEFAULT)
            .is_err());
        assert!(registry.mapping("x").is_none());
    }

    #[test]
    fn test_literal_addresses() {
        assert_eq!(parse_address_literal("7"), Some(7));
        assert_eq!(parse_address_literal("gpib12"), Some(12));
        assert_eq!(parse_address_literal("GPIB30"), Some(30));
        assert_eq!(parse_address_literal("gpib31"), None);
        assert_eq!(parse_address_literal("-3"), None);
        assert_eq!(parse_address_literal("scope"), None);
        assert_eq!(parse_address_literal("gpib"), None);

        let registry = DeviceRegistry::new();
        assert!(matches!(
            registry.resolve("scope"),
            Err(GpibError::AddressUnresolved(n)) if n == "scope"
        ));
        assert_eq!(
            registry.resolve("gpib4").unwrap(),
            Resolution::Literal { address: 4 }
        );
    }

    #[test]
    fn test_link_wins_over_mapping() {
        let mut registry = DeviceRegistry::new();
        registry
            .declare_mapping("dmm", 22, DeviceFlags::DEFAULT)
            .unwrap();
        registry.insert_link(DeviceLink::new("dmm", 1, 22, DeviceFlags::DEFAULT));
        assert!(matches!(
            registry.resolve("dmm").unwrap(),
            Resolution::Linked { address: 22, .. }
        ));

        // Redeclaring updates the live link in place.
        let flags = DeviceFlags::from_options(["no_spoll"]).unwrap();
        registry.declare_mapping("dmm", 9, flags).unwrap();
        let link = registry.link("dmm").unwrap();
        assert_eq!(link.address(), 9);
        assert_eq!(link.flags(), flags);
        assert_eq!(link.controller(), 1);
    }

    #[test]
    fn test_mapping_strips_internal_bits() {
        let mut registry = DeviceRegistry::new();
        let mapping = registry
            .declare_mapping("psu", 3, DeviceFlags::DEFAULT | DeviceFlags::BINARY)
            .unwrap();
        assert_eq!(mapping.flags, DeviceFlags::DEFAULT);
    }

    #[test]
    fn test_links_per_controller() {
        let mut registry = DeviceRegistry::new();
        registry.insert_link(DeviceLink::new("a", 0, 1, DeviceFlags::DEFAULT));
        registry.insert_link(DeviceLink::new("b", 0, 2, DeviceFlags::DEFAULT));
        registry.insert_link(DeviceLink::new("c", 1, 3, DeviceFlags::DEFAULT));
        assert_eq!(registry.links_on(0), 2);
        assert_eq!(registry.remove_links_on(0), 2);
        assert_eq!(registry.link_names(), vec!["c".to_string()]);
    }
}
