//! Typed views over the hypervisor's named device entries.
//!
//! A device entry on the wire is a name plus a flat option map whose `type`
//! option discriminates the variant. Encoding is total; decoding fails hard on
//! unknown discriminators and malformed options so that foreign entries are
//! never silently rewritten.

use std::collections::HashMap;

use lxdstore::DeviceMap;

use crate::{LxdletError, LxdletResult};

mod block;
mod chardev;
mod disk;
mod nic;
mod none;
mod proxy;

pub use block::*;
pub use chardev::*;
pub use disk::*;
pub use nic::*;
pub use none::*;
pub use proxy::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The option key discriminating the device variant.
pub const OPTION_TYPE: &str = "type";

/// The option key naming the path inside the workload.
pub const OPTION_PATH: &str = "path";

/// The option key naming the host-side path.
pub const OPTION_SOURCE: &str = "source";

/// The option key naming a proxy listen endpoint.
pub const OPTION_LISTEN: &str = "listen";

/// Discriminator of filesystem mounts.
pub const DEVICE_TYPE_DISK: &str = "disk";

/// Discriminator of block devices.
pub const DEVICE_TYPE_BLOCK: &str = "unix-block";

/// Discriminator of character devices.
pub const DEVICE_TYPE_CHAR: &str = "unix-char";

/// Discriminator of network interfaces.
pub const DEVICE_TYPE_NIC: &str = "nic";

/// Discriminator of masking entries.
pub const DEVICE_TYPE_NONE: &str = "none";

/// Discriminator of port forwards.
pub const DEVICE_TYPE_PROXY: &str = "proxy";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Any device entry this layer models.
#[derive(Debug, Clone, PartialEq)]
pub enum Device {
    /// A filesystem mount.
    Disk(Disk),

    /// A block device.
    Block(Block),

    /// A character device.
    Char(Char),

    /// A network interface.
    Nic(Nic),

    /// A masking entry.
    None(NoneDevice),

    /// A port forward.
    Proxy(Proxy),
}

/// An ordered device list, unique by effective entry name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Devices {
    entries: Vec<Device>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Device {
    /// Decodes a device entry, dispatching on its `type` option.
    ///
    /// ## Errors
    ///
    /// Returns [`LxdletError::UnsupportedDeviceType`] for discriminators this
    /// layer does not model and [`LxdletError::InvalidDevice`] when the
    /// discriminator is missing or the options cannot be decoded.
    pub fn detect(name: &str, options: &HashMap<String, String>) -> LxdletResult<Self> {
        let device_type = options
            .get(OPTION_TYPE)
            .ok_or_else(|| LxdletError::InvalidDevice {
                name: name.to_string(),
                reason: format!("missing {} option", OPTION_TYPE),
            })?;

        match device_type.as_str() {
            DEVICE_TYPE_DISK => Ok(Device::Disk(Disk::from_map(name, options)?)),
            DEVICE_TYPE_BLOCK => Ok(Device::Block(Block::from_map(name, options)?)),
            DEVICE_TYPE_CHAR => Ok(Device::Char(Char::from_map(name, options)?)),
            DEVICE_TYPE_NIC => Ok(Device::Nic(Nic::from_map(name, options)?)),
            DEVICE_TYPE_NONE => Ok(Device::None(NoneDevice::from_map(name, options)?)),
            DEVICE_TYPE_PROXY => Ok(Device::Proxy(Proxy::from_map(name, options)?)),
            other => Err(LxdletError::UnsupportedDeviceType(other.to_string())),
        }
    }

    /// Returns the effective entry name of the device.
    pub fn effective_name(&self) -> String {
        match self {
            Device::Disk(disk) => disk.effective_name(),
            Device::Block(block) => block.effective_name(),
            Device::Char(chardev) => chardev.effective_name(),
            Device::Nic(nic) => nic.effective_name(),
            Device::None(none) => none.effective_name(),
            Device::Proxy(proxy) => proxy.effective_name(),
        }
    }

    /// Encodes the device into its named option map.
    pub fn to_map(&self) -> (String, HashMap<String, String>) {
        match self {
            Device::Disk(disk) => disk.to_map(),
            Device::Block(block) => block.to_map(),
            Device::Char(chardev) => chardev.to_map(),
            Device::Nic(nic) => nic.to_map(),
            Device::None(none) => none.to_map(),
            Device::Proxy(proxy) => proxy.to_map(),
        }
    }
}

impl Devices {
    /// Creates an empty device list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a device, replacing any existing entry with the same effective
    /// name.
    ///
    /// This is the write path used when a device is re-attached with updated
    /// options, e.g. a nic that gained an address.
    pub fn upsert(&mut self, device: impl Into<Device>) {
        let device = device.into();
        let name = device.effective_name();
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.effective_name() == name)
        {
            *existing = device;
        } else {
            self.entries.push(device);
        }
    }

    /// Inserts a device, refusing a different device under an existing name.
    ///
    /// An identical duplicate is a no-op. This is the write path for
    /// caller-supplied devices, where replacing silently would hide a
    /// conflicting request.
    ///
    /// ## Errors
    ///
    /// Returns [`LxdletError::AmbiguousDevice`] when a different device
    /// already occupies the name.
    pub fn add(&mut self, device: impl Into<Device>) -> LxdletResult<()> {
        let device = device.into();
        let name = device.effective_name();
        if let Some(existing) = self
            .entries
            .iter()
            .find(|entry| entry.effective_name() == name)
        {
            if existing.to_map() == device.to_map() {
                return Ok(());
            }
            return Err(LxdletError::AmbiguousDevice(name));
        }

        self.entries.push(device);
        Ok(())
    }

    /// Returns the device with the given effective name.
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.entries
            .iter()
            .find(|entry| entry.effective_name() == name)
    }

    /// Iterates over the devices in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.entries.iter()
    }

    /// Returns the number of devices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the list holds no devices.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encodes all devices into a named device map.
    pub fn to_map(&self) -> DeviceMap {
        self.entries.iter().map(Device::to_map).collect()
    }

    /// Decodes a named device map, ordering entries by name.
    pub fn from_map(map: &DeviceMap) -> LxdletResult<Self> {
        let mut names: Vec<&String> = map.keys().collect();
        names.sort();

        let mut devices = Self::new();
        for name in names {
            let device = Device::detect(name, &map[name])?;
            devices.entries.push(device);
        }
        Ok(devices)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives a `<prefix>-<path>` entry name with `/` flattened to `-`, falling
/// back to the source when the path is empty.
pub(crate) fn path_derived_name(prefix: &str, path: &str, source: &str) -> String {
    let base = if path.is_empty() { source } else { path };
    format!("{}-{}", prefix, base.trim_start_matches('/').replace('/', "-"))
}

/// Returns true if the option value is the literal `true`.
pub(crate) fn truthy(value: Option<&String>) -> bool {
    value.map(String::as_str) == Some("true")
}

/// Fetches a required option or fails with an invalid-device error.
pub(crate) fn require_option(
    name: &str,
    options: &HashMap<String, String>,
    key: &str,
) -> LxdletResult<String> {
    options
        .get(key)
        .cloned()
        .ok_or_else(|| LxdletError::InvalidDevice {
            name: name.to_string(),
            reason: format!("missing {} option", key),
        })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<Disk> for Device {
    fn from(disk: Disk) -> Self {
        Device::Disk(disk)
    }
}

impl From<Block> for Device {
    fn from(block: Block) -> Self {
        Device::Block(block)
    }
}

impl From<Char> for Device {
    fn from(chardev: Char) -> Self {
        Device::Char(chardev)
    }
}

impl From<Nic> for Device {
    fn from(nic: Nic) -> Self {
        Device::Nic(nic)
    }
}

impl From<NoneDevice> for Device {
    fn from(none: NoneDevice) -> Self {
        Device::None(none)
    }
}

impl From<Proxy> for Device {
    fn from(proxy: Proxy) -> Self {
        Device::Proxy(proxy)
    }
}

impl IntoIterator for Devices {
    type Item = Device;
    type IntoIter = std::vec::IntoIter<Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Devices {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
