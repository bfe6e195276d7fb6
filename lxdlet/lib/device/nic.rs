use std::collections::HashMap;

use typed_builder::TypedBuilder;

use crate::LxdletResult;

use super::{DEVICE_TYPE_NIC, OPTION_TYPE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A network interface attached to the workload.
///
/// The `interface` field is the interface name seen inside the workload and
/// maps to the hypervisor's `name` option; the device entry name defaults to
/// `nic-<interface>`.
#[derive(Debug, Clone, PartialEq, Eq, Default, TypedBuilder)]
pub struct Nic {
    /// The device entry name; derived from the interface when unset.
    #[builder(default)]
    pub name: Option<String>,

    /// The interface name inside the workload.
    #[builder(default, setter(into))]
    pub interface: String,

    /// The hypervisor nic type, e.g. `bridged`.
    #[builder(default, setter(into))]
    pub nic_type: String,

    /// The host-side parent interface or bridge.
    #[builder(default, setter(into))]
    pub parent: String,

    /// The statically assigned IPv4 address, empty when dynamic.
    #[builder(default, setter(into))]
    pub ipv4_address: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Nic {
    /// Returns the device entry name, deriving `nic-<interface>` when no name
    /// was assigned.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("nic-{}", self.interface),
        }
    }

    /// Encodes the device into its named option map.
    pub fn to_map(&self) -> (String, HashMap<String, String>) {
        let mut options = HashMap::from([(OPTION_TYPE.to_string(), DEVICE_TYPE_NIC.to_string())]);
        if !self.interface.is_empty() {
            options.insert("name".to_string(), self.interface.clone());
        }
        if !self.nic_type.is_empty() {
            options.insert("nictype".to_string(), self.nic_type.clone());
        }
        if !self.parent.is_empty() {
            options.insert("parent".to_string(), self.parent.clone());
        }
        if !self.ipv4_address.is_empty() {
            options.insert("ipv4.address".to_string(), self.ipv4_address.clone());
        }
        (self.effective_name(), options)
    }

    /// Decodes the device from its named option map.
    pub fn from_map(name: &str, options: &HashMap<String, String>) -> LxdletResult<Self> {
        Ok(Self {
            name: Some(name.to_string()),
            interface: options.get("name").cloned().unwrap_or_default(),
            nic_type: options.get("nictype").cloned().unwrap_or_default(),
            parent: options.get("parent").cloned().unwrap_or_default(),
            ipv4_address: options.get("ipv4.address").cloned().unwrap_or_default(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
