use std::collections::HashMap;

use typed_builder::TypedBuilder;

use crate::LxdletResult;

use super::{path_derived_name, truthy, DEVICE_TYPE_DISK, OPTION_PATH, OPTION_SOURCE, OPTION_TYPE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A filesystem mount from a host path into the workload.
#[derive(Debug, Clone, PartialEq, Eq, Default, TypedBuilder)]
pub struct Disk {
    /// The device entry name; derived from the path when unset.
    #[builder(default)]
    pub name: Option<String>,

    /// The mount target inside the workload.
    #[builder(default, setter(into))]
    pub path: String,

    /// The host path being mounted.
    #[builder(default, setter(into))]
    pub source: String,

    /// Whether the mount is read-only.
    #[builder(default)]
    pub readonly: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Disk {
    /// Returns the device entry name, deriving `disk-<path>` with `/`
    /// flattened to `-` when no name was assigned. Falls back to the source
    /// when the path is empty.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => path_derived_name("disk", &self.path, &self.source),
        }
    }

    /// Encodes the device into its named option map.
    pub fn to_map(&self) -> (String, HashMap<String, String>) {
        let mut options = HashMap::from([(OPTION_TYPE.to_string(), DEVICE_TYPE_DISK.to_string())]);
        if !self.path.is_empty() {
            options.insert(OPTION_PATH.to_string(), self.path.clone());
        }
        if !self.source.is_empty() {
            options.insert(OPTION_SOURCE.to_string(), self.source.clone());
        }
        if self.readonly {
            options.insert("readonly".to_string(), "true".to_string());
        }
        (self.effective_name(), options)
    }

    /// Decodes the device from its named option map.
    pub fn from_map(name: &str, options: &HashMap<String, String>) -> LxdletResult<Self> {
        Ok(Self {
            name: Some(name.to_string()),
            path: options.get(OPTION_PATH).cloned().unwrap_or_default(),
            source: options.get(OPTION_SOURCE).cloned().unwrap_or_default(),
            readonly: truthy(options.get("readonly")),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
