use std::collections::HashMap;

use typed_builder::TypedBuilder;

use crate::LxdletResult;

use super::{path_derived_name, DEVICE_TYPE_BLOCK, OPTION_PATH, OPTION_SOURCE, OPTION_TYPE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A host block device exposed to the workload.
#[derive(Debug, Clone, PartialEq, Eq, Default, TypedBuilder)]
pub struct Block {
    /// The device entry name; derived from the path when unset.
    #[builder(default)]
    pub name: Option<String>,

    /// The device node path inside the workload.
    #[builder(default, setter(into))]
    pub path: String,

    /// The host device node being exposed.
    #[builder(default, setter(into))]
    pub source: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Block {
    /// Returns the device entry name, deriving `block-<path>` with `/`
    /// flattened to `-` when no name was assigned.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => path_derived_name("block", &self.path, &self.source),
        }
    }

    /// Encodes the device into its named option map.
    pub fn to_map(&self) -> (String, HashMap<String, String>) {
        let mut options = HashMap::from([(OPTION_TYPE.to_string(), DEVICE_TYPE_BLOCK.to_string())]);
        if !self.path.is_empty() {
            options.insert(OPTION_PATH.to_string(), self.path.clone());
        }
        if !self.source.is_empty() {
            options.insert(OPTION_SOURCE.to_string(), self.source.clone());
        }
        (self.effective_name(), options)
    }

    /// Decodes the device from its named option map.
    pub fn from_map(name: &str, options: &HashMap<String, String>) -> LxdletResult<Self> {
        Ok(Self {
            name: Some(name.to_string()),
            path: options.get(OPTION_PATH).cloned().unwrap_or_default(),
            source: options.get(OPTION_SOURCE).cloned().unwrap_or_default(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
