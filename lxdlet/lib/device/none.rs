use std::collections::HashMap;

use crate::LxdletResult;

use super::{DEVICE_TYPE_NONE, OPTION_TYPE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A masking entry that hides an inherited device from a lower layer.
///
/// It carries no payload besides its name, which must match the entry being
/// masked, so the name is assigned rather than derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoneDevice {
    /// The name of the inherited device entry being masked.
    pub name: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NoneDevice {
    /// Creates a masking entry for the given device name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the device entry name.
    pub fn effective_name(&self) -> String {
        self.name.clone()
    }

    /// Encodes the device into its named option map.
    pub fn to_map(&self) -> (String, HashMap<String, String>) {
        let options = HashMap::from([(OPTION_TYPE.to_string(), DEVICE_TYPE_NONE.to_string())]);
        (self.effective_name(), options)
    }

    /// Decodes the device from its named option map.
    pub fn from_map(name: &str, _options: &HashMap<String, String>) -> LxdletResult<Self> {
        Ok(Self::new(name))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
