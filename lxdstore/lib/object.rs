//! Raw hypervisor objects as they cross the wire.
//!
//! These types deliberately stay untyped where the hypervisor is untyped: all
//! structured configuration travels through the flat [`ConfigMap`], and devices
//! are plain named option maps with a `"type"` discriminator. Giving the flat
//! substrate shape is the job of the codec in the core crate, not of this one.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The flat, unordered key/value configuration map attached to every object.
pub type ConfigMap = HashMap<String, String>;

/// Named device entries; each inner map carries a `"type"` discriminator.
pub type DeviceMap = HashMap<String, HashMap<String, String>>;

/// An opaque optimistic-concurrency tag identifying the last-read state of an
/// object.
///
/// The token is empty for objects that have not been created yet. It is
/// compared by the store on update; this layer never interprets its contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

/// The hypervisor's numeric status of an instance.
///
/// The hypervisor reports a freshly created instance and a stopped one with
/// the same `Stopped` code; consumers that need to tell the two apart must
/// keep their own bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The instance is starting up.
    Starting,

    /// The instance is running.
    Running,

    /// The instance is shutting down.
    Stopping,

    /// The instance is stopped (or was never started).
    Stopped,

    /// The instance is frozen.
    Frozen,

    /// The instance is in an error state.
    Error,

    /// A status code this library does not model.
    Other(u32),
}

/// A pod-level profile object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProfile {
    /// The unique name of the profile.
    pub name: String,

    /// The flat configuration map.
    #[serde(default)]
    pub config: ConfigMap,

    /// The devices attached to the profile.
    #[serde(default)]
    pub devices: DeviceMap,

    /// Names of the instances referencing this profile. Derived by the store;
    /// writes to this field are ignored.
    #[serde(default)]
    pub used_by: Vec<String>,

    /// The version token from the last read. Empty before the first create.
    #[serde(skip)]
    pub etag: VersionToken,
}

/// A runnable instance object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInstance {
    /// The unique name of the instance.
    pub name: String,

    /// The flat configuration map.
    #[serde(default)]
    pub config: ConfigMap,

    /// The devices attached to the instance.
    #[serde(default)]
    pub devices: DeviceMap,

    /// The profiles applied to the instance, in application order.
    #[serde(default)]
    pub profiles: Vec<String>,

    /// The current status of the instance.
    pub status_code: StatusCode,

    /// The init process id while the instance is running.
    #[serde(default)]
    pub pid: Option<u32>,

    /// The version token from the last read. Empty before the first create.
    #[serde(skip)]
    pub etag: VersionToken,
}

/// A managed bridge network object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNetwork {
    /// The unique name of the network.
    pub name: String,

    /// The flat configuration map (`ipv4.address`, `ipv4.nat`, ...).
    #[serde(default)]
    pub config: ConfigMap,

    /// Whether the hypervisor manages the underlying interface.
    #[serde(default)]
    pub managed: bool,

    /// The version token from the last read. Empty before the first create.
    #[serde(skip)]
    pub etag: VersionToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VersionToken {
    /// Creates a new version token from its opaque string representation.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns true if the token is empty, i.e. the object has never been
    /// read or created.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the opaque string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl StatusCode {
    /// Returns the status for a numeric code.
    pub fn from_code(code: u32) -> Self {
        match code {
            102 => StatusCode::Stopped,
            103 => StatusCode::Running,
            106 => StatusCode::Starting,
            107 => StatusCode::Stopping,
            110 => StatusCode::Frozen,
            112 => StatusCode::Error,
            other => StatusCode::Other(other),
        }
    }

    /// Returns the numeric code of the status.
    pub fn code(&self) -> u32 {
        match self {
            StatusCode::Stopped => 102,
            StatusCode::Running => 103,
            StatusCode::Starting => 106,
            StatusCode::Stopping => 107,
            StatusCode::Frozen => 110,
            StatusCode::Error => 112,
            StatusCode::Other(code) => *code,
        }
    }
}

impl RawInstance {
    /// Creates a stopped instance with the given name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ConfigMap::new(),
            devices: DeviceMap::new(),
            profiles: Vec::new(),
            status_code: StatusCode::Stopped,
            pid: None,
            etag: VersionToken::default(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Stopped
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Starting => write!(f, "starting"),
            StatusCode::Running => write!(f, "running"),
            StatusCode::Stopping => write!(f, "stopping"),
            StatusCode::Stopped => write!(f, "stopped"),
            StatusCode::Frozen => write!(f, "frozen"),
            StatusCode::Error => write!(f, "error"),
            StatusCode::Other(code) => write!(f, "status {}", code),
        }
    }
}

impl Serialize for StatusCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = u32::deserialize(deserializer)?;
        Ok(StatusCode::from_code(code))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_token_empty_until_assigned() {
        let token = VersionToken::default();
        assert!(token.is_empty());

        let token = VersionToken::new("a1");
        assert!(!token.is_empty());
        assert_eq!(token.as_str(), "a1");
    }

    #[test]
    fn test_status_code_round_trips_numeric_codes() {
        for code in [102, 103, 106, 107, 110, 112, 999] {
            assert_eq!(StatusCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_status_code_serde_uses_numeric_representation() {
        let json = serde_json::to_string(&StatusCode::Running).unwrap();
        assert_eq!(json, "103");

        let status: StatusCode = serde_json::from_str("102").unwrap();
        assert_eq!(status, StatusCode::Stopped);

        let status: StatusCode = serde_json::from_str("555").unwrap();
        assert_eq!(status, StatusCode::Other(555));
    }
}
