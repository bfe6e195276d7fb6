use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
    time::Duration,
};

use lxdstore::{ObjectKind, StoreError};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a lxdlet-related operation.
pub type LxdletResult<T> = Result<T, LxdletError>;

/// An error that occurred while translating or driving pod resources.
#[derive(pretty_error_debug::Debug, Error)]
pub enum LxdletError {
    /// An error returned by the hypervisor store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML encoding or decoding error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No sandbox with the given id exists (or the profile with that name is
    /// not owned by this shim).
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// No container with the given id exists (or the instance with that name
    /// is not owned by this shim).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A config key this layer requires is absent from the flat map.
    #[error("missing config key: {0}")]
    MissingConfigKey(String),

    /// A config value could not be parsed.
    #[error("invalid value for config key {key}: {value}")]
    InvalidConfigValue {
        /// The key whose value failed to parse.
        key: String,

        /// The offending value.
        value: String,
    },

    /// A device map carried a `type` value this layer does not model.
    #[error("unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    /// A device map could not be decoded.
    #[error("invalid device {name}: {reason}")]
    InvalidDevice {
        /// The device entry name.
        name: String,

        /// Why the entry could not be decoded.
        reason: String,
    },

    /// Two different devices were added under the same effective name.
    #[error("ambiguous device name: {0}")]
    AmbiguousDevice(String),

    /// A proxy endpoint string did not match `protocol:address:port`.
    #[error("invalid proxy endpoint: {0}")]
    InvalidProxyEndpoint(String),

    /// An unknown network mode name.
    #[error("invalid network mode: {0}")]
    InvalidNetworkMode(String),

    /// A container referenced no profiles, so its owning sandbox cannot be
    /// determined.
    #[error("container {0} has an empty profile list")]
    EmptyProfileList(String),

    /// A container on a host-network sandbox was not privileged.
    #[error("container {0} must be privileged to share the host network")]
    HostNetworkRequiresPrivileged(String),

    /// A schema migration step failed.
    #[error("migration of {kind} from schema {from:?} to {to:?} failed: {reason}")]
    MigrationStep {
        /// The object kind being migrated.
        kind: ObjectKind,

        /// The schema version the step expected.
        from: String,

        /// The schema version the step produces.
        to: String,

        /// Why the step failed.
        reason: String,
    },

    /// A network backend failed to set up connectivity.
    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    /// No usable network configuration file was found in the conf directory.
    #[error("no network conf file found in {0}")]
    NetworkConfNotFound(PathBuf),

    /// A network backend hook did not return within its deadline.
    #[error("network hook timed out after {0:?}")]
    NetworkHookTimedOut(Duration),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LxdletError {
    /// Creates a new `LxdletError` from an arbitrary error.
    pub fn custom(error: impl Into<anyhow::Error>) -> LxdletError {
        LxdletError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns true if the error marks a sandbox or container that does not
    /// exist, including the underlying store's not-found.
    pub fn is_not_found(&self) -> bool {
        match self {
            LxdletError::SandboxNotFound(_) | LxdletError::ContainerNotFound(_) => true,
            LxdletError::Store(err) => err.is_not_found(),
            _ => false,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_is_surfaced_through_predicate() {
        let err = LxdletError::Store(StoreError::NotFound {
            kind: ObjectKind::Profile,
            name: "p1".to_string(),
        });
        assert!(err.is_not_found());

        let err = LxdletError::SandboxNotFound("p1".to_string());
        assert!(err.is_not_found());

        let err = LxdletError::AmbiguousDevice("disk-tmp".to_string());
        assert!(!err.is_not_found());
    }
}
