//! The pod sandbox entity and its profile codec.
//!
//! A sandbox is stored as a hypervisor profile: every typed field is encoded
//! into the profile's flat config map under the reserved vocabulary, and
//! decoding rebuilds the entity from nothing but that map. The profile is the
//! only source of truth; this process keeps no state of its own.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use lxdstore::{ConfigMap, RawProfile, VersionToken};

use crate::{
    device::Devices,
    keyspace::{
        stripped_prefix_map, Keyspace, KEY_CREATED_AT, KEY_CRI, KEY_HOSTNAME, KEY_LOG_DIRECTORY,
        KEY_METADATA_ATTEMPT, KEY_METADATA_NAME, KEY_METADATA_NAMESPACE, KEY_METADATA_UID,
        KEY_META_DATA, KEY_NETWORK_CONFIG, KEY_NETWORK_MODE, KEY_NETWORK_MODE_DATA,
        KEY_NETWORK_NAMESERVERS, KEY_NETWORK_SEARCHES, KEY_SCHEMA, KEY_STATE, PREFIX_ANNOTATIONS,
        PREFIX_LABELS, VAL_TRUE,
    },
    migration::PROFILE_SCHEMA_VERSION,
    utils::{config_nanos, config_number, join_csv, nanos_string, split_csv},
    LxdletError, LxdletResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Sandbox readiness wire value for [`SandboxState::Ready`].
pub const STATE_READY: &str = "ready";

/// Sandbox readiness wire value for [`SandboxState::NotReady`].
pub const STATE_NOTREADY: &str = "notready";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The identifying metadata of a pod sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxMetadata {
    /// The pod name.
    pub name: String,

    /// The pod namespace.
    pub namespace: String,

    /// The pod uid assigned by the orchestrator.
    pub uid: String,

    /// The creation attempt counter.
    pub attempt: u32,
}

/// Whether a sandbox can accept new containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxState {
    /// The sandbox is up and accepts containers.
    Ready,

    /// The sandbox was stopped or never came up.
    #[default]
    NotReady,
}

/// How a sandbox reaches the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    /// Attached to a managed bridge.
    #[default]
    Bridged,

    /// Wired up by a CNI plugin.
    Cni,

    /// Sharing the host's network namespace.
    Host,

    /// No network at all.
    None,
}

/// The network intent of a sandbox, including the free-form state owned by
/// the active network backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkConfig {
    /// DNS nameservers handed to the workloads.
    pub nameservers: Vec<String>,

    /// DNS search domains handed to the workloads.
    pub searches: Vec<String>,

    /// The mode the sandbox was created with.
    pub mode: NetworkMode,

    /// Backend-owned key/value state, persisted verbatim.
    pub mode_data: HashMap<String, String>,
}

/// A pod sandbox.
///
/// Caller-owned fields are public; fields owned by the lifecycle (id, version
/// token, state, creation time) are read-only outside the crate.
#[derive(Debug, Clone, Getters)]
pub struct Sandbox {
    /// The identifying metadata.
    pub metadata: SandboxMetadata,

    /// The hostname inside the sandbox.
    pub hostname: String,

    /// The directory container logs are collected under.
    pub log_directory: String,

    /// The network intent.
    pub network_config: NetworkConfig,

    /// Caller labels.
    pub labels: HashMap<String, String>,

    /// Caller annotations.
    pub annotations: HashMap<String, String>,

    /// Residual caller config entries, persisted next to the reserved
    /// vocabulary.
    pub config: ConfigMap,

    /// The devices attached to the sandbox.
    pub devices: Devices,

    /// Cloud-init network fragments contributed by network backends.
    pub cloud_init_network_config_entries: Vec<serde_yaml::Value>,

    /// The unique sandbox id, assigned on the first write.
    #[getset(get = "pub with_prefix")]
    id: String,

    /// The version token from the last read or write.
    #[getset(get = "pub with_prefix")]
    version_token: VersionToken,

    /// The readiness of the sandbox.
    #[getset(get = "pub with_prefix")]
    state: SandboxState,

    /// When the sandbox was first written.
    #[getset(get = "pub with_prefix")]
    created_at: DateTime<Utc>,

    /// Ids of the containers currently placed in this sandbox. Derived on
    /// read.
    #[getset(get = "pub with_prefix")]
    used_by: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    /// Creates an empty sandbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sandbox with the given metadata.
    pub fn with_metadata(metadata: SandboxMetadata) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    /// Encodes the sandbox into the profile that stores it.
    ///
    /// Residual caller config entries that collide with the reserved
    /// vocabulary are dropped with a warning rather than failing the write.
    pub fn to_profile(&self) -> LxdletResult<RawProfile> {
        let keyspace = Keyspace::cri();
        let mut config = ConfigMap::new();

        config.insert(KEY_CRI.to_string(), VAL_TRUE.to_string());
        config.insert(KEY_SCHEMA.to_string(), PROFILE_SCHEMA_VERSION.to_string());
        config.insert(KEY_METADATA_NAME.to_string(), self.metadata.name.clone());
        config.insert(
            KEY_METADATA_NAMESPACE.to_string(),
            self.metadata.namespace.clone(),
        );
        config.insert(KEY_METADATA_UID.to_string(), self.metadata.uid.clone());
        config.insert(
            KEY_METADATA_ATTEMPT.to_string(),
            self.metadata.attempt.to_string(),
        );
        config.insert(KEY_HOSTNAME.to_string(), self.hostname.clone());
        config.insert(KEY_LOG_DIRECTORY.to_string(), self.log_directory.clone());
        config.insert(KEY_CREATED_AT.to_string(), nanos_string(&self.created_at));
        config.insert(KEY_STATE.to_string(), self.state.to_string());

        for (key, value) in &self.labels {
            config.insert(format!("{}.{}", PREFIX_LABELS, key), value.clone());
        }
        for (key, value) in &self.annotations {
            config.insert(format!("{}.{}", PREFIX_ANNOTATIONS, key), value.clone());
        }

        if !self.network_config.nameservers.is_empty() {
            config.insert(
                KEY_NETWORK_NAMESERVERS.to_string(),
                join_csv(&self.network_config.nameservers),
            );
        }
        if !self.network_config.searches.is_empty() {
            config.insert(
                KEY_NETWORK_SEARCHES.to_string(),
                join_csv(&self.network_config.searches),
            );
        }
        config.insert(
            KEY_NETWORK_MODE.to_string(),
            self.network_config.mode.to_string(),
        );
        if !self.network_config.mode_data.is_empty() {
            // Sorted so re-encoding an unchanged sandbox is byte-identical.
            let ordered: BTreeMap<&String, &String> =
                self.network_config.mode_data.iter().collect();
            config.insert(
                KEY_NETWORK_MODE_DATA.to_string(),
                serde_yaml::to_string(&ordered)?,
            );
        }

        if !self.hostname.is_empty() {
            config.insert(
                KEY_META_DATA.to_string(),
                format!("local-hostname: {}", self.hostname),
            );
        }
        if !self.cloud_init_network_config_entries.is_empty() {
            let mut doc = serde_yaml::Mapping::new();
            doc.insert(
                serde_yaml::Value::from("version"),
                serde_yaml::Value::from(1),
            );
            doc.insert(
                serde_yaml::Value::from("config"),
                serde_yaml::Value::Sequence(self.cloud_init_network_config_entries.clone()),
            );
            config.insert(
                KEY_NETWORK_CONFIG.to_string(),
                serde_yaml::to_string(&serde_yaml::Value::Mapping(doc))?,
            );
        }

        keyspace.merge_unreserved(&mut config, &self.config);

        Ok(RawProfile {
            name: self.id.clone(),
            config,
            devices: self.devices.to_map(),
            used_by: Vec::new(),
            etag: self.version_token.clone(),
        })
    }

    /// Decodes a sandbox from the profile that stores it.
    ///
    /// ## Errors
    ///
    /// Returns [`LxdletError::SandboxNotFound`] when the profile does not
    /// carry the ownership marker; malformed numerics, devices, and YAML
    /// payloads are hard errors.
    pub fn from_profile(profile: &RawProfile) -> LxdletResult<Self> {
        let config = &profile.config;
        if config.get(KEY_CRI).map(String::as_str) != Some(VAL_TRUE) {
            return Err(LxdletError::SandboxNotFound(profile.name.clone()));
        }
        let keyspace = Keyspace::cri();

        let metadata = SandboxMetadata {
            name: config.get(KEY_METADATA_NAME).cloned().unwrap_or_default(),
            namespace: config
                .get(KEY_METADATA_NAMESPACE)
                .cloned()
                .unwrap_or_default(),
            uid: config.get(KEY_METADATA_UID).cloned().unwrap_or_default(),
            attempt: config_number(config, KEY_METADATA_ATTEMPT)?,
        };

        let state = match config.get(KEY_STATE).map(String::as_str) {
            Some(STATE_READY) => SandboxState::Ready,
            _ => SandboxState::NotReady,
        };

        let mode = match config.get(KEY_NETWORK_MODE) {
            Some(raw) => raw.parse()?,
            None => NetworkMode::default(),
        };
        let mode_data = match config.get(KEY_NETWORK_MODE_DATA) {
            Some(raw) if !raw.trim().is_empty() => serde_yaml::from_str(raw)?,
            _ => HashMap::new(),
        };
        let network_config = NetworkConfig {
            nameservers: config
                .get(KEY_NETWORK_NAMESERVERS)
                .map(|raw| split_csv(raw))
                .unwrap_or_default(),
            searches: config
                .get(KEY_NETWORK_SEARCHES)
                .map(|raw| split_csv(raw))
                .unwrap_or_default(),
            mode,
            mode_data,
        };

        let cloud_init_network_config_entries = match config.get(KEY_NETWORK_CONFIG) {
            Some(raw) if !raw.trim().is_empty() => {
                let doc: serde_yaml::Value = serde_yaml::from_str(raw)?;
                doc.get("config")
                    .and_then(serde_yaml::Value::as_sequence)
                    .cloned()
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        };

        Ok(Self {
            metadata,
            hostname: config.get(KEY_HOSTNAME).cloned().unwrap_or_default(),
            log_directory: config.get(KEY_LOG_DIRECTORY).cloned().unwrap_or_default(),
            network_config,
            labels: stripped_prefix_map(config, PREFIX_LABELS),
            annotations: stripped_prefix_map(config, PREFIX_ANNOTATIONS),
            config: keyspace.unreserved_map(config),
            devices: Devices::from_map(&profile.devices)?,
            cloud_init_network_config_entries,
            id: profile.name.clone(),
            version_token: profile.etag.clone(),
            state,
            created_at: config_nanos(config, KEY_CREATED_AT)?.unwrap_or(DateTime::UNIX_EPOCH),
            used_by: profile.used_by.clone(),
        })
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub(crate) fn set_version_token(&mut self, token: VersionToken) {
        self.version_token = token;
    }

    pub(crate) fn set_state(&mut self, state: SandboxState) {
        self.state = state;
    }

    pub(crate) fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            metadata: SandboxMetadata::default(),
            hostname: String::new(),
            log_directory: String::new(),
            network_config: NetworkConfig::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            config: ConfigMap::new(),
            devices: Devices::new(),
            cloud_init_network_config_entries: Vec::new(),
            id: String::new(),
            version_token: VersionToken::default(),
            state: SandboxState::default(),
            created_at: DateTime::UNIX_EPOCH,
            used_by: Vec::new(),
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxState::Ready => write!(f, "{}", STATE_READY),
            SandboxState::NotReady => write!(f, "{}", STATE_NOTREADY),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = LxdletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridged" => Ok(NetworkMode::Bridged),
            "cni" => Ok(NetworkMode::Cni),
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            other => Err(LxdletError::InvalidNetworkMode(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Bridged => write!(f, "bridged"),
            NetworkMode::Cni => write!(f, "cni"),
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::None => write!(f, "none"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
