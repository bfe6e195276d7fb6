//! The container entity and its instance codec.
//!
//! A container is stored as a hypervisor instance. The owning sandbox is not
//! a field of its own: it is the last entry of the instance's profile list,
//! which also makes the hypervisor apply the sandbox's profile to the
//! workload.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use getset::Getters;
use lxdstore::{ConfigMap, RawInstance, StatusCode, VersionToken};

use crate::{
    device::Devices,
    keyspace::{
        stripped_prefix_map, Keyspace, KEY_CREATED_AT, KEY_CREATED_MARKER, KEY_CRI,
        KEY_FINISHED_AT, KEY_IMAGE, KEY_LIMITS_CPU_ALLOWANCE, KEY_LIMITS_MEMORY, KEY_LOG_PATH,
        KEY_METADATA_ATTEMPT, KEY_METADATA_NAME, KEY_META_DATA, KEY_NETWORK_CONFIG,
        KEY_PRIVILEGED, KEY_RESOURCES_CPU_PERIOD, KEY_RESOURCES_CPU_QUOTA,
        KEY_RESOURCES_CPU_SHARES, KEY_RESOURCES_MEMORY_LIMIT, KEY_SCHEMA, KEY_STARTED_AT,
        KEY_USER_DATA, KEY_VENDOR_DATA, PREFIX_ANNOTATIONS, PREFIX_ENVIRONMENT, PREFIX_LABELS,
        VAL_TRUE,
    },
    migration::INSTANCE_SCHEMA_VERSION,
    utils::{config_nanos, config_number, nanos_string},
    LxdletError, LxdletResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The identifying metadata of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    /// The container name within its pod.
    pub name: String,

    /// The creation attempt counter.
    pub attempt: u32,
}

/// The lifecycle phase of a container.
///
/// The hypervisor reports created and exited workloads with the same stopped
/// status; the two are told apart by a marker key that exists from creation
/// until the first start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but never started.
    #[default]
    Created,

    /// Currently running.
    Running,

    /// Ran at least once and stopped.
    Exited,

    /// The hypervisor reported a status outside this model.
    Unknown,
}

/// The resource requests of a container.
///
/// Zero means unset throughout; CPU quota and period are microseconds, the
/// memory limit is bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    /// Relative CPU weight.
    pub cpu_shares: i64,

    /// CPU time per period, in microseconds.
    pub cpu_quota: i64,

    /// CPU accounting period, in microseconds.
    pub cpu_period: i64,

    /// Memory ceiling in bytes.
    pub memory_limit_bytes: i64,
}

/// A container.
///
/// Caller-owned fields are public; fields owned by the lifecycle (id, version
/// token, state, timestamps) are read-only outside the crate.
#[derive(Debug, Clone, Getters)]
pub struct Container {
    /// The identifying metadata.
    pub metadata: ContainerMetadata,

    /// The image the workload runs from.
    pub image: String,

    /// Whether the workload runs privileged.
    pub privileged: bool,

    /// Environment variables handed to the workload.
    pub environment: HashMap<String, String>,

    /// The profiles applied to the instance, in application order. The last
    /// entry is the owning sandbox id.
    pub profiles: Vec<String>,

    /// Resource requests.
    pub resources: Resources,

    /// The file container logs are written to.
    pub log_path: String,

    /// Caller labels.
    pub labels: HashMap<String, String>,

    /// Caller annotations.
    pub annotations: HashMap<String, String>,

    /// Residual caller config entries.
    pub config: ConfigMap,

    /// The devices attached to the container.
    pub devices: Devices,

    /// Cloud-init user data; empty means unset and is not persisted.
    pub user_data: String,

    /// Cloud-init meta data; empty means unset and is not persisted.
    pub meta_data: String,

    /// Cloud-init network configuration; empty means unset and is not
    /// persisted.
    pub network_config: String,

    /// Cloud-init vendor data; empty means unset and is not persisted.
    pub vendor_data: String,

    /// The unique container id, assigned on the first write.
    #[getset(get = "pub with_prefix")]
    id: String,

    /// The version token from the last read or write.
    #[getset(get = "pub with_prefix")]
    version_token: VersionToken,

    /// The lifecycle phase, derived on read.
    #[getset(get = "pub with_prefix")]
    state: ContainerState,

    /// When the container was first written.
    #[getset(get = "pub with_prefix")]
    created_at: DateTime<Utc>,

    /// When the container was last started, if ever.
    #[getset(get = "pub with_prefix")]
    started_at: Option<DateTime<Utc>>,

    /// When the container last stopped, if ever.
    #[getset(get = "pub with_prefix")]
    finished_at: Option<DateTime<Utc>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Container {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a container with the given metadata.
    pub fn with_metadata(metadata: ContainerMetadata) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    /// Returns the owning sandbox id, i.e. the last profile entry.
    ///
    /// ## Errors
    ///
    /// Returns [`LxdletError::EmptyProfileList`] when no profiles are set.
    pub fn sandbox_id(&self) -> LxdletResult<&str> {
        self.profiles
            .last()
            .map(String::as_str)
            .ok_or_else(|| LxdletError::EmptyProfileList(self.id.clone()))
    }

    /// Encodes the container into the instance that stores it.
    pub fn to_instance(&self) -> LxdletResult<RawInstance> {
        if self.profiles.is_empty() {
            return Err(LxdletError::EmptyProfileList(self.id.clone()));
        }
        let keyspace = Keyspace::cri();
        let mut config = ConfigMap::new();

        config.insert(KEY_CRI.to_string(), VAL_TRUE.to_string());
        config.insert(KEY_SCHEMA.to_string(), INSTANCE_SCHEMA_VERSION.to_string());
        config.insert(KEY_METADATA_NAME.to_string(), self.metadata.name.clone());
        config.insert(
            KEY_METADATA_ATTEMPT.to_string(),
            self.metadata.attempt.to_string(),
        );
        config.insert(KEY_IMAGE.to_string(), self.image.clone());
        config.insert(KEY_LOG_PATH.to_string(), self.log_path.clone());
        if self.privileged {
            config.insert(KEY_PRIVILEGED.to_string(), VAL_TRUE.to_string());
        }

        for (key, value) in &self.environment {
            config.insert(format!("{}.{}", PREFIX_ENVIRONMENT, key), value.clone());
        }
        for (key, value) in &self.labels {
            config.insert(format!("{}.{}", PREFIX_LABELS, key), value.clone());
        }
        for (key, value) in &self.annotations {
            config.insert(format!("{}.{}", PREFIX_ANNOTATIONS, key), value.clone());
        }

        config.insert(
            KEY_RESOURCES_CPU_SHARES.to_string(),
            self.resources.cpu_shares.to_string(),
        );
        config.insert(
            KEY_RESOURCES_CPU_QUOTA.to_string(),
            self.resources.cpu_quota.to_string(),
        );
        config.insert(
            KEY_RESOURCES_CPU_PERIOD.to_string(),
            self.resources.cpu_period.to_string(),
        );
        config.insert(
            KEY_RESOURCES_MEMORY_LIMIT.to_string(),
            self.resources.memory_limit_bytes.to_string(),
        );
        if self.resources.memory_limit_bytes > 0 {
            config.insert(
                KEY_LIMITS_MEMORY.to_string(),
                self.resources.memory_limit_bytes.to_string(),
            );
        }
        if self.resources.cpu_quota > 0 && self.resources.cpu_period > 0 {
            // Microseconds to milliseconds; the hypervisor takes ms/ms.
            config.insert(
                KEY_LIMITS_CPU_ALLOWANCE.to_string(),
                format!(
                    "{}ms/{}ms",
                    self.resources.cpu_quota / 1000,
                    self.resources.cpu_period / 1000
                ),
            );
        }

        config.insert(KEY_CREATED_AT.to_string(), nanos_string(&self.created_at));
        if let Some(at) = &self.started_at {
            config.insert(KEY_STARTED_AT.to_string(), nanos_string(at));
        }
        if let Some(at) = &self.finished_at {
            config.insert(KEY_FINISHED_AT.to_string(), nanos_string(at));
        }
        if self.state == ContainerState::Created {
            config.insert(KEY_CREATED_MARKER.to_string(), VAL_TRUE.to_string());
        }

        if !self.user_data.is_empty() {
            config.insert(KEY_USER_DATA.to_string(), self.user_data.clone());
        }
        if !self.meta_data.is_empty() {
            config.insert(KEY_META_DATA.to_string(), self.meta_data.clone());
        }
        if !self.network_config.is_empty() {
            config.insert(KEY_NETWORK_CONFIG.to_string(), self.network_config.clone());
        }
        if !self.vendor_data.is_empty() {
            config.insert(KEY_VENDOR_DATA.to_string(), self.vendor_data.clone());
        }

        keyspace.merge_unreserved(&mut config, &self.config);

        Ok(RawInstance {
            name: self.id.clone(),
            config,
            devices: self.devices.to_map(),
            profiles: self.profiles.clone(),
            status_code: StatusCode::default(),
            pid: None,
            etag: self.version_token.clone(),
        })
    }

    /// Decodes a container from the instance that stores it.
    ///
    /// ## Errors
    ///
    /// Returns [`LxdletError::ContainerNotFound`] when the instance does not
    /// carry the ownership marker and [`LxdletError::EmptyProfileList`] when
    /// the owning sandbox cannot be determined.
    pub fn from_instance(instance: &RawInstance) -> LxdletResult<Self> {
        let config = &instance.config;
        if config.get(KEY_CRI).map(String::as_str) != Some(VAL_TRUE) {
            return Err(LxdletError::ContainerNotFound(instance.name.clone()));
        }
        if instance.profiles.is_empty() {
            return Err(LxdletError::EmptyProfileList(instance.name.clone()));
        }
        let keyspace = Keyspace::cri();

        let metadata = ContainerMetadata {
            name: config.get(KEY_METADATA_NAME).cloned().unwrap_or_default(),
            attempt: config_number(config, KEY_METADATA_ATTEMPT)?,
        };

        // The structured request wins; the native limit only fills the gap
        // for objects written by other tooling.
        let memory_limit_bytes = match config.get(KEY_RESOURCES_MEMORY_LIMIT) {
            Some(_) => config_number(config, KEY_RESOURCES_MEMORY_LIMIT)?,
            None => config_number(config, KEY_LIMITS_MEMORY)?,
        };
        let resources = Resources {
            cpu_shares: config_number(config, KEY_RESOURCES_CPU_SHARES)?,
            cpu_quota: config_number(config, KEY_RESOURCES_CPU_QUOTA)?,
            cpu_period: config_number(config, KEY_RESOURCES_CPU_PERIOD)?,
            memory_limit_bytes,
        };

        let has_marker = config.get(KEY_CREATED_MARKER).map(String::as_str) == Some(VAL_TRUE);
        let state = match instance.status_code {
            StatusCode::Running => ContainerState::Running,
            StatusCode::Stopped if has_marker => ContainerState::Created,
            StatusCode::Stopped => ContainerState::Exited,
            _ => ContainerState::Unknown,
        };

        Ok(Self {
            metadata,
            image: config.get(KEY_IMAGE).cloned().unwrap_or_default(),
            privileged: config.get(KEY_PRIVILEGED).map(String::as_str) == Some(VAL_TRUE),
            environment: stripped_prefix_map(config, PREFIX_ENVIRONMENT),
            profiles: instance.profiles.clone(),
            resources,
            log_path: config.get(KEY_LOG_PATH).cloned().unwrap_or_default(),
            labels: stripped_prefix_map(config, PREFIX_LABELS),
            annotations: stripped_prefix_map(config, PREFIX_ANNOTATIONS),
            config: keyspace.unreserved_map(config),
            devices: Devices::from_map(&instance.devices)?,
            user_data: config.get(KEY_USER_DATA).cloned().unwrap_or_default(),
            meta_data: config.get(KEY_META_DATA).cloned().unwrap_or_default(),
            network_config: config.get(KEY_NETWORK_CONFIG).cloned().unwrap_or_default(),
            vendor_data: config.get(KEY_VENDOR_DATA).cloned().unwrap_or_default(),
            id: instance.name.clone(),
            version_token: instance.etag.clone(),
            state,
            created_at: config_nanos(config, KEY_CREATED_AT)?.unwrap_or(DateTime::UNIX_EPOCH),
            started_at: config_nanos(config, KEY_STARTED_AT)?,
            finished_at: config_nanos(config, KEY_FINISHED_AT)?,
        })
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub(crate) fn set_version_token(&mut self, token: VersionToken) {
        self.version_token = token;
    }

    pub(crate) fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Container {
    fn default() -> Self {
        Self {
            metadata: ContainerMetadata::default(),
            image: String::new(),
            privileged: false,
            environment: HashMap::new(),
            profiles: Vec::new(),
            resources: Resources::default(),
            log_path: String::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            config: ConfigMap::new(),
            devices: Devices::new(),
            user_data: String::new(),
            meta_data: String::new(),
            network_config: String::new(),
            vendor_data: String::new(),
            id: String::new(),
            version_token: VersionToken::default(),
            state: ContainerState::default(),
            created_at: DateTime::UNIX_EPOCH,
            started_at: None,
            finished_at: None,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Container {
        let mut container = Container::with_metadata(ContainerMetadata {
            name: "app".to_string(),
            attempt: 1,
        });
        container.image = "ubuntu/22.04".to_string();
        container.profiles = vec!["default".to_string(), "web-abc123".to_string()];
        container
            .environment
            .insert("PATH".to_string(), "/usr/bin".to_string());
        container
            .environment
            .insert("MODE".to_string(), "prod".to_string());
        container.resources = Resources {
            cpu_shares: 1024,
            cpu_quota: 50_000,
            cpu_period: 100_000,
            memory_limit_bytes: 268_435_456,
        };
        container.log_path = "/var/log/pods/web/app.log".to_string();
        container.labels.insert("app".to_string(), "web".to_string());
        container.user_data = "#cloud-config\nruncmd: [date]\n".to_string();
        container.set_id("app-def456");
        container.set_created_at(DateTime::from_timestamp_nanos(1_726_000_000_000_000_042));
        container
    }

    #[test]
    fn test_instance_round_trip_is_lossless() -> anyhow::Result<()> {
        let container = fixture();

        let instance = container.to_instance()?;
        let decoded = Container::from_instance(&instance)?;
        let reencoded = decoded.to_instance()?;

        assert_eq!(reencoded.config, instance.config);
        assert_eq!(reencoded.devices, instance.devices);
        assert_eq!(reencoded.profiles, instance.profiles);
        Ok(())
    }

    #[test]
    fn test_the_owning_sandbox_is_the_last_profile() -> anyhow::Result<()> {
        let container = fixture();
        assert_eq!(container.sandbox_id()?, "web-abc123");

        let empty = Container::new();
        let err = empty.to_instance().unwrap_err();
        assert!(matches!(err, LxdletError::EmptyProfileList(_)));
        Ok(())
    }

    #[test]
    fn test_environment_travels_under_the_native_prefix() -> anyhow::Result<()> {
        let container = fixture();
        let instance = container.to_instance()?;

        assert_eq!(
            instance.config.get("environment.PATH").map(String::as_str),
            Some("/usr/bin")
        );

        let decoded = Container::from_instance(&instance)?;
        assert_eq!(decoded.environment, container.environment);
        // Native environment entries must not leak into the residual config.
        assert!(!decoded.config.keys().any(|k| k.starts_with("environment.")));
        Ok(())
    }

    #[test]
    fn test_cpu_allowance_is_derived_from_quota_and_period() -> anyhow::Result<()> {
        let container = fixture();
        let instance = container.to_instance()?;
        assert_eq!(
            instance
                .config
                .get(KEY_LIMITS_CPU_ALLOWANCE)
                .map(String::as_str),
            Some("50ms/100ms")
        );

        // No allowance without both positive.
        let mut container = fixture();
        container.resources.cpu_quota = 0;
        let instance = container.to_instance()?;
        assert!(!instance.config.contains_key(KEY_LIMITS_CPU_ALLOWANCE));
        Ok(())
    }

    #[test]
    fn test_memory_limit_prefers_the_structured_key() -> anyhow::Result<()> {
        let mut instance = fixture().to_instance()?;
        instance
            .config
            .insert(KEY_LIMITS_MEMORY.to_string(), "1".to_string());
        instance
            .config
            .insert(KEY_RESOURCES_MEMORY_LIMIT.to_string(), "2048".to_string());
        let decoded = Container::from_instance(&instance)?;
        assert_eq!(decoded.resources.memory_limit_bytes, 2048);

        // Without the structured key the native limit fills the gap.
        instance.config.remove(KEY_RESOURCES_MEMORY_LIMIT);
        let decoded = Container::from_instance(&instance)?;
        assert_eq!(decoded.resources.memory_limit_bytes, 1);
        Ok(())
    }

    #[test]
    fn test_state_is_told_apart_by_the_created_marker() -> anyhow::Result<()> {
        let container = fixture();
        let mut instance = container.to_instance()?;

        // Freshly written: stopped with the marker.
        instance.status_code = StatusCode::Stopped;
        assert_eq!(
            Container::from_instance(&instance)?.get_state(),
            &ContainerState::Created
        );

        // Started: the marker is removed on the way up.
        instance.config.remove(KEY_CREATED_MARKER);
        instance.status_code = StatusCode::Running;
        assert_eq!(
            Container::from_instance(&instance)?.get_state(),
            &ContainerState::Running
        );

        // Stopped again without the marker: it ran before.
        instance.status_code = StatusCode::Stopped;
        assert_eq!(
            Container::from_instance(&instance)?.get_state(),
            &ContainerState::Exited
        );

        instance.status_code = StatusCode::Frozen;
        assert_eq!(
            Container::from_instance(&instance)?.get_state(),
            &ContainerState::Unknown
        );
        Ok(())
    }

    #[test]
    fn test_cloud_init_absence_is_preserved() -> anyhow::Result<()> {
        let mut container = fixture();
        container.user_data = String::new();

        let instance = container.to_instance()?;
        assert!(!instance.config.contains_key(KEY_USER_DATA));
        assert!(!instance.config.contains_key(KEY_VENDOR_DATA));

        let decoded = Container::from_instance(&instance)?;
        assert!(decoded.user_data.is_empty());

        // Non-empty payloads survive verbatim.
        container.vendor_data = "#cloud-config\n".to_string();
        let decoded = Container::from_instance(&container.to_instance()?)?;
        assert_eq!(decoded.vendor_data, "#cloud-config\n");
        Ok(())
    }

    #[test]
    fn test_instances_without_the_marker_read_as_not_found() {
        let instance = RawInstance::with_name("vm1");
        let err = Container::from_instance(&instance).unwrap_err();
        assert!(matches!(err, LxdletError::ContainerNotFound(name) if name == "vm1"));
    }

    #[test]
    fn test_privileged_round_trips_through_the_native_key() -> anyhow::Result<()> {
        let mut container = fixture();
        container.privileged = true;

        let instance = container.to_instance()?;
        assert_eq!(
            instance.config.get(KEY_PRIVILEGED).map(String::as_str),
            Some(VAL_TRUE)
        );

        let decoded = Container::from_instance(&instance)?;
        assert!(decoded.privileged);
        Ok(())
    }
}
