//! The flat config key vocabulary this layer reserves for itself.
//!
//! The hypervisor offers exactly one storage channel per object: a flat,
//! unordered string-to-string map. Everything this layer persists (ownership
//! marker, schema tag, timestamps, metadata, network intent) lives in that
//! map next to arbitrary caller-supplied entries, so the reserved vocabulary
//! has to be checkable: no caller key may ever be mistaken for one of ours
//! and nothing of ours may leak back out as caller config.

use std::collections::HashSet;

use lxdstore::ConfigMap;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Ownership marker; present with value [`VAL_TRUE`] on every object this
/// layer manages.
pub const KEY_CRI: &str = "user.cri";

/// Schema tag recording which config layout version an object was written
/// with.
pub const KEY_SCHEMA: &str = "user.lxdlet.schema";

/// Pre-versioning ownership marker, only ever read by the migration walk.
pub const KEY_LEGACY_CRI: &str = "user.is_cri";

/// Creation time as a base-10 nanosecond string.
pub const KEY_CREATED_AT: &str = "user.created_at";

/// Start time as a base-10 nanosecond string; absent until the first start.
pub const KEY_STARTED_AT: &str = "user.started_at";

/// Finish time as a base-10 nanosecond string; absent until the first stop.
pub const KEY_FINISHED_AT: &str = "user.finished_at";

/// Sandbox readiness, `ready` or `notready`.
pub const KEY_STATE: &str = "user.state";

/// Marks an instance as created but never started; deleted on first start.
pub const KEY_CREATED_MARKER: &str = "user.lxdlet.created";

/// The sandbox hostname.
pub const KEY_HOSTNAME: &str = "user.hostname";

/// The sandbox log directory.
pub const KEY_LOG_DIRECTORY: &str = "user.log_directory";

/// The container log path.
pub const KEY_LOG_PATH: &str = "user.log_path";

/// The container image name.
pub const KEY_IMAGE: &str = "user.image";

/// Hypervisor-native privileged toggle.
pub const KEY_PRIVILEGED: &str = "security.privileged";

/// Hypervisor-native memory limit in bytes.
pub const KEY_LIMITS_MEMORY: &str = "limits.memory";

/// Hypervisor-native CPU allowance, written as `"<quota>ms/<period>ms"`.
pub const KEY_LIMITS_CPU_ALLOWANCE: &str = "limits.cpu.allowance";

/// Cloud-init user data payload.
pub const KEY_USER_DATA: &str = "user.user-data";

/// Cloud-init meta data payload.
pub const KEY_META_DATA: &str = "user.meta-data";

/// Cloud-init network configuration payload.
pub const KEY_NETWORK_CONFIG: &str = "user.network-config";

/// Cloud-init vendor data payload.
pub const KEY_VENDOR_DATA: &str = "user.vendor-data";

/// Comma-joined DNS nameserver list.
pub const KEY_NETWORK_NAMESERVERS: &str = "user.networkconfig.nameservers";

/// Comma-joined DNS search domain list.
pub const KEY_NETWORK_SEARCHES: &str = "user.networkconfig.searches";

/// The network mode the sandbox was created with.
pub const KEY_NETWORK_MODE: &str = "user.networkconfig.mode";

/// YAML-encoded free-form state owned by the active network backend.
pub const KEY_NETWORK_MODE_DATA: &str = "user.networkconfig.modedata";

/// Pod/container metadata prefix (`user.metadata.name` and friends).
pub const PREFIX_METADATA: &str = "user.metadata";

/// Caller label prefix.
pub const PREFIX_LABELS: &str = "user.labels";

/// Caller annotation prefix.
pub const PREFIX_ANNOTATIONS: &str = "user.annotations";

/// Structured resource request prefix.
pub const PREFIX_RESOURCES: &str = "user.resources";

/// Hypervisor-native environment variable prefix; values under it reach the
/// workload.
pub const PREFIX_ENVIRONMENT: &str = "environment";

/// This layer's own bookkeeping prefix (schema tag, created marker).
pub const PREFIX_LXDLET: &str = "user.lxdlet";

/// Pod metadata name key.
pub const KEY_METADATA_NAME: &str = "user.metadata.name";

/// Pod metadata namespace key.
pub const KEY_METADATA_NAMESPACE: &str = "user.metadata.namespace";

/// Pod metadata uid key.
pub const KEY_METADATA_UID: &str = "user.metadata.uid";

/// Pod metadata attempt key.
pub const KEY_METADATA_ATTEMPT: &str = "user.metadata.attempt";

/// Structured CPU shares request.
pub const KEY_RESOURCES_CPU_SHARES: &str = "user.resources.cpu.shares";

/// Structured CPU quota request in microseconds.
pub const KEY_RESOURCES_CPU_QUOTA: &str = "user.resources.cpu.quota";

/// Structured CPU period request in microseconds.
pub const KEY_RESOURCES_CPU_PERIOD: &str = "user.resources.cpu.period";

/// Structured memory limit request in bytes. Wins over [`KEY_LIMITS_MEMORY`]
/// on read.
pub const KEY_RESOURCES_MEMORY_LIMIT: &str = "user.resources.memory.limit";

/// The canonical truthy config value.
pub const VAL_TRUE: &str = "true";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A checkable set of reserved config keys.
///
/// A key is reserved when it matches an exact entry, equals a prefix entry,
/// or descends from a prefix entry through a `.` separator. Reserving the
/// prefix `foo` therefore reserves `foo` and `foo.bar` but not `foobar`.
#[derive(Debug, Clone)]
pub struct Keyspace {
    /// Keys reserved verbatim.
    exact: HashSet<&'static str>,

    /// Prefixes whose `.`-descendants are reserved.
    prefixes: Vec<&'static str>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Keyspace {
    /// Creates a keyspace from explicit exact keys and prefixes.
    pub fn new(
        exact: impl IntoIterator<Item = &'static str>,
        prefixes: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        Self {
            exact: exact.into_iter().collect(),
            prefixes: prefixes.into_iter().collect(),
        }
    }

    /// Returns the vocabulary this layer reserves on the objects it manages.
    pub fn cri() -> Self {
        Self::new(
            [
                KEY_CRI,
                KEY_SCHEMA,
                KEY_LEGACY_CRI,
                KEY_CREATED_AT,
                KEY_STARTED_AT,
                KEY_FINISHED_AT,
                KEY_STATE,
                KEY_CREATED_MARKER,
                KEY_HOSTNAME,
                KEY_LOG_DIRECTORY,
                KEY_LOG_PATH,
                KEY_IMAGE,
                KEY_PRIVILEGED,
                KEY_LIMITS_MEMORY,
                KEY_LIMITS_CPU_ALLOWANCE,
                KEY_USER_DATA,
                KEY_META_DATA,
                KEY_NETWORK_CONFIG,
                KEY_VENDOR_DATA,
                KEY_NETWORK_NAMESERVERS,
                KEY_NETWORK_SEARCHES,
                KEY_NETWORK_MODE,
                KEY_NETWORK_MODE_DATA,
            ],
            [
                PREFIX_METADATA,
                PREFIX_LABELS,
                PREFIX_ANNOTATIONS,
                PREFIX_RESOURCES,
                PREFIX_ENVIRONMENT,
                PREFIX_LXDLET,
            ],
        )
    }

    /// Returns true if the key belongs to the reserved vocabulary.
    pub fn is_reserved(&self, key: &str) -> bool {
        if self.exact.contains(key) {
            return true;
        }
        self.prefixes.iter().any(|prefix| {
            key == *prefix
                || (key.len() > prefix.len()
                    && key.starts_with(prefix)
                    && key.as_bytes()[prefix.len()] == b'.')
        })
    }

    /// Returns the entries of `config` that are not reserved, i.e. the
    /// caller-owned remainder of a flat map.
    pub fn unreserved_map(&self, config: &ConfigMap) -> ConfigMap {
        config
            .iter()
            .filter(|(key, _)| !self.is_reserved(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Copies caller-supplied entries into `target`, dropping any that would
    /// collide with the reserved vocabulary.
    ///
    /// Collisions are logged and skipped rather than refused: an error here
    /// would fail the whole pod write over a key the caller usually does not
    /// control directly.
    pub fn merge_unreserved(&self, target: &mut ConfigMap, residual: &ConfigMap) {
        for (key, value) in residual {
            if self.is_reserved(key) {
                tracing::warn!(key = %key, "dropping caller config entry that collides with a reserved key");
                continue;
            }
            target.insert(key.clone(), value.clone());
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the entries of `config` under `prefix` with the prefix and its
/// separator removed, e.g. `user.labels.app` becomes `app` for the prefix
/// `user.labels`.
pub fn stripped_prefix_map(config: &ConfigMap, prefix: &str) -> ConfigMap {
    let lead = format!("{}.", prefix);
    config
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&lead)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), value.clone()))
        })
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_reserves_dot_descendants_only() {
        let keyspace = Keyspace::new([], ["foo"]);
        assert!(keyspace.is_reserved("foo"));
        assert!(keyspace.is_reserved("foo.bar"));
        assert!(keyspace.is_reserved("foo.bar.baz"));
        assert!(!keyspace.is_reserved("foobar"));
        assert!(!keyspace.is_reserved("fo"));
    }

    #[test]
    fn test_exact_keys_do_not_reserve_descendants() {
        let keyspace = Keyspace::new(["alpha.beta"], []);
        assert!(keyspace.is_reserved("alpha.beta"));
        assert!(!keyspace.is_reserved("alpha.beta.gamma"));
        assert!(!keyspace.is_reserved("alpha"));
    }

    #[test]
    fn test_cri_vocabulary_covers_the_key_table() {
        let keyspace = Keyspace::cri();
        assert!(keyspace.is_reserved(KEY_CRI));
        assert!(keyspace.is_reserved(KEY_SCHEMA));
        assert!(keyspace.is_reserved("user.labels.app"));
        assert!(keyspace.is_reserved("user.metadata.name"));
        assert!(keyspace.is_reserved("environment.PATH"));
        assert!(keyspace.is_reserved("user.resources.cpu.shares"));

        assert!(!keyspace.is_reserved("user.labelsfoo"));
        assert!(!keyspace.is_reserved("environmental"));
        assert!(!keyspace.is_reserved("user.custom.key"));
        assert!(!keyspace.is_reserved("raw.lxc"));
    }

    #[test]
    fn test_unreserved_map_is_the_strict_complement() {
        let keyspace = Keyspace::cri();
        let config = ConfigMap::from([
            (KEY_CRI.to_string(), VAL_TRUE.to_string()),
            ("user.labels.app".to_string(), "db".to_string()),
            ("raw.lxc".to_string(), "lxc.apparmor.profile=x".to_string()),
            ("user.custom".to_string(), "1".to_string()),
        ]);

        let rest = keyspace.unreserved_map(&config);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.get("raw.lxc").map(String::as_str), Some("lxc.apparmor.profile=x"));
        assert_eq!(rest.get("user.custom").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_merge_unreserved_drops_colliding_entries() {
        let keyspace = Keyspace::cri();
        let mut target = ConfigMap::from([(KEY_STATE.to_string(), "ready".to_string())]);
        let residual = ConfigMap::from([
            (KEY_STATE.to_string(), "notready".to_string()),
            ("raw.lxc".to_string(), "x".to_string()),
        ]);

        keyspace.merge_unreserved(&mut target, &residual);
        assert_eq!(target.get(KEY_STATE).map(String::as_str), Some("ready"));
        assert_eq!(target.get("raw.lxc").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_stripped_prefix_map_keeps_nested_remainders() {
        let config = ConfigMap::from([
            ("user.labels.app".to_string(), "db".to_string()),
            ("user.labels.tier.backend".to_string(), "1".to_string()),
            ("user.labels".to_string(), "ignored".to_string()),
            ("user.annotations.a".to_string(), "b".to_string()),
        ]);

        let labels = stripped_prefix_map(&config, PREFIX_LABELS);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("app").map(String::as_str), Some("db"));
        assert_eq!(labels.get("tier.backend").map(String::as_str), Some("1"));
    }
}
