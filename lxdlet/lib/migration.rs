//! Versioned config schema upgrades.
//!
//! Objects written by older builds carry older config layouts. Every object
//! is stamped with a schema tag, and an ordered list of steps per object kind
//! rewrites one layout into the next. The walk runs once at startup, before
//! any traffic; an object is written back only if a step actually fired.

use std::sync::Arc;

use lxdstore::{ConfigMap, LxdStore, ObjectKind};

use crate::{
    keyspace::{
        KEY_CRI, KEY_LEGACY_CRI, KEY_METADATA_ATTEMPT, KEY_METADATA_NAME, KEY_METADATA_NAMESPACE,
        KEY_METADATA_UID, KEY_SCHEMA, PREFIX_ENVIRONMENT, VAL_TRUE,
    },
    LxdletError, LxdletResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The config schema version current profiles are written with.
pub const PROFILE_SCHEMA_VERSION: &str = "2";

/// The config schema version current instances are written with.
pub const INSTANCE_SCHEMA_VERSION: &str = "3";

/// Pre-nesting metadata keys rewritten by the `"1"` to `"2"` step.
const LEGACY_METADATA_KEYS: [(&str, &str); 4] = [
    ("user.name", KEY_METADATA_NAME),
    ("user.namespace", KEY_METADATA_NAMESPACE),
    ("user.uid", KEY_METADATA_UID),
    ("user.attempt", KEY_METADATA_ATTEMPT),
];

/// The inert environment prefix rewritten by the `"2"` to `"3"` step.
const LEGACY_ENVIRONMENT_PREFIX: &str = "user.environment.";

/// The ordered upgrade path for profiles.
const PROFILE_STEPS: &[MigrationStep] = &[
    MigrationStep {
        from: "",
        to: "1",
        apply: rename_legacy_marker,
    },
    MigrationStep {
        from: "1",
        to: "2",
        apply: nest_metadata,
    },
];

/// The ordered upgrade path for instances.
const INSTANCE_STEPS: &[MigrationStep] = &[
    MigrationStep {
        from: "",
        to: "1",
        apply: rename_legacy_marker,
    },
    MigrationStep {
        from: "1",
        to: "2",
        apply: nest_metadata,
    },
    MigrationStep {
        from: "2",
        to: "3",
        apply: move_environment,
    },
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One schema rewrite along the upgrade path.
///
/// A step fires only on objects whose tag equals `from`; after applying it
/// stamps `to`, which usually makes the next step fire in the same walk.
pub struct MigrationStep {
    /// The schema version the step expects.
    pub from: &'static str,

    /// The schema version the step produces.
    pub to: &'static str,

    /// The rewrite itself.
    pub apply: fn(&mut ConfigMap) -> LxdletResult<()>,
}

/// Walks all owned objects to the current schema versions.
pub struct Migrator {
    /// The store holding the objects.
    store: Arc<dyn LxdStore>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Migrator {
    /// Creates a migrator over the given store.
    pub fn new(store: Arc<dyn LxdStore>) -> Self {
        Self { store }
    }

    /// Walks every owned profile and instance to the current schema and
    /// writes back the ones a step rewrote.
    ///
    /// A failing step aborts the walk for its object kind; the caller must
    /// not proceed to serve traffic in that case.
    pub async fn ensure(&self) -> LxdletResult<()> {
        let mut migrated = 0usize;
        for mut profile in self.store.list_profiles().await? {
            if !is_owned(&profile.config) {
                continue;
            }
            if walk_steps(ObjectKind::Profile, PROFILE_STEPS, &mut profile.config)? {
                self.store.update_profile(profile).await?;
                migrated += 1;
            }
        }
        if migrated > 0 {
            tracing::info!(migrated, "migrated profiles to schema {}", PROFILE_SCHEMA_VERSION);
        }

        let mut migrated = 0usize;
        for mut instance in self.store.list_instances().await? {
            if !is_owned(&instance.config) {
                continue;
            }
            if walk_steps(ObjectKind::Instance, INSTANCE_STEPS, &mut instance.config)? {
                self.store.update_instance(instance).await?;
                migrated += 1;
            }
        }
        if migrated > 0 {
            tracing::info!(migrated, "migrated instances to schema {}", INSTANCE_SCHEMA_VERSION);
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns true if the object belongs to this layer, under either the current
/// or the pre-versioning marker.
fn is_owned(config: &ConfigMap) -> bool {
    config.get(KEY_CRI).map(String::as_str) == Some(VAL_TRUE)
        || config.get(KEY_LEGACY_CRI).map(String::as_str) == Some(VAL_TRUE)
}

/// Applies every step whose `from` matches the object's tag, in order, and
/// returns whether any fired.
fn walk_steps(
    kind: ObjectKind,
    steps: &[MigrationStep],
    config: &mut ConfigMap,
) -> LxdletResult<bool> {
    let mut fired = false;
    for step in steps {
        let tag = config.get(KEY_SCHEMA).cloned().unwrap_or_default();
        if tag != step.from {
            continue;
        }

        (step.apply)(config).map_err(|err| LxdletError::MigrationStep {
            kind,
            from: step.from.to_string(),
            to: step.to.to_string(),
            reason: err.to_string(),
        })?;
        config.insert(KEY_SCHEMA.to_string(), step.to.to_string());
        tracing::debug!(%kind, from = step.from, to = step.to, "applied schema step");
        fired = true;
    }
    Ok(fired)
}

/// `""` to `"1"`: the pre-versioning ownership marker moves to its current
/// key.
fn rename_legacy_marker(config: &mut ConfigMap) -> LxdletResult<()> {
    if let Some(value) = config.remove(KEY_LEGACY_CRI) {
        config.insert(KEY_CRI.to_string(), value);
    }
    Ok(())
}

/// `"1"` to `"2"`: flat metadata keys move under the metadata prefix.
fn nest_metadata(config: &mut ConfigMap) -> LxdletResult<()> {
    for (old, new) in LEGACY_METADATA_KEYS {
        if let Some(value) = config.remove(old) {
            config.insert(new.to_string(), value);
        }
    }
    Ok(())
}

/// `"2"` to `"3"`: inert environment entries move to the hypervisor-native
/// prefix so they reach the workload.
fn move_environment(config: &mut ConfigMap) -> LxdletResult<()> {
    let moved: Vec<(String, String)> = config
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(LEGACY_ENVIRONMENT_PREFIX)
                .map(|rest| (rest.to_string(), value.clone()))
        })
        .collect();

    for (key, value) in moved {
        config.remove(&format!("{}{}", LEGACY_ENVIRONMENT_PREFIX, key));
        config.insert(format!("{}.{}", PREFIX_ENVIRONMENT, key), value);
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
