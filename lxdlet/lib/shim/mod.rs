//! The driver tying entities, network backends, and the store together.
//!
//! A [`Shim`] owns nothing but references: the hypervisor store and the
//! network backend are injected at construction, so the same driver runs
//! against a live hypervisor or the in-memory store in tests. There is no
//! ambient global state; spawning the event listener is an explicit call by
//! whoever owns the connection.

use std::{future::Future, sync::Arc, time::Duration};

use getset::Getters;
use lxdstore::LxdStore;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{network::NetworkPlugin, LxdletError, LxdletResult, NetworkMode};

mod container;
mod events;
mod sandbox;

pub use events::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a single network backend hook may run before it is abandoned.
pub const DEFAULT_NETWORK_HOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// The grace period granted to a running workload when its container is
/// deleted.
pub const DEFAULT_DELETE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Length of the random hex suffix appended to generated object names.
const ID_SUFFIX_LEN: usize = 8;

/// Longest slice of the metadata name kept in a generated object name.
const ID_NAME_LEN: usize = 24;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Tunables of the shim driver.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ShimOptions {
    /// Deadline for one network backend hook invocation.
    #[builder(default = DEFAULT_NETWORK_HOOK_TIMEOUT)]
    network_hook_timeout: Duration,

    /// Grace period when a delete has to stop a running workload first.
    #[builder(default = DEFAULT_DELETE_STOP_TIMEOUT)]
    delete_stop_timeout: Duration,
}

/// The pod-to-hypervisor driver.
///
/// One value per hypervisor connection, shared behind an [`Arc`]. The value
/// objects it hands out ([`Sandbox`](crate::Sandbox),
/// [`Container`](crate::Container)) are not thread-safe; callers keep at most
/// one mutation sequence in flight per entity.
pub struct Shim {
    /// The hypervisor object store.
    store: Arc<dyn LxdStore>,

    /// The pod network backend.
    network: Arc<dyn NetworkPlugin>,

    /// The driver tunables.
    options: ShimOptions,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Shim {
    /// Creates a shim with default options.
    pub fn new(store: Arc<dyn LxdStore>, network: Arc<dyn NetworkPlugin>) -> Self {
        Self::with_options(store, network, ShimOptions::default())
    }

    /// Creates a shim with explicit options.
    pub fn with_options(
        store: Arc<dyn LxdStore>,
        network: Arc<dyn NetworkPlugin>,
        options: ShimOptions,
    ) -> Self {
        Self {
            store,
            network,
            options,
        }
    }

    /// Runs a network hook under the configured deadline.
    ///
    /// A hook that overruns is abandoned with
    /// [`LxdletError::NetworkHookTimedOut`] so a wedged backend can never
    /// stall the lifecycle path indefinitely.
    pub(crate) async fn network_hook<T, F>(&self, hook: F) -> LxdletResult<T>
    where
        F: Future<Output = LxdletResult<T>> + Send,
    {
        let deadline = self.options.network_hook_timeout;
        match tokio::time::timeout(deadline, hook).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LxdletError::NetworkHookTimedOut(deadline)),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns true if network hooks apply to the given mode.
///
/// Host-sharing pods have nothing to plumb and `none` pods asked for nothing,
/// so backends are never consulted for either.
pub(crate) fn wants_network_hooks(mode: NetworkMode) -> bool {
    !matches!(mode, NetworkMode::Host | NetworkMode::None)
}

/// Derives a fresh object name from a metadata name.
///
/// The name is lowercased with anything outside `[a-z0-9]` flattened to `-`,
/// truncated, and given a random hex suffix so repeated creation attempts of
/// the same pod never collide in the store.
pub(crate) fn object_id(metadata_name: &str) -> String {
    let mut sanitized: String = metadata_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(ID_NAME_LEN);
    let sanitized = sanitized.trim_matches('-');

    let uuid = Uuid::new_v4().simple().to_string();
    let suffix = &uuid[..ID_SUFFIX_LEN];
    if sanitized.is_empty() {
        format!("lxdlet-{}", suffix)
    } else {
        format!("{}-{}", sanitized, suffix)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ShimOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
