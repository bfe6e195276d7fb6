//! Pod network backends.
//!
//! A network backend is driven through lifecycle hooks and communicates back
//! exclusively through a [`NetworkResult`]: free-form `data` persisted into
//! the sandbox's mode data, nic devices to attach, and cloud-init fragments
//! to merge. Backends keep no state of their own; whatever they need at stop
//! time must have been placed in `data` at start time.

use std::{collections::HashMap, net::IpAddr};

use async_trait::async_trait;

use crate::{device::Nic, sandbox::Sandbox, LxdletResult};

mod bridge;
mod cni;

pub use bridge::*;
pub use cni::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a backend gets to know about a pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// The sandbox id.
    pub pod: String,

    /// The backend-owned state persisted with the sandbox.
    pub data: HashMap<String, String>,
}

/// [`Properties`] plus the init pid of a running workload.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertiesRunning {
    /// The pod properties.
    pub properties: Properties,

    /// The init pid of the started workload.
    pub pid: u32,
}

/// What a backend hands back from a setup hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkResult {
    /// Entries to merge into the backend-owned state.
    pub data: HashMap<String, String>,

    /// Nic devices to attach to the sandbox.
    pub nics: Vec<Nic>,

    /// Cloud-init network fragments to merge into the sandbox.
    pub network_config_entries: Vec<serde_yaml::Value>,
}

/// The addresses a pod is reachable under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStatus {
    /// The pod addresses, primary first.
    pub ips: Vec<IpAddr>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The lifecycle hooks a pod network backend implements.
///
/// Hooks are invoked by the sandbox lifecycle, never directly by callers.
/// Setup hooks (`when_created`, `when_started`) may fail the operation that
/// triggered them; teardown hooks are best-effort from the caller's point of
/// view.
#[async_trait]
pub trait NetworkPlugin: Send + Sync {
    /// Invoked when a sandbox is first written, before instances exist.
    async fn when_created(&self, properties: &Properties) -> LxdletResult<NetworkResult>;

    /// Invoked when a workload in the sandbox started and its init pid is
    /// known.
    async fn when_started(&self, properties: &PropertiesRunning) -> LxdletResult<NetworkResult>;

    /// Invoked when the sandbox's workloads stopped.
    async fn when_stopped(&self, properties: &Properties) -> LxdletResult<()>;

    /// Invoked after a sandbox was deleted.
    async fn when_deleted(&self, properties: &Properties) -> LxdletResult<()>;

    /// Reports the addresses the pod is currently reachable under.
    async fn status(&self, properties: &Properties) -> LxdletResult<NetworkStatus>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Properties {
    /// Creates properties for a pod with its persisted backend state.
    pub fn new(pod: impl Into<String>, data: HashMap<String, String>) -> Self {
        Self {
            pod: pod.into(),
            data,
        }
    }

    /// Creates properties for a sandbox, taking the id and backend state from
    /// it.
    pub fn from_sandbox(sandbox: &Sandbox) -> Self {
        Self::new(
            sandbox.get_id().clone(),
            sandbox.network_config.mode_data.clone(),
        )
    }
}

impl PropertiesRunning {
    /// Creates running properties from pod properties and a pid.
    pub fn new(properties: Properties, pid: u32) -> Self {
        Self { properties, pid }
    }
}

impl NetworkResult {
    /// Merges the result into a sandbox: data entries are merged into the
    /// mode data, nics are upserted, and unseen cloud-init fragments are
    /// appended. Nothing already on the sandbox is thrown away.
    pub fn apply_to(&self, sandbox: &mut Sandbox) {
        for (key, value) in &self.data {
            sandbox
                .network_config
                .mode_data
                .insert(key.clone(), value.clone());
        }
        for nic in &self.nics {
            sandbox.devices.upsert(nic.clone());
        }
        for entry in &self.network_config_entries {
            if !sandbox.cloud_init_network_config_entries.contains(entry) {
                sandbox.cloud_init_network_config_entries.push(entry.clone());
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
