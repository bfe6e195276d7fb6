use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{LifecycleEvent, RawInstance, RawNetwork, RawProfile, StoreResult, VersionToken};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A stream of lifecycle events from the hypervisor.
pub type EventStream = BoxStream<'static, LifecycleEvent>;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// `LxdStore` is the object surface of an LXD-compatible hypervisor: two
/// object kinds (profiles and instances) carrying flat config maps and named
/// devices, plus the managed networks the bridge backend relies on and a
/// stream of lifecycle notifications.
///
/// Updates are guarded by optimistic concurrency: every update must present
/// the [`VersionToken`] obtained from the most recent read, and a stale token
/// is rejected with [`StoreError::Conflict`](crate::StoreError::Conflict).
/// This trait does not retry on conflict; that decision belongs to callers.
///
/// ## Implementation note
///
/// Implementations are expected to be cheap to clone (e.g. an `Arc`-wrapped
/// connection) since consumers hold them behind `Arc<dyn LxdStore>` and share
/// them across tasks.
#[async_trait]
pub trait LxdStore: Send + Sync {
    /// Fetches a profile by name.
    ///
    /// ## Errors
    ///
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) if no
    /// profile with that name exists.
    async fn get_profile(&self, name: &str) -> StoreResult<RawProfile>;

    /// Lists all profiles.
    async fn list_profiles(&self) -> StoreResult<Vec<RawProfile>>;

    /// Creates a profile and returns its initial version token.
    ///
    /// ## Errors
    ///
    /// Returns [`StoreError::AlreadyExists`](crate::StoreError::AlreadyExists)
    /// if a profile with that name exists.
    async fn create_profile(&self, profile: RawProfile) -> StoreResult<VersionToken>;

    /// Updates a profile, presenting the version token from the last read,
    /// and returns the new token.
    ///
    /// ## Errors
    ///
    /// Returns [`StoreError::Conflict`](crate::StoreError::Conflict) when the
    /// presented token is stale and
    /// [`StoreError::EmptyVersionToken`](crate::StoreError::EmptyVersionToken)
    /// when it is empty.
    async fn update_profile(&self, profile: RawProfile) -> StoreResult<VersionToken>;

    /// Deletes a profile.
    ///
    /// ## Errors
    ///
    /// Returns [`StoreError::InUse`](crate::StoreError::InUse) while instances
    /// still reference the profile.
    async fn delete_profile(&self, name: &str) -> StoreResult<()>;

    /// Fetches an instance by name.
    async fn get_instance(&self, name: &str) -> StoreResult<RawInstance>;

    /// Lists all instances.
    async fn list_instances(&self) -> StoreResult<Vec<RawInstance>>;

    /// Creates an instance and returns its initial version token.
    async fn create_instance(&self, instance: RawInstance) -> StoreResult<VersionToken>;

    /// Updates an instance, presenting the version token from the last read,
    /// and returns the new token.
    async fn update_instance(&self, instance: RawInstance) -> StoreResult<VersionToken>;

    /// Deletes an instance.
    ///
    /// ## Errors
    ///
    /// Returns
    /// [`StoreError::InstanceRunning`](crate::StoreError::InstanceRunning)
    /// while the instance is running.
    async fn delete_instance(&self, name: &str) -> StoreResult<()>;

    /// Starts an instance and emits an `instance-started` lifecycle event.
    async fn start_instance(&self, name: &str) -> StoreResult<()>;

    /// Stops an instance within the given grace period and emits an
    /// `instance-shutdown` lifecycle event.
    async fn stop_instance(&self, name: &str, timeout: Duration) -> StoreResult<()>;

    /// Fetches a managed network by name.
    async fn get_network(&self, name: &str) -> StoreResult<RawNetwork>;

    /// Creates a managed network.
    async fn create_network(&self, network: RawNetwork) -> StoreResult<VersionToken>;

    /// Returns the addresses currently assigned on the given network.
    async fn network_leases(&self, name: &str) -> StoreResult<Vec<std::net::Ipv4Addr>>;

    /// Subscribes to the hypervisor's lifecycle event stream.
    ///
    /// Each call returns an independent stream; events published after the
    /// subscription are delivered in order.
    async fn subscribe(&self) -> StoreResult<EventStream>;
}
