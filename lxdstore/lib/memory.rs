use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    EventStream, LifecycleAction, LifecycleEvent, LxdStore, ObjectKind, RawInstance, RawNetwork,
    RawProfile, StatusCode, StoreError, StoreResult, VersionToken,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const EVENT_CHANNEL_CAPACITY: usize = 256;

const FIRST_SYNTHETIC_PID: u32 = 10_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory [`LxdStore`] used by tests and local development.
///
/// The store enforces the same contracts a live hypervisor would: version
/// tokens are compared on update, `used_by` is derived from instance profile
/// lists, network leases are derived from attached nic devices, and starting
/// or stopping an instance publishes a lifecycle event.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    /// The profiles by name.
    profiles: Arc<RwLock<HashMap<String, RawProfile>>>,

    /// The instances by name.
    instances: Arc<RwLock<HashMap<String, RawInstance>>>,

    /// The managed networks by name.
    networks: Arc<RwLock<HashMap<String, RawNetwork>>>,

    /// The lifecycle event channel.
    events: broadcast::Sender<LifecycleEvent>,

    /// Monotonic source of version tokens.
    etag_counter: Arc<AtomicU64>,

    /// Synthetic pids handed to started instances.
    next_pid: Arc<AtomicU32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            profiles: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            networks: Arc::new(RwLock::new(HashMap::new())),
            events,
            etag_counter: Arc::new(AtomicU64::new(1)),
            next_pid: Arc::new(AtomicU32::new(FIRST_SYNTHETIC_PID)),
        }
    }

    /// Mints the next version token.
    fn next_etag(&self) -> VersionToken {
        let n = self.etag_counter.fetch_add(1, Ordering::Relaxed);
        VersionToken::new(format!("{:x}", n))
    }

    /// Publishes a lifecycle event, ignoring the absence of subscribers.
    fn publish(&self, action: LifecycleAction, instance: &str) {
        tracing::trace!("publishing lifecycle event: {:?} {}", action, instance);
        let _ = self.events.send(LifecycleEvent::now(action, instance));
    }

    /// Returns the names of instances whose profile list references `profile`.
    async fn referencing_instances(&self, profile: &str) -> Vec<String> {
        let instances = self.instances.read().await;
        let mut names: Vec<String> = instances
            .values()
            .filter(|instance| instance.profiles.iter().any(|p| p == profile))
            .map(|instance| instance.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Collects the nic addresses assigned on `network` from a device map.
    fn collect_leases(
        devices: &HashMap<String, HashMap<String, String>>,
        network: &str,
        leases: &mut Vec<Ipv4Addr>,
    ) {
        for options in devices.values() {
            if options.get("type").map(String::as_str) != Some("nic") {
                continue;
            }
            if options.get("parent").map(String::as_str) != Some(network) {
                continue;
            }
            if let Some(address) = options.get("ipv4.address") {
                if let Ok(address) = address.parse::<Ipv4Addr>() {
                    leases.push(address);
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LxdStore for MemoryStore {
    async fn get_profile(&self, name: &str) -> StoreResult<RawProfile> {
        let profiles = self.profiles.read().await;
        let mut profile = profiles
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Profile,
                name: name.to_string(),
            })?;
        drop(profiles);

        profile.used_by = self.referencing_instances(name).await;
        Ok(profile)
    }

    async fn list_profiles(&self) -> StoreResult<Vec<RawProfile>> {
        let snapshot: Vec<RawProfile> = {
            let profiles = self.profiles.read().await;
            profiles.values().cloned().collect()
        };

        let mut listed = Vec::with_capacity(snapshot.len());
        for mut profile in snapshot {
            profile.used_by = self.referencing_instances(&profile.name).await;
            listed.push(profile);
        }
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn create_profile(&self, mut profile: RawProfile) -> StoreResult<VersionToken> {
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&profile.name) {
            return Err(StoreError::AlreadyExists {
                kind: ObjectKind::Profile,
                name: profile.name,
            });
        }

        let etag = self.next_etag();
        profile.etag = etag.clone();
        profile.used_by = Vec::new();
        profiles.insert(profile.name.clone(), profile);
        Ok(etag)
    }

    async fn update_profile(&self, mut profile: RawProfile) -> StoreResult<VersionToken> {
        let mut profiles = self.profiles.write().await;
        let stored = profiles
            .get_mut(&profile.name)
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Profile,
                name: profile.name.clone(),
            })?;

        if profile.etag.is_empty() {
            return Err(StoreError::EmptyVersionToken {
                kind: ObjectKind::Profile,
                name: profile.name,
            });
        }
        if profile.etag != stored.etag {
            return Err(StoreError::Conflict {
                kind: ObjectKind::Profile,
                name: profile.name,
            });
        }

        let etag = self.next_etag();
        profile.etag = etag.clone();
        profile.used_by = Vec::new();
        *stored = profile;
        Ok(etag)
    }

    async fn delete_profile(&self, name: &str) -> StoreResult<()> {
        let used_by = self.referencing_instances(name).await;

        let mut profiles = self.profiles.write().await;
        if !profiles.contains_key(name) {
            return Err(StoreError::NotFound {
                kind: ObjectKind::Profile,
                name: name.to_string(),
            });
        }
        if !used_by.is_empty() {
            return Err(StoreError::InUse {
                kind: ObjectKind::Profile,
                name: name.to_string(),
            });
        }

        profiles.remove(name);
        Ok(())
    }

    async fn get_instance(&self, name: &str) -> StoreResult<RawInstance> {
        let instances = self.instances.read().await;
        instances
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Instance,
                name: name.to_string(),
            })
    }

    async fn list_instances(&self) -> StoreResult<Vec<RawInstance>> {
        let instances = self.instances.read().await;
        let mut listed: Vec<RawInstance> = instances.values().cloned().collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn create_instance(&self, mut instance: RawInstance) -> StoreResult<VersionToken> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.name) {
            return Err(StoreError::AlreadyExists {
                kind: ObjectKind::Instance,
                name: instance.name,
            });
        }

        let etag = self.next_etag();
        instance.etag = etag.clone();
        // Freshly created instances are always stopped.
        instance.status_code = StatusCode::Stopped;
        instance.pid = None;
        instances.insert(instance.name.clone(), instance);
        Ok(etag)
    }

    async fn update_instance(&self, mut instance: RawInstance) -> StoreResult<VersionToken> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(&instance.name)
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Instance,
                name: instance.name.clone(),
            })?;

        if instance.etag.is_empty() {
            return Err(StoreError::EmptyVersionToken {
                kind: ObjectKind::Instance,
                name: instance.name,
            });
        }
        if instance.etag != stored.etag {
            return Err(StoreError::Conflict {
                kind: ObjectKind::Instance,
                name: instance.name,
            });
        }

        let etag = self.next_etag();
        instance.etag = etag.clone();
        // The run state is owned by the hypervisor, not by the update payload.
        instance.status_code = stored.status_code;
        instance.pid = stored.pid;
        *stored = instance;
        Ok(etag)
    }

    async fn delete_instance(&self, name: &str) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        let stored = instances.get(name).ok_or_else(|| StoreError::NotFound {
            kind: ObjectKind::Instance,
            name: name.to_string(),
        })?;

        if stored.status_code == StatusCode::Running {
            return Err(StoreError::InstanceRunning(name.to_string()));
        }

        instances.remove(name);
        Ok(())
    }

    async fn start_instance(&self, name: &str) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Instance,
                name: name.to_string(),
            })?;

        if stored.status_code == StatusCode::Running {
            return Ok(());
        }

        stored.status_code = StatusCode::Running;
        stored.pid = Some(self.next_pid.fetch_add(1, Ordering::Relaxed));
        stored.etag = self.next_etag();
        drop(instances);

        self.publish(LifecycleAction::Started, name);
        Ok(())
    }

    async fn stop_instance(&self, name: &str, _timeout: Duration) -> StoreResult<()> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Instance,
                name: name.to_string(),
            })?;

        if stored.status_code == StatusCode::Stopped {
            return Ok(());
        }

        stored.status_code = StatusCode::Stopped;
        stored.pid = None;
        stored.etag = self.next_etag();
        drop(instances);

        self.publish(LifecycleAction::Stopped, name);
        Ok(())
    }

    async fn get_network(&self, name: &str) -> StoreResult<RawNetwork> {
        let networks = self.networks.read().await;
        networks
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Network,
                name: name.to_string(),
            })
    }

    async fn create_network(&self, mut network: RawNetwork) -> StoreResult<VersionToken> {
        let mut networks = self.networks.write().await;
        if networks.contains_key(&network.name) {
            return Err(StoreError::AlreadyExists {
                kind: ObjectKind::Network,
                name: network.name,
            });
        }

        let etag = self.next_etag();
        network.etag = etag.clone();
        network.managed = true;
        networks.insert(network.name.clone(), network);
        Ok(etag)
    }

    async fn network_leases(&self, name: &str) -> StoreResult<Vec<Ipv4Addr>> {
        {
            let networks = self.networks.read().await;
            if !networks.contains_key(name) {
                return Err(StoreError::NotFound {
                    kind: ObjectKind::Network,
                    name: name.to_string(),
                });
            }
        }

        let mut leases = Vec::new();
        {
            let profiles = self.profiles.read().await;
            for profile in profiles.values() {
                Self::collect_leases(&profile.devices, name, &mut leases);
            }
        }
        {
            let instances = self.instances.read().await;
            for instance in instances.values() {
                Self::collect_leases(&instance.devices, name, &mut leases);
            }
        }
        leases.sort();
        leases.dedup();
        Ok(leases)
    }

    async fn subscribe(&self) -> StoreResult<EventStream> {
        let receiver = self.events.subscribe();
        let stream = BroadcastStream::new(receiver)
            .filter_map(|item| futures::future::ready(item.ok()))
            .boxed();
        Ok(stream)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
