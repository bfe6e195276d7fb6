//! Sandbox operations of the shim driver.

use chrono::Utc;

use crate::{
    network::Properties, LxdletError, LxdletResult, Sandbox, SandboxState,
};

use super::{object_id, wants_network_hooks, Shim};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Shim {
    /// Creates or updates a sandbox.
    ///
    /// An empty version token marks the first write: the sandbox gets a fresh
    /// id, a creation timestamp, and the ready state, and the network
    /// backend's create hook runs so its profile carries the backend state
    /// before the first workload arrives. Later calls re-encode and update
    /// under the held token; a stale token surfaces as a conflict and the
    /// caller re-fetches.
    ///
    /// On failure the value keeps its pre-call identity, so a retried create
    /// starts clean instead of pointing at an object that was never written.
    pub async fn apply_sandbox(&self, sandbox: &mut Sandbox) -> LxdletResult<()> {
        if sandbox.get_version_token().is_empty() {
            return self.create_sandbox(sandbox).await;
        }

        let token = self.store.update_profile(sandbox.to_profile()?).await?;
        sandbox.set_version_token(token);
        tracing::debug!(sandbox = %sandbox.get_id(), "updated sandbox");
        Ok(())
    }

    async fn create_sandbox(&self, sandbox: &mut Sandbox) -> LxdletResult<()> {
        // Work on a scratch copy; the caller's value is only replaced once
        // the store accepted the write.
        let mut scratch = sandbox.clone();
        scratch.set_id(object_id(&scratch.metadata.name));
        scratch.set_created_at(Utc::now());
        scratch.set_state(SandboxState::Ready);

        if wants_network_hooks(scratch.network_config.mode) {
            let properties = Properties::from_sandbox(&scratch);
            let result = self
                .network_hook(self.network.when_created(&properties))
                .await?;
            result.apply_to(&mut scratch);
        }

        let token = self.store.create_profile(scratch.to_profile()?).await?;
        scratch.set_version_token(token);

        tracing::info!(
            sandbox = %scratch.get_id(),
            name = %scratch.metadata.name,
            namespace = %scratch.metadata.namespace,
            "created sandbox"
        );
        *sandbox = scratch;
        Ok(())
    }

    /// Fetches a sandbox by id.
    ///
    /// Profiles this shim does not own report
    /// [`LxdletError::SandboxNotFound`], the same as truly absent ones.
    pub async fn get_sandbox(&self, id: &str) -> LxdletResult<Sandbox> {
        let profile = self.store.get_profile(id).await.map_err(|err| {
            if err.is_not_found() {
                LxdletError::SandboxNotFound(id.to_string())
            } else {
                err.into()
            }
        })?;
        Sandbox::from_profile(&profile)
    }

    /// Lists the sandboxes this shim owns.
    ///
    /// Foreign profiles on the same hypervisor are skipped; decode failures
    /// of owned profiles surface, since hiding them would make a broken pod
    /// unfindable.
    pub async fn list_sandboxes(&self) -> LxdletResult<Vec<Sandbox>> {
        let mut sandboxes = Vec::new();
        for profile in self.store.list_profiles().await? {
            match Sandbox::from_profile(&profile) {
                Ok(sandbox) => sandboxes.push(sandbox),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(sandboxes)
    }

    /// Marks a sandbox as no longer accepting workloads.
    ///
    /// Member containers are stopped by the orchestration layer through
    /// [`stop_container`](Shim::stop_container); the sandbox object only
    /// records the transition. Stopping a not-ready sandbox is a no-op.
    pub async fn stop_sandbox(&self, id: &str) -> LxdletResult<()> {
        let mut sandbox = self.get_sandbox(id).await?;
        if sandbox.get_state() == &SandboxState::NotReady {
            return Ok(());
        }

        sandbox.set_state(SandboxState::NotReady);
        self.store.update_profile(sandbox.to_profile()?).await?;
        tracing::info!(sandbox = %id, "stopped sandbox");
        Ok(())
    }

    /// Deletes a sandbox.
    ///
    /// An absent or foreign id is success; the desired state is already
    /// there. A sandbox that still anchors instances is refused by the store
    /// and the conflict surfaces. Network cleanup runs after the object is
    /// gone and is best-effort: a failing backend leaves host-side leftovers
    /// behind but never resurrects the sandbox.
    pub async fn delete_sandbox(&self, id: &str) -> LxdletResult<()> {
        let sandbox = match self.get_sandbox(id).await {
            Ok(sandbox) => sandbox,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        match self.store.delete_profile(id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        tracing::info!(sandbox = %id, "deleted sandbox");

        if wants_network_hooks(sandbox.network_config.mode) {
            let properties = Properties::from_sandbox(&sandbox);
            if let Err(err) = self
                .network_hook(self.network.when_deleted(&properties))
                .await
            {
                tracing::warn!(
                    sandbox = %id,
                    error = %err,
                    "network cleanup after delete failed"
                );
            }
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use lxdstore::{LxdStore, MemoryStore, RawInstance, RawProfile};

    use crate::{
        device::Device,
        network::{
            BridgeConfig, BridgeNetwork, NetworkPlugin, NetworkResult, NetworkStatus,
            PropertiesRunning, DATA_KEY_BRIDGE,
        },
        SandboxMetadata,
    };

    use super::*;

    struct FailingPlugin;

    #[async_trait]
    impl NetworkPlugin for FailingPlugin {
        async fn when_created(&self, _properties: &Properties) -> LxdletResult<NetworkResult> {
            Err(LxdletError::NetworkSetup("no carrier".into()))
        }

        async fn when_started(
            &self,
            _properties: &PropertiesRunning,
        ) -> LxdletResult<NetworkResult> {
            Err(LxdletError::NetworkSetup("no carrier".into()))
        }

        async fn when_stopped(&self, _properties: &Properties) -> LxdletResult<()> {
            Ok(())
        }

        async fn when_deleted(&self, _properties: &Properties) -> LxdletResult<()> {
            Err(LxdletError::NetworkSetup("no carrier".into()))
        }

        async fn status(&self, _properties: &Properties) -> LxdletResult<NetworkStatus> {
            Ok(NetworkStatus::default())
        }
    }

    fn bridged_shim() -> (Arc<MemoryStore>, Shim) {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(BridgeNetwork::new(store.clone(), BridgeConfig::default()));
        let shim = Shim::new(store.clone(), network);
        (store, shim)
    }

    fn sample_sandbox(name: &str) -> Sandbox {
        Sandbox::with_metadata(SandboxMetadata {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: "c2a2".to_string(),
            attempt: 0,
        })
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_assigns_identity_and_runs_the_create_hook() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();

        let mut sandbox = sample_sandbox("web");
        shim.apply_sandbox(&mut sandbox).await?;

        assert!(sandbox.get_id().starts_with("web-"));
        assert!(!sandbox.get_version_token().is_empty());
        assert_eq!(sandbox.get_state(), &SandboxState::Ready);
        assert!(sandbox.network_config.mode_data.contains_key(DATA_KEY_BRIDGE));
        assert!(sandbox
            .devices
            .iter()
            .any(|device| matches!(device, Device::Nic(_))));

        let profile = store.get_profile(sandbox.get_id()).await?;
        assert_eq!(&profile.etag, sandbox.get_version_token());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_create_leaves_the_value_untouched() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let shim = Shim::new(store.clone(), Arc::new(FailingPlugin));

        let mut sandbox = sample_sandbox("web");
        let err = shim.apply_sandbox(&mut sandbox).await.unwrap_err();
        assert!(matches!(err, LxdletError::NetworkSetup(_)));

        assert!(sandbox.get_id().is_empty());
        assert!(sandbox.get_version_token().is_empty());
        assert!(store.list_profiles().await?.is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_update_goes_through_the_held_token() -> anyhow::Result<()> {
        let (_, shim) = bridged_shim();

        let mut sandbox = sample_sandbox("web");
        shim.apply_sandbox(&mut sandbox).await?;
        let first_token = sandbox.get_version_token().clone();

        sandbox
            .labels
            .insert("tier".to_string(), "frontend".to_string());
        shim.apply_sandbox(&mut sandbox).await?;
        assert_ne!(sandbox.get_version_token(), &first_token);

        let reread = shim.get_sandbox(sandbox.get_id()).await?;
        assert_eq!(reread.labels.get("tier").map(String::as_str), Some("frontend"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_token_surfaces_as_conflict() -> anyhow::Result<()> {
        let (_, shim) = bridged_shim();

        let mut sandbox = sample_sandbox("web");
        shim.apply_sandbox(&mut sandbox).await?;

        let mut stale = shim.get_sandbox(sandbox.get_id()).await?;
        sandbox.hostname = "first".to_string();
        shim.apply_sandbox(&mut sandbox).await?;

        stale.hostname = "second".to_string();
        let err = shim.apply_sandbox(&mut stale).await.unwrap_err();
        assert!(matches!(err, LxdletError::Store(ref inner) if inner.is_conflict()));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_get_and_list_imitate_absence_for_foreign_profiles() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();

        store
            .create_profile(RawProfile {
                name: "default".to_string(),
                ..Default::default()
            })
            .await?;
        let mut sandbox = sample_sandbox("web");
        shim.apply_sandbox(&mut sandbox).await?;

        let err = shim.get_sandbox("default").await.unwrap_err();
        assert!(err.is_not_found());

        let listed = shim.list_sandboxes().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].get_id(), sandbox.get_id());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_stop_flips_to_notready_once() -> anyhow::Result<()> {
        let (_, shim) = bridged_shim();

        let mut sandbox = sample_sandbox("web");
        shim.apply_sandbox(&mut sandbox).await?;

        shim.stop_sandbox(sandbox.get_id()).await?;
        let stopped = shim.get_sandbox(sandbox.get_id()).await?;
        assert_eq!(stopped.get_state(), &SandboxState::NotReady);
        let token = stopped.get_version_token().clone();

        // Second stop changes nothing, not even the token.
        shim.stop_sandbox(sandbox.get_id()).await?;
        let again = shim.get_sandbox(sandbox.get_id()).await?;
        assert_eq!(again.get_version_token(), &token);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_is_idempotent_and_survives_cleanup_failure() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let bridged = Arc::new(BridgeNetwork::new(store.clone(), BridgeConfig::default()));
        let mut sandbox = sample_sandbox("web");
        Shim::new(store.clone(), bridged)
            .apply_sandbox(&mut sandbox)
            .await?;

        // Delete through a shim whose backend refuses cleanup; the object
        // still goes away.
        let shim = Shim::new(store.clone(), Arc::new(FailingPlugin));
        shim.delete_sandbox(sandbox.get_id()).await?;
        assert!(shim.get_sandbox(sandbox.get_id()).await.unwrap_err().is_not_found());

        shim.delete_sandbox(sandbox.get_id()).await?;
        shim.delete_sandbox("never-existed").await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_refuses_a_sandbox_still_in_use() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();

        let mut sandbox = sample_sandbox("web");
        shim.apply_sandbox(&mut sandbox).await?;

        let mut instance = RawInstance::with_name("app-1");
        instance.profiles = vec![sandbox.get_id().clone()];
        store.create_instance(instance).await?;

        let err = shim.delete_sandbox(sandbox.get_id()).await.unwrap_err();
        assert!(matches!(err, LxdletError::Store(_)));
        assert!(shim.get_sandbox(sandbox.get_id()).await.is_ok());
        Ok(())
    }
}
