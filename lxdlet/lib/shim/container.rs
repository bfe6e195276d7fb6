//! Container operations of the shim driver.

use std::time::Duration;

use chrono::Utc;
use lxdstore::StatusCode;

use crate::{
    keyspace::{KEY_CREATED_MARKER, KEY_FINISHED_AT, KEY_STARTED_AT},
    utils::nanos_string,
    Container, ContainerState, LxdletError, LxdletResult, NetworkMode,
};

use super::{object_id, Shim};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Shim {
    /// Creates or updates a container.
    ///
    /// The last profile entry must name an existing sandbox; a container on a
    /// host-network sandbox must be privileged, since it can reconfigure
    /// interfaces every other workload on the machine shares. The first write
    /// assigns an id and a creation timestamp; later calls update under the
    /// held version token. As with sandboxes, a failed call leaves the
    /// value's identity untouched.
    pub async fn apply_container(&self, container: &mut Container) -> LxdletResult<()> {
        let sandbox_id = container.sandbox_id()?.to_string();
        let sandbox = self.get_sandbox(&sandbox_id).await?;

        if sandbox.network_config.mode == NetworkMode::Host && !container.privileged {
            let who = if container.get_id().is_empty() {
                container.metadata.name.clone()
            } else {
                container.get_id().clone()
            };
            return Err(LxdletError::HostNetworkRequiresPrivileged(who));
        }

        if container.get_version_token().is_empty() {
            let mut scratch = container.clone();
            scratch.set_id(object_id(&scratch.metadata.name));
            scratch.set_created_at(Utc::now());

            let token = self.store.create_instance(scratch.to_instance()?).await?;
            scratch.set_version_token(token);

            tracing::info!(
                container = %scratch.get_id(),
                sandbox = %sandbox_id,
                image = %scratch.image,
                "created container"
            );
            *container = scratch;
        } else {
            let token = self.store.update_instance(container.to_instance()?).await?;
            container.set_version_token(token);
            tracing::debug!(container = %container.get_id(), "updated container");
        }
        Ok(())
    }

    /// Fetches a container by id.
    ///
    /// Instances this shim does not own report
    /// [`LxdletError::ContainerNotFound`], the same as truly absent ones.
    pub async fn get_container(&self, id: &str) -> LxdletResult<Container> {
        let instance = self.store.get_instance(id).await.map_err(|err| {
            if err.is_not_found() {
                LxdletError::ContainerNotFound(id.to_string())
            } else {
                err.into()
            }
        })?;
        Container::from_instance(&instance)
    }

    /// Lists the containers this shim owns; foreign instances are skipped.
    pub async fn list_containers(&self) -> LxdletResult<Vec<Container>> {
        let mut containers = Vec::new();
        for instance in self.store.list_instances().await? {
            match Container::from_instance(&instance) {
                Ok(container) => containers.push(container),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(containers)
    }

    /// Starts a container.
    ///
    /// Once the instance is up, the created marker comes off and the start
    /// time is stamped, so a later crash reads back as exited rather than
    /// never-run. Starting a running container is a no-op.
    pub async fn start_container(&self, id: &str) -> LxdletResult<()> {
        let container = self.get_container(id).await?;
        if container.get_state() == &ContainerState::Running {
            return Ok(());
        }

        self.store.start_instance(id).await?;

        // The start minted a fresh version token; stamp the bookkeeping keys
        // on a fresh read rather than the one from before the boot.
        let mut instance = self.store.get_instance(id).await?;
        instance.config.remove(KEY_CREATED_MARKER);
        instance
            .config
            .insert(KEY_STARTED_AT.to_string(), nanos_string(&Utc::now()));
        self.store.update_instance(instance).await?;

        tracing::info!(container = %id, "started container");
        Ok(())
    }

    /// Stops a container, giving the workload `timeout` to shut down.
    ///
    /// The finish time is stamped after the instance reports stopped.
    /// Stopping a container that is not running is a no-op.
    pub async fn stop_container(&self, id: &str, timeout: Duration) -> LxdletResult<()> {
        let container = self.get_container(id).await?;
        if container.get_state() != &ContainerState::Running {
            return Ok(());
        }

        self.store.stop_instance(id, timeout).await?;

        let mut instance = self.store.get_instance(id).await?;
        instance
            .config
            .insert(KEY_FINISHED_AT.to_string(), nanos_string(&Utc::now()));
        self.store.update_instance(instance).await?;

        tracing::info!(container = %id, "stopped container");
        Ok(())
    }

    /// Deletes a container.
    ///
    /// An absent or foreign id is success. A running workload is stopped
    /// first with the configured grace period; if that fails the delete is
    /// attempted anyway, since removal must not wedge behind an unkillable
    /// process. An owned instance that no longer decodes is still deleted.
    pub async fn delete_container(&self, id: &str) -> LxdletResult<()> {
        let instance = match self.store.get_instance(id).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match Container::from_instance(&instance) {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(instance = %id, "skipping delete of an instance not owned here");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(
                    container = %id,
                    error = %err,
                    "deleting a container that no longer decodes"
                );
            }
        }

        if instance.status_code == StatusCode::Running {
            let timeout = *self.options.get_delete_stop_timeout();
            if let Err(err) = self.store.stop_instance(id, timeout).await {
                tracing::warn!(container = %id, error = %err, "stop before delete failed");
            }
        }

        match self.store.delete_instance(id).await {
            Ok(()) => {
                tracing::info!(container = %id, "deleted container");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use lxdstore::{LxdStore, MemoryStore, RawInstance};

    use crate::{
        keyspace::{KEY_CRI, VAL_TRUE},
        network::{BridgeConfig, BridgeNetwork},
        ContainerMetadata, Sandbox, SandboxMetadata,
    };

    use super::*;

    fn bridged_shim() -> (Arc<MemoryStore>, Shim) {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(BridgeNetwork::new(store.clone(), BridgeConfig::default()));
        let shim = Shim::new(store.clone(), network);
        (store, shim)
    }

    async fn ready_sandbox(shim: &Shim, mode: NetworkMode) -> anyhow::Result<Sandbox> {
        let mut sandbox = Sandbox::with_metadata(SandboxMetadata {
            name: "web".to_string(),
            namespace: "default".to_string(),
            uid: "51af".to_string(),
            attempt: 0,
        });
        sandbox.network_config.mode = mode;
        shim.apply_sandbox(&mut sandbox).await?;
        Ok(sandbox)
    }

    fn sample_container(sandbox: &Sandbox) -> Container {
        let mut container = Container::with_metadata(ContainerMetadata {
            name: "app".to_string(),
            attempt: 0,
        });
        container.image = "images:alpine/3.20".to_string();
        container.profiles = vec![sandbox.get_id().clone()];
        container
    }

    #[test_log::test(tokio::test)]
    async fn test_apply_requires_an_anchoring_sandbox() -> anyhow::Result<()> {
        let (_, shim) = bridged_shim();

        let mut orphan = Container::with_metadata(ContainerMetadata {
            name: "app".to_string(),
            attempt: 0,
        });
        let err = shim.apply_container(&mut orphan).await.unwrap_err();
        assert!(matches!(err, LxdletError::EmptyProfileList(_)));

        orphan.profiles = vec!["ghost".to_string()];
        let err = shim.apply_container(&mut orphan).await.unwrap_err();
        assert!(err.is_not_found());

        // A failed apply never leaks identity into the value.
        assert!(orphan.get_id().is_empty());
        assert!(orphan.get_version_token().is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_host_network_requires_privileged() -> anyhow::Result<()> {
        let (_, shim) = bridged_shim();
        let sandbox = ready_sandbox(&shim, NetworkMode::Host).await?;

        let mut container = sample_container(&sandbox);
        let err = shim.apply_container(&mut container).await.unwrap_err();
        assert!(matches!(err, LxdletError::HostNetworkRequiresPrivileged(_)));

        container.privileged = true;
        shim.apply_container(&mut container).await?;
        assert!(!container.get_id().is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_start_clears_the_marker_and_stamps_started_at() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();
        let sandbox = ready_sandbox(&shim, NetworkMode::Bridged).await?;

        let mut container = sample_container(&sandbox);
        shim.apply_container(&mut container).await?;
        assert_eq!(
            shim.get_container(container.get_id()).await?.get_state(),
            &ContainerState::Created
        );

        shim.start_container(container.get_id()).await?;

        let raw = store.get_instance(container.get_id()).await?;
        assert!(!raw.config.contains_key(KEY_CREATED_MARKER));
        assert!(raw.config.contains_key(KEY_STARTED_AT));

        let running = shim.get_container(container.get_id()).await?;
        assert_eq!(running.get_state(), &ContainerState::Running);
        assert!(running.get_started_at().is_some());

        // Idempotent; the stamp does not move.
        let stamp = running.get_started_at().clone();
        shim.start_container(container.get_id()).await?;
        let again = shim.get_container(container.get_id()).await?;
        assert_eq!(again.get_started_at(), &stamp);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_stop_stamps_finished_at_only_when_running() -> anyhow::Result<()> {
        let (_, shim) = bridged_shim();
        let sandbox = ready_sandbox(&shim, NetworkMode::Bridged).await?;

        let mut container = sample_container(&sandbox);
        shim.apply_container(&mut container).await?;

        // Stopping a created container is a no-op.
        shim.stop_container(container.get_id(), Duration::from_secs(5))
            .await?;
        let created = shim.get_container(container.get_id()).await?;
        assert_eq!(created.get_state(), &ContainerState::Created);
        assert!(created.get_finished_at().is_none());

        shim.start_container(container.get_id()).await?;
        shim.stop_container(container.get_id(), Duration::from_secs(5))
            .await?;

        let exited = shim.get_container(container.get_id()).await?;
        assert_eq!(exited.get_state(), &ContainerState::Exited);
        assert!(exited.get_finished_at().is_some());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_stops_a_running_workload_first() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();
        let sandbox = ready_sandbox(&shim, NetworkMode::Bridged).await?;

        let mut container = sample_container(&sandbox);
        shim.apply_container(&mut container).await?;
        shim.start_container(container.get_id()).await?;

        shim.delete_container(container.get_id()).await?;
        assert!(store.get_instance(container.get_id()).await.unwrap_err().is_not_found());

        // Absent ids are success.
        shim.delete_container(container.get_id()).await?;
        shim.delete_container("never-existed").await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_leaves_foreign_instances_alone() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();

        store.create_instance(RawInstance::with_name("router")).await?;
        shim.delete_container("router").await?;
        assert!(store.get_instance("router").await.is_ok());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_removes_an_owned_instance_that_no_longer_decodes() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();

        // Owned marker but an empty profile list, so decoding fails.
        let mut broken = RawInstance::with_name("app-beef1234");
        broken
            .config
            .insert(KEY_CRI.to_string(), VAL_TRUE.to_string());
        store.create_instance(broken).await?;

        shim.delete_container("app-beef1234").await?;
        assert!(store.get_instance("app-beef1234").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_list_skips_foreign_instances() -> anyhow::Result<()> {
        let (store, shim) = bridged_shim();
        let sandbox = ready_sandbox(&shim, NetworkMode::Bridged).await?;

        let mut container = sample_container(&sandbox);
        shim.apply_container(&mut container).await?;
        store.create_instance(RawInstance::with_name("router")).await?;

        let listed = shim.list_containers().await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].get_id(), container.get_id());

        let err = shim.get_container("router").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_update_carries_environment_changes() -> anyhow::Result<()> {
        let (_, shim) = bridged_shim();
        let sandbox = ready_sandbox(&shim, NetworkMode::Bridged).await?;

        let mut container = sample_container(&sandbox);
        container.environment = HashMap::from([("MODE".to_string(), "debug".to_string())]);
        shim.apply_container(&mut container).await?;

        container
            .environment
            .insert("MODE".to_string(), "release".to_string());
        shim.apply_container(&mut container).await?;

        let reread = shim.get_container(container.get_id()).await?;
        assert_eq!(
            reread.environment.get("MODE").map(String::as_str),
            Some("release")
        );
        Ok(())
    }
}
