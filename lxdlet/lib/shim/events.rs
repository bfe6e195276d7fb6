//! Glue between the hypervisor's lifecycle stream and the network backend.
//!
//! The hypervisor starts and stops workloads asynchronously, and the init pid
//! a network backend needs only exists once an instance runs. This module
//! closes that gap: a single listener task consumes the event stream and
//! drives the per-workload hooks through an [`EventHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lxdstore::LifecycleAction;
use tokio::task::JoinHandle;

use crate::{
    network::{Properties, PropertiesRunning},
    Container, LxdletError, LxdletResult,
};

use super::{wants_network_hooks, Shim};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The reactions to workload lifecycle transitions.
///
/// [`Shim`] implements this by driving its network backend; a layer on top
/// can wrap the shim to add its own bookkeeping. Registration is explicit:
/// whoever owns the store connection spawns the listener and hands it the
/// handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A workload transitioned to running.
    async fn container_started(&self, id: &str) -> LxdletResult<()>;

    /// A workload stopped.
    async fn container_stopped(&self, id: &str) -> LxdletResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl EventHandler for Shim {
    /// Attaches the pod network once a workload runs.
    ///
    /// The backend's start hook gets the init pid; whatever it reports is
    /// merged into the sandbox and persisted, so addresses survive a restart
    /// of this process. Failures surface to the listener, which logs them;
    /// the workload itself keeps running either way.
    async fn container_started(&self, id: &str) -> LxdletResult<()> {
        let instance = self.store.get_instance(id).await?;
        let container = Container::from_instance(&instance)?;
        let sandbox_id = container.sandbox_id()?.to_string();
        let mut sandbox = self.get_sandbox(&sandbox_id).await?;

        if !wants_network_hooks(sandbox.network_config.mode) {
            return Ok(());
        }

        let pid = instance.pid.ok_or_else(|| {
            LxdletError::NetworkSetup(format!("instance {} is running without a pid", id))
        })?;

        let running = PropertiesRunning::new(Properties::from_sandbox(&sandbox), pid);
        let result = self
            .network_hook(self.network.when_started(&running))
            .await?;
        result.apply_to(&mut sandbox);
        self.apply_sandbox(&mut sandbox).await?;

        tracing::debug!(container = %id, sandbox = %sandbox_id, "pod network attached");
        Ok(())
    }

    /// Releases per-workload network state after a stop.
    ///
    /// Teardown is best-effort: a failing backend is logged and forgotten,
    /// since nothing downstream can do better than retry on the next stop.
    async fn container_stopped(&self, id: &str) -> LxdletResult<()> {
        let instance = self.store.get_instance(id).await?;
        let container = Container::from_instance(&instance)?;
        let sandbox_id = container.sandbox_id()?.to_string();
        let sandbox = self.get_sandbox(&sandbox_id).await?;

        if !wants_network_hooks(sandbox.network_config.mode) {
            return Ok(());
        }

        let properties = Properties::from_sandbox(&sandbox);
        if let Err(err) = self
            .network_hook(self.network.when_stopped(&properties))
            .await
        {
            tracing::warn!(
                container = %id,
                sandbox = %sandbox_id,
                error = %err,
                "pod network teardown failed"
            );
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns the lifecycle listener over the shim's store connection.
///
/// The subscription is established before this returns, so no event emitted
/// afterwards is missed. One listener per connection; events are handled
/// serially so the start and stop of a workload cannot race each other.
/// Actions outside the modeled set are skipped, handler errors about objects
/// this shim does not own are expected noise from neighbors on the
/// hypervisor, and every other handler error is logged without stopping the
/// loop. The task ends when the stream does; dropping the handle does not
/// stop it.
pub async fn spawn_event_listener(shim: Arc<Shim>) -> LxdletResult<JoinHandle<()>> {
    let mut events = shim.store.subscribe().await?;
    Ok(tokio::spawn(async move {
        tracing::debug!("lifecycle listener running");

        while let Some(event) = events.next().await {
            let outcome = match event.action {
                LifecycleAction::Started => shim.container_started(&event.instance).await,
                LifecycleAction::Stopped => shim.container_stopped(&event.instance).await,
                LifecycleAction::Other(_) => continue,
            };

            match outcome {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    tracing::trace!(instance = %event.instance, "event for an instance not owned here");
                }
                Err(err) => {
                    tracing::error!(
                        instance = %event.instance,
                        action = %event.action,
                        error = %err,
                        "lifecycle handler failed"
                    );
                }
            }
        }
        tracing::debug!("lifecycle stream ended");
    }))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use lxdstore::{LxdStore, MemoryStore};

    use crate::{
        device::{Device, Nic},
        network::{NetworkPlugin, NetworkResult, NetworkStatus},
        shim::ShimOptions,
        Container, ContainerMetadata, NetworkMode, Sandbox, SandboxMetadata,
    };

    use super::*;

    /// Records every hook invocation; optionally fails or never returns.
    #[derive(Default)]
    struct RecordingPlugin {
        calls: Mutex<Vec<String>>,
        fail: bool,
        wedge: bool,
    }

    impl RecordingPlugin {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn wedged() -> Self {
            Self {
                wedge: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn record(&self, call: String) -> LxdletResult<()> {
            if self.wedge {
                futures::future::pending::<()>().await;
            }
            self.calls.lock().unwrap().push(call);
            if self.fail {
                return Err(LxdletError::NetworkSetup("backend down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NetworkPlugin for RecordingPlugin {
        async fn when_created(&self, properties: &Properties) -> LxdletResult<NetworkResult> {
            self.record(format!("created:{}", properties.pod)).await?;
            Ok(NetworkResult::default())
        }

        async fn when_started(
            &self,
            running: &PropertiesRunning,
        ) -> LxdletResult<NetworkResult> {
            self.record(format!(
                "started:{}:{}",
                running.properties.pod, running.pid
            ))
            .await?;
            Ok(NetworkResult {
                data: HashMap::from([("probe".to_string(), "on".to_string())]),
                nics: vec![Nic::builder()
                    .interface("eth0")
                    .nic_type("bridged")
                    .parent("lxdlet0")
                    .ipv4_address("10.140.78.9")
                    .build()],
                network_config_entries: Vec::new(),
            })
        }

        async fn when_stopped(&self, properties: &Properties) -> LxdletResult<()> {
            self.record(format!("stopped:{}", properties.pod)).await
        }

        async fn when_deleted(&self, properties: &Properties) -> LxdletResult<()> {
            self.record(format!("deleted:{}", properties.pod)).await
        }

        async fn status(&self, _properties: &Properties) -> LxdletResult<NetworkStatus> {
            Ok(NetworkStatus::default())
        }
    }

    async fn started_workload(
        shim: &Shim,
        mode: NetworkMode,
    ) -> anyhow::Result<(Sandbox, Container)> {
        let mut sandbox = Sandbox::with_metadata(SandboxMetadata {
            name: "web".to_string(),
            namespace: "default".to_string(),
            uid: "77aa".to_string(),
            attempt: 0,
        });
        sandbox.network_config.mode = mode;
        shim.apply_sandbox(&mut sandbox).await?;

        let mut container = Container::with_metadata(ContainerMetadata {
            name: "app".to_string(),
            attempt: 0,
        });
        container.privileged = mode == NetworkMode::Host;
        container.profiles = vec![sandbox.get_id().clone()];
        shim.apply_container(&mut container).await?;
        shim.start_container(container.get_id()).await?;
        Ok((sandbox, container))
    }

    #[test_log::test(tokio::test)]
    async fn test_started_merges_the_hook_result_into_the_sandbox() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let plugin = Arc::new(RecordingPlugin::default());
        let shim = Shim::new(store.clone(), plugin.clone());

        let (sandbox, container) = started_workload(&shim, NetworkMode::Bridged).await?;
        shim.container_started(container.get_id()).await?;

        let pid = store.get_instance(container.get_id()).await?.pid.unwrap();
        assert_eq!(
            plugin.calls(),
            vec![
                format!("created:{}", sandbox.get_id()),
                format!("started:{}:{}", sandbox.get_id(), pid),
            ]
        );

        let attached = shim.get_sandbox(sandbox.get_id()).await?;
        assert_eq!(
            attached.network_config.mode_data.get("probe").map(String::as_str),
            Some("on")
        );
        assert!(attached.devices.iter().any(|device| matches!(
            device,
            Device::Nic(nic) if nic.ipv4_address == "10.140.78.9"
        )));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_host_mode_never_consults_the_backend() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let plugin = Arc::new(RecordingPlugin::default());
        let shim = Shim::new(store, plugin.clone());

        let (_, container) = started_workload(&shim, NetworkMode::Host).await?;
        shim.container_started(container.get_id()).await?;
        shim.container_stopped(container.get_id()).await?;

        assert!(plugin.calls().is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_started_surfaces_backend_failure() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let shim = Shim::new(store.clone(), Arc::new(RecordingPlugin::default()));
        let (_, container) = started_workload(&shim, NetworkMode::Bridged).await?;

        let failing = Shim::new(store, Arc::new(RecordingPlugin::failing()));
        let err = failing
            .container_started(container.get_id())
            .await
            .unwrap_err();
        assert!(matches!(err, LxdletError::NetworkSetup(_)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_stopped_swallows_backend_failure() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let shim = Shim::new(store.clone(), Arc::new(RecordingPlugin::default()));
        let (sandbox, container) = started_workload(&shim, NetworkMode::Bridged).await?;

        let plugin = Arc::new(RecordingPlugin::failing());
        let failing = Shim::new(store, plugin.clone());
        failing.container_stopped(container.get_id()).await?;

        assert_eq!(plugin.calls(), vec![format!("stopped:{}", sandbox.get_id())]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_hooks_run_under_a_deadline() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let shim = Shim::new(store.clone(), Arc::new(RecordingPlugin::default()));
        let (_, container) = started_workload(&shim, NetworkMode::Bridged).await?;

        let options = ShimOptions::builder()
            .network_hook_timeout(Duration::from_millis(20))
            .build();
        let wedged = Shim::with_options(store, Arc::new(RecordingPlugin::wedged()), options);

        let err = wedged
            .container_started(container.get_id())
            .await
            .unwrap_err();
        assert!(matches!(err, LxdletError::NetworkHookTimedOut(_)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_listener_drives_hooks_from_store_events() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let plugin = Arc::new(RecordingPlugin::default());
        let shim = Arc::new(Shim::new(store.clone(), plugin.clone()));
        let listener = spawn_event_listener(shim.clone()).await?;

        let (sandbox, container) = started_workload(&shim, NetworkMode::Bridged).await?;
        shim.stop_container(container.get_id(), Duration::from_secs(5))
            .await?;

        // The listener runs concurrently; give it a moment to drain.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let calls = plugin.calls();
            let done = calls
                .iter()
                .any(|call| call == &format!("stopped:{}", sandbox.get_id()));
            if done {
                assert!(calls
                    .iter()
                    .any(|call| call.starts_with(&format!("started:{}:", sandbox.get_id()))));
                break;
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "listener never handled the stop event"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        listener.abort();
        Ok(())
    }
}
