use std::{
    collections::HashMap,
    io::ErrorKind,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{
    network::{NetworkPlugin, NetworkResult, NetworkStatus, Properties, PropertiesRunning},
    utils::{join_csv, split_csv},
    LxdletError, LxdletResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// File extensions recognized as network conf files.
const CONF_EXTENSIONS: [&str; 3] = ["conf", "conflist", "json"];

/// The interface name created inside the pod when none is configured.
const DEFAULT_IFNAME: &str = "eth0";

/// Mode data key holding the network namespace path of the attached pod.
pub const DATA_KEY_NETNS: &str = "netns";

/// Mode data key holding the comma-joined addresses the plugin chain
/// assigned.
pub const DATA_KEY_IPS: &str = "ips";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration of the CNI backend.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CniConfig {
    /// The directory scanned for network conf files.
    #[builder(setter(into))]
    conf_dir: PathBuf,

    /// The interface name handed to the plugin chain.
    #[builder(default = DEFAULT_IFNAME.to_string(), setter(into))]
    ifname: String,
}

/// A parsed network conf file.
#[derive(Debug, Clone, PartialEq)]
pub struct CniConf {
    /// Where the conf was loaded from.
    pub path: PathBuf,

    /// The network name the conf declares.
    pub name: String,

    /// The raw conf document, handed to the plugin chain untouched.
    pub document: serde_json::Value,
}

/// The identifiers one plugin invocation runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniRuntimeContext {
    /// The pod id, used as the CNI container id.
    pub container_id: String,

    /// The network namespace path the interface is created in.
    pub netns: PathBuf,

    /// The interface name to create inside the namespace.
    pub ifname: String,
}

/// What the plugin chain reported after an attach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniAttachment {
    /// The addresses assigned to the pod, primary first.
    pub ips: Vec<IpAddr>,
}

/// A pod network backend that delegates all plumbing to an external CNI
/// plugin chain.
///
/// The backend discovers the conf, derives the runtime context from the
/// workload's init pid, and records what the chain assigned; running the
/// plugin binaries themselves is behind [`CniInvoker`]. Discovery happens on
/// every attach, so dropping a new conf into the directory takes effect
/// without a restart.
pub struct CniNetwork {
    /// The backend configuration.
    config: CniConfig,

    /// The plugin execution capability.
    invoker: Arc<dyn CniInvoker>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The capability of executing a CNI plugin chain.
#[async_trait]
pub trait CniInvoker: Send + Sync {
    /// Runs the chain's ADD command and reports the attachment.
    async fn add(
        &self,
        conf: &CniConf,
        context: &CniRuntimeContext,
    ) -> LxdletResult<CniAttachment>;

    /// Runs the chain's DEL command.
    async fn del(&self, conf: &CniConf, context: &CniRuntimeContext) -> LxdletResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CniRuntimeContext {
    /// Creates the context for a pod whose init pid is known.
    pub fn new(container_id: impl Into<String>, pid: u32, ifname: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            netns: netns_path(pid),
            ifname: ifname.into(),
        }
    }
}

impl CniNetwork {
    /// Creates a CNI backend reading confs from the configured directory.
    pub fn new(config: CniConfig, invoker: Arc<dyn CniInvoker>) -> Self {
        Self { config, invoker }
    }

    /// Returns the first usable conf in the directory.
    ///
    /// Candidates are considered in filename order. A file that does not
    /// parse is skipped with a warning, so one broken conf cannot take down
    /// networking for every pod on the host.
    async fn discover_conf(&self) -> LxdletResult<CniConf> {
        let dir = self.config.conf_dir.as_path();
        let mut listing = match tokio::fs::read_dir(dir).await {
            Ok(listing) => listing,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(LxdletError::NetworkConfNotFound(dir.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = listing.next_entry().await? {
            let path = entry.path();
            let recognized = path
                .extension()
                .and_then(|extension| extension.to_str())
                .map(|extension| CONF_EXTENSIONS.contains(&extension))
                .unwrap_or(false);
            if recognized {
                candidates.push(path);
            }
        }
        candidates.sort();

        for path in candidates {
            match load_conf(&path).await {
                Ok(conf) => return Ok(conf),
                Err(err) => {
                    tracing::warn!(
                        conf = %path.display(),
                        error = %err,
                        "skipping unusable network conf"
                    );
                }
            }
        }
        Err(LxdletError::NetworkConfNotFound(dir.to_path_buf()))
    }

    /// Runs the chain's DEL against the netns recorded at attach time.
    async fn detach(&self, properties: &Properties) -> LxdletResult<()> {
        let Some(netns) = properties.data.get(DATA_KEY_NETNS) else {
            tracing::debug!(pod = %properties.pod, "no attachment recorded, nothing to detach");
            return Ok(());
        };

        let conf = self.discover_conf().await?;
        let context = CniRuntimeContext {
            container_id: properties.pod.clone(),
            netns: PathBuf::from(netns),
            ifname: self.config.ifname.clone(),
        };
        tracing::debug!(
            pod = %properties.pod,
            network = %conf.name,
            netns = %context.netns.display(),
            "invoking CNI del"
        );
        self.invoker.del(&conf, &context).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the network namespace path of a process.
fn netns_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/net", pid))
}

async fn load_conf(path: &Path) -> LxdletResult<CniConf> {
    let raw = tokio::fs::read_to_string(path).await?;
    let document: serde_json::Value = serde_json::from_str(&raw)?;
    let name = document
        .get("name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            LxdletError::NetworkSetup(format!("conf {} declares no name", path.display()))
        })?
        .to_string();
    Ok(CniConf {
        path: path.to_path_buf(),
        name,
        document,
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl NetworkPlugin for CniNetwork {
    /// Nothing to do yet: plugins need a live network namespace, which only
    /// exists once a workload runs.
    async fn when_created(&self, properties: &Properties) -> LxdletResult<NetworkResult> {
        tracing::debug!(pod = %properties.pod, "deferring CNI attach until a workload starts");
        Ok(NetworkResult::default())
    }

    async fn when_started(&self, running: &PropertiesRunning) -> LxdletResult<NetworkResult> {
        let conf = self.discover_conf().await?;
        let context = CniRuntimeContext::new(
            running.properties.pod.clone(),
            running.pid,
            self.config.ifname.clone(),
        );

        tracing::debug!(
            pod = %context.container_id,
            conf = %conf.path.display(),
            network = %conf.name,
            "invoking CNI add"
        );
        let attachment = self.invoker.add(&conf, &context).await?;

        let ips: Vec<String> = attachment.ips.iter().map(ToString::to_string).collect();
        let data = HashMap::from([
            (
                DATA_KEY_NETNS.to_string(),
                context.netns.display().to_string(),
            ),
            (DATA_KEY_IPS.to_string(), join_csv(&ips)),
        ]);
        Ok(NetworkResult {
            data,
            nics: Vec::new(),
            network_config_entries: Vec::new(),
        })
    }

    async fn when_stopped(&self, properties: &Properties) -> LxdletResult<()> {
        self.detach(properties).await
    }

    async fn when_deleted(&self, properties: &Properties) -> LxdletResult<()> {
        self.detach(properties).await
    }

    async fn status(&self, properties: &Properties) -> LxdletResult<NetworkStatus> {
        let ips = properties
            .data
            .get(DATA_KEY_IPS)
            .map(|raw| {
                split_csv(raw)
                    .iter()
                    .filter_map(|entry| entry.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(NetworkStatus { ips })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockInvoker {
        ips: Vec<IpAddr>,
        adds: Mutex<Vec<(String, CniRuntimeContext)>>,
        dels: Mutex<Vec<(String, CniRuntimeContext)>>,
    }

    impl MockInvoker {
        fn assigning(ips: Vec<IpAddr>) -> Self {
            Self {
                ips,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CniInvoker for MockInvoker {
        async fn add(
            &self,
            conf: &CniConf,
            context: &CniRuntimeContext,
        ) -> LxdletResult<CniAttachment> {
            self.adds
                .lock()
                .unwrap()
                .push((conf.name.clone(), context.clone()));
            Ok(CniAttachment {
                ips: self.ips.clone(),
            })
        }

        async fn del(&self, conf: &CniConf, context: &CniRuntimeContext) -> LxdletResult<()> {
            self.dels
                .lock()
                .unwrap()
                .push((conf.name.clone(), context.clone()));
            Ok(())
        }
    }

    fn cni_network(conf_dir: &Path, invoker: Arc<MockInvoker>) -> CniNetwork {
        CniNetwork::new(CniConfig::builder().conf_dir(conf_dir).build(), invoker)
    }

    async fn write_conf(dir: &Path, file: &str, body: &str) -> anyhow::Result<()> {
        tokio::fs::write(dir.join(file), body).await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_discovery_takes_the_first_conf_by_filename() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_conf(
            dir.path(),
            "20-beta.conf",
            r#"{"name": "beta", "type": "bridge"}"#,
        )
        .await?;
        write_conf(
            dir.path(),
            "10-alpha.conflist",
            r#"{"name": "alpha", "plugins": [{"type": "bridge"}]}"#,
        )
        .await?;

        let network = cni_network(dir.path(), Arc::new(MockInvoker::default()));
        let conf = network.discover_conf().await?;
        assert_eq!(conf.name, "alpha");
        assert_eq!(conf.path, dir.path().join("10-alpha.conflist"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_discovery_skips_malformed_confs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_conf(dir.path(), "00-broken.conf", "{ this is not json").await?;
        write_conf(dir.path(), "05-unnamed.conf", r#"{"type": "bridge"}"#).await?;
        write_conf(
            dir.path(),
            "10-good.conf",
            r#"{"name": "good", "type": "bridge"}"#,
        )
        .await?;

        let network = cni_network(dir.path(), Arc::new(MockInvoker::default()));
        assert_eq!(network.discover_conf().await?.name, "good");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_discovery_ignores_unrelated_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_conf(dir.path(), "README.md", "not a conf").await?;
        write_conf(dir.path(), "10-net.conf.bak", r#"{"name": "stale"}"#).await?;

        let network = cni_network(dir.path(), Arc::new(MockInvoker::default()));
        let err = network.discover_conf().await.unwrap_err();
        assert!(matches!(err, LxdletError::NetworkConfNotFound(_)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_discovery_reports_a_missing_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("never-created");

        let network = cni_network(&missing, Arc::new(MockInvoker::default()));
        let err = network.discover_conf().await.unwrap_err();
        assert!(matches!(err, LxdletError::NetworkConfNotFound(path) if path == missing));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_when_started_records_the_attachment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_conf(
            dir.path(),
            "10-pod.conf",
            r#"{"name": "podnet", "type": "bridge"}"#,
        )
        .await?;

        let invoker = Arc::new(MockInvoker::assigning(vec![
            "10.22.0.5".parse()?,
            "fd00::5".parse()?,
        ]));
        let network = cni_network(dir.path(), invoker.clone());

        let running = PropertiesRunning::new(Properties::new("web-1", HashMap::new()), 4242);
        let result = network.when_started(&running).await?;

        assert_eq!(
            result.data.get(DATA_KEY_NETNS).map(String::as_str),
            Some("/proc/4242/ns/net")
        );
        assert_eq!(
            result.data.get(DATA_KEY_IPS).map(String::as_str),
            Some("10.22.0.5,fd00::5")
        );
        assert!(result.nics.is_empty());

        let adds = invoker.adds.lock().unwrap();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].0, "podnet");
        assert_eq!(adds[0].1.container_id, "web-1");
        assert_eq!(adds[0].1.ifname, DEFAULT_IFNAME);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_when_stopped_uses_the_recorded_netns() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_conf(
            dir.path(),
            "10-pod.conf",
            r#"{"name": "podnet", "type": "bridge"}"#,
        )
        .await?;

        let invoker = Arc::new(MockInvoker::default());
        let network = cni_network(dir.path(), invoker.clone());

        // Without a recorded attachment the hook is a no-op.
        network
            .when_stopped(&Properties::new("web-1", HashMap::new()))
            .await?;
        assert!(invoker.dels.lock().unwrap().is_empty());

        let data = HashMap::from([(
            DATA_KEY_NETNS.to_string(),
            "/proc/4242/ns/net".to_string(),
        )]);
        network.when_stopped(&Properties::new("web-1", data)).await?;

        let dels = invoker.dels.lock().unwrap();
        assert_eq!(dels.len(), 1);
        assert_eq!(dels[0].0, "podnet");
        assert_eq!(dels[0].1.netns, PathBuf::from("/proc/4242/ns/net"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_when_created_defers_to_start() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let invoker = Arc::new(MockInvoker::default());
        let network = cni_network(dir.path(), invoker.clone());

        let result = network
            .when_created(&Properties::new("web-1", HashMap::new()))
            .await?;
        assert_eq!(result, NetworkResult::default());
        assert!(invoker.adds.lock().unwrap().is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_status_parses_the_recorded_ips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let network = cni_network(dir.path(), Arc::new(MockInvoker::default()));

        let data = HashMap::from([(DATA_KEY_IPS.to_string(), "10.22.0.5,fd00::5".to_string())]);
        let status = network.status(&Properties::new("web-1", data)).await?;
        assert_eq!(
            status.ips,
            vec!["10.22.0.5".parse::<IpAddr>()?, "fd00::5".parse::<IpAddr>()?]
        );

        let empty = network
            .status(&Properties::new("web-1", HashMap::new()))
            .await?;
        assert!(empty.ips.is_empty());
        Ok(())
    }
}
