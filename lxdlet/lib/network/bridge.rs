use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use getset::Getters;
use ipnetwork::Ipv4Network;
use lxdstore::{LxdStore, RawNetwork};
use rand::Rng;
use typed_builder::TypedBuilder;

use crate::{
    device::Nic,
    network::{NetworkPlugin, NetworkResult, NetworkStatus, Properties, PropertiesRunning},
    LxdletResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default name of the managed bridge.
pub const DEFAULT_BRIDGE_NAME: &str = "lxdlet0";

/// The default bridge address and subnet, used when no range is configured.
pub static DEFAULT_BRIDGE_CIDR: LazyLock<Ipv4Network> =
    LazyLock::new(|| "10.140.78.1/24".parse().unwrap());

/// The interface name workloads see.
const INTERFACE_NAME: &str = "eth0";

/// Mode data key holding the bridge name.
pub const DATA_KEY_BRIDGE: &str = "bridge";

/// Mode data key holding the pod's leased address.
pub const DATA_KEY_IPV4_ADDRESS: &str = "ipv4-address";

/// Delay between allocation sweeps while the subnet is exhausted. The caller
/// bounds the overall wait with its hook timeout.
const ALLOCATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The cloud-init fragment asking the workload to DHCP on its interface.
const DHCP_FRAGMENT: &str = "type: physical\nname: eth0\nsubnets:\n- type: dhcp\n";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration of the managed-bridge backend.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BridgeConfig {
    /// The name of the managed bridge network.
    #[builder(default = DEFAULT_BRIDGE_NAME.to_string(), setter(into))]
    bridge_name: String,

    /// The bridge address and subnet; the crate default range when unset.
    #[builder(default, setter(strip_option))]
    cidr: Option<Ipv4Network>,

    /// Whether the bridge NATs outbound traffic.
    #[builder(default = true)]
    nat: bool,
}

/// A pod network backend that places every pod on one managed bridge and
/// leases each a static address out of the bridge subnet.
pub struct BridgeNetwork {
    /// The store managing the bridge network object.
    store: Arc<dyn LxdStore>,

    /// The backend configuration.
    config: BridgeConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BridgeNetwork {
    /// Creates a bridge backend over the given store.
    pub fn new(store: Arc<dyn LxdStore>, config: BridgeConfig) -> Self {
        Self { store, config }
    }

    /// Returns the subnet the bridge serves.
    fn subnet(&self) -> Ipv4Network {
        self.config.cidr.unwrap_or(*DEFAULT_BRIDGE_CIDR)
    }

    /// Makes sure the bridge network exists, creating it on first use.
    async fn ensure_network(&self) -> LxdletResult<()> {
        let name = &self.config.bridge_name;
        match self.store.get_network(name).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let subnet = self.subnet();
        tracing::info!(bridge = %name, subnet = %subnet, "creating managed bridge network");
        let network = RawNetwork {
            name: name.clone(),
            config: HashMap::from([
                ("ipv4.address".to_string(), subnet.to_string()),
                ("ipv4.nat".to_string(), self.config.nat.to_string()),
            ]),
            managed: true,
            ..Default::default()
        };
        match self.store.create_network(network).await {
            Ok(_) => Ok(()),
            // Lost a creation race; the bridge exists, which is all we need.
            Err(err) if matches!(err, lxdstore::StoreError::AlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Leases a free address out of the bridge subnet.
    ///
    /// Loops until an address frees up; the caller's hook timeout bounds the
    /// wait on an exhausted subnet.
    async fn allocate_address(&self) -> LxdletResult<Ipv4Addr> {
        let subnet = self.subnet();
        loop {
            let leases = self.store.network_leases(&self.config.bridge_name).await?;
            if let Some(address) = probe_free(&subnet, &leases) {
                return Ok(address);
            }
            tracing::debug!(bridge = %self.config.bridge_name, "subnet exhausted, retrying allocation");
            tokio::time::sleep(ALLOCATE_RETRY_DELAY).await;
        }
    }

    /// Returns the lease already persisted for this pod, if it is still
    /// inside the subnet.
    fn persisted_lease(&self, properties: &Properties) -> Option<Ipv4Addr> {
        let address: Ipv4Addr = properties.data.get(DATA_KEY_IPV4_ADDRESS)?.parse().ok()?;
        self.subnet().contains(address).then_some(address)
    }

    /// Builds the nic attached to every pod on the bridge.
    fn pod_nic(&self, address: Option<Ipv4Addr>) -> Nic {
        Nic::builder()
            .interface(INTERFACE_NAME)
            .nic_type("bridged")
            .parent(self.config.bridge_name.clone())
            .ipv4_address(address.map(|a| a.to_string()).unwrap_or_default())
            .build()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sweeps the subnet once from a random starting point and returns the first
/// usable address that is neither the network, the broadcast, the bridge's
/// own address, nor taken.
fn probe_free(subnet: &Ipv4Network, taken: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    let host_bits = 32 - u32::from(subnet.prefix());
    let size = 1u64 << host_bits;
    let base = u32::from(subnet.network());

    let start = rand::thread_rng().gen_range(0..size);
    for step in 0..size {
        let offset = ((start + step) % size) as u32;
        let candidate = Ipv4Addr::from(base + offset);
        if candidate == subnet.network()
            || candidate == subnet.broadcast()
            || candidate == subnet.ip()
        {
            continue;
        }
        if taken.contains(&candidate) {
            continue;
        }
        return Some(candidate);
    }
    None
}

/// Parses the DHCP cloud-init fragment handed to every pod.
fn dhcp_fragment() -> LxdletResult<serde_yaml::Value> {
    Ok(serde_yaml::from_str(DHCP_FRAGMENT)?)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[async_trait]
impl NetworkPlugin for BridgeNetwork {
    async fn when_created(&self, properties: &Properties) -> LxdletResult<NetworkResult> {
        self.ensure_network().await?;
        tracing::debug!(pod = %properties.pod, bridge = %self.config.bridge_name, "attaching pod to bridge");

        Ok(NetworkResult {
            data: HashMap::from([(
                DATA_KEY_BRIDGE.to_string(),
                self.config.bridge_name.clone(),
            )]),
            // The address is leased at start time; until then the workload
            // boots with a bare bridged interface.
            nics: vec![self.pod_nic(None)],
            network_config_entries: vec![dhcp_fragment()?],
        })
    }

    async fn when_started(&self, properties: &PropertiesRunning) -> LxdletResult<NetworkResult> {
        self.ensure_network().await?;

        let address = match self.persisted_lease(&properties.properties) {
            Some(address) => address,
            None => self.allocate_address().await?,
        };
        tracing::debug!(
            pod = %properties.properties.pod,
            address = %address,
            "leased bridge address"
        );

        Ok(NetworkResult {
            data: HashMap::from([
                (DATA_KEY_BRIDGE.to_string(), self.config.bridge_name.clone()),
                (DATA_KEY_IPV4_ADDRESS.to_string(), address.to_string()),
            ]),
            nics: vec![self.pod_nic(Some(address))],
            network_config_entries: vec![dhcp_fragment()?],
        })
    }

    async fn when_stopped(&self, properties: &Properties) -> LxdletResult<()> {
        // The lease lives on the profile's nic device and dies with it.
        tracing::debug!(pod = %properties.pod, "bridge teardown is a no-op");
        Ok(())
    }

    async fn when_deleted(&self, properties: &Properties) -> LxdletResult<()> {
        tracing::debug!(pod = %properties.pod, "bridge cleanup is a no-op");
        Ok(())
    }

    async fn status(&self, properties: &Properties) -> LxdletResult<NetworkStatus> {
        let ips = properties
            .data
            .get(DATA_KEY_IPV4_ADDRESS)
            .and_then(|raw| raw.parse::<Ipv4Addr>().ok())
            .map(|address| vec![IpAddr::V4(address)])
            .unwrap_or_default();
        Ok(NetworkStatus { ips })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
