use std::{collections::HashMap, fmt, str::FromStr};

use typed_builder::TypedBuilder;

use crate::{LxdletError, LxdletResult};

use super::{require_option, DEVICE_TYPE_PROXY, OPTION_LISTEN, OPTION_TYPE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A port forward between a host endpoint and a workload endpoint.
///
/// Both endpoints use the hypervisor's `protocol:address:port` notation, e.g.
/// `tcp:0.0.0.0:8080`.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct Proxy {
    /// The device entry name; derived from the connect endpoint when unset.
    #[builder(default)]
    pub name: Option<String>,

    /// The endpoint the hypervisor listens on.
    pub listen: ProxyEndpoint,

    /// The endpoint connections are forwarded to.
    pub connect: ProxyEndpoint,
}

/// One side of a proxy forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// The transport protocol.
    pub protocol: ProxyProtocol,

    /// The bind or target address.
    pub address: String,

    /// The bind or target port.
    pub port: u16,
}

/// The transport protocol of a proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    /// TCP forwarding.
    #[default]
    Tcp,

    /// UDP forwarding.
    Udp,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Proxy {
    /// Returns the device entry name, deriving `proxy-<connect>` with `:`
    /// flattened to `-` when no name was assigned.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("proxy-{}", self.connect.to_string().replace(':', "-")),
        }
    }

    /// Encodes the device into its named option map.
    pub fn to_map(&self) -> (String, HashMap<String, String>) {
        let options = HashMap::from([
            (OPTION_TYPE.to_string(), DEVICE_TYPE_PROXY.to_string()),
            (OPTION_LISTEN.to_string(), self.listen.to_string()),
            ("connect".to_string(), self.connect.to_string()),
        ]);
        (self.effective_name(), options)
    }

    /// Decodes the device from its named option map.
    pub fn from_map(name: &str, options: &HashMap<String, String>) -> LxdletResult<Self> {
        let listen = require_option(name, options, OPTION_LISTEN)?.parse()?;
        let connect = require_option(name, options, "connect")?.parse()?;
        Ok(Self {
            name: Some(name.to_string()),
            listen,
            connect,
        })
    }
}

impl ProxyEndpoint {
    /// Creates a new endpoint.
    pub fn new(protocol: ProxyProtocol, address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            address: address.into(),
            port,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for ProxyEndpoint {
    type Err = LxdletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [protocol, address, port] = parts.as_slice() else {
            return Err(LxdletError::InvalidProxyEndpoint(s.to_string()));
        };
        if address.is_empty() {
            return Err(LxdletError::InvalidProxyEndpoint(s.to_string()));
        }

        let protocol = protocol
            .parse()
            .map_err(|_: LxdletError| LxdletError::InvalidProxyEndpoint(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| LxdletError::InvalidProxyEndpoint(s.to_string()))?;

        Ok(Self {
            protocol,
            address: address.to_string(),
            port,
        })
    }
}

impl fmt::Display for ProxyEndpoint {
    /// Formats the endpoint following the format `protocol:address:port`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.address, self.port)
    }
}

impl FromStr for ProxyProtocol {
    type Err = LxdletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ProxyProtocol::Tcp),
            "udp" => Ok(ProxyProtocol::Udp),
            other => Err(LxdletError::InvalidProxyEndpoint(other.to_string())),
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Tcp => write!(f, "tcp"),
            ProxyProtocol::Udp => write!(f, "udp"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
