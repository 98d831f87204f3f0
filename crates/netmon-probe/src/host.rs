//! Real [`NetworkProvider`] backed by a blocking HTTP client.

use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use netmon_core::{CoreError, NetworkProvider, NetworkSnapshot, ProbeRequest, ProbeResponse};
use reqwest::blocking::Client;
use reqwest::header::{CACHE_CONTROL, LOCATION, PRAGMA};
use reqwest::redirect::Policy;

use crate::{ProbeError, SOCKET_TIMEOUT};

/// Redirect hops allowed for PAC fetches.
const MAX_PAC_REDIRECTS: usize = 5;

/// Host provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNetworkConfig {
    /// Local address to bind probe sockets to, scoping traffic to one interface.
    pub bind_address: Option<IpAddr>,
    /// Client-wide connect timeout.
    pub connect_timeout: Duration,
    /// `User-Agent` header sent with probes.
    pub user_agent: String,
}

impl Default for HostNetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            connect_timeout: SOCKET_TIMEOUT,
            user_agent: format!("netmon/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Provider that probes through the host's own network stack.
///
/// Probes never go through a proxy; PAC networks are validated by fetching the
/// PAC script itself.
pub struct HostNetwork {
    snapshot: Mutex<NetworkSnapshot>,
    direct: Client,
    following: Client,
    attribution: Mutex<Option<u32>>,
}

impl HostNetwork {
    /// Builds the provider's HTTP clients.
    ///
    /// # Errors
    /// Returns [`ProbeError::Client`] when the TLS backend or client fails to
    /// initialize.
    pub fn new(snapshot: NetworkSnapshot, config: &HostNetworkConfig) -> Result<Self, ProbeError> {
        let direct = build_client(config, Policy::none())?;
        let following = build_client(config, Policy::limited(MAX_PAC_REDIRECTS))?;

        Ok(Self {
            snapshot: Mutex::new(snapshot),
            direct,
            following,
            attribution: Mutex::new(None),
        })
    }

    /// Replaces the snapshot returned to the monitor, e.g. after a proxy change.
    pub fn update_snapshot(&self, snapshot: NetworkSnapshot) {
        *self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }

    /// Returns the requester currently billed for probe traffic.
    pub fn attributed_requester(&self) -> Option<u32> {
        *self
            .attribution
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NetworkProvider for HostNetwork {
    fn snapshot(&self) -> NetworkSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, CoreError> {
        let addresses = (host, 0)
            .to_socket_addrs()
            .map_err(|error| CoreError::Dns {
                host: host.to_string(),
                reason: error.to_string(),
            })?
            .map(|address| address.ip())
            .collect::<Vec<_>>();

        if addresses.is_empty() {
            return Err(CoreError::Dns {
                host: host.to_string(),
                reason: "no addresses returned".to_string(),
            });
        }
        Ok(addresses)
    }

    fn fetch(&self, request: &ProbeRequest) -> Result<ProbeResponse, CoreError> {
        let client = if request.follow_redirects {
            &self.following
        } else {
            &self.direct
        };

        let response = client
            .get(&request.url)
            .timeout(request.timeout)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .map_err(|error| {
                if error.is_timeout() {
                    CoreError::Timeout
                } else {
                    CoreError::Io(error.to_string())
                }
            })?;

        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(ProbeResponse {
            status: response.status().as_u16(),
            location,
            content_length: response.content_length(),
            headers,
        })
    }

    fn attribute_traffic(&self, requester: Option<u32>) {
        tracing::debug!(?requester, "probe traffic attribution changed");
        *self
            .attribution
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = requester;
    }
}

fn build_client(config: &HostNetworkConfig, redirects: Policy) -> Result<Client, ProbeError> {
    Client::builder()
        .no_proxy()
        .redirect(redirects)
        .connect_timeout(config.connect_timeout)
        .local_address(config.bind_address)
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|error| ProbeError::Client(error.to_string()))
}
