//! Identity provisioning collaborator
//!
//! The engine does not create identities itself. A provider lists the
//! identities available for a platform and probes their proxy endpoints.

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use url::Url;

use super::Identity;
use crate::utils::error::PoolError;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Result of probing one identity's proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHealth {
    /// Identity id
    pub identity: String,
    /// Whether the proxy answered
    pub healthy: bool,
    /// Probe round trip (ms)
    pub latency_ms: Option<u64>,
    /// Failure description
    pub error: Option<String>,
}

/// Proxy/identity provisioning collaborator
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider name
    fn name(&self) -> &str;

    /// Identities usable for the platform
    async fn list_identities(&self, platform: &str) -> Result<Vec<Identity>, PoolError>;

    /// Probe the identity's proxy endpoint
    async fn test_proxy(&self, identity: &Identity) -> ProxyHealth;
}

// ============================================================================
// Configuration
// ============================================================================

/// One statically configured identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySeed {
    /// Unique identifier
    pub id: String,
    /// Platform affinity; empty means any platform
    #[serde(default)]
    pub affinity: Vec<String>,
    /// Proxy endpoint
    #[serde(default)]
    pub proxy: Option<Url>,
}

impl From<&IdentitySeed> for Identity {
    fn from(seed: &IdentitySeed) -> Self {
        let mut identity = Identity::new(seed.id.clone());
        identity.affinity = seed.affinity.iter().cloned().collect();
        identity.proxy = seed.proxy.clone();
        identity
    }
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Statically configured identities
    pub identities: Vec<IdentitySeed>,

    /// URL fetched through each proxy when probing
    pub probe_url: String,

    /// Probe timeout (seconds)
    pub probe_timeout_secs: u64,

    /// Probe retries on connection errors
    pub probe_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            probe_url: "https://httpbin.org/ip".to_string(),
            probe_timeout_secs: 10,
            probe_retries: 1,
        }
    }
}

// ============================================================================
// Proxy Tester
// ============================================================================

/// Probes proxies by issuing a GET through them
#[derive(Debug, Clone)]
pub struct HttpProxyTester {
    probe_url: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl HttpProxyTester {
    /// Create a tester from provider configuration
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            probe_url: config.probe_url.clone(),
            timeout: Duration::from_secs(config.probe_timeout_secs),
            retry: RetryConfig::with_delays(config.probe_retries, 500, 2000),
        }
    }

    /// Probe the identity's proxy; identities without a proxy go direct and are healthy
    pub async fn probe(&self, identity: &Identity) -> ProxyHealth {
        let Some(proxy) = identity.proxy.clone() else {
            return ProxyHealth {
                identity: identity.id.clone(),
                healthy: true,
                latency_ms: None,
                error: None,
            };
        };

        let started = Instant::now();
        let result = with_retry_if(
            &self.retry,
            || self.fetch_through(&proxy),
            |e| {
                e.downcast_ref::<reqwest::Error>()
                    .is_some_and(|re| re.is_timeout() || re.is_connect())
            },
        )
        .await;

        match result {
            Ok(()) => ProxyHealth {
                identity: identity.id.clone(),
                healthy: true,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => {
                tracing::warn!(
                    identity = %identity.id,
                    proxy = %proxy,
                    error = %e,
                    "Proxy probe failed"
                );
                ProxyHealth {
                    identity: identity.id.clone(),
                    healthy: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn fetch_through(&self, proxy: &Url) -> anyhow::Result<()> {
        let client = Client::builder()
            .proxy(Proxy::all(proxy.as_str())?)
            .timeout(self.timeout)
            .build()?;
        let response = client.get(&self.probe_url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("probe returned HTTP {}", response.status());
        }
        Ok(())
    }
}

// ============================================================================
// Static Provider
// ============================================================================

/// Provider serving identities from configuration
#[derive(Debug, Clone)]
pub struct StaticIdentityProvider {
    identities: Vec<Identity>,
    tester: HttpProxyTester,
}

impl StaticIdentityProvider {
    /// Create from provider configuration
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            identities: config.identities.iter().map(Identity::from).collect(),
            tester: HttpProxyTester::new(config),
        }
    }

    /// Every configured identity
    pub fn all(&self) -> &[Identity] {
        &self.identities
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_identities(&self, platform: &str) -> Result<Vec<Identity>, PoolError> {
        Ok(self
            .identities
            .iter()
            .filter(|identity| identity.matches_platform(platform))
            .cloned()
            .collect())
    }

    async fn test_proxy(&self, identity: &Identity) -> ProxyHealth {
        self.tester.probe(identity).await
    }
}
