use reqwest::ClientBuilder;
use secrecy::SecretString;
use std::time::Duration;

use crate::error::Result;
use crate::retry::RetryPolicy;

/// Port node agents listen on when an address carries none.
pub const DEFAULT_AGENT_PORT: u16 = 3009;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const CLUSTER_NO_PROXY: [&str; 2] = ["0.0.0.0/0", ".local"];

/// Proxy settings threaded into every HTTP client the agent layer builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub https_proxy: Option<String>,
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    /// Reads `HTTPS_PROXY` and `NO_PROXY` (either case) once and adds the
    /// cluster-local exclusions.
    pub fn from_env() -> Self {
        let https_proxy = env_var(&["HTTPS_PROXY", "https_proxy"]);
        let no_proxy = env_var(&["NO_PROXY", "no_proxy"])
            .map(|value| split_list(&value))
            .unwrap_or_default();
        Self {
            https_proxy,
            no_proxy,
        }
        .with_cluster_defaults()
    }

    pub fn with_https_proxy(mut self, url: impl Into<String>) -> Self {
        self.https_proxy = Some(url.into());
        self
    }

    pub fn with_no_proxy(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        if !self.no_proxy.contains(&host) {
            self.no_proxy.push(host);
        }
        self
    }

    /// Excludes cluster addresses from proxying.
    pub fn with_cluster_defaults(self) -> Self {
        CLUSTER_NO_PROXY
            .iter()
            .fold(self, |config, host| config.with_no_proxy(*host))
    }

    pub fn no_proxy_value(&self) -> String {
        self.no_proxy.join(",")
    }

    pub fn apply(&self, builder: ClientBuilder) -> Result<ClientBuilder> {
        match &self.https_proxy {
            Some(url) => {
                let proxy = reqwest::Proxy::https(url)?
                    .no_proxy(reqwest::NoProxy::from_string(&self.no_proxy_value()));
                Ok(builder.proxy(proxy))
            }
            None => Ok(builder.no_proxy()),
        }
    }
}

fn env_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// How to reach the cluster service and node agents.
#[derive(Debug)]
pub struct AgentClientConfig {
    /// Cluster service address credentials are fetched from
    pub service_url: String,
    pub token: SecretString,
    pub default_port: u16,
    /// Skip TLS verification of the cluster service
    pub insecure: bool,
    pub proxy: ProxyConfig,
    pub request_timeout: Duration,
    /// Backoff for connecting to an agent
    pub retry: RetryPolicy,
}

impl AgentClientConfig {
    pub fn new(service_url: impl Into<String>, token: SecretString) -> Self {
        Self {
            service_url: service_url.into(),
            token,
            default_port: DEFAULT_AGENT_PORT,
            insecure: false,
            proxy: ProxyConfig::default().with_cluster_defaults(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Client used for credential requests to the cluster service.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(self.insecure);
        Ok(self.proxy.apply(builder)?.build()?)
    }
}
