use anyhow::{Context, Result};
use orchestrator::agent::{AgentClientConfig, ProxyConfig, DEFAULT_AGENT_PORT};
use orchestrator::kube::KubeConfig;
use orchestrator::{EngineConfig, RetryPolicy};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CLUSTEROPS_DIR: &str = ".clusterops";
pub const CONFIG_FILE: &str = "config.toml";
const DEFAULT_DB_NAME: &str = "clusterops.db";

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub agent: AgentSettings,
    pub kubernetes: KubernetesSettings,
    pub engine: EngineSettings,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite URL; defaults to a database next to the config file
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub service_url: String,
    pub token: String,
    pub default_port: u16,
    pub insecure: bool,
    pub request_timeout_secs: u64,
    pub https_proxy: Option<String>,
    pub no_proxy: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            service_url: format!("https://127.0.0.1:{}", DEFAULT_AGENT_PORT),
            token: String::new(),
            default_port: DEFAULT_AGENT_PORT,
            insecure: false,
            request_timeout_secs: 30,
            https_proxy: None,
            no_proxy: Vec::new(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSettings {
    pub api_server: Option<String>,
    pub token: Option<String>,
    pub insecure: bool,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_concurrent_phases: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_phases: 8,
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl Settings {
    /// Reads `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        if !path.exists() {
            return Ok((Self::default(), path));
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok((settings, path))
    }

    /// Database URL, falling back to a file beside `config_path`.
    pub fn database_url(&self, config_path: &Path) -> String {
        match &self.database.url {
            Some(url) => url.clone(),
            None => {
                let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
                format!("sqlite:{}", dir.join(DEFAULT_DB_NAME).display())
            }
        }
    }

    pub fn pool_config(&self) -> db::PoolConfig {
        db::PoolConfig::default().with_max_connections(self.database.max_connections)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.engine.max_attempts)
            .with_initial_backoff(Duration::from_millis(self.engine.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.engine.max_backoff_ms))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_max_concurrent_phases(self.engine.max_concurrent_phases)
            .with_retry(self.retry_policy())
    }

    fn proxy(&self) -> ProxyConfig {
        let mut proxy = ProxyConfig::from_env();
        if let Some(url) = &self.agent.https_proxy {
            proxy = proxy.with_https_proxy(url.clone());
        }
        for host in &self.agent.no_proxy {
            proxy = proxy.with_no_proxy(host.clone());
        }
        proxy
    }

    pub fn agent_config(&self) -> AgentClientConfig {
        AgentClientConfig::new(
            self.agent.service_url.clone(),
            SecretString::from(self.agent.token.clone()),
        )
        .with_default_port(self.agent.default_port)
        .with_insecure(self.agent.insecure)
        .with_proxy(self.proxy())
        .with_request_timeout(Duration::from_secs(self.agent.request_timeout_secs))
        .with_retry(self.retry_policy())
    }

    pub fn kube_config(&self) -> (KubeConfig, Option<SecretString>) {
        let config = KubeConfig {
            api_server: self.kubernetes.api_server.clone(),
            insecure: self.kubernetes.insecure,
            proxy: self.proxy(),
        };
        let token = self.kubernetes.token.clone().map(SecretString::from);
        (config, token)
    }
}

fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine the home directory")?;
    Ok(home.join(CLUSTEROPS_DIR).join(CONFIG_FILE))
}
