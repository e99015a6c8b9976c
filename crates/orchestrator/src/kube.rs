//! Minimal Kubernetes API client used by built-in phases.

use async_trait::async_trait;
use clusterops_core::{ConfigMap, Plan};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::agent::ProxyConfig;
use crate::error::{OrchestratorError, Result};

const DEFAULT_API_PORT: u16 = 6443;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_namespace(&self, name: &str) -> Result<()>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Builds a cluster client for the plan being executed.
pub trait ClusterClientFactory: Send + Sync {
    fn client(&self, plan: &Plan) -> Result<Arc<dyn ClusterClient>>;
}

#[derive(Debug, Clone, Default)]
pub struct KubeConfig {
    /// API server URL; when unset the address is derived from the plan's
    /// DNS configuration
    pub api_server: Option<String>,
    pub insecure: bool,
    pub proxy: ProxyConfig,
}

pub struct HttpClusterClientFactory {
    config: KubeConfig,
    token: Option<Arc<SecretString>>,
}

impl HttpClusterClientFactory {
    pub fn new(config: KubeConfig, token: Option<SecretString>) -> Self {
        Self {
            config,
            token: token.map(Arc::new),
        }
    }

    fn api_server(&self, plan: &Plan) -> Result<String> {
        if let Some(url) = &self.config.api_server {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let host = plan.dns_config.addrs.first().ok_or_else(|| {
            OrchestratorError::BadParameter(format!(
                "no API server configured and plan {} has no DNS address",
                plan.operation_id
            ))
        })?;
        Ok(format!("https://{}:{}", host, DEFAULT_API_PORT))
    }
}

impl ClusterClientFactory for HttpClusterClientFactory {
    fn client(&self, plan: &Plan) -> Result<Arc<dyn ClusterClient>> {
        let base_url = self.api_server(plan)?;
        let builder = reqwest::Client::builder().danger_accept_invalid_certs(self.config.insecure);
        let http = self.config.proxy.apply(builder)?.build()?;
        Ok(Arc::new(HttpClusterClient {
            http,
            base_url,
            token: self.token.clone(),
        }))
    }
}

/// Talks to the Kubernetes REST API directly.
pub struct HttpClusterClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<Arc<SecretString>>,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

impl HttpClusterClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.map(Arc::new),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Status>(&body)
            .map(|s| s.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| describe(status, &body));
        Err(OrchestratorError::Kubernetes {
            status: status.as_u16(),
            message,
        })
    }
}

fn describe(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        body.to_string()
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn create_namespace(&self, name: &str) -> Result<()> {
        debug!(namespace = name, "Creating namespace");
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
        });
        self.send(self.request(Method::POST, "/api/v1/namespaces").json(&body))
            .await?;
        Ok(())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = &config_map.metadata.namespace;
        debug!(namespace = %namespace, name = %config_map.metadata.name, "Creating config map");
        let path = format!("/api/v1/namespaces/{}/configmaps", namespace);
        self.send(self.request(Method::POST, &path).json(config_map))
            .await?;
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let path = format!("/api/v1/namespaces/{}/configmaps/{}", namespace, name);
        let response = self.send(self.request(Method::GET, &path)).await?;
        Ok(response.json().await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(namespace = namespace, name = name, "Deleting config map");
        let path = format!("/api/v1/namespaces/{}/configmaps/{}", namespace, name);
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }
}
