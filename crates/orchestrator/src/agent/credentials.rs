use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

const CREDENTIALS_PATH: &str = "/v1/credentials/rpc";

/// Material used to authenticate to a node agent. Never persisted.
#[derive(Debug)]
pub struct Credentials {
    /// Service the credentials were issued by
    pub server_url: String,
    /// PEM bundle the agent's certificate chains to
    pub ca_cert: Option<String>,
    pub token: SecretString,
}

#[derive(Deserialize)]
struct CredentialsResponse {
    #[serde(default)]
    ca_cert: Option<String>,
    token: String,
}

/// Turns an agent or service address into a base URL.
///
/// Anything that mentions `http` is taken as a complete URL; a bare host
/// becomes `https://host:default_port`.
pub fn agent_url(address: &str, default_port: u16) -> Result<String> {
    let address = address.trim();
    if address.is_empty() {
        return Err(OrchestratorError::BadParameter(
            "agent address is empty".to_string(),
        ));
    }
    if address.contains("http") {
        return Ok(address.trim_end_matches('/').to_string());
    }

    if let Some(rest) = address.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, "")) => Ok(format!("https://[{}]:{}", host, default_port)),
            Some((host, port)) => {
                let port = parse_port(address, port.trim_start_matches(':'))?;
                Ok(format!("https://[{}]:{}", host, port))
            }
            None => Err(OrchestratorError::BadParameter(format!(
                "invalid agent address {:?}",
                address
            ))),
        };
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = parse_port(address, port)?;
            Ok(format!("https://{}:{}", host, port))
        }
        Some(_) => Ok(format!("https://[{}]:{}", address, default_port)),
        None => Ok(format!("https://{}:{}", address, default_port)),
    }
}

fn parse_port(address: &str, port: &str) -> Result<u16> {
    port.parse().map_err(|_| {
        OrchestratorError::BadParameter(format!("invalid port in agent address {:?}", address))
    })
}

/// Fetches agent credentials from the cluster service with bearer `token`.
pub async fn load_credentials(
    http: &reqwest::Client,
    cancel: &CancellationToken,
    address: &str,
    token: &SecretString,
    default_port: u16,
) -> Result<Credentials> {
    let server_url = agent_url(address, default_port)?;
    let url = format!("{}{}", server_url, CREDENTIALS_PATH);
    debug!(url = %url, "Loading agent credentials");

    let request = http.get(&url).bearer_auth(token.expose_secret()).send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
        response = request => response?,
    };

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(OrchestratorError::AccessDenied(format!(
            "{} rejected the credentials request ({})",
            server_url, status
        )));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OrchestratorError::Remote(format!(
            "credentials request to {} failed with {}: {}",
            server_url,
            status,
            body.trim()
        )));
    }

    let body: CredentialsResponse = response.json().await?;
    Ok(Credentials {
        server_url,
        ca_cert: body.ca_cert.filter(|pem| !pem.trim().is_empty()),
        token: SecretString::from(body.token),
    })
}
