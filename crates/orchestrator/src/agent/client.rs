use async_trait::async_trait;
use clusterops_core::PhaseData;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{AgentClientConfig, ProxyConfig};
use super::credentials::{agent_url, Credentials};
use super::watch::WatchEvent;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteAction {
    PreCheck,
    Execute,
    Rollback,
    PostCheck,
}

impl RemoteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCheck => "pre_check",
            Self::Execute => "execute",
            Self::Rollback => "rollback",
            Self::PostCheck => "post_check",
        }
    }
}

impl std::fmt::Display for RemoteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a phase to run on a node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePhaseRequest {
    pub operation_id: Uuid,
    pub phase_id: String,
    pub action: RemoteAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PhaseData>,
}

/// Authenticated connection to a single node agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn peer(&self) -> &str;

    async fn run_phase(&self, request: &RemotePhaseRequest) -> Result<()>;

    /// Stream of connection state for this agent.
    async fn watch(&self) -> Result<mpsc::Receiver<WatchEvent>>;
}

#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, peer: &str, credentials: &Credentials) -> Result<Arc<dyn AgentClient>>;
}

/// Connects to agents over HTTPS.
pub struct HttpAgentConnector {
    default_port: u16,
    proxy: ProxyConfig,
    connect_timeout: Duration,
}

impl HttpAgentConnector {
    pub fn new(config: &AgentClientConfig) -> Self {
        Self {
            default_port: config.default_port,
            proxy: config.proxy.clone(),
            connect_timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl AgentConnector for HttpAgentConnector {
    async fn connect(&self, peer: &str, credentials: &Credentials) -> Result<Arc<dyn AgentClient>> {
        let base_url = agent_url(peer, self.default_port)?;

        // No overall timeout: phase calls and the watch stream are long-lived.
        let mut builder = reqwest::Client::builder().connect_timeout(self.connect_timeout);
        if let Some(pem) = &credentials.ca_cert {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem.as_bytes())?);
        }
        let http = self.proxy.apply(builder)?.build()?;

        let client = HttpAgentClient {
            peer: peer.to_string(),
            base_url,
            http,
            token: SecretString::from(credentials.token.expose_secret().to_string()),
        };
        client.ping().await?;

        info!(peer = %peer, "Connected to agent");
        Ok(Arc::new(client))
    }
}

pub struct HttpAgentClient {
    peer: String,
    base_url: String,
    http: reqwest::Client,
    token: SecretString,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct WatchPayload {
    #[serde(default)]
    peer: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpAgentClient {
    async fn ping(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/v1/health", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        self.check(response).await.map(|_| ())
    }

    fn connection_error(&self, err: reqwest::Error) -> OrchestratorError {
        if err.is_connect() || err.is_timeout() {
            OrchestratorError::ConnectionProblem {
                peer: self.peer.clone(),
                message: err.to_string(),
                source: Some(Box::new(OrchestratorError::Http(err))),
            }
        } else {
            OrchestratorError::Http(err)
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(OrchestratorError::AccessDenied(format!(
                "peer not authorized: agent {} answered {}",
                self.peer, status
            )));
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| body.trim().to_string());
        Err(OrchestratorError::Remote(if message.is_empty() {
            format!("agent {} answered {}", self.peer, status)
        } else {
            message
        }))
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn run_phase(&self, request: &RemotePhaseRequest) -> Result<()> {
        debug!(
            peer = %self.peer,
            phase = %request.phase_id,
            action = %request.action,
            "Sending phase request"
        );
        let response = self
            .http
            .post(format!("{}/v1/phases/{}", self.base_url, request.action))
            .bearer_auth(self.token.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        self.check(response).await?;
        Ok(())
    }

    async fn watch(&self) -> Result<mpsc::Receiver<WatchEvent>> {
        let response = self
            .http
            .get(format!("{}/v1/watch", self.base_url))
            .header("Accept", "text/event-stream")
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;
        let response = self.check(response).await?;

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(forward_watch_events(
            response.bytes_stream().eventsource(),
            tx,
            self.peer.clone(),
        ));

        Ok(rx)
    }
}

/// Turns agent watch events into [`WatchEvent`]s until the stream ends or
/// the receiver goes away. A closed stream is reported as a failure.
async fn forward_watch_events<S, E>(stream: S, tx: mpsc::Sender<WatchEvent>, peer: String)
where
    S: Stream<Item = std::result::Result<eventsource_stream::Event, E>>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        let item = tokio::select! {
            _ = tx.closed() => {
                debug!(peer = %peer, "Watch receiver dropped");
                return;
            }
            item = stream.next() => item,
        };
        let Some(item) = item else { break };

        let event = match item {
            Ok(event) => match serde_json::from_str::<WatchPayload>(&event.data) {
                Ok(payload) => {
                    let from = payload.peer.unwrap_or_else(|| peer.clone());
                    match payload.error {
                        Some(message) => WatchEvent::failed(
                            from.clone(),
                            OrchestratorError::connection_problem(from, message),
                        ),
                        None => WatchEvent::heartbeat(from),
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Ignoring malformed watch event");
                    continue;
                }
            },
            Err(e) => {
                let _ = tx
                    .send(WatchEvent::failed(
                        peer.clone(),
                        OrchestratorError::connection_problem(peer.clone(), e.to_string()),
                    ))
                    .await;
                return;
            }
        };
        if tx.send(event).await.is_err() {
            debug!(peer = %peer, "Watch receiver dropped");
            return;
        }
    }

    let _ = tx
        .send(WatchEvent::failed(
            peer.clone(),
            OrchestratorError::connection_problem(peer, "watch stream closed"),
        ))
        .await;
}
