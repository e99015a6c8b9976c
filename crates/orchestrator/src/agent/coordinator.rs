use events::{Event, EventBus};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::client::{AgentClient, AgentConnector, HttpAgentConnector};
use super::config::AgentClientConfig;
use super::credentials::{load_credentials, Credentials};
use super::watch::watch_reconnects;
use crate::classify::should_reconnect_peer;
use crate::error::Result;
use crate::retry::with_retry;

/// Establishes agent connections for remote phases.
///
/// Every call builds its own connection; nothing is cached between phases.
pub struct AgentCoordinator {
    config: AgentClientConfig,
    http: reqwest::Client,
    connector: Arc<dyn AgentConnector>,
    event_bus: Option<EventBus>,
}

impl AgentCoordinator {
    pub fn new(config: AgentClientConfig) -> Result<Self> {
        let http = config.http_client()?;
        let connector = Arc::new(HttpAgentConnector::new(&config));
        Ok(Self {
            config,
            http,
            connector,
            event_bus: None,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn AgentConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &AgentClientConfig {
        &self.config
    }

    pub async fn load_credentials(&self, cancel: &CancellationToken) -> Result<Credentials> {
        load_credentials(
            &self.http,
            cancel,
            &self.config.service_url,
            &self.config.token,
            self.config.default_port,
        )
        .await
    }

    /// Connects to the agent at `peer`, retrying with the configured backoff
    /// until an error shows reconnecting cannot help.
    pub async fn connect(
        &self,
        peer: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn AgentClient>> {
        let name = format!("connect to {}", peer);
        with_retry(
            &self.config.retry,
            cancel,
            &name,
            move |attempt| async move {
                debug!(peer = %peer, attempt, "Connecting to agent");
                let credentials = self
                    .load_credentials(cancel)
                    .await
                    .map_err(should_reconnect_peer)?;
                self.connector
                    .connect(peer, &credentials)
                    .await
                    .map_err(should_reconnect_peer)
            },
            |_, _| {},
        )
        .await
    }

    /// Watches `client` and cancels `scope` when its connection breaks.
    pub async fn watch(
        &self,
        client: &dyn AgentClient,
        scope: CancellationToken,
        operation_id: Option<Uuid>,
    ) -> Result<JoinHandle<()>> {
        let events = client.watch().await?;
        let peer = client.peer().to_string();
        let event_bus = self.event_bus.clone();
        let target = scope.clone();

        Ok(watch_reconnects(
            scope,
            move || {
                if let Some(bus) = event_bus {
                    bus.emit(Event::PeerDisconnected { peer, operation_id });
                }
                target.cancel();
            },
            events,
        ))
    }
}
