//! Remote agent coordination.
//!
//! - [`AgentCoordinator`] - Connects to node agents and watches the connection
//! - [`RemoteExecutor`] - Runs phase steps on a node's agent
//! - [`watch_reconnects`] - Cancels a scope on the first broken connection

mod client;
mod config;
mod coordinator;
mod credentials;
mod remote;
mod watch;

pub use client::{
    AgentClient, AgentConnector, HttpAgentClient, HttpAgentConnector, RemoteAction,
    RemotePhaseRequest,
};
pub use config::{AgentClientConfig, ProxyConfig, DEFAULT_AGENT_PORT};
pub use coordinator::AgentCoordinator;
pub use credentials::{agent_url, load_credentials, Credentials};
pub use remote::{remote_factory, RemoteExecutor};
pub use watch::{watch_reconnects, WatchEvent};
