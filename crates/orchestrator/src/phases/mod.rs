//! Built-in phase executors and the install routing table.

mod openebs;

pub use openebs::{current_persistent_storage, OpenEbsPhase};

use std::sync::Arc;

use crate::agent::{remote_factory, AgentCoordinator};
use crate::core::PhaseExecutor;
use crate::dispatch::DispatchResolver;
use crate::kube::ClusterClientFactory;

pub const OPENEBS_PHASE: &str = "openebs";
pub const MASTERS_PHASE: &str = "masters";
pub const NODES_PHASE: &str = "nodes";

/// Dependencies of the install routing table.
pub struct InstallConfig {
    pub coordinator: Arc<AgentCoordinator>,
    pub clients: Arc<dyn ClusterClientFactory>,
    /// Routes checked before the built-in ones
    pub routes: DispatchResolver,
}

impl InstallConfig {
    pub fn new(coordinator: Arc<AgentCoordinator>, clients: Arc<dyn ClusterClientFactory>) -> Self {
        Self {
            coordinator,
            clients,
            routes: DispatchResolver::new(),
        }
    }

    pub fn with_routes(mut self, routes: DispatchResolver) -> Self {
        self.routes = routes;
        self
    }
}

/// Routing table for install operations.
pub fn install_resolver(config: InstallConfig) -> DispatchResolver {
    let InstallConfig {
        coordinator,
        clients,
        routes,
    } = config;

    routes
        .exact(OPENEBS_PHASE, move |params| {
            let client = clients.client(&params.plan)?;
            Ok(Box::new(OpenEbsPhase::new(params, client)) as Box<dyn PhaseExecutor>)
        })
        .prefix(MASTERS_PHASE, remote_factory(Arc::clone(&coordinator)))
        .prefix(NODES_PHASE, remote_factory(coordinator))
}
