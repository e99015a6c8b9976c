//! Phase id to executor routing.
//!
//! The resolver is an ordered table of `(matcher, factory)` routes checked
//! top to bottom; the first route that matches builds the executor.

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::{ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};

pub type ExecutorFactory =
    Arc<dyn Fn(&ExecutorParams) -> Result<Box<dyn PhaseExecutor>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseMatcher {
    Exact(String),
    /// Matches the id itself and anything nested beneath it
    Prefix(String),
}

impl PhaseMatcher {
    pub fn exact(id: impl AsRef<str>) -> Self {
        Self::Exact(normalize(id.as_ref()).to_string())
    }

    pub fn prefix(prefix: impl AsRef<str>) -> Self {
        Self::Prefix(normalize(prefix.as_ref()).to_string())
    }

    pub fn matches(&self, phase_id: &str) -> bool {
        let id = normalize(phase_id);
        match self {
            Self::Exact(exact) => id == exact,
            Self::Prefix(prefix) => match id.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('.'),
                None => false,
            },
        }
    }
}

impl fmt::Display for PhaseMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(id) => write!(f, "{}", id),
            Self::Prefix(prefix) => write!(f, "{}/*", prefix),
        }
    }
}

fn normalize(id: &str) -> &str {
    id.strip_prefix('/').unwrap_or(id)
}

struct Route {
    matcher: PhaseMatcher,
    factory: ExecutorFactory,
}

#[derive(Default)]
pub struct DispatchResolver {
    routes: Vec<Route>,
}

impl DispatchResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, matcher: PhaseMatcher, factory: ExecutorFactory) -> Self {
        self.routes.push(Route { matcher, factory });
        self
    }

    pub fn exact<F>(self, id: &str, factory: F) -> Self
    where
        F: Fn(&ExecutorParams) -> Result<Box<dyn PhaseExecutor>> + Send + Sync + 'static,
    {
        self.route(PhaseMatcher::exact(id), Arc::new(factory))
    }

    pub fn prefix<F>(self, prefix: &str, factory: F) -> Self
    where
        F: Fn(&ExecutorParams) -> Result<Box<dyn PhaseExecutor>> + Send + Sync + 'static,
    {
        self.route(PhaseMatcher::prefix(prefix), Arc::new(factory))
    }

    /// Appends every route of `other` after the existing ones.
    pub fn extend(mut self, other: DispatchResolver) -> Self {
        self.routes.extend(other.routes);
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// The first matcher that accepts `phase_id`.
    pub fn route_for(&self, phase_id: &str) -> Result<&PhaseMatcher> {
        self.find(phase_id).map(|route| &route.matcher)
    }

    /// Builds the executor for `params.phase`.
    ///
    /// A factory error is reported as [`OrchestratorError::ClientUnavailable`]
    /// for that phase.
    pub fn resolve(&self, params: &ExecutorParams) -> Result<Box<dyn PhaseExecutor>> {
        let route = self.find(&params.phase.id)?;
        debug!(phase = %params.phase.id, route = %route.matcher, "Resolved phase executor");
        (route.factory)(params).map_err(|e| OrchestratorError::ClientUnavailable {
            phase: params.phase.id.clone(),
            source: Box::new(e),
        })
    }

    fn find(&self, phase_id: &str) -> Result<&Route> {
        self.routes
            .iter()
            .find(|route| route.matcher.matches(phase_id))
            .ok_or_else(|| OrchestratorError::UnknownPhase(phase_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ErrorKind};
    use crate::core::ExecContext;
    use async_trait::async_trait;
    use clusterops_core::{OperationKind, Phase, Plan};

    struct Tagged(&'static str);

    #[async_trait]
    impl PhaseExecutor for Tagged {
        async fn execute(&self, _ctx: &ExecContext) -> Result<()> {
            Err(OrchestratorError::ExecutionFailed(self.0.to_string()))
        }
    }

    fn tagged(tag: &'static str) -> impl Fn(&ExecutorParams) -> Result<Box<dyn PhaseExecutor>> {
        move |_| Ok(Box::new(Tagged(tag)) as Box<dyn PhaseExecutor>)
    }

    fn params(id: &str) -> ExecutorParams {
        let plan = Plan::new(OperationKind::Install, "example.com")
            .with_phases(vec![Phase::new(id, "test phase")]);
        ExecutorParams::new(std::sync::Arc::new(plan), id).unwrap()
    }

    async fn tag_of(executor: Box<dyn PhaseExecutor>) -> String {
        let ctx = ExecContext::new(uuid::Uuid::new_v4(), "/x", Default::default());
        match executor.execute(&ctx).await {
            Err(OrchestratorError::ExecutionFailed(tag)) => tag,
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_prefix_matching() {
        let matcher = PhaseMatcher::prefix("masters");
        assert!(matcher.matches("masters"));
        assert!(matcher.matches("/masters/1"));
        assert!(matcher.matches("masters.node-1"));
        assert!(!matcher.matches("mastersfoo"));
        assert!(!matcher.matches("/nodes/1"));

        let exact = PhaseMatcher::exact("/checks");
        assert!(exact.matches("checks"));
        assert!(!exact.matches("/checks/1"));
    }

    #[tokio::test]
    async fn test_resolve_routes_by_prefix() {
        let resolver = DispatchResolver::new()
            .exact("checks", tagged("checks"))
            .prefix("masters", tagged("masters"))
            .prefix("nodes", tagged("nodes"));

        for (id, expected) in [
            ("/masters/1", "masters"),
            ("/masters/2", "masters"),
            ("/nodes/1", "nodes"),
            ("/checks", "checks"),
        ] {
            let executor = resolver.resolve(&params(id)).unwrap();
            assert_eq!(tag_of(executor).await, expected);
        }
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let resolver = DispatchResolver::new()
            .exact("/masters/1", tagged("special"))
            .prefix("masters", tagged("masters"));

        assert_eq!(tag_of(resolver.resolve(&params("/masters/1")).unwrap()).await, "special");
        assert_eq!(tag_of(resolver.resolve(&params("/masters/2")).unwrap()).await, "masters");
    }

    #[test]
    fn test_unknown_phase_is_fatal() {
        let resolver = DispatchResolver::new().prefix("masters", tagged("masters"));

        let err = resolver.resolve(&params("/bogus/1")).err().unwrap();
        assert!(matches!(err, OrchestratorError::UnknownPhase(ref id) if id == "/bogus/1"));
        assert_eq!(classify(&err), ErrorKind::FatalConfiguration);
        assert!(resolver.route_for("/bogus/1").is_err());
    }

    #[test]
    fn test_factory_failure_is_wrapped() {
        let resolver = DispatchResolver::new().exact("openebs", |_: &ExecutorParams| {
            Err(OrchestratorError::connection_problem("10.0.0.1:6443", "connection refused"))
        });

        let err = resolver.resolve(&params("/openebs")).err().unwrap();
        match &err {
            OrchestratorError::ClientUnavailable { phase, .. } => assert_eq!(phase, "/openebs"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(classify(&err), ErrorKind::TransientNetwork);
    }
}
