use async_trait::async_trait;
use clusterops_core::{
    NdmConfig, PersistentStorage, NDM_CONFIG_MAP, OPENEBS_NAMESPACE,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};
use crate::kube::ClusterClient;

/// Writes the OpenEBS node disk manager configuration into the cluster.
pub struct OpenEbsPhase {
    phase_id: String,
    storage: Option<PersistentStorage>,
    client: Arc<dyn ClusterClient>,
}

impl OpenEbsPhase {
    pub fn new(params: &ExecutorParams, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            phase_id: params.phase.id.clone(),
            storage: params
                .phase
                .data
                .as_ref()
                .and_then(|d| d.persistent_storage.clone()),
            client,
        }
    }

    fn ndm_config(&self) -> NdmConfig {
        let mut config = NdmConfig::default();
        if let Some(storage) = &self.storage {
            let mut storage = storage.clone();
            storage.check_and_set_defaults();
            config.apply(&storage);
        }
        config
    }
}

#[async_trait]
impl PhaseExecutor for OpenEbsPhase {
    async fn execute(&self, ctx: &ExecContext) -> Result<()> {
        info!(phase = %self.phase_id, "Creating OpenEBS configuration.");
        let config_map = self.ndm_config().to_config_map()?;

        ctx.run(self.client.create_namespace(OPENEBS_NAMESPACE))
            .await
            .or_else(already_exists)?;
        ctx.run(self.client.create_config_map(&config_map))
            .await
            .or_else(already_exists)
    }

    /// Reads the configuration back. A config map left by an earlier run is
    /// kept as is, so differing settings are only reported.
    async fn post_check(&self, ctx: &ExecContext) -> Result<()> {
        let stored = ctx
            .run(current_persistent_storage(self.client.as_ref()))
            .await?;
        let wanted = PersistentStorage::from_ndm_config(&self.ndm_config());
        if stored != wanted {
            warn!(
                phase = %self.phase_id,
                device_excludes = ?stored.device_excludes(),
                "Existing OpenEBS configuration differs from the requested one"
            );
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &ExecContext) -> Result<()> {
        info!(phase = %self.phase_id, "Deleting OpenEBS configuration.");
        match ctx
            .run(self.client.delete_config_map(OPENEBS_NAMESPACE, NDM_CONFIG_MAP))
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Reads the persistent storage settings currently stored in the cluster.
pub async fn current_persistent_storage(client: &dyn ClusterClient) -> Result<PersistentStorage> {
    let config_map = client
        .get_config_map(OPENEBS_NAMESPACE, NDM_CONFIG_MAP)
        .await?;
    let config = NdmConfig::from_config_map(&config_map)?;
    Ok(PersistentStorage::from_ndm_config(&config))
}

fn already_exists(err: OrchestratorError) -> Result<()> {
    if err.is_already_exists() {
        debug!(error = %err, "Resource already exists");
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterops_core::{
        ConfigMap, OperationKind, Phase, PhaseData, PersistentStorageSpec, Plan, NDM_CONFIG_KEY,
    };
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeCluster {
        namespaces: Mutex<Vec<String>>,
        config_maps: Mutex<HashMap<(String, String), ConfigMap>>,
    }

    fn status(code: u16, message: &str) -> OrchestratorError {
        OrchestratorError::Kubernetes {
            status: code,
            message: message.to_string(),
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn create_namespace(&self, name: &str) -> Result<()> {
            let mut namespaces = self.namespaces.lock().await;
            if namespaces.iter().any(|n| n == name) {
                return Err(status(409, "namespace already exists"));
            }
            namespaces.push(name.to_string());
            Ok(())
        }

        async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
            let key = (
                config_map.metadata.namespace.clone(),
                config_map.metadata.name.clone(),
            );
            let mut maps = self.config_maps.lock().await;
            if maps.contains_key(&key) {
                return Err(status(409, "config map already exists"));
            }
            maps.insert(key, config_map.clone());
            Ok(())
        }

        async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
            self.config_maps
                .lock()
                .await
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| status(404, "config map not found"))
        }

        async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
            self.config_maps
                .lock()
                .await
                .remove(&(namespace.to_string(), name.to_string()))
                .map(|_| ())
                .ok_or_else(|| status(404, "config map not found"))
        }
    }

    fn params(storage: Option<PersistentStorage>) -> ExecutorParams {
        let phase = Phase::new("/openebs", "Configure OpenEBS").with_data(PhaseData {
            persistent_storage: storage,
            ..Default::default()
        });
        let plan = Plan::new(OperationKind::Install, "example.com").with_phases(vec![phase]);
        ExecutorParams::new(Arc::new(plan), "/openebs").unwrap()
    }

    fn ctx() -> ExecContext {
        ExecContext::new(uuid::Uuid::new_v4(), "/openebs", CancellationToken::new())
    }

    #[tokio::test]
    async fn test_execute_writes_ndm_config() {
        let cluster = Arc::new(FakeCluster::default());
        let mut storage = PersistentStorage::new(PersistentStorageSpec::default());
        storage.spec.openebs.filters.devices.exclude = vec!["/dev/sdz".to_string()];
        let phase = OpenEbsPhase::new(&params(Some(storage)), cluster.clone());

        phase.execute(&ctx()).await.unwrap();
        // Running again is harmless.
        phase.execute(&ctx()).await.unwrap();

        assert_eq!(*cluster.namespaces.lock().await, vec!["openebs".to_string()]);
        let map = cluster
            .get_config_map(OPENEBS_NAMESPACE, NDM_CONFIG_MAP)
            .await
            .unwrap();
        assert!(map.data.contains_key(NDM_CONFIG_KEY));

        let stored = current_persistent_storage(cluster.as_ref()).await.unwrap();
        assert_eq!(stored.device_excludes(), ["/dev/sdz".to_string()]);
    }

    #[tokio::test]
    async fn test_post_check_reads_back_configuration() {
        let cluster = Arc::new(FakeCluster::default());
        let phase = OpenEbsPhase::new(&params(None), cluster.clone());

        let err = phase.post_check(&ctx()).await.unwrap_err();
        assert!(err.is_not_found());

        phase.execute(&ctx()).await.unwrap();
        phase.post_check(&ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_tolerates_missing_config_map() {
        let cluster = Arc::new(FakeCluster::default());
        let phase = OpenEbsPhase::new(&params(None), cluster.clone());

        phase.execute(&ctx()).await.unwrap();
        phase.rollback(&ctx()).await.unwrap();
        assert!(cluster.config_maps.lock().await.is_empty());

        phase.rollback(&ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_cancelled() {
        let cluster = Arc::new(FakeCluster::default());
        let phase = OpenEbsPhase::new(&params(None), cluster);
        let ctx = ctx();
        ctx.token().cancel();

        let err = phase.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}
