// backuptool/src/backup/mod.rs
//! Backup orchestration core shared by the backup, restore and stanza
//! workflows.

mod logic;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cluster::{ClusterManager, LeaderConfig, StatusReporter, UnitIdentity, keys};
use crate::engine::BackupEngine;
use crate::errors::{BackupError, Result};
use crate::s3::{ObjectStorage, S3Parameters, S3Source};
use crate::utils::retry::RetryPolicy;

/// Filesystem locations the workflows operate on.
#[derive(Debug, Clone)]
pub struct BackupPaths {
    pub data_directory: PathBuf,
    pub engine_config_file: PathBuf,
    pub engine_log_path: PathBuf,
}

/// Outcome of one completed backup run.
#[derive(Debug, Clone)]
pub struct BackupRunResult {
    pub backup_id: String,
    pub stdout: String,
    pub stderr: String,
    /// Repository path the combined engine output was uploaded to.
    pub log_location: String,
}

/// Coordinates backup and restore of the database cluster through the
/// backup engine and the S3 repository.
pub struct BackupManager {
    pub(crate) engine: BackupEngine,
    pub(crate) storage: Arc<dyn ObjectStorage>,
    pub(crate) cluster: Arc<dyn ClusterManager>,
    pub(crate) config: Arc<dyn LeaderConfig>,
    pub(crate) status: Arc<dyn StatusReporter>,
    pub(crate) s3_source: Arc<dyn S3Source>,
    pub(crate) identity: UnitIdentity,
    pub(crate) paths: BackupPaths,
    pub(crate) stanza_check_policy: RetryPolicy,
}

impl BackupManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: BackupEngine,
        storage: Arc<dyn ObjectStorage>,
        cluster: Arc<dyn ClusterManager>,
        config: Arc<dyn LeaderConfig>,
        status: Arc<dyn StatusReporter>,
        s3_source: Arc<dyn S3Source>,
        identity: UnitIdentity,
        paths: BackupPaths,
    ) -> Self {
        Self {
            engine,
            storage,
            cluster,
            config,
            status,
            s3_source,
            identity,
            paths,
            stanza_check_policy: RetryPolicy::new(5, Duration::from_secs(3)),
        }
    }

    /// Stanza name owned by this cluster.
    pub fn stanza_name(&self) -> String {
        self.identity.stanza_name()
    }

    /// The stanza recorded in the replicated store, if any.
    pub(crate) fn recorded_stanza(&self) -> Option<String> {
        self.config
            .get(keys::STANZA)
            .filter(|stanza| !stanza.is_empty())
    }

    pub(crate) fn stanza_registered(&self) -> bool {
        self.recorded_stanza().is_some()
    }

    /// Derives the S3 parameters fresh from the settings source; the
    /// source is the single point of truth and can change between calls.
    pub(crate) fn retrieve_s3_parameters(&self) -> Result<S3Parameters> {
        let info = self.s3_source.connection_info().ok_or_else(|| {
            BackupError::Validation(
                "S3 settings are missing, cannot create/restore backup".to_string(),
            )
        })?;
        S3Parameters::from_connection_info(&info).map_err(BackupError::ConfigIncomplete)
    }

    /// Renders the engine's repository configuration file from the
    /// current S3 parameters and cluster topology.
    pub(crate) async fn render_engine_config(&self) -> Result<()> {
        let parameters = self.retrieve_s3_parameters()?;
        let tls_enabled = self.config.get(keys::TLS).is_some();
        let peers = self.cluster.peer_addresses().await;
        let stanza = self
            .recorded_stanza()
            .unwrap_or_else(|| self.stanza_name());

        let mut content = String::new();
        content.push_str("[global]\n");
        content.push_str(&format!(
            "log-path={}\n",
            self.paths.engine_log_path.display()
        ));
        content.push_str("repo1-retention-full=9999999\n");
        content.push_str("repo1-type=s3\n");
        content.push_str(&format!("repo1-path={}\n", parameters.path));
        content.push_str(&format!("repo1-s3-bucket={}\n", parameters.bucket));
        content.push_str(&format!("repo1-s3-endpoint={}\n", parameters.endpoint));
        if let Some(region) = &parameters.region {
            content.push_str(&format!("repo1-s3-region={region}\n"));
        }
        content.push_str(&format!("repo1-s3-uri-style={}\n", parameters.uri_style));
        content.push_str(&format!("repo1-s3-key={}\n", parameters.access_key));
        content.push_str(&format!("repo1-s3-key-secret={}\n", parameters.secret_key));
        if tls_enabled && !peers.is_empty() {
            content.push_str("backup-standby=y\ntls-server-address=*\n");
        }
        content.push_str(&format!("\n[{stanza}]\n"));
        content.push_str(&format!(
            "pg1-path={}\n",
            self.paths.data_directory.display()
        ));
        if tls_enabled {
            for (index, peer) in peers.iter().enumerate() {
                content.push_str(&format!("pg{}-host={}\n", index + 2, peer));
            }
        }

        self.cluster
            .render_config_file(&self.paths.engine_config_file, &content, 0o644)
    }

    /// Pushes fresh configuration: re-render the engine config and ask the
    /// cluster manager to pick it up when the member is running.
    pub(crate) async fn update_config(&self) -> Result<()> {
        if let Err(err) = self.render_engine_config().await {
            debug!("cannot render the backup engine configuration: {err}");
        }
        if self.cluster.member_started().await {
            self.cluster.reload_configuration().await?;
        }
        Ok(())
    }

    /// Starts or stops the engine's TLS server service according to the
    /// cluster topology.
    pub async fn start_stop_backup_server(&self) -> bool {
        // Nothing to manage while the backup settings aren't ok.
        if self.retrieve_s3_parameters().is_err() {
            return true;
        }
        if let Err(err) = self.render_engine_config().await {
            warn!("cannot update the backup server configuration: {err}");
            return false;
        }

        let tls_enabled = self.config.get(keys::TLS).is_some();
        let peers = self.cluster.peer_addresses().await;
        if !tls_enabled || peers.is_empty() {
            self.cluster.stop_backup_server().await;
            return true;
        }

        let is_primary = self
            .cluster
            .primary_unit()
            .await
            .is_some_and(|primary| primary == self.identity.unit_name);
        if !is_primary {
            // The replica server is useless until the primary's answers.
            let Some(endpoint) = self.cluster.primary_endpoint().await else {
                warn!("failed to contact the backup TLS server: no primary endpoint");
                return false;
            };
            if !self.engine.server_reachable(&endpoint).await {
                return false;
            }
        }
        self.cluster.restart_backup_server().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::fs;
    use std::path::Path;

    use crate::cluster::testing::{MemoryClusterConfig, MemoryStatusReporter, MockClusterManager};
    use crate::engine::runner::CommandRunner;
    use crate::engine::runner::testing::{ScriptedResponse, ScriptedRunner};
    use crate::s3::testing::{MemoryStorage, StaticS3Source};

    pub(crate) const TEST_UNIT: &str = "database-0";

    /// A fully mocked [`BackupManager`] with handles on every double.
    pub(crate) struct TestHarness {
        pub manager: BackupManager,
        pub runner: Arc<ScriptedRunner>,
        pub cluster: Arc<MockClusterManager>,
        pub config: Arc<MemoryClusterConfig>,
        pub status: Arc<MemoryStatusReporter>,
        pub storage: Arc<MemoryStorage>,
        _work_dir: tempfile::TempDir,
    }

    impl TestHarness {
        pub(crate) fn new(responses: Vec<ScriptedResponse>) -> Self {
            Self::with(
                responses,
                MockClusterManager::single_leader(TEST_UNIT),
                MemoryStorage::new(),
            )
        }

        pub(crate) fn with(
            responses: Vec<ScriptedResponse>,
            cluster: MockClusterManager,
            storage: MemoryStorage,
        ) -> Self {
            let work_dir = tempfile::tempdir().unwrap();
            let data_directory = work_dir.path().join("pgdata");
            fs::create_dir_all(&data_directory).unwrap();
            fs::write(data_directory.join("PG_VERSION"), "16\n").unwrap();

            let runner = Arc::new(ScriptedRunner::new(responses));
            let cluster = Arc::new(cluster);
            let config = Arc::new(MemoryClusterConfig::new());
            let status = Arc::new(MemoryStatusReporter::new());
            let storage = Arc::new(storage);

            let engine = BackupEngine::new(
                Arc::clone(&runner) as Arc<dyn CommandRunner>,
                "pgbackrest",
                Path::new("/etc/backup/engine.conf"),
            );
            let identity = UnitIdentity {
                model_name: "production".to_string(),
                application_name: "database".to_string(),
                unit_name: TEST_UNIT.to_string(),
                cluster_name: "cluster-a".to_string(),
            };
            let paths = BackupPaths {
                data_directory,
                engine_config_file: work_dir.path().join("engine.conf"),
                engine_log_path: work_dir.path().join("logs"),
            };
            let mut manager = BackupManager::new(
                engine,
                Arc::clone(&storage) as Arc<dyn ObjectStorage>,
                Arc::clone(&cluster) as Arc<dyn ClusterManager>,
                Arc::clone(&config) as Arc<dyn LeaderConfig>,
                Arc::clone(&status) as Arc<dyn StatusReporter>,
                Arc::new(StaticS3Source::complete()) as Arc<dyn S3Source>,
                identity,
                paths,
            );
            // Tests must not sleep through the real check schedule.
            manager.stanza_check_policy = RetryPolicy::new(5, Duration::ZERO);

            Self {
                manager,
                runner,
                cluster,
                config,
                status,
                storage,
                _work_dir: work_dir,
            }
        }

        /// Marks this harness as a ready cluster with a registered stanza.
        pub(crate) fn with_registered_stanza(self) -> Self {
            self.config.set(keys::STANZA, "production.cluster-a");
            self.config.set(keys::CLUSTER_INITIALISED, "true");
            self
        }

        pub(crate) fn data_directory(&self) -> PathBuf {
            self.manager.paths.data_directory.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{TEST_UNIT, TestHarness};
    use super::*;
    use crate::cluster::testing::MockClusterManager;
    use crate::engine::runner::testing::ScriptedResponse;
    use crate::s3::testing::MemoryStorage;

    fn replica_cluster(endpoint: Option<&str>) -> MockClusterManager {
        MockClusterManager {
            primary: Some("database-1".to_string()),
            units: 2,
            peers: vec!["10.0.0.2".to_string()],
            endpoint: endpoint.map(|endpoint| endpoint.to_string()),
            ..MockClusterManager::single_leader(TEST_UNIT)
        }
    }

    #[tokio::test]
    async fn test_backup_server_stopped_without_tls() {
        let harness = TestHarness::new(Vec::new());
        assert!(harness.manager.start_stop_backup_server().await);
        assert!(harness.cluster.called("stop_backup_server"));
        assert!(!harness.cluster.called("restart_backup_server"));
    }

    #[tokio::test]
    async fn test_replica_backup_server_needs_a_primary_endpoint() {
        let harness = TestHarness::with(Vec::new(), replica_cluster(None), MemoryStorage::new());
        harness.config.set(keys::TLS, "enabled");

        assert!(!harness.manager.start_stop_backup_server().await);
        assert!(!harness.cluster.called("restart_backup_server"));
        // No endpoint to ping, so the engine was never asked.
        assert!(harness.runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replica_backup_server_requires_reachable_primary() {
        let harness = TestHarness::with(
            vec![ScriptedResponse::fail(1, "connection refused")],
            replica_cluster(Some("10.0.0.1")),
            MemoryStorage::new(),
        );
        harness.config.set(keys::TLS, "enabled");

        assert!(!harness.manager.start_stop_backup_server().await);
        assert!(!harness.cluster.called("restart_backup_server"));
        assert_eq!(harness.runner.calls_containing("server-ping"), 1);
    }

    #[tokio::test]
    async fn test_replica_backup_server_restarts_once_primary_answers() {
        let harness = TestHarness::with(
            vec![ScriptedResponse::succeed("")],
            replica_cluster(Some("10.0.0.1")),
            MemoryStorage::new(),
        );
        harness.config.set(keys::TLS, "enabled");

        assert!(harness.manager.start_stop_backup_server().await);
        assert!(harness.cluster.called("restart_backup_server"));
    }

    #[tokio::test]
    async fn test_primary_backup_server_restarts_without_ping() {
        let cluster = MockClusterManager {
            units: 2,
            peers: vec!["10.0.0.2".to_string()],
            ..MockClusterManager::single_leader(TEST_UNIT)
        };
        let harness = TestHarness::with(Vec::new(), cluster, MemoryStorage::new());
        harness.config.set(keys::TLS, "enabled");

        assert!(harness.manager.start_stop_backup_server().await);
        assert!(harness.cluster.called("restart_backup_server"));
        // The primary does not probe itself.
        assert_eq!(harness.runner.calls_containing("server-ping"), 0);
    }
}
