// backuptool/src/restore/logic.rs

use tracing::{error, info, warn};

use crate::backup::BackupManager;
use crate::cluster::{RoleSnapshot, UnitStatus, keys};
use crate::engine::backup_id_to_engine_label;
use crate::errors::{BackupError, Result};
use crate::validation::{self, RestoreEligibility};

impl BackupManager {
    /// Starts a restore of the given backup. The actual data copy is done
    /// by the cluster manager on its next bootstrap, driven by the restore
    /// directive left in the replicated store.
    pub async fn restore(&self, backup_id: &str) -> Result<String> {
        let snapshot = RoleSnapshot::resolve(
            self.cluster.as_ref(),
            self.config.as_ref(),
            &self.identity.unit_name,
        )
        .await;
        self.retrieve_s3_parameters()?;

        let eligibility = RestoreEligibility {
            backup_id_provided: !backup_id.trim().is_empty(),
            blocked_reason: self.status.current().blocked_reason(),
            planned_units: snapshot.planned_units,
            is_leader: snapshot.is_leader(),
        };
        if let Err(reason) = validation::can_unit_perform_restore(&eligibility) {
            error!("restore failed: {reason}");
            return Err(BackupError::Validation(reason));
        }

        info!("a restore with backup-id {backup_id} has been requested on this unit");
        info!("validating provided backup-id");
        let backups = self.engine.list_backups(false).await.map_err(|err| {
            error!("failed to retrieve backup id: {err}");
            BackupError::Restore("failed to retrieve backup id".to_string())
        })?;
        let Some((_, source_stanza)) = backups.iter().find(|(id, _)| id == backup_id) else {
            let message = format!("invalid backup-id: {backup_id}");
            error!("restore failed: {message}");
            return Err(BackupError::Validation(message));
        };

        self.status
            .set(UnitStatus::Maintenance("restoring backup".to_string()));

        info!("stopping database service");
        if !self.cluster.stop().await {
            return Err(BackupError::Restore(
                "failed to stop database service".to_string(),
            ));
        }

        info!("removing the contents of the data directory");
        if !self.empty_data_files() {
            self.restart_database().await;
            return Err(BackupError::Restore(
                "failed to remove contents of the data directory".to_string(),
            ));
        }

        info!("configuring the cluster manager to restore the backup");
        self.config
            .set(keys::RESTORING_BACKUP, &backup_id_to_engine_label(backup_id)?);
        self.config.set(keys::RESTORE_STANZA, source_stanza);
        if let Err(err) = self.update_config().await {
            warn!("failed to push configuration before the restore: {err}");
        }

        info!("starting the database to begin the restore process");
        self.cluster.start().await?;

        // Past this point the restore directive stays in place; a failure
        // is reported and the operator must intervene.
        info!("removing previous cluster information");
        if let Err(err) = self.cluster.remove_member(&self.identity.cluster_name).await {
            let message =
                format!("failed to remove previous cluster information with error: {err}");
            error!("restore failed: {message}");
            return Err(BackupError::Restore(message));
        }

        Ok("restore started".to_string())
    }

    /// Brings the database back after an aborted restore attempt.
    async fn restart_database(&self) {
        self.config.remove(keys::RESTORING_BACKUP);
        if let Err(err) = self.update_config().await {
            warn!("failed to push configuration: {err}");
        }
        if let Err(err) = self.cluster.start().await {
            warn!("failed to restart the database: {err}");
        }
    }

    /// Removes the data directory so the restored files can take its place.
    fn empty_data_files(&self) -> bool {
        let path = &self.paths.data_directory;
        if path.is_dir() {
            if let Err(err) = std::fs::remove_dir_all(path) {
                warn!(
                    "failed to remove contents of the data directory with error: {err}"
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{TEST_UNIT, TestHarness};
    use crate::cluster::testing::MockClusterManager;
    use crate::cluster::{LeaderConfig, ReplicatedConfig, StatusReporter};
    use crate::engine::runner::testing::ScriptedResponse;
    use crate::s3::testing::MemoryStorage;

    const CATALOG_JSON: &str = r#"[
        {
            "name": "production.cluster-a",
            "backup": [
                {"label": "20230101-090000F", "error": null},
                {"label": "20230102-090000F", "error": "archive mismatch"}
            ]
        }
    ]"#;

    #[tokio::test]
    async fn test_restore_leaves_directive_and_rebuilds_membership() {
        let harness = TestHarness::new(vec![ScriptedResponse::succeed(CATALOG_JSON)]);
        let status = harness.manager.restore("2023-01-01T09:00:00Z").await.unwrap();
        assert_eq!(status, "restore started");

        assert_eq!(
            harness.config.get(keys::RESTORING_BACKUP).as_deref(),
            Some("20230101-090000F")
        );
        assert_eq!(
            harness.config.get(keys::RESTORE_STANZA).as_deref(),
            Some("production.cluster-a")
        );
        assert!(harness.cluster.called("stop"));
        assert!(harness.cluster.called("start"));
        assert!(harness.cluster.called("remove_member"));
        assert!(!harness.data_directory().exists());
    }

    #[tokio::test]
    async fn test_unknown_backup_id_has_no_side_effects() {
        let harness = TestHarness::new(vec![ScriptedResponse::succeed(CATALOG_JSON)]);
        let result = harness.manager.restore("2024-06-01T00:00:00Z").await;
        match result {
            Err(BackupError::Validation(message)) => {
                assert_eq!(message, "invalid backup-id: 2024-06-01T00:00:00Z");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The database was never touched.
        assert!(!harness.cluster.called("stop"));
        assert!(harness.data_directory().exists());
        assert_eq!(harness.config.get(keys::RESTORING_BACKUP), None);
    }

    #[tokio::test]
    async fn test_failed_backup_is_not_restorable() {
        let harness = TestHarness::new(vec![ScriptedResponse::succeed(CATALOG_JSON)]);
        let result = harness.manager.restore("2023-01-02T09:00:00Z").await;
        assert!(matches!(result, Err(BackupError::Validation(_))));
        assert!(!harness.cluster.called("stop"));
    }

    #[tokio::test]
    async fn test_restore_without_backup_id_is_denied() {
        let harness = TestHarness::new(Vec::new());
        let result = harness.manager.restore("  ").await;
        match result {
            Err(BackupError::Validation(message)) => {
                assert_eq!(message, "missing backup-id to restore");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(harness.runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_denied_with_multiple_units() {
        let cluster = MockClusterManager {
            units: 3,
            ..MockClusterManager::single_leader(TEST_UNIT)
        };
        let harness = TestHarness::with(Vec::new(), cluster, MemoryStorage::new());
        let result = harness.manager.restore("2023-01-01T09:00:00Z").await;
        assert!(matches!(result, Err(BackupError::Validation(_))));
        assert!(!harness.cluster.called("stop"));
    }

    #[tokio::test]
    async fn test_membership_removal_failure_keeps_the_directive() {
        let cluster = MockClusterManager {
            remove_member_error: Some("etcd unavailable".to_string()),
            ..MockClusterManager::single_leader(TEST_UNIT)
        };
        let harness = TestHarness::with(
            vec![ScriptedResponse::succeed(CATALOG_JSON)],
            cluster,
            MemoryStorage::new(),
        );
        let result = harness.manager.restore("2023-01-01T09:00:00Z").await;
        match result {
            Err(BackupError::Restore(message)) => {
                assert!(message.starts_with("failed to remove previous cluster information"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The restore itself is still underway; the directive stays for the
        // operator to act on.
        assert_eq!(
            harness.config.get(keys::RESTORING_BACKUP).as_deref(),
            Some("20230101-090000F")
        );
    }

    #[tokio::test]
    async fn test_failed_stop_aborts_before_data_removal() {
        let cluster = MockClusterManager {
            stop_succeeds: false,
            ..MockClusterManager::single_leader(TEST_UNIT)
        };
        let harness = TestHarness::with(
            vec![ScriptedResponse::succeed(CATALOG_JSON)],
            cluster,
            MemoryStorage::new(),
        );
        let result = harness.manager.restore("2023-01-01T09:00:00Z").await;
        assert!(matches!(result, Err(BackupError::Restore(_))));
        assert!(harness.data_directory().exists());
    }
}
