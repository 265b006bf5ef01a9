// backuptool/src/stanza/mod.rs
//! Stanza lifecycle: creation, verification and repository ownership
//! checks, driven by changes to the S3 settings.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::backup::BackupManager;
use crate::cluster::{BlockedReason, UnitStatus, keys};
use crate::engine::{ENGINE_TIMEOUT_EXIT_CODE, RepositoryInfo};
use crate::errors::{BackupError, Result};

const REPOSITORY_INFO_TIMEOUT: Duration = Duration::from_secs(30);

impl BackupManager {
    /// Creates the stanza in the repository and registers it for the rest
    /// of the cluster. Leader-only; followers pick up the registered name
    /// through the replicated store.
    pub async fn initialise_stanza(&self) -> Result<()> {
        if !self.cluster.is_leader().await {
            return Ok(());
        }
        // Re-initialisation after fixed S3 settings is allowed, but an
        // unrelated blocking condition must not be clobbered.
        if let Some(reason) = self.status.current().blocked_reason() {
            if !reason.superseded_by_stanza_init() {
                warn!("couldn't initialise the stanza due to a blocked status");
                return Ok(());
            }
        }
        self.status
            .set(UnitStatus::Maintenance("initialising stanza".to_string()));

        let command = vec![
            format!("--stanza={}", self.stanza_name()),
            "stanza-create".to_string(),
        ];
        let output = self.engine.run(&command, None, None).await?;
        if output.exit_code == ENGINE_TIMEOUT_EXIT_CODE {
            error!(
                "{} - fix the error and re-run the triggering action",
                output.stderr
            );
            return Err(BackupError::TimedOut);
        }
        if !output.success() {
            error!("failed to initialise stanza: {}", output.stderr);
            self.status
                .set(UnitStatus::Blocked(BlockedReason::FailedToInitializeStanza));
            return Ok(());
        }

        self.start_stop_backup_server().await;

        // The stanza is registered immediately so configuration renders
        // pick it up; the check still has to confirm it works.
        self.config.set(keys::STANZA, &self.stanza_name());
        self.config.set(keys::INIT_PENDING, "true");
        Ok(())
    }

    /// Verifies a freshly created stanza with the engine's check command,
    /// retrying while WAL archiving settles. Rolls the registration back
    /// when the check never passes.
    pub async fn check_stanza(&self) -> Result<()> {
        if !self.cluster.is_leader().await || self.config.get(keys::INIT_PENDING).is_none() {
            return Ok(());
        }
        // Push the configuration that points archiving at the repository.
        if let Err(err) = self.update_config().await {
            warn!("failed to push configuration before the stanza check: {err}");
        }
        self.status
            .set(UnitStatus::Maintenance("checking stanza".to_string()));

        let cluster = Arc::clone(&self.cluster);
        let engine = self.engine.clone();
        let command = vec![
            format!("--stanza={}", self.stanza_name()),
            "check".to_string(),
        ];
        let result = self
            .stanza_check_policy
            .run(|| {
                let cluster = Arc::clone(&cluster);
                let engine = engine.clone();
                let command = command.clone();
                async move {
                    // The archiving settings only apply once the manager
                    // reloaded them.
                    if cluster.member_started().await {
                        if let Err(err) = cluster.reload_configuration().await {
                            warn!("failed to reload the cluster manager configuration: {err}");
                        }
                    }
                    let output = engine
                        .run(&command, None, None)
                        .await
                        .map_err(|err| err.to_string())?;
                    if output.success() {
                        Ok(())
                    } else {
                        Err(output.stderr)
                    }
                }
            })
            .await;

        match result {
            Ok(()) => self.status.set(UnitStatus::Active),
            Err(exhausted) => {
                error!("stanza check failed: {exhausted}");
                // Roll back the registration so nothing archives against a
                // stanza that never worked.
                self.config.remove(keys::STANZA);
                if let Err(err) = self.update_config().await {
                    warn!("failed to revert configuration: {err}");
                }
                self.status
                    .set(UnitStatus::Blocked(BlockedReason::FailedToInitializeStanza));
            }
        }
        self.config.remove(keys::INIT_PENDING);
        Ok(())
    }

    /// Checks whether the configured repository belongs to this cluster.
    /// Returns the blocking reason when it cannot be used.
    pub async fn can_use_s3_repository(&self) -> Result<Option<BlockedReason>> {
        let command = vec!["info".to_string(), "--output=json".to_string()];
        let output = match self
            .engine
            .run(&command, None, Some(REPOSITORY_INFO_TIMEOUT))
            .await
        {
            Ok(output) => output,
            Err(BackupError::TimedOut) => {
                error!("timed out while checking the repository, fix the error and re-run the triggering action");
                return Err(BackupError::TimedOut);
            }
            Err(err) => return Err(err),
        };
        if !output.success() {
            error!("failed to read repository info: {}", output.stderr);
            return Ok(Some(BlockedReason::FailedToInitializeStanza));
        }

        if self.cluster.is_leader().await {
            let repositories: Vec<RepositoryInfo> = serde_json::from_str(&output.stdout)?;
            let expected = self
                .recorded_stanza()
                .unwrap_or_else(|| self.stanza_name());
            for repository in &repositories {
                if repository.name != expected {
                    // Unregister so WAL files stop flowing into the foreign
                    // repository.
                    self.config.remove(keys::STANZA);
                    if let Err(err) = self.update_config().await {
                        warn!("failed to push configuration: {err}");
                    }
                    return Ok(Some(BlockedReason::AnotherClusterRepository));
                }
            }
        }
        Ok(None)
    }

    /// Reacts to new or changed S3 settings: checks the bucket, verifies
    /// repository ownership and (re-)initialises the stanza.
    pub async fn on_s3_parameters_changed(&self) -> Result<()> {
        if self.config.get(keys::CLUSTER_INITIALISED).is_none() {
            debug!("cannot set the backup engine configuration, the cluster has not started yet");
            return Ok(());
        }
        if let Err(err) = self.render_engine_config().await {
            debug!("cannot set the backup engine configuration: {err}");
            return Ok(());
        }
        if !self.cluster.is_leader().await {
            return Ok(());
        }

        let parameters = self.retrieve_s3_parameters()?;
        match self.storage.ensure_bucket(&parameters).await {
            Ok(()) => {}
            Err(BackupError::TimedOut) => return Err(BackupError::TimedOut),
            Err(err) => {
                error!("failed to access or create the bucket: {err}");
                self.status
                    .set(UnitStatus::Blocked(BlockedReason::FailedToAccessCreateBucket));
                return Ok(());
            }
        }
        if let Some(reason) = self.can_use_s3_repository().await? {
            self.status.set(UnitStatus::Blocked(reason));
            return Ok(());
        }
        self.initialise_stanza().await?;
        self.check_stanza().await
    }

    /// Reacts to the S3 settings being removed: a block caused by the old
    /// settings no longer applies.
    pub fn on_s3_parameters_gone(&self) {
        if let Some(reason) = self.status.current().blocked_reason() {
            if reason.superseded_by_stanza_init() {
                self.status.set(UnitStatus::Active);
            }
        }
    }
}
