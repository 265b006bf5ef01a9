// backuptool/src/backup/logic.rs
//! The create-backup and list-backups workflows.

use chrono::Utc;
use regex::Regex;
use tracing::{error, info, warn};

use crate::cluster::{RoleSnapshot, UnitStatus, keys};
use crate::engine::{BACKUP_ID_FORMAT, ENGINE_LABEL_FORMAT, engine_label_to_backup_id};
use crate::errors::{BackupError, Result};
use crate::s3::S3Parameters;
use crate::validation::{self, BackupEligibility};

use super::{BackupManager, BackupRunResult};

impl BackupManager {
    /// Creates a full backup of the cluster and uploads its logs next to it
    /// in the repository.
    pub async fn create_backup(&self) -> Result<BackupRunResult> {
        let snapshot = RoleSnapshot::resolve(
            self.cluster.as_ref(),
            self.config.as_ref(),
            &self.identity.unit_name,
        )
        .await;
        let eligibility = BackupEligibility {
            is_blocked: self.status.current().is_blocked(),
            is_primary: snapshot.is_primary(),
            planned_units: snapshot.planned_units,
            tls_enabled: snapshot.tls_enabled,
            member_started: self.cluster.member_started().await,
            stanza_registered: self.stanza_registered(),
        };
        if let Err(reason) = validation::can_unit_perform_backup(&eligibility) {
            error!("backup failed: {reason}");
            return Err(BackupError::Validation(reason));
        }
        let parameters = self.retrieve_s3_parameters()?;

        // The metadata upload doubles as a write-access check before any
        // state is touched.
        let metadata = format!(
            "Date Backup Requested: {}\nModel Name: {}\nApplication Name: {}\nUnit Name: {}\nTool Version: {}\n",
            Utc::now().format(BACKUP_ID_FORMAT),
            self.identity.model_name,
            self.identity.application_name,
            self.identity.unit_name,
            env!("CARGO_PKG_VERSION"),
        );
        let latest_path = format!("backup/{}/latest", self.stanza_name());
        if !self
            .storage
            .upload_content(&parameters, &metadata, &latest_path)
            .await
        {
            let message = "failed to upload metadata to the provided S3 repository".to_string();
            error!("backup failed: {message}");
            return Err(BackupError::Backup(message));
        }

        if !snapshot.is_primary() {
            // Keep the cluster manager from promoting or fencing this
            // replica while it is busy backing up.
            self.set_connectivity(false).await;
        }
        self.status
            .set(UnitStatus::Maintenance("creating backup".to_string()));
        self.set_backup_in_progress(true).await;

        let result = self.run_backup(&parameters, snapshot.is_primary()).await;

        // Cleanup happens whether the backup worked or not.
        if !snapshot.is_primary() {
            self.set_connectivity(true).await;
        }
        self.set_backup_in_progress(false).await;
        self.status.set(UnitStatus::Active);

        if let Ok(run) = &result {
            info!("backup succeeded with backup-id {}", run.backup_id);
        }
        result
    }

    async fn run_backup(
        &self,
        parameters: &S3Parameters,
        is_primary: bool,
    ) -> Result<BackupRunResult> {
        let mut command = vec![
            format!("--stanza={}", self.stanza_name()),
            "--log-level-console=debug".to_string(),
            "--type=full".to_string(),
            "backup".to_string(),
        ];
        if is_primary {
            // Only a primary that kept the backup load has no standby to
            // copy from.
            command.push("--no-backup-standby".to_string());
        }
        let output = self.engine.run(&command, None, None).await?;
        let logs = format!(
            "Stdout:\n{}\n\nStderr:\n{}\n",
            output.stdout, output.stderr
        );

        if !output.success() {
            error!("backup failed: {}", output.stderr);
            // The engine may have registered a (failed) backup anyway; keep
            // the logs next to it so the repository stays inspectable.
            let label = recover_backup_label(&output.stdout)
                .unwrap_or_else(|| format!("{}F", Utc::now().format(ENGINE_LABEL_FORMAT)));
            let backup_id = engine_label_to_backup_id(&label)?;
            if !self
                .storage
                .upload_content(parameters, &logs, &self.log_path(&backup_id))
                .await
            {
                warn!("error uploading logs to S3");
            }
            return Err(BackupError::Backup(format!(
                "failed to back up cluster with error: {}",
                output.stderr
            )));
        }

        // The engine prints no identifier on success; the newest catalog
        // entry is the backup that just finished.
        let backups = self.engine.list_backups(true).await.map_err(|err| {
            error!("failed to retrieve backup id: {err}");
            BackupError::Backup("failed to retrieve backup id".to_string())
        })?;
        let Some((backup_id, _)) = backups.last() else {
            return Err(BackupError::Backup(
                "failed to retrieve backup id".to_string(),
            ));
        };
        let log_location = self.log_path(backup_id);
        if !self
            .storage
            .upload_content(parameters, &logs, &log_location)
            .await
        {
            return Err(BackupError::Backup("error uploading logs to S3".to_string()));
        }
        Ok(BackupRunResult {
            backup_id: backup_id.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            log_location,
        })
    }

    fn log_path(&self, backup_id: &str) -> String {
        format!("backup/{}/{}/backup.log", self.stanza_name(), backup_id)
    }

    async fn set_connectivity(&self, connected: bool) {
        self.config
            .set(keys::CONNECTIVITY, if connected { "on" } else { "off" });
        if let Err(err) = self.update_config().await {
            warn!("failed to push configuration after connectivity change: {err}");
        }
    }

    async fn set_backup_in_progress(&self, in_progress: bool) {
        if in_progress {
            self.config.set(keys::BACKUP_IN_PROGRESS, "true");
        } else {
            self.config.remove(keys::BACKUP_IN_PROGRESS);
        }
        if let Err(err) = self.update_config().await {
            warn!("failed to push the backup-in-progress marker: {err}");
        }
    }

    /// Renders the user-facing table of every backup in the repository.
    pub async fn list_backups(&self) -> Result<String> {
        // Listing still requires valid repository settings.
        self.retrieve_s3_parameters()?;
        self.engine.generate_backup_list_output().await
    }
}

/// Extracts the engine's backup label from the output of a failed backup
/// command, if it got far enough to print one.
fn recover_backup_label(stdout: &str) -> Option<String> {
    let pattern = Regex::new(r"new backup label = ([0-9]{8}-[0-9]{6}F)").ok()?;
    pattern
        .captures(stdout)
        .map(|captures| captures[1].to_string())
}
