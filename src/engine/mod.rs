// backuptool/src/engine/mod.rs
//! Adapter around the external backup-engine CLI.
//!
//! The engine is a black box invoked with a fixed configuration-file
//! argument; its only structured surface is the JSON introspection output
//! of `info --output=json`.

pub mod runner;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::warn;

use crate::errors::{BackupError, Result};
use runner::{CommandOutput, CommandRunner};

/// Public backup-id timestamp format, shown to operators.
pub const BACKUP_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// The engine's internal label timestamp format (without the type suffix).
pub const ENGINE_LABEL_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Engine-specific exit code meaning "connection timeout".
pub const ENGINE_TIMEOUT_EXIT_CODE: i32 = 49;

const INFO_TIMEOUT: Duration = Duration::from_secs(30);
const SERVER_PING_IO_TIMEOUT: &str = "--io-timeout=10";

/// One repository entry of the engine's introspection JSON.
#[derive(Debug, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    #[serde(default)]
    pub backup: Vec<BackupRecord>,
}

#[derive(Debug, Deserialize)]
pub struct BackupRecord {
    pub label: String,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl BackupRecord {
    /// The failure reason, if the engine recorded one for this backup.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref() {
            None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false)) => None,
            Some(serde_json::Value::Bool(true)) => Some("backup reported an error".to_string()),
            Some(serde_json::Value::String(text)) if text.is_empty() => None,
            Some(serde_json::Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Converts an internal engine label (`20230101-000000F`) to the public
/// backup-id format. The trailing type character (`F` full, `D`
/// differential, `I` incremental) is stripped before conversion.
pub fn engine_label_to_backup_id(label: &str) -> Result<String> {
    if label.len() < 2 || !label.is_ascii() {
        return Err(BackupError::ListBackups(format!(
            "unexpected backup label format: {label}"
        )));
    }
    let (timestamp, backup_type) = label.split_at(label.len() - 1);
    if !matches!(backup_type, "F" | "D" | "I") {
        return Err(BackupError::ListBackups(format!(
            "unexpected backup label format: {label}"
        )));
    }
    let parsed = NaiveDateTime::parse_from_str(timestamp, ENGINE_LABEL_FORMAT).map_err(|err| {
        BackupError::ListBackups(format!("unexpected backup label format: {label} ({err})"))
    })?;
    Ok(parsed.format(BACKUP_ID_FORMAT).to_string())
}

/// Converts a public backup-id back to the engine's full-backup label.
pub fn backup_id_to_engine_label(backup_id: &str) -> Result<String> {
    let parsed = NaiveDateTime::parse_from_str(backup_id, BACKUP_ID_FORMAT)
        .map_err(|_| BackupError::Validation(format!("invalid backup-id: {backup_id}")))?;
    Ok(format!("{}F", parsed.format(ENGINE_LABEL_FORMAT)))
}

/// Formats the provided backups as a fixed-width table.
///
/// This exact layout is the user-facing action result and must stay stable
/// for scripting compatibility.
pub fn format_backup_list(entries: &[(String, String, String)]) -> String {
    let header = format!(
        "{:<21} | {:<12} | {}",
        "backup-id", "backup-type", "backup-status"
    );
    let mut lines = vec![header.clone(), "-".repeat(header.len())];
    for (backup_id, backup_type, backup_status) in entries {
        lines.push(format!(
            "{:<21} | {:<12} | {}",
            backup_id, backup_type, backup_status
        ));
    }
    lines.join("\n")
}

fn parse_repository_info(stdout: &str) -> Result<Option<RepositoryInfo>> {
    let mut repositories: Vec<RepositoryInfo> = serde_json::from_str(stdout)?;
    if repositories.is_empty() {
        Ok(None)
    } else {
        Ok(Some(repositories.remove(0)))
    }
}

/// Parses the introspection JSON into ordered `(backup-id, stanza-name)`
/// pairs, excluding errored entries unless `show_failed` is set. Order is
/// preserved from the engine's listing (ascending creation time).
pub fn parse_backup_list(stdout: &str, show_failed: bool) -> Result<Vec<(String, String)>> {
    let Some(repository) = parse_repository_info(stdout)? else {
        return Ok(Vec::new());
    };
    let mut backups = Vec::new();
    for record in &repository.backup {
        if !show_failed && record.error_message().is_some() {
            continue;
        }
        backups.push((
            engine_label_to_backup_id(&record.label)?,
            repository.name.clone(),
        ));
    }
    Ok(backups)
}

/// Wrapper around the backup-engine executable.
#[derive(Clone)]
pub struct BackupEngine {
    runner: Arc<dyn CommandRunner>,
    executable: String,
    config_argument: String,
}

impl BackupEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, executable: &str, config_file: &Path) -> Self {
        Self {
            runner,
            executable: executable.to_string(),
            config_argument: format!("--config={}", config_file.display()),
        }
    }

    /// Runs an engine sub-command with the repository configuration file.
    pub async fn run(
        &self,
        args: &[String],
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let mut command = vec![self.executable.clone(), self.config_argument.clone()];
        command.extend_from_slice(args);
        self.runner.run(&command, input, timeout).await
    }

    async fn info_json(&self) -> Result<CommandOutput> {
        let output = self
            .run(
                &["info".to_string(), "--output=json".to_string()],
                None,
                Some(INFO_TIMEOUT),
            )
            .await?;
        if !output.success() {
            return Err(BackupError::ListBackups(format!(
                "failed to list backups with error: {}",
                output.stderr
            )));
        }
        Ok(output)
    }

    /// Retrieves the ordered list of previously created backups.
    pub async fn list_backups(&self, show_failed: bool) -> Result<Vec<(String, String)>> {
        let output = self.info_json().await?;
        parse_backup_list(&output.stdout, show_failed)
    }

    /// Generates the user-facing backup table, successful and failed
    /// backups alike, in order of ascending time.
    pub async fn generate_backup_list_output(&self) -> Result<String> {
        let output = self.info_json().await?;
        let Some(repository) = parse_repository_info(&output.stdout)? else {
            return Ok(format_backup_list(&[]));
        };
        let mut entries = Vec::new();
        for record in &repository.backup {
            let backup_status = match record.error_message() {
                Some(reason) => format!("failed: {reason}"),
                None => "finished".to_string(),
            };
            entries.push((
                engine_label_to_backup_id(&record.label)?,
                "physical".to_string(),
                backup_status,
            ));
        }
        Ok(format_backup_list(&entries))
    }

    /// Probes the engine's TLS server on another node. The configuration
    /// file is not passed for this sub-command.
    pub async fn server_reachable(&self, endpoint: &str) -> bool {
        let command = vec![
            self.executable.clone(),
            "server-ping".to_string(),
            SERVER_PING_IO_TIMEOUT.to_string(),
            endpoint.to_string(),
        ];
        match self.runner.run(&command, None, None).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(
                    "failed to contact the backup TLS server on {} with error {}",
                    endpoint, output.stderr
                );
                false
            }
            Err(err) => {
                warn!(
                    "failed to contact the backup TLS server on {}: {}",
                    endpoint, err
                );
                false
            }
        }
    }
}
