// backuptool/src/cluster/system.rs
//! Production collaborators backed by the cluster manager's CLI, the
//! system service manager and a local replica of the shared store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::runner::CommandRunner;
use crate::errors::{BackupError, Result};

use super::{ClusterManager, LeaderConfig, ReplicatedConfig, StatusReporter, UnitStatus};

const MEMBER_REMOVE_TIMEOUT: Duration = Duration::from_secs(10);
const RUNNING_STATE: &str = "running";

/// One member row of the manager CLI's `list --format json` output.
#[derive(Debug, Deserialize)]
struct MemberRow {
    #[serde(rename = "Member")]
    name: String,
    #[serde(rename = "Host", default)]
    host: Option<String>,
    #[serde(rename = "Role")]
    role: String,
    #[serde(rename = "State")]
    state: String,
}

impl MemberRow {
    fn is_primary(&self) -> bool {
        matches!(self.role.as_str(), "Leader" | "Master")
    }
}

/// Cluster manager driven through its control CLI and systemd services.
pub struct SystemClusterManager {
    runner: Arc<dyn CommandRunner>,
    ctl_executable: String,
    ctl_config: PathBuf,
    cluster_name: String,
    unit_name: String,
    database_service: String,
    backup_server_service: String,
    leader: bool,
}

impl SystemClusterManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ctl_executable: &str,
        ctl_config: &Path,
        cluster_name: &str,
        unit_name: &str,
        database_service: &str,
        backup_server_service: &str,
        leader: bool,
    ) -> Self {
        Self {
            runner,
            ctl_executable: ctl_executable.to_string(),
            ctl_config: ctl_config.to_path_buf(),
            cluster_name: cluster_name.to_string(),
            unit_name: unit_name.to_string(),
            database_service: database_service.to_string(),
            backup_server_service: backup_server_service.to_string(),
            leader,
        }
    }

    fn ctl_command(&self, args: &[&str]) -> Vec<String> {
        let mut command = vec![
            self.ctl_executable.clone(),
            "-c".to_string(),
            self.ctl_config.display().to_string(),
        ];
        command.extend(args.iter().map(|arg| arg.to_string()));
        command
    }

    async fn members(&self) -> Result<Vec<MemberRow>> {
        let output = self
            .runner
            .run(&self.ctl_command(&["list", "--format", "json"]), None, None)
            .await?;
        if !output.success() {
            return Err(BackupError::Command {
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }

    async fn service(&self, action: &str, service: &str) -> bool {
        let command = vec![
            "systemctl".to_string(),
            action.to_string(),
            service.to_string(),
        ];
        match self.runner.run(&command, None, None).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!("systemctl {} {} failed: {}", action, service, output.stderr);
                false
            }
            Err(err) => {
                warn!("systemctl {} {} failed: {}", action, service, err);
                false
            }
        }
    }
}

#[async_trait]
impl ClusterManager for SystemClusterManager {
    async fn member_started(&self) -> bool {
        match self.members().await {
            Ok(members) => members
                .iter()
                .any(|member| member.name == self.unit_name && member.state == RUNNING_STATE),
            Err(err) => {
                warn!("failed to query cluster members: {}", err);
                false
            }
        }
    }

    async fn start(&self) -> Result<()> {
        if self.service("start", &self.database_service).await {
            Ok(())
        } else {
            Err(BackupError::Restore(format!(
                "failed to start service {}",
                self.database_service
            )))
        }
    }

    async fn stop(&self) -> bool {
        self.service("stop", &self.database_service).await
    }

    async fn reload_configuration(&self) -> Result<()> {
        let output = self
            .runner
            .run(
                &self.ctl_command(&["reload", &self.cluster_name, "--force"]),
                None,
                None,
            )
            .await?;
        if !output.success() {
            return Err(BackupError::Command {
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    fn render_config_file(&self, path: &Path, content: &str, mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    async fn remove_member(&self, cluster_name: &str) -> Result<()> {
        // The manager CLI requires the cluster name and an explicit
        // acknowledgement on stdin before it deletes the record.
        let confirmation = format!("{cluster_name}\nYes I am aware");
        let output = self
            .runner
            .run(
                &self.ctl_command(&["remove", cluster_name]),
                Some(confirmation.as_bytes()),
                Some(MEMBER_REMOVE_TIMEOUT),
            )
            .await?;
        if !output.success() {
            return Err(BackupError::Command {
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn is_leader(&self) -> bool {
        self.leader
    }

    async fn primary_unit(&self) -> Option<String> {
        match self.members().await {
            Ok(members) => members
                .into_iter()
                .find(|member| member.is_primary())
                .map(|member| member.name),
            Err(err) => {
                warn!("failed to query cluster members: {}", err);
                None
            }
        }
    }

    async fn planned_units(&self) -> u32 {
        match self.members().await {
            Ok(members) => members.len() as u32,
            Err(_) => 0,
        }
    }

    async fn peer_addresses(&self) -> Vec<String> {
        match self.members().await {
            Ok(members) => members
                .into_iter()
                .filter(|member| member.name != self.unit_name)
                .filter_map(|member| member.host)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn primary_endpoint(&self) -> Option<String> {
        match self.members().await {
            Ok(members) => members
                .into_iter()
                .find(|member| member.is_primary())
                .and_then(|member| member.host),
            Err(_) => None,
        }
    }

    async fn restart_backup_server(&self) -> bool {
        self.service("restart", &self.backup_server_service).await
    }

    async fn stop_backup_server(&self) -> bool {
        self.service("stop", &self.backup_server_service).await
    }
}

/// Local adapter for the replicated configuration store.
///
/// Replication itself is owned by the surrounding cluster integration;
/// this file is the node-local view of it.
pub struct FileClusterConfig {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            serde_json::from_str(&fs::read_to_string(path)?)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        let result = serde_json::to_string_pretty(entries)
            .map_err(BackupError::from)
            .and_then(|content| {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.path, content).map_err(BackupError::from)
            });
        if let Err(err) = result {
            warn!(
                "failed to persist cluster configuration to {}: {}",
                self.path.display(),
                err
            );
        }
    }
}

impl ReplicatedConfig for FileClusterConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

impl LeaderConfig for FileClusterConfig {
    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        self.persist(&entries);
    }
}

/// Status reporter logging transitions and remembering the last status.
pub struct LogStatusReporter {
    status: Mutex<UnitStatus>,
}

impl LogStatusReporter {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(UnitStatus::Active),
        }
    }
}

impl Default for LogStatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter for LogStatusReporter {
    fn current(&self) -> UnitStatus {
        self.status.lock().unwrap().clone()
    }

    fn set(&self, status: UnitStatus) {
        info!("unit status: {}", status);
        *self.status.lock().unwrap() = status;
    }
}
