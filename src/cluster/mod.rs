// backuptool/src/cluster/mod.rs
//! Collaborator seams towards the cluster manager, the replicated
//! configuration store and the unit status surface.

pub mod system;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::errors::Result;

/// Keys used in the replicated cluster configuration store.
pub mod keys {
    /// Registered stanza name, owned by the leader, read by every node.
    pub const STANZA: &str = "stanza";
    /// Marker set between stanza creation and a successful stanza check.
    pub const INIT_PENDING: &str = "stanza-init-pending";
    /// Connectivity rule toggled around non-primary backups.
    pub const CONNECTIVITY: &str = "connectivity";
    /// Explicit in-flight marker, since the engine's catalog does not yet
    /// reflect a running backup.
    pub const BACKUP_IN_PROGRESS: &str = "backup-in-progress";
    /// Engine label of the backup being restored.
    pub const RESTORING_BACKUP: &str = "restoring-backup";
    /// Stanza name the restore directive points at.
    pub const RESTORE_STANZA: &str = "restore-stanza";
    /// Set once the database cluster finished its first bootstrap.
    pub const CLUSTER_INITIALISED: &str = "cluster-initialised";
    /// Present when TLS is enabled across the cluster.
    pub const TLS: &str = "tls";
}

/// Identity of the unit this process runs on.
#[derive(Debug, Clone)]
pub struct UnitIdentity {
    pub model_name: String,
    pub application_name: String,
    pub unit_name: String,
    pub cluster_name: String,
}

impl UnitIdentity {
    /// Stanza name, composed by model and cluster name.
    pub fn stanza_name(&self) -> String {
        format!("{}.{}", self.model_name, self.cluster_name)
    }
}

/// The fixed set of cluster-visible blocking conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    AnotherClusterRepository,
    FailedToAccessCreateBucket,
    FailedToInitializeStanza,
}

impl BlockedReason {
    /// Whether a later stanza initialisation may replace this condition.
    /// Guards against clobbering blocking reasons outside the S3/stanza
    /// set; every current variant belongs to that set, so this matches
    /// them all until a non-S3 reason is added.
    pub fn superseded_by_stanza_init(&self) -> bool {
        matches!(
            self,
            BlockedReason::AnotherClusterRepository
                | BlockedReason::FailedToAccessCreateBucket
                | BlockedReason::FailedToInitializeStanza
        )
    }
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            BlockedReason::AnotherClusterRepository => {
                "the S3 repository has backups from another cluster"
            }
            BlockedReason::FailedToAccessCreateBucket => {
                "failed to access/create the bucket, check your S3 settings"
            }
            BlockedReason::FailedToInitializeStanza => {
                "failed to initialize stanza, check your S3 settings"
            }
        };
        write!(f, "{message}")
    }
}

/// User-visible unit status; at most one blocking reason is active at a
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Active,
    Maintenance(String),
    Blocked(BlockedReason),
}

impl UnitStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, UnitStatus::Blocked(_))
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        match self {
            UnitStatus::Blocked(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Active => write!(f, "active"),
            UnitStatus::Maintenance(message) => write!(f, "maintenance: {message}"),
            UnitStatus::Blocked(reason) => write!(f, "blocked: {reason}"),
        }
    }
}

/// Reports the unit status to the surrounding lifecycle.
pub trait StatusReporter: Send + Sync {
    fn current(&self) -> UnitStatus;
    fn set(&self, status: UnitStatus);
}

/// Read-only view of the replicated key/value store every node holds,
/// with eventual propagation from the writer.
pub trait ReplicatedConfig: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Write capability over the replicated store.
///
/// Cluster-wide keys (stanza, restore directive) must only be written by
/// the elected leader; the per-unit markers (connectivity, backup in
/// progress) are written by the unit they describe.
pub trait LeaderConfig: ReplicatedConfig {
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// The cluster membership/consensus manager collaborator.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Whether the local database process is up according to the manager.
    async fn member_started(&self) -> bool;
    /// Starts the local database process.
    async fn start(&self) -> Result<()>;
    /// Stops the local database process.
    async fn stop(&self) -> bool;
    /// Asks the manager to re-read its configuration.
    async fn reload_configuration(&self) -> Result<()>;
    /// Writes a rendered configuration file with the given mode.
    fn render_config_file(&self, path: &Path, content: &str, mode: u32) -> Result<()>;
    /// Removes this node's old membership record so a new cluster identity
    /// can be established. Uses the manager CLI's double-confirmation
    /// stdin protocol.
    async fn remove_member(&self, cluster_name: &str) -> Result<()>;
    /// Whether this unit holds the cluster-wide leader lease.
    async fn is_leader(&self) -> bool;
    /// Name of the current primary unit, if any.
    async fn primary_unit(&self) -> Option<String>;
    /// Number of units in the cluster.
    async fn planned_units(&self) -> u32;
    /// Addresses of the other members.
    async fn peer_addresses(&self) -> Vec<String>;
    /// Endpoint of the primary's backup TLS server.
    async fn primary_endpoint(&self) -> Option<String>;
    /// Restarts the backup TLS server service.
    async fn restart_backup_server(&self) -> bool;
    /// Stops the backup TLS server service.
    async fn stop_backup_server(&self) -> bool;
}

/// Cluster-level leadership of this unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    Leader,
    Follower,
}

/// Database role of this unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbRole {
    Primary,
    Replica,
}

/// Immutable role snapshot resolved once per workflow invocation, so the
/// eligibility rules stay pure functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub leadership: Leadership,
    pub role: DbRole,
    pub planned_units: u32,
    pub tls_enabled: bool,
}

impl RoleSnapshot {
    pub async fn resolve(
        cluster: &dyn ClusterManager,
        config: &dyn ReplicatedConfig,
        unit_name: &str,
    ) -> Self {
        let leadership = if cluster.is_leader().await {
            Leadership::Leader
        } else {
            Leadership::Follower
        };
        let role = match cluster.primary_unit().await {
            Some(primary) if primary == unit_name => DbRole::Primary,
            _ => DbRole::Replica,
        };
        RoleSnapshot {
            leadership,
            role,
            planned_units: cluster.planned_units().await,
            tls_enabled: config.get(keys::TLS).is_some(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leadership == Leadership::Leader
    }

    pub fn is_primary(&self) -> bool {
        self.role == DbRole::Primary
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory replicated configuration store.
    pub(crate) struct MemoryClusterConfig {
        entries: Mutex<HashMap<String, String>>,
    }

    impl MemoryClusterConfig {
        pub(crate) fn new() -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
            }
        }
    }

    impl ReplicatedConfig for MemoryClusterConfig {
        fn get(&self, key: &str) -> Option<String> {
            self.entries.lock().unwrap().get(key).cloned()
        }
    }

    impl LeaderConfig for MemoryClusterConfig {
        fn set(&self, key: &str, value: &str) {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        fn remove(&self, key: &str) {
            self.entries.lock().unwrap().remove(key);
        }
    }

    /// Status reporter keeping the last status in memory.
    pub(crate) struct MemoryStatusReporter {
        status: Mutex<UnitStatus>,
    }

    impl MemoryStatusReporter {
        pub(crate) fn new() -> Self {
            Self {
                status: Mutex::new(UnitStatus::Active),
            }
        }
    }

    impl StatusReporter for MemoryStatusReporter {
        fn current(&self) -> UnitStatus {
            self.status.lock().unwrap().clone()
        }

        fn set(&self, status: UnitStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    /// Configurable cluster manager recording every call by name.
    pub(crate) struct MockClusterManager {
        pub leader: bool,
        pub started: bool,
        pub primary: Option<String>,
        pub units: u32,
        pub peers: Vec<String>,
        pub endpoint: Option<String>,
        pub stop_succeeds: bool,
        pub remove_member_error: Option<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockClusterManager {
        pub(crate) fn single_leader(unit_name: &str) -> Self {
            Self {
                leader: true,
                started: true,
                primary: Some(unit_name.to_string()),
                units: 1,
                peers: Vec::new(),
                endpoint: None,
                stop_succeeds: true,
                remove_member_error: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn called(&self, name: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|call| call == name)
        }

        fn record(&self, name: &str) {
            self.calls.lock().unwrap().push(name.to_string());
        }
    }

    #[async_trait]
    impl ClusterManager for MockClusterManager {
        async fn member_started(&self) -> bool {
            self.started
        }

        async fn start(&self) -> Result<()> {
            self.record("start");
            Ok(())
        }

        async fn stop(&self) -> bool {
            self.record("stop");
            self.stop_succeeds
        }

        async fn reload_configuration(&self) -> Result<()> {
            self.record("reload_configuration");
            Ok(())
        }

        fn render_config_file(&self, _path: &Path, _content: &str, _mode: u32) -> Result<()> {
            self.record("render_config_file");
            Ok(())
        }

        async fn remove_member(&self, _cluster_name: &str) -> Result<()> {
            self.record("remove_member");
            match &self.remove_member_error {
                Some(stderr) => Err(crate::errors::BackupError::Command {
                    stdout: String::new(),
                    stderr: stderr.clone(),
                }),
                None => Ok(()),
            }
        }

        async fn is_leader(&self) -> bool {
            self.leader
        }

        async fn primary_unit(&self) -> Option<String> {
            self.primary.clone()
        }

        async fn planned_units(&self) -> u32 {
            self.units
        }

        async fn peer_addresses(&self) -> Vec<String> {
            self.peers.clone()
        }

        async fn primary_endpoint(&self) -> Option<String> {
            self.endpoint.clone()
        }

        async fn restart_backup_server(&self) -> bool {
            self.record("restart_backup_server");
            true
        }

        async fn stop_backup_server(&self) -> bool {
            self.record("stop_backup_server");
            true
        }
    }
}
