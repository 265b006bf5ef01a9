// backuptool/src/config/mod.rs
//! config.json loading and the S3 settings source derived from it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cluster::UnitIdentity;
use crate::s3::S3Source;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub path: Option<String>,
    pub uri_style: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonBackupEngineConfig {
    pub executable: Option<String>,
    pub config_file: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub service_uid: Option<u32>,
    pub service_gid: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonClusterManagerConfig {
    pub ctl_executable: Option<String>,
    pub ctl_config_file: Option<PathBuf>,
    pub database_service: Option<String>,
    pub backup_server_service: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub model_name: Option<String>,
    pub application_name: Option<String>,
    pub unit_name: Option<String>,
    pub cluster_name: Option<String>,
    pub leader: Option<bool>,
    pub data_directory: Option<PathBuf>,
    pub shared_config_path: Option<PathBuf>,
    pub backup_engine: Option<JsonBackupEngineConfig>,
    pub cluster_manager: Option<JsonClusterManagerConfig>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

// Application's internal configuration struct
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: UnitIdentity,
    pub leader: bool,
    pub data_directory: PathBuf,
    pub shared_config_path: PathBuf,
    pub engine_executable: String,
    pub engine_config_file: PathBuf,
    pub engine_log_path: PathBuf,
    pub service_uid: Option<u32>,
    pub service_gid: Option<u32>,
    pub ctl_executable: String,
    pub ctl_config_file: PathBuf,
    pub database_service: String,
    pub backup_server_service: String,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;

        let identity = UnitIdentity {
            model_name: raw
                .model_name
                .clone()
                .context("'model_name' is missing in config.json")?,
            application_name: raw
                .application_name
                .clone()
                .context("'application_name' is missing in config.json")?,
            unit_name: raw
                .unit_name
                .clone()
                .context("'unit_name' is missing in config.json")?,
            cluster_name: raw
                .cluster_name
                .clone()
                .context("'cluster_name' is missing in config.json")?,
        };
        let data_directory = raw
            .data_directory
            .clone()
            .context("'data_directory' is missing in config.json")?;

        let engine = raw.backup_engine.clone().unwrap_or(JsonBackupEngineConfig {
            executable: None,
            config_file: None,
            log_path: None,
            service_uid: None,
            service_gid: None,
        });
        let manager = raw
            .cluster_manager
            .clone()
            .unwrap_or(JsonClusterManagerConfig {
                ctl_executable: None,
                ctl_config_file: None,
                database_service: None,
                backup_server_service: None,
            });

        Ok(AppConfig {
            identity,
            leader: raw.leader.unwrap_or(false),
            data_directory,
            shared_config_path: raw
                .shared_config_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("/var/lib/backuptool/cluster-config.json")),
            engine_executable: engine
                .executable
                .unwrap_or_else(|| "pgbackrest".to_string()),
            engine_config_file: engine
                .config_file
                .unwrap_or_else(|| PathBuf::from("/etc/pgbackrest/pgbackrest.conf")),
            engine_log_path: engine
                .log_path
                .unwrap_or_else(|| PathBuf::from("/var/log/pgbackrest")),
            service_uid: engine.service_uid,
            service_gid: engine.service_gid,
            ctl_executable: manager
                .ctl_executable
                .unwrap_or_else(|| "patronictl".to_string()),
            ctl_config_file: manager
                .ctl_config_file
                .unwrap_or_else(|| PathBuf::from("/etc/patroni/patroni.yaml")),
            database_service: manager
                .database_service
                .unwrap_or_else(|| "patroni".to_string()),
            backup_server_service: manager
                .backup_server_service
                .unwrap_or_else(|| "pgbackrest-server".to_string()),
            s3_storage: raw.s3_storage,
        })
    }
}

/// S3 settings source backed by the `s3_storage` section of config.json.
///
/// An absent section means the integration is not configured, which the
/// workflows treat differently from an incomplete one.
pub struct ConfigS3Source {
    s3_storage: Option<JsonS3StorageConfig>,
}

impl ConfigS3Source {
    pub fn new(s3_storage: Option<JsonS3StorageConfig>) -> Self {
        Self { s3_storage }
    }
}

impl S3Source for ConfigS3Source {
    fn connection_info(&self) -> Option<BTreeMap<String, String>> {
        let section = self.s3_storage.as_ref()?;
        let mut info = BTreeMap::new();
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                info.insert(key.to_string(), value.clone());
            }
        };
        put("bucket", &section.bucket);
        put("access-key", &section.access_key);
        put("secret-key", &section.secret_key);
        put("endpoint", &section.endpoint);
        put("region", &section.region);
        put("path", &section.path);
        put("s3-uri-style", &section.uri_style);
        Some(info)
    }
}
