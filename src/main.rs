//! Cluster Backup/Restore Tool
//!
//! Provides a CLI interface for backup, restore and repository management
//! of a clustered database through an external backup engine and S3.

// backuptool/src/main.rs
mod backup;
mod cluster;
mod config;
mod engine;
mod errors;
mod restore;
mod s3;
mod stanza;
mod utils;
mod validation;

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use backup::{BackupManager, BackupPaths};
use cluster::system::{FileClusterConfig, LogStatusReporter, SystemClusterManager};
use config::{AppConfig, ConfigS3Source};
use engine::BackupEngine;
use engine::runner::{CommandRunner, SystemRunner};
use s3::S3Repository;

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run_app().await {
        Ok(summary) => {
            println!("✅ {summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<String> {
    // Expects config.json next to the executable or in the project root
    // when running with `cargo run`.
    let config_path = PathBuf::from("config.json");
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    let manager = build_manager(&app_config)?;

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            let run = manager.create_backup().await.context("Backup failed")?;
            Ok(format!("backup created with backup-id {}", run.backup_id))
        }
        "2" | "restore" => {
            let backup_id = match args.get(2) {
                Some(backup_id) => backup_id.trim().to_string(),
                None => prompt_backup_id()?,
            };
            println!("🔄 Starting Restore Process...");
            let summary = manager
                .restore(&backup_id)
                .await
                .context("Restore failed")?;
            Ok(summary)
        }
        "3" | "list" => {
            let table = manager
                .list_backups()
                .await
                .context("Failed to list backups")?;
            println!("{table}");
            Ok("listed backups".to_string())
        }
        "4" | "init" => {
            if app_config.s3_storage.is_none() {
                manager.on_s3_parameters_gone();
                return Ok("no S3 settings configured, cleared stale repository blocks".to_string());
            }
            println!("⚙️ Configuring S3 Repository...");
            manager
                .on_s3_parameters_changed()
                .await
                .context("Repository initialisation failed")?;
            Ok("repository configuration applied".to_string())
        }
        _ => {
            println!(
                "❌ Invalid choice. Please enter '1' (backup), '2' (restore), '3' (list) or '4' (init)."
            );
            anyhow::bail!("Invalid operation choice");
        }
    }
}

fn build_manager(app_config: &AppConfig) -> Result<BackupManager> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(
        app_config.service_uid,
        app_config.service_gid,
    ));
    let engine = BackupEngine::new(
        Arc::clone(&runner),
        &resolve_executable(&app_config.engine_executable)?,
        &app_config.engine_config_file,
    );
    let cluster = Arc::new(SystemClusterManager::new(
        Arc::clone(&runner),
        &resolve_executable(&app_config.ctl_executable)?,
        &app_config.ctl_config_file,
        &app_config.identity.cluster_name,
        &app_config.identity.unit_name,
        &app_config.database_service,
        &app_config.backup_server_service,
        app_config.leader,
    ));
    let cluster_config =
        Arc::new(FileClusterConfig::load(&app_config.shared_config_path).context(format!(
            "Failed to load the shared cluster configuration from {}",
            app_config.shared_config_path.display()
        ))?);
    let paths = BackupPaths {
        data_directory: app_config.data_directory.clone(),
        engine_config_file: app_config.engine_config_file.clone(),
        engine_log_path: app_config.engine_log_path.clone(),
    };

    Ok(BackupManager::new(
        engine,
        Arc::new(S3Repository),
        cluster,
        cluster_config,
        Arc::new(LogStatusReporter::new()),
        Arc::new(ConfigS3Source::new(app_config.s3_storage.clone())),
        app_config.identity.clone(),
        paths,
    ))
}

/// Resolves a configured executable name through PATH; absolute paths are
/// taken as-is.
fn resolve_executable(name: &str) -> Result<String> {
    if Path::new(name).is_absolute() {
        return Ok(name.to_string());
    }
    let found =
        which::which(name).with_context(|| format!("executable '{name}' not found on PATH"))?;
    Ok(found.display().to_string())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Create Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. List Backups (or type 'list')");
    println!("4. Initialise S3 Repository (or type 'init')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}

/// Prompts user for the backup-id to restore
fn prompt_backup_id() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("Enter the backup-id to restore (e.g. 2023-01-01T09:00:00Z): ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
