// backuptool/src/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("missing S3 parameters: {0:?}")]
    ConfigIncomplete(Vec<String>),

    #[error("operation timed out, fix the issue and re-run the triggering action")]
    TimedOut,

    #[error("failed to access/create the bucket, check your S3 settings: {0}")]
    CredentialOrConfig(String),

    #[error("failed to list backups: {0}")]
    ListBackups(String),

    #[error("{0}")]
    Validation(String),

    #[error("backup operation failed: {0}")]
    Backup(String),

    #[error("restore operation failed: {0}")]
    Restore(String),

    #[error("command execution failed: {stderr}")]
    Command { stdout: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
