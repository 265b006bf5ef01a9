// backuptool/src/s3/mod.rs
//! S3 parameter handling and the repository object-store client.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use s3::config::{Credentials, Region};
use tracing::{error, info, warn};
use url::Url;

use crate::errors::{BackupError, Result};
use crate::utils::retry::RetryPolicy;

pub const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";
const DEFAULT_URI_STYLE: &str = "host";
const DEFAULT_REGION: &str = "us-east-1";

// DNS suffixes of provider endpoints that omit the region and must be
// rewritten to the region-specific hostname.
const PROVIDER_DNS_SUFFIXES: &[&str] = &["amazonaws.com.cn", "amazonaws.com"];

/// Connection parameters for the S3 repository.
///
/// Derived fresh from the S3 settings source on every access; never cached
/// across operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Parameters {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub region: Option<String>,
    pub path: String,
    pub uri_style: String,
}

impl S3Parameters {
    /// Builds a normalized parameter set from raw connection info.
    ///
    /// Returns the list of missing required keys when the set is incomplete.
    pub fn from_connection_info(
        info: &BTreeMap<String, String>,
    ) -> std::result::Result<Self, Vec<String>> {
        let required = ["bucket", "access-key", "secret-key"];
        let missing: Vec<String> = required
            .iter()
            .filter(|key| {
                info.get(**key)
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            warn!("missing required S3 parameters: {:?}", missing);
            return Err(missing);
        }

        let get = |key: &str| info.get(key).map(|value| value.trim().to_string());

        let endpoint = get("endpoint")
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let path = get("path").unwrap_or_default();

        Ok(S3Parameters {
            // Extra slash symbols break 3rd-party storages like radosgw.
            bucket: get("bucket").unwrap_or_default().trim_matches('/').to_string(),
            access_key: get("access-key").unwrap_or_default(),
            secret_key: get("secret-key").unwrap_or_default(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: get("region").filter(|value| !value.is_empty()),
            // The leading slash is required by the backup engine.
            path: format!("/{}", path.trim_matches('/')),
            uri_style: get("s3-uri-style")
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_URI_STYLE.to_string()),
        })
    }
}

/// Source of raw S3 connection info.
///
/// `None` means the S3 integration is not configured at all, which is
/// distinct from an incomplete parameter set.
pub trait S3Source: Send + Sync {
    fn connection_info(&self) -> Option<BTreeMap<String, String>>;
}

/// Constructs the S3 service endpoint using the region.
///
/// Provider endpoints often omit the region and must be corrected for
/// regions other than the default; third-party endpoints are returned
/// unchanged.
pub fn resolve_endpoint(parameters: &S3Parameters) -> String {
    let Some(region) = parameters.region.as_deref().filter(|r| !r.is_empty()) else {
        return parameters.endpoint.clone();
    };
    let Ok(parsed) = Url::parse(&parameters.endpoint) else {
        return parameters.endpoint.clone();
    };
    let Some(host) = parsed.host_str() else {
        return parameters.endpoint.clone();
    };
    for suffix in PROVIDER_DNS_SUFFIXES {
        if host == *suffix || host.ends_with(&format!(".{suffix}")) {
            return format!("{}://s3.{}.{}", parsed.scheme(), region, suffix);
        }
    }
    parameters.endpoint.clone()
}

/// Object-store operations the workflows need.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Checks that the configured bucket exists, creating it if needed, and
    /// blocks until its existence is confirmed.
    async fn ensure_bucket(&self, parameters: &S3Parameters) -> Result<()>;

    /// Uploads `content` under `{parameters.path}/{logical_path}`.
    ///
    /// Never fails the caller: upload problems during best-effort logging
    /// must not crash the primary workflow.
    async fn upload_content(
        &self,
        parameters: &S3Parameters,
        content: &str,
        logical_path: &str,
    ) -> bool;
}

/// Production S3 repository client.
pub struct S3Repository;

impl S3Repository {
    async fn client(&self, parameters: &S3Parameters) -> s3::Client {
        let region = parameters
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(resolve_endpoint(parameters))
            .region(Region::new(region))
            .credentials_provider(Credentials::new(
                &parameters.access_key,
                &parameters.secret_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;
        s3::Client::new(&sdk_config)
    }
}

#[async_trait]
impl ObjectStorage for S3Repository {
    async fn ensure_bucket(&self, parameters: &S3Parameters) -> Result<()> {
        let client = self.client(parameters).await;
        let bucket = &parameters.bucket;

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!("bucket {} exists", bucket);
                return Ok(());
            }
            Err(err) if is_timeout(&err) => {
                // Propagated so the operator can fix network issues and
                // re-run the triggering action.
                error!("timed out while checking bucket {}: {}", bucket, err);
                return Err(BackupError::TimedOut);
            }
            Err(err) => {
                warn!(
                    "bucket {} doesn't exist or you don't have access to it: {}",
                    bucket, err
                );
            }
        }

        let mut request = client.create_bucket().bucket(bucket);
        if let Some(region) = &parameters.region {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region.as_str()))
                    .build(),
            );
        }
        request.send().await.map_err(|err| {
            if is_timeout(&err) {
                BackupError::TimedOut
            } else {
                error!(
                    "couldn't create bucket {} in region {:?}: {}",
                    bucket, parameters.region, err
                );
                BackupError::CredentialOrConfig(err.to_string())
            }
        })?;

        // Block until the new bucket is visible.
        let policy = RetryPolicy::new(20, Duration::from_secs(3));
        policy
            .run(|| {
                let request = client.head_bucket().bucket(bucket);
                async move {
                    request
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|err| err.to_string())
                }
            })
            .await
            .map_err(|exhausted| BackupError::CredentialOrConfig(exhausted.to_string()))?;
        info!(
            "created bucket {} in region {:?}",
            bucket, parameters.region
        );
        Ok(())
    }

    async fn upload_content(
        &self,
        parameters: &S3Parameters,
        content: &str,
        logical_path: &str,
    ) -> bool {
        let key = format!("{}/{}", parameters.path, logical_path)
            .trim_start_matches('/')
            .to_string();
        info!(
            "uploading content to bucket={}, path={}",
            parameters.bucket, key
        );

        let result: Result<()> = async {
            // The temp file is written, flushed, uploaded and removed in one
            // scope regardless of the upload outcome.
            let mut temp_file = tempfile::NamedTempFile::new()?;
            temp_file.write_all(content.as_bytes())?;
            temp_file.flush()?;

            let client = self.client(parameters).await;
            let body = ByteStream::from_path(temp_file.path())
                .await
                .map_err(|err| BackupError::CredentialOrConfig(err.to_string()))?;
            client
                .put_object()
                .bucket(&parameters.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|err| BackupError::CredentialOrConfig(err.to_string()))?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "failed to upload content to S3 bucket={}, path={}: {}",
                    parameters.bucket, key, err
                );
                false
            }
        }
    }
}

fn is_timeout<E, R>(err: &SdkError<E, R>) -> bool {
    match err {
        SdkError::TimeoutError(_) => true,
        SdkError::DispatchFailure(failure) => {
            failure.is_timeout()
                || failure
                    .as_connector_error()
                    .map(|connector| connector.is_timeout())
                    .unwrap_or(false)
        }
        _ => false,
    }
}
