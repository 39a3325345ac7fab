//! Source change detection
//!
//! Given a DocumentSet, computes a content digest of its declared source
//! and diffs it against the last recorded digest. Four source models are
//! supported (S3, HTTP, Git, PVC), each with its own fingerprint
//! composition; change determination and per-file diffing are shared.

pub mod diff;
pub mod git;
pub mod http;
pub mod pvc;
pub mod s3;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use rag_common::{parse_duration_str, RagError, Result};
use tracing::{info, instrument};

use crate::crd::{DocumentSet, SourceMetadata, SourceType, SyncMode};
use self::diff::diff_file_hashes;

/// Default sync interval when the policy omits or mangles the duration
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Floor on the effective sync interval
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Timeout for HTTP metadata checks and git ref lookups
const HTTP_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Decoded string data of a source secret
pub type SecretData = BTreeMap<String, String>;

/// Raw fingerprint of a source, produced by the per-type backends
#[derive(Debug, Clone)]
pub struct SourceScan {
    /// Combined content digest
    pub hash: String,
    /// Fingerprint details persisted into status
    pub metadata: SourceMetadata,
    /// Number of logical files, used for counts when no per-file diff is
    /// possible (1 for single-document sources)
    pub file_hint: u32,
}

/// Result of a source change check
#[derive(Debug, Clone, Default)]
pub struct SourceChangeResult {
    pub changed: bool,
    pub new_hash: String,
    pub new_metadata: SourceMetadata,
    pub files_added: u32,
    pub files_deleted: u32,
    pub files_changed: u32,
    pub added_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub changed_files: Vec<String>,
}

/// Monitors document sources for changes
pub struct SourceWatcher {
    client: Client,
    http: reqwest::Client,
    pvc_mount_root: PathBuf,
}

impl SourceWatcher {
    pub fn new(client: Client, pvc_mount_root: PathBuf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_CHECK_TIMEOUT)
            .build()
            .map_err(|e| RagError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            http,
            pvc_mount_root,
        })
    }

    /// Validate the source configuration without performing any I/O beyond
    /// a secret lookup. Called before the first child task of a cycle is
    /// created so configuration errors surface as a Failed phase instead of
    /// a half-started pipeline.
    pub async fn validate(&self, ds: &DocumentSet) -> Result<()> {
        match ds.spec.source.source_type {
            SourceType::S3 => {
                s3::parse_s3_uri(&ds.spec.source.uri)?;
            }
            SourceType::Pvc => {
                pvc::parse_pvc_uri(&ds.spec.source.uri)?;
            }
            SourceType::Http => {
                let uri = &ds.spec.source.uri;
                if !uri.starts_with("http://") && !uri.starts_with("https://") {
                    return Err(RagError::InvalidUri(uri.clone()));
                }
            }
            SourceType::Git => {}
        }
        self.load_secret(ds).await?;
        Ok(())
    }

    /// Check whether the document source has changed since the last
    /// recorded digest.
    #[instrument(skip(self, ds), fields(documentset = %ds.name_any()))]
    pub async fn check_source_changes(&self, ds: &DocumentSet) -> Result<SourceChangeResult> {
        info!(
            source_type = ds.spec.source.source_type.as_str(),
            uri = %ds.spec.source.uri,
            "checking source for changes"
        );

        let secret = self.load_secret(ds).await?;
        let scan = match ds.spec.source.source_type {
            SourceType::S3 => s3::check(&ds.spec.source.uri, &secret).await?,
            SourceType::Http => http::check(&self.http, &ds.spec.source.uri, &secret).await?,
            SourceType::Git => git::check(&self.http, &ds.spec.source.uri, &secret).await?,
            SourceType::Pvc => pvc::check(&self.pvc_mount_root, &ds.spec.source.uri)?,
        };

        let status = ds.status.clone().unwrap_or_default();
        let result = evaluate(&status.last_source_hash, status.source_metadata.as_ref(), scan);
        if result.changed {
            info!(
                files_added = result.files_added,
                files_deleted = result.files_deleted,
                files_changed = result.files_changed,
                "source changed"
            );
        }
        Ok(result)
    }

    /// Fetch the referenced source secret and decode its string data.
    /// Credential material never leaves this map.
    async fn load_secret(&self, ds: &DocumentSet) -> Result<SecretData> {
        let Some(secret_ref) = &ds.spec.source.secret_ref else {
            return Ok(SecretData::new());
        };
        let namespace = ds.namespace().unwrap_or_default();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = match secrets.get(&secret_ref.name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(RagError::MissingSecret(secret_ref.name.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).to_string()))
            .collect())
    }
}

/// Turn a raw scan into a change result by comparing against the previously
/// recorded digest and per-file hashes.
fn evaluate(prev_hash: &str, prev_metadata: Option<&SourceMetadata>, scan: SourceScan) -> SourceChangeResult {
    let mut result = SourceChangeResult {
        changed: false,
        new_hash: scan.hash,
        new_metadata: scan.metadata,
        ..Default::default()
    };

    if prev_hash.is_empty() {
        // First observation: everything counts as added
        result.changed = true;
        result.files_added = scan.file_hint;
        return result;
    }

    if prev_hash == result.new_hash {
        return result;
    }
    result.changed = true;

    let old_hashes = prev_metadata
        .map(|m| &m.file_hashes)
        .filter(|m| !m.is_empty());
    if let Some(old_hashes) = old_hashes {
        if !result.new_metadata.file_hashes.is_empty() {
            let diff = diff_file_hashes(old_hashes, &result.new_metadata.file_hashes);
            result.files_added = diff.added.len() as u32;
            result.files_deleted = diff.deleted.len() as u32;
            result.files_changed = diff.changed.len() as u32;
            result.added_files = diff.added;
            result.deleted_files = diff.deleted;
            result.changed_files = diff.changed;
            return result;
        }
    }

    // No per-file information on one of the sides (HTTP, Git): the whole
    // source counts as changed
    result.files_changed = scan.file_hint;
    result
}

/// Effective sync interval: parsed from the policy with the 5-minute
/// default and 1-minute floor applied.
pub fn sync_interval(ds: &DocumentSet) -> Duration {
    let raw = ds
        .spec
        .sync_policy
        .as_ref()
        .and_then(|p| p.interval.as_deref())
        .unwrap_or("");
    parse_duration_str(raw)
        .unwrap_or(DEFAULT_SYNC_INTERVAL)
        .max(MIN_SYNC_INTERVAL)
}

/// Rate-limit contract: whether a sync is permitted right now, plus a
/// human-readable reason when it is not.
pub fn should_sync(ds: &DocumentSet, now: DateTime<Utc>) -> (bool, String) {
    let Some(policy) = &ds.spec.sync_policy else {
        return (false, "no sync policy configured".to_string());
    };

    if policy.pause_sync {
        return (false, "sync is paused".to_string());
    }

    if policy.mode != SyncMode::Auto {
        return (false, "sync mode is not auto".to_string());
    }

    let interval = sync_interval(ds);
    if let Some(last_check) = ds
        .status
        .as_ref()
        .and_then(|s| s.last_source_check_time.as_ref())
    {
        let elapsed = now
            .signed_duration_since(last_check.0)
            .to_std()
            .unwrap_or_default();
        if elapsed < interval {
            let remaining = interval - elapsed;
            return (
                false,
                format!("waiting for interval ({}s remaining)", remaining.as_secs()),
            );
        }
    }

    (true, "sync interval reached".to_string())
}
