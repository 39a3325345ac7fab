//! DocumentSet Custom Resource
//!
//! The declarative root of the pipeline. A user describes where the corpus
//! lives, how it is chunked and embedded, and which collection/alias the
//! index targets; the operator drives everything else and keeps the index
//! in sync with the source.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{SecretReference, VectorDbType};

// DocumentSet condition types
pub const CONDITION_CHUNKING_COMPLETED: &str = "ChunkingCompleted";
pub const CONDITION_EMBEDDING_COMPLETED: &str = "EmbeddingCompleted";
pub const CONDITION_INDEXING_COMPLETED: &str = "IndexingCompleted";

/// DocumentSet Custom Resource
///
/// The operator watches DocumentSets and runs the three-stage pipeline
/// (chunk/embed, index, alias swap) through child EmbeddingJob and
/// IndexJob resources.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "rag.ai",
    version = "v1alpha1",
    kind = "DocumentSet",
    plural = "documentsets",
    shortname = "ds",
    status = "DocumentSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSetSpec {
    /// Where the documents are located
    pub source: SourceSpec,

    /// How to split the documents
    pub chunking: ChunkingSpec,

    /// Model and parameters for embedding generation
    pub embedding: EmbeddingSpec,

    /// Vector database and collection settings
    pub index: IndexSpec,

    /// Periodic source synchronization policy; absent means manual only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

/// Document source types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    S3,
    Http,
    Git,
    Pvc,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::S3 => "s3",
            SourceType::Http => "http",
            SourceType::Git => "git",
            SourceType::Pvc => "pvc",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Type of source: s3, http, git, pvc
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// URI to the source: `s3://bucket[/prefix]`, `http(s)://...`,
    /// `<git-url>[#<branch>]`, `pvc://<pvc-name>[/subpath]`
    pub uri: String,

    /// Secret with source credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// Document formats understood by the chunker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingSpec {
    /// Size of each chunk in characters (minimum 100)
    #[serde(default = "default_chunk_size")]
    pub size: u32,

    /// Overlap between chunks in characters
    #[serde(default = "default_chunk_overlap")]
    pub overlap: u32,

    /// Format of the documents
    #[serde(default)]
    pub format: ChunkFormat,
}

fn default_chunk_size() -> u32 {
    512
}

fn default_chunk_overlap() -> u32 {
    100
}

/// Device the embedding model runs on
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingSpec {
    /// Model name for embedding generation
    pub model: String,

    /// Device to run embedding on
    #[serde(default)]
    pub device: Device,

    /// Batch size for embedding generation (minimum 1)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Automatically restart a failed pipeline after a cool-down
    #[serde(default = "default_true")]
    pub auto_retry: bool,
}

fn default_batch_size() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    /// Vector database type
    #[serde(rename = "vectorDB")]
    pub vector_db: VectorDbType,

    /// Base collection name; each cycle appends a timestamp
    pub collection: String,

    /// Stable alias atomically repointed at the freshly indexed collection
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,

    /// Force recreation of the collection
    #[serde(default)]
    pub recreate: bool,
}

/// Sync mode: only `auto` syncs without user intervention
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Auto,
    Manual,
}

/// What kind of source fingerprint triggers a sync
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum TriggerOn {
    #[default]
    #[serde(rename = "contentHash")]
    ContentHash,
    #[serde(rename = "modifiedTime")]
    ModifiedTime,
    #[serde(rename = "gitCommit")]
    GitCommit,
    #[serde(rename = "s3ETag")]
    S3ETag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Sync mode
    #[serde(default)]
    pub mode: SyncMode,

    /// Interval between source checks ("5m", "1h"); floor 1 minute,
    /// default 5 minutes on absent or malformed values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// What change signal triggers a sync
    #[serde(default)]
    pub trigger_on: TriggerOn,

    /// Compute per-file diffs where the source model supports it
    #[serde(default = "default_true")]
    pub incremental_sync: bool,

    /// Maximum concurrent sync cycles for this DocumentSet
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: u32,

    /// Pause automatic syncing without removing the policy
    #[serde(default)]
    pub pause_sync: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            interval: None,
            trigger_on: TriggerOn::default(),
            incremental_sync: true,
            max_concurrent_syncs: default_max_concurrent_syncs(),
            pause_sync: false,
        }
    }
}

fn default_max_concurrent_syncs() -> u32 {
    1
}

/// Pipeline phase
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum DocumentSetPhase {
    #[default]
    Pending,
    Embedding,
    Indexing,
    Ready,
    Failed,
}

/// Sync loop state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum SyncState {
    #[default]
    Idle,
    Checking,
    Syncing,
    Completed,
    Failed,
}

/// Live state of the sync loop
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(default)]
    pub state: SyncState,

    #[serde(default)]
    pub changes_detected: bool,

    #[serde(default)]
    pub files_added: u32,

    #[serde(default)]
    pub files_deleted: u32,

    #[serde(default)]
    pub files_changed: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Time>,
}

/// Fingerprint of the source contents at the last successful check
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    /// Number of files observed
    #[serde(default)]
    pub file_count: u32,

    /// Total byte size observed
    #[serde(default)]
    pub total_size: i64,

    /// Per-file content digests, keyed by object key or relative path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_hashes: BTreeMap<String, String>,

    /// Branch a git source was resolved against
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_branch: String,

    /// Remote tip commit of a git source
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_commit_hash: String,

    /// ETag of an HTTP source
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "s3ETag")]
    pub s3_etag: String,

    /// Latest modification time observed on a PVC source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<Time>,
}

/// Observed state of a DocumentSet
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSetStatus {
    /// Current stage of the pipeline
    #[serde(default)]
    pub phase: DocumentSetPhase,

    /// Human-readable detail about the current status
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Detailed status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Name of the last created EmbeddingJob
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_embedding_job_ref: String,

    /// Name of the last created IndexJob
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_index_job_ref: String,

    /// Active timestamped collection name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_collection: String,

    /// Number of chunks processed by the last embedding run
    #[serde(default)]
    pub total_chunks: u32,

    /// Number of vectors indexed by the last index run
    #[serde(default)]
    pub total_vectors: u32,

    /// Sync loop state
    #[serde(default)]
    pub sync_status: SyncStatus,

    /// Source digest of the last sync that reached Ready; never updated on
    /// a check failure, so transient outages re-trigger on the next tick
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_source_hash: String,

    /// Digest of a detected change, held until the resulting cycle reaches
    /// Ready and it is promoted into `lastSourceHash`. Serialized even when
    /// null so a merge patch can clear it.
    pub pending_source_hash: Option<String>,

    /// Per-source fingerprint details from the most recent successful check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_metadata: Option<SourceMetadata>,

    /// When the source was last checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_source_check_time: Option<Time>,

    /// When a sync cycle last completed successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_sync_time: Option<Time>,

    /// Number of completed sync cycles
    #[serde(default)]
    pub sync_count: u32,

    /// When the status was last updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    /// Last spec generation ingested by the reconciler
    #[serde(default)]
    pub observed_generation: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_wire_names() {
        // Printer columns and user tooling key off these exact strings.
        assert_eq!(serde_json::to_string(&DocumentSetPhase::Pending).unwrap(), r#""Pending""#);
        assert_eq!(serde_json::to_string(&DocumentSetPhase::Embedding).unwrap(), r#""Embedding""#);
        assert_eq!(serde_json::to_string(&DocumentSetPhase::Ready).unwrap(), r#""Ready""#);
    }

    #[test]
    fn test_spec_round_trip() {
        let json = r#"{
            "source": {"type": "s3", "uri": "s3://docs/corpus/", "secretRef": {"name": "aws-creds"}},
            "chunking": {"size": 512, "overlap": 100, "format": "markdown"},
            "embedding": {"model": "bge-m3", "device": "gpu", "batchSize": 32},
            "index": {"vectorDB": "milvus", "collection": "kb", "alias": "kb_live"},
            "syncPolicy": {"mode": "auto", "interval": "5m", "triggerOn": "s3ETag"}
        }"#;
        let spec: DocumentSetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.source.source_type, SourceType::S3);
        assert_eq!(spec.embedding.batch_size, 32);
        assert!(spec.embedding.auto_retry); // defaulted
        assert_eq!(spec.index.vector_db, VectorDbType::Milvus);
        assert_eq!(spec.index.alias, "kb_live");
        let policy = spec.sync_policy.unwrap();
        assert_eq!(policy.trigger_on, TriggerOn::S3ETag);
        assert_eq!(policy.max_concurrent_syncs, 1);
        assert!(policy.incremental_sync);
    }

    #[test]
    fn test_spec_defaults() {
        let json = r#"{
            "source": {"type": "pvc", "uri": "pvc://corpus"},
            "chunking": {},
            "embedding": {"model": "all-MiniLM-L6-v2"},
            "index": {"vectorDB": "qdrant", "collection": "kb"}
        }"#;
        let spec: DocumentSetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.chunking.size, 512);
        assert_eq!(spec.chunking.overlap, 100);
        assert_eq!(spec.chunking.format, ChunkFormat::Text);
        assert_eq!(spec.embedding.device, Device::Cpu);
        assert_eq!(spec.embedding.batch_size, 16);
        assert!(spec.sync_policy.is_none());
    }

    #[test]
    fn test_source_metadata_etag_wire_name() {
        let meta = SourceMetadata {
            s3_etag: "\"abc\"".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("s3ETag").is_some());
    }
}
