//! IndexJob Custom Resource
//!
//! Child work unit of a DocumentSet: one attempt at building a vector index
//! over a freshly embedded collection, finishing with the alias swap that
//! activates it for readers.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{RetryPolicy, VectorDbSpec};

// IndexJob condition types
pub const CONDITION_INDEX_CREATED: &str = "IndexCreated";
pub const CONDITION_INDEX_OPTIMIZED: &str = "IndexOptimized";
pub const CONDITION_ALIAS_SWAPPED: &str = "AliasSwapped";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "rag.ai",
    version = "v1alpha1",
    kind = "IndexJob",
    plural = "indexjobs",
    shortname = "ij",
    status = "IndexJobStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IndexJobSpec {
    /// Name of the owning DocumentSet
    pub document_set: String,

    /// Collection the index is built over
    #[serde(rename = "vectorDB")]
    pub vector_db: VectorDbSpec,

    /// Alias to repoint at the collection once the index is ready; empty
    /// disables the swap
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_alias: String,

    /// Index algorithm and parameters
    pub index_spec: IndexConfig,

    /// Retry policy for the underlying workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl IndexJobSpec {
    /// Effective retry policy with defaults applied
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }
}

/// Index algorithm types
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum IndexType {
    #[default]
    #[serde(rename = "HNSW")]
    Hnsw,
    #[serde(rename = "IVF_FLAT")]
    IvfFlat,
    #[serde(rename = "IVF_PQ")]
    IvfPq,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Hnsw => "HNSW",
            IndexType::IvfFlat => "IVF_FLAT",
            IndexType::IvfPq => "IVF_PQ",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    /// Index algorithm
    #[serde(rename = "type")]
    pub index_type: IndexType,

    /// Algorithm parameters passed to the worker verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl IndexConfig {
    /// Default HNSW configuration used for operator-created IndexJobs
    pub fn default_hnsw() -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("efConstruction".to_string(), "200".to_string());
        parameters.insert("M".to_string(), "16".to_string());
        Self {
            index_type: IndexType::Hnsw,
            parameters,
        }
    }
}

/// Index task phase
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum IndexJobPhase {
    #[default]
    Pending,
    Building,
    Optimizing,
    Succeeded,
    Failed,
}

impl IndexJobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IndexJobPhase::Succeeded | IndexJobPhase::Failed)
    }
}

/// Progress written by the worker through the status subresource
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexProgress {
    #[serde(default)]
    pub indexed_vectors: u32,

    #[serde(default)]
    pub total_vectors: u32,

    /// Completion percentage (0-100)
    #[serde(default)]
    pub percentage: u32,
}

/// Observed state of an IndexJob
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexJobStatus {
    #[serde(default)]
    pub phase: IndexJobPhase,

    #[serde(default)]
    pub progress: IndexProgress,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Name of the underlying batch Job
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_ref: String,

    /// Whether the worker reported the alias swap for this collection
    #[serde(default)]
    pub alias_swapped: bool,

    /// Number of workload retries performed so far
    #[serde(default)]
    pub retry_count: u32,
}
