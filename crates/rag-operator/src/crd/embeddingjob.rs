//! EmbeddingJob Custom Resource
//!
//! Child work unit of a DocumentSet: one attempt at chunking the source and
//! upserting embeddings into a vector collection. The heavy lifting happens
//! in a worker container; this resource tracks its lifecycle.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{RetryPolicy, VectorDbSpec};

// EmbeddingJob condition types
pub const CONDITION_JOB_STARTED: &str = "JobStarted";
pub const CONDITION_VECTOR_UPSERTED: &str = "VectorUpserted";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "rag.ai",
    version = "v1alpha1",
    kind = "EmbeddingJob",
    plural = "embeddingjobs",
    shortname = "ej",
    status = "EmbeddingJobStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJobSpec {
    /// Name of the owning DocumentSet
    pub document_set: String,

    /// Model used for embedding generation
    pub embedding_model: String,

    /// Where the produced vectors are stored
    #[serde(rename = "vectorDB")]
    pub vector_db: VectorDbSpec,

    /// Retry policy for the underlying workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl EmbeddingJobSpec {
    /// Effective retry policy with defaults applied
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }
}

/// Embedding task phase
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum EmbeddingJobPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl EmbeddingJobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EmbeddingJobPhase::Succeeded | EmbeddingJobPhase::Failed)
    }
}

/// Progress written by the worker through the status subresource
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    #[serde(default)]
    pub total_chunks: u32,

    #[serde(default)]
    pub processed_chunks: u32,

    /// Completion percentage (0-100)
    #[serde(default)]
    pub percentage: u32,
}

/// Observed state of an EmbeddingJob
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJobStatus {
    #[serde(default)]
    pub phase: EmbeddingJobPhase,

    #[serde(default)]
    pub progress: JobProgress,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Name of the underlying batch Job
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_ref: String,

    /// Number of workload retries performed so far
    #[serde(default)]
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(EmbeddingJobPhase::Succeeded.is_terminal());
        assert!(EmbeddingJobPhase::Failed.is_terminal());
        assert!(!EmbeddingJobPhase::Pending.is_terminal());
        assert!(!EmbeddingJobPhase::Running.is_terminal());
    }

    #[test]
    fn test_spec_wire_names() {
        let json = r#"{
            "documentSet": "docs",
            "embeddingModel": "bge-m3",
            "vectorDB": {"type": "milvus", "collection": "kb_20240101000000"}
        }"#;
        let spec: EmbeddingJobSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.document_set, "docs");
        assert_eq!(spec.vector_db.collection, "kb_20240101000000");
        assert_eq!(spec.retry_policy().max_retries, 3);
    }
}
