//! Kubernetes Custom Resource Definitions for the RAG pipeline
//!
//! Three kinds under group `rag.ai/v1alpha1`:
//! - `DocumentSet`: the declarative root describing a corpus source, its
//!   chunking/embedding recipe and indexing target
//! - `EmbeddingJob`: one attempt at producing vectors from the source
//! - `IndexJob`: one attempt at building a vector index over them
//!
//! Field names are wire-stable: end-users consume them through kubectl
//! printer columns and the worker containers read them back.

pub mod documentset;
pub mod embeddingjob;
pub mod indexjob;

pub use documentset::{
    ChunkingSpec, DocumentSet, DocumentSetPhase, DocumentSetSpec, DocumentSetStatus,
    EmbeddingSpec, IndexSpec, SourceMetadata, SourceSpec, SourceType, SyncMode, SyncPolicy,
    SyncState, SyncStatus, TriggerOn,
};
pub use embeddingjob::{EmbeddingJob, EmbeddingJobPhase, EmbeddingJobSpec, EmbeddingJobStatus, JobProgress};
pub use indexjob::{IndexConfig, IndexJob, IndexJobPhase, IndexJobSpec, IndexJobStatus, IndexProgress, IndexType};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a secret in the same namespace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the secret
    pub name: String,
}

/// Vector database types supported by the worker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VectorDbType {
    #[default]
    Milvus,
    Qdrant,
    Weaviate,
}

impl VectorDbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorDbType::Milvus => "milvus",
            VectorDbType::Qdrant => "qdrant",
            VectorDbType::Weaviate => "weaviate",
        }
    }
}

/// Vector database connection settings carried by child tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VectorDbSpec {
    /// Type of vector database: milvus, qdrant, weaviate
    #[serde(rename = "type")]
    pub db_type: VectorDbType,

    /// Collection name to store vectors
    pub collection: String,

    /// Endpoint of the vector database
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Secret with vector database credentials, passed through to the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// Retry policy for a child task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff between attempts in seconds
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_seconds() -> u32 {
    30
}

/// Set or update a condition in a status condition list.
///
/// Mirrors the apimachinery helper semantics: `lastTransitionTime` only
/// advances when the condition's boolean status actually flips; reason and
/// message are refreshed unconditionally.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
) {
    let status_str = if status { "True" } else { "False" };
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status_str {
            existing.last_transition_time = Time(Utc::now());
        }
        existing.status = status_str.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return;
    }
    conditions.push(Condition {
        type_: type_.to_string(),
        status: status_str.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    });
}

/// Current time as a Kubernetes metadata timestamp
pub fn now() -> Time {
    Time(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_inserts() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "EmbeddingCompleted", true, "JobSucceeded", "done");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "EmbeddingCompleted");
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason, "JobSucceeded");
    }

    #[test]
    fn test_set_condition_updates_in_place() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "ChunkingCompleted", false, "EmbeddingJobCreated", "waiting");
        let first_transition = conditions[0].last_transition_time.clone();

        // Same status: message refreshed, transition time untouched
        set_condition(&mut conditions, "ChunkingCompleted", false, "EmbeddingJobCreated", "still waiting");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "still waiting");
        assert_eq!(conditions[0].last_transition_time, first_transition);

        // Flipped status: transition time advances
        set_condition(&mut conditions, "ChunkingCompleted", true, "ChunksReady", "done");
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn test_vector_db_type_wire_names() {
        assert_eq!(serde_json::to_string(&VectorDbType::Milvus).unwrap(), r#""milvus""#);
        assert_eq!(serde_json::to_string(&VectorDbType::Qdrant).unwrap(), r#""qdrant""#);
        assert_eq!(VectorDbType::Weaviate.as_str(), "weaviate");
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_seconds, 30);
    }
}
