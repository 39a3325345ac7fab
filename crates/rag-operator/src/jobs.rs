//! Worker workload builders
//!
//! Pure functions producing the batch Job specification for a task. No
//! cluster calls happen here, so the full worker contract (env names,
//! labels, resources) is covered by unit tests. The env variable names are
//! consumed verbatim by the worker container and must not change.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretEnvSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{DocumentSet, EmbeddingJob, IndexJob};

/// Default worker image when none is configured
pub const DEFAULT_AGENT_IMAGE: &str = "rag-agent:latest";

const JOB_BACKOFF_LIMIT: i32 = 3;
const JOB_TTL_SECONDS: i32 = 3600;

/// Build the batch Job that runs chunking and embedding for an EmbeddingJob.
pub fn build_embedding_job(embedding_job: &EmbeddingJob, document_set: &DocumentSet, image: &str) -> Job {
    let name = embedding_job.name_any();
    let spec = &embedding_job.spec;
    let ds_spec = &document_set.spec;

    let mut env = vec![
        env_var("DOCUMENT_SET_NAME", &spec.document_set),
        env_var("DOCUMENT_SET_NAMESPACE", &embedding_job.namespace().unwrap_or_default()),
        env_var("EMBEDDING_MODEL", &spec.embedding_model),
        env_var("VECTOR_DB_TYPE", spec.vector_db.db_type.as_str()),
        env_var("VECTOR_DB_COLLECTION", &spec.vector_db.collection),
        env_var("SOURCE_TYPE", ds_spec.source.source_type.as_str()),
        env_var("SOURCE_URI", &ds_spec.source.uri),
        env_var("CHUNK_SIZE", &ds_spec.chunking.size.to_string()),
        env_var("CHUNK_OVERLAP", &ds_spec.chunking.overlap.to_string()),
        env_var("BATCH_SIZE", &ds_spec.embedding.batch_size.to_string()),
    ];
    if !spec.vector_db.endpoint.is_empty() {
        env.push(env_var("VECTOR_DB_ENDPOINT", &spec.vector_db.endpoint));
    }

    let mut env_from = Vec::new();
    if let Some(secret_ref) = &ds_spec.source.secret_ref {
        env_from.push(secret_env_from(&secret_ref.name));
    }
    if let Some(secret_ref) = &spec.vector_db.secret_ref {
        env_from.push(secret_env_from(&secret_ref.name));
    }

    let labels = BTreeMap::from([
        ("rag.ai/embedding-job".to_string(), name.clone()),
        ("rag.ai/documentset".to_string(), spec.document_set.clone()),
        ("rag.ai/job-type".to_string(), "embedding".to_string()),
    ]);
    let pod_labels = BTreeMap::from([
        ("rag.ai/embedding-job".to_string(), name.clone()),
        ("rag.ai/job-type".to_string(), "embedding".to_string()),
    ]);

    build_job(
        embedding_job.controller_owner_ref(&()),
        &name,
        embedding_job.namespace(),
        labels,
        pod_labels,
        Container {
            name: "embedding-worker".to_string(),
            image: Some(image.to_string()),
            command: Some(vec!["python".to_string(), "scripts/run_embedding_job.py".to_string()]),
            args: Some(vec![spec.document_set.clone()]),
            env: Some(env),
            env_from: Some(env_from),
            resources: Some(worker_resources()),
            ..Default::default()
        },
    )
}

/// Build the batch Job that runs index construction (and the alias swap)
/// for an IndexJob.
pub fn build_index_job(index_job: &IndexJob, _document_set: &DocumentSet, image: &str) -> Job {
    let name = index_job.name_any();
    let spec = &index_job.spec;

    let mut env = vec![
        env_var("INDEX_JOB_NAME", &name),
        env_var("DOCUMENT_SET_NAME", &spec.document_set),
        env_var("DOCUMENT_SET_NAMESPACE", &index_job.namespace().unwrap_or_default()),
        env_var("VECTOR_DB_TYPE", spec.vector_db.db_type.as_str()),
        env_var("VECTOR_DB_COLLECTION", &spec.vector_db.collection),
        env_var("TARGET_ALIAS", &spec.target_alias),
        env_var("INDEX_TYPE", spec.index_spec.index_type.as_str()),
    ];
    for (key, value) in &spec.index_spec.parameters {
        env.push(env_var(&format!("INDEX_PARAM_{}", key), value));
    }
    if !spec.vector_db.endpoint.is_empty() {
        env.push(env_var("VECTOR_DB_ENDPOINT", &spec.vector_db.endpoint));
    }

    let mut env_from = Vec::new();
    if let Some(secret_ref) = &spec.vector_db.secret_ref {
        env_from.push(secret_env_from(&secret_ref.name));
    }

    let labels = BTreeMap::from([
        ("rag.ai/index-job".to_string(), name.clone()),
        ("rag.ai/documentset".to_string(), spec.document_set.clone()),
        ("rag.ai/job-type".to_string(), "index".to_string()),
    ]);
    let pod_labels = BTreeMap::from([
        ("rag.ai/index-job".to_string(), name.clone()),
        ("rag.ai/job-type".to_string(), "index".to_string()),
    ]);

    build_job(
        index_job.controller_owner_ref(&()),
        &name,
        index_job.namespace(),
        labels,
        pod_labels,
        Container {
            name: "index-worker".to_string(),
            image: Some(image.to_string()),
            command: Some(vec!["python".to_string(), "scripts/run_index_job.py".to_string()]),
            args: Some(vec![name.clone()]),
            env: Some(env),
            env_from: Some(env_from),
            resources: Some(worker_resources()),
            ..Default::default()
        },
    )
}

fn build_job(
    owner_ref: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>,
    task_name: &str,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    pod_labels: BTreeMap<String, String>,
    container: Container,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(format!("{}-job", task_name)),
            namespace,
            labels: Some(labels),
            owner_references: owner_ref.map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// CPU request 500m / limit 2, memory request 1Gi / limit 4Gi
fn worker_resources() -> ResourceRequirements {
    let requests = BTreeMap::from([
        ("cpu".to_string(), Quantity("500m".to_string())),
        ("memory".to_string(), Quantity("1Gi".to_string())),
    ]);
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity("2".to_string())),
        ("memory".to_string(), Quantity("4Gi".to_string())),
    ]);
    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_env_from(name: &str) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: name.to_string(),
            optional: None,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ChunkingSpec, DocumentSetSpec, EmbeddingJobSpec, EmbeddingSpec, IndexConfig, IndexJobSpec,
        IndexSpec, SecretReference, SourceSpec, SourceType, VectorDbSpec, VectorDbType,
    };

    fn document_set() -> DocumentSet {
        let mut ds = DocumentSet::new(
            "docs",
            DocumentSetSpec {
                source: SourceSpec {
                    source_type: SourceType::S3,
                    uri: "s3://bucket/prefix/".into(),
                    secret_ref: Some(SecretReference { name: "aws-creds".into() }),
                },
                chunking: ChunkingSpec {
                    size: 512,
                    overlap: 100,
                    format: Default::default(),
                },
                embedding: EmbeddingSpec {
                    model: "bge-m3".into(),
                    device: Default::default(),
                    batch_size: 32,
                    auto_retry: true,
                },
                index: IndexSpec {
                    vector_db: VectorDbType::Milvus,
                    collection: "kb".into(),
                    alias: "kb_live".into(),
                    recreate: false,
                },
                sync_policy: None,
            },
        );
        ds.metadata.namespace = Some("rag".into());
        ds.metadata.uid = Some("uid-ds".into());
        ds
    }

    fn embedding_job() -> EmbeddingJob {
        let mut job = EmbeddingJob::new(
            "docs-embedding-20240102030405",
            EmbeddingJobSpec {
                document_set: "docs".into(),
                embedding_model: "bge-m3".into(),
                vector_db: VectorDbSpec {
                    db_type: VectorDbType::Milvus,
                    collection: "kb_20240102030405".into(),
                    endpoint: String::new(),
                    secret_ref: Some(SecretReference { name: "milvus-creds".into() }),
                },
                retry_policy: None,
            },
        );
        job.metadata.namespace = Some("rag".into());
        job.metadata.uid = Some("uid-ej".into());
        job
    }

    fn env_value<'a>(env: &'a [EnvVar], name: &str) -> Option<&'a str> {
        env.iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn test_embedding_job_worker_contract() {
        let job = build_embedding_job(&embedding_job(), &document_set(), "rag-agent:v2");
        assert_eq!(job.metadata.name.as_deref(), Some("docs-embedding-20240102030405-job"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("rag"));

        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("rag-agent:v2"));
        assert_eq!(
            container.command.as_ref().unwrap(),
            &["python", "scripts/run_embedding_job.py"]
        );
        assert_eq!(container.args.as_ref().unwrap(), &["docs"]);

        let env = container.env.as_ref().unwrap();
        assert_eq!(env_value(env, "DOCUMENT_SET_NAME"), Some("docs"));
        assert_eq!(env_value(env, "DOCUMENT_SET_NAMESPACE"), Some("rag"));
        assert_eq!(env_value(env, "EMBEDDING_MODEL"), Some("bge-m3"));
        assert_eq!(env_value(env, "VECTOR_DB_TYPE"), Some("milvus"));
        assert_eq!(env_value(env, "VECTOR_DB_COLLECTION"), Some("kb_20240102030405"));
        assert_eq!(env_value(env, "SOURCE_TYPE"), Some("s3"));
        assert_eq!(env_value(env, "SOURCE_URI"), Some("s3://bucket/prefix/"));
        assert_eq!(env_value(env, "CHUNK_SIZE"), Some("512"));
        assert_eq!(env_value(env, "CHUNK_OVERLAP"), Some("100"));
        assert_eq!(env_value(env, "BATCH_SIZE"), Some("32"));
        // No endpoint configured
        assert_eq!(env_value(env, "VECTOR_DB_ENDPOINT"), None);

        // Both the source and vector DB secrets are wired through
        let env_from = container.env_from.as_ref().unwrap();
        let secret_names: Vec<_> = env_from
            .iter()
            .filter_map(|e| e.secret_ref.as_ref().map(|s| s.name.as_str()))
            .collect();
        assert_eq!(secret_names, vec!["aws-creds", "milvus-creds"]);
    }

    #[test]
    fn test_embedding_job_labels_and_retention() {
        let job = build_embedding_job(&embedding_job(), &document_set(), DEFAULT_AGENT_IMAGE);

        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("rag.ai/embedding-job").unwrap(), "docs-embedding-20240102030405");
        assert_eq!(labels.get("rag.ai/documentset").unwrap(), "docs");
        assert_eq!(labels.get("rag.ai/job-type").unwrap(), "embedding");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(3));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));

        let owners = job.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "EmbeddingJob");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_index_job_worker_contract() {
        let mut index_job = IndexJob::new(
            "docs-index-20240102030405",
            IndexJobSpec {
                document_set: "docs".into(),
                vector_db: VectorDbSpec {
                    db_type: VectorDbType::Milvus,
                    collection: "kb_20240102030405".into(),
                    endpoint: "http://milvus:19530".into(),
                    secret_ref: None,
                },
                target_alias: "kb_live".into(),
                index_spec: IndexConfig::default_hnsw(),
                retry_policy: None,
            },
        );
        index_job.metadata.namespace = Some("rag".into());
        index_job.metadata.uid = Some("uid-ij".into());

        let job = build_index_job(&index_job, &document_set(), DEFAULT_AGENT_IMAGE);
        let container = &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.command.as_ref().unwrap(),
            &["python", "scripts/run_index_job.py"]
        );
        assert_eq!(container.args.as_ref().unwrap(), &["docs-index-20240102030405"]);

        let env = container.env.as_ref().unwrap();
        assert_eq!(env_value(env, "INDEX_JOB_NAME"), Some("docs-index-20240102030405"));
        assert_eq!(env_value(env, "TARGET_ALIAS"), Some("kb_live"));
        assert_eq!(env_value(env, "INDEX_TYPE"), Some("HNSW"));
        assert_eq!(env_value(env, "INDEX_PARAM_efConstruction"), Some("200"));
        assert_eq!(env_value(env, "INDEX_PARAM_M"), Some("16"));
        assert_eq!(env_value(env, "VECTOR_DB_ENDPOINT"), Some("http://milvus:19530"));

        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("rag.ai/job-type").unwrap(), "index");
    }

    #[test]
    fn test_worker_resources() {
        let resources = worker_resources();
        let requests = resources.requests.unwrap();
        let limits = resources.limits.unwrap();
        assert_eq!(requests.get("cpu").unwrap().0, "500m");
        assert_eq!(requests.get("memory").unwrap().0, "1Gi");
        assert_eq!(limits.get("cpu").unwrap().0, "2");
        assert_eq!(limits.get("memory").unwrap().0, "4Gi");
    }
}
