//! EmbeddingJob reconciliation
//!
//! Lifecycle of one embedding attempt: create the worker workload, observe
//! it, retry with backoff on workload failure, and report a terminal
//! phase. Terminal tasks are immutable; the only mutation after that point
//! is deletion.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{info, instrument};

use rag_common::Result;

use crate::crd::embeddingjob::{CONDITION_JOB_STARTED, CONDITION_VECTOR_UPSERTED};
use crate::crd::{now, set_condition, DocumentSet, EmbeddingJob, EmbeddingJobPhase, EmbeddingJobStatus};
use crate::jobs;

use super::{
    ensure_finalizer, is_already_exists, is_not_found, patch_status, remove_finalizer, Context,
    REQUEUE_ACTIVE,
};

pub const EMBEDDINGJOB_FINALIZER: &str = "embeddingjob.rag.ai/finalizer";

/// Reconcile an EmbeddingJob resource
#[instrument(skip(ctx, job), fields(name = %job.name_any()))]
pub async fn reconcile(job: Arc<EmbeddingJob>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = job.namespace().unwrap_or_default();
    let api: Api<EmbeddingJob> = Api::namespaced(ctx.client.clone(), &namespace);

    if job.metadata.deletion_timestamp.is_some() {
        // The underlying batch Job is garbage-collected via owner references
        remove_finalizer(&api, job.as_ref(), EMBEDDINGJOB_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    if ensure_finalizer(&api, job.as_ref(), EMBEDDINGJOB_FINALIZER).await? {
        return Ok(Action::requeue(Duration::ZERO));
    }

    let Some(status) = job.status.clone() else {
        return initialize_status(&api, &job).await;
    };

    // Terminal tasks are immutable
    if status.phase.is_terminal() {
        return Ok(Action::await_change());
    }

    match status.phase {
        EmbeddingJobPhase::Pending => handle_pending(&api, &job, status, &ctx, &namespace).await,
        _ => handle_running(&api, &job, status, &ctx, &namespace).await,
    }
}

async fn initialize_status(api: &Api<EmbeddingJob>, job: &EmbeddingJob) -> Result<Action> {
    let mut status = job.status.clone().unwrap_or_default();
    status.phase = EmbeddingJobPhase::Pending;
    status.message = "EmbeddingJob created, waiting to start".to_string();
    patch_status(api, &job.name_any(), &status).await?;
    Ok(Action::requeue(Duration::ZERO))
}

/// Create the worker workload and move to Running.
async fn handle_pending(
    api: &Api<EmbeddingJob>,
    job: &EmbeddingJob,
    mut status: EmbeddingJobStatus,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    let document_sets: Api<DocumentSet> = Api::namespaced(ctx.client.clone(), namespace);
    let document_set = match document_sets.get(&job.spec.document_set).await {
        Ok(ds) => ds,
        Err(e) if is_not_found(&e) => {
            let message = format!("Failed to get DocumentSet: {}", e);
            return update_status_failed(api, job, status, message).await;
        }
        Err(e) => return Err(e.into()),
    };

    let batch_job = jobs::build_embedding_job(job, &document_set, &ctx.agent_image);
    let batch_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    match batch_api.create(&PostParams::default(), &batch_job).await {
        Ok(created) => info!(job = %created.name_any(), "created embedding workload"),
        Err(e) if is_already_exists(&e) => info!("embedding workload already exists"),
        Err(e) => {
            let message = format!("Failed to create Job: {}", e);
            return update_status_failed(api, job, status, message).await;
        }
    }

    status.phase = EmbeddingJobPhase::Running;
    status.message = "Kubernetes Job created, processing embeddings".to_string();
    status.job_ref = batch_job.name_any();
    status.start_time = Some(now());
    set_condition(
        &mut status.conditions,
        CONDITION_JOB_STARTED,
        true,
        "JobCreated",
        "Kubernetes Job created successfully",
    );
    patch_status(api, &job.name_any(), &status).await?;

    Ok(Action::requeue(REQUEUE_ACTIVE))
}

/// Observe the workload and decide success, retry, or keep waiting.
async fn handle_running(
    api: &Api<EmbeddingJob>,
    job: &EmbeddingJob,
    mut status: EmbeddingJobStatus,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    let job_name = if status.job_ref.is_empty() {
        format!("{}-job", job.name_any())
    } else {
        status.job_ref.clone()
    };

    let batch_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let batch_job = match batch_api.get(&job_name).await {
        Ok(j) => j,
        Err(e) if is_not_found(&e) => {
            // Workload lost: start the attempt over
            info!(job = %job_name, "embedding workload not found, recreating");
            return initialize_status(api, job).await;
        }
        Err(e) => return Err(e.into()),
    };

    let workload_status = batch_job.status.clone().unwrap_or_default();

    if workload_status.succeeded.unwrap_or(0) > 0 {
        status.phase = EmbeddingJobPhase::Succeeded;
        status.message = "Embedding generation completed successfully".to_string();
        status.completion_time = Some(now());
        set_condition(
            &mut status.conditions,
            CONDITION_VECTOR_UPSERTED,
            true,
            "JobSucceeded",
            "All vectors upserted to vector database",
        );
        patch_status(api, &job.name_any(), &status).await?;
        return Ok(Action::await_change());
    }

    if workload_status.failed.unwrap_or(0) > 0 {
        let policy = job.spec.retry_policy();
        if status.retry_count < policy.max_retries {
            status.retry_count += 1;
            status.phase = EmbeddingJobPhase::Pending;
            status.message = format!("Retrying ({}/{})", status.retry_count, policy.max_retries);
            info!(retry = status.retry_count, "embedding workload failed, scheduling retry");
            patch_status(api, &job.name_any(), &status).await?;

            match batch_api.delete(&job_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(Action::requeue(Duration::from_secs(policy.backoff_seconds as u64)));
        }
        return update_status_failed(api, job, status, "Job failed after maximum retries".to_string()).await;
    }

    status.message = format!("Job running: {} active pods", workload_status.active.unwrap_or(0));
    patch_status(api, &job.name_any(), &status).await?;
    Ok(Action::requeue(REQUEUE_ACTIVE))
}

async fn update_status_failed(
    api: &Api<EmbeddingJob>,
    job: &EmbeddingJob,
    mut status: EmbeddingJobStatus,
    message: String,
) -> Result<Action> {
    status.phase = EmbeddingJobPhase::Failed;
    status.message = message;
    status.completion_time = Some(now());
    patch_status(api, &job.name_any(), &status).await?;
    Ok(Action::await_change())
}
