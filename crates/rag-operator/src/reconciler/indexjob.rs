//! IndexJob reconciliation
//!
//! Same lifecycle shape as the embedding task, with two differences: the
//! running phase is called Building, and a successful workload records the
//! alias-swap outcome reported by the worker. Optimizing exists as a hook
//! for vector DBs that separate build and optimize; today it folds
//! straight into Succeeded.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{info, instrument};

use rag_common::Result;

use crate::crd::indexjob::{CONDITION_ALIAS_SWAPPED, CONDITION_INDEX_CREATED, CONDITION_INDEX_OPTIMIZED};
use crate::crd::{now, set_condition, DocumentSet, IndexJob, IndexJobPhase, IndexJobStatus};
use crate::jobs;

use super::{
    ensure_finalizer, is_already_exists, is_not_found, patch_status, remove_finalizer, Context,
    REQUEUE_ACTIVE,
};

pub const INDEXJOB_FINALIZER: &str = "indexjob.rag.ai/finalizer";

/// Reconcile an IndexJob resource
#[instrument(skip(ctx, job), fields(name = %job.name_any()))]
pub async fn reconcile(job: Arc<IndexJob>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = job.namespace().unwrap_or_default();
    let api: Api<IndexJob> = Api::namespaced(ctx.client.clone(), &namespace);

    if job.metadata.deletion_timestamp.is_some() {
        remove_finalizer(&api, job.as_ref(), INDEXJOB_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    if ensure_finalizer(&api, job.as_ref(), INDEXJOB_FINALIZER).await? {
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
        IndexJobPhase::Pending => handle_pending(&api, &job, status, &ctx, &namespace).await,
        IndexJobPhase::Building => handle_building(&api, &job, status, &ctx, &namespace).await,
        // Optimization is currently part of the build; complete it the same way
        _ => handle_workload_succeeded(&api, &job, status).await,
    }
}

async fn initialize_status(api: &Api<IndexJob>, job: &IndexJob) -> Result<Action> {
    let mut status = job.status.clone().unwrap_or_default();
    status.phase = IndexJobPhase::Pending;
    status.message = "IndexJob created, waiting to start".to_string();
    patch_status(api, &job.name_any(), &status).await?;
    Ok(Action::requeue(Duration::ZERO))
}

/// Create the worker workload and move to Building.
async fn handle_pending(
    api: &Api<IndexJob>,
    job: &IndexJob,
    mut status: IndexJobStatus,
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

    let batch_job = jobs::build_index_job(job, &document_set, &ctx.agent_image);
    let batch_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    match batch_api.create(&PostParams::default(), &batch_job).await {
        Ok(created) => info!(job = %created.name_any(), "created index workload"),
        Err(e) if is_already_exists(&e) => info!("index workload already exists"),
        Err(e) => {
            let message = format!("Failed to create Job: {}", e);
            return update_status_failed(api, job, status, message).await;
        }
    }

    status.phase = IndexJobPhase::Building;
    status.message = "Index building started".to_string();
    status.job_ref = batch_job.name_any();
    status.start_time = Some(now());
    set_condition(
        &mut status.conditions,
        CONDITION_INDEX_CREATED,
        false,
        "BuildingIndex",
        "Index build in progress",
    );
    patch_status(api, &job.name_any(), &status).await?;

    Ok(Action::requeue(REQUEUE_ACTIVE))
}

/// Observe the workload and decide success, retry, or keep waiting.
async fn handle_building(
    api: &Api<IndexJob>,
    job: &IndexJob,
    mut status: IndexJobStatus,
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
            info!(job = %job_name, "index workload not found, recreating");
            return initialize_status(api, job).await;
        }
        Err(e) => return Err(e.into()),
    };

    let workload_status = batch_job.status.clone().unwrap_or_default();

    if workload_status.succeeded.unwrap_or(0) > 0 {
        return handle_workload_succeeded(api, job, status).await;
    }

    if workload_status.failed.unwrap_or(0) > 0 {
        let policy = job.spec.retry_policy();
        if status.retry_count < policy.max_retries {
            status.retry_count += 1;
            status.phase = IndexJobPhase::Pending;
            status.message = format!("Retrying ({}/{})", status.retry_count, policy.max_retries);
            info!(retry = status.retry_count, "index workload failed, scheduling retry");
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

    status.message = format!("Index build running: {} active pods", workload_status.active.unwrap_or(0));
    patch_status(api, &job.name_any(), &status).await?;
    Ok(Action::requeue(REQUEUE_ACTIVE))
}

/// Record a successful build: index conditions, the alias-swap outcome
/// performed by the worker, and the terminal Succeeded phase.
async fn handle_workload_succeeded(
    api: &Api<IndexJob>,
    job: &IndexJob,
    mut status: IndexJobStatus,
) -> Result<Action> {
    set_condition(
        &mut status.conditions,
        CONDITION_INDEX_CREATED,
        true,
        "IndexBuilt",
        "Index built successfully",
    );

    if !job.spec.target_alias.is_empty() {
        // The worker swapped the alias as the last step of the build
        set_condition(
            &mut status.conditions,
            CONDITION_ALIAS_SWAPPED,
            true,
            "AliasSwapped",
            &format!(
                "Alias '{}' switched to collection '{}'",
                job.spec.target_alias, job.spec.vector_db.collection
            ),
        );
        status.alias_swapped = true;
    }

    status.phase = IndexJobPhase::Succeeded;
    status.message = "Index building completed successfully".to_string();
    status.completion_time = Some(now());
    set_condition(
        &mut status.conditions,
        CONDITION_INDEX_OPTIMIZED,
        true,
        "IndexOptimized",
        "Index optimized and ready for queries",
    );
    patch_status(api, &job.name_any(), &status).await?;

    Ok(Action::await_change())
}

async fn update_status_failed(
    api: &Api<IndexJob>,
    job: &IndexJob,
    mut status: IndexJobStatus,
    message: String,
) -> Result<Action> {
    status.phase = IndexJobPhase::Failed;
    status.message = message;
    status.completion_time = Some(now());
    patch_status(api, &job.name_any(), &status).await?;
    Ok(Action::await_change())
}
