//! DocumentSet reconciliation
//!
//! The root state machine. A spec change or a detected source change drives
//! one sync cycle: Pending (create EmbeddingJob) -> Embedding (wait) ->
//! Indexing (create IndexJob, wait) -> Ready. While Ready, the source is
//! re-checked every sync interval; a detected change allocates a fresh
//! timestamped collection and starts the next cycle. Failed absorbs
//! pipeline errors until a spec edit or the autoRetry cool-down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::PostParams;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use rag_common::Result;

use crate::crd::documentset::{
    CONDITION_CHUNKING_COMPLETED, CONDITION_EMBEDDING_COMPLETED, CONDITION_INDEXING_COMPLETED,
};
use crate::crd::{
    now, set_condition, DocumentSet, DocumentSetPhase, DocumentSetStatus, EmbeddingJob,
    EmbeddingJobPhase, EmbeddingJobSpec, IndexConfig, IndexJob, IndexJobPhase, IndexJobSpec,
    RetryPolicy, SyncState, VectorDbSpec,
};
use crate::source::{should_sync, sync_interval, SourceChangeResult};

use super::{
    ensure_finalizer, is_already_exists, patch_status, remove_finalizer, Context, REQUEUE_ACTIVE,
    REQUEUE_FAILED,
};

pub const DOCUMENTSET_FINALIZER: &str = "documentset.rag.ai/finalizer";

/// Reconcile a DocumentSet resource
#[instrument(skip(ctx, ds), fields(name = %ds.name_any()))]
pub async fn reconcile(ds: Arc<DocumentSet>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = ds.namespace().unwrap_or_default();
    let api: Api<DocumentSet> = Api::namespaced(ctx.client.clone(), &namespace);

    if ds.metadata.deletion_timestamp.is_some() {
        // Child tasks and their workloads are garbage-collected through the
        // ownership chain; nothing else to clean up today.
        remove_finalizer(&api, ds.as_ref(), DOCUMENTSET_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    if ensure_finalizer(&api, ds.as_ref(), DOCUMENTSET_FINALIZER).await? {
        return Ok(Action::requeue(Duration::ZERO));
    }

    let Some(status) = ds.status.clone() else {
        return initialize_status(&api, &ds).await;
    };

    match status.phase {
        DocumentSetPhase::Pending => handle_pending(&api, &ds, status, &ctx, &namespace).await,
        DocumentSetPhase::Embedding => handle_embedding(&api, &ds, status, &ctx, &namespace).await,
        DocumentSetPhase::Indexing => handle_indexing(&api, &ds, status, &ctx, &namespace).await,
        DocumentSetPhase::Ready => handle_ready(&api, &ds, status, &ctx).await,
        DocumentSetPhase::Failed => handle_failed(&api, &ds, status).await,
    }
}

/// Reset the pipeline to Pending, keeping the sync bookkeeping intact.
async fn initialize_status(api: &Api<DocumentSet>, ds: &DocumentSet) -> Result<Action> {
    let mut status = ds.status.clone().unwrap_or_default();
    status.phase = DocumentSetPhase::Pending;
    status.message = "DocumentSet created, waiting for processing".to_string();
    status.observed_generation = ds.metadata.generation.unwrap_or(0);
    status.last_update_time = Some(now());
    patch_status(api, &ds.name_any(), &status).await?;
    Ok(Action::requeue(Duration::ZERO))
}

/// Allocate a fresh timestamped collection and create the EmbeddingJob.
async fn handle_pending(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    // Configuration problems (bad URI, missing secret) are terminal for the
    // cycle and must surface on the resource before any child is created.
    if let Err(e) = ctx.watcher.validate(ds).await {
        if e.is_config_error() {
            return update_status_failed(api, ds, status, format!("Configuration error: {}", e)).await;
        }
        return Err(e);
    }

    let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    let collection = collection_name(&ds.spec.index.collection, &timestamp);
    let job_name = embedding_job_name(&ds.name_any(), &timestamp);

    let mut embedding_job = EmbeddingJob::new(
        &job_name,
        EmbeddingJobSpec {
            document_set: ds.name_any(),
            embedding_model: ds.spec.embedding.model.clone(),
            vector_db: VectorDbSpec {
                db_type: ds.spec.index.vector_db,
                collection: collection.clone(),
                endpoint: String::new(),
                secret_ref: None,
            },
            retry_policy: Some(RetryPolicy::default()),
        },
    );
    embedding_job.metadata.namespace = Some(namespace.to_string());
    embedding_job.metadata.labels = Some(
        [
            ("rag.ai/documentset".to_string(), ds.name_any()),
            ("rag.ai/job-type".to_string(), "embedding".to_string()),
        ]
        .into(),
    );
    embedding_job.metadata.owner_references = ds.controller_owner_ref(&()).map(|r| vec![r]);

    let embedding_jobs: Api<EmbeddingJob> = Api::namespaced(ctx.client.clone(), namespace);
    match embedding_jobs.create(&PostParams::default(), &embedding_job).await {
        Ok(_) => info!(job = %job_name, collection = %collection, "created EmbeddingJob"),
        Err(e) if is_already_exists(&e) => info!(job = %job_name, "EmbeddingJob already exists"),
        Err(e) => {
            return update_status_failed(api, ds, status, format!("Failed to create EmbeddingJob: {}", e)).await;
        }
    }

    status.phase = DocumentSetPhase::Embedding;
    status.message = "EmbeddingJob created, processing documents".to_string();
    status.last_embedding_job_ref = job_name;
    status.current_collection = collection;
    status.last_update_time = Some(now());
    set_condition(
        &mut status.conditions,
        CONDITION_CHUNKING_COMPLETED,
        false,
        "EmbeddingJobCreated",
        "Waiting for embedding job to complete",
    );
    patch_status(api, &ds.name_any(), &status).await?;

    Ok(Action::requeue(REQUEUE_ACTIVE))
}

/// Wait for the EmbeddingJob; on success, hand over to the IndexJob.
async fn handle_embedding(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    let embedding_jobs: Api<EmbeddingJob> = Api::namespaced(ctx.client.clone(), namespace);
    let embedding_job = match embedding_jobs.get(&status.last_embedding_job_ref).await {
        Ok(job) => job,
        Err(e) if super::is_not_found(&e) => {
            info!("EmbeddingJob not found, restarting cycle");
            return initialize_status(api, ds).await;
        }
        Err(e) => return Err(e.into()),
    };

    let job_status = embedding_job.status.clone().unwrap_or_default();
    match job_status.phase {
        EmbeddingJobPhase::Succeeded => create_index_job(api, ds, status, ctx, namespace).await,
        EmbeddingJobPhase::Failed => {
            let message = format!("EmbeddingJob failed: {}", job_status.message);
            update_status_failed(api, ds, status, message).await
        }
        EmbeddingJobPhase::Running => {
            status.total_chunks = job_status.progress.total_chunks;
            status.message = format!(
                "Embedding in progress: {}/{} chunks",
                job_status.progress.processed_chunks, job_status.progress.total_chunks
            );
            status.last_update_time = Some(now());
            patch_status(api, &ds.name_any(), &status).await?;
            Ok(Action::requeue(REQUEUE_ACTIVE))
        }
        EmbeddingJobPhase::Pending => Ok(Action::requeue(REQUEUE_ACTIVE)),
    }
}

/// Create the IndexJob over the current collection and move to Indexing.
async fn create_index_job(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    let job_name = index_job_name(&ds.name_any(), &timestamp);

    let mut index_job = IndexJob::new(
        &job_name,
        IndexJobSpec {
            document_set: ds.name_any(),
            vector_db: VectorDbSpec {
                db_type: ds.spec.index.vector_db,
                collection: status.current_collection.clone(),
                endpoint: String::new(),
                secret_ref: None,
            },
            target_alias: ds.spec.index.alias.clone(),
            index_spec: IndexConfig::default_hnsw(),
            retry_policy: Some(RetryPolicy::default()),
        },
    );
    index_job.metadata.namespace = Some(namespace.to_string());
    index_job.metadata.labels = Some(
        [
            ("rag.ai/documentset".to_string(), ds.name_any()),
            ("rag.ai/job-type".to_string(), "index".to_string()),
        ]
        .into(),
    );
    index_job.metadata.owner_references = ds.controller_owner_ref(&()).map(|r| vec![r]);

    let index_jobs: Api<IndexJob> = Api::namespaced(ctx.client.clone(), namespace);
    match index_jobs.create(&PostParams::default(), &index_job).await {
        Ok(_) => info!(job = %job_name, "created IndexJob"),
        Err(e) if is_already_exists(&e) => info!(job = %job_name, "IndexJob already exists"),
        Err(e) => {
            return update_status_failed(api, ds, status, format!("Failed to create IndexJob: {}", e)).await;
        }
    }

    status.phase = DocumentSetPhase::Indexing;
    status.message = "IndexJob created, building vector index".to_string();
    status.last_index_job_ref = job_name;
    status.last_update_time = Some(now());
    set_condition(
        &mut status.conditions,
        CONDITION_EMBEDDING_COMPLETED,
        true,
        "EmbeddingJobSucceeded",
        "Embedding generation completed successfully",
    );
    patch_status(api, &ds.name_any(), &status).await?;

    Ok(Action::requeue(REQUEUE_ACTIVE))
}

/// Wait for the IndexJob; on success the pipeline is Ready.
async fn handle_indexing(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    let index_jobs: Api<IndexJob> = Api::namespaced(ctx.client.clone(), namespace);
    let index_job = match index_jobs.get(&status.last_index_job_ref).await {
        Ok(job) => job,
        Err(e) if super::is_not_found(&e) => {
            info!("IndexJob not found, creating a new one");
            return create_index_job(api, ds, status, ctx, namespace).await;
        }
        Err(e) => return Err(e.into()),
    };

    let job_status = index_job.status.clone().unwrap_or_default();
    match job_status.phase {
        IndexJobPhase::Succeeded => update_status_ready(api, ds, status, &index_job).await,
        IndexJobPhase::Failed => {
            let message = format!("IndexJob failed: {}", job_status.message);
            update_status_failed(api, ds, status, message).await
        }
        IndexJobPhase::Building | IndexJobPhase::Optimizing => {
            status.total_vectors = job_status.progress.total_vectors;
            status.message = format!(
                "Index building in progress: {}/{} vectors",
                job_status.progress.indexed_vectors, job_status.progress.total_vectors
            );
            status.last_update_time = Some(now());
            patch_status(api, &ds.name_any(), &status).await?;
            Ok(Action::requeue(REQUEUE_ACTIVE))
        }
        IndexJobPhase::Pending => Ok(Action::requeue(REQUEUE_ACTIVE)),
    }
}

/// Mark the DocumentSet Ready and, if this cycle was driven by a detected
/// source change, promote the deferred digest into `lastSourceHash`.
async fn update_status_ready(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    index_job: &IndexJob,
) -> Result<Action> {
    status.phase = DocumentSetPhase::Ready;
    status.message = "DocumentSet is ready for queries".to_string();
    status.total_vectors = index_job
        .status
        .as_ref()
        .map(|s| s.progress.total_vectors)
        .unwrap_or_default();
    status.observed_generation = ds.metadata.generation.unwrap_or(0);
    status.last_update_time = Some(now());

    if let Some(pending) = status.pending_source_hash.take() {
        // The sync cycle that detected the change has completed: only now
        // does the digest become the recorded source state.
        status.last_source_hash = pending;
        status.last_successful_sync_time = Some(now());
        status.sync_count += 1;
        status.sync_status.state = SyncState::Completed;
        status.sync_status.completed_at = Some(now());
        info!(sync_count = status.sync_count, "sync cycle completed");
    }

    set_condition(
        &mut status.conditions,
        CONDITION_INDEXING_COMPLETED,
        true,
        "IndexJobSucceeded",
        "Index building completed successfully",
    );
    patch_status(api, &ds.name_any(), &status).await?;

    Ok(Action::requeue(sync_interval(ds)))
}

/// Ready: watch for spec changes and periodically consult the source
/// watcher, starting a new cycle when the source moved.
async fn handle_ready(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    ctx: &Context,
) -> Result<Action> {
    if ds.metadata.generation.unwrap_or(0) != status.observed_generation {
        info!("spec changed, reprocessing");
        return initialize_status(api, ds).await;
    }

    let interval = sync_interval(ds);
    let now_ts = Utc::now();

    let (allowed, reason) = should_sync(ds, now_ts);
    if !allowed {
        debug!(%reason, "sync deferred");
        return Ok(Action::requeue(remaining_interval(&status, interval, now_ts)));
    }

    // Bound concurrent syncs per pipeline. Per-key reconciliation is
    // already serial, so with the default of 1 this only defers when a
    // previous cycle is still mid-flight.
    let max_concurrent = ds
        .spec
        .sync_policy
        .as_ref()
        .map(|p| p.max_concurrent_syncs.max(1))
        .unwrap_or(1);
    let in_flight = u32::from(status.sync_status.state == SyncState::Syncing);
    if in_flight >= max_concurrent {
        debug!("previous sync still in flight, deferring");
        return Ok(Action::requeue(interval));
    }

    status.sync_status.state = SyncState::Checking;
    status.last_source_check_time = Some(now());
    patch_status(api, &ds.name_any(), &status).await?;

    let result = match ctx.watcher.check_source_changes(ds).await {
        Ok(result) => result,
        Err(e) => {
            // Transient failure: keep the previous digest so the change
            // re-triggers once the source is reachable again
            warn!(error = %e, "source check failed");
            status.sync_status.state = SyncState::Failed;
            status.message = format!("Source check failed: {}", e);
            status.last_update_time = Some(now());
            patch_status(api, &ds.name_any(), &status).await?;
            return Ok(Action::requeue(interval));
        }
    };

    if !result.changed {
        status.sync_status.state = SyncState::Idle;
        status.sync_status.changes_detected = false;
        status.sync_status.files_added = 0;
        status.sync_status.files_deleted = 0;
        status.sync_status.files_changed = 0;
        status.last_update_time = Some(now());
        patch_status(api, &ds.name_any(), &status).await?;
        return Ok(Action::requeue(interval));
    }

    if status.last_source_hash.is_empty() {
        return record_baseline(api, ds, status, result, interval).await;
    }

    info!(
        files_added = result.files_added,
        files_deleted = result.files_deleted,
        files_changed = result.files_changed,
        "source changed, starting sync cycle"
    );
    debug!(
        added = ?result.added_files,
        deleted = ?result.deleted_files,
        changed = ?result.changed_files,
        "changed file detail"
    );
    status.sync_status.state = SyncState::Syncing;
    status.sync_status.changes_detected = true;
    status.sync_status.files_added = result.files_added;
    status.sync_status.files_deleted = result.files_deleted;
    status.sync_status.files_changed = result.files_changed;
    status.sync_status.started_at = Some(now());
    status.sync_status.completed_at = None;
    // Metadata is persisted now for the next diff, but the combined digest
    // stays deferred until the cycle reaches Ready
    status.source_metadata = Some(result.new_metadata);
    status.pending_source_hash = Some(result.new_hash);
    status.phase = DocumentSetPhase::Pending;
    status.message = "Source changed, starting sync cycle".to_string();
    status.last_update_time = Some(now());
    patch_status(api, &ds.name_any(), &status).await?;

    Ok(Action::requeue(Duration::ZERO))
}

/// First observation of a source that this pipeline has already indexed:
/// record it as the baseline instead of rebuilding what was just built.
async fn record_baseline(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    result: SourceChangeResult,
    interval: Duration,
) -> Result<Action> {
    info!(file_count = result.new_metadata.file_count, "recorded source baseline");
    status.last_source_hash = result.new_hash;
    status.source_metadata = Some(result.new_metadata);
    status.sync_status.state = SyncState::Completed;
    status.sync_status.changes_detected = false;
    status.sync_status.completed_at = Some(now());
    status.last_successful_sync_time = Some(now());
    status.sync_count += 1;
    status.last_update_time = Some(now());
    patch_status(api, &ds.name_any(), &status).await?;
    Ok(Action::requeue(interval))
}

/// Failed: absorb until a spec edit, or restart after the autoRetry
/// cool-down.
async fn handle_failed(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    status: DocumentSetStatus,
) -> Result<Action> {
    if ds.metadata.generation.unwrap_or(0) != status.observed_generation {
        info!("spec changed after failure, retrying");
        return initialize_status(api, ds).await;
    }

    if ds.spec.embedding.auto_retry {
        if let Some(last_update) = &status.last_update_time {
            let elapsed = Utc::now()
                .signed_duration_since(last_update.0)
                .to_std()
                .unwrap_or_default();
            if elapsed > REQUEUE_FAILED {
                info!("auto-retrying failed DocumentSet after cool-down");
                return initialize_status(api, ds).await;
            }
        }
    }

    Ok(Action::requeue(REQUEUE_FAILED))
}

async fn update_status_failed(
    api: &Api<DocumentSet>,
    ds: &DocumentSet,
    mut status: DocumentSetStatus,
    message: String,
) -> Result<Action> {
    warn!(%message, "DocumentSet failed");
    status.phase = DocumentSetPhase::Failed;
    status.message = message;
    status.last_update_time = Some(now());
    patch_status(api, &ds.name_any(), &status).await?;
    Ok(Action::requeue(REQUEUE_FAILED))
}

/// Time left until the next source check is due.
fn remaining_interval(
    status: &DocumentSetStatus,
    interval: Duration,
    now: chrono::DateTime<Utc>,
) -> Duration {
    let Some(last_check) = &status.last_source_check_time else {
        return interval;
    };
    let elapsed = now
        .signed_duration_since(last_check.0)
        .to_std()
        .unwrap_or_default();
    interval.saturating_sub(elapsed).max(Duration::from_secs(1))
}

fn collection_name(base: &str, timestamp: &str) -> String {
    format!("{}_{}", base, timestamp)
}

fn embedding_job_name(document_set: &str, timestamp: &str) -> String {
    format!("{}-embedding-{}", document_set, timestamp)
}

fn index_job_name(document_set: &str, timestamp: &str) -> String {
    format!("{}-index-{}", document_set, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_scheme() {
        assert_eq!(collection_name("kb", "20240102030405"), "kb_20240102030405");
        assert_eq!(embedding_job_name("docs", "20240102030405"), "docs-embedding-20240102030405");
        assert_eq!(index_job_name("docs", "20240102030405"), "docs-index-20240102030405");
    }

    #[test]
    fn test_remaining_interval() {
        let interval = Duration::from_secs(300);
        let now_ts = Utc::now();

        // No previous check: full interval
        let status = DocumentSetStatus::default();
        assert_eq!(remaining_interval(&status, interval, now_ts), interval);

        // One minute in: four minutes left
        let status = DocumentSetStatus {
            last_source_check_time: Some(crate::crd::now()),
            ..Default::default()
        };
        let later = now_ts + chrono::Duration::seconds(60);
        let remaining = remaining_interval(&status, interval, later);
        assert!(remaining <= Duration::from_secs(240));
        assert!(remaining >= Duration::from_secs(230));

        // Past the interval: clamped to the 1s floor
        let much_later = now_ts + chrono::Duration::seconds(1000);
        assert_eq!(
            remaining_interval(&status, interval, much_later),
            Duration::from_secs(1)
        );
    }
}
