//! Reconciliation logic for the three resource kinds
//!
//! One reconciler per kind, sharing a context and a few cluster helpers.
//! Per-key reconciliation is serial (the work-queue guarantees it); all
//! mutations go through the API server and rely on resource-version
//! optimistic locking, so a conflict simply surfaces as an error and the
//! work-queue re-enqueues.

pub mod documentset;
pub mod embeddingjob;
pub mod indexjob;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use rag_common::{RagError, Result};

use crate::source::SourceWatcher;

/// Field manager recorded on status patches
pub const OPERATOR_MANAGER: &str = "rag-operator";

/// Requeue cadence while a pipeline stage is active
pub const REQUEUE_ACTIVE: Duration = Duration::from_secs(30);
/// Requeue cadence (and autoRetry cool-down) in the Failed phase
pub const REQUEUE_FAILED: Duration = Duration::from_secs(5 * 60);

/// Shared reconciler context
pub struct Context {
    pub client: Client,
    /// Worker image used for embedding and index workloads
    pub agent_image: String,
    pub watcher: SourceWatcher,
}

/// Generic error handler: log and requeue with a flat backoff.
pub fn error_policy<K>(_obj: Arc<K>, error: &RagError, _ctx: Arc<Context>) -> Action {
    error!(%error, "reconciliation error");
    Action::requeue(Duration::from_secs(30))
}

/// Merge-patch the status subresource of a resource.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(OPERATOR_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Add a finalizer to the resource if it is not already present.
/// Returns true when a patch was issued.
pub async fn ensure_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Remove a finalizer from the resource, unblocking deletion.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<_> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Whether a creation error is the benign AlreadyExists case. Create is
/// idempotent under retries because of this.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Whether a get/delete error is NotFound.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}
