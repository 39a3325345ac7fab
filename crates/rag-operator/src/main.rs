//! RAG Operator
//!
//! Kubernetes operator driving the three-stage document pipeline:
//! chunking/embedding, vector-index construction, and atomic activation via
//! alias swap. Watches DocumentSet resources, runs their child
//! EmbeddingJob/IndexJob tasks through worker containers, and keeps the
//! indexed corpus in sync with the external document source.

mod crd;
mod jobs;
mod reconciler;
mod source;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, error, info};

use crate::crd::{DocumentSet, EmbeddingJob, IndexJob};
use crate::reconciler::{documentset, embeddingjob, error_policy, indexjob, Context};
use crate::source::SourceWatcher;

#[derive(Parser, Debug)]
#[command(name = "rag-operator")]
#[command(about = "RAG pipeline Kubernetes operator")]
struct Args {
    /// Kubernetes namespace to watch
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Worker image for embedding and index workloads
    #[arg(long, env = "RAG_AGENT_IMAGE", default_value = jobs::DEFAULT_AGENT_IMAGE)]
    agent_image: String,

    /// Local mount root for PVC sources
    #[arg(long, env = "PVC_MOUNT_ROOT", default_value = "/mnt/pvc")]
    pvc_mount_root: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    info!("Starting RAG Operator");
    info!("  Namespace: {}", args.namespace);
    info!("  Agent image: {}", args.agent_image);

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let document_sets: Api<DocumentSet> = Api::namespaced(client.clone(), &args.namespace);
    let embedding_jobs: Api<EmbeddingJob> = Api::namespaced(client.clone(), &args.namespace);
    let index_jobs: Api<IndexJob> = Api::namespaced(client.clone(), &args.namespace);
    let batch_jobs: Api<k8s_openapi::api::batch::v1::Job> =
        Api::namespaced(client.clone(), &args.namespace);

    let ctx = Arc::new(Context {
        client: client.clone(),
        agent_image: args.agent_image.clone(),
        watcher: SourceWatcher::new(client.clone(), args.pvc_mount_root.clone())?,
    });

    info!("Starting controllers");

    // Child status updates wake the parent through the `owns` relations.
    let document_set_controller = Controller::new(document_sets, watcher::Config::default())
        .owns(embedding_jobs.clone(), watcher::Config::default())
        .owns(index_jobs.clone(), watcher::Config::default())
        .run(documentset::reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled DocumentSet"),
                Err(e) => error!("DocumentSet reconciliation error: {:?}", e),
            }
        });

    let embedding_job_controller = Controller::new(embedding_jobs, watcher::Config::default())
        .owns(batch_jobs.clone(), watcher::Config::default())
        .run(embeddingjob::reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled EmbeddingJob"),
                Err(e) => error!("EmbeddingJob reconciliation error: {:?}", e),
            }
        });

    let index_job_controller = Controller::new(index_jobs, watcher::Config::default())
        .owns(batch_jobs, watcher::Config::default())
        .run(indexjob::reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled IndexJob"),
                Err(e) => error!("IndexJob reconciliation error: {:?}", e),
            }
        });

    tokio::join!(
        document_set_controller,
        embedding_job_controller,
        index_job_controller
    );

    info!("RAG Operator shutting down");

    Ok(())
}
