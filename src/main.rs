//! Release-gate controller binary.
//!
//! Watches release image streams, enqueues their keys, and runs worker
//! loops that reconcile every candidate tag through its verification and
//! test jobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use release_gate::controller::{image_stream_resource, sync_release, Context};
use release_gate::jobs::JobTemplates;
use release_gate::queue::{RetryQueue, WorkQueue};
use release_gate::release::{Release, StreamKey};

/// Requeue delay after a retryable reconcile error.
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Release-gate - verification controller for candidate release tags
#[derive(Parser, Debug)]
#[command(name = "release-gate", version, about, long_about = None)]
struct Cli {
    /// Namespace holding the release image streams
    #[arg(long, env = "RELEASE_NAMESPACE", default_value = "ocp")]
    release_namespace: String,

    /// Namespace prow jobs are created in
    #[arg(long, env = "PROW_NAMESPACE", default_value = "ci")]
    prow_namespace: String,

    /// Path to the YAML file of prow job templates
    #[arg(long, env = "JOB_TEMPLATES")]
    job_templates: PathBuf,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value = "3")]
    workers: usize,

    /// Seconds between full resyncs of all streams
    #[arg(long, default_value = "300")]
    resync_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    info!(
        release_namespace = %cli.release_namespace,
        prow_namespace = %cli.prow_namespace,
        workers = cli.workers,
        "release-gate controller starting"
    );

    let templates_raw = tokio::fs::read_to_string(&cli.job_templates)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", cli.job_templates.display(), e))?;
    let templates = Arc::new(
        JobTemplates::from_yaml(&templates_raw)
            .map_err(|e| anyhow::anyhow!("failed to parse job templates: {}", e))?,
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    let queue = Arc::new(WorkQueue::new());
    let ctx = Arc::new(Context::new(
        client.clone(),
        &cli.release_namespace,
        &cli.prow_namespace,
        templates,
        queue.clone(),
    ));

    let streams: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &cli.release_namespace,
        &image_stream_resource(),
    );

    // Watcher: every observed stream enqueues its key. The initial list
    // replay seeds the queue on startup.
    {
        let queue = queue.clone();
        let api = streams.clone();
        tokio::spawn(async move {
            loop {
                let stream = watcher(api.clone(), watcher::Config::default());
                futures::pin_mut!(stream);
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                            enqueue_stream(&queue, &obj);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "image stream watch failed, restarting");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    // Periodic resync: re-enqueue everything so missed events heal.
    {
        let queue = queue.clone();
        let api = streams.clone();
        let period = Duration::from_secs(cli.resync_seconds.max(30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match api.list(&Default::default()).await {
                    Ok(list) => {
                        debug!(count = list.items.len(), "resync enqueue");
                        for obj in list {
                            enqueue_stream(&queue, &obj);
                        }
                    }
                    Err(err) => warn!(error = %err, "resync list failed"),
                }
            }
        });
    }

    for worker_id in 0..cli.workers.max(1) {
        let queue = queue.clone();
        let api = streams.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            worker(worker_id, queue, api, ctx).await;
        });
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen for shutdown signal: {}", e))?;
    info!("release-gate controller shutting down");
    Ok(())
}

fn enqueue_stream(queue: &WorkQueue, obj: &DynamicObject) {
    let Some(name) = obj.metadata.name.clone() else {
        return;
    };
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    queue.add(StreamKey::new(namespace, name));
}

async fn worker(
    worker_id: usize,
    queue: Arc<WorkQueue>,
    api: Api<DynamicObject>,
    ctx: Arc<Context>,
) {
    loop {
        let key = queue.next().await;
        debug!(worker = worker_id, stream = %key, "reconciling");

        let object = match api.get(&key.name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(ae)) if ae.code == 404 => continue,
            Err(err) => {
                warn!(stream = %key, error = %err, "failed to fetch image stream");
                queue.add_after(key, ERROR_REQUEUE);
                continue;
            }
        };

        let release = match Release::parse(&object) {
            Ok(Some(release)) => release,
            Ok(None) => continue,
            Err(err) => {
                warn!(stream = %key, error = %err, "failed to parse release");
                continue;
            }
        };

        if let Err(err) = sync_release(&release, &ctx).await {
            if err.is_terminal() {
                warn!(stream = %key, error = %err, "release is misconfigured");
            } else {
                warn!(stream = %key, error = %err, "reconcile failed, requeueing");
                queue.add_after(key, ERROR_REQUEUE);
            }
        }
    }
}
