//! Runs the TrainingRequest controller until shutdown

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::training::{error_policy, reconcile, Context};
use crate::cache::{wait_for_sync, SyncStatus};
use crate::crd::TrainingRequest;
use crate::Error;

/// Server-side watch timeout; kept under the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Reconcile TrainingRequests until `shutdown` fires
///
/// Waits for the ConfigMap and Job caches first. On shutdown the controller
/// finishes in-flight reconciles, then training runs are cancelled and
/// given a grace period to stop.
pub async fn run(
    api: Api<TrainingRequest>,
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    wait_for_caches(&ctx, &shutdown).await?;

    info!(
        workers = ctx.config.workers,
        "Starting TrainingRequest controller"
    );
    let stop = shutdown.clone();
    Controller::new(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(controller::Config::default().concurrency(ctx.config.workers))
        .graceful_shutdown_on(async move { stop.cancelled().await })
        .run(reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("TrainingRequest"))
        .await;

    stop_runs(&ctx).await;
    info!("TrainingRequest controller stopped");
    Ok(())
}

async fn wait_for_caches(ctx: &Context, shutdown: &CancellationToken) -> Result<(), Error> {
    info!("Waiting for caches to sync");
    let config_maps: &dyn SyncStatus = &ctx.config_maps;
    let jobs: &dyn SyncStatus = &ctx.jobs;
    wait_for_sync(
        &[("ConfigMap", config_maps), ("Job", jobs)],
        ctx.config.sync_timeout,
        shutdown,
    )
    .await
}

async fn stop_runs(ctx: &Context) {
    info!("Stopping training runs");
    ctx.runs.shutdown();
    ctx.runs.wait_idle(ctx.config.shutdown_grace).await;
}

/// Log the outcome of each reconciliation
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
