//! Controller runner - wires the pod controller and the sweeper together
//!
//! The pod controller runs until a shutdown signal arrives. The sweeper runs
//! on its own task and is cancelled once the controller stream ends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use mountpoint_controller::{error_policy, reconcile, Context, StaleAttachmentSweeper};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the pod controller future
pub fn build_pod_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let pods: Api<Pod> = Api::all(client);

    tracing::info!("- Pod controller");

    Box::pin(
        Controller::new(pods, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Pod")),
    )
}

/// Run the pod controller and the sweeper until shutdown
pub async fn run_controllers(client: Client, ctx: Arc<Context>, sweeper: StaleAttachmentSweeper) {
    let cancel = CancellationToken::new();
    let sweeper_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { sweeper.run(cancel).await }
    });

    build_pod_controller(client, ctx).await;

    tracing::info!("pod controller stopped, stopping sweeper");
    cancel.cancel();
    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "sweeper task panicked");
    }
}

/// Creates a closure for logging reconciliation results.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_reconcile_result_accepts_both_outcomes() {
        let log = log_reconcile_result::<&str, &str>("Pod");
        log(Ok("requeue")).await;
        log(Err("boom")).await;
    }

    #[test]
    fn watch_timeout_is_below_client_read_timeout() {
        assert!(WATCH_TIMEOUT_SECS < 30);
    }
}
