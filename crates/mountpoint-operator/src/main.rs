//! Mountpoint Operator - shares Mountpoint Pods between S3 CSI workloads

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use mountpoint_common::telemetry::{init_telemetry, TelemetryConfig};
use mountpoint_controller::{ClusterVariant, Context, HelperPodBuilder, StaleAttachmentSweeper};
use mountpoint_operator::config::Cli;
use mountpoint_operator::controller_runner::run_controllers;
use mountpoint_operator::startup::{crd_yaml, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;
    cli.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client).await?;
    }

    let variant = ClusterVariant::detect(&client).await;
    let ctx = Arc::new(
        Context::builder(client.clone())
            .helper_pods(HelperPodBuilder::new(cli.helper_pod_config(variant)))
            .build(),
    );

    let sweeper = StaleAttachmentSweeper::new(ctx.kube.clone(), cli.mountpoint_namespace.clone())
        .with_interval(cli.cleanup_interval())
        .with_threshold(cli.stale_attachment_threshold());

    tracing::info!(
        namespace = %cli.mountpoint_namespace,
        driver_version = %cli.csi_driver_version,
        ?variant,
        "Starting Mountpoint Pod attachment controller"
    );
    run_controllers(client, ctx, sweeper).await;

    tracing::info!("Shutting down");
    Ok(())
}
