//! Startup utilities

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use mountpoint_common::crd::{MountpointS3PodAttachment, CRD_NAME};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "s3-csi-controller";

/// CRD manifest as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&MountpointS3PodAttachment::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))
}

/// Ensure the MountpointS3PodAttachment CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the CRD version always matches the operator version.
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing MountpointS3PodAttachment CRD...");
    crds.patch(
        CRD_NAME,
        &params,
        &Patch::Apply(&MountpointS3PodAttachment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MountpointS3PodAttachment CRD: {}", e))?;

    tracing::info!("MountpointS3PodAttachment CRD installed/updated");
    Ok(())
}
