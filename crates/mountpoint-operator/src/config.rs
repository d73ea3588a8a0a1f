//! Command-line and environment configuration

use std::time::Duration;

use clap::Parser;

use mountpoint_common::DEFAULT_MOUNTPOINT_NAMESPACE;
use mountpoint_controller::helper_pod::DEFAULT_CONTAINER_COMMAND;
use mountpoint_controller::{ClusterVariant, HelperPodConfig};

/// Mountpoint Pod attachment controller for the Mountpoint S3 CSI driver
#[derive(Parser, Debug, Clone)]
#[command(name = "mountpoint-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the MountpointS3PodAttachment CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Do not install or update the CRD on startup
    #[arg(long, env = "SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,

    /// Namespace Mountpoint Pods are created in
    #[arg(long, env = "MOUNTPOINT_NAMESPACE", default_value = DEFAULT_MOUNTPOINT_NAMESPACE)]
    pub mountpoint_namespace: String,

    /// Mountpoint version shipped in the image
    #[arg(long, env = "MOUNTPOINT_VERSION", default_value = "")]
    pub mountpoint_version: String,

    /// Priority class for Mountpoint Pods
    #[arg(long, env = "MOUNTPOINT_PRIORITY_CLASS_NAME")]
    pub mountpoint_priority_class_name: Option<String>,

    /// Image for Mountpoint Pods
    #[arg(long, env = "MOUNTPOINT_IMAGE", default_value = "")]
    pub mountpoint_image: String,

    /// Image pull policy for Mountpoint Pods
    #[arg(long, env = "MOUNTPOINT_IMAGE_PULL_POLICY")]
    pub mountpoint_image_pull_policy: Option<String>,

    /// Entrypoint of the Mountpoint container
    #[arg(long, env = "MOUNTPOINT_CONTAINER_COMMAND", default_value = DEFAULT_CONTAINER_COMMAND)]
    pub mountpoint_container_command: String,

    /// CSI driver version recorded on Mountpoint Pods and records
    #[arg(long, env = "CSI_DRIVER_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub csi_driver_version: String,

    /// Seconds between stale attachment sweeps
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value_t = 10)]
    pub cleanup_interval_secs: u64,

    /// Minimum age in seconds before an attachment of a missing pod is pruned
    #[arg(long, env = "STALE_ATTACHMENT_THRESHOLD_SECS", default_value_t = 10)]
    pub stale_attachment_threshold_secs: u64,
}

impl Cli {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mountpoint_namespace.is_empty() {
            anyhow::bail!("--mountpoint-namespace must not be empty");
        }
        if self.mountpoint_image.is_empty() {
            anyhow::bail!("--mountpoint-image is required");
        }
        if self.csi_driver_version.is_empty() {
            anyhow::bail!("--csi-driver-version must not be empty");
        }
        if self.cleanup_interval_secs == 0 {
            anyhow::bail!("--cleanup-interval-secs must be greater than zero");
        }
        Ok(())
    }

    /// Mountpoint Pod settings for the detected cluster variant
    pub fn helper_pod_config(&self, variant: ClusterVariant) -> HelperPodConfig {
        HelperPodConfig {
            namespace: self.mountpoint_namespace.clone(),
            mountpoint_version: self.mountpoint_version.clone(),
            priority_class_name: non_empty(&self.mountpoint_priority_class_name),
            image: self.mountpoint_image.clone(),
            image_pull_policy: non_empty(&self.mountpoint_image_pull_policy),
            command: self.mountpoint_container_command.clone(),
            csi_driver_version: self.csi_driver_version.clone(),
            variant,
        }
    }

    /// Time between sweeps
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Grace period before pruning
    pub fn stale_attachment_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_attachment_threshold_secs)
    }
}

// Helm renders unset values as empty strings
fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}
