//! Kubernetes distribution detection
//!
//! OpenShift assigns every pod a UID from its namespace's range and rejects
//! pods that pin one, so Mountpoint Pods must leave `runAsUser` unset there.

use kube::Client;
use tracing::{info, warn};

/// API group only present on OpenShift clusters
pub const OPENSHIFT_API_GROUP: &str = "config.openshift.io";

/// UID Mountpoint Pods run as on vanilla Kubernetes
pub const DEFAULT_MOUNTPOINT_UID: i64 = 1000;

/// Kubernetes distribution the controller runs on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterVariant {
    /// Vanilla Kubernetes (EKS, kind, ...)
    #[default]
    Default,
    /// Red Hat OpenShift
    OpenShift,
}

impl ClusterVariant {
    /// Detect the variant from the server's API groups.
    ///
    /// Discovery failures are logged and treated as vanilla Kubernetes.
    pub async fn detect(client: &Client) -> Self {
        match client.list_api_groups().await {
            Ok(groups) => {
                let variant = Self::from_group_names(groups.groups.iter().map(|g| g.name.as_str()));
                info!(?variant, "detected cluster variant");
                variant
            }
            Err(e) => {
                warn!(error = %e, "API group discovery failed, assuming vanilla Kubernetes");
                Self::Default
            }
        }
    }

    /// Variant implied by a set of API group names
    pub fn from_group_names<'a>(mut groups: impl Iterator<Item = &'a str>) -> Self {
        if groups.any(|g| g == OPENSHIFT_API_GROUP) {
            Self::OpenShift
        } else {
            Self::Default
        }
    }

    /// UID for the Mountpoint container and fsGroup, `None` to let the platform pick
    pub fn mountpoint_pod_uid(self) -> Option<i64> {
        match self {
            Self::Default => Some(DEFAULT_MOUNTPOINT_UID),
            Self::OpenShift => None,
        }
    }
}
