//! Common types for the Mountpoint Pod attachment controller: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the CSI driver whose volumes this controller serves
pub const CSI_DRIVER_NAME: &str = "s3.csi.aws.com";

/// Default namespace Mountpoint Pods are created in
pub const DEFAULT_MOUNTPOINT_NAMESPACE: &str = "mount-s3";

/// Service account name used when a pod does not specify one
pub const DEFAULT_SERVICE_ACCOUNT_NAME: &str = "default";

/// Annotation on a ServiceAccount carrying its IAM role (IRSA)
pub const IRSA_ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

// =============================================================================
// Labels and annotations written by the controller
// =============================================================================

/// Label on a MountpointS3PodAttachment recording the driver version that created it
pub const LABEL_CREATED_BY_DRIVER_VERSION: &str = "s3.csi.aws.com/created-by-csi-driver-version";

/// Label on a Mountpoint Pod recording the driver version that created it
pub const LABEL_MOUNTED_BY_DRIVER_VERSION: &str = "s3.csi.aws.com/mounted-by-csi-driver-version";

/// Label on a Mountpoint Pod recording the Mountpoint version it runs
pub const LABEL_MOUNTPOINT_VERSION: &str = "s3.csi.aws.com/mountpoint-version";

/// Label on a Mountpoint Pod recording the PersistentVolume it serves
pub const LABEL_VOLUME_NAME: &str = "s3.csi.aws.com/volume-name";

/// Label on a Mountpoint Pod recording the CSI volume handle it serves
pub const LABEL_VOLUME_ID: &str = "s3.csi.aws.com/volume-id";

/// Label on ephemeral cache volumes created for a Mountpoint Pod
pub const LABEL_VOLUME_TYPE: &str = "s3.csi.aws.com/type";

/// Value of [`LABEL_VOLUME_TYPE`] for ephemeral local caches
pub const VOLUME_TYPE_LOCAL_EPHEMERAL_CACHE: &str = "local-ephemeral-cache";

/// Annotation telling the node plugin to unmount and terminate a Mountpoint Pod
pub const ANNOTATION_NEEDS_UNMOUNT: &str = "s3.csi.aws.com/needs-unmount";

/// Annotation marking a Mountpoint Pod as closed to new workloads
pub const ANNOTATION_NO_NEW_WORKLOAD: &str = "s3.csi.aws.com/no-new-workload";

/// Value used for boolean annotations
pub const ANNOTATION_TRUE: &str = "true";
