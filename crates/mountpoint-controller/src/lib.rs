//! Pod controller sharing Mountpoint Pods between workloads
//!
//! Workloads on the same node that mount the same S3 volume with the same
//! options and credentials are served by one Mountpoint Pod. Which workload
//! uses which Mountpoint Pod is tracked in `MountpointS3PodAttachment`
//! records, kept current by the pod reconciler and cleaned up by the stale
//! attachment sweeper.

#![deny(missing_docs)]

pub mod backoff;
pub mod client;
pub mod expectations;
pub mod helper_pod;
pub mod key;
pub mod mount_options;
pub mod reconciler;
pub mod stale;
pub mod variant;
pub mod volume;

#[cfg(test)]
mod testing;

pub use client::{AttachmentKubeClient, AttachmentKubeClientImpl, WriteOutcome};
pub use expectations::PendingExpectations;
pub use helper_pod::{HelperPodBuilder, HelperPodConfig};
pub use key::AttachmentKey;
pub use reconciler::{error_policy, reconcile, Context, ContextBuilder, Progress};
pub use stale::StaleAttachmentSweeper;
pub use variant::ClusterVariant;

pub use mountpoint_common::{Error, Result};
