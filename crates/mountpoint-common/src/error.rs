//! Error types for the Mountpoint Pod attachment controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the pod, volume, or record they concern so a log line
//! is enough to find the offending object.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A claim and its PersistentVolume disagree about their binding
    #[error("volume binding error for claim {namespace}/{claim}: {message}")]
    VolumeBinding {
        /// Namespace of the claim
        namespace: String,
        /// Name of the claim
        claim: String,
        /// Description of the mismatch
        message: String,
    },

    /// More than one MountpointS3PodAttachment matched a single key
    #[error("found {count} MountpointS3PodAttachments for {key}, expected at most one")]
    DuplicateAttachment {
        /// Serialized attachment key
        key: String,
        /// Number of matching records
        count: usize,
    },

    /// A Mountpoint Pod spec could not be built for a volume
    #[error("cannot build Mountpoint Pod for volume {volume}: {message}")]
    HelperPodSpec {
        /// PersistentVolume name
        volume: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "sweeper")
        context: String,
    },

    /// Several independent steps failed in one reconcile
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a volume binding error for a claim
    pub fn volume_binding(
        namespace: impl Into<String>,
        claim: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::VolumeBinding {
            namespace: namespace.into(),
            claim: claim.into(),
            message: msg.into(),
        }
    }

    /// Create a Mountpoint Pod spec error for a volume
    pub fn helper_pod_spec(volume: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::HelperPodSpec {
            volume: volume.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse a list of errors into one.
    ///
    /// Returns `None` for an empty list and the error itself for a single one.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }

    /// Check if this error is retryable
    ///
    /// Spec, binding and duplicate-record errors need a human to fix
    /// cluster state. Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::VolumeBinding { .. } => false,
            Error::DuplicateAttachment { .. } => false,
            Error::HelperPodSpec { .. } => false,
            Error::Internal { .. } => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retryable),
        }
    }

    /// Short machine-readable category, used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::VolumeBinding { .. } => "volume_binding",
            Error::DuplicateAttachment { .. } => "duplicate_attachment",
            Error::HelperPodSpec { .. } => "helper_pod_spec",
            Error::Internal { .. } => "internal",
            Error::Aggregate(_) => "aggregate",
        }
    }
}
