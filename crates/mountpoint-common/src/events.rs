//! Kubernetes Event recording for the attachment controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so workload pods show which Mountpoint Pod serves them in
//! `kubectl describe pod`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "WorkloadAttached")
    /// * `action` - What action was taken (e.g. "Attach")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A Mountpoint Pod was created for the workload
    pub const MOUNTPOINT_POD_CREATED: &str = "MountpointPodCreated";
    /// The workload was attached to an existing Mountpoint Pod
    pub const WORKLOAD_ATTACHED: &str = "WorkloadAttached";
    /// The workload was detached from its Mountpoint Pod
    pub const WORKLOAD_DETACHED: &str = "WorkloadDetached";
    /// Reconciling the workload's volumes failed
    pub const ATTACHMENT_FAILED: &str = "AttachmentFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Attaching a workload to a Mountpoint Pod
    pub const ATTACH: &str = "Attach";
    /// Detaching a workload from a Mountpoint Pod
    pub const DETACH: &str = "Detach";
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}
