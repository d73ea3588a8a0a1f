//! Pod reconciler: attach workloads to shared Mountpoint Pods
//!
//! Every pod in the cluster is reconciled. Pods in the Mountpoint namespace
//! are Mountpoint Pods and only go through lifecycle handling. For every
//! other pod, each S3 volume it mounts is resolved to an [`AttachmentKey`]
//! and the attachment record for that key is driven towards the pod's
//! state:
//!
//! | Pod        | Record  | Action                                       |
//! |------------|---------|----------------------------------------------|
//! | inactive   | none    | nothing                                      |
//! | inactive   | exists  | remove the workload from the record          |
//! | active     | exists  | attach to an eligible Mountpoint Pod         |
//! | active     | none    | create a Mountpoint Pod and a record         |
//!
//! All record writes are guarded by resourceVersion. A lost race never
//! overwrites anything; the volume is requeued and re-read from scratch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use mountpoint_common::crd::{
    MountpointS3PodAttachment, WorkloadAttachment, ATTACHMENT_GENERATE_NAME,
};
use mountpoint_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use mountpoint_common::kube_utils::{is_pod_active, namespaced_name, pod_phase};
use mountpoint_common::metrics::{
    record_attachment_conflict, record_mountpoint_pod_created, record_reconcile_error,
    WORKLOADS_SHARED,
};
use mountpoint_common::{
    Error, ANNOTATION_NEEDS_UNMOUNT, ANNOTATION_NO_NEW_WORKLOAD, ANNOTATION_TRUE,
    IRSA_ROLE_ARN_ANNOTATION, LABEL_CREATED_BY_DRIVER_VERSION, LABEL_MOUNTED_BY_DRIVER_VERSION,
};

use crate::backoff::ErrorBackoff;
use crate::client::{AttachmentKubeClient, AttachmentKubeClientImpl, WriteOutcome};
use crate::expectations::PendingExpectations;
use crate::helper_pod::HelperPodBuilder;
use crate::key::{service_account_name, AttachmentKey};
use crate::volume::{self, ResolvedVolume, VolumeResolution};

/// Name the controller reports Kubernetes Events under
pub const CONTROLLER_NAME: &str = "s3-csi-controller";

/// Requeue delay after losing a write race
pub const REQUEUE_CONFLICT: Duration = Duration::from_secs(1);

/// Requeue delay while a record this process created is not yet listed
pub const REQUEUE_PENDING: Duration = Duration::from_secs(1);

/// Requeue delay while a claim waits for its volume
pub const REQUEUE_UNBOUND_CLAIM: Duration = Duration::from_secs(5);

/// What the controller should do with a pod after a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Nothing left to do until the pod changes
    Settled,
    /// Look again after the delay
    Requeue(Duration),
}

impl Progress {
    /// Combine the outcomes of two volumes; the shortest requeue wins
    pub fn merge(self, other: Progress) -> Progress {
        match (self, other) {
            (Progress::Settled, p) | (p, Progress::Settled) => p,
            (Progress::Requeue(a), Progress::Requeue(b)) => Progress::Requeue(a.min(b)),
        }
    }

    /// Controller action for this outcome
    pub fn into_action(self) -> Action {
        match self {
            Progress::Settled => Action::await_change(),
            Progress::Requeue(delay) => Action::requeue(delay),
        }
    }
}

/// Which Mountpoint Pod a new workload goes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// An existing Mountpoint Pod in the record can take the workload
    Assigned(String),
    /// No Mountpoint Pod in the record is eligible
    NeedsNewHelperPod,
}

/// Shared context for the pod controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .helper_pods(HelperPodBuilder::new(config))
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn AttachmentKubeClient>,
    /// Event publisher for workload pods
    pub events: Arc<dyn EventPublisher>,
    /// Builds Mountpoint Pod specs
    pub helper_pods: HelperPodBuilder,
    /// Records created by this process but not yet listed
    pub expectations: PendingExpectations,
    /// Per-pod retry counters for `error_policy`
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a custom client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn AttachmentKubeClient>, helper_pods: HelperPodBuilder) -> Self {
        Self {
            kube,
            events: Arc::new(mountpoint_common::events::NoopEventPublisher),
            helper_pods,
            expectations: PendingExpectations::new(),
            backoff: ErrorBackoff::default(),
        }
    }

    fn mountpoint_namespace(&self) -> &str {
        &self.helper_pods.config().namespace
    }

    fn driver_version(&self) -> &str {
        &self.helper_pods.config().csi_driver_version
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    helper_pods: HelperPodBuilder,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            helper_pods: HelperPodBuilder::default(),
        }
    }

    /// Set how Mountpoint Pods are built
    pub fn helper_pods(mut self, helper_pods: HelperPodBuilder) -> Self {
        self.helper_pods = helper_pods;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(AttachmentKubeClientImpl::new(self.client.clone())),
            events: Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)),
            helper_pods: self.helper_pods,
            expectations: PendingExpectations::new(),
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Reconcile a pod
///
/// Mountpoint Pods get lifecycle handling; every other pod has its S3
/// volumes attached to or detached from shared Mountpoint Pods.
#[instrument(skip(pod, ctx), fields(pod = %namespaced_name(pod.as_ref())))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let result = reconcile_pod(&pod, &ctx).await;
    match &result {
        Ok(_) => ctx.backoff.reset(&backoff_key(&pod)),
        Err(e) => record_reconcile_error(e.kind()),
    }
    result.map(Progress::into_action)
}

/// Handle reconciliation errors with per-pod exponential backoff
pub fn error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.backoff.next_delay(&backoff_key(&pod));
    if error.is_retryable() {
        warn!(
            ?error,
            pod = %namespaced_name(pod.as_ref()),
            retry_in_ms = delay.as_millis() as u64,
            "reconciliation failed"
        );
    } else {
        error!(
            ?error,
            pod = %namespaced_name(pod.as_ref()),
            retry_in_ms = delay.as_millis() as u64,
            "reconciliation failed"
        );
    }
    Action::requeue(delay)
}

fn backoff_key(pod: &Pod) -> String {
    pod.uid().unwrap_or_else(|| namespaced_name(pod))
}

/// Reconcile a pod and report what should happen next
pub async fn reconcile_pod(pod: &Pod, ctx: &Context) -> Result<Progress, Error> {
    if pod.namespace().as_deref() == Some(ctx.mountpoint_namespace()) {
        return reconcile_mountpoint_pod(pod, ctx).await;
    }
    reconcile_workload(pod, ctx).await
}

// =============================================================================
// Mountpoint Pods
// =============================================================================

async fn reconcile_mountpoint_pod(pod: &Pod, ctx: &Context) -> Result<Progress, Error> {
    let name = pod.name_any();
    match pod_phase(pod) {
        "Succeeded" => {
            // Mountpoint exits cleanly once its last workload unmounts
            if ctx.kube.delete_pod(ctx.mountpoint_namespace(), &name).await? {
                info!(mountpoint_pod = %name, "deleted succeeded Mountpoint Pod");
            }
        }
        "Failed" => {
            let status = pod.status.as_ref();
            warn!(
                mountpoint_pod = %name,
                reason = status.and_then(|s| s.reason.as_deref()).unwrap_or_default(),
                message = status.and_then(|s| s.message.as_deref()).unwrap_or_default(),
                "Mountpoint Pod failed"
            );
        }
        phase => debug!(mountpoint_pod = %name, phase, "Mountpoint Pod observed"),
    }
    Ok(Progress::Settled)
}

// =============================================================================
// Workload pods
// =============================================================================

async fn reconcile_workload(pod: &Pod, ctx: &Context) -> Result<Progress, Error> {
    let spec = pod.spec.as_ref();
    let scheduled = spec
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|node| !node.is_empty());
    if !scheduled {
        debug!("pod is not scheduled yet");
        return Ok(Progress::Settled);
    }

    let claims: Vec<&str> = spec
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|pvc| pvc.claim_name.as_str())
        .collect();

    let mut progress = Progress::Settled;
    let mut errors = Vec::new();
    for claim in claims {
        match reconcile_volume(pod, claim, ctx).await {
            Ok(p) => progress = progress.merge(p),
            Err(e) => {
                warn!(claim, error = %e, "failed to reconcile volume");
                errors.push(e);
            }
        }
    }

    match Error::aggregate(errors) {
        Some(err) => {
            publish(
                ctx,
                pod,
                EventType::Warning,
                reasons::ATTACHMENT_FAILED,
                actions::RECONCILE,
                err.to_string(),
            )
            .await;
            Err(err)
        }
        None => Ok(progress),
    }
}

async fn reconcile_volume(pod: &Pod, claim: &str, ctx: &Context) -> Result<Progress, Error> {
    let namespace = pod.namespace().unwrap_or_default();
    let volume = match volume::resolve(ctx.kube.as_ref(), &namespace, claim).await? {
        VolumeResolution::Resolved(volume) => volume,
        VolumeResolution::ClaimNotBound => return Ok(Progress::Requeue(REQUEUE_UNBOUND_CLAIM)),
        VolumeResolution::ForeignDriver => return Ok(Progress::Settled),
    };

    let role_arn = if volume.uses_pod_credentials() {
        service_account_role(ctx, pod, &namespace).await?
    } else {
        None
    };
    let key = AttachmentKey::new(pod, &volume, role_arn.as_deref());

    let record = find_record(ctx, &key).await?;
    if record.is_some() && ctx.expectations.clear(&key) {
        debug!(pv = %volume.pv_name, "observed attachment record created earlier");
    }

    let uid = pod
        .uid()
        .ok_or_else(|| Error::internal_with_context("reconcile", "workload pod has no uid"))?;

    match (is_pod_active(pod), record) {
        (false, None) => Ok(Progress::Settled),
        (false, Some(record)) => remove_workload(ctx, pod, record, &uid).await,
        (true, Some(record)) => ensure_attached(ctx, pod, &volume, record, &uid).await,
        (true, None) => create_attachment(ctx, pod, &volume, &key, &uid).await,
    }
}

async fn service_account_role(
    ctx: &Context,
    pod: &Pod,
    namespace: &str,
) -> Result<Option<String>, Error> {
    let sa = ctx
        .kube
        .get_service_account(namespace, service_account_name(pod))
        .await?;
    Ok(sa
        .metadata
        .annotations
        .and_then(|mut a| a.remove(IRSA_ROLE_ARN_ANNOTATION)))
}

/// The single record for `key`, if any
async fn find_record(
    ctx: &Context,
    key: &AttachmentKey,
) -> Result<Option<MountpointS3PodAttachment>, Error> {
    let mut matching: Vec<_> = ctx
        .kube
        .list_attachments()
        .await?
        .into_iter()
        .filter(|r| key.matches(&r.spec))
        .collect();
    match matching.len() {
        0 | 1 => Ok(matching.pop()),
        count => Err(Error::DuplicateAttachment {
            key: key.to_string(),
            count,
        }),
    }
}

// =============================================================================
// Remove workload
// =============================================================================

async fn remove_workload(
    ctx: &Context,
    pod: &Pod,
    mut record: MountpointS3PodAttachment,
    uid: &str,
) -> Result<Progress, Error> {
    let removed = record.spec.remove_workload(uid);
    if removed == 0 && record.spec.empty_entries().is_empty() {
        return Ok(Progress::Settled);
    }

    let outcome =
        persist_pruned(ctx.kube.as_ref(), ctx.mountpoint_namespace(), record, removed).await?;
    match outcome {
        WriteOutcome::Applied(()) => {
            if removed > 0 {
                info!(record = %pod_record_name(pod, uid), "workload detached");
                publish(
                    ctx,
                    pod,
                    EventType::Normal,
                    reasons::WORKLOAD_DETACHED,
                    actions::DETACH,
                    "Detached from Mountpoint Pod".to_string(),
                )
                .await;
            }
            Ok(Progress::Settled)
        }
        WriteOutcome::Conflict => Ok(Progress::Requeue(REQUEUE_CONFLICT)),
    }
}

fn pod_record_name(pod: &Pod, uid: &str) -> String {
    format!("{} ({uid})", namespaced_name(pod))
}

/// Write back a record whose workloads were pruned, then retire emptied
/// Mountpoint Pods.
///
/// When `pruned` is non-zero the pruned record is replaced first, keeping
/// its emptied entries. Only once that write lands is each Mountpoint Pod
/// left without workloads annotated needs-unmount. Its entry is then
/// dropped in a second guarded write, or the record is deleted when no
/// entry remains. A conflict on either write annotates nothing further and
/// leaves the rest to a pass that reads the current record.
pub(crate) async fn persist_pruned(
    kube: &dyn AttachmentKubeClient,
    mountpoint_namespace: &str,
    mut record: MountpointS3PodAttachment,
    pruned: usize,
) -> Result<WriteOutcome<()>, Error> {
    let name = record.name_any();
    if pruned > 0 {
        match kube.replace_attachment(&record).await? {
            WriteOutcome::Applied(written) => record = written,
            WriteOutcome::Conflict => {
                debug!(record = %name, "attachment record changed concurrently");
                record_attachment_conflict("replace");
                return Ok(WriteOutcome::Conflict);
            }
        }
    }

    let emptied = record.spec.empty_entries();
    if emptied.is_empty() {
        return Ok(WriteOutcome::Applied(()));
    }
    for mountpoint_pod in &emptied {
        if kube
            .annotate_pod(mountpoint_namespace, mountpoint_pod, ANNOTATION_NEEDS_UNMOUNT)
            .await?
        {
            info!(mountpoint_pod = %mountpoint_pod, "Mountpoint Pod has no workloads left, marked for unmount");
        }
        record.spec.remove_entry(mountpoint_pod);
    }

    let operation = if record.spec.is_empty() { "delete" } else { "replace" };
    let outcome = if record.spec.is_empty() {
        let outcome = kube.delete_attachment(&record).await?;
        if !outcome.is_conflict() {
            info!(record = %name, "deleted empty attachment record");
        }
        outcome
    } else {
        match kube.replace_attachment(&record).await? {
            WriteOutcome::Applied(_) => WriteOutcome::Applied(()),
            WriteOutcome::Conflict => WriteOutcome::Conflict,
        }
    };

    if outcome.is_conflict() {
        debug!(record = %name, "attachment record changed concurrently");
        record_attachment_conflict(operation);
    }
    Ok(outcome)
}

// =============================================================================
// Ensure attached
// =============================================================================

async fn ensure_attached(
    ctx: &Context,
    pod: &Pod,
    volume: &ResolvedVolume,
    mut record: MountpointS3PodAttachment,
    uid: &str,
) -> Result<Progress, Error> {
    if record.spec.contains_workload(uid) {
        return Ok(Progress::Settled);
    }

    match select_mountpoint_pod(ctx, &record).await? {
        Assignment::Assigned(mountpoint_pod) => {
            record
                .spec
                .attach(&mountpoint_pod, WorkloadAttachment::new(uid, Utc::now()));
            match ctx.kube.replace_attachment(&record).await? {
                WriteOutcome::Applied(_) => {
                    info!(mountpoint_pod = %mountpoint_pod, record = %record.name_any(), "workload attached to existing Mountpoint Pod");
                    WORKLOADS_SHARED.add(1, &[]);
                    publish(
                        ctx,
                        pod,
                        EventType::Normal,
                        reasons::WORKLOAD_ATTACHED,
                        actions::ATTACH,
                        format!("Attached to Mountpoint Pod {mountpoint_pod}"),
                    )
                    .await;
                    Ok(Progress::Settled)
                }
                WriteOutcome::Conflict => {
                    record_attachment_conflict("replace");
                    Ok(Progress::Requeue(REQUEUE_CONFLICT))
                }
            }
        }
        Assignment::NeedsNewHelperPod => {
            let node = record.spec.node_name.clone();
            let mountpoint_pod = spawn_mountpoint_pod(ctx, &node, volume, "no_eligible_pod").await?;
            record
                .spec
                .attach(&mountpoint_pod, WorkloadAttachment::new(uid, Utc::now()));
            match ctx.kube.replace_attachment(&record).await {
                Ok(WriteOutcome::Applied(_)) => {
                    info!(mountpoint_pod = %mountpoint_pod, record = %record.name_any(), "workload attached to new Mountpoint Pod");
                    publish_created(ctx, pod, &mountpoint_pod).await;
                    Ok(Progress::Settled)
                }
                Ok(WriteOutcome::Conflict) => {
                    record_attachment_conflict("replace");
                    discard_mountpoint_pod(ctx, &mountpoint_pod).await;
                    Ok(Progress::Requeue(REQUEUE_CONFLICT))
                }
                Err(e) => {
                    discard_mountpoint_pod(ctx, &mountpoint_pod).await;
                    Err(e)
                }
            }
        }
    }
}

/// First eligible Mountpoint Pod of the record, in name order
///
/// An entry without workloads belongs to a Mountpoint Pod that is being
/// retired and is skipped.
async fn select_mountpoint_pod(
    ctx: &Context,
    record: &MountpointS3PodAttachment,
) -> Result<Assignment, Error> {
    for (name, attachments) in &record.spec.mountpoint_s3_pod_attachments {
        if attachments.is_empty() {
            debug!(mountpoint_pod = %name, "Mountpoint Pod is being retired");
            continue;
        }
        match ctx.kube.get_pod(ctx.mountpoint_namespace(), name).await? {
            Some(candidate) if is_eligible(&candidate, ctx.driver_version()) => {
                return Ok(Assignment::Assigned(name.clone()));
            }
            Some(_) => debug!(mountpoint_pod = %name, "Mountpoint Pod not eligible for new workloads"),
            None => debug!(mountpoint_pod = %name, "Mountpoint Pod no longer exists"),
        }
    }
    Ok(Assignment::NeedsNewHelperPod)
}

/// Whether a Mountpoint Pod may take another workload
pub fn is_eligible(mountpoint_pod: &Pod, driver_version: &str) -> bool {
    let flagged = |annotation: &str| {
        mountpoint_pod
            .annotations()
            .get(annotation)
            .is_some_and(|v| v == ANNOTATION_TRUE)
    };
    let same_version = mountpoint_pod
        .labels()
        .get(LABEL_MOUNTED_BY_DRIVER_VERSION)
        .is_some_and(|v| v == driver_version);
    same_version && !flagged(ANNOTATION_NEEDS_UNMOUNT) && !flagged(ANNOTATION_NO_NEW_WORKLOAD)
}

// =============================================================================
// Create attachment
// =============================================================================

async fn create_attachment(
    ctx: &Context,
    pod: &Pod,
    volume: &ResolvedVolume,
    key: &AttachmentKey,
    uid: &str,
) -> Result<Progress, Error> {
    if ctx.expectations.is_pending(key) {
        debug!(pv = %volume.pv_name, "attachment record creation pending, waiting for it to be listed");
        return Ok(Progress::Requeue(REQUEUE_PENDING));
    }

    let mountpoint_pod = spawn_mountpoint_pod(ctx, &key.node_name, volume, "new_record").await?;

    let mut spec = key.to_spec();
    spec.attach(&mountpoint_pod, WorkloadAttachment::new(uid, Utc::now()));
    let record = MountpointS3PodAttachment {
        metadata: ObjectMeta {
            generate_name: Some(ATTACHMENT_GENERATE_NAME.to_string()),
            labels: Some(
                [(
                    LABEL_CREATED_BY_DRIVER_VERSION.to_string(),
                    ctx.driver_version().to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        spec,
    };

    match ctx.kube.create_attachment(&record).await {
        Ok(WriteOutcome::Applied(created)) => {
            ctx.expectations.set_pending(key);
            info!(record = %created.name_any(), mountpoint_pod = %mountpoint_pod, "created attachment record");
            publish_created(ctx, pod, &mountpoint_pod).await;
            Ok(Progress::Requeue(REQUEUE_PENDING))
        }
        Ok(WriteOutcome::Conflict) => {
            record_attachment_conflict("create");
            discard_mountpoint_pod(ctx, &mountpoint_pod).await;
            Ok(Progress::Requeue(REQUEUE_CONFLICT))
        }
        Err(e) => {
            discard_mountpoint_pod(ctx, &mountpoint_pod).await;
            Err(e)
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn spawn_mountpoint_pod(
    ctx: &Context,
    node: &str,
    volume: &ResolvedVolume,
    reason: &'static str,
) -> Result<String, Error> {
    let spec = ctx.helper_pods.build(node, volume)?;
    let created = ctx.kube.create_pod(&spec).await?;
    let name = created.name_any();
    record_mountpoint_pod_created(reason);
    info!(mountpoint_pod = %name, node, pv = %volume.pv_name, "created Mountpoint Pod");
    Ok(name)
}

/// Best-effort delete of a Mountpoint Pod whose record write failed
async fn discard_mountpoint_pod(ctx: &Context, name: &str) {
    match ctx.kube.delete_pod(ctx.mountpoint_namespace(), name).await {
        Ok(_) => info!(mountpoint_pod = %name, "deleted unused Mountpoint Pod"),
        Err(e) => error!(mountpoint_pod = %name, error = %e, "failed to delete unused Mountpoint Pod"),
    }
}

async fn publish_created(ctx: &Context, pod: &Pod, mountpoint_pod: &str) {
    publish(
        ctx,
        pod,
        EventType::Normal,
        reasons::MOUNTPOINT_POD_CREATED,
        actions::ATTACH,
        format!("Created Mountpoint Pod {mountpoint_pod}"),
    )
    .await;
}

async fn publish(
    ctx: &Context,
    pod: &Pod,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&pod.object_ref(&()), type_, reason, action, Some(note))
        .await;
}
