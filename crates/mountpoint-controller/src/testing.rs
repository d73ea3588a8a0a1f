//! In-memory cluster for reconciler and sweeper tests
//!
//! `FakeCluster` implements [`AttachmentKubeClient`] over plain maps with
//! the API server behaviours the controller depends on: `generateName`,
//! resourceVersion-guarded writes, and 404s for missing objects. Failure
//! injection knobs cover the races and errors that are awkward to express
//! with mock expectations.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource,
    PersistentVolumeSpec, Pod, PodSpec, PodStatus, ServiceAccount, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use mountpoint_common::crd::{MountpointS3PodAttachment, MountpointS3PodAttachmentSpec};
use mountpoint_common::{Error, ANNOTATION_TRUE, CSI_DRIVER_NAME};

use crate::client::{AttachmentKubeClient, WriteOutcome};

type NamespacedKey = (String, String);

fn key(namespace: &str, name: &str) -> NamespacedKey {
    (namespace.to_string(), name.to_string())
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{kind} {name:?} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

#[derive(Default)]
struct FakeState {
    pods: BTreeMap<NamespacedKey, Pod>,
    pvcs: BTreeMap<NamespacedKey, PersistentVolumeClaim>,
    pvs: BTreeMap<String, PersistentVolume>,
    service_accounts: BTreeMap<NamespacedKey, ServiceAccount>,
    records: BTreeMap<String, MountpointS3PodAttachment>,
    counter: u64,
    writes: usize,
    hide_records: bool,
    fail_record_create: bool,
    fail_pod_create: bool,
    conflicting_replaces: usize,
    conflicting_deletes: usize,
}

impl FakeState {
    fn next_id(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

/// In-memory stand-in for the API server
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().expect("fake cluster lock poisoned");
        f(&mut state)
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Store a pod as-is
    pub fn add_pod(&self, pod: Pod) {
        self.with_state(|s| {
            let k = key(
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default(),
            );
            s.pods.insert(k, pod);
        });
    }

    /// Create a bound claim and its S3 PersistentVolume
    pub fn add_s3_volume(
        &self,
        namespace: &str,
        claim: &str,
        pv_name: &str,
        attributes: &[(&str, &str)],
    ) {
        let pvc = bound_pvc(namespace, claim, pv_name);
        let mut pv = s3_pv(pv_name, namespace, claim);
        if let Some(csi) = pv.spec.as_mut().and_then(|s| s.csi.as_mut()) {
            let attrs = csi.volume_attributes.get_or_insert_with(BTreeMap::new);
            for (k, v) in attributes {
                attrs.insert(k.to_string(), v.to_string());
            }
        }
        self.with_state(|s| {
            s.pvcs.insert(key(namespace, claim), pvc);
            s.pvs.insert(pv_name.to_string(), pv);
        });
    }

    /// Store a claim without a volume
    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        self.with_state(|s| {
            let k = key(
                pvc.metadata.namespace.as_deref().unwrap_or_default(),
                pvc.metadata.name.as_deref().unwrap_or_default(),
            );
            s.pvcs.insert(k, pvc);
        });
    }

    /// Store a service account, optionally with an IAM role annotation
    pub fn add_service_account(&self, namespace: &str, name: &str, role_arn: Option<&str>) {
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: role_arn.map(|arn| {
                    BTreeMap::from([(
                        mountpoint_common::IRSA_ROLE_ARN_ANNOTATION.to_string(),
                        arn.to_string(),
                    )])
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        self.with_state(|s| {
            s.service_accounts.insert(key(namespace, name), sa);
        });
    }

    /// Store a record directly, assigning name and resourceVersion
    pub fn insert_record(&self, spec: MountpointS3PodAttachmentSpec) -> String {
        self.with_state(|s| {
            let id = s.next_id();
            let name = format!("s3pa-{id}");
            let record = MountpointS3PodAttachment {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    uid: Some(format!("record-uid-{id}")),
                    resource_version: Some(id.to_string()),
                    ..Default::default()
                },
                spec,
            };
            s.records.insert(name.clone(), record);
            name
        })
    }

    // =========================================================================
    // Mutating existing objects
    // =========================================================================

    /// Change a pod's phase
    pub fn set_phase(&self, namespace: &str, name: &str, phase: &str) {
        self.with_state(|s| {
            if let Some(pod) = s.pods.get_mut(&key(namespace, name)) {
                pod.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
            }
        });
    }

    /// Set an annotation on a pod
    pub fn annotate(&self, namespace: &str, name: &str, annotation: &str, value: &str) {
        self.with_state(|s| {
            if let Some(pod) = s.pods.get_mut(&key(namespace, name)) {
                pod.annotations_mut()
                    .insert(annotation.to_string(), value.to_string());
            }
        });
    }

    /// Set a label on a pod
    pub fn label(&self, namespace: &str, name: &str, label: &str, value: &str) {
        self.with_state(|s| {
            if let Some(pod) = s.pods.get_mut(&key(namespace, name)) {
                pod.labels_mut().insert(label.to_string(), value.to_string());
            }
        });
    }

    /// Replace the mount options of a PersistentVolume
    pub fn set_pv_mount_options(&self, pv_name: &str, options: &[&str]) {
        self.with_state(|s| {
            if let Some(spec) = s.pvs.get_mut(pv_name).and_then(|pv| pv.spec.as_mut()) {
                spec.mount_options = Some(options.iter().map(|o| o.to_string()).collect());
            }
        });
    }

    /// Drop a pod without going through the controller
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.with_state(|s| {
            s.pods.remove(&key(namespace, name));
        });
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Make record lists return nothing, as if the cache had not caught up
    pub fn hide_records(&self, hide: bool) {
        self.with_state(|s| s.hide_records = hide);
    }

    /// Make every record creation fail with an internal error
    pub fn fail_record_create(&self, fail: bool) {
        self.with_state(|s| s.fail_record_create = fail);
    }

    /// Make every pod creation fail with an internal error
    pub fn fail_pod_create(&self, fail: bool) {
        self.with_state(|s| s.fail_pod_create = fail);
    }

    /// Report the next `n` record replaces as conflicts
    pub fn conflict_next_replaces(&self, n: usize) {
        self.with_state(|s| s.conflicting_replaces = n);
    }

    /// Report the next `n` record deletes as conflicts
    pub fn conflict_next_deletes(&self, n: usize) {
        self.with_state(|s| s.conflicting_deletes = n);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Snapshot of a pod
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.with_state(|s| s.pods.get(&key(namespace, name)).cloned())
    }

    /// Every pod in a namespace
    pub fn pods_in(&self, namespace: &str) -> Vec<Pod> {
        self.with_state(|s| {
            s.pods
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, p)| p.clone())
                .collect()
        })
    }

    /// Every attachment record
    pub fn records(&self) -> Vec<MountpointS3PodAttachment> {
        self.with_state(|s| s.records.values().cloned().collect())
    }

    /// Number of mutating calls served so far
    pub fn writes(&self) -> usize {
        self.with_state(|s| s.writes)
    }
}

#[async_trait]
impl AttachmentKubeClient for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pod(namespace, name))
    }

    async fn list_pod_uids(&self) -> Result<HashSet<String>, Error> {
        Ok(self.with_state(|s| {
            s.pods
                .values()
                .filter_map(|p| p.metadata.uid.clone())
                .collect()
        }))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        self.with_state(|s| {
            if s.fail_pod_create {
                return Err(Error::internal_with_context("fake", "pod creation failed"));
            }
            s.writes += 1;
            let id = s.next_id();
            let mut created = pod.clone();
            let name = match &pod.metadata.name {
                Some(name) => name.clone(),
                None => format!("{}{id}", pod.metadata.generate_name.as_deref().unwrap_or_default()),
            };
            created.metadata.name = Some(name.clone());
            created.metadata.uid = Some(format!("pod-uid-{id}"));
            created.metadata.resource_version = Some(id.to_string());
            created.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            let namespace = created.metadata.namespace.clone().unwrap_or_default();
            s.pods.insert(key(&namespace, &name), created.clone());
            Ok(created)
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.with_state(|s| {
            s.writes += 1;
            s.pods.remove(&key(namespace, name)).is_some()
        }))
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotation: &str,
    ) -> Result<bool, Error> {
        Ok(self.with_state(|s| {
            s.writes += 1;
            match s.pods.get_mut(&key(namespace, name)) {
                Some(pod) => {
                    pod.annotations_mut()
                        .insert(annotation.to_string(), ANNOTATION_TRUE.to_string());
                    true
                }
                None => false,
            }
        }))
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim, Error> {
        self.with_state(|s| s.pvcs.get(&key(namespace, name)).cloned())
            .ok_or_else(|| not_found("persistentvolumeclaims", name))
    }

    async fn get_pv(&self, name: &str) -> Result<PersistentVolume, Error> {
        self.with_state(|s| s.pvs.get(name).cloned())
            .ok_or_else(|| not_found("persistentvolumes", name))
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, Error> {
        self.with_state(|s| s.service_accounts.get(&key(namespace, name)).cloned())
            .ok_or_else(|| not_found("serviceaccounts", name))
    }

    async fn list_attachments(&self) -> Result<Vec<MountpointS3PodAttachment>, Error> {
        Ok(self.with_state(|s| {
            if s.hide_records {
                Vec::new()
            } else {
                s.records.values().cloned().collect()
            }
        }))
    }

    async fn create_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<MountpointS3PodAttachment>, Error> {
        self.with_state(|s| {
            if s.fail_record_create {
                return Err(Error::internal_with_context("fake", "record creation failed"));
            }
            s.writes += 1;
            let id = s.next_id();
            let mut created = record.clone();
            let name = format!(
                "{}{id}",
                record.metadata.generate_name.as_deref().unwrap_or_default()
            );
            created.metadata.name = Some(name.clone());
            created.metadata.uid = Some(format!("record-uid-{id}"));
            created.metadata.resource_version = Some(id.to_string());
            s.records.insert(name, created.clone());
            Ok(WriteOutcome::Applied(created))
        })
    }

    async fn replace_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<MountpointS3PodAttachment>, Error> {
        Ok(self.with_state(|s| {
            s.writes += 1;
            if s.conflicting_replaces > 0 {
                s.conflicting_replaces -= 1;
                return WriteOutcome::Conflict;
            }
            let name = record.name_any();
            let current_version = s.records.get(&name).and_then(|r| r.resource_version());
            if current_version.is_none() || current_version != record.resource_version() {
                return WriteOutcome::Conflict;
            }
            let id = s.next_id();
            let mut replaced = record.clone();
            replaced.metadata.resource_version = Some(id.to_string());
            s.records.insert(name, replaced.clone());
            WriteOutcome::Applied(replaced)
        }))
    }

    async fn delete_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<()>, Error> {
        Ok(self.with_state(|s| {
            s.writes += 1;
            if s.conflicting_deletes > 0 {
                s.conflicting_deletes -= 1;
                return WriteOutcome::Conflict;
            }
            let name = record.name_any();
            match s.records.get(&name) {
                None => WriteOutcome::Applied(()),
                Some(current) if current.resource_version() != record.resource_version() => {
                    WriteOutcome::Conflict
                }
                Some(_) => {
                    s.records.remove(&name);
                    WriteOutcome::Applied(())
                }
            }
        }))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Workload pod mounting `claim`, Pending on `node` (or unscheduled)
pub fn workload_pod(
    namespace: &str,
    name: &str,
    uid: &str,
    node: Option<&str>,
    claim: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            volumes: Some(vec![Volume {
                name: "s3-volume".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        }),
    }
}

/// Mark a pod as being deleted
pub fn terminating(mut pod: Pod, at: DateTime<Utc>) -> Pod {
    pod.metadata.deletion_timestamp = Some(Time(at));
    pod
}

/// Claim bound to `pv_name`
pub fn bound_pvc(namespace: &str, name: &str, pv_name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(pv_name.to_string()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        }),
    }
}

/// S3 PersistentVolume bound to `claim_namespace/claim_name`
pub fn s3_pv(name: &str, claim_namespace: &str, claim_name: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                name: Some(claim_name.to_string()),
                namespace: Some(claim_namespace.to_string()),
                ..Default::default()
            }),
            csi: Some(CSIPersistentVolumeSource {
                driver: CSI_DRIVER_NAME.to_string(),
                volume_handle: format!("bucket-{name}"),
                ..Default::default()
            }),
            mount_options: Some(vec!["allow-other".to_string()]),
            ..Default::default()
        }),
        status: None,
    }
}
