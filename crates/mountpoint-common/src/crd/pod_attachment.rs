//! MountpointS3PodAttachment CRD types
//!
//! A `MountpointS3PodAttachment` records which Mountpoint Pods serve a given
//! combination of node, volume, and mount parameters, and which workload
//! pods are attached to each of them. One record exists per distinct
//! combination; the record is deleted once no workload is attached.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Full name of the CRD object
pub const CRD_NAME: &str = "mountpoints3podattachments.s3.csi.aws.com";

/// `generateName` prefix for new records
pub const ATTACHMENT_GENERATE_NAME: &str = "s3pa-";

/// Field paths of the attachment key, as they appear on the record.
///
/// These are the names used to filter records by key.
pub mod field {
    /// Node the workload and Mountpoint Pod run on
    pub const NODE_NAME: &str = "spec.nodeName";
    /// PersistentVolume name
    pub const PERSISTENT_VOLUME_NAME: &str = "spec.persistentVolumeName";
    /// CSI volume handle
    pub const VOLUME_ID: &str = "spec.volumeID";
    /// Comma-joined mount options
    pub const MOUNT_OPTIONS: &str = "spec.mountOptions";
    /// Credential source (`driver` or `pod`)
    pub const AUTHENTICATION_SOURCE: &str = "spec.authenticationSource";
    /// Workload pod fsGroup, empty when unset
    pub const WORKLOAD_FS_GROUP: &str = "spec.workloadFSGroup";
    /// Workload namespace (pod-level credentials only)
    pub const WORKLOAD_NAMESPACE: &str = "spec.workloadNamespace";
    /// Workload service account (pod-level credentials only)
    pub const WORKLOAD_SERVICE_ACCOUNT_NAME: &str = "spec.workloadServiceAccountName";
    /// IAM role of the workload service account (pod-level credentials only)
    pub const WORKLOAD_SERVICE_ACCOUNT_IAM_ROLE_ARN: &str = "spec.workloadServiceAccountIAMRoleARN";
}

// =============================================================================
// MountpointS3PodAttachment CRD
// =============================================================================

/// Shared attachment record for one node/volume/mount-parameter combination.
///
/// Created and managed exclusively by the attachment controller.
/// Cluster-scoped because it references pods across namespaces.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "s3.csi.aws.com",
    version = "v2beta",
    kind = "MountpointS3PodAttachment",
    derive = "PartialEq",
    plural = "mountpoints3podattachments",
    shortname = "s3pa",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Volume","type":"string","jsonPath":".spec.persistentVolumeName"}"#,
    printcolumn = r#"{"name":"Auth","type":"string","jsonPath":".spec.authenticationSource"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MountpointS3PodAttachmentSpec {
    /// Node the Mountpoint Pods run on
    pub node_name: String,

    /// PersistentVolume the Mountpoint Pods mount
    pub persistent_volume_name: String,

    /// CSI volume handle of the PersistentVolume
    #[serde(rename = "volumeID")]
    pub volume_id: String,

    /// Mount options of the PersistentVolume, joined with commas
    #[serde(default)]
    pub mount_options: String,

    /// Credential source: `driver` or `pod`
    pub authentication_source: String,

    /// fsGroup of the workload pods, empty when unset
    #[serde(rename = "workloadFSGroup", default)]
    pub workload_fs_group: String,

    /// Workload service account; only set for pod-level credentials
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload_service_account_name: String,

    /// Workload namespace; only set for pod-level credentials
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload_namespace: String,

    /// IAM role of the workload service account; only set for pod-level credentials
    #[serde(
        rename = "workloadServiceAccountIAMRoleARN",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub workload_service_account_iam_role_arn: String,

    /// Mountpoint Pod name to the workloads it serves
    #[serde(rename = "mountpointS3PodAttachments", default)]
    pub mountpoint_s3_pod_attachments: BTreeMap<String, Vec<WorkloadAttachment>>,
}

/// One workload pod attached to a Mountpoint Pod
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadAttachment {
    /// UID of the workload pod
    #[serde(rename = "workloadPodUID")]
    pub workload_pod_uid: String,

    /// When the workload was attached
    pub attachment_time: DateTime<Utc>,
}

impl WorkloadAttachment {
    /// Attachment for the given workload UID at the given time
    pub fn new(uid: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            workload_pod_uid: uid.into(),
            attachment_time: at,
        }
    }
}

impl MountpointS3PodAttachmentSpec {
    /// Value of a key field by its field path, `None` for unknown paths
    pub fn field_value(&self, path: &str) -> Option<&str> {
        let value = match path {
            field::NODE_NAME => &self.node_name,
            field::PERSISTENT_VOLUME_NAME => &self.persistent_volume_name,
            field::VOLUME_ID => &self.volume_id,
            field::MOUNT_OPTIONS => &self.mount_options,
            field::AUTHENTICATION_SOURCE => &self.authentication_source,
            field::WORKLOAD_FS_GROUP => &self.workload_fs_group,
            field::WORKLOAD_NAMESPACE => &self.workload_namespace,
            field::WORKLOAD_SERVICE_ACCOUNT_NAME => &self.workload_service_account_name,
            field::WORKLOAD_SERVICE_ACCOUNT_IAM_ROLE_ARN => {
                &self.workload_service_account_iam_role_arn
            }
            _ => return None,
        };
        Some(value.as_str())
    }

    /// Whether any Mountpoint Pod serves the workload
    pub fn contains_workload(&self, uid: &str) -> bool {
        self.mountpoint_s3_pod_attachments
            .values()
            .flatten()
            .any(|a| a.workload_pod_uid == uid)
    }

    /// Attach a workload to a Mountpoint Pod, creating the entry if needed
    pub fn attach(&mut self, mountpoint_pod: &str, attachment: WorkloadAttachment) {
        self.mountpoint_s3_pod_attachments
            .entry(mountpoint_pod.to_string())
            .or_default()
            .push(attachment);
    }

    /// Remove every attachment of the workload. Returns how many were removed.
    pub fn remove_workload(&mut self, uid: &str) -> usize {
        self.retain_attachments(|a| a.workload_pod_uid != uid)
    }

    /// Keep only attachments matching `keep`. Returns how many were removed.
    ///
    /// Entries left empty stay in the map; callers decide what happens to
    /// their Mountpoint Pods before dropping them.
    pub fn retain_attachments(&mut self, mut keep: impl FnMut(&WorkloadAttachment) -> bool) -> usize {
        let mut removed = 0;
        for attachments in self.mountpoint_s3_pod_attachments.values_mut() {
            let before = attachments.len();
            attachments.retain(|a| keep(a));
            removed += before - attachments.len();
        }
        removed
    }

    /// Names of Mountpoint Pods with no attached workloads
    pub fn empty_entries(&self) -> Vec<String> {
        self.mountpoint_s3_pod_attachments
            .iter()
            .filter(|(_, attachments)| attachments.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop a Mountpoint Pod entry
    pub fn remove_entry(&mut self, mountpoint_pod: &str) {
        self.mountpoint_s3_pod_attachments.remove(mountpoint_pod);
    }

    /// True when no Mountpoint Pod is referenced
    pub fn is_empty(&self) -> bool {
        self.mountpoint_s3_pod_attachments.is_empty()
    }

    /// Total number of attached workloads
    pub fn workload_count(&self) -> usize {
        self.mountpoint_s3_pod_attachments.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
