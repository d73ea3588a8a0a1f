//! Attachment keys: which workloads may share a Mountpoint Pod
//!
//! Two workloads share a Mountpoint Pod only when everything that shapes
//! the mount is identical: node, volume, mount options, fsGroup, and the
//! credential source. With pod-level credentials the workload identity
//! (namespace, service account, IAM role) becomes part of the key too, so
//! no workload ever reads a bucket through another workload's role.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;

use mountpoint_common::crd::{field, MountpointS3PodAttachmentSpec};
use mountpoint_common::DEFAULT_SERVICE_ACCOUNT_NAME;

use crate::volume::ResolvedVolume;

/// Workload identity, part of the key only for pod-level credentials
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadIdentity {
    /// Workload namespace
    pub namespace: String,
    /// Workload service account name
    pub service_account_name: String,
    /// IAM role annotated on the service account, empty when absent
    pub role_arn: String,
}

/// Sharing key for one workload volume
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    /// Node the workload is scheduled to
    pub node_name: String,
    /// PersistentVolume name
    pub persistent_volume_name: String,
    /// CSI volume handle
    pub volume_id: String,
    /// Mount options joined with commas
    pub mount_options: String,
    /// Workload fsGroup as a decimal string, empty when unset
    pub workload_fs_group: String,
    /// `driver` or `pod`
    pub authentication_source: String,
    /// Set only when `authentication_source` is `pod`
    pub identity: Option<WorkloadIdentity>,
}

/// Service account the pod runs as
pub fn service_account_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.service_account_name.as_deref())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT_NAME)
}

impl AttachmentKey {
    /// Derive the key for `pod` mounting `volume`.
    ///
    /// `role_arn` is only consulted when the volume uses pod-level
    /// credentials; `None` there means the service account has no role.
    pub fn new(pod: &Pod, volume: &ResolvedVolume, role_arn: Option<&str>) -> Self {
        let spec = pod.spec.as_ref();
        let node_name = spec
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        let workload_fs_group = spec
            .and_then(|s| s.security_context.as_ref())
            .and_then(|sc| sc.fs_group)
            .map(|gid| gid.to_string())
            .unwrap_or_default();

        let identity = volume.uses_pod_credentials().then(|| WorkloadIdentity {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            service_account_name: service_account_name(pod).to_string(),
            role_arn: role_arn.unwrap_or_default().to_string(),
        });

        Self {
            node_name,
            persistent_volume_name: volume.pv_name.clone(),
            volume_id: volume.volume_id.clone(),
            mount_options: volume.mount_options.join(","),
            workload_fs_group,
            authentication_source: volume.authentication_source().to_string(),
            identity,
        }
    }

    /// Field path to value, for every field that takes part in matching
    pub fn field_filters(&self) -> BTreeMap<&'static str, &str> {
        let mut filters = BTreeMap::from([
            (field::NODE_NAME, self.node_name.as_str()),
            (field::PERSISTENT_VOLUME_NAME, self.persistent_volume_name.as_str()),
            (field::VOLUME_ID, self.volume_id.as_str()),
            (field::MOUNT_OPTIONS, self.mount_options.as_str()),
            (field::WORKLOAD_FS_GROUP, self.workload_fs_group.as_str()),
            (field::AUTHENTICATION_SOURCE, self.authentication_source.as_str()),
        ]);
        if let Some(identity) = &self.identity {
            filters.insert(field::WORKLOAD_NAMESPACE, identity.namespace.as_str());
            filters.insert(
                field::WORKLOAD_SERVICE_ACCOUNT_NAME,
                identity.service_account_name.as_str(),
            );
            filters.insert(
                field::WORKLOAD_SERVICE_ACCOUNT_IAM_ROLE_ARN,
                identity.role_arn.as_str(),
            );
        }
        filters
    }

    /// Deterministic serialization: `path=value;` pairs sorted by path
    pub fn expectation_key(&self) -> String {
        self.field_filters()
            .iter()
            .map(|(path, value)| format!("{path}={value};"))
            .collect()
    }

    /// Whether a record was written for this key
    pub fn matches(&self, spec: &MountpointS3PodAttachmentSpec) -> bool {
        self.field_filters()
            .iter()
            .all(|(path, value)| spec.field_value(path) == Some(*value))
    }

    /// Record spec for this key with no Mountpoint Pods yet
    pub fn to_spec(&self) -> MountpointS3PodAttachmentSpec {
        let identity = self.identity.clone();
        let (namespace, service_account_name, role_arn) = identity
            .map(|i| (i.namespace, i.service_account_name, i.role_arn))
            .unwrap_or_default();
        MountpointS3PodAttachmentSpec {
            node_name: self.node_name.clone(),
            persistent_volume_name: self.persistent_volume_name.clone(),
            volume_id: self.volume_id.clone(),
            mount_options: self.mount_options.clone(),
            authentication_source: self.authentication_source.clone(),
            workload_fs_group: self.workload_fs_group.clone(),
            workload_namespace: namespace,
            workload_service_account_name: service_account_name,
            workload_service_account_iam_role_arn: role_arn,
            mountpoint_s3_pod_attachments: BTreeMap::new(),
        }
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expectation_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::workload_pod;
    use crate::volume::{ATTRIBUTE_AUTHENTICATION_SOURCE, AUTHENTICATION_SOURCE_POD};
    use k8s_openapi::api::core::v1::PodSecurityContext;

    fn volume() -> ResolvedVolume {
        ResolvedVolume {
            claim_name: "data".to_string(),
            pv_name: "pv-1".to_string(),
            volume_id: "bucket-1".to_string(),
            mount_options: vec!["allow-other".to_string(), "uid=1000".to_string()],
            volume_attributes: BTreeMap::new(),
        }
    }

    fn pod_auth_volume() -> ResolvedVolume {
        let mut v = volume();
        v.volume_attributes.insert(
            ATTRIBUTE_AUTHENTICATION_SOURCE.to_string(),
            AUTHENTICATION_SOURCE_POD.to_string(),
        );
        v
    }

    #[test]
    fn driver_credentials_key_omits_workload_identity() {
        let pod = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        let key = AttachmentKey::new(&pod, &volume(), Some("arn:aws:iam::1:role/ignored"));

        assert!(key.identity.is_none());
        let filters = key.field_filters();
        assert_eq!(filters.len(), 6);
        assert_eq!(filters[field::NODE_NAME], "node-a");
        assert_eq!(filters[field::MOUNT_OPTIONS], "allow-other,uid=1000");
        assert_eq!(filters[field::AUTHENTICATION_SOURCE], "driver");
        assert_eq!(filters[field::WORKLOAD_FS_GROUP], "");
        assert!(!filters.contains_key(field::WORKLOAD_NAMESPACE));
    }

    #[test]
    fn pod_credentials_key_includes_workload_identity() {
        let pod = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        let key = AttachmentKey::new(&pod, &pod_auth_volume(), None);

        let filters = key.field_filters();
        assert_eq!(filters.len(), 9);
        assert_eq!(filters[field::WORKLOAD_NAMESPACE], "team-a");
        assert_eq!(filters[field::WORKLOAD_SERVICE_ACCOUNT_NAME], "default");
        // a missing role is the stable empty value, not an absent field
        assert_eq!(filters[field::WORKLOAD_SERVICE_ACCOUNT_IAM_ROLE_ARN], "");
    }

    /// Story: identical inputs always produce the same expectation key
    ///
    /// The pending-expectation cache only works if two reconciles of pods
    /// with the same mount parameters compute byte-identical keys.
    #[test]
    fn story_expectation_key_is_deterministic() {
        let pod_a = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        let pod_b = workload_pod("team-a", "web-2", "uid-2", Some("node-a"), "data");

        let key_a = AttachmentKey::new(&pod_a, &volume(), None);
        let key_b = AttachmentKey::new(&pod_b, &volume(), None);
        assert_eq!(key_a.expectation_key(), key_b.expectation_key());
        assert_eq!(
            key_a.expectation_key(),
            "spec.authenticationSource=driver;\
             spec.mountOptions=allow-other,uid=1000;\
             spec.nodeName=node-a;\
             spec.persistentVolumeName=pv-1;\
             spec.volumeID=bucket-1;\
             spec.workloadFSGroup=;"
        );
    }

    #[test]
    fn fs_group_separates_keys() {
        let plain = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        let mut grouped = plain.clone();
        if let Some(spec) = grouped.spec.as_mut() {
            spec.security_context = Some(PodSecurityContext {
                fs_group: Some(2000),
                ..Default::default()
            });
        }

        let a = AttachmentKey::new(&plain, &volume(), None);
        let b = AttachmentKey::new(&grouped, &volume(), None);
        assert_eq!(b.workload_fs_group, "2000");
        assert_ne!(a.expectation_key(), b.expectation_key());
    }

    #[test]
    fn pod_credentials_separate_namespaces() {
        let a = workload_pod("team-a", "web", "uid-1", Some("node-a"), "data");
        let b = workload_pod("team-b", "web", "uid-2", Some("node-a"), "data");
        let key_a = AttachmentKey::new(&a, &pod_auth_volume(), Some("arn:role"));
        let key_b = AttachmentKey::new(&b, &pod_auth_volume(), Some("arn:role"));
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn every_key_field_separates_records() {
        let pod = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        let base = AttachmentKey::new(&pod, &pod_auth_volume(), Some("arn:role/a"));
        let record = base.to_spec();

        fn identity(key: &mut AttachmentKey) -> &mut WorkloadIdentity {
            key.identity.as_mut().expect("pod credentials key")
        }
        let cases: [(&str, fn(&mut AttachmentKey)); 9] = [
            ("node", |k| k.node_name = "node-b".to_string()),
            ("pv name", |k| k.persistent_volume_name = "pv-2".to_string()),
            ("volume id", |k| k.volume_id = "bucket-2".to_string()),
            ("mount options", |k| k.mount_options = "allow-other".to_string()),
            ("fs group", |k| k.workload_fs_group = "2000".to_string()),
            ("auth source", |k| k.authentication_source = "driver".to_string()),
            ("namespace", |k| identity(k).namespace = "team-b".to_string()),
            ("service account", |k| identity(k).service_account_name = "reader".to_string()),
            ("role", |k| identity(k).role_arn = "arn:role/b".to_string()),
        ];

        for (field, mutate) in cases {
            let mut key = base.clone();
            mutate(&mut key);
            assert_ne!(key.expectation_key(), base.expectation_key(), "{field}");
            assert!(!key.matches(&record), "{field}");
            assert!(key.matches(&key.to_spec()), "{field}");
        }
    }

    #[test]
    fn pod_credentials_separate_service_accounts_and_roles() {
        let pod = workload_pod("team-a", "web", "uid-1", Some("node-a"), "data");
        let mut reader = pod.clone();
        if let Some(spec) = reader.spec.as_mut() {
            spec.service_account_name = Some("reader".to_string());
        }

        let base = AttachmentKey::new(&pod, &pod_auth_volume(), Some("arn:role/a"));
        let other_sa = AttachmentKey::new(&reader, &pod_auth_volume(), Some("arn:role/a"));
        let other_role = AttachmentKey::new(&pod, &pod_auth_volume(), Some("arn:role/b"));
        let no_role = AttachmentKey::new(&pod, &pod_auth_volume(), None);

        for other in [&other_sa, &other_role, &no_role] {
            assert_ne!(base.expectation_key(), other.expectation_key());
            assert!(!other.matches(&base.to_spec()));
        }
    }

    #[test]
    fn credential_source_separates_keys() {
        let pod = workload_pod("team-a", "web", "uid-1", Some("node-a"), "data");
        let driver = AttachmentKey::new(&pod, &volume(), None);
        let pod_scoped = AttachmentKey::new(&pod, &pod_auth_volume(), None);
        assert_ne!(driver.expectation_key(), pod_scoped.expectation_key());
        assert!(!pod_scoped.matches(&driver.to_spec()));
        assert!(!driver.matches(&pod_scoped.to_spec()));
    }

    #[test]
    fn spec_built_from_key_matches_key() {
        let pod = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        for volume in [volume(), pod_auth_volume()] {
            let key = AttachmentKey::new(&pod, &volume, Some("arn:role"));
            let spec = key.to_spec();
            assert!(key.matches(&spec));
            assert!(spec.is_empty());
        }
    }

    #[test]
    fn record_for_other_node_does_not_match() {
        let pod = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        let key = AttachmentKey::new(&pod, &volume(), None);
        let mut spec = key.to_spec();
        spec.node_name = "node-b".to_string();
        assert!(!key.matches(&spec));
    }

    #[test]
    fn service_account_defaults_when_unset_or_empty() {
        let mut pod = workload_pod("team-a", "web-1", "uid-1", Some("node-a"), "data");
        assert_eq!(service_account_name(&pod), "default");
        if let Some(spec) = pod.spec.as_mut() {
            spec.service_account_name = Some("reader".to_string());
        }
        assert_eq!(service_account_name(&pod), "reader");
    }
}
