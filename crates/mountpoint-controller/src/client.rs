//! Kubernetes client abstraction for the attachment controller
//!
//! Every API call the reconciler and the sweeper make goes through
//! [`AttachmentKubeClient`] so both can be driven by mocks or an in-memory
//! fake in tests.
//!
//! Writes to attachment records are guarded by the record's
//! resourceVersion. A conflicting write is reported as
//! [`WriteOutcome::Conflict`], never as an error, so callers have to decide
//! explicitly what a lost race means for them.

use std::collections::HashSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, ServiceAccount};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use mountpoint_common::crd::MountpointS3PodAttachment;
use mountpoint_common::kube_utils::{is_conflict, is_not_found};
use mountpoint_common::{Error, ANNOTATION_TRUE};

/// Page size for cluster-wide pod listing
const POD_LIST_PAGE_SIZE: u32 = 500;

/// Result of a resourceVersion-guarded write
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome<T> {
    /// The write was accepted
    Applied(T),
    /// Someone else changed the object first; re-read and retry
    Conflict,
}

impl<T> WriteOutcome<T> {
    /// True for [`WriteOutcome::Conflict`]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// Trait abstracting the Kubernetes operations of the attachment controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AttachmentKubeClient: Send + Sync {
    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// UIDs of every pod in the cluster
    async fn list_pod_uids(&self) -> Result<HashSet<String>, Error>;

    /// Create a pod (Mountpoint Pods use `generateName`)
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod. Returns false if it was already gone.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Set an annotation to `"true"` on a pod. Returns false if the pod is gone.
    async fn annotate_pod(&self, namespace: &str, name: &str, annotation: &str)
        -> Result<bool, Error>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim, Error>;

    /// Get a PersistentVolume
    async fn get_pv(&self, name: &str) -> Result<PersistentVolume, Error>;

    /// Get a ServiceAccount
    async fn get_service_account(&self, namespace: &str, name: &str)
        -> Result<ServiceAccount, Error>;

    /// List every attachment record
    async fn list_attachments(&self) -> Result<Vec<MountpointS3PodAttachment>, Error>;

    /// Create an attachment record
    async fn create_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<MountpointS3PodAttachment>, Error>;

    /// Replace an attachment record, guarded by its resourceVersion
    async fn replace_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<MountpointS3PodAttachment>, Error>;

    /// Delete an attachment record, guarded by its resourceVersion and UID.
    ///
    /// A record that is already gone counts as deleted.
    async fn delete_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<()>, Error>;
}

/// Real Kubernetes client implementation
pub struct AttachmentKubeClientImpl {
    client: Client,
}

impl AttachmentKubeClientImpl {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AttachmentKubeClient for AttachmentKubeClientImpl {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pod_uids(&self) -> Result<HashSet<String>, Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut uids = HashSet::new();
        let mut params = ListParams::default().limit(POD_LIST_PAGE_SIZE);
        loop {
            let page = api.list_metadata(&params).await?;
            uids.extend(page.items.into_iter().filter_map(|p| p.metadata.uid));
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => params = params.continue_token(&token),
                None => break,
            }
        }
        Ok(uids)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => {
                debug!(pod = %name, namespace = %namespace, "pod already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotation: &str,
    ) -> Result<bool, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut annotations = serde_json::Map::new();
        annotations.insert(annotation.to_string(), ANNOTATION_TRUE.into());
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => {
                debug!(pod = %name, namespace = %namespace, annotation, "pod gone, skipping annotation");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_pv(&self, name: &str) -> Result<PersistentVolume, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_attachments(&self) -> Result<Vec<MountpointS3PodAttachment>, Error> {
        let api: Api<MountpointS3PodAttachment> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<MountpointS3PodAttachment>, Error> {
        let api: Api<MountpointS3PodAttachment> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), record).await {
            Ok(created) => Ok(WriteOutcome::Applied(created)),
            Err(e) if is_conflict(&e) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<MountpointS3PodAttachment>, Error> {
        let api: Api<MountpointS3PodAttachment> = Api::all(self.client.clone());
        match api
            .replace(&record.name_any(), &PostParams::default(), record)
            .await
        {
            Ok(replaced) => Ok(WriteOutcome::Applied(replaced)),
            Err(e) if is_conflict(&e) => Ok(WriteOutcome::Conflict),
            // deleted underneath us: re-read and start over
            Err(e) if is_not_found(&e) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_attachment(
        &self,
        record: &MountpointS3PodAttachment,
    ) -> Result<WriteOutcome<()>, Error> {
        let api: Api<MountpointS3PodAttachment> = Api::all(self.client.clone());
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: record.resource_version(),
                uid: record.uid(),
            }),
            ..Default::default()
        };
        match api.delete(&record.name_any(), &params).await {
            Ok(_) => Ok(WriteOutcome::Applied(())),
            Err(e) if is_not_found(&e) => Ok(WriteOutcome::Applied(())),
            Err(e) if is_conflict(&e) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_outcome_reports_conflict() {
        assert!(WriteOutcome::<()>::Conflict.is_conflict());
        assert!(!WriteOutcome::Applied(()).is_conflict());
    }

    #[tokio::test]
    async fn mock_client_is_object_safe() {
        let mut mock = MockAttachmentKubeClient::new();
        mock.expect_delete_pod().returning(|_, _| Ok(false));
        let client: &dyn AttachmentKubeClient = &mock;
        assert!(!client.delete_pod("mount-s3", "mp-gone").await.expect("delete"));
    }
}
