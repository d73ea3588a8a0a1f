//! Resolve a workload's claim to the S3 volume behind it
//!
//! A pod only references a PersistentVolumeClaim; the mount parameters live
//! on the bound PersistentVolume. Resolution walks claim to volume, checks
//! the binding is mutual, and filters out volumes of other CSI drivers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use tracing::debug;

use mountpoint_common::{Error, CSI_DRIVER_NAME};

use crate::client::AttachmentKubeClient;

/// Volume attribute selecting the credential source
pub const ATTRIBUTE_AUTHENTICATION_SOURCE: &str = "authenticationSource";

/// Credentials come from the driver's own identity
pub const AUTHENTICATION_SOURCE_DRIVER: &str = "driver";

/// Credentials come from the workload pod's service account
pub const AUTHENTICATION_SOURCE_POD: &str = "pod";

/// An S3 volume bound to a workload's claim
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedVolume {
    /// Name of the claim in the workload namespace
    pub claim_name: String,
    /// Name of the bound PersistentVolume
    pub pv_name: String,
    /// CSI volume handle
    pub volume_id: String,
    /// Mount options from the PersistentVolume
    pub mount_options: Vec<String>,
    /// CSI volume attributes
    pub volume_attributes: BTreeMap<String, String>,
}

impl ResolvedVolume {
    /// Look up a CSI volume attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.volume_attributes.get(key).map(String::as_str)
    }

    /// Credential source, `driver` when unset or empty
    pub fn authentication_source(&self) -> &str {
        match self.attribute(ATTRIBUTE_AUTHENTICATION_SOURCE) {
            Some(source) if !source.is_empty() => source,
            _ => AUTHENTICATION_SOURCE_DRIVER,
        }
    }

    /// Whether the volume mounts with the workload's own credentials
    pub fn uses_pod_credentials(&self) -> bool {
        self.authentication_source() == AUTHENTICATION_SOURCE_POD
    }
}

/// Outcome of resolving one claim
#[derive(Clone, Debug, PartialEq)]
pub enum VolumeResolution {
    /// The claim is bound to an S3 volume
    Resolved(ResolvedVolume),
    /// The claim has no volume yet; retry shortly
    ClaimNotBound,
    /// The volume belongs to another CSI driver; nothing to do
    ForeignDriver,
}

/// Resolve the claim `claim_name` in `namespace` to its S3 volume.
///
/// Read failures and a PersistentVolume whose `claimRef` points elsewhere
/// are errors. An unbound claim and a foreign volume are ordinary outcomes.
pub async fn resolve(
    client: &dyn AttachmentKubeClient,
    namespace: &str,
    claim_name: &str,
) -> Result<VolumeResolution, Error> {
    let pvc = client.get_pvc(namespace, claim_name).await?;
    let Some(pv_name) = bound_volume_name(&pvc) else {
        debug!(claim = %claim_name, namespace = %namespace, "claim is not bound yet");
        return Ok(VolumeResolution::ClaimNotBound);
    };

    let pv = client.get_pv(&pv_name).await?;
    verify_claim_ref(&pv, namespace, claim_name)?;

    Ok(match s3_volume(&pv, claim_name) {
        Some(volume) => VolumeResolution::Resolved(volume),
        None => VolumeResolution::ForeignDriver,
    })
}

fn bound_volume_name(pvc: &PersistentVolumeClaim) -> Option<String> {
    let bound = pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
    let volume_name = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .filter(|name| !name.is_empty());
    volume_name.filter(|_| bound)
}

fn verify_claim_ref(pv: &PersistentVolume, namespace: &str, claim_name: &str) -> Result<(), Error> {
    let pv_name = pv.metadata.name.as_deref().unwrap_or_default();
    let claim_ref = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
    let Some(claim_ref) = claim_ref else {
        return Err(Error::volume_binding(
            namespace,
            claim_name,
            format!("persistent volume {pv_name} has no claimRef"),
        ));
    };

    let ref_name = claim_ref.name.as_deref().unwrap_or_default();
    let ref_namespace = claim_ref.namespace.as_deref().unwrap_or(namespace);
    if ref_name != claim_name || ref_namespace != namespace {
        return Err(Error::volume_binding(
            namespace,
            claim_name,
            format!("persistent volume {pv_name} is bound to {ref_namespace}/{ref_name}"),
        ));
    }
    Ok(())
}

fn s3_volume(pv: &PersistentVolume, claim_name: &str) -> Option<ResolvedVolume> {
    let spec = pv.spec.as_ref()?;
    let csi = spec.csi.as_ref()?;
    if csi.driver != CSI_DRIVER_NAME {
        return None;
    }
    Some(ResolvedVolume {
        claim_name: claim_name.to_string(),
        pv_name: pv.metadata.name.clone().unwrap_or_default(),
        volume_id: csi.volume_handle.clone(),
        mount_options: spec.mount_options.clone().unwrap_or_default(),
        volume_attributes: csi.volume_attributes.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAttachmentKubeClient;
    use crate::testing::{bound_pvc, s3_pv};
    use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, PersistentVolumeClaimStatus};

    fn client_with(pvc: PersistentVolumeClaim, pv: PersistentVolume) -> MockAttachmentKubeClient {
        let mut mock = MockAttachmentKubeClient::new();
        mock.expect_get_pvc().returning(move |_, _| Ok(pvc.clone()));
        mock.expect_get_pv().returning(move |_| Ok(pv.clone()));
        mock
    }

    #[tokio::test]
    async fn resolves_bound_s3_claim() {
        let mock = client_with(
            bound_pvc("team-a", "data", "pv-1"),
            s3_pv("pv-1", "team-a", "data"),
        );

        let resolution = resolve(&mock, "team-a", "data").await.expect("resolve");
        let VolumeResolution::Resolved(volume) = resolution else {
            panic!("expected resolved volume, got {resolution:?}");
        };
        assert_eq!(volume.pv_name, "pv-1");
        assert_eq!(volume.claim_name, "data");
        assert_eq!(volume.volume_id, "bucket-pv-1");
        assert_eq!(volume.authentication_source(), AUTHENTICATION_SOURCE_DRIVER);
    }

    #[tokio::test]
    async fn pending_claim_is_not_bound() {
        let mut pvc = bound_pvc("team-a", "data", "pv-1");
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        let mut mock = MockAttachmentKubeClient::new();
        mock.expect_get_pvc().returning(move |_, _| Ok(pvc.clone()));
        mock.expect_get_pv().never();

        let resolution = resolve(&mock, "team-a", "data").await.expect("resolve");
        assert_eq!(resolution, VolumeResolution::ClaimNotBound);
    }

    #[tokio::test]
    async fn claim_without_volume_name_is_not_bound() {
        let mut pvc = bound_pvc("team-a", "data", "pv-1");
        if let Some(spec) = pvc.spec.as_mut() {
            spec.volume_name = Some(String::new());
        }
        let mut mock = MockAttachmentKubeClient::new();
        mock.expect_get_pvc().returning(move |_, _| Ok(pvc.clone()));

        let resolution = resolve(&mock, "team-a", "data").await.expect("resolve");
        assert_eq!(resolution, VolumeResolution::ClaimNotBound);
    }

    #[tokio::test]
    async fn other_driver_is_skipped() {
        let mut pv = s3_pv("pv-1", "team-a", "data");
        if let Some(spec) = pv.spec.as_mut() {
            spec.csi = Some(CSIPersistentVolumeSource {
                driver: "ebs.csi.aws.com".to_string(),
                volume_handle: "vol-1".to_string(),
                ..Default::default()
            });
        }
        let mock = client_with(bound_pvc("team-a", "data", "pv-1"), pv);

        let resolution = resolve(&mock, "team-a", "data").await.expect("resolve");
        assert_eq!(resolution, VolumeResolution::ForeignDriver);
    }

    #[tokio::test]
    async fn non_csi_volume_is_skipped() {
        let mut pv = s3_pv("pv-1", "team-a", "data");
        if let Some(spec) = pv.spec.as_mut() {
            spec.csi = None;
        }
        let mock = client_with(bound_pvc("team-a", "data", "pv-1"), pv);

        let resolution = resolve(&mock, "team-a", "data").await.expect("resolve");
        assert_eq!(resolution, VolumeResolution::ForeignDriver);
    }

    /// Story: a volume re-bound to another claim must never be mounted
    ///
    /// Mounting it would hand one tenant's bucket to another, so resolution
    /// stops with an error rather than silently proceeding.
    #[tokio::test]
    async fn story_claim_ref_mismatch_is_an_error() {
        let mock = client_with(
            bound_pvc("team-a", "data", "pv-1"),
            s3_pv("pv-1", "team-b", "data"),
        );

        let err = resolve(&mock, "team-a", "data").await.unwrap_err();
        assert!(matches!(err, Error::VolumeBinding { .. }));
        assert!(err.to_string().contains("team-b/data"));
    }

    #[tokio::test]
    async fn missing_claim_ref_is_an_error() {
        let mut pv = s3_pv("pv-1", "team-a", "data");
        if let Some(spec) = pv.spec.as_mut() {
            spec.claim_ref = None;
        }
        let mock = client_with(bound_pvc("team-a", "data", "pv-1"), pv);

        let err = resolve(&mock, "team-a", "data").await.unwrap_err();
        assert!(err.to_string().contains("no claimRef"));
    }

    #[test]
    fn empty_authentication_source_defaults_to_driver() {
        let mut volume = ResolvedVolume::default();
        volume
            .volume_attributes
            .insert(ATTRIBUTE_AUTHENTICATION_SOURCE.to_string(), String::new());
        assert_eq!(volume.authentication_source(), AUTHENTICATION_SOURCE_DRIVER);
        assert!(!volume.uses_pod_credentials());

        volume.volume_attributes.insert(
            ATTRIBUTE_AUTHENTICATION_SOURCE.to_string(),
            AUTHENTICATION_SOURCE_POD.to_string(),
        );
        assert!(volume.uses_pod_credentials());
    }
}
