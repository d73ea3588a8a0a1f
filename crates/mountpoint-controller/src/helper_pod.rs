//! Mountpoint Pod spec builder
//!
//! Builds the pod that runs Mountpoint for one volume on one node. The pod
//! is pinned to the workload's node, tolerates every taint so it lands
//! wherever the workload did, and runs unprivileged. Per-volume tuning
//! (local cache, service account, container resources) comes from the
//! PersistentVolume's CSI volume attributes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, EmptyDirVolumeSource, EphemeralVolumeSource, NodeAffinity,
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeClaimSpec,
    PersistentVolumeClaimTemplate, Pod, PodSecurityContext, PodSpec, ResourceRequirements,
    SeccompProfile, SecurityContext, Toleration, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::warn;

use mountpoint_common::{
    Error, LABEL_MOUNTED_BY_DRIVER_VERSION, LABEL_MOUNTPOINT_VERSION, LABEL_VOLUME_ID,
    LABEL_VOLUME_NAME, LABEL_VOLUME_TYPE, VOLUME_TYPE_LOCAL_EPHEMERAL_CACHE,
};

use crate::mount_options::{MountOptions, OPTION_CACHE};
use crate::variant::ClusterVariant;
use crate::volume::ResolvedVolume;

/// `generateName` prefix of Mountpoint Pods
pub const MOUNTPOINT_POD_GENERATE_NAME: &str = "mp-";

/// Name of the Mountpoint container
pub const MOUNTPOINT_CONTAINER_NAME: &str = "mountpoint";

/// emptyDir shared with the node plugin to hand over mount arguments
pub const COMMUNICATION_DIR_NAME: &str = "comm";

/// Size limit of the communication directory
pub const COMMUNICATION_DIR_SIZE_LIMIT: &str = "10Mi";

/// Volume holding the local cache, when enabled
pub const LOCAL_CACHE_DIR_NAME: &str = "local-cache";

/// Default entrypoint of the Mountpoint image
pub const DEFAULT_CONTAINER_COMMAND: &str = "/bin/aws-s3-csi-mounter";

/// CSI volume attributes read by the builder
pub mod attributes {
    /// Local cache type: `emptyDir` or `ephemeral`
    pub const CACHE: &str = "cache";
    /// Size limit of an emptyDir cache
    pub const CACHE_EMPTY_DIR_SIZE_LIMIT: &str = "cacheEmptyDirSizeLimit";
    /// Medium of an emptyDir cache; only `Memory` is accepted
    pub const CACHE_EMPTY_DIR_MEDIUM: &str = "cacheEmptyDirMedium";
    /// Storage class of an ephemeral cache volume
    pub const CACHE_EPHEMERAL_STORAGE_CLASS_NAME: &str = "cacheEphemeralStorageClassName";
    /// Storage request of an ephemeral cache volume
    pub const CACHE_EPHEMERAL_STORAGE_RESOURCE_REQUEST: &str =
        "cacheEphemeralStorageResourceRequest";
    /// Service account the Mountpoint Pod runs as
    pub const MOUNTPOINT_POD_SERVICE_ACCOUNT_NAME: &str = "mountpointPodServiceAccountName";
    /// CPU request of the Mountpoint container
    pub const RESOURCES_REQUESTS_CPU: &str = "mountpointContainerResourcesRequestsCpu";
    /// Memory request of the Mountpoint container
    pub const RESOURCES_REQUESTS_MEMORY: &str = "mountpointContainerResourcesRequestsMemory";
    /// CPU limit of the Mountpoint container
    pub const RESOURCES_LIMITS_CPU: &str = "mountpointContainerResourcesLimitsCpu";
    /// Memory limit of the Mountpoint container
    pub const RESOURCES_LIMITS_MEMORY: &str = "mountpointContainerResourcesLimitsMemory";
}

const CACHE_TYPE_EMPTY_DIR: &str = "emptyDir";
const CACHE_TYPE_EPHEMERAL: &str = "ephemeral";
const STORAGE_MEDIUM_MEMORY: &str = "Memory";

/// Settings shared by every Mountpoint Pod the controller creates
#[derive(Clone, Debug, PartialEq)]
pub struct HelperPodConfig {
    /// Namespace Mountpoint Pods are created in
    pub namespace: String,
    /// Mountpoint version inside the image, recorded as a label
    pub mountpoint_version: String,
    /// Priority class of Mountpoint Pods
    pub priority_class_name: Option<String>,
    /// Mountpoint image
    pub image: String,
    /// Image pull policy; the cluster default applies when unset
    pub image_pull_policy: Option<String>,
    /// Container entrypoint
    pub command: String,
    /// Version of the running CSI driver
    pub csi_driver_version: String,
    /// Distribution the pods run on
    pub variant: ClusterVariant,
}

impl Default for HelperPodConfig {
    fn default() -> Self {
        Self {
            namespace: mountpoint_common::DEFAULT_MOUNTPOINT_NAMESPACE.to_string(),
            mountpoint_version: String::new(),
            priority_class_name: None,
            image: String::new(),
            image_pull_policy: None,
            command: DEFAULT_CONTAINER_COMMAND.to_string(),
            csi_driver_version: env!("CARGO_PKG_VERSION").to_string(),
            variant: ClusterVariant::Default,
        }
    }
}

/// Builds Mountpoint Pod specs from a [`HelperPodConfig`]
#[derive(Clone, Debug, Default)]
pub struct HelperPodBuilder {
    config: HelperPodConfig,
}

impl HelperPodBuilder {
    /// Create a builder
    pub fn new(config: HelperPodConfig) -> Self {
        Self { config }
    }

    /// The configuration pods are built from
    pub fn config(&self) -> &HelperPodConfig {
        &self.config
    }

    /// Build the Mountpoint Pod serving `volume` on `node`.
    ///
    /// Fails when the volume attributes describe an invalid cache or
    /// unparsable resource quantities.
    pub fn build(&self, node: &str, volume: &ResolvedVolume) -> Result<Pod, Error> {
        let uid = self.config.variant.mountpoint_pod_uid();

        let mut container = Container {
            name: MOUNTPOINT_CONTAINER_NAME.to_string(),
            image: Some(self.config.image.clone()),
            image_pull_policy: self.config.image_pull_policy.clone(),
            command: Some(vec![self.config.command.clone()]),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                run_as_user: uid,
                run_as_non_root: Some(true),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: COMMUNICATION_DIR_NAME.to_string(),
                mount_path: format!("/{COMMUNICATION_DIR_NAME}"),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let mut volumes = vec![Volume {
            name: COMMUNICATION_DIR_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some(STORAGE_MEDIUM_MEMORY.to_string()),
                size_limit: Some(Quantity(COMMUNICATION_DIR_SIZE_LIMIT.to_string())),
            }),
            ..Default::default()
        }];

        if let Some(cache) = local_cache_volume(volume)? {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: LOCAL_CACHE_DIR_NAME.to_string(),
                    mount_path: format!("/{LOCAL_CACHE_DIR_NAME}"),
                    ..Default::default()
                });
            volumes.push(cache);
        }

        container.resources = container_resources(volume)?;

        let service_account_name = volume
            .attribute(attributes::MOUNTPOINT_POD_SERVICE_ACCOUNT_NAME)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok(Pod {
            metadata: ObjectMeta {
                generate_name: Some(MOUNTPOINT_POD_GENERATE_NAME.to_string()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (
                        LABEL_MOUNTPOINT_VERSION.to_string(),
                        self.config.mountpoint_version.clone(),
                    ),
                    (LABEL_VOLUME_NAME.to_string(), volume.pv_name.clone()),
                    (LABEL_VOLUME_ID.to_string(), volume.volume_id.clone()),
                    (
                        LABEL_MOUNTED_BY_DRIVER_VERSION.to_string(),
                        self.config.csi_driver_version.clone(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                // Mountpoint exits 0 on a clean unmount; only restart on failure
                restart_policy: Some("OnFailure".to_string()),
                security_context: Some(PodSecurityContext {
                    fs_group: uid,
                    ..Default::default()
                }),
                containers: vec![container],
                priority_class_name: self.config.priority_class_name.clone(),
                service_account_name,
                affinity: Some(pin_to_node(node)),
                tolerations: Some(vec![Toleration {
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]),
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn pin_to_node(node: &str) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_fields: Some(vec![NodeSelectorRequirement {
                        key: "metadata.name".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn local_cache_volume(volume: &ResolvedVolume) -> Result<Option<Volume>, Error> {
    let via_options = MountOptions::parse(&volume.mount_options).has(OPTION_CACHE);
    let cache_type = volume
        .attribute(attributes::CACHE)
        .filter(|t| !t.is_empty());

    let cache_type = match (via_options, cache_type) {
        (false, None) => return Ok(None),
        (true, Some(_)) => {
            return Err(Error::helper_pod_spec(
                &volume.pv_name,
                "cache configured with both `mountOptions` and `volumeAttributes`, \
                 remove the deprecated `--cache` mount option",
            ))
        }
        (true, None) => {
            warn!(
                volume = %volume.pv_name,
                "configuring cache via mountOptions is deprecated, falling back to emptyDir"
            );
            CACHE_TYPE_EMPTY_DIR
        }
        (false, Some(t)) => t,
    };

    let source = match cache_type {
        CACHE_TYPE_EMPTY_DIR => Volume {
            empty_dir: Some(empty_dir_cache(volume)?),
            ..Default::default()
        },
        CACHE_TYPE_EPHEMERAL => Volume {
            ephemeral: Some(ephemeral_cache(volume)?),
            ..Default::default()
        },
        other => {
            return Err(Error::helper_pod_spec(
                &volume.pv_name,
                format!(
                    "unsupported local-cache type {other:?}, only {CACHE_TYPE_EMPTY_DIR:?} \
                     and {CACHE_TYPE_EPHEMERAL:?} are supported"
                ),
            ))
        }
    };

    Ok(Some(Volume {
        name: LOCAL_CACHE_DIR_NAME.to_string(),
        ..source
    }))
}

fn empty_dir_cache(volume: &ResolvedVolume) -> Result<EmptyDirVolumeSource, Error> {
    let size_limit = non_empty(volume, attributes::CACHE_EMPTY_DIR_SIZE_LIMIT)
        .map(|v| parse_quantity(volume, attributes::CACHE_EMPTY_DIR_SIZE_LIMIT, v))
        .transpose()?;

    let medium = match non_empty(volume, attributes::CACHE_EMPTY_DIR_MEDIUM) {
        None => None,
        Some(STORAGE_MEDIUM_MEMORY) => Some(STORAGE_MEDIUM_MEMORY.to_string()),
        Some(other) => {
            return Err(Error::helper_pod_spec(
                &volume.pv_name,
                format!(
                    "unknown value for {:?}: {other:?}, only {STORAGE_MEDIUM_MEMORY:?} supported",
                    attributes::CACHE_EMPTY_DIR_MEDIUM
                ),
            ))
        }
    };

    Ok(EmptyDirVolumeSource { medium, size_limit })
}

fn ephemeral_cache(volume: &ResolvedVolume) -> Result<EphemeralVolumeSource, Error> {
    let required = |attribute: &str| {
        non_empty(volume, attribute).ok_or_else(|| {
            Error::helper_pod_spec(
                &volume.pv_name,
                format!("{attribute:?} must be provided with {CACHE_TYPE_EPHEMERAL:?} cache type"),
            )
        })
    };
    let storage_class = required(attributes::CACHE_EPHEMERAL_STORAGE_CLASS_NAME)?;
    let request = required(attributes::CACHE_EPHEMERAL_STORAGE_RESOURCE_REQUEST)?;
    let request = parse_quantity(
        volume,
        attributes::CACHE_EPHEMERAL_STORAGE_RESOURCE_REQUEST,
        request,
    )?;

    Ok(EphemeralVolumeSource {
        volume_claim_template: Some(PersistentVolumeClaimTemplate {
            metadata: Some(ObjectMeta {
                labels: Some(BTreeMap::from([(
                    LABEL_VOLUME_TYPE.to_string(),
                    VOLUME_TYPE_LOCAL_EPHEMERAL_CACHE.to_string(),
                )])),
                ..Default::default()
            }),
            spec: PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(storage_class.to_string()),
                volume_mode: Some("Filesystem".to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), request)])),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }),
    })
}

fn container_resources(volume: &ResolvedVolume) -> Result<Option<ResourceRequirements>, Error> {
    let requests = resource_list(
        volume,
        attributes::RESOURCES_REQUESTS_CPU,
        attributes::RESOURCES_REQUESTS_MEMORY,
    )?;
    let limits = resource_list(
        volume,
        attributes::RESOURCES_LIMITS_CPU,
        attributes::RESOURCES_LIMITS_MEMORY,
    )?;
    if requests.is_none() && limits.is_none() {
        return Ok(None);
    }
    Ok(Some(ResourceRequirements {
        requests,
        limits,
        ..Default::default()
    }))
}

fn resource_list(
    volume: &ResolvedVolume,
    cpu_attribute: &str,
    memory_attribute: &str,
) -> Result<Option<BTreeMap<String, Quantity>>, Error> {
    let mut list = BTreeMap::new();
    if let Some(cpu) = non_empty(volume, cpu_attribute) {
        list.insert("cpu".to_string(), parse_quantity(volume, cpu_attribute, cpu)?);
    }
    if let Some(memory) = non_empty(volume, memory_attribute) {
        list.insert(
            "memory".to_string(),
            parse_quantity(volume, memory_attribute, memory)?,
        );
    }
    Ok((!list.is_empty()).then_some(list))
}

fn non_empty<'a>(volume: &'a ResolvedVolume, attribute: &str) -> Option<&'a str> {
    volume.attribute(attribute).filter(|v| !v.is_empty())
}

/// Validate a Kubernetes quantity such as `500m`, `1.5`, `128Mi`, or `10G`
fn parse_quantity(volume: &ResolvedVolume, attribute: &str, value: &str) -> Result<Quantity, Error> {
    const SUFFIXES: &[&str] = &[
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "k", "M", "G", "T", "P", "E",
    ];
    let number = SUFFIXES
        .iter()
        .find_map(|suffix| value.strip_suffix(suffix))
        .unwrap_or(value);

    let is_valid = !number.starts_with(['-', '+'])
        && number.parse::<f64>().is_ok_and(|n| n.is_finite());
    if !is_valid {
        return Err(Error::helper_pod_spec(
            &volume.pv_name,
            format!("failed to parse quantity {value:?} for {attribute:?}"),
        ));
    }
    Ok(Quantity(value.to_string()))
}
