//! Shared Kubernetes utilities using kube-rs

use k8s_openapi::api::core::v1::Pod;
use kube::Resource;

/// True when the API server answered 404 Not Found
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the API server rejected a write with 409 Conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// `namespace/name` of any namespaced object, for logging
pub fn namespaced_name<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

/// True when a pod has not finished and is not being deleted
pub fn is_pod_active(pod: &Pod) -> bool {
    let terminal = matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    );
    !terminal && pod.metadata.deletion_timestamp.is_none()
}

/// Phase of a pod, `Unknown` if not yet reported
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}
