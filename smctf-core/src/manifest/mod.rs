//! Typed pod manifest handling.
//!
//! Wraps the `k8s-openapi` core/v1 pod types in a document struct that
//! carries `apiVersion`/`kind` explicitly (k8s-openapi keeps them as trait
//! constants, and the validator needs to check and re-emit them).

use k8s_openapi::api::core::v1::{
    PodSecurityContext, PodSpec, SeccompProfile, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StackError};

pub mod quantity;

/// Seccomp profile type enforced on every stack pod.
pub const SECCOMP_RUNTIME_DEFAULT: &str = "RuntimeDefault";

/// A single pod document as submitted or stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodManifest {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PodSpec>,
}

impl PodManifest {
    /// Decode a manifest from YAML.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|_| StackError::pod_spec_invalid("yaml parse failed"))
    }

    /// Encode the manifest back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|_| StackError::pod_spec_invalid("yaml marshal failed"))
    }

    /// Whether the document declares kind `Pod` (case-insensitive).
    pub fn is_pod(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case("Pod"))
    }
}

/// The pod-level security context every sanitized manifest carries.
pub fn hardened_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        seccomp_profile: Some(SeccompProfile {
            type_: SECCOMP_RUNTIME_DEFAULT.to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

/// The container-level security context every sanitized container carries.
pub fn hardened_container_security_context() -> SecurityContext {
    SecurityContext {
        privileged: Some(false),
        allow_privilege_escalation: Some(false),
        seccomp_profile: Some(SeccompProfile {
            type_: SECCOMP_RUNTIME_DEFAULT.to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_minimal_pod() {
        let manifest = PodManifest::from_yaml(
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec:\n  containers:\n    - name: app\n      image: nginx:latest\n",
        )
        .unwrap();

        assert!(manifest.is_pod());
        let spec = manifest.spec.unwrap();
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].image.as_deref(), Some("nginx:latest"));
    }

    #[test]
    fn test_kind_is_case_insensitive() {
        let manifest = PodManifest::from_yaml("kind: pod\n").unwrap();
        assert!(manifest.is_pod());

        let manifest = PodManifest::from_yaml("kind: Deployment\n").unwrap();
        assert!(!manifest.is_pod());
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        assert!(PodManifest::from_yaml(": not yaml :").is_err());
    }

    #[test]
    fn test_yaml_round_trip_is_stable() {
        let raw = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec:\n  containers:\n    - name: app\n      image: nginx:latest\n";
        let once = PodManifest::from_yaml(raw).unwrap().to_yaml().unwrap();
        let twice = PodManifest::from_yaml(&once).unwrap().to_yaml().unwrap();
        assert_eq!(once, twice);
    }
}
