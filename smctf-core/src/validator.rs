//! Pod manifest validation, normalization, and hardening.
//!
//! Parses a user-submitted pod manifest, rejects host-access and
//! privilege-escalation constructs, normalizes resource requests so
//! `requests == limits`, and rewrites the manifest with enforced security
//! defaults. The sanitized YAML is what gets stored and submitted to the
//! cluster.

use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements, Volume};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::error::{Result, StackError};
use crate::manifest::{
    hardened_container_security_context, hardened_pod_security_context, quantity, PodManifest,
};

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Re-serialized manifest with hardening applied.
    pub sanitized_yaml: String,

    /// Normalized CPU reservation in millicores.
    pub requested_milli: i64,

    /// Normalized memory reservation in bytes.
    pub requested_bytes: i64,

    /// The validated target port.
    pub target_port: u16,
}

/// Pod spec validator.
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a submitted manifest against the target port and produce the
    /// sanitized form. Feeding the sanitized output back in reproduces it
    /// byte for byte.
    pub fn validate_pod_spec(&self, raw: &str, target_port: u32) -> Result<ValidationResult> {
        if raw.trim().is_empty() {
            return Err(StackError::pod_spec_invalid("pod_spec is required"));
        }

        if target_port < 1 || target_port > u16::MAX as u32 {
            return Err(StackError::invalid_input("target_port is out of range"));
        }
        let target_port = target_port as u16;

        let mut manifest = PodManifest::from_yaml(raw)?;
        if !manifest.is_pod() {
            return Err(StackError::pod_spec_invalid("kind must be Pod"));
        }

        let mut spec = manifest
            .spec
            .take()
            .ok_or_else(|| StackError::pod_spec_invalid("pod spec is required"))?;

        reject_host_access(&spec)?;
        reject_identity_overrides(&spec)?;

        if let Some(volumes) = &spec.volumes {
            reject_host_volumes(volumes)?;
        }

        if spec.containers.is_empty() {
            return Err(StackError::pod_spec_invalid("at least one container is required"));
        }

        let mut init_max_milli: i64 = 0;
        let mut init_max_bytes: i64 = 0;

        if let Some(init_containers) = spec.init_containers.as_mut() {
            for container in init_containers.iter_mut() {
                validate_container_basics(container)?;

                if container.ports.as_ref().is_some_and(|p| !p.is_empty()) {
                    return Err(StackError::pod_spec_invalid(
                        "initContainer ports are forbidden",
                    ));
                }

                let (cpu_milli, mem_bytes) = normalize_resources(container)?;
                init_max_milli = init_max_milli.max(cpu_milli);
                init_max_bytes = init_max_bytes.max(mem_bytes);
            }
        }

        let mut sum_milli: i64 = 0;
        let mut sum_bytes: i64 = 0;
        let mut declared_ports: BTreeSet<u16> = BTreeSet::new();

        for container in spec.containers.iter_mut() {
            validate_container_basics(container)?;

            let (cpu_milli, mem_bytes) = normalize_resources(container)?;
            sum_milli += cpu_milli;
            sum_bytes += mem_bytes;

            for port in container.ports.as_deref().unwrap_or_default() {
                if port.container_port < 1 || port.container_port > u16::MAX as i32 {
                    return Err(StackError::pod_spec_invalid("invalid container port"));
                }

                if port.host_port.unwrap_or(0) != 0
                    || port.host_ip.as_deref().is_some_and(|ip| !ip.is_empty())
                {
                    return Err(StackError::pod_spec_invalid("hostPort/hostIP are forbidden"));
                }

                match port.protocol.as_deref() {
                    None | Some("") | Some("TCP") | Some("UDP") => {}
                    Some(_) => {
                        return Err(StackError::pod_spec_invalid(
                            "protocol must be TCP or UDP",
                        ))
                    }
                }

                declared_ports.insert(port.container_port as u16);
            }
        }

        if declared_ports.is_empty() {
            return Err(StackError::pod_spec_invalid(
                "at least one exposed container port is required",
            ));
        }

        if !declared_ports.contains(&target_port) {
            return Err(StackError::pod_spec_invalid(
                "target_port must exist in container ports",
            ));
        }

        let requested_milli = sum_milli.max(init_max_milli);
        let requested_bytes = sum_bytes.max(init_max_bytes);
        if requested_milli <= 0 || requested_bytes <= 0 {
            return Err(StackError::pod_spec_invalid("resources are required"));
        }

        harden(&mut spec);

        manifest.api_version = Some("v1".to_string());
        manifest.kind = Some("Pod".to_string());
        manifest.spec = Some(spec);

        Ok(ValidationResult {
            sanitized_yaml: manifest.to_yaml()?,
            requested_milli,
            requested_bytes,
            target_port,
        })
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

fn reject_host_access(spec: &PodSpec) -> Result<()> {
    if spec.host_network.unwrap_or(false)
        || spec.host_pid.unwrap_or(false)
        || spec.host_ipc.unwrap_or(false)
    {
        return Err(StackError::pod_spec_invalid(
            "hostNetwork/hostPID/hostIPC are forbidden",
        ));
    }

    Ok(())
}

fn reject_identity_overrides(spec: &PodSpec) -> Result<()> {
    // A security context is only acceptable when it is exactly the one this
    // validator emits, which keeps sanitized output re-validatable.
    if let Some(sc) = &spec.security_context {
        if *sc != hardened_pod_security_context() {
            return Err(StackError::pod_spec_invalid(
                "pod securityContext is forbidden in input",
            ));
        }
    }

    let has_service_account = spec
        .service_account_name
        .as_deref()
        .is_some_and(|v| !v.is_empty())
        || spec.service_account.as_deref().is_some_and(|v| !v.is_empty());
    if has_service_account {
        return Err(StackError::pod_spec_invalid("serviceAccount is forbidden in input"));
    }

    if spec.node_name.as_deref().is_some_and(|v| !v.is_empty())
        || spec.runtime_class_name.is_some()
    {
        return Err(StackError::pod_spec_invalid(
            "nodeName/runtimeClassName are forbidden in input",
        ));
    }

    if spec
        .ephemeral_containers
        .as_ref()
        .is_some_and(|v| !v.is_empty())
    {
        return Err(StackError::pod_spec_invalid("ephemeralContainers are forbidden"));
    }

    Ok(())
}

fn reject_host_volumes(volumes: &[Volume]) -> Result<()> {
    for volume in volumes {
        if volume.host_path.is_some() {
            return Err(StackError::pod_spec_invalid("hostPath volume is forbidden"));
        }

        if let Some(projected) = &volume.projected {
            for source in projected.sources.as_deref().unwrap_or_default() {
                if source.service_account_token.is_some() {
                    return Err(StackError::pod_spec_invalid(
                        "projected serviceAccountToken is forbidden",
                    ));
                }
            }
        }
    }

    Ok(())
}

fn validate_container_basics(container: &Container) -> Result<()> {
    if container.name.trim().is_empty() {
        return Err(StackError::pod_spec_invalid("container name is required"));
    }

    if container.image.as_deref().map(str::trim).unwrap_or("").is_empty() {
        return Err(StackError::pod_spec_invalid("container image is required"));
    }

    if let Some(sc) = &container.security_context {
        if *sc != hardened_container_security_context() {
            return Err(StackError::pod_spec_invalid(
                "container securityContext is forbidden in input",
            ));
        }
    }

    Ok(())
}

/// Compute the container's effective reservation (max of request and limit
/// per resource) and rewrite its resources so `requests == limits`.
fn normalize_resources(container: &mut Container) -> Result<(i64, i64)> {
    let resources = container.resources.clone().unwrap_or_default();

    let cpu_milli = quantity_milli(&resources, "cpu")?;
    let mem_bytes = quantity_bytes(&resources, "memory")?;
    if cpu_milli <= 0 || mem_bytes <= 0 {
        return Err(StackError::pod_spec_invalid("request/limit must be set"));
    }

    container.resources = Some(equal_resources(cpu_milli, mem_bytes));

    Ok((cpu_milli, mem_bytes))
}

fn quantity_milli(resources: &ResourceRequirements, name: &str) -> Result<i64> {
    let request = lookup(&resources.requests, name)
        .map(|q| quantity::parse_cpu_milli(&q.0))
        .transpose()?
        .unwrap_or(0);
    let limit = lookup(&resources.limits, name)
        .map(|q| quantity::parse_cpu_milli(&q.0))
        .transpose()?
        .unwrap_or(0);

    Ok(request.max(limit))
}

fn quantity_bytes(resources: &ResourceRequirements, name: &str) -> Result<i64> {
    let request = lookup(&resources.requests, name)
        .map(|q| quantity::parse_memory_bytes(&q.0))
        .transpose()?
        .unwrap_or(0);
    let limit = lookup(&resources.limits, name)
        .map(|q| quantity::parse_memory_bytes(&q.0))
        .transpose()?
        .unwrap_or(0);

    Ok(request.max(limit))
}

fn lookup<'a>(
    list: &'a Option<BTreeMap<String, Quantity>>,
    name: &str,
) -> Option<&'a Quantity> {
    list.as_ref().and_then(|m| m.get(name))
}

fn equal_resources(cpu_milli: i64, mem_bytes: i64) -> ResourceRequirements {
    let mut list = BTreeMap::new();
    list.insert("cpu".to_string(), Quantity(quantity::format_cpu_milli(cpu_milli)));
    list.insert(
        "memory".to_string(),
        Quantity(quantity::format_memory_bytes(mem_bytes)),
    );

    ResourceRequirements {
        requests: Some(list.clone()),
        limits: Some(list),
        ..Default::default()
    }
}

fn harden(spec: &mut PodSpec) {
    spec.restart_policy = Some("Never".to_string());
    spec.automount_service_account_token = Some(false);
    spec.enable_service_links = Some(false);
    spec.security_context = Some(hardened_pod_security_context());

    if let Some(init_containers) = spec.init_containers.as_mut() {
        for container in init_containers.iter_mut() {
            container.security_context = Some(hardened_container_security_context());
        }
    }

    for container in spec.containers.iter_mut() {
        container.security_context = Some(hardened_container_security_context());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(yaml: &str, target_port: u32) -> Result<ValidationResult> {
        Validator::new().validate_pod_spec(yaml, target_port)
    }

    const MINIMAL: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: good
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
      resources:
        requests:
          cpu: "100m"
          memory: "64Mi"
        limits:
          cpu: "200m"
          memory: "128Mi"
"#;

    #[test]
    fn test_rejects_empty_spec() {
        assert!(matches!(
            validate("   \n", 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_target_port_out_of_range() {
        assert!(matches!(validate(MINIMAL, 0), Err(StackError::InvalidInput { .. })));
        assert!(matches!(
            validate(MINIMAL, 70_000),
            Err(StackError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_rejects_non_pod_kind() {
        let yaml = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n";
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_host_network() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad
spec:
  hostNetwork: true
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_normalizes_resources_and_hardens() {
        let result = validate(MINIMAL, 8080).unwrap();

        assert_eq!(result.requested_milli, 200);
        assert_eq!(result.requested_bytes, 128 * 1024 * 1024);
        assert_eq!(result.target_port, 8080);

        let yaml = &result.sanitized_yaml;
        assert!(yaml.contains("allowPrivilegeEscalation: false"));
        assert!(yaml.contains("privileged: false"));
        assert!(yaml.contains("seccompProfile:"));
        assert!(yaml.contains("restartPolicy: Never"));
        assert!(yaml.contains("automountServiceAccountToken: false"));
        assert!(!yaml.contains("runAsNonRoot: true"));
    }

    #[test]
    fn test_requests_and_limits_are_equalized() {
        let result = validate(MINIMAL, 8080).unwrap();
        let manifest = PodManifest::from_yaml(&result.sanitized_yaml).unwrap();
        let spec = manifest.spec.unwrap();
        let resources = spec.containers[0].resources.as_ref().unwrap();

        assert_eq!(resources.requests, resources.limits);
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests.get("cpu").unwrap().0, "200m");
        assert_eq!(requests.get("memory").unwrap().0, "128Mi");
    }

    #[test]
    fn test_is_idempotent() {
        let first = validate(MINIMAL, 8080).unwrap();
        let second = validate(&first.sanitized_yaml, 8080).unwrap();

        assert_eq!(first.sanitized_yaml, second.sanitized_yaml);
        assert_eq!(first.requested_milli, second.requested_milli);
        assert_eq!(first.requested_bytes, second.requested_bytes);
    }

    #[test]
    fn test_rejects_foreign_container_security_context() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad-sc
spec:
  containers:
    - name: app
      image: nginx:latest
      securityContext:
        privileged: true
      ports:
        - containerPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_host_path_volume() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad-hostpath
spec:
  volumes:
    - name: host
      hostPath:
        path: /
  containers:
    - name: app
      image: nginx:latest
      volumeMounts:
        - name: host
          mountPath: /host
      ports:
        - containerPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_projected_service_account_token() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad-satoken
spec:
  volumes:
    - name: tok
      projected:
        sources:
          - serviceAccountToken:
              path: token
              expirationSeconds: 3600
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_host_port() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad-hostport
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
          hostPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_service_account() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad-sa
spec:
  serviceAccountName: admin
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_sctp_protocol() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad-proto
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
          protocol: SCTP
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_accepts_udp_protocol() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: udp
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
          protocol: UDP
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(validate(yaml, 8080).is_ok());
    }

    #[test]
    fn test_rejects_init_container_ports() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: bad-init
spec:
  initContainers:
    - name: init
      image: busybox:latest
      ports:
        - containerPort: 9000
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_init_container_resources_dominate() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: init-res
spec:
  initContainers:
    - name: init
      image: busybox:latest
      command: ["sh", "-c", "true"]
      resources:
        requests:
          cpu: "1500m"
          memory: "256Mi"
        limits:
          cpu: "1500m"
          memory: "256Mi"
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        let result = validate(yaml, 8080).unwrap();
        assert_eq!(result.requested_milli, 1500);
        assert_eq!(result.requested_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_missing_resources() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: no-res
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_target_not_in_declared_ports() {
        assert!(matches!(
            validate(MINIMAL, 9090),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }

    #[test]
    fn test_allows_target_subset_of_declared_ports() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: subset
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 8080
        - containerPort: 9090
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(validate(yaml, 8080).is_ok());
        assert!(validate(yaml, 9090).is_ok());
    }

    #[test]
    fn test_rejects_pod_without_ports() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: no-ports
spec:
  containers:
    - name: app
      image: nginx:latest
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;
        assert!(matches!(
            validate(yaml, 8080),
            Err(StackError::PodSpecInvalid { .. })
        ));
    }
}
