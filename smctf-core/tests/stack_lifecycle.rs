//! Integration tests for the stack lifecycle.
//!
//! Exercise the full service path (validate → reserve → provision → persist,
//! refresh, delete, reconcile) against the in-memory repository and the mock
//! orchestrator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use smctf_core::{
    CapacityLimits, CreateInput, InMemoryRepository, JobStatus, MockOrchestrator,
    OrchestratorClient, ProvisionRequest, ProvisionResult, Repository, StackError, StackService,
    StackSettings, StackStatus,
};

const POD_5000: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: p
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 5000
      resources:
        limits:
          cpu: "500m"
          memory: "256Mi"
"#;

fn settings(node_port_min: u16, node_port_max: u16) -> StackSettings {
    StackSettings {
        namespace: "stacks".to_string(),
        stack_ttl: Duration::from_secs(3600),
        scheduler_interval: Duration::from_secs(1),
        node_port_min,
        node_port_max,
        port_lock_ttl: Duration::from_secs(30),
        scheduling_timeout: Duration::from_secs(20),
        require_ingress_network_policy: false,
        node_role: "stack".to_string(),
        max_reserved_cpu_milli: None,
        max_reserved_memory_bytes: None,
        table_name: "smctf-stacks".to_string(),
        aws_region: "us-east-1".to_string(),
        aws_endpoint: None,
        consistent_read: true,
        use_mock_repository: true,
        kubeconfig_path: None,
        kube_context: None,
        client_qps: 20.0,
        client_burst: 40,
        use_mock_orchestrator: true,
    }
}

fn fixture(
    node_port_min: u16,
    node_port_max: u16,
) -> (Arc<InMemoryRepository>, Arc<MockOrchestrator>, Arc<StackService>) {
    let repo = Arc::new(InMemoryRepository::with_seed(
        1,
        Duration::from_secs(30),
        CapacityLimits::default(),
    ));
    let orchestrator = Arc::new(MockOrchestrator::with_seed(1));
    let service = Arc::new(StackService::new(
        settings(node_port_min, node_port_max),
        repo.clone(),
        orchestrator.clone(),
    ));

    (repo, orchestrator, service)
}

fn input(pod_spec: &str, target_port: u32) -> CreateInput {
    CreateInput { pod_spec_yaml: pod_spec.to_string(), target_port }
}

#[tokio::test]
async fn test_create_and_delete_round_trip() {
    let (repo, _orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();
    assert!((30000..=30010).contains(&stack.node_port));
    assert_eq!(stack.target_port, 5000);
    assert_eq!(stack.status, StackStatus::Running);
    assert_eq!(stack.service_name, format!("svc-{}", stack.stack_id));
    assert_eq!(stack.pod_id, stack.stack_id);

    let status = service.get_status(&stack.stack_id).await.unwrap();
    assert_eq!(status, StackStatus::Running);

    let details = service.get_details(&stack.stack_id).await.unwrap();
    assert_eq!(details.stack_id, stack.stack_id);

    service.delete(&stack.stack_id).await.unwrap();
    assert!(matches!(
        service.get_details(&stack.stack_id).await,
        Err(StackError::NotFound)
    ));
    assert!(matches!(
        service.delete(&stack.stack_id).await,
        Err(StackError::NotFound)
    ));

    assert_eq!(repo.used_node_port_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_host_network_rejected_without_port_reservation() {
    let (repo, _orchestrator, service) = fixture(30000, 30010);

    let bad = r#"
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
        - containerPort: 5000
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;

    assert!(matches!(
        service.create(input(bad, 5000)).await,
        Err(StackError::PodSpecInvalid { .. })
    ));
    assert_eq!(repo.used_node_port_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_resource_normalization_flows_into_stack() {
    let (_repo, _orchestrator, service) = fixture(30000, 30010);

    let pod = r#"
apiVersion: v1
kind: Pod
metadata:
  name: p
spec:
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 5000
      resources:
        requests:
          cpu: "100m"
          memory: "64Mi"
        limits:
          cpu: "200m"
          memory: "128Mi"
"#;

    let stack = service.create(input(pod, 5000)).await.unwrap();
    assert_eq!(stack.requested_milli, 200);
    assert_eq!(stack.requested_bytes, 128 * 1024 * 1024);
    assert!(stack.pod_spec_yaml.contains("allowPrivilegeEscalation: false"));
    assert!(stack.pod_spec_yaml.contains("privileged: false"));
    assert!(stack.pod_spec_yaml.contains("seccompProfile:"));
}

#[tokio::test]
async fn test_init_container_resources_dominate() {
    let (_repo, _orchestrator, service) = fixture(30000, 30010);

    let pod = r#"
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
        limits:
          cpu: "1500m"
          memory: "256Mi"
  containers:
    - name: app
      image: nginx:latest
      ports:
        - containerPort: 5000
      resources:
        limits:
          cpu: "100m"
          memory: "64Mi"
"#;

    let stack = service.create(input(pod, 5000)).await.unwrap();
    assert_eq!(stack.requested_milli, 1500);
    assert_eq!(stack.requested_bytes, 256 * 1024 * 1024);
}

#[tokio::test]
async fn test_cleanup_removes_only_unregistered_pods() {
    let (_repo, orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();

    orchestrator.inject_pod("stacks", "orphan-pod", "svc-orphan-pod");
    orchestrator.inject_pod("other", "other-ns-pod", "svc-other-ns-pod");

    let report = service.cleanup_expired_and_orphaned().await;
    assert_eq!(report.orphan_pod_targets, 1);

    let pods = orchestrator.list_pods("stacks").await.unwrap();
    assert!(pods.contains(&stack.pod_id), "managed pod must survive cleanup");
    assert!(!pods.contains(&"orphan-pod".to_string()), "orphan must be swept");

    let other = orchestrator.list_pods("other").await.unwrap();
    assert_eq!(other, vec!["other-ns-pod".to_string()], "other namespaces are untouched");
}

#[tokio::test]
async fn test_cleanup_deletes_stack_when_service_is_missing() {
    let (_repo, orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();
    orchestrator.remove_service(&stack.service_name);

    let report = service.cleanup_expired_and_orphaned().await;
    assert_eq!(report.missing_resource_targets, 1);

    assert!(matches!(
        service.get_details(&stack.stack_id).await,
        Err(StackError::NotFound)
    ));
}

#[tokio::test]
async fn test_cleanup_deletes_stack_when_pod_is_missing() {
    let (_repo, orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();
    orchestrator.remove_pod(&stack.pod_id);

    service.cleanup_expired_and_orphaned().await;

    assert!(matches!(
        service.get_details(&stack.stack_id).await,
        Err(StackError::NotFound)
    ));
}

#[tokio::test]
async fn test_single_port_range_second_create_fails() {
    let (_repo, _orchestrator, service) = fixture(30000, 30000);

    let first = service.create(input(POD_5000, 5000)).await.unwrap();
    assert_eq!(first.node_port, 30000);

    assert!(matches!(
        service.create(input(POD_5000, 5000)).await,
        Err(StackError::NoAvailableNodePort)
    ));
}

#[tokio::test]
async fn test_expired_ttl_is_swept() {
    let (repo, orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();

    // A reconciler whose clock sits exactly on the expiry instant must treat
    // the stack as expired (<=, not <).
    let expiry = stack.ttl_expires_at;
    let reconciler = StackService::new(settings(30000, 30010), repo.clone(), orchestrator.clone())
        .with_clock(move || expiry);

    let report = reconciler.cleanup_expired_and_orphaned().await;
    assert_eq!(report.expired_targets, 1);
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.failures, 0);

    assert!(repo.get(&stack.stack_id).await.unwrap().is_none());
    assert_eq!(repo.used_node_port_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unexpired_ttl_survives_sweep() {
    let (repo, _orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();

    let report = service.cleanup_expired_and_orphaned().await;
    assert_eq!(report.expired_targets, 0);
    assert!(repo.get(&stack.stack_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_node_loss_tears_stack_down_on_refresh() {
    let (repo, orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();
    orchestrator.set_node_alive(&stack.node_id, false);

    assert!(matches!(
        service.get_details(&stack.stack_id).await,
        Err(StackError::NotFound)
    ));
    assert!(repo.get(&stack.stack_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stats_aggregation() {
    let (_repo, _orchestrator, service) = fixture(30000, 30010);

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();
    let stats = service.stats().await.unwrap();

    assert_eq!(stats.total_stacks, 1);
    assert_eq!(stats.active_stacks, 1);
    assert_eq!(stats.used_node_ports, 1);
    assert_eq!(stats.reserved_cpu_milli, 500);
    assert_eq!(stats.reserved_memory_bytes, 256 * 1024 * 1024);
    assert_eq!(stats.node_distribution.get(&stack.node_id), Some(&1));
}

#[tokio::test]
async fn test_batch_delete_job_counts() {
    let (_repo, _orchestrator, service) = fixture(30000, 30010);

    let a = service.create(input(POD_5000, 5000)).await.unwrap();
    let b = service.create(input(POD_5000, 5000)).await.unwrap();

    let job_id = service
        .start_batch_delete(vec![
            a.stack_id.clone(),
            b.stack_id.clone(),
            "stack-missing".to_string(),
        ])
        .await
        .unwrap();

    let job = loop {
        let job = service.batch_delete_job(&job_id).await.unwrap();
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total, 3);
    assert_eq!(job.deleted, 2);
    assert_eq!(job.not_found, 1);
    assert_eq!(job.failed, 0);
}

/// Orchestrator whose first provision attempt reports the node port already
/// taken inside the cluster.
struct PortConflictOrchestrator {
    attempts: AtomicUsize,
}

#[async_trait]
impl OrchestratorClient for PortConflictOrchestrator {
    async fn create_pod_and_service(
        &self,
        req: &ProvisionRequest,
    ) -> smctf_core::Result<ProvisionResult> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(StackError::Orchestrator(
                "create service: provided port is already allocated".to_string(),
            ));
        }

        Ok(ProvisionResult {
            pod_id: req.stack_id.clone(),
            service_name: format!("svc-{}", req.stack_id),
            node_id: "worker-a".to_string(),
            status: StackStatus::Running,
        })
    }

    async fn delete_pod_and_service(&self, _: &str, _: &str, _: &str) -> smctf_core::Result<()> {
        Ok(())
    }

    async fn get_pod_status(
        &self,
        _: &str,
        _: &str,
    ) -> smctf_core::Result<(StackStatus, String)> {
        Ok((StackStatus::Running, "worker-a".to_string()))
    }

    async fn list_pods(&self, _: &str) -> smctf_core::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_services(&self, _: &str) -> smctf_core::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn node_exists(&self, _: &str) -> smctf_core::Result<bool> {
        Ok(true)
    }

    async fn has_ingress_network_policy(&self, _: &str) -> smctf_core::Result<bool> {
        Ok(true)
    }

    async fn get_node_public_ip(&self, _: &str) -> smctf_core::Result<Option<String>> {
        Ok(None)
    }

    async fn count_schedulable_nodes(&self) -> smctf_core::Result<usize> {
        Ok(1)
    }
}

#[tokio::test]
async fn test_create_retries_on_cluster_port_conflict() {
    let repo = Arc::new(InMemoryRepository::with_seed(
        1,
        Duration::from_secs(30),
        CapacityLimits::default(),
    ));
    let orchestrator = Arc::new(PortConflictOrchestrator { attempts: AtomicUsize::new(0) });
    let service = StackService::new(settings(30000, 30010), repo.clone(), orchestrator.clone());

    let stack = service.create(input(POD_5000, 5000)).await.unwrap();

    assert_eq!(orchestrator.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(repo.used_node_port_count().await.unwrap(), 1);
    assert_eq!(stack.status, StackStatus::Running);
}

#[tokio::test]
async fn test_capacity_limit_maps_to_saturated() {
    let limits = CapacityLimits {
        max_reserved_cpu_milli: Some(600),
        max_reserved_memory_bytes: None,
    };
    let repo = Arc::new(InMemoryRepository::with_seed(1, Duration::from_secs(30), limits));
    let orchestrator = Arc::new(MockOrchestrator::with_seed(1));
    let service = StackService::new(settings(30000, 30010), repo.clone(), orchestrator.clone());

    service.create(input(POD_5000, 5000)).await.unwrap();

    // The second stack would reach the 600m ceiling; the failed create must
    // also return its reserved port.
    assert!(matches!(
        service.create(input(POD_5000, 5000)).await,
        Err(StackError::ClusterSaturated { .. })
    ));
    assert_eq!(repo.used_node_port_count().await.unwrap(), 1);
}
