//! Cluster-facing provisioning.
//!
//! The orchestrator client is the narrow seam between the stack service and
//! the container cluster: create/delete/inspect pods, services, nodes, and
//! network policies. A production Kubernetes implementation and a
//! deterministic mock both satisfy the same contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StackSettings;
use crate::error::Result;
use crate::types::StackStatus;

pub mod kubernetes;
pub mod mock;

pub use kubernetes::KubernetesClient;
pub use mock::MockOrchestrator;

/// Label selecting the pod a stack's service routes to.
pub const STACK_ID_LABEL: &str = "smctf.io/stack-id";

/// Everything the orchestrator needs to provision one stack.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub namespace: String,
    pub stack_id: String,
    /// Sanitized manifest produced by the validator.
    pub pod_spec_yaml: String,
    pub target_port: u16,
    pub node_port: u16,
}

/// Outcome of a successful provision.
#[derive(Debug, Clone)]
pub struct ProvisionResult {
    pub pod_id: String,
    pub service_name: String,
    pub node_id: String,
    pub status: StackStatus,
}

/// Create/delete/inspect operations against the cluster.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Create the pod and its NodePort service, then wait until the pod is
    /// scheduled or the scheduling timeout interprets the delay as
    /// saturation. Partial failures are rolled back best-effort.
    async fn create_pod_and_service(&self, req: &ProvisionRequest) -> Result<ProvisionResult>;

    /// Delete a stack's pod and service. Idempotent: "not found" is success.
    /// An empty `service_name` skips the service.
    async fn delete_pod_and_service(
        &self,
        namespace: &str,
        pod_id: &str,
        service_name: &str,
    ) -> Result<()>;

    /// Current status and node assignment of a pod.
    async fn get_pod_status(&self, namespace: &str, pod_id: &str)
        -> Result<(StackStatus, String)>;

    /// Names of all pods in the namespace.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<String>>;

    /// Names of all services in the namespace.
    async fn list_services(&self, namespace: &str) -> Result<Vec<String>>;

    /// Whether the node still exists. An empty ID is never a node.
    async fn node_exists(&self, node_id: &str) -> Result<bool>;

    /// Whether the namespace carries at least one NetworkPolicy with policy
    /// type `Ingress` and a non-empty ingress block.
    async fn has_ingress_network_policy(&self, namespace: &str) -> Result<bool>;

    /// External IP of a node, when the node exists and exposes one.
    async fn get_node_public_ip(&self, node_id: &str) -> Result<Option<String>>;

    /// Number of schedulable nodes carrying the stack node role.
    async fn count_schedulable_nodes(&self) -> Result<usize>;
}

/// Build the orchestrator client selected by configuration.
pub async fn orchestrator_from_config(
    cfg: &StackSettings,
) -> Result<Arc<dyn OrchestratorClient>> {
    if cfg.use_mock_orchestrator {
        return Ok(Arc::new(MockOrchestrator::new()));
    }

    Ok(Arc::new(KubernetesClient::from_settings(cfg).await?))
}
