//! Mock orchestrator for tests and local development.
//!
//! Simulates a three-node cluster: pods land on a randomly picked healthy
//! node and report `running` immediately. Handles are exposed to inject
//! orphan pods, drop services, and kill nodes so the reconciler and refresh
//! paths can be exercised without a cluster.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, StackError};
use crate::orchestrator::{OrchestratorClient, ProvisionRequest, ProvisionResult};
use crate::types::StackStatus;

#[derive(Debug, Clone)]
struct PodState {
    namespace: String,
    pod_id: String,
    service: String,
    node_id: String,
    status: StackStatus,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, bool>,
    node_ips: HashMap<String, Option<String>>,
    pods: HashMap<String, PodState>,
    services: HashMap<String, String>,
}

/// In-memory implementation of [`OrchestratorClient`].
pub struct MockOrchestrator {
    inner: RwLock<Inner>,
    rng: Mutex<StdRng>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(seed: u64) -> Self {
        let inner = Inner {
            nodes: HashMap::from([
                ("worker-a".to_string(), true),
                ("worker-b".to_string(), true),
                ("worker-c".to_string(), true),
            ]),
            node_ips: HashMap::from([
                ("worker-a".to_string(), Some("203.0.113.10".to_string())),
                ("worker-b".to_string(), None),
                ("worker-c".to_string(), Some("203.0.113.12".to_string())),
            ]),
            pods: HashMap::new(),
            services: HashMap::new(),
        };

        Self { inner: RwLock::new(inner), rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    /// Place a pod directly into the simulated cluster, bypassing the
    /// provisioning path (used to stage orphans).
    pub fn inject_pod(&self, namespace: &str, pod_id: &str, service_name: &str) {
        let mut inner = self.inner.write().unwrap();

        inner.pods.insert(
            pod_id.to_string(),
            PodState {
                namespace: namespace.to_string(),
                pod_id: pod_id.to_string(),
                service: service_name.to_string(),
                node_id: "worker-a".to_string(),
                status: StackStatus::Running,
                created_at: Utc::now(),
            },
        );

        if !service_name.is_empty() {
            inner
                .services
                .insert(service_name.to_string(), namespace.to_string());
        }
    }

    /// Drop a service out from under its stack.
    pub fn remove_service(&self, service_name: &str) {
        self.inner.write().unwrap().services.remove(service_name);
    }

    /// Drop a pod out from under its stack.
    pub fn remove_pod(&self, pod_id: &str) {
        self.inner.write().unwrap().pods.remove(pod_id);
    }

    /// Mark a node alive or dead.
    pub fn set_node_alive(&self, node_id: &str, alive: bool) {
        self.inner
            .write()
            .unwrap()
            .nodes
            .insert(node_id.to_string(), alive);
    }

    fn pick_node(&self, inner: &Inner) -> Result<String> {
        let healthy: Vec<&String> = inner
            .nodes
            .iter()
            .filter(|(_, alive)| **alive)
            .map(|(id, _)| id)
            .collect();

        if healthy.is_empty() {
            return Err(StackError::Orchestrator("no schedulable nodes".to_string()));
        }

        let idx = self.rng.lock().unwrap().gen_range(0..healthy.len());
        Ok(healthy[idx].clone())
    }
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrchestratorClient for MockOrchestrator {
    async fn create_pod_and_service(&self, req: &ProvisionRequest) -> Result<ProvisionResult> {
        let mut inner = self.inner.write().unwrap();

        let node_id = self.pick_node(&inner)?;
        let pod_id = req.stack_id.clone();
        let service_name = format!("svc-{}", req.stack_id);

        inner.pods.insert(
            pod_id.clone(),
            PodState {
                namespace: req.namespace.clone(),
                pod_id: pod_id.clone(),
                service: service_name.clone(),
                node_id: node_id.clone(),
                status: StackStatus::Running,
                created_at: Utc::now(),
            },
        );
        inner
            .services
            .insert(service_name.clone(), req.namespace.clone());

        Ok(ProvisionResult { pod_id, service_name, node_id, status: StackStatus::Running })
    }

    async fn delete_pod_and_service(
        &self,
        namespace: &str,
        pod_id: &str,
        service_name: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        if !service_name.is_empty() {
            if let Some(svc_ns) = inner.services.get(service_name) {
                if svc_ns != namespace {
                    return Err(StackError::Orchestrator(
                        "service namespace mismatch".to_string(),
                    ));
                }

                inner.services.remove(service_name);
            }
        }

        if let Some(pod) = inner.pods.get(pod_id).cloned() {
            if pod.namespace != namespace {
                return Err(StackError::Orchestrator("pod namespace mismatch".to_string()));
            }

            inner.pods.remove(pod_id);

            if !pod.service.is_empty() {
                if inner
                    .services
                    .get(&pod.service)
                    .is_some_and(|ns| ns == namespace)
                {
                    inner.services.remove(&pod.service);
                }
            }
        }

        Ok(())
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        pod_id: &str,
    ) -> Result<(StackStatus, String)> {
        let inner = self.inner.read().unwrap();

        let Some(pod) = inner.pods.get(pod_id) else {
            return Err(StackError::NotFound);
        };
        if pod.namespace != namespace {
            return Err(StackError::NotFound);
        }

        if !inner.nodes.get(&pod.node_id).copied().unwrap_or(false) {
            return Ok((StackStatus::NodeDeleted, pod.node_id.clone()));
        }

        Ok((pod.status, pod.node_id.clone()))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();

        Ok(inner
            .pods
            .values()
            .filter(|p| p.namespace == namespace)
            .map(|p| p.pod_id.clone())
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();

        Ok(inner
            .services
            .iter()
            .filter(|(_, ns)| ns.as_str() == namespace)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn node_exists(&self, node_id: &str) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.nodes.get(node_id).copied().unwrap_or(false))
    }

    async fn has_ingress_network_policy(&self, _namespace: &str) -> Result<bool> {
        Ok(true)
    }

    async fn get_node_public_ip(&self, node_id: &str) -> Result<Option<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.node_ips.get(node_id).cloned().flatten())
    }

    async fn count_schedulable_nodes(&self) -> Result<usize> {
        let inner = self.inner.read().unwrap();
        Ok(inner.nodes.values().filter(|alive| **alive).count())
    }
}
