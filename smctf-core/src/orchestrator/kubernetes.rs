//! Kubernetes implementation of the orchestrator client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::{info, warn};

use crate::config::StackSettings;
use crate::error::{Result, StackError};
use crate::manifest::PodManifest;
use crate::orchestrator::{OrchestratorClient, ProvisionRequest, ProvisionResult, STACK_ID_LABEL};
use crate::types::StackStatus;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kubernetes-backed [`OrchestratorClient`].
pub struct KubernetesClient {
    client: Client,
    scheduling_timeout: Duration,
    node_role: String,
}

impl KubernetesClient {
    /// Build a client from settings: explicit kubeconfig when configured,
    /// otherwise in-cluster config with kubeconfig fallback.
    pub async fn from_settings(cfg: &StackSettings) -> Result<Self> {
        let kube_cfg = match &cfg.kubeconfig_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| StackError::InvalidConfig { reason: format!("load kubeconfig: {e}") })?;
                let options = KubeConfigOptions {
                    context: cfg.kube_context.clone(),
                    ..Default::default()
                };
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| StackError::InvalidConfig { reason: format!("load kubeconfig: {e}") })?
            }
            None => Config::infer()
                .await
                .map_err(|e| StackError::InvalidConfig { reason: format!("infer kube config: {e}") })?,
        };

        let client = Client::try_from(kube_cfg)
            .map_err(|e| StackError::InvalidConfig { reason: format!("new kubernetes client: {e}") })?;

        // kube enforces no client-side rate limit; the values are logged so
        // deployments can cross-check their manifests.
        info!(
            qps = cfg.client_qps,
            burst = cfg.client_burst,
            "kubernetes client initialized"
        );

        Ok(Self {
            client,
            scheduling_timeout: cfg.scheduling_timeout,
            node_role: cfg.node_role.clone(),
        })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());

        if api.get_opt(namespace).await.map_err(orch_err)?.is_some() {
            return Ok(());
        }

        let ns = Namespace {
            metadata: ObjectMeta { name: Some(namespace.to_string()), ..Default::default() },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(err) if is_already_exists(&err) => Ok(()),
            Err(err) => Err(StackError::Orchestrator(format!("create namespace: {err}"))),
        }
    }

    /// Poll until the pod has a node assignment. Unschedulable and
    /// cannot-schedule-in-time both surface as saturation.
    async fn wait_until_schedulable(&self, namespace: &str, pod_name: &str) -> Result<()> {
        let api = self.pods(namespace);

        let wait = async {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;

                let Some(pod) = api.get_opt(pod_name).await.map_err(orch_err)? else {
                    return Err(StackError::NotFound);
                };

                if let Some(status) = &pod.status {
                    for cond in status.conditions.as_deref().unwrap_or_default() {
                        if cond.type_ == "PodScheduled"
                            && cond.status == "False"
                            && cond.reason.as_deref() == Some("Unschedulable")
                        {
                            return Err(StackError::saturated("pod is unschedulable"));
                        }
                    }

                    if status.phase.as_deref() == Some("Failed") {
                        return Err(StackError::Orchestrator(
                            "pod failed before scheduling".to_string(),
                        ));
                    }
                }

                let scheduled = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    .is_some_and(|n| !n.is_empty());
                if scheduled {
                    return Ok(());
                }
            }
        };

        match tokio::time::timeout(self.scheduling_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(StackError::saturated("pod not scheduled within timeout")),
        }
    }
}

#[async_trait]
impl OrchestratorClient for KubernetesClient {
    async fn create_pod_and_service(&self, req: &ProvisionRequest) -> Result<ProvisionResult> {
        self.ensure_namespace(&req.namespace).await?;

        let manifest = PodManifest::from_yaml(&req.pod_spec_yaml)
            .map_err(|e| StackError::Orchestrator(format!("decode pod spec: {e}")))?;

        let pod_name = req.stack_id.clone();
        let service_name = format!("svc-{}", req.stack_id);

        let mut labels: BTreeMap<String, String> =
            manifest.metadata.labels.clone().unwrap_or_default();
        labels.insert("app.kubernetes.io/name".to_string(), "smctf-stack".to_string());
        labels.insert("app.kubernetes.io/instance".to_string(), req.stack_id.clone());
        labels.insert(STACK_ID_LABEL.to_string(), req.stack_id.clone());

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.clone()),
                namespace: Some(req.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: manifest.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: manifest.spec,
            status: None,
        };

        let pods = self.pods(&req.namespace);
        let created = pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|err| StackError::Orchestrator(format!("create pod: {err}")))?;

        // The service speaks whatever protocol the target container port
        // declares; TCP when unspecified.
        let mut protocol = "TCP".to_string();
        if let Some(spec) = &created.spec {
            for container in &spec.containers {
                for port in container.ports.as_deref().unwrap_or_default() {
                    if port.container_port == req.target_port as i32 {
                        if let Some(p) = &port.protocol {
                            if !p.is_empty() {
                                protocol = p.clone();
                            }
                        }
                    }
                }
            }
        }

        let service = Service {
            metadata: ObjectMeta {
                name: Some(service_name.clone()),
                namespace: Some(req.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(BTreeMap::from([(
                    STACK_ID_LABEL.to_string(),
                    req.stack_id.clone(),
                )])),
                ports: Some(vec![ServicePort {
                    name: Some("challenge".to_string()),
                    protocol: Some(protocol),
                    port: req.target_port as i32,
                    target_port: Some(IntOrString::Int(req.target_port as i32)),
                    node_port: Some(req.node_port as i32),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };

        if let Err(err) = self
            .services(&req.namespace)
            .create(&PostParams::default(), &service)
            .await
        {
            if let Err(delete_err) = pods.delete(&pod_name, &delete_params()).await {
                if !is_not_found(&delete_err) {
                    warn!(pod = %pod_name, error = %delete_err, "rollback pod delete failed");
                }
            }

            return Err(StackError::Orchestrator(format!("create service: {err}")));
        }

        if let Err(err) = self.wait_until_schedulable(&req.namespace, &pod_name).await {
            if let Err(cleanup_err) = self
                .delete_pod_and_service(&req.namespace, &pod_name, &service_name)
                .await
            {
                warn!(
                    pod = %pod_name,
                    service = %service_name,
                    error = %cleanup_err,
                    "rollback after scheduling wait failed"
                );
            }

            return Err(err);
        }

        let pod = pods
            .get(&pod_name)
            .await
            .map_err(|err| StackError::Orchestrator(format!("get pod after scheduling: {err}")))?;

        let node_id = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        let status = pod_status(&pod);

        Ok(ProvisionResult { pod_id: pod_name, service_name, node_id, status })
    }

    async fn delete_pod_and_service(
        &self,
        namespace: &str,
        pod_id: &str,
        service_name: &str,
    ) -> Result<()> {
        if !service_name.is_empty() {
            if let Err(err) = self
                .services(namespace)
                .delete(service_name, &DeleteParams::default())
                .await
            {
                if !is_not_found(&err) {
                    return Err(StackError::Orchestrator(format!("delete service: {err}")));
                }
            }
        }

        if let Err(err) = self.pods(namespace).delete(pod_id, &delete_params()).await {
            if !is_not_found(&err) {
                return Err(StackError::Orchestrator(format!("delete pod: {err}")));
            }
        }

        Ok(())
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        pod_id: &str,
    ) -> Result<(StackStatus, String)> {
        let Some(pod) = self
            .pods(namespace)
            .get_opt(pod_id)
            .await
            .map_err(orch_err)?
        else {
            return Err(StackError::NotFound);
        };

        let node_id = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();

        Ok((pod_status(&pod), node_id))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<String>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|err| StackError::Orchestrator(format!("list pods: {err}")))?;

        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<String>> {
        let services = self
            .services(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|err| StackError::Orchestrator(format!("list services: {err}")))?;

        Ok(services
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn node_exists(&self, node_id: &str) -> Result<bool> {
        if node_id.is_empty() {
            return Ok(false);
        }

        Ok(self.nodes().get_opt(node_id).await.map_err(orch_err)?.is_some())
    }

    async fn has_ingress_network_policy(&self, namespace: &str) -> Result<bool> {
        if namespace.is_empty() {
            return Ok(false);
        }

        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let policies = api
            .list(&ListParams::default())
            .await
            .map_err(|err| StackError::Orchestrator(format!("list networkpolicies: {err}")))?;

        for policy in policies.items {
            let Some(spec) = policy.spec else { continue };

            let has_ingress_type = spec
                .policy_types
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|t| t == "Ingress");
            if !has_ingress_type {
                continue;
            }

            if spec.ingress.as_ref().is_some_and(|rules| !rules.is_empty()) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn get_node_public_ip(&self, node_id: &str) -> Result<Option<String>> {
        if node_id.is_empty() {
            return Ok(None);
        }

        let Some(node) = self.nodes().get_opt(node_id).await.map_err(orch_err)? else {
            return Ok(None);
        };

        let addresses = node
            .status
            .and_then(|s| s.addresses)
            .unwrap_or_default();

        Ok(addresses
            .into_iter()
            .find(|addr| addr.type_ == "ExternalIP" && !addr.address.is_empty())
            .map(|addr| addr.address))
    }

    async fn count_schedulable_nodes(&self) -> Result<usize> {
        let selector = format!("node-role.kubernetes.io/{}", self.node_role);
        let nodes = self
            .nodes()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|err| StackError::Orchestrator(format!("list nodes: {err}")))?;

        Ok(nodes
            .items
            .iter()
            .filter(|node| {
                !node
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false)
            })
            .count())
    }
}

fn delete_params() -> DeleteParams {
    DeleteParams::default().grace_period(0)
}

fn pod_status(pod: &Pod) -> StackStatus {
    let Some(status) = &pod.status else {
        return StackStatus::Creating;
    };

    if status.reason.as_deref() == Some("NodeLost") {
        return StackStatus::NodeDeleted;
    }

    match status.phase.as_deref() {
        Some("Running") => StackStatus::Running,
        Some("Failed") => StackStatus::Failed,
        Some("Succeeded") => StackStatus::Stopped,
        Some("Pending") => StackStatus::Creating,
        _ => StackStatus::Creating,
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn orch_err(err: kube::Error) -> StackError {
    StackError::Orchestrator(err.to_string())
}
