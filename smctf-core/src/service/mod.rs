//! Stack lifecycle service.
//!
//! Orchestrates validator → repository reservation → cluster provisioning
//! with rollback, and owns the reconciliation sweep the scheduler drives.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{error, info, warn};

use crate::config::StackSettings;
use crate::error::{Result, StackError};
use crate::orchestrator::{OrchestratorClient, ProvisionRequest};
use crate::repository::Repository;
use crate::types::{
    BatchDeleteJob, CreateInput, Stack, StackStatus, StackStatusSummary, Stats,
};
use crate::validator::Validator;

mod batch;

/// Provisioning attempts per create: the initial try plus retries after the
/// cluster reports the node port already taken by another tenant.
const MAX_PROVISION_ATTEMPTS: usize = 3;

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Coordinates the validator, repository, and orchestrator client.
pub struct StackService {
    cfg: StackSettings,
    repo: Arc<dyn Repository>,
    orchestrator: Arc<dyn OrchestratorClient>,
    validator: Validator,
    jobs: tokio::sync::RwLock<HashMap<String, BatchDeleteJob>>,
    clock: Clock,
}

impl StackService {
    pub fn new(
        cfg: StackSettings,
        repo: Arc<dyn Repository>,
        orchestrator: Arc<dyn OrchestratorClient>,
    ) -> Self {
        Self {
            cfg,
            repo,
            orchestrator,
            validator: Validator::new(),
            jobs: tokio::sync::RwLock::new(HashMap::new()),
            clock: Box::new(Utc::now),
        }
    }

    /// Override the clock (tests exercising TTL boundaries).
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Validate, reserve a node port, provision, and persist a new stack.
    /// The reserved port is released on every failure path before the stack
    /// record commits; after commit the port belongs to the stack.
    pub async fn create(&self, input: CreateInput) -> Result<Stack> {
        let valid = self
            .validator
            .validate_pod_spec(&input.pod_spec_yaml, input.target_port)?;

        let stack_id = new_stack_id();
        let mut node_port = self
            .repo
            .reserve_node_port(self.cfg.node_port_min, self.cfg.node_port_max)
            .await?;

        let mut attempt = 0;
        let result = loop {
            attempt += 1;

            let provisioned = self
                .orchestrator
                .create_pod_and_service(&ProvisionRequest {
                    namespace: self.cfg.namespace.clone(),
                    stack_id: stack_id.clone(),
                    pod_spec_yaml: valid.sanitized_yaml.clone(),
                    target_port: valid.target_port,
                    node_port,
                })
                .await;

            match provisioned {
                Ok(result) => break result,
                Err(err) if attempt < MAX_PROVISION_ATTEMPTS && is_node_port_conflict(&err) => {
                    warn!(
                        stack_id = %stack_id,
                        node_port,
                        error = %err,
                        "node port taken in cluster, retrying with a fresh reservation"
                    );
                    self.release_reserved_port(node_port).await;
                    node_port = self
                        .repo
                        .reserve_node_port(self.cfg.node_port_min, self.cfg.node_port_max)
                        .await?;
                }
                Err(err) => {
                    self.release_reserved_port(node_port).await;
                    return Err(map_provision_error(err));
                }
            }
        };

        let now = self.now();
        let mut stack = Stack {
            stack_id: stack_id.clone(),
            pod_id: result.pod_id,
            namespace: self.cfg.namespace.clone(),
            node_id: result.node_id,
            node_public_ip: None,
            pod_spec_yaml: valid.sanitized_yaml,
            target_port: valid.target_port,
            node_port,
            service_name: result.service_name,
            status: result.status,
            ttl_expires_at: now
                + chrono::Duration::from_std(self.cfg.stack_ttl)
                    .map_err(|e| StackError::Internal(e.to_string()))?,
            created_at: now,
            updated_at: now,
            requested_milli: valid.requested_milli,
            requested_bytes: valid.requested_bytes,
        };

        stack.node_public_ip = self.node_public_ip(&stack.node_id).await;

        if let Err(err) = self.repo.create(&stack).await {
            if let Err(orch_err) = self
                .orchestrator
                .delete_pod_and_service(&stack.namespace, &stack.pod_id, &stack.service_name)
                .await
            {
                error!(
                    stack_id = %stack.stack_id,
                    pod_id = %stack.pod_id,
                    service_name = %stack.service_name,
                    error = %orch_err,
                    "rollback delete pod/service failed"
                );
            }

            self.release_reserved_port(node_port).await;
            return Err(err);
        }

        info!(
            stack_id = %stack.stack_id,
            node_id = %stack.node_id,
            node_port = stack.node_port,
            "stack created"
        );

        Ok(stack)
    }

    /// Refresh, then return the full record with its public IP attached.
    pub async fn get_details(&self, stack_id: &str) -> Result<Stack> {
        self.refresh_status(stack_id).await?;

        let mut stack = self
            .repo
            .get(stack_id)
            .await?
            .ok_or(StackError::NotFound)?;

        stack.node_public_ip = self.node_public_ip(&stack.node_id).await;
        Ok(stack)
    }

    /// Current status only.
    pub async fn get_status(&self, stack_id: &str) -> Result<StackStatus> {
        Ok(self.get_status_summary(stack_id).await?.status)
    }

    /// Refresh, then return the compact summary view.
    pub async fn get_status_summary(&self, stack_id: &str) -> Result<StackStatusSummary> {
        self.refresh_status(stack_id).await?;

        let stack = self
            .repo
            .get(stack_id)
            .await?
            .ok_or(StackError::NotFound)?;

        Ok(StackStatusSummary {
            stack_id: stack.stack_id.clone(),
            status: stack.status,
            ttl: stack.ttl_expires_at,
            node_port: stack.node_port,
            target_port: stack.target_port,
            node_public_ip: self.node_public_ip(&stack.node_id).await,
        })
    }

    /// Re-derive the stack's status from the cluster. A vanished node, pod,
    /// or `node_deleted` report tears the stack down and surfaces `NotFound`.
    pub async fn refresh_status(&self, stack_id: &str) -> Result<()> {
        let Some(stack) = self.repo.get(stack_id).await? else {
            return Err(StackError::NotFound);
        };

        if !self.orchestrator.node_exists(&stack.node_id).await? {
            self.teardown(&stack, "missing node").await;
            return Err(StackError::NotFound);
        }

        let (status, node_id) = match self
            .orchestrator
            .get_pod_status(&stack.namespace, &stack.pod_id)
            .await
        {
            Ok(pair) => pair,
            Err(StackError::NotFound) => {
                if let Err(err) = self.repo.delete(&stack.stack_id).await {
                    error!(
                        stack_id = %stack.stack_id,
                        error = %err,
                        "delete stack after missing pod failed"
                    );
                }

                return Err(StackError::NotFound);
            }
            Err(err) => return Err(err),
        };

        if status == StackStatus::NodeDeleted {
            self.teardown(&stack, "node_deleted").await;
            return Err(StackError::NotFound);
        }

        if let Err(err) = self
            .repo
            .update_status(&stack.stack_id, status, &node_id)
            .await
        {
            error!(
                stack_id = %stack.stack_id,
                status = %status,
                node_id = %node_id,
                error = %err,
                "update stack status failed"
            );
        }

        Ok(())
    }

    /// User-initiated deletion: best-effort cluster teardown, then the
    /// record. Residual cluster resources are swept by the reconciler.
    pub async fn delete(&self, stack_id: &str) -> Result<()> {
        let Some(stack) = self.repo.get(stack_id).await? else {
            return Err(StackError::NotFound);
        };

        if let Err(err) = self
            .orchestrator
            .delete_pod_and_service(&stack.namespace, &stack.pod_id, &stack.service_name)
            .await
        {
            error!(
                stack_id = %stack.stack_id,
                pod_id = %stack.pod_id,
                service_name = %stack.service_name,
                error = %err,
                "delete pod/service failed"
            );
        }

        self.repo.delete(stack_id).await?;
        Ok(())
    }

    /// All stacks, each refreshed; stacks that turn out to be gone are
    /// dropped from the result.
    pub async fn list_all(&self) -> Result<Vec<Stack>> {
        let items = self.repo.list_all().await?;

        let mut refreshed = Vec::with_capacity(items.len());
        for item in items {
            match self.refresh_status(&item.stack_id).await {
                Ok(()) => {}
                Err(StackError::NotFound) => continue,
                Err(err) => return Err(err),
            }

            let Some(mut stack) = self.repo.get(&item.stack_id).await? else {
                continue;
            };

            stack.node_public_ip = self.node_public_ip(&stack.node_id).await;
            refreshed.push(stack);
        }

        Ok(refreshed)
    }

    /// Aggregate statistics over the refreshed stack list.
    pub async fn stats(&self) -> Result<Stats> {
        let items = self.list_all().await?;
        let used_node_ports = self.repo.used_node_port_count().await?;

        let mut stats = Stats { used_node_ports, ..Default::default() };
        for stack in items {
            stats.total_stacks += 1;
            if matches!(stack.status, StackStatus::Running | StackStatus::Creating) {
                stats.active_stacks += 1;
            }
            *stats.node_distribution.entry(stack.node_id).or_default() += 1;
            stats.reserved_cpu_milli += stack.requested_milli;
            stats.reserved_memory_bytes += stack.requested_bytes;
        }

        Ok(stats)
    }

    /// One reconciliation tick: TTL sweep, resource-integrity sweep, and
    /// orphan-pod sweep. Individual failures are counted, never raised.
    pub async fn cleanup_expired_and_orphaned(&self) -> CleanupReport {
        let now = self.now();
        let mut report = CleanupReport::default();

        let items = match self.list_all().await {
            Ok(items) => items,
            Err(err) => {
                error!(error = %err, "list stacks for cleanup failed");
                report.failures = 1;
                report.log("list stacks failed");
                return report;
            }
        };
        report.scanned = items.len();

        // Pass 1: TTL expiry.
        for stack in &items {
            if stack.ttl_expires_at > now {
                continue;
            }

            report.expired_targets += 1;
            let mut failed = false;

            if let Err(err) = self
                .orchestrator
                .delete_pod_and_service(&stack.namespace, &stack.pod_id, &stack.service_name)
                .await
            {
                error!(
                    stack_id = %stack.stack_id,
                    pod_id = %stack.pod_id,
                    service_name = %stack.service_name,
                    error = %err,
                    "cleanup delete pod/service failed"
                );
                failed = true;
            }

            if let Err(err) = self.repo.delete(&stack.stack_id).await {
                error!(
                    stack_id = %stack.stack_id,
                    error = %err,
                    "cleanup delete stack from repository failed"
                );
                failed = true;
            }

            if failed {
                report.failures += 1;
            } else {
                report.cleaned += 1;
            }
        }

        // Pass 2: stacks whose pod or service vanished.
        match self.list_all().await {
            Err(err) => {
                report.orphan_scan_errors += 1;
                report.failures += 1;
                error!(error = %err, "list stacks for resource integrity failed");
            }
            Ok(remaining) => {
                let pods = self.orchestrator.list_pods(&self.cfg.namespace).await;
                if let Err(err) = &pods {
                    report.resource_scan_errors += 1;
                    report.failures += 1;
                    error!(
                        namespace = %self.cfg.namespace,
                        error = %err,
                        "list pods for resource integrity failed"
                    );
                }

                let services = self.orchestrator.list_services(&self.cfg.namespace).await;
                if let Err(err) = &services {
                    report.resource_scan_errors += 1;
                    report.failures += 1;
                    error!(
                        namespace = %self.cfg.namespace,
                        error = %err,
                        "list services for resource integrity failed"
                    );
                }

                if let (Ok(pods), Ok(services)) = (pods, services) {
                    let pod_set: std::collections::HashSet<&str> =
                        pods.iter().map(String::as_str).collect();
                    let service_set: std::collections::HashSet<&str> =
                        services.iter().map(String::as_str).collect();

                    for stack in &remaining {
                        let pod_exists = pod_set.contains(stack.pod_id.as_str());
                        let service_exists = service_set.contains(stack.service_name.as_str());
                        if pod_exists && service_exists {
                            continue;
                        }

                        report.missing_resource_targets += 1;
                        let mut failed = false;

                        if let Err(err) = self
                            .orchestrator
                            .delete_pod_and_service(
                                &stack.namespace,
                                &stack.pod_id,
                                &stack.service_name,
                            )
                            .await
                        {
                            error!(
                                stack_id = %stack.stack_id,
                                error = %err,
                                "cleanup delete stale stack resources failed"
                            );
                            failed = true;
                        }

                        if let Err(err) = self.repo.delete(&stack.stack_id).await {
                            error!(
                                stack_id = %stack.stack_id,
                                pod_exists,
                                service_exists,
                                error = %err,
                                "cleanup delete stack with missing pod/service failed"
                            );
                            failed = true;
                        }

                        if failed {
                            report.failures += 1;
                        } else {
                            report.cleaned += 1;
                        }
                    }
                }

                // Pass 3: pods in the namespace no stack record claims.
                match self.list_all().await {
                    Err(err) => {
                        report.orphan_scan_errors += 1;
                        report.failures += 1;
                        error!(error = %err, "list stacks for orphan pod cleanup failed");
                    }
                    Ok(remaining) => {
                        let registered: std::collections::HashSet<&str> = remaining
                            .iter()
                            .map(|s| s.pod_id.as_str())
                            .filter(|id| !id.is_empty())
                            .collect();

                        match self.orchestrator.list_pods(&self.cfg.namespace).await {
                            Err(err) => {
                                report.orphan_scan_errors += 1;
                                report.failures += 1;
                                error!(
                                    namespace = %self.cfg.namespace,
                                    error = %err,
                                    "list pods for orphan cleanup failed"
                                );
                            }
                            Ok(pod_ids) => {
                                for pod_id in pod_ids {
                                    if registered.contains(pod_id.as_str()) {
                                        continue;
                                    }

                                    report.orphan_pod_targets += 1;
                                    if let Err(err) = self
                                        .orchestrator
                                        .delete_pod_and_service(&self.cfg.namespace, &pod_id, "")
                                        .await
                                    {
                                        report.failures += 1;
                                        error!(
                                            namespace = %self.cfg.namespace,
                                            pod_id = %pod_id,
                                            error = %err,
                                            "cleanup delete orphan pod failed"
                                        );
                                        continue;
                                    }

                                    report.cleaned += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        metrics::counter!("smctf_reconcile_cleaned_total").increment(report.cleaned as u64);
        metrics::counter!("smctf_reconcile_failures_total").increment(report.failures as u64);

        if report.targets() == 0 {
            report.log("no cleanup candidates");
        } else {
            report.log("");
        }

        report
    }

    async fn teardown(&self, stack: &Stack, cause: &str) {
        if let Err(err) = self
            .orchestrator
            .delete_pod_and_service(&stack.namespace, &stack.pod_id, &stack.service_name)
            .await
        {
            error!(
                stack_id = %stack.stack_id,
                pod_id = %stack.pod_id,
                service_name = %stack.service_name,
                cause,
                error = %err,
                "delete pod/service during teardown failed"
            );
        }

        if let Err(err) = self.repo.delete(&stack.stack_id).await {
            error!(
                stack_id = %stack.stack_id,
                cause,
                error = %err,
                "delete stack from repository during teardown failed"
            );
        }
    }

    async fn release_reserved_port(&self, node_port: u16) {
        if let Err(err) = self.repo.release_node_port(node_port).await {
            error!(node_port, error = %err, "release reserved node port failed");
        }
    }

    async fn node_public_ip(&self, node_id: &str) -> Option<String> {
        match self.orchestrator.get_node_public_ip(node_id).await {
            Ok(ip) => ip,
            Err(err) => {
                warn!(node_id = %node_id, error = %err, "resolve node public ip failed");
                None
            }
        }
    }
}

/// Counters for one reconciliation tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub expired_targets: usize,
    pub missing_resource_targets: usize,
    pub orphan_pod_targets: usize,
    pub cleaned: usize,
    pub failures: usize,
    pub resource_scan_errors: usize,
    pub orphan_scan_errors: usize,
}

impl CleanupReport {
    pub fn targets(&self) -> usize {
        self.expired_targets + self.missing_resource_targets + self.orphan_pod_targets
    }

    fn log(&self, note: &str) {
        info!(
            scanned = self.scanned,
            targets = self.targets(),
            expired_targets = self.expired_targets,
            missing_resource_targets = self.missing_resource_targets,
            orphan_pod_targets = self.orphan_pod_targets,
            cleaned = self.cleaned,
            failures = self.failures,
            resource_scan_errors = self.resource_scan_errors,
            orphan_scan_errors = self.orphan_scan_errors,
            note,
            "cleanup loop completed"
        );
    }
}

/// Generate a `stack-<16 hex>` identifier from the OS entropy source, with a
/// timestamp fallback if entropy is unavailable.
fn new_stack_id() -> String {
    let mut buf = [0u8; 8];
    if OsRng.try_fill_bytes(&mut buf).is_err() {
        return format!("stack-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    }

    format!("stack-{}", hex::encode(buf))
}

fn is_node_port_conflict(err: &StackError) -> bool {
    err.to_string().to_lowercase().contains("port is already allocated")
}

/// Substring markers identifying quota rejections in orchestrator error text.
const QUOTA_MARKERS: [&str; 3] = ["exceeded quota", "exceeds quota", "resourcequota"];

/// Substring markers identifying LimitRange rejections in orchestrator error
/// text. The `per container`/`limit is` pair must appear together.
const LIMIT_RANGE_MARKERS: [&str; 4] = [
    "limitrange",
    "limit range",
    "must be less than or equal to",
    "must be greater than or equal to",
];

fn is_quota_exceeded_message(msg: &str) -> bool {
    QUOTA_MARKERS.iter().any(|marker| msg.contains(marker))
}

fn is_limit_range_message(msg: &str) -> bool {
    LIMIT_RANGE_MARKERS.iter().any(|marker| msg.contains(marker))
        || (msg.contains("per container") && msg.contains("limit is"))
}

/// Translate a provisioning failure into the user-visible taxonomy:
/// saturation and pod-spec sentinels pass through, quota text becomes
/// saturation, LimitRange text becomes a pod-spec rejection, anything else is
/// wrapped.
fn map_provision_error(err: StackError) -> StackError {
    if matches!(
        err,
        StackError::ClusterSaturated { .. } | StackError::PodSpecInvalid { .. }
    ) {
        return err;
    }

    let msg = err.to_string().to_lowercase();
    if is_quota_exceeded_message(&msg) {
        return StackError::saturated(err.to_string());
    }

    if is_limit_range_message(&msg) {
        return StackError::pod_spec_invalid(err.to_string());
    }

    StackError::Orchestrator(format!("provision failed: {err}"))
}
