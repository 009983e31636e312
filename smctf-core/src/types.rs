//! Stack domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    /// Pod submitted, not yet scheduled or running.
    Creating,

    /// Pod is running on a node.
    Running,

    /// Pod ran to completion.
    Stopped,

    /// Pod failed.
    Failed,

    /// The node hosting the pod disappeared.
    NodeDeleted,
}

impl StackStatus {
    /// Parse a status from its stored string form. Unknown strings map to
    /// `Creating`, the only state the control plane re-derives on refresh.
    pub fn parse(s: &str) -> Self {
        match s {
            "creating" => StackStatus::Creating,
            "running" => StackStatus::Running,
            "stopped" => StackStatus::Stopped,
            "failed" => StackStatus::Failed,
            "node_deleted" => StackStatus::NodeDeleted,
            _ => StackStatus::Creating,
        }
    }

    /// String representation used in the store and in JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::Creating => "creating",
            StackStatus::Running => "running",
            StackStatus::Stopped => "stopped",
            StackStatus::Failed => "failed",
            StackStatus::NodeDeleted => "node_deleted",
        }
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provisioned stack: one pod plus one NodePort service, owned by a single
/// control-plane record with a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    /// Opaque identifier: `stack-` followed by 16 lowercase hex characters.
    pub stack_id: String,

    /// Cluster-side pod name (equals the stack ID once provisioned).
    pub pod_id: String,

    /// Cluster namespace shared by all stacks.
    pub namespace: String,

    /// Node the pod landed on, assigned after scheduling.
    pub node_id: String,

    /// External IP of the node, resolved lazily from the node record.
    pub node_public_ip: Option<String>,

    /// Sanitized pod manifest, stored verbatim.
    #[serde(rename = "pod_spec")]
    pub pod_spec_yaml: String,

    /// Container-side port selected by the submitter.
    pub target_port: u16,

    /// Externally exposed node port.
    pub node_port: u16,

    /// Cluster-side service name (`svc-` + stack ID).
    pub service_name: String,

    /// Current status.
    pub status: StackStatus,

    /// Instant after which the stack is reclaimable.
    pub ttl_expires_at: DateTime<Utc>,

    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp (UTC).
    pub updated_at: DateTime<Utc>,

    /// Normalized CPU reservation in millicores.
    #[serde(rename = "requested_cpu_milli")]
    pub requested_milli: i64,

    /// Normalized memory reservation in bytes.
    #[serde(rename = "requested_memory_bytes")]
    pub requested_bytes: i64,
}

/// Input to stack creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInput {
    /// User-submitted pod manifest (YAML).
    pub pod_spec_yaml: String,

    /// Container port the service should route to. Validated against
    /// `[1, 65535]` and the ports declared in the manifest.
    pub target_port: u32,
}

/// Compact status view of a stack.
#[derive(Debug, Clone, Serialize)]
pub struct StackStatusSummary {
    pub stack_id: String,
    pub status: StackStatus,
    pub ttl: DateTime<Utc>,
    pub node_port: u16,
    pub target_port: u16,
    pub node_public_ip: Option<String>,
}

/// Aggregate control-plane statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_stacks: usize,
    pub active_stacks: usize,
    pub node_distribution: BTreeMap<String, usize>,
    pub used_node_ports: usize,
    pub reserved_cpu_milli: i64,
    pub reserved_memory_bytes: i64,
}

/// State of a batch delete job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Per-stack failure recorded by a batch delete job.
#[derive(Debug, Clone, Serialize)]
pub struct JobError {
    pub stack_id: String,
    pub error: String,
}

/// An asynchronous batch delete job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDeleteJob {
    pub job_id: String,
    pub status: JobStatus,
    pub total: usize,
    pub deleted: usize,
    pub not_found: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
