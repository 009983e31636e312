//! Stack persistence and node-port reservation.
//!
//! The repository is the only cross-process shared state. All mutations go
//! through conditional writes in the backing store, so multiple control-plane
//! instances can run against the same table without client-side locking.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StackSettings;
use crate::error::Result;
use crate::types::{Stack, StackStatus};

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoRepository;
pub use memory::InMemoryRepository;

/// Aggregate reservation ceilings enforced at create time. Disabled limits
/// are `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityLimits {
    pub max_reserved_cpu_milli: Option<i64>,
    pub max_reserved_memory_bytes: Option<i64>,
}

impl CapacityLimits {
    pub fn from_settings(cfg: &StackSettings) -> Self {
        Self {
            max_reserved_cpu_milli: cfg.max_reserved_cpu_milli,
            max_reserved_memory_bytes: cfg.max_reserved_memory_bytes,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_reserved_cpu_milli.is_some() || self.max_reserved_memory_bytes.is_some()
    }
}

/// Atomic persistence of stack records and node-port reservations.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persist a new stack and claim its reserved port in one transaction.
    /// Fails with `NoAvailableNodePort` when the port was stolen between
    /// reservation and commit, and with `ClusterSaturated` when capacity
    /// limits would be exceeded.
    async fn create(&self, stack: &Stack) -> Result<()>;

    /// Fetch a stack by ID.
    async fn get(&self, stack_id: &str) -> Result<Option<Stack>>;

    /// Delete a stack and release its port. Returns the deleted record, or
    /// `None` when the stack was already gone (idempotent).
    async fn delete(&self, stack_id: &str) -> Result<Option<Stack>>;

    /// All stacks, sorted ascending by creation time.
    async fn list_all(&self) -> Result<Vec<Stack>>;

    /// Reserve a free node port from `[min, max]`. The reservation is a
    /// short-lived lock; it becomes ownership only when `create` commits.
    async fn reserve_node_port(&self, min: u16, max: u16) -> Result<u16>;

    /// Release a reserved-but-unclaimed port. No-op when the port is owned
    /// by a committed stack.
    async fn release_node_port(&self, port: u16) -> Result<()>;

    /// Number of port rows currently present (locks and owned ports).
    async fn used_node_port_count(&self) -> Result<usize>;

    /// Update a stack's status (and node assignment when non-empty).
    async fn update_status(
        &self,
        stack_id: &str,
        status: StackStatus,
        node_id: &str,
    ) -> Result<()>;
}

/// Build the repository selected by configuration.
pub async fn repository_from_config(cfg: &StackSettings) -> Result<Arc<dyn Repository>> {
    let limits = CapacityLimits::from_settings(cfg);

    if cfg.use_mock_repository {
        return Ok(Arc::new(InMemoryRepository::new(cfg.port_lock_ttl, limits)));
    }

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(cfg.aws_region.clone()));
    if let Some(endpoint) = &cfg.aws_endpoint {
        loader = loader.endpoint_url(endpoint.clone());
    }
    let aws_cfg = loader.load().await;

    let client = aws_sdk_dynamodb::Client::new(&aws_cfg);

    Ok(Arc::new(DynamoRepository::new(
        client,
        cfg.table_name.clone(),
        cfg.consistent_read,
        cfg.port_lock_ttl,
        limits,
    )))
}
