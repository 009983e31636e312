//! In-memory repository.
//!
//! Mirrors the store-backed semantics (port locks with stale reclaim,
//! conditional create, idempotent delete) behind a single read/write lock, so
//! the service and reconciler can be exercised hermetically in tests and in
//! local development.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, StackError};
use crate::repository::{CapacityLimits, Repository};
use crate::types::{Stack, StackStatus};

#[derive(Debug, Clone)]
struct PortReservation {
    /// Owning stack, empty while the row is only a lock.
    stack_id: String,
    locked_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    stacks: HashMap<String, Stack>,
    ports: HashMap<u16, PortReservation>,
    reserved_cpu_milli: i64,
    reserved_memory_bytes: i64,
}

/// In-memory implementation of [`Repository`].
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
    rng: Mutex<StdRng>,
    port_lock_ttl: Duration,
    limits: CapacityLimits,
}

impl InMemoryRepository {
    pub fn new(port_lock_ttl: Duration, limits: CapacityLimits) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            rng: Mutex::new(StdRng::from_entropy()),
            port_lock_ttl,
            limits,
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(seed: u64, port_lock_ttl: Duration, limits: CapacityLimits) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            port_lock_ttl,
            limits,
        }
    }

    fn random_offset(&self, total: u32) -> u32 {
        self.rng.lock().unwrap().gen_range(0..total)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create(&self, stack: &Stack) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        if inner.stacks.contains_key(&stack.stack_id) {
            return Err(StackError::Internal("stack id already exists".to_string()));
        }

        match inner.ports.get(&stack.node_port) {
            Some(reservation) if reservation.stack_id.is_empty() => {}
            _ => return Err(StackError::NoAvailableNodePort),
        }

        if let Some(max) = self.limits.max_reserved_cpu_milli {
            if inner.reserved_cpu_milli + stack.requested_milli >= max {
                return Err(StackError::saturated("reserved cpu limit reached"));
            }
        }

        if let Some(max) = self.limits.max_reserved_memory_bytes {
            if inner.reserved_memory_bytes + stack.requested_bytes >= max {
                return Err(StackError::saturated("reserved memory limit reached"));
            }
        }

        inner
            .ports
            .get_mut(&stack.node_port)
            .expect("port reservation checked above")
            .stack_id = stack.stack_id.clone();
        inner.reserved_cpu_milli += stack.requested_milli;
        inner.reserved_memory_bytes += stack.requested_bytes;
        inner.stacks.insert(stack.stack_id.clone(), stack.clone());

        Ok(())
    }

    async fn get(&self, stack_id: &str) -> Result<Option<Stack>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.stacks.get(stack_id).cloned())
    }

    async fn delete(&self, stack_id: &str) -> Result<Option<Stack>> {
        let mut inner = self.inner.write().unwrap();

        let Some(stack) = inner.stacks.remove(stack_id) else {
            return Ok(None);
        };

        inner.ports.remove(&stack.node_port);
        inner.reserved_cpu_milli = (inner.reserved_cpu_milli - stack.requested_milli).max(0);
        inner.reserved_memory_bytes =
            (inner.reserved_memory_bytes - stack.requested_bytes).max(0);

        Ok(Some(stack))
    }

    async fn list_all(&self) -> Result<Vec<Stack>> {
        let inner = self.inner.read().unwrap();
        let mut result: Vec<Stack> = inner.stacks.values().cloned().collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(result)
    }

    async fn reserve_node_port(&self, min: u16, max: u16) -> Result<u16> {
        if min > max {
            return Err(StackError::NoAvailableNodePort);
        }

        let total = (max - min) as u32 + 1;
        let start = self.random_offset(total);
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(self.port_lock_ttl)
                .map_err(|e| StackError::Internal(e.to_string()))?;

        let mut inner = self.inner.write().unwrap();
        for i in 0..total {
            let port = min + ((start + i) % total) as u16;

            match inner.ports.get_mut(&port) {
                None => {
                    inner.ports.insert(
                        port,
                        PortReservation { stack_id: String::new(), locked_at: now },
                    );
                    return Ok(port);
                }
                Some(reservation)
                    if reservation.stack_id.is_empty()
                        && reservation.locked_at < stale_before =>
                {
                    reservation.locked_at = now;
                    return Ok(port);
                }
                Some(_) => {}
            }
        }

        metrics::counter!("smctf_port_reservation_exhausted_total").increment(1);
        Err(StackError::NoAvailableNodePort)
    }

    async fn release_node_port(&self, port: u16) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        if inner
            .ports
            .get(&port)
            .is_some_and(|r| r.stack_id.is_empty())
        {
            inner.ports.remove(&port);
        }

        Ok(())
    }

    async fn used_node_port_count(&self) -> Result<usize> {
        let inner = self.inner.read().unwrap();
        Ok(inner.ports.len())
    }

    async fn update_status(
        &self,
        stack_id: &str,
        status: StackStatus,
        node_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        let Some(stack) = inner.stacks.get_mut(stack_id) else {
            return Err(StackError::NotFound);
        };

        stack.status = status;
        if !node_id.is_empty() {
            stack.node_id = node_id.to_string();
        }
        stack.updated_at = Utc::now();

        Ok(())
    }
}
