//! DynamoDB-backed repository.
//!
//! Single-table layout:
//! - `pk="STACK#<id>", sk="META"` — stack record, mirrored onto `gsi1`
//!   (`gsi1pk="STACKS"`, `gsi1sk=created_at`) for listing.
//! - `pk="PORTS", sk="PORT#<n>"` — port row; `stack_id=""` while it is only
//!   a lock, the owning stack ID once a create transaction commits.
//! - `pk="CAPACITY", sk="META"` — aggregate reservation counters, present
//!   only when capacity limits are configured.
//!
//! Port allocation relies on conditional writes: a randomized probe start
//! spreads concurrent creators across the range, and a lock older than the
//! port-lock TTL may be re-locked by a competing creator (crash recovery).

use std::collections::HashMap;
use std::time::Duration;

use aws_sdk_dynamodb::types::{
    AttributeValue, CancellationReason, Delete, Put, Select, TransactWriteItem, Update,
};
use aws_sdk_dynamodb::Client;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

use crate::error::{Result, StackError};
use crate::repository::{CapacityLimits, Repository};
use crate::types::{Stack, StackStatus};

const ATTR_PK: &str = "pk";
const ATTR_SK: &str = "sk";
const GSI_ALL_NAME: &str = "gsi1";
const GSI_ALL_PK: &str = "gsi1pk";
const GSI_ALL_SK: &str = "gsi1sk";
const ALL_PK_VALUE: &str = "STACKS";
const PORTS_PK: &str = "PORTS";
const CAPACITY_PK: &str = "CAPACITY";
const META_SK: &str = "META";
const COND_CHECK_FAILED: &str = "ConditionalCheckFailed";

/// DynamoDB implementation of [`Repository`].
pub struct DynamoRepository {
    client: Client,
    table: String,
    consistent_read: bool,
    port_lock_ttl: Duration,
    limits: CapacityLimits,
}

impl DynamoRepository {
    pub fn new(
        client: Client,
        table: String,
        consistent_read: bool,
        port_lock_ttl: Duration,
        limits: CapacityLimits,
    ) -> Self {
        Self { client, table, consistent_read, port_lock_ttl, limits }
    }

    fn stack_key(stack_id: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (ATTR_PK.to_string(), attr_s(stack_meta_pk(stack_id))),
            (ATTR_SK.to_string(), attr_s(META_SK)),
        ])
    }

    fn port_key(port: u16) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (ATTR_PK.to_string(), attr_s(PORTS_PK)),
            (ATTR_SK.to_string(), attr_s(port_sk(port))),
        ])
    }

    fn capacity_key() -> HashMap<String, AttributeValue> {
        HashMap::from([
            (ATTR_PK.to_string(), attr_s(CAPACITY_PK)),
            (ATTR_SK.to_string(), attr_s(META_SK)),
        ])
    }

    /// Capacity counter update for the create transaction, with headroom
    /// conditions on whichever limits are configured.
    fn capacity_reserve_item(&self, stack: &Stack) -> Result<Option<TransactWriteItem>> {
        if !self.limits.enabled() {
            return Ok(None);
        }

        let mut conditions: Vec<String> = Vec::new();
        let mut values = HashMap::from([
            (":dcpu".to_string(), attr_n(stack.requested_milli)),
            (":dmem".to_string(), attr_n(stack.requested_bytes)),
            (":now".to_string(), attr_s(now_rfc3339())),
        ]);

        if let Some(max) = self.limits.max_reserved_cpu_milli {
            let headroom = max - stack.requested_milli;
            if headroom <= 0 {
                return Err(StackError::saturated("reserved cpu limit reached"));
            }
            conditions.push(
                "(attribute_not_exists(reserved_cpu_milli) OR reserved_cpu_milli < :cpu_headroom)"
                    .to_string(),
            );
            values.insert(":cpu_headroom".to_string(), attr_n(headroom));
        }

        if let Some(max) = self.limits.max_reserved_memory_bytes {
            let headroom = max - stack.requested_bytes;
            if headroom <= 0 {
                return Err(StackError::saturated("reserved memory limit reached"));
            }
            conditions.push(
                "(attribute_not_exists(reserved_memory_bytes) OR reserved_memory_bytes < :mem_headroom)"
                    .to_string(),
            );
            values.insert(":mem_headroom".to_string(), attr_n(headroom));
        }

        let update = Update::builder()
            .table_name(&self.table)
            .set_key(Some(Self::capacity_key()))
            .update_expression(
                "SET updated_at = :now ADD reserved_cpu_milli :dcpu, reserved_memory_bytes :dmem",
            )
            .condition_expression(conditions.join(" AND "))
            .set_expression_attribute_values(Some(values))
            .build()
            .map_err(build_err)?;

        Ok(Some(TransactWriteItem::builder().update(update).build()))
    }

    /// Capacity counter decrement for the delete transaction.
    fn capacity_release_item(&self, stack: &Stack) -> Result<Option<TransactWriteItem>> {
        if !self.limits.enabled() {
            return Ok(None);
        }

        let update = Update::builder()
            .table_name(&self.table)
            .set_key(Some(Self::capacity_key()))
            .update_expression(
                "SET updated_at = :now ADD reserved_cpu_milli :dcpu, reserved_memory_bytes :dmem",
            )
            .set_expression_attribute_values(Some(HashMap::from([
                (":dcpu".to_string(), attr_n(-stack.requested_milli)),
                (":dmem".to_string(), attr_n(-stack.requested_bytes)),
                (":now".to_string(), attr_s(now_rfc3339())),
            ])))
            .build()
            .map_err(build_err)?;

        Ok(Some(TransactWriteItem::builder().update(update).build()))
    }
}

#[async_trait]
impl Repository for DynamoRepository {
    async fn create(&self, stack: &Stack) -> Result<()> {
        let now = now_rfc3339();

        let mut item = stack_to_item(stack);
        item.insert(ATTR_PK.to_string(), attr_s(stack_meta_pk(&stack.stack_id)));
        item.insert(ATTR_SK.to_string(), attr_s(META_SK));
        item.insert("item_type".to_string(), attr_s("stack_by_id"));

        let put_stack = Put::builder()
            .table_name(&self.table)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(pk) AND attribute_not_exists(sk)")
            .build()
            .map_err(build_err)?;

        let claim_port = Update::builder()
            .table_name(&self.table)
            .set_key(Some(Self::port_key(stack.node_port)))
            .update_expression("SET stack_id = :sid, updated_at = :now")
            .condition_expression(
                "attribute_exists(pk) AND attribute_exists(sk) AND (attribute_not_exists(stack_id) OR stack_id = :empty)",
            )
            .set_expression_attribute_values(Some(HashMap::from([
                (":sid".to_string(), attr_s(&stack.stack_id)),
                (":now".to_string(), attr_s(now)),
                (":empty".to_string(), attr_s("")),
            ])))
            .build()
            .map_err(build_err)?;

        let mut items = vec![
            TransactWriteItem::builder().put(put_stack).build(),
            TransactWriteItem::builder().update(claim_port).build(),
        ];
        if let Some(capacity) = self.capacity_reserve_item(stack)? {
            items.push(capacity);
        }

        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(|err| {
                metrics::counter!("smctf_repository_errors_total", "operation" => "create")
                    .increment(1);
                map_create_tx_error(err.into_service_error())
            })?;

        Ok(())
    }

    async fn get(&self, stack_id: &str) -> Result<Option<Stack>> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(Self::stack_key(stack_id)))
            .consistent_read(self.consistent_read)
            .send()
            .await
            .map_err(|err| StackError::Repository(err.into_service_error().to_string()))?;

        match resp.item() {
            None => Ok(None),
            Some(item) => Ok(Some(stack_from_item(item)?)),
        }
    }

    async fn delete(&self, stack_id: &str) -> Result<Option<Stack>> {
        let Some(stack) = self.get(stack_id).await? else {
            return Ok(None);
        };

        let delete_stack = Delete::builder()
            .table_name(&self.table)
            .set_key(Some(Self::stack_key(&stack.stack_id)))
            .condition_expression("attribute_exists(pk) AND attribute_exists(sk)")
            .build()
            .map_err(build_err)?;

        let delete_port = Delete::builder()
            .table_name(&self.table)
            .set_key(Some(Self::port_key(stack.node_port)))
            .build()
            .map_err(build_err)?;

        let mut items = vec![
            TransactWriteItem::builder().delete(delete_stack).build(),
            TransactWriteItem::builder().delete(delete_port).build(),
        ];
        if let Some(capacity) = self.capacity_release_item(&stack)? {
            items.push(capacity);
        }

        let result = self
            .client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await;

        match result {
            Ok(_) => Ok(Some(stack)),
            Err(err) => {
                let service_err = err.into_service_error();
                // Losing the stack-record condition means another deleter won.
                if cancellation_failed_at(&service_err, 0) {
                    return Ok(None);
                }

                metrics::counter!("smctf_repository_errors_total", "operation" => "delete")
                    .increment(1);
                Err(StackError::Repository(service_err.to_string()))
            }
        }
    }

    async fn list_all(&self) -> Result<Vec<Stack>> {
        let mut out: Vec<Stack> = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let resp = self
                .client
                .query()
                .table_name(&self.table)
                .index_name(GSI_ALL_NAME)
                .key_condition_expression(format!("{GSI_ALL_PK} = :pk"))
                .expression_attribute_values(":pk", attr_s(ALL_PK_VALUE))
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|err| StackError::Repository(err.into_service_error().to_string()))?;

            for item in resp.items() {
                out.push(stack_from_item(item)?);
            }

            match resp.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn reserve_node_port(&self, min: u16, max: u16) -> Result<u16> {
        if min > max {
            return Err(StackError::NoAvailableNodePort);
        }

        let total = (max - min) as u32 + 1;
        let start = rand::thread_rng().gen_range(0..total);

        let now = now_rfc3339();
        let now_unix = Utc::now().timestamp();
        let stale_before = now_unix - self.port_lock_ttl.as_secs() as i64;

        for i in 0..total {
            let port = min + ((start + i) % total) as u16;

            let inserted = self
                .client
                .put_item()
                .table_name(&self.table)
                .item(ATTR_PK, attr_s(PORTS_PK))
                .item(ATTR_SK, attr_s(port_sk(port)))
                .item("item_type", attr_s("port_lock"))
                .item("port", attr_n(port as i64))
                .item("created_at", attr_s(&now))
                .item("locked_at", attr_n(now_unix))
                .item("stack_id", attr_s(""))
                .condition_expression("attribute_not_exists(pk) AND attribute_not_exists(sk)")
                .send()
                .await;

            match inserted {
                Ok(_) => return Ok(port),
                Err(err) => {
                    let service_err = err.into_service_error();
                    if !service_err.is_conditional_check_failed_exception() {
                        return Err(StackError::Repository(service_err.to_string()));
                    }
                }
            }

            // The row exists; take it over only if it is an unclaimed lock
            // older than the lock TTL.
            let reclaimed = self
                .client
                .update_item()
                .table_name(&self.table)
                .set_key(Some(Self::port_key(port)))
                .update_expression("SET created_at = :now, locked_at = :locked_at")
                .condition_expression(
                    "(attribute_not_exists(stack_id) OR stack_id = :empty) AND (attribute_not_exists(locked_at) OR locked_at < :stale_before)",
                )
                .expression_attribute_values(":now", attr_s(&now))
                .expression_attribute_values(":locked_at", attr_n(now_unix))
                .expression_attribute_values(":empty", attr_s(""))
                .expression_attribute_values(":stale_before", attr_n(stale_before))
                .send()
                .await;

            match reclaimed {
                Ok(_) => return Ok(port),
                Err(err) => {
                    let service_err = err.into_service_error();
                    if !service_err.is_conditional_check_failed_exception() {
                        return Err(StackError::Repository(service_err.to_string()));
                    }
                }
            }
        }

        metrics::counter!("smctf_port_reservation_exhausted_total").increment(1);
        Err(StackError::NoAvailableNodePort)
    }

    async fn release_node_port(&self, port: u16) -> Result<()> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table)
            .set_key(Some(Self::port_key(port)))
            .condition_expression("attribute_not_exists(stack_id) OR stack_id = :empty")
            .expression_attribute_values(":empty", attr_s(""))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    // Owned by a committed stack; leave it alone.
                    return Ok(());
                }

                Err(StackError::Repository(service_err.to_string()))
            }
        }
    }

    async fn used_node_port_count(&self) -> Result<usize> {
        let mut total: usize = 0;
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let resp = self
                .client
                .query()
                .table_name(&self.table)
                .key_condition_expression("pk = :pk")
                .expression_attribute_values(":pk", attr_s(PORTS_PK))
                .select(Select::Count)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|err| StackError::Repository(err.into_service_error().to_string()))?;

            total += resp.count() as usize;

            match resp.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(total)
    }

    async fn update_status(
        &self,
        stack_id: &str,
        status: StackStatus,
        node_id: &str,
    ) -> Result<()> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .set_key(Some(Self::stack_key(stack_id)))
            .update_expression("SET #status = :status, node_id = :node, updated_at = :now")
            .condition_expression("attribute_exists(pk) AND attribute_exists(sk)")
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":status", attr_s(status.as_str()))
            .expression_attribute_values(":node", attr_s(node_id))
            .expression_attribute_values(":now", attr_s(now_rfc3339()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    return Err(StackError::NotFound);
                }

                Err(StackError::Repository(service_err.to_string()))
            }
        }
    }
}

fn map_create_tx_error(
    err: aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError,
) -> StackError {
    use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;

    match &err {
        TransactWriteItemsError::TransactionCanceledException(canceled) => {
            map_cancellation_reasons(canceled.cancellation_reasons())
                .unwrap_or_else(|| StackError::Repository(err.to_string()))
        }
        _ => StackError::Repository(err.to_string()),
    }
}

/// Positional mapping of create-transaction failures: item 0 is the stack
/// record (duplicate ID), item 1 the port claim (port stolen in the
/// reserve/create gap), item 2 the capacity counters.
fn map_cancellation_reasons(reasons: &[CancellationReason]) -> Option<StackError> {
    for (idx, reason) in reasons.iter().enumerate() {
        if reason.code() != Some(COND_CHECK_FAILED) {
            continue;
        }

        return Some(match idx {
            0 => StackError::Internal("stack id already exists".to_string()),
            1 => StackError::NoAvailableNodePort,
            _ => StackError::saturated("reserved capacity limit reached"),
        });
    }

    None
}

fn cancellation_failed_at(
    err: &aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError,
    index: usize,
) -> bool {
    use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;

    match err {
        TransactWriteItemsError::TransactionCanceledException(canceled) => canceled
            .cancellation_reasons()
            .get(index)
            .is_some_and(|reason| reason.code() == Some(COND_CHECK_FAILED)),
        _ => false,
    }
}

fn stack_to_item(stack: &Stack) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("stack_id".to_string(), attr_s(&stack.stack_id)),
        (GSI_ALL_PK.to_string(), attr_s(ALL_PK_VALUE)),
        (GSI_ALL_SK.to_string(), attr_s(rfc3339(stack.created_at))),
        ("pod_id".to_string(), attr_s(&stack.pod_id)),
        ("namespace".to_string(), attr_s(&stack.namespace)),
        ("node_id".to_string(), attr_s(&stack.node_id)),
        ("pod_spec".to_string(), attr_s(&stack.pod_spec_yaml)),
        ("target_port".to_string(), attr_n(stack.target_port as i64)),
        ("node_port".to_string(), attr_n(stack.node_port as i64)),
        ("service_name".to_string(), attr_s(&stack.service_name)),
        ("status".to_string(), attr_s(stack.status.as_str())),
        ("ttl_expires_at".to_string(), attr_s(rfc3339(stack.ttl_expires_at))),
        ("created_at".to_string(), attr_s(rfc3339(stack.created_at))),
        ("updated_at".to_string(), attr_s(rfc3339(stack.updated_at))),
        ("requested_cpu_milli".to_string(), attr_n(stack.requested_milli)),
        ("requested_memory_bytes".to_string(), attr_n(stack.requested_bytes)),
    ]);

    if let Some(ip) = &stack.node_public_ip {
        item.insert("node_public_ip".to_string(), attr_s(ip));
    }

    item
}

fn stack_from_item(item: &HashMap<String, AttributeValue>) -> Result<Stack> {
    Ok(Stack {
        stack_id: attr_string(item, "stack_id")?,
        pod_id: attr_string(item, "pod_id").unwrap_or_default(),
        namespace: attr_string(item, "namespace").unwrap_or_default(),
        node_id: attr_string(item, "node_id").unwrap_or_default(),
        node_public_ip: attr_string_opt(item, "node_public_ip"),
        pod_spec_yaml: attr_string(item, "pod_spec").unwrap_or_default(),
        target_port: attr_i64(item, "target_port")? as u16,
        node_port: attr_i64(item, "node_port")? as u16,
        service_name: attr_string(item, "service_name").unwrap_or_default(),
        status: StackStatus::parse(&attr_string(item, "status").unwrap_or_default()),
        ttl_expires_at: attr_time(item, "ttl_expires_at")?,
        created_at: attr_time(item, "created_at")?,
        updated_at: attr_time(item, "updated_at")?,
        requested_milli: attr_i64(item, "requested_cpu_milli").unwrap_or(0),
        requested_bytes: attr_i64(item, "requested_memory_bytes").unwrap_or(0),
    })
}

fn attr_string(item: &HashMap<String, AttributeValue>, key: &str) -> Result<String> {
    match item.get(key) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        Some(_) => Err(StackError::Repository(format!("attribute {key} is not a string"))),
        None => Err(StackError::Repository(format!("missing attribute {key}"))),
    }
}

fn attr_string_opt(item: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    match item.get(key) {
        Some(AttributeValue::S(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn attr_i64(item: &HashMap<String, AttributeValue>, key: &str) -> Result<i64> {
    match item.get(key) {
        Some(AttributeValue::N(n)) => n
            .parse()
            .map_err(|_| StackError::Repository(format!("attribute {key} parse failed"))),
        Some(_) => Err(StackError::Repository(format!("attribute {key} is not a number"))),
        None => Err(StackError::Repository(format!("missing attribute {key}"))),
    }
}

fn attr_time(item: &HashMap<String, AttributeValue>, key: &str) -> Result<DateTime<Utc>> {
    let raw = attr_string(item, key)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StackError::Repository(format!("attribute {key} is not a timestamp")))
}

fn attr_s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn attr_n(value: i64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn build_err(err: impl std::error::Error) -> StackError {
    StackError::Repository(err.to_string())
}

fn stack_meta_pk(stack_id: &str) -> String {
    format!("STACK#{stack_id}")
}

fn port_sk(port: u16) -> String {
    format!("PORT#{port}")
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn now_rfc3339() -> String {
    rfc3339(Utc::now())
}
