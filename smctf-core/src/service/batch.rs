//! Asynchronous batch deletion of stacks.
//!
//! Jobs are process-local operator conveniences: each one runs the normal
//! delete path per stack and accumulates counters the API can poll.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;

use crate::error::{Result, StackError};
use crate::service::StackService;
use crate::types::{BatchDeleteJob, JobError, JobStatus};

impl StackService {
    /// Start a batch delete over the given (already deduplicated) stack IDs
    /// and return the job ID to poll.
    pub async fn start_batch_delete(self: &Arc<Self>, stack_ids: Vec<String>) -> Result<String> {
        if stack_ids.is_empty() {
            return Err(StackError::invalid_input("stack_ids is required"));
        }

        let job_id = new_job_id();
        let now = Utc::now();
        let job = BatchDeleteJob {
            job_id: job_id.clone(),
            status: JobStatus::Queued,
            total: stack_ids.len(),
            deleted: 0,
            not_found: 0,
            failed: 0,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.jobs.write().await.insert(job_id.clone(), job);

        let service = Arc::clone(self);
        let spawned_job_id = job_id.clone();
        tokio::spawn(async move {
            service.run_batch_delete(&spawned_job_id, stack_ids).await;
        });

        Ok(job_id)
    }

    /// Look up a batch delete job.
    pub async fn batch_delete_job(&self, job_id: &str) -> Result<BatchDeleteJob> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or(StackError::NotFound)
    }

    async fn run_batch_delete(&self, job_id: &str, stack_ids: Vec<String>) {
        self.update_job(job_id, |job| job.status = JobStatus::Running).await;

        let mut deleted = 0usize;
        let mut not_found = 0usize;
        let mut failed = 0usize;

        for stack_id in stack_ids {
            match self.delete(&stack_id).await {
                Ok(()) => deleted += 1,
                Err(StackError::NotFound) => not_found += 1,
                Err(err) => {
                    failed += 1;
                    let message = err.to_string();
                    self.update_job(job_id, |job| {
                        job.errors.push(JobError {
                            stack_id: stack_id.clone(),
                            error: message.clone(),
                        });
                    })
                    .await;
                }
            }

            self.update_job(job_id, |job| {
                job.deleted = deleted;
                job.not_found = not_found;
                job.failed = failed;
            })
            .await;
        }

        let terminal = if failed > 0 && deleted == 0 && not_found == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        self.update_job(job_id, |job| job.status = terminal).await;

        info!(job_id = %job_id, deleted, not_found, failed, "batch delete completed");
    }

    async fn update_job(&self, job_id: &str, apply: impl FnOnce(&mut BatchDeleteJob)) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            apply(job);
            job.updated_at = Utc::now();
        }
    }
}

fn new_job_id() -> String {
    let mut buf = [0u8; 8];
    if OsRng.try_fill_bytes(&mut buf).is_err() {
        return format!("job-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    }

    format!("job-{}", hex::encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_shape() {
        let id = new_job_id();
        assert!(id.starts_with("job-"));
        assert_eq!(id.len(), "job-".len() + 16);
    }
}
