// ==========================================
// SPED 账簿导入系统 - 续传调度器
// ==========================================
// 职责: 投递下一次调用；失败按指数退避重试
// 约束: 每次投递失败 retry_count +1，超过上限任务置为 failed(transient)
// ==========================================

use crate::config::PipelineConfig;
use crate::domain::types::FailureKind;
use crate::importer::error::ImportResult;
use crate::repository::import_job_repo::ImportJobRepository;
use crate::scheduler::backoff::BackoffPolicy;
use crate::scheduler::continuation_queue::ContinuationDispatcher;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// 暂时性失败的消息前缀
pub const TRANSIENT_FAILURE_PREFIX: &str = "调度暂时性失败";

/// 调度结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// 已投递（task_id）
    Scheduled(String),
    /// 重试耗尽，任务已失败
    Exhausted,
}

pub struct ContinuationScheduler {
    dispatcher: Arc<dyn ContinuationDispatcher>,
    jobs: Arc<dyn ImportJobRepository>,
    backoff: BackoffPolicy,
    max_dispatch_retries: u32,
}

impl ContinuationScheduler {
    pub fn new(
        dispatcher: Arc<dyn ContinuationDispatcher>,
        jobs: Arc<dyn ImportJobRepository>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            dispatcher,
            jobs,
            backoff: BackoffPolicy::from_millis(config.backoff_base_ms, config.backoff_max_ms),
            max_dispatch_retries: config.max_dispatch_retries,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// 投递续传
    ///
    /// # 参数
    /// - job_id: 任务ID
    /// - delay: 距下次调用的最短间隔
    ///
    /// # 返回
    /// - Scheduled: 投递成功
    /// - Exhausted: 共尝试 max_dispatch_retries + 1 次均失败，任务已置为 failed
    #[tracing::instrument(skip(self))]
    pub async fn schedule(&self, job_id: &str, delay: Duration) -> ImportResult<ScheduleOutcome> {
        let mut last_error = String::new();

        for attempt in 0..=self.max_dispatch_retries {
            let not_before = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            match self.dispatcher.dispatch(job_id, not_before).await {
                Ok(task_id) => {
                    tracing::debug!(task_id = %task_id, attempt, "续传已投递");
                    return Ok(ScheduleOutcome::Scheduled(task_id));
                }
                Err(e) => {
                    last_error = e.to_string();
                    let retry_count = self.jobs.record_dispatch_failure(job_id, &last_error).await?;
                    tracing::warn!(attempt, retry_count, error = %last_error, "续传投递失败");

                    if attempt < self.max_dispatch_retries {
                        tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                    }
                }
            }
        }

        let message = format!(
            "{}: 已重试 {} 次仍无法投递续传 ({})",
            TRANSIENT_FAILURE_PREFIX, self.max_dispatch_retries, last_error
        );
        self.jobs.mark_failed(job_id, FailureKind::Transient, &message).await?;
        tracing::error!(error = %message, "续传重试耗尽，任务失败");
        Ok(ScheduleOutcome::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};
    use crate::domain::import_job::ImportJob;
    use crate::domain::types::JobStatus;
    use crate::repository::import_job_repo::SqliteImportJobRepository;
    use crate::scheduler::continuation_queue::{DispatchError, SqliteContinuationQueue};
    use async_trait::async_trait;
    use chrono::DateTime;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// 前 fail_first 次投递失败
    struct FlakyDispatcher {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContinuationDispatcher for FlakyDispatcher {
        async fn dispatch(&self, _job_id: &str, _not_before: DateTime<Utc>) -> Result<String, DispatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(DispatchError::Unavailable("队列服务无响应".into()))
            } else {
                Ok(format!("task-{n}"))
            }
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            max_dispatch_retries: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            ..PipelineConfig::default()
        }
    }

    async fn seeded_jobs() -> (Arc<SqliteImportJobRepository>, String, Arc<Mutex<Connection>>) {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let repo = Arc::new(SqliteImportJobRepository::new(conn.clone()));
        let job = ImportJob::new_pending("ACME", "efd.txt", "efd.txt", 100);
        repo.insert_job(&job).await.unwrap();
        (repo, job.job_id, conn)
    }

    #[tokio::test]
    async fn test_recovers_within_ceiling() {
        let (repo, job_id, _conn) = seeded_jobs().await;
        let dispatcher = Arc::new(FlakyDispatcher {
            fail_first: 2,
            calls: AtomicU32::new(0),
        });
        let scheduler = ContinuationScheduler::new(dispatcher, repo.clone(), &fast_config());

        let outcome = scheduler.schedule(&job_id, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, ScheduleOutcome::Scheduled("task-2".into()));

        let job = repo.find_by_id(&job_id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_fails_job_after_ceiling() {
        let (repo, job_id, _conn) = seeded_jobs().await;
        let dispatcher = Arc::new(FlakyDispatcher {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let scheduler = ContinuationScheduler::new(dispatcher.clone(), repo.clone(), &fast_config());

        let outcome = scheduler.schedule(&job_id, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, ScheduleOutcome::Exhausted);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 4);

        let job = repo.find_by_id(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_kind, Some(FailureKind::Transient));
        assert_eq!(job.retry_count, 4);
        assert!(job
            .error_message
            .as_deref()
            .unwrap_or_default()
            .starts_with(TRANSIENT_FAILURE_PREFIX));
    }

    #[tokio::test]
    async fn test_durable_queue_as_dispatcher() {
        let (repo, job_id, conn) = seeded_jobs().await;
        let queue = Arc::new(SqliteContinuationQueue::new(conn));
        let scheduler = ContinuationScheduler::new(queue.clone(), repo, &fast_config());

        let first = scheduler.schedule(&job_id, Duration::from_millis(50)).await.unwrap();
        let second = scheduler.schedule(&job_id, Duration::ZERO).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.stats().unwrap().pending_count, 1);
    }
}
