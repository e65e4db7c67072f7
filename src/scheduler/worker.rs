// ==========================================
// SPED 账簿导入系统 - 续传工作器
// ==========================================
// 职责: 取出到期续传，对不同任务并发执行一次调用
// 同一任务在队列中至多一条待执行续传，且调用前需认领，故不会并发处理同一任务
// 每轮先回收中断遗留的续传；调用异常时退避后重新投递
// ==========================================

use crate::importer::error::{ImportError, ImportResult};
use crate::importer::pipeline::{ImportPipeline, InvocationOutcome};
use crate::scheduler::backoff::BackoffPolicy;
use crate::scheduler::continuation_queue::{ContinuationTask, SqliteContinuationQueue};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// 空闲等待的上限（避免长时间阻塞在远期续传上）
const MAX_IDLE_WAIT: Duration = Duration::from_secs(60);

pub struct ImportWorker {
    queue: Arc<SqliteContinuationQueue>,
    pipeline: Arc<ImportPipeline>,
    backoff: BackoffPolicy,
    max_concurrent_jobs: usize,
}

impl ImportWorker {
    pub fn new(
        queue: Arc<SqliteContinuationQueue>,
        pipeline: Arc<ImportPipeline>,
        max_concurrent_jobs: usize,
    ) -> Self {
        let config = pipeline.config();
        let backoff = BackoffPolicy::from_millis(config.backoff_base_ms, config.backoff_max_ms);
        Self {
            queue,
            pipeline,
            backoff,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
        }
    }

    /// 执行一轮：回收停滞续传，取出到期续传并并发调用
    ///
    /// # 返回
    /// 本轮执行的续传数
    pub async fn run_once(&self) -> ImportResult<usize> {
        let now = Utc::now();
        let recovered = self
            .queue
            .recover_stalled(now, self.pipeline.config().lease_duration())?;
        if recovered > 0 {
            tracing::warn!(recovered, "已回收中断的续传");
        }

        let tasks = self.queue.dequeue_due(now, self.max_concurrent_jobs)?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let runs = tasks.iter().map(|task| async move {
            let outcome = self.pipeline.run_invocation(&task.job_id).await;
            (task, outcome)
        });

        let count = tasks.len();
        for (task, outcome) in join_all(runs).await {
            match outcome {
                Ok(outcome) => {
                    log_outcome(&task.job_id, &outcome);
                    self.queue.complete(&task.task_id)?;
                }
                Err(ImportError::JobNotFound(_)) => {
                    tracing::warn!(job_id = %task.job_id, task_id = %task.task_id, "任务不存在，续传作废");
                    self.queue.fail(&task.task_id, "任务不存在")?;
                }
                Err(e) => self.requeue_after_error(task, &e)?,
            }
        }
        Ok(count)
    }

    /// 调用异常结束（任务行本身无法更新等）：关闭本条续传并退避后重新投递
    fn requeue_after_error(&self, task: &ContinuationTask, error: &ImportError) -> ImportResult<()> {
        self.queue.fail(&task.task_id, &error.to_string())?;
        let failures = self.queue.failed_attempts(&task.job_id)?;
        let delay = self.backoff.delay_for(failures.saturating_sub(1));
        let not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let retry_task_id = self.queue.enqueue(&task.job_id, not_before)?;
        tracing::error!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            retry_task_id = %retry_task_id,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "续传执行异常，退避后重新投递"
        );
        Ok(())
    }

    /// 循环执行直到队列中没有待执行续传
    ///
    /// # 返回
    /// 累计执行的续传数
    pub async fn run_until_idle(&self) -> ImportResult<usize> {
        let mut total = 0;
        loop {
            let n = self.run_once().await?;
            total += n;
            if n > 0 {
                continue;
            }

            match self.queue.next_due_at()? {
                Some(due) => {
                    let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait.min(MAX_IDLE_WAIT)).await;
                }
                None => break,
            }
        }
        tracing::info!(invocations = total, "续传队列已空闲");
        Ok(total)
    }
}

fn log_outcome(job_id: &str, outcome: &InvocationOutcome) {
    match outcome {
        InvocationOutcome::Skipped(reason) => tracing::debug!(job_id, reason = %reason, "调用跳过"),
        InvocationOutcome::Failed(message) => tracing::warn!(job_id, error = %message, "任务失败"),
        other => tracing::debug!(job_id, outcome = ?other, "调用结束"),
    }
}
