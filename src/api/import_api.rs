// ==========================================
// SPED 账簿导入系统 - 导入任务API
// ==========================================
// 职责: 受理导入 / 状态轮询 / 任务列表 / 取消
// 受理只创建任务并投递首次调用，解析全部在续传中完成
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::PipelineConfig;
use crate::domain::import_job::{CategoryCounts, ImportJob};
use crate::domain::types::{FailureKind, ImportScope, JobStatus};
use crate::importer::blob_store::BlobStore;
use crate::repository::import_job_repo::ImportJobRepository;
use crate::scheduler::continuation_queue::{QueueStats, SqliteContinuationQueue};
use crate::scheduler::continuation_scheduler::{ContinuationScheduler, ScheduleOutcome};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 默认列表条数
const DEFAULT_LIST_LIMIT: usize = 50;

/// 受理请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRequest {
    pub company_id: String,
    /// 存储中的文件路径
    pub file_path: String,
    pub file_name: String,
    /// 未提供时从存储读取
    pub file_size: Option<u64>,
    /// 预览导入的行数上限
    pub line_limit: Option<u64>,
    #[serde(default)]
    pub scope: ImportScope,
}

/// 任务状态视图（供前端轮询）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusView {
    pub job_id: String,
    pub company_id: String,
    pub branch_id: Option<String>,
    pub file_name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub processed_lines: u64,
    pub total_lines: Option<u64>,
    pub counts: CategoryCounts,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ImportJob> for JobStatusView {
    fn from(job: ImportJob) -> Self {
        Self {
            job_id: job.job_id,
            company_id: job.company_id,
            branch_id: job.branch_id,
            file_name: job.file_name,
            status: job.status,
            progress: job.progress,
            processed_lines: job.processed_lines,
            total_lines: job.total_lines,
            counts: job.counts,
            period_start: job.period_start,
            period_end: job.period_end,
            status_message: job.status_message,
            error_message: job.error_message,
            failure_kind: job.failure_kind,
            retry_count: job.retry_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

pub struct ImportApi {
    jobs: Arc<dyn ImportJobRepository>,
    store: Arc<dyn BlobStore>,
    scheduler: Arc<ContinuationScheduler>,
    queue: Arc<SqliteContinuationQueue>,
    config: PipelineConfig,
}

impl ImportApi {
    pub fn new(
        jobs: Arc<dyn ImportJobRepository>,
        store: Arc<dyn BlobStore>,
        scheduler: Arc<ContinuationScheduler>,
        queue: Arc<SqliteContinuationQueue>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            jobs,
            store,
            scheduler,
            queue,
            config,
        }
    }

    /// 受理导入
    ///
    /// # 参数
    /// - request: 受理请求
    ///
    /// # 返回
    /// - Ok(job_id): 任务已创建并投递首次调用
    /// - Err(ApiError::InvalidInput): 参数不合法或文件不存在
    pub async fn start_import(&self, request: IntakeRequest) -> ApiResult<String> {
        if request.company_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("company_id 不能为空".to_string()));
        }
        if request.file_path.trim().is_empty() {
            return Err(ApiError::InvalidInput("file_path 不能为空".to_string()));
        }
        if request.line_limit == Some(0) {
            return Err(ApiError::InvalidInput("line_limit 必须大于 0".to_string()));
        }
        if let ImportScope::Blocks(blocks) = &request.scope {
            if blocks.is_empty() {
                return Err(ApiError::InvalidInput("导入范围至少包含一个块".to_string()));
            }
        }

        let file_size = match request.file_size {
            Some(size) => size,
            None => self.store.size(&request.file_path).await.map_err(|e| {
                ApiError::InvalidInput(format!("无法读取文件 {}: {}", request.file_path, e))
            })?,
        };

        let mut job = ImportJob::new_pending(
            request.company_id,
            request.file_path,
            request.file_name,
            file_size,
        );
        job.scope = request.scope;
        job.line_limit = request.line_limit;
        job.config_snapshot_json = Some(
            self.config
                .to_snapshot_json()
                .map_err(|e| ApiError::InternalError(format!("配置快照序列化失败: {}", e)))?,
        );

        self.jobs.insert_job(&job).await?;
        tracing::info!(
            job_id = %job.job_id,
            company_id = %job.company_id,
            file_name = %job.file_name,
            file_size,
            "导入任务已受理"
        );

        match self.scheduler.schedule(&job.job_id, Duration::ZERO).await? {
            ScheduleOutcome::Scheduled(_) => {}
            ScheduleOutcome::Exhausted => {
                tracing::error!(job_id = %job.job_id, "首次调用投递失败，任务已置为失败");
            }
        }
        Ok(job.job_id)
    }

    /// 查询任务状态
    pub async fn get_job_status(&self, job_id: &str) -> ApiResult<JobStatusView> {
        let job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("ImportJob(id={})不存在", job_id)))?;
        Ok(job.into())
    }

    /// 列出公司最近的任务
    pub async fn list_jobs(&self, company_id: &str, limit: Option<usize>) -> ApiResult<Vec<JobStatusView>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);
        let jobs = self.jobs.list_by_company(company_id, limit).await?;
        Ok(jobs.into_iter().map(JobStatusView::from).collect())
    }

    /// 取消任务（非终态 → cancelled），并撤销待执行续传
    pub async fn cancel_job(&self, job_id: &str) -> ApiResult<JobStatusView> {
        let job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("ImportJob(id={})不存在", job_id)))?;

        if job.is_terminal() || !self.jobs.request_cancel(job_id, "任务已取消").await? {
            return Err(ApiError::InvalidStateTransition {
                from: job.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }

        let revoked = self.queue.cancel_for_job(job_id)?;
        tracing::info!(job_id = job_id, revoked, "导入任务已取消");
        self.get_job_status(job_id).await
    }

    /// 续传队列统计
    pub fn queue_stats(&self) -> ApiResult<QueueStats> {
        Ok(self.queue.stats()?)
    }
}
