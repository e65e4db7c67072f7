// ==========================================
// SPED 账簿导入系统 - 导入任务仓储
// ==========================================
// 职责: import_job 单行读写
// 约束: 所有状态变更均为条件 UPDATE（状态 + 认领令牌），
//       终态任务不会被任何写入修改
// ==========================================

use crate::domain::import_job::{CategoryCounts, ImportJob, JobCheckpoint, ParentContext};
use crate::domain::types::{FailureKind, ImportScope, JobStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::{fmt_ts, parse_ts, to_i64, to_u64};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};

// ==========================================
// ImportJobRepository Trait
// ==========================================
#[async_trait]
pub trait ImportJobRepository: Send + Sync {
    async fn insert_job(&self, job: &ImportJob) -> RepositoryResult<()>;

    async fn find_by_id(&self, job_id: &str) -> RepositoryResult<Option<ImportJob>>;

    /// 按创建时间倒序列出公司的任务
    async fn list_by_company(&self, company_id: &str, limit: usize) -> RepositoryResult<Vec<ImportJob>>;

    /// 认领任务（非终态，且未被认领或租约已过期）
    ///
    /// # 返回
    /// - Ok(true): 认领成功
    /// - Ok(false): 任务已终态或正被其他调用处理
    async fn try_claim(
        &self,
        job_id: &str,
        token: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    /// 释放认领（仅当令牌匹配）
    async fn release_claim(&self, job_id: &str, token: &str) -> RepositoryResult<()>;

    /// pending → processing，同时写入分支与账期
    async fn start_processing(
        &self,
        job_id: &str,
        token: &str,
        branch_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> RepositoryResult<bool>;

    /// 写入检查点
    ///
    /// # 返回
    /// - Ok(false): 令牌失效 / 状态已变（如外部取消）/ 游标回退，调用方应中止
    async fn save_checkpoint(
        &self,
        job_id: &str,
        token: &str,
        checkpoint: &JobCheckpoint,
    ) -> RepositoryResult<bool>;

    async fn set_total_lines(&self, job_id: &str, total_lines: u64) -> RepositoryResult<()>;

    /// 条件状态转换 from → to
    async fn transition(
        &self,
        job_id: &str,
        token: &str,
        from: JobStatus,
        to: JobStatus,
        status_message: &str,
    ) -> RepositoryResult<bool>;

    /// refreshing_views → completed（progress=100）
    async fn complete(&self, job_id: &str, token: &str, status_message: &str) -> RepositoryResult<bool>;

    /// 任意非终态 → failed
    async fn mark_failed(&self, job_id: &str, kind: FailureKind, message: &str) -> RepositoryResult<bool>;

    /// 调度失败计数 +1，返回新的 retry_count
    async fn record_dispatch_failure(&self, job_id: &str, message: &str) -> RepositoryResult<u32>;

    /// 连续落库失败计数 +1，返回新的 persist_failures
    async fn record_persist_failure(&self, job_id: &str, message: &str) -> RepositoryResult<u32>;

    async fn reset_persist_failures(&self, job_id: &str) -> RepositoryResult<()>;

    /// 外部取消（非终态 → cancelled）
    async fn request_cancel(&self, job_id: &str, message: &str) -> RepositoryResult<bool>;
}

const NON_TERMINAL: &str = "('pending', 'processing', 'refreshing_views')";

const JOB_COLUMNS: &str = "job_id, company_id, branch_id, file_path, file_name, file_size,
    import_scope, line_limit, status, progress, processed_lines, total_lines,
    goods_count, services_count, energy_water_count, freight_count, fixed_asset_count,
    usage_consumption_count, resume_cursor, parent_context, period_start, period_end,
    retry_count, persist_failures, status_message, error_message, failure_kind,
    claim_token, claimed_until, config_snapshot_json, created_at, updated_at";

/// 行的原始列值（转换在闭包外完成，便于返回领域错误）
struct JobRow {
    job_id: String,
    company_id: String,
    branch_id: Option<String>,
    file_path: String,
    file_name: String,
    file_size: i64,
    import_scope: String,
    line_limit: Option<i64>,
    status: String,
    progress: i64,
    processed_lines: i64,
    total_lines: Option<i64>,
    counts: [i64; 6],
    resume_cursor: i64,
    parent_context: Option<String>,
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    retry_count: i64,
    persist_failures: i64,
    status_message: Option<String>,
    error_message: Option<String>,
    failure_kind: Option<String>,
    claim_token: Option<String>,
    claimed_until: Option<String>,
    config_snapshot_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            company_id: row.get(1)?,
            branch_id: row.get(2)?,
            file_path: row.get(3)?,
            file_name: row.get(4)?,
            file_size: row.get(5)?,
            import_scope: row.get(6)?,
            line_limit: row.get(7)?,
            status: row.get(8)?,
            progress: row.get(9)?,
            processed_lines: row.get(10)?,
            total_lines: row.get(11)?,
            counts: [
                row.get(12)?,
                row.get(13)?,
                row.get(14)?,
                row.get(15)?,
                row.get(16)?,
                row.get(17)?,
            ],
            resume_cursor: row.get(18)?,
            parent_context: row.get(19)?,
            period_start: row.get(20)?,
            period_end: row.get(21)?,
            retry_count: row.get(22)?,
            persist_failures: row.get(23)?,
            status_message: row.get(24)?,
            error_message: row.get(25)?,
            failure_kind: row.get(26)?,
            claim_token: row.get(27)?,
            claimed_until: row.get(28)?,
            config_snapshot_json: row.get(29)?,
            created_at: row.get(30)?,
            updated_at: row.get(31)?,
        })
    }

    fn into_job(self) -> RepositoryResult<ImportJob> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| RepositoryError::FieldValueError {
            field: "status".to_string(),
            message: self.status.clone(),
        })?;
        let scope = ImportScope::from_db_string(&self.import_scope).ok_or_else(|| {
            RepositoryError::FieldValueError {
                field: "import_scope".to_string(),
                message: self.import_scope.clone(),
            }
        })?;
        let parent_context = match self.parent_context {
            Some(raw) => Some(serde_json::from_str::<ParentContext>(&raw).map_err(|e| {
                RepositoryError::FieldValueError {
                    field: "parent_context".to_string(),
                    message: e.to_string(),
                }
            })?),
            None => None,
        };
        let claimed_until = match self.claimed_until {
            Some(raw) => Some(parse_ts("claimed_until", &raw)?),
            None => None,
        };
        let [goods, services, energy_water, freight, fixed_asset, usage_consumption] = self.counts;

        Ok(ImportJob {
            job_id: self.job_id,
            company_id: self.company_id,
            branch_id: self.branch_id,
            file_path: self.file_path,
            file_name: self.file_name,
            file_size: to_u64("file_size", self.file_size)?,
            scope,
            line_limit: self.line_limit.map(|v| to_u64("line_limit", v)).transpose()?,
            status,
            progress: self.progress.clamp(0, 100) as u8,
            processed_lines: to_u64("processed_lines", self.processed_lines)?,
            total_lines: self.total_lines.map(|v| to_u64("total_lines", v)).transpose()?,
            counts: CategoryCounts {
                goods,
                services,
                energy_water,
                freight,
                fixed_asset,
                usage_consumption,
            },
            resume_cursor: to_u64("resume_cursor", self.resume_cursor)?,
            parent_context,
            period_start: self.period_start,
            period_end: self.period_end,
            retry_count: self.retry_count.max(0) as u32,
            persist_failures: self.persist_failures.max(0) as u32,
            status_message: self.status_message,
            error_message: self.error_message,
            failure_kind: self.failure_kind.as_deref().and_then(FailureKind::parse),
            claim_token: self.claim_token,
            claimed_until,
            config_snapshot_json: self.config_snapshot_json,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
        })
    }
}

fn parent_context_json(ctx: Option<&ParentContext>) -> RepositoryResult<Option<String>> {
    ctx.map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::FieldValueError {
            field: "parent_context".to_string(),
            message: e.to_string(),
        })
}

// ==========================================
// SqliteImportJobRepository
// ==========================================
pub struct SqliteImportJobRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteImportJobRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn now() -> String {
        fmt_ts(Utc::now())
    }
}

#[async_trait]
impl ImportJobRepository for SqliteImportJobRepository {
    async fn insert_job(&self, job: &ImportJob) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let ctx = parent_context_json(job.parent_context.as_ref())?;
        conn.execute(
            &format!(
                "INSERT INTO import_job ({JOB_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32
                )"
            ),
            params![
                job.job_id,
                job.company_id,
                job.branch_id,
                job.file_path,
                job.file_name,
                to_i64("file_size", job.file_size)?,
                job.scope.to_db_string(),
                job.line_limit.map(|v| to_i64("line_limit", v)).transpose()?,
                job.status.as_str(),
                job.progress as i64,
                to_i64("processed_lines", job.processed_lines)?,
                job.total_lines.map(|v| to_i64("total_lines", v)).transpose()?,
                job.counts.goods,
                job.counts.services,
                job.counts.energy_water,
                job.counts.freight,
                job.counts.fixed_asset,
                job.counts.usage_consumption,
                to_i64("resume_cursor", job.resume_cursor)?,
                ctx,
                job.period_start,
                job.period_end,
                job.retry_count as i64,
                job.persist_failures as i64,
                job.status_message,
                job.error_message,
                job.failure_kind.map(|k| k.as_str()),
                job.claim_token,
                job.claimed_until.map(fmt_ts),
                job.config_snapshot_json,
                fmt_ts(job.created_at),
                fmt_ts(job.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn find_by_id(&self, job_id: &str) -> RepositoryResult<Option<ImportJob>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM import_job WHERE job_id = ?1"),
                params![job_id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_by_company(&self, company_id: &str, limit: usize) -> RepositoryResult<Vec<ImportJob>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM import_job WHERE company_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![company_id, limit as i64], JobRow::from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    async fn try_claim(
        &self,
        job_id: &str,
        token: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            &format!(
                "UPDATE import_job
                 SET claim_token = ?2, claimed_until = ?3, updated_at = ?4
                 WHERE job_id = ?1
                   AND status IN {NON_TERMINAL}
                   AND (claim_token IS NULL OR claimed_until IS NULL OR claimed_until < ?4)"
            ),
            params![job_id, token, fmt_ts(lease_until), fmt_ts(now)],
        )?;
        Ok(affected == 1)
    }

    async fn release_claim(&self, job_id: &str, token: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE import_job SET claim_token = NULL, claimed_until = NULL
             WHERE job_id = ?1 AND claim_token = ?2",
            params![job_id, token],
        )?;
        Ok(())
    }

    async fn start_processing(
        &self,
        job_id: &str,
        token: &str,
        branch_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE import_job
             SET status = 'processing', branch_id = ?3, period_start = ?4, period_end = ?5,
                 status_message = '头部解析完成，开始处理', updated_at = ?6
             WHERE job_id = ?1 AND claim_token = ?2 AND status = 'pending'",
            params![job_id, token, branch_id, period_start, period_end, Self::now()],
        )?;
        Ok(affected == 1)
    }

    async fn save_checkpoint(
        &self,
        job_id: &str,
        token: &str,
        checkpoint: &JobCheckpoint,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let ctx = parent_context_json(checkpoint.parent_context.as_ref())?;
        let cursor = to_i64("resume_cursor", checkpoint.resume_cursor)?;
        let affected = conn.execute(
            "UPDATE import_job
             SET resume_cursor = ?3,
                 processed_lines = ?4,
                 progress = MAX(progress, ?5),
                 parent_context = ?6,
                 status_message = ?7,
                 updated_at = ?8
             WHERE job_id = ?1 AND claim_token = ?2
               AND status = 'processing'
               AND resume_cursor <= ?3",
            params![
                job_id,
                token,
                cursor,
                to_i64("processed_lines", checkpoint.processed_lines)?,
                checkpoint.progress as i64,
                ctx,
                checkpoint.status_message,
                Self::now(),
            ],
        )?;
        Ok(affected == 1)
    }

    async fn set_total_lines(&self, job_id: &str, total_lines: u64) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "UPDATE import_job SET total_lines = ?2, updated_at = ?3
                 WHERE job_id = ?1 AND status IN {NON_TERMINAL}"
            ),
            params![job_id, to_i64("total_lines", total_lines)?, Self::now()],
        )?;
        Ok(())
    }

    async fn transition(
        &self,
        job_id: &str,
        token: &str,
        from: JobStatus,
        to: JobStatus,
        status_message: &str,
    ) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE import_job SET status = ?4, status_message = ?5, updated_at = ?6
             WHERE job_id = ?1 AND claim_token = ?2 AND status = ?3",
            params![job_id, token, from.as_str(), to.as_str(), status_message, Self::now()],
        )?;
        Ok(affected == 1)
    }

    async fn complete(&self, job_id: &str, token: &str, status_message: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE import_job
             SET status = 'completed', progress = 100, status_message = ?3,
                 parent_context = NULL, claim_token = NULL, claimed_until = NULL, updated_at = ?4
             WHERE job_id = ?1 AND claim_token = ?2 AND status = 'refreshing_views'",
            params![job_id, token, status_message, Self::now()],
        )?;
        Ok(affected == 1)
    }

    async fn mark_failed(&self, job_id: &str, kind: FailureKind, message: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            &format!(
                "UPDATE import_job
                 SET status = 'failed', failure_kind = ?2, error_message = ?3,
                     status_message = '导入失败', claim_token = NULL, claimed_until = NULL,
                     updated_at = ?4
                 WHERE job_id = ?1 AND status IN {NON_TERMINAL}"
            ),
            params![job_id, kind.as_str(), message, Self::now()],
        )?;
        Ok(affected == 1)
    }

    async fn record_dispatch_failure(&self, job_id: &str, message: &str) -> RepositoryResult<u32> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "UPDATE import_job SET retry_count = retry_count + 1, error_message = ?2, updated_at = ?3
                 WHERE job_id = ?1 AND status IN {NON_TERMINAL}"
            ),
            params![job_id, message, Self::now()],
        )?;
        let count: i64 = conn
            .query_row(
                "SELECT retry_count FROM import_job WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "ImportJob".to_string(),
                id: job_id.to_string(),
            })?;
        Ok(count.max(0) as u32)
    }

    async fn record_persist_failure(&self, job_id: &str, message: &str) -> RepositoryResult<u32> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "UPDATE import_job SET persist_failures = persist_failures + 1, error_message = ?2,
                        updated_at = ?3
                 WHERE job_id = ?1 AND status IN {NON_TERMINAL}"
            ),
            params![job_id, message, Self::now()],
        )?;
        let count: i64 = conn
            .query_row(
                "SELECT persist_failures FROM import_job WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "ImportJob".to_string(),
                id: job_id.to_string(),
            })?;
        Ok(count.max(0) as u32)
    }

    async fn reset_persist_failures(&self, job_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE import_job SET persist_failures = 0 WHERE job_id = ?1 AND persist_failures <> 0",
            params![job_id],
        )?;
        Ok(())
    }

    async fn request_cancel(&self, job_id: &str, message: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            &format!(
                "UPDATE import_job
                 SET status = 'cancelled', status_message = ?2, updated_at = ?3
                 WHERE job_id = ?1 AND status IN {NON_TERMINAL}"
            ),
            params![job_id, message, Self::now()],
        )?;
        Ok(affected == 1)
    }
}
