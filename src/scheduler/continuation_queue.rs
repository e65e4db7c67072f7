// ==========================================
// SPED 账簿导入系统 - 续传任务队列
// ==========================================
// 职责: 持久化“何时再次调用某任务”，供工作器按到期时间取出
// 约束: 同一导入任务至多一条 PENDING 续传（重复投递幂等）
// 回收: 调用中断遗留的 RUNNING 续传超时后放回；
//       未终结且认领已过期、又没有在途续传的任务补投续传
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::{fmt_ts, parse_ts};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// 续传任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationStatus {
    /// 等待到期
    Pending,
    /// 已被工作器取出
    Running,
    /// 调用已结束
    Completed,
    /// 调用异常结束
    Failed,
    /// 任务被取消
    Cancelled,
}

impl ContinuationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuationStatus::Pending => "PENDING",
            ContinuationStatus::Running => "RUNNING",
            ContinuationStatus::Completed => "COMPLETED",
            ContinuationStatus::Failed => "FAILED",
            ContinuationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PENDING" => ContinuationStatus::Pending,
            "RUNNING" => ContinuationStatus::Running,
            "COMPLETED" => ContinuationStatus::Completed,
            "CANCELLED" => ContinuationStatus::Cancelled,
            _ => ContinuationStatus::Failed,
        }
    }
}

/// 续传任务
#[derive(Debug, Clone)]
pub struct ContinuationTask {
    pub task_id: String,
    pub job_id: String,
    pub status: ContinuationStatus,
    /// 最早执行时间
    pub not_before: DateTime<Utc>,
    pub attempt: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_count: u32,
    pub running_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub cancelled_count: u32,
}

/// 投递错误（调用方按暂时性失败处理并退避重试）
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("调度通道不可用: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

// ==========================================
// ContinuationDispatcher Trait
// ==========================================
#[async_trait]
pub trait ContinuationDispatcher: Send + Sync {
    /// 投递一次续传调用
    ///
    /// # 返回
    /// - Ok(task_id): 已持久化（或已存在同任务的待执行续传）
    async fn dispatch(&self, job_id: &str, not_before: DateTime<Utc>) -> Result<String, DispatchError>;
}

// ==========================================
// SqliteContinuationQueue
// ==========================================
pub struct SqliteContinuationQueue {
    conn: Arc<Mutex<Connection>>,
}

const TASK_COLUMNS: &str = "task_id, job_id, status, not_before, attempt, error_message,
    created_at, started_at, completed_at";

type TaskRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_task(raw: TaskRow) -> RepositoryResult<ContinuationTask> {
    let (task_id, job_id, status, not_before, attempt, error_message, created_at, started_at, completed_at) =
        raw;
    Ok(ContinuationTask {
        task_id,
        job_id,
        status: ContinuationStatus::parse(&status),
        not_before: parse_ts("not_before", &not_before)?,
        attempt: attempt.max(0) as u32,
        error_message,
        created_at: parse_ts("created_at", &created_at)?,
        started_at: started_at.map(|s| parse_ts("started_at", &s)).transpose()?,
        completed_at: completed_at.map(|s| parse_ts("completed_at", &s)).transpose()?,
    })
}

/// 插入一条 PENDING 续传（attempt = 该任务已有续传数）
fn insert_pending(conn: &Connection, job_id: &str, not_before: DateTime<Utc>) -> RepositoryResult<String> {
    let task_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO import_continuation_queue (task_id, job_id, status, not_before, attempt, created_at)
         VALUES (?1, ?2, 'PENDING', ?3,
                 (SELECT COUNT(*) FROM import_continuation_queue WHERE job_id = ?2), ?4)",
        params![task_id, job_id, fmt_ts(not_before), fmt_ts(Utc::now())],
    )?;
    Ok(task_id)
}

impl SqliteContinuationQueue {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 提交续传；同一任务已有 PENDING 续传时直接返回其 task_id
    pub fn enqueue(&self, job_id: &str, not_before: DateTime<Utc>) -> RepositoryResult<String> {
        let conn = self.get_conn()?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT task_id FROM import_continuation_queue
                 WHERE job_id = ?1 AND status = 'PENDING' LIMIT 1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(task_id) = existing {
            tracing::debug!(job_id = job_id, task_id = %task_id, "续传已在队列中");
            return Ok(task_id);
        }

        let task_id = insert_pending(&conn, job_id, not_before)?;
        tracing::info!(job_id = job_id, task_id = %task_id, not_before = %fmt_ts(not_before), "续传已加入队列");
        Ok(task_id)
    }

    /// 取出到期任务并标记为 RUNNING
    ///
    /// # 参数
    /// - now: 当前时间
    /// - limit: 最多取出条数
    pub fn dequeue_due(&self, now: DateTime<Utc>, limit: usize) -> RepositoryResult<Vec<ContinuationTask>> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        let mut tasks = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM import_continuation_queue
                 WHERE status = 'PENDING' AND not_before <= ?1
                 ORDER BY not_before ASC, created_at ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![fmt_ts(now), limit as i64], task_from_row)?;
            for row in rows {
                tasks.push(into_task(row?)?);
            }
        }

        let started = fmt_ts(Utc::now());
        for task in tasks.iter_mut() {
            tx.execute(
                "UPDATE import_continuation_queue SET status = 'RUNNING', started_at = ?2 WHERE task_id = ?1",
                params![task.task_id, started],
            )?;
            task.status = ContinuationStatus::Running;
        }

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(tasks)
    }

    pub fn complete(&self, task_id: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE import_continuation_queue SET status = 'COMPLETED', completed_at = ?2
             WHERE task_id = ?1 AND status = 'RUNNING'",
            params![task_id, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn fail(&self, task_id: &str, error_message: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE import_continuation_queue SET status = 'FAILED', error_message = ?2, completed_at = ?3
             WHERE task_id = ?1 AND status = 'RUNNING'",
            params![task_id, error_message, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// 取消某导入任务的全部待执行续传
    pub fn cancel_for_job(&self, job_id: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let n = conn.execute(
            "UPDATE import_continuation_queue SET status = 'CANCELLED', completed_at = ?2
             WHERE job_id = ?1 AND status = 'PENDING'",
            params![job_id, fmt_ts(Utc::now())],
        )?;
        Ok(n)
    }

    /// 某导入任务异常结束的续传数（用于重新投递的退避）
    pub fn failed_attempts(&self, job_id: &str) -> RepositoryResult<u32> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM import_continuation_queue WHERE job_id = ?1 AND status = 'FAILED'",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u32)
    }

    /// 回收停滞的续传
    ///
    /// - RUNNING 超过 stale_after 的续传：同任务已有 PENDING 续传时置为 FAILED，否则放回 PENDING
    /// - 未终结、认领为空或已过期、且没有 PENDING / RUNNING 续传的导入任务：补投一条立即到期的续传
    ///
    /// # 参数
    /// - now: 当前时间
    /// - stale_after: RUNNING 续传的最长存活时间（取认领租约时长）
    ///
    /// # 返回
    /// 放回或补投的续传数
    pub fn recover_stalled(&self, now: DateTime<Utc>, stale_after: Duration) -> RepositoryResult<usize> {
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(1));
        let threshold = fmt_ts(now - stale_after);
        let now_ts = fmt_ts(now);

        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        let stale: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT task_id, job_id FROM import_continuation_queue
                 WHERE status = 'RUNNING' AND started_at < ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![threshold], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let stale = rows.collect::<Result<Vec<_>, _>>()?;
            stale
        };

        let mut recovered = 0;
        for (task_id, job_id) in stale {
            let has_pending: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM import_continuation_queue WHERE job_id = ?1 AND status = 'PENDING')",
                params![job_id],
                |row| row.get(0),
            )?;
            if has_pending {
                tx.execute(
                    "UPDATE import_continuation_queue
                     SET status = 'FAILED', error_message = '调用中断，已有后续续传', completed_at = ?2
                     WHERE task_id = ?1",
                    params![task_id, now_ts],
                )?;
            } else {
                tx.execute(
                    "UPDATE import_continuation_queue
                     SET status = 'PENDING', started_at = NULL, not_before = ?2
                     WHERE task_id = ?1",
                    params![task_id, now_ts],
                )?;
                tracing::warn!(job_id = %job_id, task_id = %task_id, "续传调用中断，已放回队列");
                recovered += 1;
            }
        }

        let orphaned: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT j.job_id FROM import_job j
                 WHERE j.status IN ('pending', 'processing', 'refreshing_views')
                   AND (j.claim_token IS NULL OR j.claimed_until IS NULL OR j.claimed_until < ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM import_continuation_queue q
                       WHERE q.job_id = j.job_id AND q.status IN ('PENDING', 'RUNNING')
                   )",
            )?;
            let rows = stmt.query_map(params![now_ts], |row| row.get(0))?;
            let orphaned = rows.collect::<Result<Vec<_>, _>>()?;
            orphaned
        };
        for job_id in orphaned {
            let task_id = insert_pending(&tx, &job_id, now)?;
            tracing::warn!(job_id = %job_id, task_id = %task_id, "任务缺少在途续传，已补投");
            recovered += 1;
        }

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(recovered)
    }

    /// 最早的待执行时间
    pub fn next_due_at(&self) -> RepositoryResult<Option<DateTime<Utc>>> {
        let conn = self.get_conn()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MIN(not_before) FROM import_continuation_queue WHERE status = 'PENDING'",
            [],
            |row| row.get(0),
        )?;
        raw.map(|s| parse_ts("not_before", &s)).transpose()
    }

    /// 获取队列统计信息
    pub fn stats(&self) -> RepositoryResult<QueueStats> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM import_continuation_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u32;
            match ContinuationStatus::parse(&status) {
                ContinuationStatus::Pending => stats.pending_count = count,
                ContinuationStatus::Running => stats.running_count = count,
                ContinuationStatus::Completed => stats.completed_count = count,
                ContinuationStatus::Failed => stats.failed_count += count,
                ContinuationStatus::Cancelled => stats.cancelled_count = count,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl ContinuationDispatcher for SqliteContinuationQueue {
    async fn dispatch(&self, job_id: &str, not_before: DateTime<Utc>) -> Result<String, DispatchError> {
        Ok(self.enqueue(job_id, not_before)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};
    use chrono::Duration;

    fn queue() -> SqliteContinuationQueue {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        SqliteContinuationQueue::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_enqueue_is_idempotent_per_job() {
        let q = queue();
        let now = Utc::now();
        let a = q.enqueue("J1", now).unwrap();
        let b = q.enqueue("J1", now + Duration::seconds(5)).unwrap();
        let c = q.enqueue("J2", now).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(q.stats().unwrap().pending_count, 2);
    }

    #[test]
    fn test_dequeue_respects_not_before() {
        let q = queue();
        let now = Utc::now();
        q.enqueue("J1", now - Duration::seconds(1)).unwrap();
        q.enqueue("J2", now + Duration::seconds(60)).unwrap();

        let due = q.dequeue_due(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_id, "J1");
        assert_eq!(due[0].status, ContinuationStatus::Running);
        assert!(q.dequeue_due(now, 10).unwrap().is_empty());

        q.complete(&due[0].task_id).unwrap();
        let stats = q.stats().unwrap();
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert!(q.next_due_at().unwrap().unwrap() > now);
    }

    #[test]
    fn test_running_task_does_not_block_next_continuation() {
        let q = queue();
        let now = Utc::now();
        let first = q.enqueue("J1", now).unwrap();
        q.dequeue_due(now, 1).unwrap();
        let second = q.enqueue("J1", now).unwrap();
        assert_ne!(first, second);
        let stats = q.stats().unwrap();
        assert_eq!((stats.running_count, stats.pending_count), (1, 1));

        let next = q.dequeue_due(now, 1).unwrap();
        assert_eq!(next[0].task_id, second);
        assert_eq!(next[0].attempt, 1);

        q.enqueue("J1", now).unwrap();
        assert_eq!(q.cancel_for_job("J1").unwrap(), 1);
        assert_eq!(q.stats().unwrap().cancelled_count, 1);
    }

    #[test]
    fn test_stale_running_task_is_requeued() {
        let q = queue();
        let now = Utc::now();
        let task_id = q.enqueue("J1", now).unwrap();
        q.dequeue_due(now, 1).unwrap();

        // 未超过存活时间时不回收
        assert_eq!(q.recover_stalled(Utc::now(), std::time::Duration::from_secs(60)).unwrap(), 0);
        assert_eq!(q.stats().unwrap().running_count, 1);

        let later = Utc::now() + Duration::seconds(120);
        assert_eq!(q.recover_stalled(later, std::time::Duration::from_secs(60)).unwrap(), 1);
        let due = q.dequeue_due(later, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, task_id);
    }

    #[test]
    fn test_stale_task_with_pending_successor_is_closed() {
        let q = queue();
        let now = Utc::now();
        q.enqueue("J1", now).unwrap();
        q.dequeue_due(now, 1).unwrap();
        q.enqueue("J1", now + Duration::seconds(1)).unwrap();

        let later = Utc::now() + Duration::seconds(120);
        assert_eq!(q.recover_stalled(later, std::time::Duration::from_secs(60)).unwrap(), 0);
        let stats = q.stats().unwrap();
        assert_eq!((stats.pending_count, stats.running_count, stats.failed_count), (1, 0, 1));
        assert_eq!(q.failed_attempts("J1").unwrap(), 1);
    }
}
