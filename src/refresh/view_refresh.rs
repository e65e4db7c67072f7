// ==========================================
// SPED 账簿导入系统 - 下游视图刷新
// ==========================================
// 职责: 导入完成后重建分支/账期汇总（branch_period_summary）
// 约束: 刷新失败只记录日志，不回退任务状态
// ==========================================

use crate::domain::types::LedgerCategory;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::fmt_ts;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, Transaction};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// 刷新请求（范围：单个分支的单个账期）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub job_id: String,
    pub branch_id: String,
    pub period_start: NaiveDate,
}

/// 刷新结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub refresh_id: String,
    pub rows_affected: usize,
}

// ==========================================
// ViewRefresher Trait
// ==========================================
#[async_trait]
pub trait ViewRefresher: Send + Sync {
    async fn request_refresh(&self, request: &RefreshRequest) -> RepositoryResult<RefreshReport>;
}

// ==========================================
// SqliteViewRefresher
// ==========================================
pub struct SqliteViewRefresher {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteViewRefresher {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 重建单个类别的汇总行
    fn refresh_category(
        tx: &Transaction,
        category: LedgerCategory,
        request: &RefreshRequest,
        refreshed_at: &str,
    ) -> RepositoryResult<usize> {
        tx.execute(
            "DELETE FROM branch_period_summary
             WHERE branch_id = ?1 AND period_start = ?2 AND category = ?3",
            params![request.branch_id, request.period_start, category.as_str()],
        )?;

        let rows = tx.execute(
            &format!(
                "INSERT INTO branch_period_summary
                    (branch_id, period_start, category, row_count, total_amount, total_tax, refreshed_at)
                 SELECT branch_id, period_start, ?3, COUNT(*), COALESCE(SUM(amount), 0),
                        COALESCE(SUM(tax_amount), 0), ?4
                 FROM {}
                 WHERE branch_id = ?1 AND period_start = ?2
                 GROUP BY branch_id, period_start",
                category.table_name()
            ),
            params![request.branch_id, request.period_start, category.as_str(), refreshed_at],
        )?;
        Ok(rows)
    }
}

#[async_trait]
impl ViewRefresher for SqliteViewRefresher {
    async fn request_refresh(&self, request: &RefreshRequest) -> RepositoryResult<RefreshReport> {
        let refresh_id = Uuid::new_v4().to_string();
        let started_at = fmt_ts(Utc::now());

        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        // 记录刷新开始
        tx.execute(
            "INSERT INTO view_refresh_log
                (refresh_id, job_id, branch_id, period_start, rows_affected, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 0, 'RUNNING', ?5)",
            params![refresh_id, request.job_id, request.branch_id, request.period_start, started_at],
        )?;

        let mut rows_affected = 0;
        for category in LedgerCategory::ALL {
            rows_affected += Self::refresh_category(&tx, category, request, &started_at)?;
        }

        // 记录刷新完成
        tx.execute(
            "UPDATE view_refresh_log SET rows_affected = ?2, status = 'SUCCESS', completed_at = ?3
             WHERE refresh_id = ?1",
            params![refresh_id, rows_affected as i64, fmt_ts(Utc::now())],
        )?;

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        tracing::info!(
            refresh_id = %refresh_id,
            branch_id = %request.branch_id,
            period_start = %request.period_start,
            rows = rows_affected,
            "汇总视图刷新完成"
        );

        Ok(RefreshReport {
            refresh_id,
            rows_affected,
        })
    }
}

// ==========================================
// ViewRefreshTrigger
// ==========================================
pub struct ViewRefreshTrigger {
    refresher: Arc<dyn ViewRefresher>,
    timeout: Duration,
}

impl ViewRefreshTrigger {
    pub fn new(refresher: Arc<dyn ViewRefresher>, timeout: Duration) -> Self {
        Self { refresher, timeout }
    }

    /// 触发刷新（受超时约束）
    ///
    /// # 返回
    /// - true: 刷新成功
    /// - false: 刷新失败或超时（已记录日志）
    pub async fn trigger(&self, request: &RefreshRequest) -> bool {
        match tokio::time::timeout(self.timeout, self.refresher.request_refresh(request)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %request.job_id, error = %e, "汇总视图刷新失败");
                false
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %request.job_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "汇总视图刷新超时"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};

    fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO branch (branch_id, company_id, taxpayer_id, name, created_at)
                 VALUES ('B1', 'ACME', '11222333000181', 'Filial', '2024-01-01T00:00:00.000Z');
             INSERT INTO ledger_goods (branch_id, period_start, source_line, job_id, record_type, amount, tax_amount)
                 VALUES ('B1', '2024-01-01', 3, 'J1', 'C100', 100.0, 18.0),
                        ('B1', '2024-01-01', 5, 'J1', 'C100', 50.0, 9.0);
             INSERT INTO ledger_freight (branch_id, period_start, source_line, job_id, record_type, amount, tax_amount)
                 VALUES ('B1', '2024-01-01', 8, 'J1', 'D100', 30.0, 3.6);",
        )
        .unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn request() -> RefreshRequest {
        RefreshRequest {
            job_id: "J1".into(),
            branch_id: "B1".into(),
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_rebuilds_summary_and_logs() {
        let conn = setup();
        let refresher = SqliteViewRefresher::new(conn.clone());

        let report = refresher.request_refresh(&request()).await.unwrap();
        assert_eq!(report.rows_affected, 2);
        // 重复刷新结果不变
        let again = refresher.request_refresh(&request()).await.unwrap();
        assert_eq!(again.rows_affected, 2);

        let c = conn.lock().unwrap();
        let (count, amount): (i64, f64) = c
            .query_row(
                "SELECT row_count, total_amount FROM branch_period_summary
                 WHERE branch_id = 'B1' AND category = 'goods'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert!((amount - 150.0).abs() < 1e-9);

        let logged: i64 = c
            .query_row(
                "SELECT COUNT(*) FROM view_refresh_log WHERE status = 'SUCCESS'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(logged, 2);
    }

    struct SlowRefresher;

    #[async_trait]
    impl ViewRefresher for SlowRefresher {
        async fn request_refresh(&self, _request: &RefreshRequest) -> RepositoryResult<RefreshReport> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RefreshReport {
                refresh_id: "late".into(),
                rows_affected: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_trigger_times_out_without_error() {
        let trigger = ViewRefreshTrigger::new(Arc::new(SlowRefresher), Duration::from_millis(10));
        assert!(!trigger.trigger(&request()).await);
    }
}
