// ==========================================
// SPED 账簿导入系统 - 账簿明细仓储
// ==========================================
// 职责: 分类明细批量写入 / 参与方登记
// 约束: 自然键 (branch_id, period_start, source_line) 冲突时跳过，
//       任务计数按实际插入行数在同一事务内累加
//       仅 processing 状态的任务可写入；其他状态整批回滚
// ==========================================

use crate::domain::ledger::{LedgerEntry, Participant};
use crate::domain::types::LedgerCategory;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::to_i64;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

// ==========================================
// LedgerEntryRepository Trait
// ==========================================
#[async_trait]
pub trait LedgerEntryRepository: Send + Sync {
    /// 批量写入一个类别的明细（单事务）
    ///
    /// 同一分支同一账期的行以源文件行号为键，已存在时跳过而不覆盖。
    /// 因此更正后重新上传同一账期的文件不会替换旧数据，新任务计数为 0；
    /// 需要替换时应先清理该分支账期的明细。
    ///
    /// # 参数
    /// - job_id: 计数归属的任务
    /// - category: 目标类别（决定表名与计数列）
    /// - rows: 明细行
    ///
    /// # 返回
    /// - Ok(usize): 实际插入行数（重放时已存在的行不计）
    /// - Err(JobNotActive): 任务已不在 processing（已取消 / 已失败 / 已完成），整批回滚
    /// - Err: 数据库错误（整个事务回滚）
    async fn insert_batch(
        &self,
        job_id: &str,
        category: LedgerCategory,
        rows: &[LedgerEntry],
    ) -> RepositoryResult<usize>;

    /// 登记参与方（存在则更新名称）
    async fn upsert_participants(
        &self,
        branch_id: &str,
        participants: &[Participant],
    ) -> RepositoryResult<usize>;
}

// ==========================================
// SqliteLedgerEntryRepository
// ==========================================
pub struct SqliteLedgerEntryRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerEntryRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }
}

#[async_trait]
impl LedgerEntryRepository for SqliteLedgerEntryRepository {
    async fn insert_batch(
        &self,
        job_id: &str,
        category: LedgerCategory,
        rows: &[LedgerEntry],
    ) -> RepositoryResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table} (
                    branch_id, period_start, source_line, job_id, record_type,
                    participant_code, participant_name, document_number, document_date,
                    cfop, item_code, description, amount, tax_amount
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6,
                    (SELECT name FROM participant WHERE branch_id = ?1 AND code = ?6),
                    ?7, ?8, ?9, ?10, ?11, ?12, ?13
                 )
                 ON CONFLICT(branch_id, period_start, source_line) DO NOTHING",
                table = category.table_name()
            ))?;

            for row in rows {
                inserted += stmt.execute(params![
                    row.branch_id,
                    row.period_start,
                    to_i64("source_line", row.source_line)?,
                    row.job_id,
                    row.record_type,
                    row.participant_code,
                    row.document_number,
                    row.document_date,
                    row.cfop,
                    row.item_code,
                    row.description,
                    row.amount,
                    row.tax_amount,
                ])?;
            }
        }

        let counted = tx.execute(
            &format!(
                "UPDATE import_job SET {col} = {col} + ?2 WHERE job_id = ?1 AND status = 'processing'",
                col = category.count_column()
            ),
            params![job_id, inserted as i64],
        )?;
        if counted == 0 {
            // tx 未提交，离开作用域时回滚
            tracing::warn!(job_id = job_id, category = category.as_str(), "任务不在处理中，批次已回滚");
            return Err(RepositoryError::JobNotActive(job_id.to_string()));
        }

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        tracing::debug!(
            job_id = job_id,
            category = category.as_str(),
            attempted = rows.len(),
            inserted = inserted,
            "明细批量写入完成"
        );
        Ok(inserted)
    }

    async fn upsert_participants(
        &self,
        branch_id: &str,
        participants: &[Participant],
    ) -> RepositoryResult<usize> {
        if participants.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO participant (branch_id, code, name, taxpayer_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(branch_id, code) DO UPDATE SET
                    name = excluded.name,
                    taxpayer_id = excluded.taxpayer_id,
                    updated_at = excluded.updated_at",
            )?;
            for p in participants {
                stmt.execute(params![branch_id, p.code, p.name, p.taxpayer_id])?;
            }
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(participants.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};
    use crate::domain::import_job::ImportJob;
    use crate::domain::types::FailureKind;
    use crate::repository::import_job_repo::{ImportJobRepository, SqliteImportJobRepository};
    use chrono::NaiveDate;

    fn setup() -> (Arc<Mutex<Connection>>, String) {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO branch (branch_id, company_id, taxpayer_id, name, created_at)
             VALUES ('B1', 'C1', '11222333000181', 'X', '2024-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        (Arc::new(Mutex::new(conn)), "B1".to_string())
    }

    async fn processing_job(conn: &Arc<Mutex<Connection>>, jobs: &SqliteImportJobRepository) -> ImportJob {
        let job = ImportJob::new_pending("C1", "/f", "f", 1);
        jobs.insert_job(&job).await.unwrap();
        conn.lock()
            .unwrap()
            .execute(
                "UPDATE import_job SET status = 'processing', branch_id = 'B1' WHERE job_id = ?1",
                [&job.job_id],
            )
            .unwrap();
        job
    }

    fn table_rows(conn: &Arc<Mutex<Connection>>) -> i64 {
        conn.lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM ledger_fixed_asset", [], |r| r.get(0))
            .unwrap()
    }

    fn entry(job_id: &str, line: u64) -> LedgerEntry {
        LedgerEntry {
            branch_id: "B1".to_string(),
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            source_line: line,
            job_id: job_id.to_string(),
            category: LedgerCategory::FixedAsset,
            record_type: "C170".to_string(),
            participant_code: Some("P1".to_string()),
            document_number: Some("123".to_string()),
            document_date: NaiveDate::from_ymd_opt(2024, 1, 5),
            cfop: Some("1551".to_string()),
            item_code: Some("IT1".to_string()),
            description: Some("Torno".to_string()),
            amount: 1000.5,
            tax_amount: 180.0,
        }
    }

    #[tokio::test]
    async fn test_replayed_batch_does_not_inflate_counts() {
        let (conn, branch_id) = setup();
        let jobs = SqliteImportJobRepository::new(conn.clone());
        let repo = SqliteLedgerEntryRepository::new(conn.clone());
        let job = processing_job(&conn, &jobs).await;

        repo.upsert_participants(
            &branch_id,
            &[Participant {
                code: "P1".to_string(),
                name: "Fornecedor".to_string(),
                taxpayer_id: None,
            }],
        )
        .await
        .unwrap();

        let rows = vec![entry(&job.job_id, 7), entry(&job.job_id, 8)];
        assert_eq!(
            repo.insert_batch(&job.job_id, LedgerCategory::FixedAsset, &rows).await.unwrap(),
            2
        );
        assert_eq!(
            repo.insert_batch(&job.job_id, LedgerCategory::FixedAsset, &rows).await.unwrap(),
            0
        );

        let loaded = jobs.find_by_id(&job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.counts.fixed_asset, 2);
        assert_eq!(table_rows(&conn), 2);

        let name: String = conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT participant_name FROM ledger_fixed_asset WHERE source_line = 7",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(name, "Fornecedor");
    }

    #[tokio::test]
    async fn test_terminal_job_rejects_batch() {
        let (conn, _branch_id) = setup();
        let jobs = SqliteImportJobRepository::new(conn.clone());
        let repo = SqliteLedgerEntryRepository::new(conn.clone());
        let job = processing_job(&conn, &jobs).await;

        repo.insert_batch(&job.job_id, LedgerCategory::FixedAsset, &[entry(&job.job_id, 1)])
            .await
            .unwrap();
        jobs.mark_failed(&job.job_id, FailureKind::Persistence, "x").await.unwrap();

        let err = repo
            .insert_batch(&job.job_id, LedgerCategory::FixedAsset, &[entry(&job.job_id, 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::JobNotActive(_)));

        // 行与计数都未变化
        assert_eq!(table_rows(&conn), 1);
        let loaded = jobs.find_by_id(&job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.counts.fixed_asset, 1);
    }
}
