// ==========================================
// SPED 账簿导入系统 - 分支机构仓储
// ==========================================
// 职责: 按 (company_id, taxpayer_id) 查找或创建分支
// 约束: 并发首见时依赖唯一约束保证至多一行
// ==========================================

use crate::domain::branch::Branch;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::{fmt_ts, parse_ts};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

#[async_trait]
pub trait BranchRepository: Send + Sync {
    /// 查找或创建分支（幂等）
    async fn find_or_create(
        &self,
        company_id: &str,
        taxpayer_id: &str,
        name: &str,
        state: Option<&str>,
    ) -> RepositoryResult<Branch>;
}

pub struct SqliteBranchRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBranchRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }
}

type BranchRow = (String, String, String, String, Option<String>, String);

fn branch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BranchRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_branch(raw: BranchRow) -> RepositoryResult<Branch> {
    let (branch_id, company_id, taxpayer_id, name, state, created_at) = raw;
    Ok(Branch {
        branch_id,
        company_id,
        taxpayer_id,
        name,
        state,
        created_at: parse_ts("created_at", &created_at)?,
    })
}

#[async_trait]
impl BranchRepository for SqliteBranchRepository {
    async fn find_or_create(
        &self,
        company_id: &str,
        taxpayer_id: &str,
        name: &str,
        state: Option<&str>,
    ) -> RepositoryResult<Branch> {
        let conn = self.get_conn()?;
        let inserted = conn.execute(
            "INSERT INTO branch (branch_id, company_id, taxpayer_id, name, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(company_id, taxpayer_id) DO NOTHING",
            params![
                uuid::Uuid::new_v4().to_string(),
                company_id,
                taxpayer_id,
                name,
                state,
                fmt_ts(Utc::now()),
            ],
        )?;
        if inserted == 1 {
            tracing::info!(company_id = company_id, taxpayer_id = taxpayer_id, "新建分支机构");
        }

        let raw = conn.query_row(
            "SELECT branch_id, company_id, taxpayer_id, name, state, created_at
             FROM branch WHERE company_id = ?1 AND taxpayer_id = ?2",
            params![company_id, taxpayer_id],
            branch_from_row,
        )?;
        into_branch(raw)
    }
}
