// ==========================================
// SPED 账簿导入系统 - SQLite 连接初始化与建表
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 统一 busy_timeout，减少并发写入时的偶发 busy 错误
// - 建表幂等（CREATE TABLE IF NOT EXISTS）
// ==========================================

use crate::domain::types::LedgerCategory;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 分类明细表 DDL（六张表结构相同）
fn ledger_table_ddl(category: LedgerCategory) -> String {
    let table = category.table_name();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            branch_id TEXT NOT NULL REFERENCES branch(branch_id),
            period_start TEXT NOT NULL,
            source_line INTEGER NOT NULL,
            job_id TEXT NOT NULL,
            record_type TEXT NOT NULL,
            participant_code TEXT,
            participant_name TEXT,
            document_number TEXT,
            document_date TEXT,
            cfop TEXT,
            item_code TEXT,
            description TEXT,
            amount REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (branch_id, period_start, source_line)
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_job ON {table}(job_id);"
    )
}

/// 初始化全部表结构（幂等）
///
/// # 参数
/// - conn: 已配置 PRAGMA 的连接
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS branch (
            branch_id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            taxpayer_id TEXT NOT NULL,
            name TEXT NOT NULL,
            state TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (company_id, taxpayer_id)
        );

        CREATE TABLE IF NOT EXISTS import_job (
            job_id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            branch_id TEXT REFERENCES branch(branch_id),
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            import_scope TEXT NOT NULL DEFAULT 'FULL',
            line_limit INTEGER,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            processed_lines INTEGER NOT NULL DEFAULT 0,
            total_lines INTEGER,
            goods_count INTEGER NOT NULL DEFAULT 0,
            services_count INTEGER NOT NULL DEFAULT 0,
            energy_water_count INTEGER NOT NULL DEFAULT 0,
            freight_count INTEGER NOT NULL DEFAULT 0,
            fixed_asset_count INTEGER NOT NULL DEFAULT 0,
            usage_consumption_count INTEGER NOT NULL DEFAULT 0,
            resume_cursor INTEGER NOT NULL DEFAULT 0,
            parent_context TEXT,
            period_start TEXT,
            period_end TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            persist_failures INTEGER NOT NULL DEFAULT 0,
            status_message TEXT,
            error_message TEXT,
            failure_kind TEXT,
            claim_token TEXT,
            claimed_until TEXT,
            config_snapshot_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_import_job_company ON import_job(company_id, created_at);

        CREATE TABLE IF NOT EXISTS participant (
            branch_id TEXT NOT NULL REFERENCES branch(branch_id),
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            taxpayer_id TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (branch_id, code)
        );

        CREATE TABLE IF NOT EXISTS import_continuation_queue (
            task_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            status TEXT NOT NULL,
            not_before TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_continuation_due ON import_continuation_queue(status, not_before);

        CREATE TABLE IF NOT EXISTS branch_period_summary (
            branch_id TEXT NOT NULL,
            period_start TEXT NOT NULL,
            category TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            total_amount REAL NOT NULL,
            total_tax REAL NOT NULL,
            refreshed_at TEXT NOT NULL,
            PRIMARY KEY (branch_id, period_start, category)
        );

        CREATE TABLE IF NOT EXISTS view_refresh_log (
            refresh_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            period_start TEXT NOT NULL,
            rows_affected INTEGER NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT
        );
        "#,
    )?;

    for category in LedgerCategory::ALL {
        conn.execute_batch(&ledger_table_ddl(category))?;
    }

    let current = read_schema_version(conn)?;
    if current.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [CURRENT_SCHEMA_VERSION],
        )?;
    } else if current != Some(CURRENT_SCHEMA_VERSION) {
        tracing::warn!(
            found = ?current,
            expected = CURRENT_SCHEMA_VERSION,
            "数据库 schema_version 与当前代码不一致"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(read_schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        for category in LedgerCategory::ALL {
            let exists: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [category.table_name()],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "{}", category.table_name());
        }
    }
}
