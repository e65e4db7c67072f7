// ==========================================
// SPED 账簿导入系统 - 配置管理器
// ==========================================
// 职责: 从 config_kv 读取管线参数覆写，组装 PipelineConfig
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::pipeline_config::PipelineConfig;
use crate::db::open_sqlite_connection;
use crate::domain::types::TrailerPolicy;
use rusqlite::{params, Connection};
use std::error::Error;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, Box<dyn Error>> {
        let conn = open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, Box<dyn Error>> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }
        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 写入 global scope 配置（存在则覆盖）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> Result<(), Box<dyn Error>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value, updated_at)
             VALUES ('global', ?1, ?2, datetime('now'))
             ON CONFLICT(scope_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    /// 读取数值型覆写；格式错误时告警并保持默认
    fn read_override<T: FromStr + Copy>(&self, key: &str, default: T) -> Result<T, Box<dyn Error>> {
        match self.get_global_config_value(key)? {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!(key = key, value = %raw, "配置值格式错误，使用默认值");
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    /// 组装管线参数（默认值 + config_kv 覆写）
    ///
    /// # 返回
    /// - Ok(PipelineConfig): 已校验的参数
    /// - Err: 读取失败或覆写后参数不合法
    pub fn load_pipeline_config(&self) -> Result<PipelineConfig, Box<dyn Error>> {
        let d = PipelineConfig::default();

        let trailer_policy = match self.get_global_config_value(config_keys::TRAILER_POLICY)? {
            Some(raw) => TrailerPolicy::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "尾记录策略无法识别，使用默认值");
                d.trailer_policy
            }),
            None => d.trailer_policy,
        };

        let cfg = PipelineConfig {
            header_probe_bytes: self.read_override(config_keys::HEADER_PROBE_BYTES, d.header_probe_bytes)?,
            read_chunk_bytes: self.read_override(config_keys::READ_CHUNK_BYTES, d.read_chunk_bytes)?,
            max_line_bytes: self.read_override(config_keys::MAX_LINE_BYTES, d.max_line_bytes)?,
            chunk_max_lines: self.read_override(config_keys::CHUNK_MAX_LINES, d.chunk_max_lines)?,
            invocation_budget_ms: self.read_override(config_keys::INVOCATION_BUDGET_MS, d.invocation_budget_ms)?,
            deadline_margin_ms: self.read_override(config_keys::DEADLINE_MARGIN_MS, d.deadline_margin_ms)?,
            lease_grace_ms: self.read_override(config_keys::LEASE_GRACE_MS, d.lease_grace_ms)?,
            batch_size: self.read_override(config_keys::BATCH_SIZE, d.batch_size)?,
            progress_interval_lines: self
                .read_override(config_keys::PROGRESS_INTERVAL_LINES, d.progress_interval_lines)?,
            continuation_delay_ms: self.read_override(config_keys::CONTINUATION_DELAY_MS, d.continuation_delay_ms)?,
            max_dispatch_retries: self.read_override(config_keys::MAX_DISPATCH_RETRIES, d.max_dispatch_retries)?,
            backoff_base_ms: self.read_override(config_keys::BACKOFF_BASE_MS, d.backoff_base_ms)?,
            backoff_max_ms: self.read_override(config_keys::BACKOFF_MAX_MS, d.backoff_max_ms)?,
            max_persist_failures: self.read_override(config_keys::MAX_PERSIST_FAILURES, d.max_persist_failures)?,
            refresh_timeout_ms: self.read_override(config_keys::REFRESH_TIMEOUT_MS, d.refresh_timeout_ms)?,
            trailer_policy,
        };

        cfg.validate()?;
        Ok(cfg)
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 读取
    pub const HEADER_PROBE_BYTES: &str = "import/header_probe_bytes";
    pub const READ_CHUNK_BYTES: &str = "import/read_chunk_bytes";
    pub const MAX_LINE_BYTES: &str = "import/max_line_bytes";

    // 单次调用预算
    pub const CHUNK_MAX_LINES: &str = "import/chunk_max_lines";
    pub const INVOCATION_BUDGET_MS: &str = "import/invocation_budget_ms";
    pub const DEADLINE_MARGIN_MS: &str = "import/deadline_margin_ms";
    pub const LEASE_GRACE_MS: &str = "import/lease_grace_ms";

    // 落库
    pub const BATCH_SIZE: &str = "import/batch_size";
    pub const PROGRESS_INTERVAL_LINES: &str = "import/progress_interval_lines";

    // 调度
    pub const CONTINUATION_DELAY_MS: &str = "import/continuation_delay_ms";
    pub const MAX_DISPATCH_RETRIES: &str = "import/max_dispatch_retries";
    pub const BACKOFF_BASE_MS: &str = "import/backoff_base_ms";
    pub const BACKOFF_MAX_MS: &str = "import/backoff_max_ms";
    pub const MAX_PERSIST_FAILURES: &str = "import/max_persist_failures";

    // 下游
    pub const REFRESH_TIMEOUT_MS: &str = "import/refresh_timeout_ms";
    pub const TRAILER_POLICY: &str = "import/trailer_policy"; // warn | strict
}
