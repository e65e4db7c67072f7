// ==========================================
// SPED 账簿导入系统 - 应用状态
// ==========================================
// 职责: 装配仓储 / 管线 / 调度 / API，管理共享连接
// ==========================================

use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use crate::api::ImportApi;
use crate::config::{ConfigManager, PipelineConfig};
use crate::db::{init_schema, open_sqlite_connection};
use crate::importer::blob_store::{BlobStore, LocalFileStore};
use crate::importer::classifier::RecordClassifier;
use crate::importer::pipeline::ImportPipeline;
use crate::refresh::{SqliteViewRefresher, ViewRefreshTrigger};
use crate::repository::{
    SqliteBranchRepository, SqliteImportJobRepository, SqliteLedgerEntryRepository,
};
use crate::scheduler::{ContinuationScheduler, ImportWorker, SqliteContinuationQueue};

/// 工作器单轮最多并发处理的任务数
const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// 应用状态
///
/// 所有组件共享同一个数据库连接
pub struct AppState {
    /// 数据库路径（内存库为 ":memory:"）
    pub db_path: String,

    /// 生效的管线配置
    pub config: PipelineConfig,

    /// 导入任务API
    pub import_api: Arc<ImportApi>,

    /// 导入管线（续传入口）
    pub pipeline: Arc<ImportPipeline>,

    /// 续传队列
    pub queue: Arc<SqliteContinuationQueue>,

    /// 续传工作器
    pub worker: Arc<ImportWorker>,

    /// 共享连接
    pub conn: Arc<Mutex<Connection>>,
}

impl AppState {
    /// 创建新的AppState实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    ///
    /// # 返回
    /// - Ok(AppState): 应用状态实例（表结构已初始化，配置已从 config_kv 加载）
    /// - Err(String): 初始化错误
    pub fn new(db_path: String) -> Result<Self, String> {
        tracing::info!("初始化AppState，数据库路径: {}", db_path);

        let conn = open_sqlite_connection(&db_path).map_err(|e| format!("无法打开数据库: {}", e))?;
        init_schema(&conn).map_err(|e| format!("表结构初始化失败: {}", e))?;
        let conn = Arc::new(Mutex::new(conn));

        let config = ConfigManager::from_connection(conn.clone())
            .and_then(|manager| manager.load_pipeline_config())
            .map_err(|e| format!("配置加载失败: {}", e))?;

        Ok(Self::assemble(db_path, conn, Arc::new(LocalFileStore::new()), config))
    }

    /// 使用已初始化的连接与指定存储装配（测试与嵌入场景）
    pub fn assemble(
        db_path: String,
        conn: Arc<Mutex<Connection>>,
        store: Arc<dyn BlobStore>,
        config: PipelineConfig,
    ) -> Self {
        // ==========================================
        // 初始化Repository层
        // ==========================================
        let jobs = Arc::new(SqliteImportJobRepository::new(conn.clone()));
        let ledger = Arc::new(SqliteLedgerEntryRepository::new(conn.clone()));
        let branches = Arc::new(SqliteBranchRepository::new(conn.clone()));
        let queue = Arc::new(SqliteContinuationQueue::new(conn.clone()));

        // ==========================================
        // 调度与刷新
        // ==========================================
        let scheduler = Arc::new(ContinuationScheduler::new(queue.clone(), jobs.clone(), &config));
        let refresh = Arc::new(ViewRefreshTrigger::new(
            Arc::new(SqliteViewRefresher::new(conn.clone())),
            config.refresh_timeout(),
        ));

        // ==========================================
        // 管线 / 工作器 / API
        // ==========================================
        let pipeline = Arc::new(ImportPipeline::new(
            jobs.clone(),
            ledger,
            branches,
            store.clone(),
            RecordClassifier::default(),
            scheduler.clone(),
            refresh,
            config.clone(),
        ));
        let worker = Arc::new(ImportWorker::new(
            queue.clone(),
            pipeline.clone(),
            DEFAULT_WORKER_CONCURRENCY,
        ));
        let import_api = Arc::new(ImportApi::new(
            jobs,
            store,
            scheduler,
            queue.clone(),
            config.clone(),
        ));

        tracing::info!("AppState初始化完成");

        Self {
            db_path,
            config,
            import_api,
            pipeline,
            queue,
            worker,
            conn,
        }
    }
}

/// 获取默认数据库路径
///
/// 优先使用环境变量 SPED_IMPORT_DB_PATH，其次为用户数据目录
pub fn get_default_db_path() -> String {
    use std::path::PathBuf;

    if let Ok(path) = std::env::var("SPED_IMPORT_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./sped_ledger_import.db");
    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("sped-ledger-import");
        // 目录创建失败时回退到当前目录
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("sped_ledger_import.db");
        }
    }

    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_default_db_path() {
        let path = get_default_db_path();
        assert!(!path.is_empty());
        assert!(path.ends_with(".db"));
    }

    #[test]
    fn test_new_initializes_schema_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("app.db").to_string_lossy().to_string();
        let state = AppState::new(db_path).unwrap();
        assert_eq!(state.config, PipelineConfig::default());
        assert_eq!(state.queue.stats().unwrap().pending_count, 0);
    }
}
