// ==========================================
// SPED 账簿导入系统 - 核心库
// ==========================================
// 技术栈: Rust + Tokio + SQLite
// 系统定位: 大文件分块导入管线（单次调用有硬性时间预算）
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 导入层 - 头部提取 / 分块解析 / 分类 / 批量落库
pub mod importer;

// 调度层 - 续传调度 / 持久化队列 / 工作器
pub mod scheduler;

// 视图刷新 - 下游汇总
pub mod refresh;

// 配置层 - 管线参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA/建表）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 受理 / 状态查询 / 取消
pub mod api;

// 应用层 - 组件装配
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

pub use domain::types::{FailureKind, ImportScope, JobStatus, LedgerCategory, TrailerPolicy};
pub use domain::{Branch, CategoryCounts, FiscalRecordLine, ImportJob, LedgerEntry, LedgerHeader};

pub use config::{ConfigManager, PipelineConfig};
pub use importer::{ImportError, ImportPipeline, ImportResult, InvocationOutcome, RecordClassifier};
pub use scheduler::{ContinuationScheduler, ImportWorker, SqliteContinuationQueue};
pub use api::{ImportApi, IntakeRequest, JobStatusView};
pub use app::AppState;

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "SPED 账簿导入系统";
