// ==========================================
// SPED 账簿导入系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口，屏蔽数据库细节
// 约束: 所有查询使用参数化，防止 SQL 注入
//       （表名/列名仅来自 LedgerCategory 的静态映射）
// ==========================================

pub mod branch_repo;
pub mod error;
pub mod import_job_repo;
pub mod ledger_entry_repo;
pub mod sql_utils;

// 重导出核心仓储
pub use branch_repo::{BranchRepository, SqliteBranchRepository};
pub use error::{RepositoryError, RepositoryResult};
pub use import_job_repo::{ImportJobRepository, SqliteImportJobRepository};
pub use ledger_entry_repo::{LedgerEntryRepository, SqliteLedgerEntryRepository};
