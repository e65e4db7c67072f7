// ==========================================
// SPED 账簿导入系统 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型
// 红线: 不含数据访问逻辑，不含解析逻辑
// ==========================================

pub mod branch;
pub mod import_job;
pub mod ledger;
pub mod types;

// 重导出核心类型
pub use branch::Branch;
pub use import_job::{CategoryCounts, ImportJob, JobCheckpoint, ParentContext};
pub use ledger::{FiscalRecordLine, LedgerEntry, LedgerHeader, LedgerLayout, Participant, RecordKind};
pub use types::{FailureKind, ImportScope, JobStatus, LedgerCategory, TrailerPolicy};
