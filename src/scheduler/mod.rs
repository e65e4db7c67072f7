// ==========================================
// SPED 账簿导入系统 - 调度层
// ==========================================
// 职责: 续传投递（退避重试）/ 持久化续传队列 / 工作器
// ==========================================

pub mod backoff;
pub mod continuation_queue;
pub mod continuation_scheduler;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use continuation_queue::{
    ContinuationDispatcher, ContinuationStatus, ContinuationTask, DispatchError, QueueStats,
    SqliteContinuationQueue,
};
pub use continuation_scheduler::{ContinuationScheduler, ScheduleOutcome, TRANSIENT_FAILURE_PREFIX};
pub use worker::ImportWorker;
