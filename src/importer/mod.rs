// ==========================================
// SPED 账簿导入系统 - 导入层
// ==========================================
// 职责: 大文件分块导入（头部提取 / 可续传解析 / 分类 / 批量落库 / 进度）
// 支持: EFD ICMS/IPI 与 EFD Contribuições 文本账簿
// ==========================================

// 模块声明
pub mod batch_persister;
pub mod blob_store;
pub mod classifier;
pub mod error;
pub mod header_extractor;
pub mod line_parser;
pub mod pipeline;
pub mod progress;
pub mod record_mapper;

// 重导出核心类型
pub use batch_persister::BatchPersister;
pub use blob_store::{BlobStore, InMemoryBlobStore, LocalFileStore};
pub use classifier::{Classification, ClassificationRule, RecordClassifier, DEFAULT_RULES};
pub use error::{ErrorKind, ImportError, ImportResult};
pub use header_extractor::HeaderExtractor;
pub use line_parser::{ChunkedLineReader, ReaderLimits};
pub use pipeline::{ImportPipeline, InvocationOutcome};
pub use progress::ProgressReporter;
