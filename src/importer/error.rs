// ==========================================
// SPED 账簿导入系统 - 导入模块错误类型
// ==========================================
// 工具: thiserror 派生宏
// 分类: ErrorKind 决定管线的失败处理策略
// ==========================================

use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 导入模块错误类型
#[derive(Error, Debug)]
pub enum ImportError {
    // ===== 校验错误（立即失败）=====
    #[error("未找到 0000 头记录（已扫描 {scanned_bytes} 字节）")]
    HeaderNotFound { scanned_bytes: u64 },

    #[error("纳税人识别号无效: {0}")]
    InvalidTaxpayerId(String),

    #[error("记录格式错误 (行 {line}): {message}")]
    MalformedRecord { line: u64, message: String },

    #[error("尾记录行数不一致: 声明 {declared}，实际 {actual}")]
    TrailerMismatch { declared: u64, actual: u64 },

    #[error("文件不存在: {0}")]
    FileNotFound(String),

    // ===== 存储错误（退避后续传，超过上限失败）=====
    #[error("持久化失败: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("文件读取失败: {0}")]
    BlobRead(String),

    // ===== 其他 =====
    #[error("任务不存在: {0}")]
    JobNotFound(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 立即失败，不重试
    Validation,
    /// 游标不推进，退避后续传
    Storage,
    /// 任务已被取消或终止，本次调用放弃
    Aborted,
    /// 不变量破坏，立即失败
    Internal,
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::HeaderNotFound { .. }
            | ImportError::InvalidTaxpayerId(_)
            | ImportError::MalformedRecord { .. }
            | ImportError::TrailerMismatch { .. }
            | ImportError::FileNotFound(_) => ErrorKind::Validation,
            ImportError::Persistence(RepositoryError::JobNotActive(_)) => ErrorKind::Aborted,
            ImportError::Persistence(_) | ImportError::BlobRead(_) => ErrorKind::Storage,
            ImportError::JobNotFound(_) | ImportError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ImportError::FileNotFound(err.to_string()),
            _ => ImportError::BlobRead(err.to_string()),
        }
    }
}

/// Result 类型别名
pub type ImportResult<T> = Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ImportError::HeaderNotFound { scanned_bytes: 10 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ImportError::from(RepositoryError::LockError("x".into())).kind(),
            ErrorKind::Storage
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(ImportError::from(io).kind(), ErrorKind::Validation);
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr");
        assert_eq!(ImportError::from(io).kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_inactive_job_and_internal_are_not_storage() {
        assert_eq!(
            ImportError::from(RepositoryError::JobNotActive("J1".into())).kind(),
            ErrorKind::Aborted
        );
        assert_eq!(
            ImportError::Internal("认领后的任务状态异常".into()).kind(),
            ErrorKind::Internal
        );
    }
}
