// ==========================================
// SPED 账簿导入系统 - 仓储层公共转换
// ==========================================
// 时间戳统一为 UTC RFC3339（毫秒、Z 结尾），定长可按字符串比较
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{DateTime, SecondsFormat, Utc};

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(field: &str, raw: &str) -> RepositoryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::FieldValueError {
            field: field.to_string(),
            message: format!("{}: {}", raw, e),
        })
}

pub fn to_i64(field: &str, value: u64) -> RepositoryResult<i64> {
    i64::try_from(value).map_err(|_| RepositoryError::FieldValueError {
        field: field.to_string(),
        message: format!("数值越界: {}", value),
    })
}

pub fn to_u64(field: &str, value: i64) -> RepositoryResult<u64> {
    u64::try_from(value).map_err(|_| RepositoryError::FieldValueError {
        field: field.to_string(),
        message: format!("不允许负数: {}", value),
    })
}
