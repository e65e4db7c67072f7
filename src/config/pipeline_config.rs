// ==========================================
// SPED 账簿导入系统 - 管线参数
// ==========================================
// 职责: 单次调用预算 / 批量大小 / 重试上限 / 退避边界
// 约束: 构造后不可变；任务创建时序列化为快照
// ==========================================

use crate::domain::types::TrailerPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // ===== 读取 =====
    pub header_probe_bytes: u64,
    pub read_chunk_bytes: u64,
    pub max_line_bytes: usize,

    // ===== 单次调用预算 =====
    pub chunk_max_lines: u64,
    pub invocation_budget_ms: u64,
    pub deadline_margin_ms: u64,
    pub lease_grace_ms: u64,

    // ===== 落库 / 检查点 =====
    pub batch_size: usize,
    pub progress_interval_lines: u64,

    // ===== 调度 =====
    pub continuation_delay_ms: u64,
    pub max_dispatch_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_persist_failures: u32,

    // ===== 下游 =====
    pub refresh_timeout_ms: u64,
    pub trailer_policy: TrailerPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            header_probe_bytes: 16 * 1024,
            read_chunk_bytes: 256 * 1024,
            max_line_bytes: 64 * 1024,
            chunk_max_lines: 50_000,
            invocation_budget_ms: 50_000,
            deadline_margin_ms: 5_000,
            lease_grace_ms: 30_000,
            batch_size: 500,
            progress_interval_lines: 5_000,
            continuation_delay_ms: 250,
            max_dispatch_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_persist_failures: 5,
            refresh_timeout_ms: 10_000,
            trailer_policy: TrailerPolicy::Warn,
        }
    }
}

impl PipelineConfig {
    /// 校验参数组合
    ///
    /// # 返回
    /// - Ok(()): 参数可用
    /// - Err(String): 第一个不合法项的说明
    pub fn validate(&self) -> Result<(), String> {
        if self.header_probe_bytes == 0 {
            return Err("header_probe_bytes 必须大于 0".to_string());
        }
        if self.read_chunk_bytes == 0 {
            return Err("read_chunk_bytes 必须大于 0".to_string());
        }
        if self.max_line_bytes == 0 {
            return Err("max_line_bytes 必须大于 0".to_string());
        }
        if self.chunk_max_lines == 0 {
            return Err("chunk_max_lines 必须大于 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size 必须大于 0".to_string());
        }
        if self.progress_interval_lines == 0 {
            return Err("progress_interval_lines 必须大于 0".to_string());
        }
        if self.deadline_margin_ms >= self.invocation_budget_ms {
            return Err(format!(
                "deadline_margin_ms({}) 必须小于 invocation_budget_ms({})",
                self.deadline_margin_ms, self.invocation_budget_ms
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(format!(
                "backoff_base_ms({}) 不能大于 backoff_max_ms({})",
                self.backoff_base_ms, self.backoff_max_ms
            ));
        }
        Ok(())
    }

    /// 单次调用的有效解析时间（预算减去收尾余量）
    pub fn effective_budget(&self) -> Duration {
        Duration::from_millis(self.invocation_budget_ms.saturating_sub(self.deadline_margin_ms))
    }

    /// 认领租约时长（整个预算 + 宽限）
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.invocation_budget_ms.saturating_add(self.lease_grace_ms))
    }

    pub fn continuation_delay(&self) -> Duration {
        Duration::from_millis(self.continuation_delay_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn to_snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert_eq!(PipelineConfig::default().effective_budget(), Duration::from_secs(45));
    }

    #[test]
    fn test_margin_must_fit_in_budget() {
        let cfg = PipelineConfig {
            invocation_budget_ms: 1_000,
            deadline_margin_ms: 1_000,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_snapshot_accepts_partial_json() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{"batch_size": 7}"#).unwrap();
        assert_eq!(cfg.batch_size, 7);
        assert_eq!(cfg.chunk_max_lines, 50_000);
        assert_eq!(cfg.trailer_policy, TrailerPolicy::Warn);
    }
}
