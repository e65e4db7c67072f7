// ==========================================
// SPED 账簿导入系统 - 领域类型定义
// ==========================================
// 职责: 任务状态机 / 分类目标 / 导入范围 / 尾记录策略
// 序列化格式: snake_case（与数据库一致）
// ==========================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ==========================================
// 导入任务状态 (Job Status)
// ==========================================
// 状态机: pending → processing → {processing(循环), refreshing_views} → completed
// failed / cancelled 可由任意非终态到达
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,         // 已受理，尚未开始解析
    Processing,      // 解析中（可能跨越多次调用）
    RefreshingViews, // 文件已读完，正在刷新下游汇总
    Completed,       // 完成（终态）
    Failed,          // 失败（终态）
    Cancelled,       // 外部取消（终态）
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::RefreshingViews => "refreshing_views",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "refreshing_views" => Some(JobStatus::RefreshingViews),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// 是否为终态（终态任务不再被任何调用修改）
    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => true,
            JobStatus::Pending | JobStatus::Processing | JobStatus::RefreshingViews => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 失败类别 (Failure Kind)
// ==========================================
// 用于区分校验失败 / 调度暂时性失败 / 持久化失败 / 内部不变量破坏
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transient,
    Persistence,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Transient => "transient",
            FailureKind::Persistence => "persistence",
            FailureKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(FailureKind::Validation),
            "transient" => Some(FailureKind::Transient),
            "persistence" => Some(FailureKind::Persistence),
            "internal" => Some(FailureKind::Internal),
            _ => None,
        }
    }
}

// ==========================================
// 分类目标 (Ledger Category)
// ==========================================
// 每个类别对应一张明细表 + 任务上的一个计数列
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerCategory {
    Goods,            // 商品发票（C100）
    Services,         // 服务发票（A100）
    EnergyWater,      // 能源/水费（C500）
    Freight,          // 运输单据（D100）
    FixedAsset,       // 固定资产明细（C170 + 资产类 CFOP）
    UsageConsumption, // 使用与消耗明细（C170 + 消耗类 CFOP）
}

impl LedgerCategory {
    pub const ALL: [LedgerCategory; 6] = [
        LedgerCategory::Goods,
        LedgerCategory::Services,
        LedgerCategory::EnergyWater,
        LedgerCategory::Freight,
        LedgerCategory::FixedAsset,
        LedgerCategory::UsageConsumption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerCategory::Goods => "goods",
            LedgerCategory::Services => "services",
            LedgerCategory::EnergyWater => "energy_water",
            LedgerCategory::Freight => "freight",
            LedgerCategory::FixedAsset => "fixed_asset",
            LedgerCategory::UsageConsumption => "usage_consumption",
        }
    }

    /// 明细表名
    pub fn table_name(&self) -> &'static str {
        match self {
            LedgerCategory::Goods => "ledger_goods",
            LedgerCategory::Services => "ledger_services",
            LedgerCategory::EnergyWater => "ledger_energy_water",
            LedgerCategory::Freight => "ledger_freight",
            LedgerCategory::FixedAsset => "ledger_fixed_asset",
            LedgerCategory::UsageConsumption => "ledger_usage_consumption",
        }
    }

    /// import_job 上的计数列名
    pub fn count_column(&self) -> &'static str {
        match self {
            LedgerCategory::Goods => "goods_count",
            LedgerCategory::Services => "services_count",
            LedgerCategory::EnergyWater => "energy_water_count",
            LedgerCategory::Freight => "freight_count",
            LedgerCategory::FixedAsset => "fixed_asset_count",
            LedgerCategory::UsageConsumption => "usage_consumption_count",
        }
    }
}

impl fmt::Display for LedgerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 导入范围 (Import Scope)
// ==========================================
// Full: 全部块
// Blocks: 仅处理指定块（记录类型首字母，如 'C' / 'D' / 'A'）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportScope {
    #[default]
    Full,
    Blocks(BTreeSet<char>),
}

impl ImportScope {
    /// 记录类型是否在导入范围内
    pub fn includes(&self, record_type: &str) -> bool {
        match self {
            ImportScope::Full => true,
            ImportScope::Blocks(blocks) => record_type
                .chars()
                .next()
                .map(|c| blocks.contains(&c.to_ascii_uppercase()))
                .unwrap_or(false),
        }
    }

    /// 持久化格式: "FULL" 或 "BLOCKS:A,C"
    pub fn to_db_string(&self) -> String {
        match self {
            ImportScope::Full => "FULL".to_string(),
            ImportScope::Blocks(blocks) => {
                let list: Vec<String> = blocks.iter().map(|c| c.to_string()).collect();
                format!("BLOCKS:{}", list.join(","))
            }
        }
    }

    pub fn from_db_string(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("FULL") {
            return Some(ImportScope::Full);
        }
        let list = raw.strip_prefix("BLOCKS:")?;
        let blocks: BTreeSet<char> = list
            .split(',')
            .filter_map(|s| s.trim().chars().next())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if blocks.is_empty() {
            None
        } else {
            Some(ImportScope::Blocks(blocks))
        }
    }
}

// ==========================================
// 尾记录行数校验策略 (Trailer Policy)
// ==========================================
// Warn: 不一致时仅告警（默认）
// Strict: 不一致视为校验失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailerPolicy {
    Warn,
    Strict,
}

impl TrailerPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "warn" => Some(TrailerPolicy::Warn),
            "strict" => Some(TrailerPolicy::Strict),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip_and_terminal() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::RefreshingViews,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::RefreshingViews.is_terminal());
        assert_eq!(JobStatus::parse("PROCESSING"), None);
    }

    #[test]
    fn test_import_scope_blocks() {
        let scope = ImportScope::from_db_string("BLOCKS:c,d").unwrap();
        assert!(scope.includes("C170"));
        assert!(scope.includes("D100"));
        assert!(!scope.includes("A100"));
        assert_eq!(scope.to_db_string(), "BLOCKS:C,D");
        assert_eq!(ImportScope::from_db_string("full"), Some(ImportScope::Full));
        assert_eq!(ImportScope::from_db_string("BLOCKS:"), None);
        assert_eq!(ImportScope::default(), ImportScope::Full);
    }

    #[test]
    fn test_failure_kind_round_trip() {
        for kind in [
            FailureKind::Validation,
            FailureKind::Transient,
            FailureKind::Persistence,
            FailureKind::Internal,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_category_columns_are_distinct() {
        let mut tables: Vec<_> = LedgerCategory::ALL.iter().map(|c| c.table_name()).collect();
        tables.dedup();
        assert_eq!(tables.len(), 6);
    }
}
