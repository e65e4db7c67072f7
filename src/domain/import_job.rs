// ==========================================
// SPED 账簿导入系统 - 导入任务实体
// ==========================================
// 职责: 单个导入任务的持久化状态（游标/计数/状态/失败信息）
// 红线: 只由管线调用修改（外部取消除外），终态后不可变
// ==========================================

use crate::domain::types::{FailureKind, ImportScope, JobStatus, LedgerCategory};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// CategoryCounts - 分类行数
// ==========================================
// 只增不减；按实际插入行数累加（重放不重复计数）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub goods: i64,
    pub services: i64,
    pub energy_water: i64,
    pub freight: i64,
    pub fixed_asset: i64,
    pub usage_consumption: i64,
}

impl CategoryCounts {
    pub fn get(&self, category: LedgerCategory) -> i64 {
        match category {
            LedgerCategory::Goods => self.goods,
            LedgerCategory::Services => self.services,
            LedgerCategory::EnergyWater => self.energy_water,
            LedgerCategory::Freight => self.freight,
            LedgerCategory::FixedAsset => self.fixed_asset,
            LedgerCategory::UsageConsumption => self.usage_consumption,
        }
    }

    pub fn add(&mut self, category: LedgerCategory, delta: i64) {
        let slot = match category {
            LedgerCategory::Goods => &mut self.goods,
            LedgerCategory::Services => &mut self.services,
            LedgerCategory::EnergyWater => &mut self.energy_water,
            LedgerCategory::Freight => &mut self.freight,
            LedgerCategory::FixedAsset => &mut self.fixed_asset,
            LedgerCategory::UsageConsumption => &mut self.usage_consumption,
        };
        *slot += delta;
    }

    pub fn total(&self) -> i64 {
        LedgerCategory::ALL.iter().map(|c| self.get(*c)).sum()
    }
}

// ==========================================
// ParentContext - 游标处打开的发票头
// ==========================================
// C170 明细依赖前一条 C100 的单据信息；续传时需从任务记录恢复
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentContext {
    pub document_number: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub participant_code: Option<String>,
    pub operation: Option<String>, // IND_OPER: 0=进项 1=销项
    pub source_line: u64,
}

// ==========================================
// JobCheckpoint - 一次检查点写入的内容
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct JobCheckpoint {
    pub resume_cursor: u64,
    pub processed_lines: u64,
    pub progress: u8,
    pub parent_context: Option<ParentContext>,
    pub status_message: String,
}

// ==========================================
// ImportJob - 导入任务
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: String,
    pub company_id: String,
    pub branch_id: Option<String>, // 头部提取前未知

    // ===== 文件描述 =====
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,

    // ===== 导入参数 =====
    pub scope: ImportScope,
    pub line_limit: Option<u64>,

    // ===== 状态 =====
    pub status: JobStatus,
    pub progress: u8,
    pub processed_lines: u64,
    pub total_lines: Option<u64>,
    pub counts: CategoryCounts,

    // ===== 续传 =====
    pub resume_cursor: u64,
    pub parent_context: Option<ParentContext>,

    // ===== 头部信息 =====
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,

    // ===== 失败/重试 =====
    pub retry_count: u32,
    pub persist_failures: u32,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,

    // ===== 认领租约 =====
    pub claim_token: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,

    pub config_snapshot_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    /// 创建待处理任务
    ///
    /// # 参数
    /// - company_id: 所属公司
    /// - file_path / file_name / file_size: 文件描述
    pub fn new_pending(
        company_id: impl Into<String>,
        file_path: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            company_id: company_id.into(),
            branch_id: None,
            file_path: file_path.into(),
            file_name: file_name.into(),
            file_size,
            scope: ImportScope::Full,
            line_limit: None,
            status: JobStatus::Pending,
            progress: 0,
            processed_lines: 0,
            total_lines: None,
            counts: CategoryCounts::default(),
            resume_cursor: 0,
            parent_context: None,
            period_start: None,
            period_end: None,
            retry_count: 0,
            persist_failures: 0,
            status_message: Some("等待处理".to_string()),
            error_message: None,
            failure_kind: None,
            claim_token: None,
            claimed_until: None,
            config_snapshot_json: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 是否已达到预览行数上限
    pub fn line_limit_reached(&self, processed_lines: u64) -> bool {
        self.line_limit
            .map(|limit| processed_lines >= limit)
            .unwrap_or(false)
    }
}
