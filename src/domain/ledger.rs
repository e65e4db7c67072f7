// ==========================================
// SPED 账簿导入系统 - 账簿记录模型
// ==========================================
// 职责: 解析行（瞬态）/ 账簿头 / 参与方 / 落库明细行
// 格式: |REG|F1|F2|...|  竖线分隔，首尾各一个竖线
// ==========================================

use crate::domain::types::LedgerCategory;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ==========================================
// RecordKind - 已识别的记录类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Header,       // 0000
    Opening,      // 0005
    Participant,  // 0150
    GoodsInvoice, // C100
    GoodsItem,    // C170
    EnergyWater,  // C500
    Freight,      // D100
    Service,      // A100
    Trailer,      // 9999
    Structural,   // 其他（块开闭、汇总等），跳过
}

impl RecordKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "0000" => RecordKind::Header,
            "0005" => RecordKind::Opening,
            "0150" => RecordKind::Participant,
            "C100" => RecordKind::GoodsInvoice,
            "C170" => RecordKind::GoodsItem,
            "C500" => RecordKind::EnergyWater,
            "D100" => RecordKind::Freight,
            "A100" => RecordKind::Service,
            "9999" => RecordKind::Trailer,
            _ => RecordKind::Structural,
        }
    }
}

// ==========================================
// FiscalRecordLine - 单行解析结果（不落库）
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiscalRecordLine {
    pub record_type: String,
    /// fields[0] = REG，其余按字段顺序
    pub fields: Vec<String>,
    /// 行首字节偏移
    pub byte_offset: u64,
    /// 下一行起始偏移（续传游标）
    pub end_offset: u64,
    /// 行序号（从 1 开始，跨调用连续）
    pub line_no: u64,
}

impl FiscalRecordLine {
    /// 按 1 起始的字段位置取值（REG 为位置 1）；空字段返回 None
    pub fn field(&self, position: usize) -> Option<&str> {
        if position == 0 {
            return None;
        }
        self.fields
            .get(position - 1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn kind(&self) -> RecordKind {
        RecordKind::from_code(&self.record_type)
    }

    /// 所在块（记录类型首字母）
    pub fn block(&self) -> Option<char> {
        self.record_type.chars().next()
    }
}

// ==========================================
// LedgerLayout - 账簿版式
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerLayout {
    IcmsIpi,      // EFD ICMS/IPI
    Contribuicoes, // EFD Contribuições
}

// ==========================================
// LedgerHeader - 0000 记录解析结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    /// 规范化纳税人识别号（CNPJ 14 位 / CPF 11 位）
    pub taxpayer_id: String,
    pub registrant_name: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub layout: LedgerLayout,
    pub state: Option<String>,
}

// ==========================================
// Participant - 0150 参与方
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub code: String,
    pub name: String,
    pub taxpayer_id: Option<String>,
}

// ==========================================
// LedgerEntry - 落库明细行
// ==========================================
// 自然键: (branch_id, period_start, source_line)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub branch_id: String,
    pub period_start: NaiveDate,
    pub source_line: u64,
    pub job_id: String,
    pub category: LedgerCategory,
    pub record_type: String,
    pub participant_code: Option<String>,
    pub document_number: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub cfop: Option<String>,
    pub item_code: Option<String>,
    pub description: Option<String>,
    pub amount: f64,
    pub tax_amount: f64,
}
