// ==========================================
// SPED 账簿导入系统 - 记录字段映射
// ==========================================
// 职责: 解析行 → 明细行 / 发票头上下文 / 参与方
// 字段位置按记录布局固定（REG 为位置 1）
// ==========================================

use crate::domain::import_job::ParentContext;
use crate::domain::ledger::{FiscalRecordLine, LedgerEntry, Participant};
use crate::domain::types::LedgerCategory;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::line_parser::{parse_date, parse_decimal};
use chrono::NaiveDate;

/// 单据类记录的字段位置
struct DocumentLayout {
    participant: usize,
    number: usize,
    date: usize,
    amount: usize,
    /// 税额字段（多个时求和）
    tax: &'static [usize],
}

const C100: DocumentLayout = DocumentLayout {
    participant: 4,
    number: 8,
    date: 10,
    amount: 12,
    tax: &[22],
};

const C500: DocumentLayout = DocumentLayout {
    participant: 4,
    number: 10,
    date: 11,
    amount: 13,
    tax: &[20],
};

const D100: DocumentLayout = DocumentLayout {
    participant: 4,
    number: 9,
    date: 11,
    amount: 15,
    tax: &[20],
};

// PIS + COFINS
const A100: DocumentLayout = DocumentLayout {
    participant: 4,
    number: 8,
    date: 10,
    amount: 12,
    tax: &[16, 18],
};

// C170 明细
const C170_ITEM_CODE: usize = 3;
const C170_DESCRIPTION: usize = 4;
const C170_AMOUNT: usize = 7;
const C170_CFOP: usize = 11;
const C170_TAX: usize = 15;

const C100_OPERATION: usize = 2;

// 0150 参与方
const P0150_CODE: usize = 2;
const P0150_NAME: usize = 3;
const P0150_CNPJ: usize = 5;
const P0150_CPF: usize = 6;

/// 明细行的归属信息
#[derive(Debug, Clone, Copy)]
pub struct EntryOwner<'a> {
    pub job_id: &'a str,
    pub branch_id: &'a str,
    pub period_start: NaiveDate,
}

fn amount_at(line: &FiscalRecordLine, position: usize) -> ImportResult<f64> {
    match line.field(position) {
        Some(raw) => parse_decimal(raw).map_err(|message| ImportError::MalformedRecord {
            line: line.line_no,
            message: format!("{} 字段 {}: {}", line.record_type, position, message),
        }),
        None => Ok(0.0),
    }
}

fn date_at(line: &FiscalRecordLine, position: usize) -> ImportResult<Option<NaiveDate>> {
    line.field(position)
        .map(|raw| {
            parse_date(raw).map_err(|message| ImportError::MalformedRecord {
                line: line.line_no,
                message: format!("{} 字段 {}: {}", line.record_type, position, message),
            })
        })
        .transpose()
}

fn text_at(line: &FiscalRecordLine, position: usize) -> Option<String> {
    line.field(position).map(str::to_string)
}

fn document_layout(record_type: &str) -> Option<&'static DocumentLayout> {
    match record_type {
        "C100" => Some(&C100),
        "C500" => Some(&C500),
        "D100" => Some(&D100),
        "A100" => Some(&A100),
        _ => None,
    }
}

/// 从 C100 提取发票头上下文（供后续 C170 继承）
pub fn parent_from_c100(line: &FiscalRecordLine) -> ImportResult<ParentContext> {
    Ok(ParentContext {
        document_number: text_at(line, C100.number),
        document_date: date_at(line, C100.date)?,
        participant_code: text_at(line, C100.participant),
        operation: text_at(line, C100_OPERATION),
        source_line: line.line_no,
    })
}

/// 从 0150 提取参与方
pub fn participant_from_0150(line: &FiscalRecordLine) -> ImportResult<Participant> {
    let code = text_at(line, P0150_CODE).ok_or_else(|| ImportError::MalformedRecord {
        line: line.line_no,
        message: "0150 缺少 COD_PART".to_string(),
    })?;
    Ok(Participant {
        code,
        name: text_at(line, P0150_NAME).unwrap_or_default(),
        taxpayer_id: text_at(line, P0150_CNPJ).or_else(|| text_at(line, P0150_CPF)),
    })
}

/// 映射一条明细行
///
/// # 参数
/// - line: 已分类为落库的行
/// - category: 分类结果
/// - parent: 当前打开的 C100 上下文（C170 必需）
/// - owner: 任务/分支/账期
pub fn map_entry(
    line: &FiscalRecordLine,
    category: LedgerCategory,
    parent: Option<&ParentContext>,
    owner: EntryOwner<'_>,
) -> ImportResult<LedgerEntry> {
    let base = LedgerEntry {
        branch_id: owner.branch_id.to_string(),
        period_start: owner.period_start,
        source_line: line.line_no,
        job_id: owner.job_id.to_string(),
        category,
        record_type: line.record_type.clone(),
        participant_code: None,
        document_number: None,
        document_date: None,
        cfop: None,
        item_code: None,
        description: None,
        amount: 0.0,
        tax_amount: 0.0,
    };

    if line.record_type == "C170" {
        let parent = parent.ok_or_else(|| ImportError::MalformedRecord {
            line: line.line_no,
            message: "C170 之前缺少 C100".to_string(),
        })?;
        return Ok(LedgerEntry {
            participant_code: parent.participant_code.clone(),
            document_number: parent.document_number.clone(),
            document_date: parent.document_date,
            cfop: text_at(line, C170_CFOP),
            item_code: text_at(line, C170_ITEM_CODE),
            description: text_at(line, C170_DESCRIPTION),
            amount: amount_at(line, C170_AMOUNT)?,
            tax_amount: amount_at(line, C170_TAX)?,
            ..base
        });
    }

    let layout = document_layout(&line.record_type).ok_or_else(|| ImportError::MalformedRecord {
        line: line.line_no,
        message: format!("记录类型 {} 无字段映射", line.record_type),
    })?;

    let mut tax = 0.0;
    for position in layout.tax {
        tax += amount_at(line, *position)?;
    }

    Ok(LedgerEntry {
        participant_code: text_at(line, layout.participant),
        document_number: text_at(line, layout.number),
        document_date: date_at(line, layout.date)?,
        amount: amount_at(line, layout.amount)?,
        tax_amount: tax,
        ..base
    })
}
