// ==========================================
// SPED 账簿导入系统 - 头记录提取
// ==========================================
// 职责: 只读取文件前缀，定位 0000 记录，识别版式，
//       解析账期与纳税人识别号
// 版式:
// - EFD ICMS/IPI:     |0000|COD_VER|COD_FIN|DT_INI|DT_FIN|NOME|CNPJ|CPF|UF|...
// - EFD Contribuições:|0000|COD_VER|TIPO_ESCRIT|IND_SIT_ESP|NUM_REC_ANT|DT_INI|DT_FIN|NOME|CNPJ|UF|...
// ==========================================

use crate::domain::ledger::{FiscalRecordLine, LedgerHeader, LedgerLayout};
use crate::importer::blob_store::BlobStore;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::line_parser::{parse_date, ChunkedLineReader, ReaderLimits};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::instrument;

/// 字段位置（REG 为位置 1）
struct HeaderPositions {
    dt_ini: usize,
    dt_fin: usize,
    nome: usize,
    cnpj: usize,
    cpf: Option<usize>,
    uf: usize,
}

const ICMS_IPI: HeaderPositions = HeaderPositions {
    dt_ini: 4,
    dt_fin: 5,
    nome: 6,
    cnpj: 7,
    cpf: Some(8),
    uf: 9,
};

const CONTRIBUICOES: HeaderPositions = HeaderPositions {
    dt_ini: 6,
    dt_fin: 7,
    nome: 8,
    cnpj: 9,
    cpf: None,
    uf: 10,
};

pub struct HeaderExtractor {
    store: Arc<dyn BlobStore>,
    probe_bytes: u64,
    max_line_bytes: usize,
}

impl HeaderExtractor {
    pub fn new(store: Arc<dyn BlobStore>, probe_bytes: u64, max_line_bytes: usize) -> Self {
        Self {
            store,
            probe_bytes,
            max_line_bytes,
        }
    }

    /// 从文件前缀提取账簿头
    ///
    /// # 返回
    /// - Ok(LedgerHeader): 解析成功
    /// - Err(HeaderNotFound): 前缀内无 0000 记录
    /// - Err(InvalidTaxpayerId / MalformedRecord): 字段不合法
    #[instrument(skip(self), fields(probe = self.probe_bytes))]
    pub async fn extract(&self, path: &str) -> ImportResult<LedgerHeader> {
        let limits = ReaderLimits {
            read_chunk_bytes: self.probe_bytes,
            max_line_bytes: self.max_line_bytes,
            read_limit: Some(self.probe_bytes),
        };
        let mut reader = ChunkedLineReader::new(self.store.clone(), path, 0, 0, limits);

        while let Some(line) = reader.next_line().await? {
            if line.record_type == "0000" {
                let header = parse_header(&line)?;
                tracing::info!(
                    taxpayer_id = %header.taxpayer_id,
                    period_start = %header.period_start,
                    period_end = %header.period_end,
                    layout = ?header.layout,
                    "账簿头解析完成"
                );
                return Ok(header);
            }
        }

        Err(ImportError::HeaderNotFound {
            scanned_bytes: reader.cursor().min(self.probe_bytes),
        })
    }
}

/// 解析 0000 记录
pub fn parse_header(line: &FiscalRecordLine) -> ImportResult<LedgerHeader> {
    let icms_start = line.field(ICMS_IPI.dt_ini).map(parse_date);
    let (layout, pos) = match icms_start {
        Some(Ok(_)) => (LedgerLayout::IcmsIpi, &ICMS_IPI),
        _ => (LedgerLayout::Contribuicoes, &CONTRIBUICOES),
    };

    let date_at = |position: usize, name: &str| -> ImportResult<NaiveDate> {
        let raw = line.field(position).ok_or_else(|| ImportError::MalformedRecord {
            line: line.line_no,
            message: format!("0000 缺少 {}", name),
        })?;
        parse_date(raw).map_err(|message| ImportError::MalformedRecord {
            line: line.line_no,
            message,
        })
    };

    let period_start = date_at(pos.dt_ini, "DT_INI")?;
    let period_end = date_at(pos.dt_fin, "DT_FIN")?;
    if period_end < period_start {
        return Err(ImportError::MalformedRecord {
            line: line.line_no,
            message: format!("账期结束早于开始: {} > {}", period_start, period_end),
        });
    }

    let taxpayer_id = match line.field(pos.cnpj) {
        Some(cnpj) => normalize_cnpj(cnpj)?,
        None => match pos.cpf.and_then(|p| line.field(p)) {
            Some(cpf) => normalize_cpf(cpf)?,
            None => {
                return Err(ImportError::InvalidTaxpayerId(
                    "CNPJ 与 CPF 均为空".to_string(),
                ))
            }
        },
    };

    Ok(LedgerHeader {
        taxpayer_id,
        registrant_name: line.field(pos.nome).unwrap_or_default().to_string(),
        period_start,
        period_end,
        layout,
        state: line.field(pos.uf).map(|s| s.to_uppercase()),
    })
}

fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// 模 11 校验位
fn mod11_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let rem = sum % 11;
    if rem < 2 {
        0
    } else {
        11 - rem
    }
}

fn all_same(digits: &[u32]) -> bool {
    digits.windows(2).all(|w| w[0] == w[1])
}

/// 规范化并校验 CNPJ（14 位）
pub fn normalize_cnpj(raw: &str) -> ImportResult<String> {
    let s = digits_only(raw);
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 14 || all_same(&digits) {
        return Err(ImportError::InvalidTaxpayerId(format!("CNPJ 格式错误: {}", raw)));
    }
    let w1 = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    let w2 = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    if mod11_digit(&digits[..12], &w1) != digits[12] || mod11_digit(&digits[..13], &w2) != digits[13] {
        return Err(ImportError::InvalidTaxpayerId(format!("CNPJ 校验位错误: {}", raw)));
    }
    Ok(s)
}

/// 规范化并校验 CPF（11 位）
pub fn normalize_cpf(raw: &str) -> ImportResult<String> {
    let s = digits_only(raw);
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 || all_same(&digits) {
        return Err(ImportError::InvalidTaxpayerId(format!("CPF 格式错误: {}", raw)));
    }
    let w1 = [10, 9, 8, 7, 6, 5, 4, 3, 2];
    let w2 = [11, 10, 9, 8, 7, 6, 5, 4, 3, 2];
    if mod11_digit(&digits[..9], &w1) != digits[9] || mod11_digit(&digits[..10], &w2) != digits[10] {
        return Err(ImportError::InvalidTaxpayerId(format!("CPF 校验位错误: {}", raw)));
    }
    Ok(s)
}
