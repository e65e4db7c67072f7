// ==========================================
// SPED 账簿导入系统 - 分块行解析器
// ==========================================
// 职责: 从字节游标开始按区间读取，切分完整行并分词
// 格式: |REG|F1|F2|...|  竖线分隔，CRLF/LF 均可
// 约束:
// - 只向前读取；不完整的尾部片段缓存到下次读取
// - 读到 9999 尾记录后停止（其后为数字签名）
// - 单行超过 max_line_bytes 视为结构错误
// ==========================================

use crate::domain::ledger::FiscalRecordLine;
use crate::importer::blob_store::BlobStore;
use crate::importer::error::{ImportError, ImportResult};
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::Arc;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const TRAILER_PREFIX: &[u8] = b"|9999|";

/// 读取器参数
#[derive(Debug, Clone, Copy)]
pub struct ReaderLimits {
    pub read_chunk_bytes: u64,
    pub max_line_bytes: usize,
    /// 最多读取到该绝对偏移（头部探测用）
    pub read_limit: Option<u64>,
}

// ==========================================
// ChunkedLineReader - 可续传的行读取器
// ==========================================
pub struct ChunkedLineReader {
    store: Arc<dyn BlobStore>,
    path: String,
    limits: ReaderLimits,

    next_read_offset: u64,
    /// 未消费字节；buffer[0] 位于文件偏移 buffer_offset
    buffer: Vec<u8>,
    buffer_offset: u64,
    ready: VecDeque<FiscalRecordLine>,

    /// 已产出的行序号（续传时从任务的 processed_lines 继续）
    line_ordinal: u64,
    eof: bool,
    /// 已切出尾记录，不再读取
    input_closed: bool,
    /// 文件起始处的 BOM 已判定
    bom_checked: bool,
    /// 最后一次返回的行的结束偏移
    cursor: u64,
}

impl ChunkedLineReader {
    /// 创建读取器
    ///
    /// # 参数
    /// - start_offset: 续传游标（行首偏移）
    /// - start_ordinal: 游标之前已处理的行数
    pub fn new(
        store: Arc<dyn BlobStore>,
        path: impl Into<String>,
        start_offset: u64,
        start_ordinal: u64,
        limits: ReaderLimits,
    ) -> Self {
        Self {
            store,
            path: path.into(),
            limits,
            next_read_offset: start_offset,
            buffer: Vec::new(),
            buffer_offset: start_offset,
            ready: VecDeque::new(),
            line_ordinal: start_ordinal,
            eof: false,
            input_closed: false,
            bom_checked: start_offset != 0,
            cursor: start_offset,
        }
    }

    /// 最后一次返回行之后的偏移（即下次续传的游标）
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// 已产出行数（含续传前）
    pub fn lines_read(&self) -> u64 {
        self.line_ordinal
    }

    /// 读取下一行
    ///
    /// # 返回
    /// - Ok(Some(line)): 下一条非空记录
    /// - Ok(None): 输入结束（尾记录之后或文件末尾）
    pub async fn next_line(&mut self) -> ImportResult<Option<FiscalRecordLine>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                self.cursor = line.end_offset;
                return Ok(Some(line));
            }
            if self.input_closed || (self.eof && self.buffer.is_empty()) {
                return Ok(None);
            }

            match self.buffer.iter().rposition(|b| *b == b'\n') {
                Some(last_nl) => {
                    let block: Vec<u8> = self.buffer.drain(..=last_nl).collect();
                    let base = self.buffer_offset;
                    self.buffer_offset += block.len() as u64;
                    self.tokenize_block(&block, base)?;
                }
                None if self.eof => {
                    // 末行无换行符
                    let block = std::mem::take(&mut self.buffer);
                    let base = self.buffer_offset;
                    self.buffer_offset += block.len() as u64;
                    self.tokenize_block(&block, base)?;
                }
                None => {
                    if self.buffer.len() > self.limits.max_line_bytes {
                        return Err(ImportError::MalformedRecord {
                            line: self.line_ordinal + 1,
                            message: format!(
                                "行长度超过上限 {} 字节（偏移 {}）",
                                self.limits.max_line_bytes, self.buffer_offset
                            ),
                        });
                    }
                    self.fill().await?;
                }
            }
        }
    }

    /// 读取下一个区间并追加到缓冲
    async fn fill(&mut self) -> ImportResult<()> {
        let mut len = self.limits.read_chunk_bytes;
        if let Some(limit) = self.limits.read_limit {
            len = len.min(limit.saturating_sub(self.next_read_offset));
        }
        if len == 0 {
            self.eof = true;
            return Ok(());
        }

        let bytes = self
            .store
            .read_range(&self.path, self.next_read_offset, len)
            .await
            .map_err(ImportError::from)?;

        if bytes.is_empty() {
            self.eof = true;
            return Ok(());
        }

        self.next_read_offset += bytes.len() as u64;
        self.buffer.extend_from_slice(&bytes);

        // BOM 可能被切在两次读取之间
        if !self.bom_checked
            && (self.buffer.len() >= UTF8_BOM.len() || !UTF8_BOM.starts_with(&self.buffer))
        {
            self.bom_checked = true;
            if self.buffer.starts_with(UTF8_BOM) {
                self.buffer.drain(..UTF8_BOM.len());
                self.buffer_offset += UTF8_BOM.len() as u64;
            }
        }

        tracing::trace!(
            path = %self.path,
            offset = self.next_read_offset,
            buffered = self.buffer.len(),
            "读取文件区间"
        );
        Ok(())
    }

    /// 切分完整行块并分词
    ///
    /// 非空行先规整为 LF 结尾的连续字节，再交给 csv 分词，
    /// 记录与行一一对应
    fn tokenize_block(&mut self, block: &[u8], base: u64) -> ImportResult<()> {
        let mut normalized: Vec<u8> = Vec::with_capacity(block.len());
        let mut spans: Vec<(u64, u64, bool, bool)> = Vec::new();

        let mut start = 0usize;
        while start < block.len() {
            let nl = block[start..].iter().position(|b| *b == b'\n');
            let (line_end, next_start) = match nl {
                Some(i) => (start + i, start + i + 1),
                None => (block.len(), block.len()),
            };

            let raw = trim_line(&block[start..line_end]);
            if line_end - start > self.limits.max_line_bytes {
                return Err(ImportError::MalformedRecord {
                    line: self.line_ordinal + spans.len() as u64 + 1,
                    message: format!("行长度超过上限 {} 字节", self.limits.max_line_bytes),
                });
            }

            if !raw.is_empty() {
                normalized.extend_from_slice(raw);
                normalized.push(b'\n');
                spans.push((
                    base + start as u64,
                    base + next_start as u64,
                    raw.first() == Some(&b'|'),
                    raw.last() == Some(&b'|'),
                ));
                if raw.starts_with(TRAILER_PREFIX) {
                    self.input_closed = true;
                    break;
                }
            }
            start = next_start;
        }

        if spans.is_empty() {
            return Ok(());
        }

        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'|')
            .quoting(false)
            .flexible(true)
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_reader(normalized.as_slice());

        let mut record = csv::ByteRecord::new();
        let mut idx = 0usize;
        loop {
            let more = rdr.read_byte_record(&mut record).map_err(|e| ImportError::MalformedRecord {
                line: self.line_ordinal + 1,
                message: e.to_string(),
            })?;
            if !more {
                break;
            }
            let (begin, end, lead_pipe, trail_pipe) = *spans.get(idx).ok_or_else(|| {
                ImportError::Internal(format!("分词结果多于行数（偏移 {}）", base))
            })?;
            idx += 1;
            self.line_ordinal += 1;

            let mut fields: Vec<String> = record.iter().map(decode_field).collect();
            if trail_pipe && fields.len() > 1 {
                fields.pop();
            }
            if lead_pipe && !fields.is_empty() {
                fields.remove(0);
            }

            let record_type = fields.first().map(|s| s.trim().to_string()).unwrap_or_default();
            if record_type.is_empty() {
                return Err(ImportError::MalformedRecord {
                    line: self.line_ordinal,
                    message: "缺少记录类型".to_string(),
                });
            }

            self.ready.push_back(FiscalRecordLine {
                record_type,
                fields,
                byte_offset: begin,
                end_offset: end,
                line_no: self.line_ordinal,
            });
        }

        if idx != spans.len() {
            return Err(ImportError::Internal(format!(
                "分词结果与行数不一致: {} != {}",
                idx,
                spans.len()
            )));
        }
        Ok(())
    }
}

/// 去除行尾 CR 及首尾空白/NUL 填充
fn trim_line(line: &[u8]) -> &[u8] {
    let is_pad = |b: &u8| matches!(*b, b'\r' | b' ' | b'\t' | 0);
    let start = line.iter().position(|b| !is_pad(b)).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !is_pad(b)).map(|i| i + 1).unwrap_or(start);
    &line[start..end]
}

/// UTF-8 解码，失败时按 ISO-8859-1 逐字节映射
pub fn decode_field(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// 解析数值（逗号小数点；同时出现 '.' 与 ',' 时 '.' 视为千分位）
pub fn parse_decimal(raw: &str) -> Result<f64, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0.0);
    }
    let normalized = if s.contains(',') {
        s.replace('.', "").replace(',', ".")
    } else {
        s.to_string()
    };
    normalized
        .parse::<f64>()
        .map_err(|_| format!("无法解析数值: {}", raw))
}

/// 解析 ddmmyyyy 日期
pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    let s = raw.trim();
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("日期格式错误（期望 ddmmyyyy）: {}", raw));
    }
    NaiveDate::parse_from_str(s, "%d%m%Y").map_err(|_| format!("无效日期: {}", raw))
}
