// ==========================================
// SPED 账簿导入系统 - 进度汇报
// ==========================================
// 职责: 每 N 行生成一次检查点（游标 / 行数 / 进度 / 状态文案）
// 约束: 进度按字节比例计算，完成前封顶 99，且只增不减
// ==========================================

use crate::domain::import_job::{JobCheckpoint, ParentContext};

/// 完成前的进度上限
pub const MAX_PROGRESS_BEFORE_COMPLETION: u8 = 99;

pub struct ProgressReporter {
    interval_lines: u64,
    file_size: u64,
    lines_since_checkpoint: u64,
    last_progress: u8,
}

impl ProgressReporter {
    /// # 参数
    /// - interval_lines: 检查点间隔
    /// - file_size: 文件字节数（进度分母）
    /// - initial_progress: 续传前已记录的进度
    pub fn new(interval_lines: u64, file_size: u64, initial_progress: u8) -> Self {
        Self {
            interval_lines: interval_lines.max(1),
            file_size,
            lines_since_checkpoint: 0,
            last_progress: initial_progress.min(MAX_PROGRESS_BEFORE_COMPLETION),
        }
    }

    /// 记录一行；返回 true 表示到达检查点间隔
    pub fn record_line(&mut self) -> bool {
        self.lines_since_checkpoint += 1;
        self.lines_since_checkpoint >= self.interval_lines
    }

    /// 按游标计算进度（单调）
    pub fn progress_at(&mut self, cursor: u64) -> u8 {
        let ratio = if self.file_size == 0 {
            0
        } else {
            ((cursor as u128 * 100) / self.file_size as u128).min(MAX_PROGRESS_BEFORE_COMPLETION as u128) as u8
        };
        self.last_progress = self.last_progress.max(ratio);
        self.last_progress
    }

    /// 生成检查点并重置间隔计数
    pub fn checkpoint(
        &mut self,
        cursor: u64,
        processed_lines: u64,
        parent_context: Option<ParentContext>,
        block: Option<char>,
    ) -> JobCheckpoint {
        self.lines_since_checkpoint = 0;
        let progress = self.progress_at(cursor);
        JobCheckpoint {
            resume_cursor: cursor,
            processed_lines,
            progress,
            parent_context,
            status_message: status_message(block, processed_lines),
        }
    }
}

/// 状态文案
pub fn status_message(block: Option<char>, processed_lines: u64) -> String {
    match block {
        Some(b) => format!("正在处理 {} 块（已处理 {} 行）", block_name(b), processed_lines),
        None => format!("正在处理（已处理 {} 行）", processed_lines),
    }
}

fn block_name(block: char) -> String {
    match block {
        '0' => "0（开篇与参与方）".to_string(),
        'A' => "A（服务）".to_string(),
        'C' => "C（商品与能源）".to_string(),
        'D' => "D（运输）".to_string(),
        'E' => "E（申报汇总）".to_string(),
        'H' => "H（库存）".to_string(),
        'K' => "K（生产）".to_string(),
        '1' => "1（其他信息）".to_string(),
        '9' => "9（控制与收尾）".to_string(),
        other => other.to_string(),
    }
}
