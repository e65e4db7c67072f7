// ==========================================
// SPED 账簿导入系统 - 批量落库
// ==========================================
// 职责: 按类别缓冲明细行，满批即写；检查点前全部刷出
// 约束: 参与方总是先于明细写入（明细写入时关联参与方名称）
// ==========================================

use crate::domain::import_job::CategoryCounts;
use crate::domain::ledger::{LedgerEntry, Participant};
use crate::domain::types::LedgerCategory;
use crate::importer::error::ImportResult;
use crate::repository::ledger_entry_repo::LedgerEntryRepository;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct BatchPersister {
    repo: Arc<dyn LedgerEntryRepository>,
    job_id: String,
    branch_id: String,
    batch_size: usize,
    buffers: BTreeMap<LedgerCategory, Vec<LedgerEntry>>,
    participants: Vec<Participant>,
    /// 本次调用实际插入的行数
    inserted: CategoryCounts,
}

impl BatchPersister {
    pub fn new(
        repo: Arc<dyn LedgerEntryRepository>,
        job_id: impl Into<String>,
        branch_id: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            repo,
            job_id: job_id.into(),
            branch_id: branch_id.into(),
            batch_size: batch_size.max(1),
            buffers: BTreeMap::new(),
            participants: Vec::new(),
            inserted: CategoryCounts::default(),
        }
    }

    /// 缓冲一条明细；该类别满批时立即写入
    pub async fn push(&mut self, entry: LedgerEntry) -> ImportResult<()> {
        let category = entry.category;
        let buffer = self.buffers.entry(category).or_default();
        buffer.push(entry);
        if buffer.len() >= self.batch_size {
            self.flush_category(category).await?;
        }
        Ok(())
    }

    pub async fn push_participant(&mut self, participant: Participant) -> ImportResult<()> {
        self.participants.push(participant);
        if self.participants.len() >= self.batch_size {
            self.flush_participants().await?;
        }
        Ok(())
    }

    pub fn inserted(&self) -> CategoryCounts {
        self.inserted
    }

    async fn flush_participants(&mut self) -> ImportResult<()> {
        if self.participants.is_empty() {
            return Ok(());
        }
        let written = self
            .repo
            .upsert_participants(&self.branch_id, &self.participants)
            .await?;
        tracing::debug!(job_id = %self.job_id, participants = written, "参与方写入完成");
        self.participants.clear();
        Ok(())
    }

    async fn flush_category(&mut self, category: LedgerCategory) -> ImportResult<()> {
        self.flush_participants().await?;

        let rows = match self.buffers.get_mut(&category) {
            Some(rows) if !rows.is_empty() => std::mem::take(rows),
            _ => return Ok(()),
        };

        match self.repo.insert_batch(&self.job_id, category, &rows).await {
            Ok(inserted) => {
                self.inserted.add(category, inserted as i64);
                Ok(())
            }
            Err(e) => {
                // 写入失败时保留缓冲，调用方决定中止
                self.buffers.insert(category, rows);
                Err(e.into())
            }
        }
    }

    /// 刷出全部缓冲（检查点前调用）
    pub async fn flush_all(&mut self) -> ImportResult<()> {
        self.flush_participants().await?;
        for category in LedgerCategory::ALL {
            self.flush_category(category).await?;
        }
        Ok(())
    }
}
