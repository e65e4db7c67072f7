// ==========================================
// SPED 账簿导入系统 - 导入管线（单次调用）
// ==========================================
// 流程: 认领 → [pending: 头部提取/分支登记] → 分块解析 → 分类 → 批量落库
//       → 检查点 → 预算耗尽则投递续传 / 输入结束则刷新视图并完成
// 约束:
// - 游标仅在批量写入确认后推进（至少一次 + 幂等主键）
// - 同一任务同一时刻至多一次调用（认领令牌 + 租约）
// - 投递续传前先释放认领
// ==========================================

use crate::config::PipelineConfig;
use crate::domain::import_job::{ImportJob, ParentContext};
use crate::domain::ledger::{FiscalRecordLine, RecordKind};
use crate::domain::types::{FailureKind, JobStatus, TrailerPolicy};
use crate::importer::batch_persister::BatchPersister;
use crate::importer::blob_store::BlobStore;
use crate::importer::classifier::{Classification, RecordClassifier};
use crate::importer::error::{ErrorKind, ImportError, ImportResult};
use crate::importer::header_extractor::HeaderExtractor;
use crate::importer::line_parser::{ChunkedLineReader, ReaderLimits};
use crate::importer::progress::ProgressReporter;
use crate::importer::record_mapper::{map_entry, parent_from_c100, participant_from_0150, EntryOwner};
use crate::refresh::{RefreshRequest, ViewRefreshTrigger};
use crate::repository::branch_repo::BranchRepository;
use crate::repository::import_job_repo::ImportJobRepository;
use crate::repository::ledger_entry_repo::LedgerEntryRepository;
use crate::scheduler::continuation_scheduler::{ContinuationScheduler, ScheduleOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;
use uuid::Uuid;

/// 9999 记录中声明的总行数位置
const TRAILER_LINE_COUNT: usize = 2;

/// 单次调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// 未执行（终态 / 正被其他调用处理）
    Skipped(String),
    /// 预算耗尽，已投递续传
    Continued,
    /// 任务完成
    Completed,
    /// 任务失败（错误信息）
    Failed(String),
    /// 存储失败，已按退避投递重试
    Deferred,
    /// 检查点被拒绝（外部取消或认领失效）
    Aborted,
}

/// 解析阶段结束后的后续动作（在释放认领后执行）
enum NextStep {
    Continue,
    Finished(InvocationOutcome),
}

pub struct ImportPipeline {
    jobs: Arc<dyn ImportJobRepository>,
    ledger: Arc<dyn LedgerEntryRepository>,
    branches: Arc<dyn BranchRepository>,
    store: Arc<dyn BlobStore>,
    classifier: RecordClassifier,
    scheduler: Arc<ContinuationScheduler>,
    refresh: Arc<ViewRefreshTrigger>,
    config: PipelineConfig,
}

impl ImportPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn ImportJobRepository>,
        ledger: Arc<dyn LedgerEntryRepository>,
        branches: Arc<dyn BranchRepository>,
        store: Arc<dyn BlobStore>,
        classifier: RecordClassifier,
        scheduler: Arc<ContinuationScheduler>,
        refresh: Arc<ViewRefreshTrigger>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            jobs,
            ledger,
            branches,
            store,
            classifier,
            scheduler,
            refresh,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 执行一次调用（受理后的首次调用与所有续传共用此入口）
    ///
    /// # 参数
    /// - job_id: 任务ID（续传只携带任务ID，其余状态均从任务行读取）
    ///
    /// # 返回
    /// - Ok(InvocationOutcome): 本次调用结果；任务级失败已写入任务行
    /// - Err: 任务不存在或任务行本身无法更新
    #[instrument(skip(self))]
    pub async fn run_invocation(&self, job_id: &str) -> ImportResult<InvocationOutcome> {
        let job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;

        if job.is_terminal() {
            tracing::debug!(status = %job.status, "任务已处于终态，续传跳过");
            return Ok(InvocationOutcome::Skipped(format!("任务已处于终态: {}", job.status)));
        }

        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease_duration())
            .unwrap_or_else(|_| chrono::Duration::zero());
        if !self.jobs.try_claim(job_id, &token, now + lease, now).await? {
            tracing::debug!("任务正被其他调用处理，续传跳过");
            return Ok(InvocationOutcome::Skipped("任务正被其他调用处理".to_string()));
        }

        let result = self.process(job, &token, Instant::now()).await;

        // complete / mark_failed 已清除认领时此处为空操作
        if let Err(e) = self.jobs.release_claim(job_id, &token).await {
            tracing::warn!(error = %e, "释放认领失败，等待租约过期");
        }

        match result {
            Ok(NextStep::Continue) => self.schedule_next(job_id).await,
            Ok(NextStep::Finished(outcome)) => Ok(outcome),
            Err(e) => self.handle_failure(job_id, e).await,
        }
    }

    /// 已认领状态下的处理
    async fn process(&self, mut job: ImportJob, token: &str, started: Instant) -> ImportResult<NextStep> {
        if job.status == JobStatus::Pending && !self.begin(&mut job, token).await? {
            return Ok(NextStep::Finished(InvocationOutcome::Aborted));
        }

        match job.status {
            JobStatus::Processing => self.parse_chunk(&job, token, started).await,
            JobStatus::RefreshingViews => self.finish(&job, token).await.map(NextStep::Finished),
            other => Err(ImportError::Internal(format!("认领后的任务状态异常: {}", other))),
        }
    }

    /// pending → processing：提取账簿头并登记分支
    async fn begin(&self, job: &mut ImportJob, token: &str) -> ImportResult<bool> {
        let extractor = HeaderExtractor::new(
            self.store.clone(),
            self.config.header_probe_bytes,
            self.config.max_line_bytes,
        );
        let header = extractor.extract(&job.file_path).await?;

        let branch = self
            .branches
            .find_or_create(
                &job.company_id,
                &header.taxpayer_id,
                &header.registrant_name,
                header.state.as_deref(),
            )
            .await?;

        let started = self
            .jobs
            .start_processing(
                &job.job_id,
                token,
                &branch.branch_id,
                header.period_start,
                header.period_end,
            )
            .await?;
        if !started {
            tracing::warn!("任务状态已变化，放弃开始处理");
            return Ok(false);
        }

        tracing::info!(
            branch_id = %branch.branch_id,
            period_start = %header.period_start,
            "开始处理账簿"
        );
        job.status = JobStatus::Processing;
        job.branch_id = Some(branch.branch_id);
        job.period_start = Some(header.period_start);
        job.period_end = Some(header.period_end);
        Ok(true)
    }

    /// 在预算内解析一段，并写入收尾检查点
    async fn parse_chunk(&self, job: &ImportJob, token: &str, started: Instant) -> ImportResult<NextStep> {
        let branch_id = job
            .branch_id
            .as_deref()
            .ok_or_else(|| ImportError::Internal("处理中的任务缺少分支".to_string()))?;
        let period_start = job
            .period_start
            .ok_or_else(|| ImportError::Internal("处理中的任务缺少账期".to_string()))?;
        let owner = EntryOwner {
            job_id: &job.job_id,
            branch_id,
            period_start,
        };

        let file_size = if job.file_size > 0 {
            job.file_size
        } else {
            self.store.size(&job.file_path).await?
        };

        let limits = ReaderLimits {
            read_chunk_bytes: self.config.read_chunk_bytes,
            max_line_bytes: self.config.max_line_bytes,
            read_limit: None,
        };
        let mut reader = ChunkedLineReader::new(
            self.store.clone(),
            job.file_path.as_str(),
            job.resume_cursor,
            job.processed_lines,
            limits,
        );
        let mut persister =
            BatchPersister::new(self.ledger.clone(), job.job_id.as_str(), branch_id, self.config.batch_size);
        let mut progress =
            ProgressReporter::new(self.config.progress_interval_lines, file_size, job.progress);
        let mut parent = job.parent_context.clone();

        let budget = self.config.effective_budget();
        let mut lines_this_call: u64 = 0;
        let mut block = None;
        let mut end_of_input = false;

        loop {
            if job.line_limit_reached(reader.lines_read()) {
                tracing::info!(line_limit = ?job.line_limit, "已达到行数上限，视为输入结束");
                end_of_input = true;
                break;
            }
            // 每次调用至少推进一行，预算过小时也不会原地续传
            if lines_this_call >= self.config.chunk_max_lines
                || (lines_this_call > 0 && started.elapsed() >= budget)
            {
                break;
            }

            let Some(line) = reader.next_line().await? else {
                end_of_input = true;
                break;
            };
            lines_this_call += 1;
            block = line.block();

            self.handle_line(&line, job, &mut parent, &mut persister, owner).await?;

            if progress.record_line() {
                persister.flush_all().await?;
                let checkpoint =
                    progress.checkpoint(reader.cursor(), reader.lines_read(), parent.clone(), block);
                if !self.jobs.save_checkpoint(&job.job_id, token, &checkpoint).await? {
                    tracing::warn!(cursor = checkpoint.resume_cursor, "检查点被拒绝（任务已取消或认领失效）");
                    return Ok(NextStep::Finished(InvocationOutcome::Aborted));
                }
                tracing::debug!(
                    cursor = checkpoint.resume_cursor,
                    lines = checkpoint.processed_lines,
                    progress = checkpoint.progress,
                    "检查点已保存"
                );
            }
        }

        persister.flush_all().await?;
        let checkpoint = progress.checkpoint(reader.cursor(), reader.lines_read(), parent, block);
        if !self.jobs.save_checkpoint(&job.job_id, token, &checkpoint).await? {
            tracing::warn!(cursor = checkpoint.resume_cursor, "检查点被拒绝（任务已取消或认领失效）");
            return Ok(NextStep::Finished(InvocationOutcome::Aborted));
        }
        self.jobs.reset_persist_failures(&job.job_id).await?;

        let inserted = persister.inserted();
        tracing::info!(
            cursor = checkpoint.resume_cursor,
            lines = lines_this_call,
            processed_lines = checkpoint.processed_lines,
            inserted = inserted.total(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "本次调用解析结束"
        );

        if !end_of_input {
            return Ok(NextStep::Continue);
        }

        self.jobs.set_total_lines(&job.job_id, reader.lines_read()).await?;
        let moved = self
            .jobs
            .transition(
                &job.job_id,
                token,
                JobStatus::Processing,
                JobStatus::RefreshingViews,
                "正在刷新汇总视图",
            )
            .await?;
        if !moved {
            return Ok(NextStep::Finished(InvocationOutcome::Aborted));
        }
        self.finish(job, token).await.map(NextStep::Finished)
    }

    /// 处理一行：参与方登记 / 发票头上下文 / 分类落库 / 尾记录核对
    async fn handle_line(
        &self,
        line: &FiscalRecordLine,
        job: &ImportJob,
        parent: &mut Option<ParentContext>,
        persister: &mut BatchPersister,
        owner: EntryOwner<'_>,
    ) -> ImportResult<()> {
        match line.kind() {
            RecordKind::Participant => {
                persister.push_participant(participant_from_0150(line)?).await?;
                return Ok(());
            }
            RecordKind::GoodsInvoice => *parent = Some(parent_from_c100(line)?),
            RecordKind::Trailer => return self.check_trailer(line),
            _ => {}
        }

        // C 块之外不存在待继承的发票头
        if line.block() != Some('C') {
            *parent = None;
        }

        if !job.scope.includes(&line.record_type) {
            return Ok(());
        }

        match self.classifier.classify(line) {
            Classification::Persist(category) => {
                let entry = map_entry(line, category, parent.as_ref(), owner)?;
                persister.push(entry).await?;
            }
            Classification::Ignore | Classification::NotDetail => {}
        }
        Ok(())
    }

    fn check_trailer(&self, line: &FiscalRecordLine) -> ImportResult<()> {
        let declared = line
            .field(TRAILER_LINE_COUNT)
            .and_then(|raw| raw.parse::<u64>().ok());
        let Some(declared) = declared else {
            tracing::warn!(line = line.line_no, "9999 记录缺少有效的行数");
            return Ok(());
        };
        if declared == line.line_no {
            return Ok(());
        }

        match self.config.trailer_policy {
            TrailerPolicy::Strict => Err(ImportError::TrailerMismatch {
                declared,
                actual: line.line_no,
            }),
            TrailerPolicy::Warn => {
                tracing::warn!(declared, actual = line.line_no, "尾记录行数与实际不一致");
                Ok(())
            }
        }
    }

    /// refreshing_views → 触发刷新 → completed
    async fn finish(&self, job: &ImportJob, token: &str) -> ImportResult<InvocationOutcome> {
        if let (Some(branch_id), Some(period_start)) = (job.branch_id.as_deref(), job.period_start) {
            let request = RefreshRequest {
                job_id: job.job_id.clone(),
                branch_id: branch_id.to_string(),
                period_start,
            };
            // 刷新失败不影响任务完成
            self.refresh.trigger(&request).await;
        }

        if !self.jobs.complete(&job.job_id, token, "导入完成").await? {
            return Ok(InvocationOutcome::Aborted);
        }
        tracing::info!("导入完成");
        Ok(InvocationOutcome::Completed)
    }

    async fn schedule_next(&self, job_id: &str) -> ImportResult<InvocationOutcome> {
        self.schedule_with_delay(job_id, self.config.continuation_delay(), InvocationOutcome::Continued)
            .await
    }

    async fn schedule_with_delay(
        &self,
        job_id: &str,
        delay: Duration,
        on_scheduled: InvocationOutcome,
    ) -> ImportResult<InvocationOutcome> {
        match self.scheduler.schedule(job_id, delay).await? {
            ScheduleOutcome::Scheduled(_) => Ok(on_scheduled),
            ScheduleOutcome::Exhausted => Ok(InvocationOutcome::Failed("续传投递重试耗尽".to_string())),
        }
    }

    /// 按错误分类处理调用失败
    async fn handle_failure(&self, job_id: &str, error: ImportError) -> ImportResult<InvocationOutcome> {
        let message = error.to_string();
        match error.kind() {
            ErrorKind::Validation => {
                tracing::error!(error = %message, "校验失败，任务终止");
                self.jobs.mark_failed(job_id, FailureKind::Validation, &message).await?;
                Ok(InvocationOutcome::Failed(message))
            }
            ErrorKind::Internal => {
                let fatal = format!("内部错误，任务终止: {}", message);
                tracing::error!(error = %message, "内部不变量破坏，任务终止");
                self.jobs.mark_failed(job_id, FailureKind::Internal, &fatal).await?;
                Ok(InvocationOutcome::Failed(fatal))
            }
            ErrorKind::Aborted => {
                tracing::warn!(error = %message, "任务已不在处理中，放弃本次调用");
                Ok(InvocationOutcome::Aborted)
            }
            ErrorKind::Storage => {
                let failures = self.jobs.record_persist_failure(job_id, &message).await?;
                if failures > self.config.max_persist_failures {
                    let fatal = format!("连续 {} 次存储失败: {}", failures, message);
                    tracing::error!(failures, error = %message, "存储失败次数超过上限，任务终止");
                    self.jobs.mark_failed(job_id, FailureKind::Persistence, &fatal).await?;
                    return Ok(InvocationOutcome::Failed(fatal));
                }

                let delay = self.scheduler.backoff().delay_for(failures.saturating_sub(1));
                tracing::warn!(
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "存储失败，游标未推进，退避后重试"
                );
                self.schedule_with_delay(job_id, delay, InvocationOutcome::Deferred).await
            }
        }
    }
}
