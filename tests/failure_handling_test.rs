// ==========================================
// 失败处理集成测试
// ==========================================
// 测试目标: 调度暂时性失败 / 落库失败退避 / 内部错误 / 调用预算 /
//           取消 / 认领互斥 / 中断恢复
// ==========================================


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use sped_ledger_import::domain::{LedgerEntry, Participant};
use sped_ledger_import::importer::{BlobStore, ImportPipeline, InvocationOutcome, RecordClassifier};
use sped_ledger_import::refresh::{SqliteViewRefresher, ViewRefreshTrigger};
use sped_ledger_import::repository::error::{RepositoryError, RepositoryResult};
use sped_ledger_import::repository::{
    ImportJobRepository, LedgerEntryRepository, SqliteBranchRepository, SqliteImportJobRepository,
    SqliteLedgerEntryRepository,
};
use sped_ledger_import::scheduler::{
    ContinuationDispatcher, ContinuationScheduler, DispatchError, TRANSIENT_FAILURE_PREFIX,
};
use sped_ledger_import::{
    FailureKind, ImportJob, ImportScope, IntakeRequest, JobStatus, LedgerCategory, PipelineConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::*;

/// 始终不可用的调度通道
struct DownDispatcher {
    calls: AtomicU32,
}

#[async_trait]
impl ContinuationDispatcher for DownDispatcher {
    async fn dispatch(&self, _job_id: &str, _not_before: DateTime<Utc>) -> Result<String, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DispatchError::Unavailable("connection refused".into()))
    }
}

/// 明细写入始终失败（参与方正常）
struct BrokenLedger;

#[async_trait]
impl LedgerEntryRepository for BrokenLedger {
    async fn insert_batch(
        &self,
        _job_id: &str,
        _category: LedgerCategory,
        _rows: &[LedgerEntry],
    ) -> RepositoryResult<usize> {
        Err(RepositoryError::DatabaseQueryError("database is locked".into()))
    }

    async fn upsert_participants(&self, _branch_id: &str, participants: &[Participant]) -> RepositoryResult<usize> {
        Ok(participants.len())
    }
}

struct Harness {
    _db: tempfile::NamedTempFile,
    conn: Arc<Mutex<Connection>>,
    jobs: Arc<SqliteImportJobRepository>,
    pipeline: ImportPipeline,
}

fn harness(
    config: PipelineConfig,
    dispatcher: Option<Arc<dyn ContinuationDispatcher>>,
    ledger: Option<Arc<dyn LedgerEntryRepository>>,
    text: &str,
) -> Harness {
    let (db, conn) = create_test_db();
    let store = Arc::new(sped_ledger_import::importer::InMemoryBlobStore::new());
    store.put(LEDGER_PATH, text.to_string());

    let jobs = Arc::new(SqliteImportJobRepository::new(conn.clone()));
    let dispatcher = dispatcher.unwrap_or_else(|| -> Arc<dyn ContinuationDispatcher> {
        Arc::new(sped_ledger_import::SqliteContinuationQueue::new(conn.clone()))
    });
    let ledger = ledger.unwrap_or_else(|| -> Arc<dyn LedgerEntryRepository> {
        Arc::new(SqliteLedgerEntryRepository::new(conn.clone()))
    });
    let scheduler = Arc::new(ContinuationScheduler::new(dispatcher, jobs.clone(), &config));
    let refresh = Arc::new(ViewRefreshTrigger::new(
        Arc::new(SqliteViewRefresher::new(conn.clone())),
        config.refresh_timeout(),
    ));
    let store: Arc<dyn BlobStore> = store;

    let pipeline = ImportPipeline::new(
        jobs.clone(),
        ledger,
        Arc::new(SqliteBranchRepository::new(conn.clone())),
        store,
        RecordClassifier::default(),
        scheduler,
        refresh,
        config,
    );
    Harness {
        _db: db,
        conn,
        jobs,
        pipeline,
    }
}

fn intake() -> IntakeRequest {
    IntakeRequest {
        company_id: COMPANY_ID.to_string(),
        file_path: LEDGER_PATH.to_string(),
        file_name: "efd.txt".to_string(),
        file_size: None,
        line_limit: None,
        scope: ImportScope::Full,
    }
}

async fn seed_job(jobs: &SqliteImportJobRepository, text: &str) -> String {
    let job = ImportJob::new_pending(COMPANY_ID, LEDGER_PATH, "efd.txt", text.len() as u64);
    jobs.insert_job(&job).await.unwrap();
    job.job_id
}

#[tokio::test]
async fn test_transient_failure_after_retry_ceiling() {
    let text = large_ledger(3);
    let dispatcher = Arc::new(DownDispatcher {
        calls: AtomicU32::new(0),
    });
    let config = PipelineConfig {
        chunk_max_lines: 4,
        max_dispatch_retries: 3,
        ..fast_config()
    };
    let h = harness(config, Some(dispatcher.clone() as Arc<dyn ContinuationDispatcher>), None, &text);
    let job_id = seed_job(&h.jobs, &text).await;

    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Failed(_)));
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 4);

    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Transient));
    assert_eq!(job.retry_count, 4);
    assert!(job.error_message.unwrap().starts_with(TRANSIENT_FAILURE_PREFIX));
    // 失败前已处理的部分保持可见
    assert_eq!(job.processed_lines, 4);

    // 终态任务的续传为空操作
    let again = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert!(matches!(again, InvocationOutcome::Skipped(_)));
}

#[tokio::test]
async fn test_persistence_failure_backs_off_then_fails() {
    let text = large_ledger(2);
    let config = PipelineConfig {
        max_persist_failures: 2,
        ..fast_config()
    };
    let h = harness(config, None, Some(Arc::new(BrokenLedger) as Arc<dyn LedgerEntryRepository>), &text);
    let job_id = seed_job(&h.jobs, &text).await;

    // 首次调用：头部与参与方正常，第一张发票的批次写入失败
    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Deferred);
    let first = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Processing);
    assert_eq!(first.persist_failures, 1);
    // 游标停在最后一个成功检查点，未越过第一条发票头（第 6 行）
    assert!(first.processed_lines < 6);
    assert_eq!(first.counts.total(), 0);

    // 重试同一段仍失败：游标与行数保持不变
    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Deferred);
    let second = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(second.persist_failures, 2);
    assert_eq!(second.resume_cursor, first.resume_cursor);
    assert_eq!(second.processed_lines, first.processed_lines);
    assert_eq!(second.progress, first.progress);

    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Failed(_)));
    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Persistence));
    assert!(job.error_message.is_some());
}

#[tokio::test]
async fn test_claimed_job_is_not_processed_twice() {
    let text = large_ledger(2);
    let h = harness(fast_config(), None, None, &text);
    let job_id = seed_job(&h.jobs, &text).await;

    let now = Utc::now();
    assert!(h
        .jobs
        .try_claim(&job_id, "other-invocation", now + chrono::Duration::seconds(60), now)
        .await
        .unwrap());

    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Skipped(_)));
    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.processed_lines, 0);

    h.jobs.release_claim(&job_id, "other-invocation").await.unwrap();
    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Completed);
}

#[tokio::test]
async fn test_cancel_stops_continuations() {
    let app = TestApp::new(PipelineConfig {
        chunk_max_lines: 3,
        ..fast_config()
    });
    app.store.put(LEDGER_PATH, large_ledger(5));
    let job_id = app
        .state
        .import_api
        .start_import(IntakeRequest {
            company_id: COMPANY_ID.to_string(),
            file_path: LEDGER_PATH.to_string(),
            file_name: "efd.txt".to_string(),
            file_size: None,
            line_limit: None,
            scope: ImportScope::Full,
        })
        .await
        .unwrap();

    assert_eq!(app.state.worker.run_once().await.unwrap(), 1);
    let before = app.state.import_api.get_job_status(&job_id).await.unwrap();
    assert_eq!(before.status, JobStatus::Processing);
    assert_eq!(app.state.queue.stats().unwrap().pending_count, 1);

    let view = app.state.import_api.cancel_job(&job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    let stats = app.state.queue.stats().unwrap();
    assert_eq!(stats.pending_count, 0);
    assert_eq!(stats.cancelled_count, 1);

    assert_eq!(app.state.worker.run_until_idle().await.unwrap(), 0);
    let after = app.state.import_api.get_job_status(&job_id).await.unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert_eq!(after.processed_lines, before.processed_lines);

    // 终态任务不可再次取消
    assert!(app.state.import_api.cancel_job(&job_id).await.is_err());
}

#[tokio::test]
async fn test_intake_validation() {
    let app = TestApp::new(fast_config());
    let missing = app
        .state
        .import_api
        .start_import(IntakeRequest {
            company_id: COMPANY_ID.to_string(),
            file_path: "uploads/missing.txt".to_string(),
            file_name: "missing.txt".to_string(),
            file_size: None,
            line_limit: None,
            scope: ImportScope::Full,
        })
        .await;
    assert!(missing.is_err());

    let empty_company = app
        .state
        .import_api
        .start_import(IntakeRequest {
            company_id: " ".to_string(),
            file_path: LEDGER_PATH.to_string(),
            file_name: "efd.txt".to_string(),
            file_size: Some(10),
            line_limit: None,
            scope: ImportScope::Full,
        })
        .await;
    assert!(empty_company.is_err());
    assert!(app.state.import_api.list_jobs(COMPANY_ID, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_refresh_does_not_block_completion() {
    let text = LedgerFileBuilder::icms().invoice(1, "FORN01", &["1551"]).build();
    let h = harness(
        PipelineConfig {
            refresh_timeout_ms: 1,
            ..fast_config()
        },
        None,
        None,
        &text,
    );
    let job_id = seed_job(&h.jobs, &text).await;

    // 刷新即使超时，任务依然完成
    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Completed);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn test_internal_error_fails_without_backoff() {
    let text = large_ledger(1);
    let h = harness(fast_config(), None, None, &text);
    let job_id = seed_job(&h.jobs, &text).await;

    // 处理中但缺少分支：状态不变量被破坏
    h.conn
        .lock()
        .unwrap()
        .execute("UPDATE import_job SET status = 'processing' WHERE job_id = ?1", [&job_id])
        .unwrap();

    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert!(matches!(outcome, InvocationOutcome::Failed(_)));
    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Internal));
    assert_eq!(job.persist_failures, 0);
}

#[tokio::test]
async fn test_exhausted_time_budget_continues_from_checkpoint() {
    let text = large_ledger(2);
    let config = PipelineConfig {
        invocation_budget_ms: 1,
        deadline_margin_ms: 1,
        ..fast_config()
    };
    let h = harness(config, None, None, &text);
    let job_id = seed_job(&h.jobs, &text).await;

    // 有效预算为 0：每次调用恰好推进一行
    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Continued);
    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.processed_lines, 1);
    let header_end = text.find("\r\n").unwrap() as u64 + 2;
    assert_eq!(job.resume_cursor, header_end);

    let outcome = h.pipeline.run_invocation(&job_id).await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Continued);
    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.processed_lines, 2);

    let mut invocations = 2;
    loop {
        match h.pipeline.run_invocation(&job_id).await.unwrap() {
            InvocationOutcome::Continued => invocations += 1,
            InvocationOutcome::Completed => break,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert!(invocations as u64 >= line_count(&text) - 1);

    let job = h.jobs.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_lines, line_count(&text));
    assert_eq!(job.counts.goods, 2);
    assert_eq!(job.counts.fixed_asset, 2);
    assert_eq!(job.counts.usage_consumption, 2);
    assert_eq!(job.counts.freight, 1);
}

#[tokio::test]
async fn test_worker_requeues_after_invocation_error() {
    let app = TestApp::new(fast_config());
    app.store.put(LEDGER_PATH, large_ledger(2));
    let job_id = app.state.import_api.start_import(intake()).await.unwrap();

    // 任务行无法认领：调用本身返回错误
    app.conn()
        .lock()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER block_claim BEFORE UPDATE OF claim_token ON import_job
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

    assert_eq!(app.state.worker.run_once().await.unwrap(), 1);
    let stats = app.state.queue.stats().unwrap();
    assert_eq!(stats.failed_count, 1);
    assert_eq!(stats.pending_count, 1);
    assert_eq!(app.state.queue.failed_attempts(&job_id).unwrap(), 1);
    let job = app.state.import_api.get_job_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    app.conn().lock().unwrap().execute_batch("DROP TRIGGER block_claim;").unwrap();
    app.state.worker.run_until_idle().await.unwrap();
    let job = app.state.import_api.get_job_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.goods, 2);
}

/// 租约 50ms 的配置
fn short_lease_config() -> PipelineConfig {
    PipelineConfig {
        invocation_budget_ms: 50,
        deadline_margin_ms: 0,
        lease_grace_ms: 0,
        ..fast_config()
    }
}

#[tokio::test]
async fn test_continuation_held_by_dead_worker_is_recovered() {
    let app = TestApp::new(short_lease_config());
    app.store.put(LEDGER_PATH, large_ledger(3));
    let job_id = app.state.import_api.start_import(intake()).await.unwrap();

    // 工作器取出续传后进程退出
    let taken = app.state.queue.dequeue_due(Utc::now(), 10).unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(app.state.worker.run_until_idle().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let ran = app.state.worker.run_until_idle().await.unwrap();
    assert!(ran >= 1);

    let job = app.state.import_api.get_job_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.goods, 3);
    assert_eq!(app.state.queue.stats().unwrap().running_count, 0);
}

#[tokio::test]
async fn test_expired_claim_without_continuation_is_recovered() {
    let app = TestApp::new(short_lease_config());
    app.store.put(LEDGER_PATH, large_ledger(2));
    let job_id = app.state.import_api.start_import(intake()).await.unwrap();

    // 调用认领任务后中断，且其续传记录已关闭
    let taken = app.state.queue.dequeue_due(Utc::now(), 10).unwrap();
    app.state.queue.fail(&taken[0].task_id, "killed").unwrap();
    let jobs = SqliteImportJobRepository::new(app.conn());
    let now = Utc::now();
    assert!(jobs
        .try_claim(&job_id, "dead-invocation", now + chrono::Duration::milliseconds(50), now)
        .await
        .unwrap());

    // 认领未过期时不补投
    assert_eq!(app.state.worker.run_once().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    app.state.worker.run_until_idle().await.unwrap();
    let job = app.state.import_api.get_job_status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counts.goods, 2);
}
