// ==========================================
// SPED 账簿导入系统 - 命令行入口
// ==========================================
// 用法: sped-import <db_path|-> <company_id> <ledger_file> [line_limit]
// 受理一个导入任务，驱动续传直到队列空闲，输出任务状态 JSON
// ==========================================

use anyhow::{anyhow, bail, Context};
use sped_ledger_import::app::{get_default_db_path, AppState};
use sped_ledger_import::{logging, ImportScope, IntakeRequest};
use std::path::Path;

const USAGE: &str = "用法: sped-import <db_path|-> <company_id> <ledger_file> [line_limit]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 || args.len() > 4 {
        bail!(USAGE);
    }

    let db_path = if args[0] == "-" {
        get_default_db_path()
    } else {
        args[0].clone()
    };
    let company_id = args[1].clone();
    let ledger_file = args[2].clone();
    let line_limit = args
        .get(3)
        .map(|raw| raw.parse::<u64>().with_context(|| format!("line_limit 无效: {}", raw)))
        .transpose()?;

    tracing::info!("==================================================");
    tracing::info!("{}", sped_ledger_import::APP_NAME);
    tracing::info!("系统版本: {}", sped_ledger_import::VERSION);
    tracing::info!("使用数据库: {}", db_path);
    tracing::info!("==================================================");

    let state = AppState::new(db_path).map_err(|e| anyhow!(e))?;

    let file_name = Path::new(&ledger_file)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| ledger_file.clone());

    let job_id = state
        .import_api
        .start_import(IntakeRequest {
            company_id,
            file_path: ledger_file,
            file_name,
            file_size: None,
            line_limit,
            scope: ImportScope::Full,
        })
        .await?;

    let invocations = state.worker.run_until_idle().await?;
    tracing::info!(job_id = %job_id, invocations, "续传执行结束");

    let view = state.import_api.get_job_status(&job_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
