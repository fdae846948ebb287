use anyhow::{bail, Context};
use catalog_import::adapters::{FileKvStore, KvCatalogStore};
use catalog_import::core::cache::CacheGroup;
use catalog_import::core::scheduler::TokioScheduler;
use catalog_import::domain::batch::{BatchJob, BatchStatus};
use catalog_import::domain::model::SearchType;
use catalog_import::domain::ports::KvStore;
use catalog_import::utils::error::ErrorSeverity;
use catalog_import::utils::monitor::SystemMonitor;
use catalog_import::utils::{logger, validation::Validate};
use catalog_import::{Cli, Command, ImportConfig, ImportError, ImportService};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // 初始化日誌
    if cli.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("🚀 Starting catalog-import");
    tracing::info!("📁 Loading configuration from: {}", cli.config.display());

    let config = match ImportConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", cli.config.display(), e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    if let Err(e) = run(cli, config).await {
        match e.downcast_ref::<ImportError>() {
            Some(err) => {
                tracing::error!(
                    "❌ Command failed: {} (Category: {:?}, Severity: {:?})",
                    err,
                    err.category(),
                    err.severity()
                );
                eprintln!("❌ {}", err.user_friendly_message());
                eprintln!("💡 Suggestion: {}", err.recovery_suggestion());

                // 根據錯誤嚴重程度決定退出碼
                let exit_code = match err.severity() {
                    ErrorSeverity::Low => 0,
                    ErrorSeverity::Medium => 2,
                    ErrorSeverity::High => 1,
                    ErrorSeverity::Critical => 3,
                };
                if exit_code > 0 {
                    std::process::exit(exit_code);
                }
            }
            None => {
                eprintln!("❌ {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run(cli: Cli, config: ImportConfig) -> anyhow::Result<()> {
    let data_dir = Path::new(&config.storage.data_dir);
    let store: Arc<dyn KvStore> = Arc::new(FileKvStore::new(data_dir.join("state")));
    let catalog = Arc::new(KvCatalogStore::new(Arc::new(FileKvStore::new(
        data_dir.join("catalog"),
    ))));
    let service = ImportService::from_config(&config, &config, store, catalog)?;

    let monitor = SystemMonitor::new(cli.monitor);
    if monitor.is_enabled() {
        tracing::info!("🔍 System monitoring enabled");
    }

    let filters = cli.command.search_filters();
    match cli.command {
        Command::Search { term, code, .. } => {
            let search_type = if code {
                SearchType::Code
            } else {
                SearchType::Keywords
            };
            let page = service
                .search(&term, search_type, &filters.unwrap_or_default())
                .await?;
            for item in &page.items {
                let price = item
                    .price
                    .as_ref()
                    .map(|p| {
                        let sale = if p.is_on_sale() { " 🏷️ sale" } else { "" };
                        format!("{} {}{}", p.effective(), p.currency, sale)
                    })
                    .unwrap_or_else(|| "-".to_string());
                let variations = if item.is_variable() {
                    format!("  ({} variations)", item.variations.len())
                } else {
                    String::new()
                };
                println!("{}  {}  [{}]{}", item.code, item.title, price, variations);
            }
            println!(
                "📄 Page {}/{} ({} results)",
                page.page, page.total_pages, page.total_results
            );
        }
        Command::Import { code, force } => {
            let result = service
                .import_one(&code, force || service.default_force_update())
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!("{}", result.message);
            }
        }
        Command::Batch { codes, file, force } => {
            let mut inputs: Vec<String> = codes
                .iter()
                .flat_map(|c| c.split(|ch: char| ch == ',' || ch.is_whitespace()))
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            if let Some(path) = file {
                inputs.extend(read_codes_csv(&path)?);
            }

            monitor.log_stats("Batch start");
            let orchestrator = service.orchestrator();
            let job = orchestrator
                .start(inputs, force || service.default_force_update())
                .await?;
            println!("🚀 Batch {} started ({} items)", job.batch_id, job.total());

            let job = orchestrator.run_batch(&job.batch_id).await?;
            monitor.log_final_stats(job.processed);
            print_job(&job);
            if job.status == BatchStatus::Failed {
                bail!(
                    "batch failed: {}",
                    job.failure_reason.as_deref().unwrap_or("unknown reason")
                );
            }
        }
        Command::Status { batch_id, export } => {
            let batch_id = match batch_id {
                Some(id) => id,
                None => match service.orchestrator().active_batch_id().await? {
                    Some(id) => id,
                    None => {
                        println!("No batches recorded");
                        return Ok(());
                    }
                },
            };
            let job = service.status(&batch_id).await?;
            print_job(&job);
            if let Some(path) = export {
                export_results(&job, &path)?;
                println!("📁 Results written to {}", path.display());
            }
        }
        Command::Pause { batch_id } => {
            let job = service.pause(&batch_id).await?;
            println!("⏸️ Pause requested for {} (status: {})", batch_id, job.status);
        }
        Command::Resume { batch_id } => {
            let job = service.resume(&batch_id).await?;
            println!("▶️ Resume requested for {} (status: {})", batch_id, job.status);
            // 沒有存活的 worker 時，由本行程接手
            let run = service.run_scheduled().await?;
            tracing::debug!("Resume follow-up: {:?}", run);
        }
        Command::Cancel { batch_id } => {
            let job = service.cancel(&batch_id).await?;
            println!("🛑 Cancel requested for {} (status: {})", batch_id, job.status);
        }
        Command::Clear { batch_id } => {
            service.clear(&batch_id).await?;
            println!("🧹 Cleared {}", batch_id);
        }
        Command::Schedule { once } => {
            if once {
                let run = service.run_scheduled().await?;
                println!("⏰ {:?}", run);
            } else {
                let handle = service.schedule(&TokioScheduler::new(), config.scheduler.interval());
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to listen for ctrl-c")?;
                handle.stop();
                println!("⏹️ Scheduler stopped");
            }
        }
        Command::CacheStats => {
            let cache = service.cache().context("cache is not configured")?;
            let stats = cache.statistics().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::CacheClear { group } => {
            let cache = service.cache().context("cache is not configured")?;
            let removed = match group {
                Some(name) => cache.clear_group(name.parse::<CacheGroup>()?).await,
                None => cache.clear_all().await,
            };
            println!("🧹 Removed {} cache entries", removed);
        }
    }

    Ok(())
}

fn print_job(job: &BatchJob) {
    let progress = job.progress();
    println!("Batch:     {}", job.batch_id);
    println!("Status:    {}", job.status);
    println!(
        "Progress:  {}/{} ({:.1}%)",
        progress.processed,
        progress.total,
        progress.percent()
    );
    println!(
        "Results:   ✅ {}  ⏭️ {}  ❌ {}",
        job.success, job.skipped, job.failed
    );
    if let Some(eta) = progress.eta {
        println!("ETA:       {:?}", eta);
    }
    if let Some(reason) = &job.failure_reason {
        println!("Reason:    {}", reason);
    }
    for entry in job.errors.iter().rev().take(5) {
        println!("  ⚠️ {} [{}] {}", entry.code, entry.kind, entry.message);
    }
    if job.status.is_active() {
        println!("💡 Use pause/resume/cancel {} to control this batch", job.batch_id);
    }
}

/// 讀取 CSV 第一欄的商品代碼，略過常見的標題列
fn read_codes_csv(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut codes = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;
        let Some(first) = record.get(0).map(str::trim) else {
            continue;
        };
        let header = ["code", "asin", "item_code"].contains(&first.to_ascii_lowercase().as_str());
        if first.is_empty() || header {
            continue;
        }
        codes.push(first.to_string());
    }
    tracing::info!("📥 Read {} codes from {}", codes.len(), path.display());
    Ok(codes)
}

fn export_results(job: &BatchJob, path: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for result in &job.per_item_results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    Ok(())
}
