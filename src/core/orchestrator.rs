use crate::config::{BatchConfig, SchedulerConfig};
use crate::core::normalizer::Normalizer;
use crate::domain::batch::{BatchControl, BatchJob, BatchProgress, BatchStatus, ItemOutcome, ItemResult, PendingItem};
use crate::domain::model::{ItemCode, ProductRecord};
use crate::domain::ports::{CatalogStore, KvStore, ProductApi, ProgressReporter, SilentReporter};
use crate::utils::error::{ImportError, Result};
use crate::utils::logger::{ContextLogger, EventLog, TracingLog};
use crate::utils::validation::partition_item_codes;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// 目前唯一的批次種類
pub const IMPORT_KIND: &str = "import";

fn job_key(batch_id: &str) -> String {
    format!("batch:job:{}", batch_id)
}

fn control_key(batch_id: &str) -> String {
    format!("batch:control:{}", batch_id)
}

fn lock_key(kind: &str) -> String {
    format!("batch:lock:{}", kind)
}

fn active_key(kind: &str) -> String {
    format!("batch:active:{}", kind)
}

/// 單一項目匯入的結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemImport {
    pub outcome: ItemOutcome,
    pub catalog_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledRun {
    /// 接手了 worker 已消失的批次
    Resumed(String),
    /// 啟動了新的同步批次
    Started(String),
    Busy,
    Idle,
}

/// 以 tracing 輸出進度
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, progress: &BatchProgress) {
        tracing::info!(
            "📊 Batch {} [{}] {}/{} ({:.1}%) ✅ {} ⏭️ {} ❌ {} eta {:?}",
            progress.batch_id,
            progress.status,
            progress.processed,
            progress.total,
            progress.percent(),
            progress.success,
            progress.skipped,
            progress.failed,
            progress.eta
        );
    }
}

/// 批次匯入的驅動者
///
/// 狀態（工作紀錄、控制訊號、鎖）全部透過 `KvStore` 交換，
/// 因此查詢與控制可以來自其他任務甚至其他行程。
#[derive(Clone)]
pub struct BatchOrchestrator {
    api: Arc<dyn ProductApi>,
    catalog: Arc<dyn CatalogStore>,
    store: Arc<dyn KvStore>,
    normalizer: Normalizer,
    config: BatchConfig,
    scheduler: SchedulerConfig,
    resources: Vec<String>,
    reporter: Arc<dyn ProgressReporter>,
    log: Arc<dyn EventLog>,
}

impl BatchOrchestrator {
    pub fn new(
        api: Arc<dyn ProductApi>,
        catalog: Arc<dyn CatalogStore>,
        store: Arc<dyn KvStore>,
        normalizer: Normalizer,
        config: BatchConfig,
    ) -> Self {
        Self {
            api,
            catalog,
            store,
            normalizer,
            config,
            scheduler: SchedulerConfig::default(),
            resources: Vec::new(),
            reporter: Arc::new(SilentReporter),
            log: Arc::new(TracingLog),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_logger(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// 空清單代表使用 client 的預設 resources
    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn api(&self) -> &Arc<dyn ProductApi> {
        &self.api
    }

    // ---- 單一項目 ----

    /// 存在性檢查 → 抓取 → 正規化 → （變體）→ 寫入
    pub async fn import_item(
        &self,
        code: &ItemCode,
        force_update: bool,
        cancel: &CancellationToken,
    ) -> Result<ItemImport> {
        if !force_update && self.catalog.exists(code).await? {
            return Ok(ItemImport {
                outcome: ItemOutcome::Skipped,
                catalog_id: self.catalog.get_id_by_code(code).await?,
            });
        }

        let fetched = self
            .api
            .fetch_items(std::slice::from_ref(code), &self.resources, cancel)
            .await?;
        if let Some(err) = fetched.failure_for(code) {
            return Err(ImportError::UnexpectedResponse {
                message: format!("fetch of {} failed: {}", code, err),
            });
        }

        let parsed = self.normalizer.parse_items(&fetched.payload)?;
        let mut record = match parsed.find(code) {
            Some(record) => record.clone(),
            None => {
                let detail = parsed
                    .error_for(code)
                    .or(parsed.errors.first())
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_else(|| "no item in response".to_string());
                return Err(ImportError::NotFound {
                    message: format!("{} ({})", code, detail),
                });
            }
        };

        if self.config.include_variations {
            self.attach_variations(&mut record, cancel).await?;
        }

        let saved = self.catalog.upsert(&record).await?;
        if record.is_variable() {
            tracing::debug!(
                "🧩 Stored {} with {} variations across {} dimensions",
                code,
                record.variations.len(),
                record.dimensions.len()
            );
        }
        Ok(ItemImport {
            outcome: if saved.created {
                ItemOutcome::Created
            } else {
                ItemOutcome::Updated
            },
            catalog_id: Some(saved.id),
        })
    }

    async fn attach_variations(
        &self,
        record: &mut ProductRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(parent) = record.parent_code.clone() else {
            return Ok(());
        };

        let raw = match self.api.fetch_variations(&parent, &self.resources, cancel).await {
            Ok(raw) => raw,
            Err(ImportError::NotFound { message }) => {
                tracing::debug!("🧩 No variations for {} ({}), importing as simple item", parent, message);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let set = self.normalizer.parse_variations(&raw, &parent)?;
        record.dimensions = set.dimensions;
        record.variations = set.variations;
        Ok(())
    }

    // ---- 批次生命週期 ----

    /// 建立批次並取得單一執行鎖；回傳已進入 running 的工作紀錄
    pub async fn start<I, S>(&self, codes: I, force_update: bool) -> Result<BatchJob>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (valid, invalid) = partition_item_codes(codes);
        if valid.is_empty() {
            return Err(ImportError::validation(match invalid.first() {
                Some((raw, e)) => format!("no valid item codes in batch (first rejected '{}': {})", raw, e),
                None => "no item codes in batch".to_string(),
            }));
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut job = BatchJob::new(batch_id.clone(), IMPORT_KIND, valid, force_update);
        for (raw, err) in &invalid {
            job.log_error(raw, err, self.config.error_log_cap);
            job.record_outcome(ItemResult::failed(raw, err, 0));
        }

        self.acquire_lock(&batch_id).await?;
        job.transition(BatchStatus::Running, "start")?;

        let saved = async {
            self.save(&job).await?;
            self.store
                .set(
                    &active_key(IMPORT_KIND),
                    json!(batch_id),
                    Some(self.config.job_retention()),
                )
                .await
        }
        .await;
        if let Err(e) = saved {
            self.release_lock(&batch_id).await;
            return Err(e);
        }

        tracing::info!(
            "🚀 Batch {} started with {} codes ({} rejected)",
            batch_id,
            job.item_codes.len(),
            invalid.len()
        );
        Ok(job)
    }

    /// 建立批次並在背景執行，立即回傳 batch id
    pub async fn import_batch<I, S>(&self, codes: I, force_update: bool) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let job = self.start(codes, force_update).await?;
        let batch_id = job.batch_id.clone();

        let worker = self.clone();
        let id = batch_id.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run_batch(&id).await {
                tracing::error!("❌ Batch {} worker stopped: {}", id, e);
            }
        });
        Ok(batch_id)
    }

    /// worker 主迴圈；呼叫前必須已持有鎖
    pub async fn run_batch(&self, batch_id: &str) -> Result<BatchJob> {
        let cancel = CancellationToken::new();
        let stop_watcher = CancellationToken::new();
        let watcher = self.spawn_control_watcher(batch_id, cancel.clone(), stop_watcher.clone());

        let result = self.drive(batch_id, &cancel).await;

        stop_watcher.cancel();
        let _ = watcher.await;
        let _ = self.store.delete(&control_key(batch_id)).await;
        self.release_lock(batch_id).await;
        result
    }

    fn spawn_control_watcher(
        &self,
        batch_id: &str,
        cancel: CancellationToken,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let key = control_key(batch_id);
        let poll = self.config.control_poll();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(poll) => {}
                }
                if let Ok(Some(raw)) = store.get(&key).await {
                    if serde_json::from_value::<BatchControl>(raw).ok() == Some(BatchControl::Cancel) {
                        // 中斷退避等待；進行中的請求會自然完成
                        cancel.cancel();
                        return;
                    }
                }
            }
        })
    }

    async fn drive(&self, batch_id: &str, cancel: &CancellationToken) -> Result<BatchJob> {
        let mut job = self.get_status(batch_id).await?;
        let log = ContextLogger::new(
            self.log.clone(),
            vec![("batch_id".to_string(), batch_id.to_string())],
        );
        log.info("▶️ Worker started", &[("remaining", job.pending.len().to_string())]);

        let mut consecutive_auth = 0usize;

        loop {
            if !self.heartbeat(batch_id).await? {
                job.failure_reason = Some("batch lock was taken over".to_string());
                self.finish(&mut job, BatchStatus::Failed, &log).await?;
                break;
            }

            let signal = if cancel.is_cancelled() {
                Some(BatchControl::Cancel)
            } else {
                self.take_control(batch_id).await?
            };
            if let Some(signal) = signal {
                self.apply_signal(&mut job, signal, &log).await?;
            }

            match job.status {
                BatchStatus::Paused => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.config.control_poll()) => {}
                    }
                    continue;
                }
                BatchStatus::Running => {}
                _ => break,
            }

            let Some(item) = job.pending.pop_front() else {
                let next = if job.all_failed_with("auth") {
                    job.failure_reason = Some("every item failed authentication".to_string());
                    BatchStatus::Failed
                } else {
                    BatchStatus::Completed
                };
                self.finish(&mut job, next, &log).await?;
                break;
            };

            job.current_code = Some(item.code.clone());
            let item_started = Instant::now();
            let result = self.import_item(&item.code, job.force_update, cancel).await;
            let attempts = item.attempts + 1;

            match result {
                Ok(imported) => {
                    consecutive_auth = 0;
                    log.debug(
                        "✅ Item imported",
                        &[
                            ("code", item.code.to_string()),
                            ("outcome", format!("{:?}", imported.outcome)),
                        ],
                    );
                    job.record_outcome(ItemResult::completed(
                        &item.code,
                        imported.outcome,
                        imported.catalog_id,
                        attempts,
                    ));
                }
                Err(ImportError::Cancelled) => {
                    // 未計入，留給取消流程處理
                    job.pending.push_front(item);
                    continue;
                }
                Err(e) => {
                    job.log_error(item.code.as_str(), &e, self.config.error_log_cap);
                    if e.is_retryable() && attempts <= self.config.max_retries {
                        log.warn(
                            "🔁 Item re-queued",
                            &[
                                ("code", item.code.to_string()),
                                ("attempts", attempts.to_string()),
                                ("error", e.to_string()),
                            ],
                        );
                        job.pending.push_back(PendingItem {
                            code: item.code,
                            attempts,
                        });
                    } else {
                        consecutive_auth = if e.is_auth() { consecutive_auth + 1 } else { 0 };
                        log.warn(
                            "❌ Item failed",
                            &[("code", item.code.to_string()), ("error", e.to_string())],
                        );
                        job.record_outcome(ItemResult::failed(item.code.as_str(), &e, attempts));
                    }
                }
            }
            job.busy_millis += item_started.elapsed().as_millis() as u64;

            if self.config.fatal_auth_threshold > 0
                && consecutive_auth >= self.config.fatal_auth_threshold
            {
                job.failure_reason = Some(format!(
                    "{} consecutive authentication failures",
                    consecutive_auth
                ));
                self.finish(&mut job, BatchStatus::Failed, &log).await?;
                break;
            }

            self.persist(&mut job, &log).await?;
            self.reporter.report(&job.progress());
        }

        Ok(job)
    }

    async fn apply_signal(
        &self,
        job: &mut BatchJob,
        signal: BatchControl,
        log: &ContextLogger,
    ) -> Result<()> {
        let (target, action) = match signal {
            BatchControl::Pause => (BatchStatus::Paused, "pause"),
            BatchControl::Resume => (BatchStatus::Running, "resume"),
            BatchControl::Cancel => (BatchStatus::Cancelled, "cancel"),
        };
        if job.status == target || !job.status.can_transition_to(target) {
            log.debug("Ignoring control signal", &[("signal", action.to_string())]);
            return Ok(());
        }

        if target.is_terminal() {
            self.finish(job, target, log).await
        } else {
            job.transition(target, action)?;
            log.info("⏯️ Batch state changed", &[("status", target.to_string())]);
            self.persist(job, log).await?;
            self.reporter.report(&job.progress());
            Ok(())
        }
    }

    async fn finish(
        &self,
        job: &mut BatchJob,
        status: BatchStatus,
        log: &ContextLogger,
    ) -> Result<()> {
        job.transition(status, status.as_str())?;
        self.persist(job, log).await?;
        self.reporter.report(&job.progress());

        let fields = [
            ("status", status.to_string()),
            ("processed", job.processed.to_string()),
            ("success", job.success.to_string()),
            ("skipped", job.skipped.to_string()),
            ("failed", job.failed.to_string()),
        ];
        match status {
            BatchStatus::Failed => log.error(
                &format!(
                    "💥 Batch failed: {}",
                    job.failure_reason.as_deref().unwrap_or("unknown reason")
                ),
                &fields,
            ),
            _ => log.info("🏁 Batch finished", &fields),
        }
        Ok(())
    }

    /// 寫不進去的工作紀錄代表批次無法繼續
    async fn persist(&self, job: &mut BatchJob, log: &ContextLogger) -> Result<()> {
        if let Err(e) = self.save(job).await {
            log.error("💾 Could not persist batch job", &[("error", e.to_string())]);
            if job.status.can_transition_to(BatchStatus::Failed) {
                let _ = job.transition(BatchStatus::Failed, "fail");
                job.failure_reason = Some(format!("job record could not be persisted: {}", e));
                let _ = self.save(job).await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn save(&self, job: &BatchJob) -> Result<()> {
        self.store
            .set(
                &job_key(&job.batch_id),
                serde_json::to_value(job)?,
                Some(self.config.job_retention()),
            )
            .await
    }

    // ---- 鎖 ----

    async fn acquire_lock(&self, batch_id: &str) -> Result<()> {
        let acquired = self
            .store
            .set_if_absent(
                &lock_key(IMPORT_KIND),
                json!(batch_id),
                Some(self.config.lock_timeout()),
            )
            .await?;
        if acquired {
            return Ok(());
        }
        let holder = self.lock_holder().await?.unwrap_or_default();
        tracing::warn!("🔒 Batch {} is already running", holder);
        Err(ImportError::AlreadyRunning { batch_id: holder })
    }

    async fn lock_holder(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&lock_key(IMPORT_KIND))
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// 延長鎖的存活時間；鎖被別的批次拿走時回傳 false
    async fn heartbeat(&self, batch_id: &str) -> Result<bool> {
        match self.lock_holder().await? {
            Some(holder) if holder != batch_id => Ok(false),
            _ => {
                self.store
                    .set(
                        &lock_key(IMPORT_KIND),
                        json!(batch_id),
                        Some(self.config.lock_timeout()),
                    )
                    .await?;
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, batch_id: &str) {
        match self.lock_holder().await {
            Ok(Some(holder)) if holder == batch_id => {
                if let Err(e) = self.store.delete(&lock_key(IMPORT_KIND)).await {
                    tracing::warn!("⚠️ Failed to release batch lock: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Failed to read batch lock: {}", e),
        }
    }

    async fn worker_alive(&self, batch_id: &str) -> Result<bool> {
        Ok(self.lock_holder().await?.as_deref() == Some(batch_id))
    }

    // ---- 查詢與控制 ----

    pub async fn get_status(&self, batch_id: &str) -> Result<BatchJob> {
        match self.store.get(&job_key(batch_id)).await? {
            Some(raw) => Ok(serde_json::from_value(raw)?),
            None => Err(ImportError::BatchNotFound {
                batch_id: batch_id.to_string(),
            }),
        }
    }

    pub async fn active_batch_id(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&active_key(IMPORT_KIND))
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub async fn pause(&self, batch_id: &str) -> Result<BatchJob> {
        self.signal(batch_id, BatchControl::Pause).await
    }

    pub async fn resume(&self, batch_id: &str) -> Result<BatchJob> {
        self.signal(batch_id, BatchControl::Resume).await
    }

    pub async fn cancel(&self, batch_id: &str) -> Result<BatchJob> {
        self.signal(batch_id, BatchControl::Cancel).await
    }

    async fn signal(&self, batch_id: &str, signal: BatchControl) -> Result<BatchJob> {
        let mut job = self.get_status(batch_id).await?;
        let (target, action) = match signal {
            BatchControl::Pause => (BatchStatus::Paused, "pause"),
            BatchControl::Resume => (BatchStatus::Running, "resume"),
            BatchControl::Cancel => (BatchStatus::Cancelled, "cancel"),
        };
        if !job.status.can_transition_to(target) {
            return Err(ImportError::InvalidTransition {
                from: job.status.to_string(),
                action: action.to_string(),
            });
        }

        if self.worker_alive(batch_id).await? {
            // 取消訊號不會被之後的 pause/resume 覆蓋
            if signal != BatchControl::Cancel && self.pending_control(batch_id).await? == Some(BatchControl::Cancel) {
                tracing::info!("🛑 Batch {} is already being cancelled", batch_id);
                return Ok(job);
            }
            self.store
                .set(
                    &control_key(batch_id),
                    serde_json::to_value(signal)?,
                    Some(self.config.lock_timeout()),
                )
                .await?;
            tracing::info!("📨 Sent {} to batch {}", action, batch_id);
            return Ok(job);
        }

        // 沒有 worker：直接套用狀態轉移
        if target == BatchStatus::Running {
            if let Some(holder) = self.lock_holder().await? {
                return Err(ImportError::AlreadyRunning { batch_id: holder });
            }
            self.store
                .set(
                    &active_key(IMPORT_KIND),
                    json!(batch_id),
                    Some(self.config.job_retention()),
                )
                .await?;
        }
        job.transition(target, action)?;
        self.save(&job).await?;
        tracing::info!("⏯️ Batch {} is now {} (no live worker)", batch_id, job.status);
        Ok(job)
    }

    async fn pending_control(&self, batch_id: &str) -> Result<Option<BatchControl>> {
        Ok(self
            .store
            .get(&control_key(batch_id))
            .await?
            .and_then(|raw| serde_json::from_value(raw).ok()))
    }

    async fn take_control(&self, batch_id: &str) -> Result<Option<BatchControl>> {
        let signal = self.pending_control(batch_id).await?;
        if signal.is_some() {
            self.store.delete(&control_key(batch_id)).await?;
        }
        Ok(signal)
    }

    /// 移除已結束的批次紀錄
    pub async fn clear(&self, batch_id: &str) -> Result<()> {
        let job = self.get_status(batch_id).await?;
        if !job.status.is_terminal() {
            return Err(ImportError::InvalidTransition {
                from: job.status.to_string(),
                action: "clear".to_string(),
            });
        }
        self.store.delete(&job_key(batch_id)).await?;
        self.store.delete(&control_key(batch_id)).await?;
        if self.active_batch_id().await?.as_deref() == Some(batch_id) {
            self.store.delete(&active_key(IMPORT_KIND)).await?;
        }
        tracing::info!("🧹 Cleared batch {}", batch_id);
        Ok(())
    }

    // ---- 排程 ----

    /// 排程觸發時呼叫：接手孤兒批次、或啟動過期商品的同步批次
    pub async fn run_scheduled(&self) -> Result<ScheduledRun> {
        if let Some(active) = self.active_batch_id().await? {
            match self.get_status(&active).await {
                Ok(job) if job.status == BatchStatus::Running => {
                    let reclaimed = self
                        .store
                        .set_if_absent(
                            &lock_key(IMPORT_KIND),
                            json!(active),
                            Some(self.config.lock_timeout()),
                        )
                        .await?;
                    if reclaimed {
                        tracing::info!("🩹 Reclaiming orphaned batch {}", active);
                        self.run_batch(&active).await?;
                        return Ok(ScheduledRun::Resumed(active));
                    }
                    return Ok(ScheduledRun::Busy);
                }
                Ok(_) | Err(ImportError::BatchNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if self.lock_holder().await?.is_some() {
            return Ok(ScheduledRun::Busy);
        }
        if !self.scheduler.sync_enabled {
            return Ok(ScheduledRun::Idle);
        }

        let older_than = Utc::now() - chrono::Duration::hours(self.scheduler.stale_after_hours as i64);
        let due = self
            .catalog
            .codes_due_for_sync(older_than, self.scheduler.sync_batch_size)
            .await?;
        if due.is_empty() {
            return Ok(ScheduledRun::Idle);
        }

        tracing::info!("🔄 Scheduled sync of {} stale items", due.len());
        let codes: Vec<String> = due.iter().map(ItemCode::to_string).collect();
        let job = match self.start(codes, true).await {
            Ok(job) => job,
            Err(ImportError::AlreadyRunning { .. }) => return Ok(ScheduledRun::Busy),
            Err(e) => return Err(e),
        };
        self.run_batch(&job.batch_id).await?;
        Ok(ScheduledRun::Started(job.batch_id))
    }
}
