use crate::api::ApiClient;
use crate::config::marketplace::MarketplaceTable;
use crate::config::ImportConfig;
use crate::core::cache::Cache;
use crate::core::normalizer::{Normalizer, MAX_SEARCH_PAGES};
use crate::core::orchestrator::{BatchOrchestrator, LogReporter, ScheduledRun};
use crate::domain::batch::{BatchJob, ItemOutcome};
use crate::domain::model::{ItemCode, SearchFilters, SearchPage, SearchType};
use crate::domain::ports::{
    CatalogStore, CredentialSource, KvStore, ScheduleHandle, ScheduledTask, Scheduler,
    SearchRequest,
};
use crate::utils::error::{ErrorPayload, ImportError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 單一項目匯入的對外結果；失敗時 `error` 帶有結構化錯誤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOneResult {
    pub success: bool,
    pub id: Option<u64>,
    pub message: String,
    pub outcome: Option<ItemOutcome>,
    pub updated: bool,
    pub error: Option<ErrorPayload>,
}

impl ImportOneResult {
    fn failure(message: String, error: &ImportError) -> Self {
        Self {
            success: false,
            id: None,
            message,
            outcome: Some(ItemOutcome::Failed),
            updated: false,
            error: Some(error.to_payload()),
        }
    }
}

/// 對外的匯入服務：搜尋、單筆匯入、批次操作與排程
#[derive(Clone)]
pub struct ImportService {
    orchestrator: BatchOrchestrator,
    cache: Option<Arc<Cache>>,
    default_force_update: bool,
}

impl ImportService {
    pub fn new(orchestrator: BatchOrchestrator) -> Self {
        let default_force_update = orchestrator.config().force_update;
        Self {
            orchestrator,
            cache: None,
            default_force_update,
        }
    }

    /// 依設定組出完整的 client、快取、正規化器與 orchestrator
    pub fn from_config(
        config: &ImportConfig,
        credentials: &dyn CredentialSource,
        store: Arc<dyn KvStore>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Result<Self> {
        let credentials = credentials.get()?;
        let marketplaces = MarketplaceTable::builtin();
        let currency = marketplaces.lookup(&credentials.marketplace)?.currency;

        let cache = Arc::new(Cache::new(store.clone(), config.cache.clone()));
        let client = ApiClient::new(
            credentials,
            &marketplaces,
            config.api.clone(),
            Some(cache.clone()),
        )?;

        let orchestrator = BatchOrchestrator::new(
            Arc::new(client),
            catalog,
            store,
            Normalizer::new(config.import.max_category_depth, currency),
            config.import.clone(),
        )
        .with_scheduler_config(config.scheduler.clone())
        .with_resources(config.api.resources.clone().unwrap_or_default())
        .with_reporter(Arc::new(LogReporter));

        Ok(Self {
            orchestrator,
            cache: Some(cache),
            default_force_update: config.import.force_update,
        })
    }

    pub fn orchestrator(&self) -> &BatchOrchestrator {
        &self.orchestrator
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    pub fn default_force_update(&self) -> bool {
        self.default_force_update
    }

    pub async fn search(
        &self,
        term: &str,
        search_type: SearchType,
        filters: &SearchFilters,
    ) -> Result<SearchPage> {
        let cancel = CancellationToken::new();
        match search_type {
            SearchType::Code => {
                let codes = ItemCode::parse_list(term)?;
                if codes.is_empty() {
                    return Err(ImportError::validation("no item codes given"));
                }
                let fetched = self
                    .orchestrator
                    .api()
                    .fetch_items(&codes, &[], &cancel)
                    .await?;
                let parsed = self.orchestrator.normalizer().parse_items(&fetched.payload)?;
                for error in &parsed.errors {
                    tracing::warn!("⚠️ Vendor error {}: {}", error.code, error.message);
                }
                let total = parsed.records.len() as u64;
                Ok(SearchPage {
                    items: parsed.records,
                    page: 1,
                    total_pages: if total == 0 { 0 } else { 1 },
                    total_results: total,
                })
            }
            SearchType::Keywords => {
                let request = search_request(term, filters)?;
                let raw = self
                    .orchestrator
                    .api()
                    .search_items(&request, &[], &cancel)
                    .await?;
                self.orchestrator.normalizer().parse_search(&raw, request.page)
            }
        }
    }

    pub async fn import_one(&self, raw_code: &str, force_update: bool) -> ImportOneResult {
        let code = match ItemCode::parse(raw_code) {
            Ok(code) => code,
            Err(e) => return ImportOneResult::failure(e.to_string(), &e),
        };

        let cancel = CancellationToken::new();
        match self
            .orchestrator
            .import_item(&code, force_update, &cancel)
            .await
        {
            Ok(imported) => {
                let message = match imported.outcome {
                    ItemOutcome::Created => format!("Imported {}", code),
                    ItemOutcome::Updated => format!("Updated {}", code),
                    ItemOutcome::Skipped => format!("{} is already in the catalog", code),
                    ItemOutcome::Failed => format!("{} failed", code),
                };
                tracing::info!("✅ {}", message);
                ImportOneResult {
                    success: true,
                    id: imported.catalog_id,
                    message,
                    outcome: Some(imported.outcome),
                    updated: imported.outcome == ItemOutcome::Updated,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!("❌ Import of {} failed: {}", code, e);
                ImportOneResult::failure(e.user_friendly_message(), &e)
            }
        }
    }

    pub async fn import_batch<I, S>(&self, codes: I, force_update: bool) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.orchestrator.import_batch(codes, force_update).await
    }

    pub async fn status(&self, batch_id: &str) -> Result<BatchJob> {
        self.orchestrator.get_status(batch_id).await
    }

    pub async fn pause(&self, batch_id: &str) -> Result<BatchJob> {
        self.orchestrator.pause(batch_id).await
    }

    pub async fn resume(&self, batch_id: &str) -> Result<BatchJob> {
        self.orchestrator.resume(batch_id).await
    }

    pub async fn cancel(&self, batch_id: &str) -> Result<BatchJob> {
        self.orchestrator.cancel(batch_id).await
    }

    pub async fn clear(&self, batch_id: &str) -> Result<()> {
        self.orchestrator.clear(batch_id).await
    }

    pub async fn run_scheduled(&self) -> Result<ScheduledRun> {
        self.orchestrator.run_scheduled().await
    }

    /// 交給排程器定期執行 `run_scheduled`
    pub fn schedule(&self, scheduler: &dyn Scheduler, interval: Duration) -> ScheduleHandle {
        let orchestrator = self.orchestrator.clone();
        let task: ScheduledTask = Arc::new(move || {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.run_scheduled().await {
                    Ok(ScheduledRun::Idle) => tracing::debug!("💤 Nothing to sync"),
                    Ok(run) => tracing::info!("⏰ Scheduled run: {:?}", run),
                    Err(e) => tracing::error!("❌ Scheduled run failed: {}", e),
                }
            })
        });
        tracing::info!("⏰ Scheduling sync every {:?}", interval);
        scheduler.every(interval, task)
    }
}

fn search_request(term: &str, filters: &SearchFilters) -> Result<SearchRequest> {
    let keywords = term.trim();
    if keywords.is_empty() {
        return Err(ImportError::validation("search keywords must not be empty"));
    }

    let page = filters.page.unwrap_or(1);
    if page == 0 || page > MAX_SEARCH_PAGES {
        return Err(ImportError::validation(format!(
            "page must be between 1 and {}",
            MAX_SEARCH_PAGES
        )));
    }
    if let (Some(min), Some(max)) = (filters.min_price, filters.max_price) {
        if min > max {
            return Err(ImportError::validation("min_price must not exceed max_price"));
        }
    }

    Ok(SearchRequest {
        keywords: keywords.to_string(),
        search_index: filters.search_index.clone().unwrap_or_default(),
        page,
        min_price: filters.min_price,
        max_price: filters.max_price,
        brand: filters.brand.clone(),
        sort_by: filters.sort_by.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_request_validation() {
        let filters = SearchFilters::default();
        assert!(search_request("  ", &filters).is_err());

        let request = search_request(" usb hub ", &filters).unwrap();
        assert_eq!(request.keywords, "usb hub");
        assert_eq!(request.page, 1);

        let too_far = SearchFilters {
            page: Some(11),
            ..Default::default()
        };
        assert!(search_request("hub", &too_far).is_err());

        let inverted = SearchFilters {
            min_price: Some(500),
            max_price: Some(100),
            ..Default::default()
        };
        assert!(search_request("hub", &inverted).is_err());
    }

    #[test]
    fn test_failure_result_carries_payload() {
        let err = ImportError::NotFound {
            message: "B000000001".into(),
        };
        let result = ImportOneResult::failure("gone".into(), &err);
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, "not_found");
    }
}
