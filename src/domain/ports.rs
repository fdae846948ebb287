use crate::domain::batch::BatchProgress;
use crate::domain::model::{Credentials, ItemCode, ProductRecord, UpsertResult};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 帶 TTL 語意的鍵值儲存，快取與批次狀態都放在這裡
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// 僅在鍵不存在（或已過期）時寫入，回傳是否寫入成功
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// 依前綴列出尚未過期的項目
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for (key, _) in self.scan_prefix(prefix).await? {
            if self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// 宿主目錄系統
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn exists(&self, code: &ItemCode) -> Result<bool>;

    async fn upsert(&self, record: &ProductRecord) -> Result<UpsertResult>;

    async fn get_id_by_code(&self, code: &ItemCode) -> Result<Option<u64>>;

    /// 排程同步用：回傳在 `older_than` 之前更新過的商品代碼
    async fn codes_due_for_sync(
        &self,
        _older_than: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<ItemCode>> {
        Ok(Vec::new())
    }
}

pub trait CredentialSource: Send + Sync {
    fn get(&self) -> Result<Credentials>;
}

/// 商品 API 的呼叫介面，讓 orchestrator 不依賴具體的 HTTP client
#[async_trait]
pub trait ProductApi: Send + Sync {
    async fn fetch_items(
        &self,
        codes: &[ItemCode],
        resources: &[String],
        cancel: &CancellationToken,
    ) -> Result<ItemsResult>;

    async fn search_items(
        &self,
        request: &SearchRequest,
        resources: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value>;

    async fn fetch_variations(
        &self,
        parent: &ItemCode,
        resources: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value>;
}

/// 某一段子請求失敗的紀錄
#[derive(Debug)]
pub struct ChunkFailure {
    pub codes: Vec<ItemCode>,
    pub error: crate::utils::error::ImportError,
}

/// 合併後的 GetItems 結果；`payload` 依輸入順序排列
#[derive(Debug)]
pub struct ItemsResult {
    pub payload: Value,
    pub failures: Vec<ChunkFailure>,
}

impl ItemsResult {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// 找出某個代碼所屬失敗子請求的錯誤
    pub fn failure_for(&self, code: &ItemCode) -> Option<&crate::utils::error::ImportError> {
        self.failures
            .iter()
            .find(|f| f.codes.contains(code))
            .map(|f| &f.error)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchRequest {
    pub keywords: String,
    pub search_index: String,
    pub page: u32,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub brand: Option<String>,
    pub sort_by: Option<String>,
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &BatchProgress);
}

/// 不輸出任何東西的 reporter
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn report(&self, _progress: &BatchProgress) {}
}

pub type ScheduledTask = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// 排程觸發器；與任何宿主的 cron 機制解耦
pub trait Scheduler: Send + Sync {
    fn every(&self, interval: Duration, task: ScheduledTask) -> ScheduleHandle;
}

/// 停止排程用的 handle；drop 時不會停止
pub struct ScheduleHandle {
    token: CancellationToken,
}

impl ScheduleHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}
