use crate::domain::model::{ItemCode, ProductRecord, UpsertResult};
use crate::domain::ports::{CatalogStore, KvStore};
use crate::utils::error::{ImportError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

const ITEM_PREFIX: &str = "catalog:item:";
const SEQUENCE_KEY: &str = "catalog:sequence";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: u64,
    pub record: ProductRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 以 KvStore 保存的目錄，CLI 與測試使用；正式環境由宿主系統實作 CatalogStore
pub struct KvCatalogStore {
    store: Arc<dyn KvStore>,
    // 序號的讀寫需要序列化
    write_lock: Mutex<()>,
}

impl KvCatalogStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn item_key(code: &ItemCode) -> String {
        format!("{}{}", ITEM_PREFIX, code)
    }

    pub async fn get(&self, code: &ItemCode) -> Result<Option<CatalogEntry>> {
        match self.store.get(&Self::item_key(code)).await? {
            Some(raw) => serde_json::from_value(raw).map(Some).map_err(|e| ImportError::Catalog {
                message: format!("corrupt catalog entry for {}: {}", code, e),
            }),
            None => Ok(None),
        }
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.scan_prefix(ITEM_PREFIX).await?.len())
    }

    async fn next_id(&self) -> Result<u64> {
        let current = self
            .store
            .get(SEQUENCE_KEY)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let next = current + 1;
        self.store.set(SEQUENCE_KEY, json!(next), None).await?;
        Ok(next)
    }
}

#[async_trait]
impl CatalogStore for KvCatalogStore {
    async fn exists(&self, code: &ItemCode) -> Result<bool> {
        Ok(self.store.get(&Self::item_key(code)).await?.is_some())
    }

    async fn upsert(&self, record: &ProductRecord) -> Result<UpsertResult> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let (entry, created) = match self.get(&record.code).await? {
            Some(existing) => (
                CatalogEntry {
                    id: existing.id,
                    record: record.clone(),
                    created_at: existing.created_at,
                    updated_at: now,
                },
                false,
            ),
            None => (
                CatalogEntry {
                    id: self.next_id().await?,
                    record: record.clone(),
                    created_at: now,
                    updated_at: now,
                },
                true,
            ),
        };

        self.store
            .set(&Self::item_key(&record.code), serde_json::to_value(&entry)?, None)
            .await?;
        tracing::debug!(
            "💾 Catalog {} {} (id {})",
            if created { "created" } else { "updated" },
            record.code,
            entry.id
        );
        Ok(UpsertResult {
            id: entry.id,
            created,
        })
    }

    async fn get_id_by_code(&self, code: &ItemCode) -> Result<Option<u64>> {
        Ok(self.get(code).await?.map(|e| e.id))
    }

    async fn codes_due_for_sync(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ItemCode>> {
        let mut stale: Vec<(DateTime<Utc>, ItemCode)> = self
            .store
            .scan_prefix(ITEM_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(_, raw)| serde_json::from_value::<CatalogEntry>(raw).ok())
            .filter(|e| e.updated_at < older_than)
            .map(|e| (e.updated_at, e.record.code))
            .collect();
        // 最久沒更新的優先
        stale.sort();
        Ok(stale.into_iter().take(limit).map(|(_, code)| code).collect())
    }
}
