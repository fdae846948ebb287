//! Group-scoped cache with per-group TTL and quarter-LRU eviction.
//!
//! Entries live in a [`KvStore`] under `cache:{group}:{sha256(key)}`. Read
//! times go to a sibling `cache_access:{group}:{sha256(key)}` record so a hit
//! never rewrites the payload. The cache is advisory: storage failures are
//! logged and reported as misses.

use crate::config::CacheConfig;
use crate::domain::ports::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KEY_PREFIX: &str = "cache:";
const ACCESS_PREFIX: &str = "cache_access:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheGroup {
    Products,
    Searches,
    Variations,
    Categories,
    ApiResponses,
}

impl CacheGroup {
    pub const ALL: [CacheGroup; 5] = [
        CacheGroup::Products,
        CacheGroup::Searches,
        CacheGroup::Variations,
        CacheGroup::Categories,
        CacheGroup::ApiResponses,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Searches => "searches",
            Self::Variations => "variations",
            Self::Categories => "categories",
            Self::ApiResponses => "api_responses",
        }
    }

    fn prefix(self) -> String {
        format!("{}{}:", KEY_PREFIX, self.as_str())
    }

    fn access_prefix(self) -> String {
        format!("{}{}:", ACCESS_PREFIX, self.as_str())
    }
}

impl fmt::Display for CacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CacheGroup {
    type Err = crate::utils::error::ImportError;

    fn from_str(s: &str) -> crate::utils::error::Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == wanted)
            .ok_or_else(|| {
                crate::utils::error::ImportError::validation(format!("unknown cache group '{}'", s))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub group: CacheGroup,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
    pub size_by_group: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
}

pub struct Cache {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
    counters: Mutex<Counters>,
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn ttl_for(&self, group: CacheGroup) -> Duration {
        let secs = match group {
            CacheGroup::Products => self.config.products_ttl_seconds,
            CacheGroup::Searches => self.config.searches_ttl_seconds,
            CacheGroup::Variations => self.config.variations_ttl_seconds,
            CacheGroup::Categories => self.config.categories_ttl_seconds,
            CacheGroup::ApiResponses => self.config.api_responses_ttl_seconds,
        };
        Duration::from_secs(secs)
    }

    /// 內容定址：邏輯鍵的 SHA-256
    pub fn hash_key(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn storage_key(key: &str, group: CacheGroup) -> String {
        format!("{}{}", group.prefix(), Self::hash_key(key))
    }

    /// 由項目鍵換成對應的存取時間鍵
    fn access_key(storage_key: &str, group: CacheGroup) -> String {
        let hash = storage_key.strip_prefix(&group.prefix()).unwrap_or(storage_key);
        format!("{}{}", group.access_prefix(), hash)
    }

    fn bump(&self, f: impl FnOnce(&mut Counters)) {
        if let Ok(mut counters) = self.counters.lock() {
            f(&mut counters);
        }
    }

    pub async fn get(&self, key: &str, group: CacheGroup) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let storage_key = Self::storage_key(key, group);

        let raw = match self.store.get(&storage_key).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("⚠️ Cache read failed for group {}: {}", group, e);
                None
            }
        };

        let now = Utc::now();
        let entry = raw.and_then(|v| serde_json::from_value::<CacheEntry>(v).ok());
        match entry {
            Some(entry) if !entry.is_expired(now) => {
                self.bump(|c| c.hits += 1);
                self.touch(&storage_key, group, &entry, now).await;
                Some(entry.payload)
            }
            Some(_) => {
                // 過期項目順手清掉
                let _ = self.store.delete(&storage_key).await;
                let _ = self.store.delete(&Self::access_key(&storage_key, group)).await;
                self.bump(|c| c.misses += 1);
                None
            }
            None => {
                self.bump(|c| c.misses += 1);
                None
            }
        }
    }

    pub async fn set(
        &self,
        key: &str,
        value: Value,
        group: CacheGroup,
        ttl_override: Option<Duration>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let storage_key = Self::storage_key(key, group);
        let ttl = ttl_override.unwrap_or_else(|| self.ttl_for(group));

        if let Err(e) = self.evict_if_full(group, &storage_key).await {
            tracing::warn!("⚠️ Cache eviction failed for group {}: {}", group, e);
        }

        let now = Utc::now();
        let entry = CacheEntry {
            key: key.to_string(),
            group,
            payload: value,
            stored_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            last_access_at: now,
        };

        let stored = match serde_json::to_value(&entry) {
            Ok(raw) => match self.store.set(&storage_key, raw, Some(ttl)).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("⚠️ Cache write failed for group {}: {}", group, e);
                    false
                }
            },
            Err(e) => {
                tracing::warn!("⚠️ Cache entry serialization failed: {}", e);
                false
            }
        };
        if stored {
            self.bump(|c| c.sets += 1);
        }
        stored
    }

    /// 只寫存取時間，項目本身不動，避免蓋掉並行的 set
    async fn touch(&self, storage_key: &str, group: CacheGroup, entry: &CacheEntry, now: DateTime<Utc>) {
        let remaining = (entry.expires_at - now).to_std().unwrap_or_default();
        let access_key = Self::access_key(storage_key, group);
        if let Err(e) = self.store.set(&access_key, serde_json::json!(now), Some(remaining)).await {
            tracing::debug!("Cache access-time refresh failed: {}", e);
        }
    }

    async fn access_times(&self, group: CacheGroup) -> BTreeMap<String, DateTime<Utc>> {
        let prefix = group.access_prefix();
        let records = match self.store.scan_prefix(&prefix).await {
            Ok(records) => records,
            Err(e) => {
                tracing::debug!("Cache access-time scan failed: {}", e);
                Vec::new()
            }
        };
        records
            .into_iter()
            .filter_map(|(k, v)| {
                let at = serde_json::from_value::<DateTime<Utc>>(v).ok()?;
                let hash = k.strip_prefix(&prefix)?.to_string();
                Some((format!("{}{}", group.prefix(), hash), at))
            })
            .collect()
    }

    /// 群組已滿時，依 last_access_at 淘汰最舊的四分之一（至少一筆）
    async fn evict_if_full(
        &self,
        group: CacheGroup,
        incoming_key: &str,
    ) -> crate::utils::error::Result<()> {
        let entries = self.store.scan_prefix(&group.prefix()).await?;
        if entries.len() < self.config.max_items_per_group
            || entries.iter().any(|(k, _)| k == incoming_key)
        {
            return Ok(());
        }

        // 最近一次讀取或寫入，取較晚者
        let accessed = self.access_times(group).await;
        let mut by_access: Vec<(String, DateTime<Utc>)> = entries
            .into_iter()
            .map(|(k, v)| {
                let stored = serde_json::from_value::<CacheEntry>(v)
                    .map(|e| e.last_access_at)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let last_access = accessed.get(&k).map_or(stored, |read| stored.max(*read));
                (k, last_access)
            })
            .collect();
        by_access.sort_by_key(|(_, at)| *at);

        let quota = (by_access.len() / 4).max(1);
        let mut evicted = 0;
        for (key, _) in by_access.into_iter().take(quota) {
            if self.store.delete(&key).await? {
                evicted += 1;
            }
            self.store.delete(&Self::access_key(&key, group)).await?;
        }
        tracing::debug!("🧹 Evicted {} entries from cache group {}", evicted, group);
        self.bump(|c| c.evictions += evicted);
        Ok(())
    }

    pub async fn delete(&self, key: &str, group: CacheGroup) -> bool {
        let storage_key = Self::storage_key(key, group);
        let _ = self.store.delete(&Self::access_key(&storage_key, group)).await;
        match self.store.delete(&storage_key).await {
            Ok(removed) => {
                if removed {
                    self.bump(|c| c.deletes += 1);
                }
                removed
            }
            Err(e) => {
                tracing::warn!("⚠️ Cache delete failed for group {}: {}", group, e);
                false
            }
        }
    }

    pub async fn clear_group(&self, group: CacheGroup) -> usize {
        if let Err(e) = self.store.delete_prefix(&group.access_prefix()).await {
            tracing::debug!("Cache access-time clear failed for group {}: {}", group, e);
        }
        match self.store.delete_prefix(&group.prefix()).await {
            Ok(removed) => {
                self.bump(|c| c.deletes += removed as u64);
                removed
            }
            Err(e) => {
                tracing::warn!("⚠️ Cache clear failed for group {}: {}", group, e);
                0
            }
        }
    }

    pub async fn clear_all(&self) -> usize {
        let mut removed = 0;
        for group in CacheGroup::ALL {
            removed += self.clear_group(group).await;
        }
        removed
    }

    pub async fn statistics(&self) -> CacheStatistics {
        let mut size_by_group = BTreeMap::new();
        for group in CacheGroup::ALL {
            let size = self
                .store
                .scan_prefix(&group.prefix())
                .await
                .map(|entries| entries.len())
                .unwrap_or(0);
            size_by_group.insert(group.as_str().to_string(), size);
        }

        let (hits, misses, sets, deletes, evictions) = self
            .counters
            .lock()
            .map(|c| (c.hits, c.misses, c.sets, c.deletes, c.evictions))
            .unwrap_or_default();
        let lookups = hits + misses;

        CacheStatistics {
            hits,
            misses,
            sets,
            deletes,
            evictions,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            size_by_group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryKvStore;
    use crate::utils::error::{ImportError, Result};
    use async_trait::async_trait;
    use serde_json::json;

    fn cache_with(max_items: usize) -> Cache {
        let config = CacheConfig {
            max_items_per_group: max_items,
            ..CacheConfig::default()
        };
        Cache::new(Arc::new(MemoryKvStore::new()), config)
    }

    #[tokio::test]
    async fn test_set_then_get_within_ttl() {
        let cache = cache_with(100);
        assert!(cache.set("B000000001", json!({"title": "Mug"}), CacheGroup::Products, None).await);

        let value = cache.get("B000000001", CacheGroup::Products).await;
        assert_eq!(value, Some(json!({"title": "Mug"})));
        // 同一個鍵在其他群組中不存在
        assert!(cache.get("B000000001", CacheGroup::Searches).await.is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let cache = cache_with(100);
        cache
            .set("short", json!(1), CacheGroup::Searches, Some(Duration::from_millis(50)))
            .await;
        assert!(cache.get("short", CacheGroup::Searches).await.is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("short", CacheGroup::Searches).await.is_none());
    }

    #[tokio::test]
    async fn test_quarter_lru_eviction_keeps_recent_entries() {
        let cache = cache_with(8);
        for i in 0..8 {
            cache.set(&format!("k{}", i), json!(i), CacheGroup::Products, None).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // k0 與 k1 剛被讀取，成為最新
        cache.get("k0", CacheGroup::Products).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.get("k1", CacheGroup::Products).await;
        tokio::time::sleep(Duration::from_millis(2)).await;

        cache.set("k8", json!(8), CacheGroup::Products, None).await;

        assert!(cache.get("k0", CacheGroup::Products).await.is_some());
        assert!(cache.get("k1", CacheGroup::Products).await.is_some());
        assert!(cache.get("k2", CacheGroup::Products).await.is_none());
        assert!(cache.get("k3", CacheGroup::Products).await.is_none());
        assert!(cache.get("k4", CacheGroup::Products).await.is_some());
        assert!(cache.get("k8", CacheGroup::Products).await.is_some());

        let stats = cache.statistics().await;
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.size_by_group["products"], 7);
    }

    #[tokio::test]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let cache = cache_with(4);
        for i in 0..4 {
            cache.set(&format!("k{}", i), json!(i), CacheGroup::Variations, None).await;
        }
        cache.set("k2", json!("new"), CacheGroup::Variations, None).await;

        assert_eq!(cache.statistics().await.evictions, 0);
        assert_eq!(cache.get("k2", CacheGroup::Variations).await, Some(json!("new")));
    }

    #[tokio::test]
    async fn test_eviction_is_per_group() {
        let cache = cache_with(4);
        for i in 0..4 {
            cache.set(&format!("p{}", i), json!(i), CacheGroup::Products, None).await;
        }
        cache.set("s0", json!(0), CacheGroup::Searches, None).await;

        let stats = cache.statistics().await;
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.size_by_group["products"], 4);
        assert_eq!(stats.size_by_group["searches"], 1);
    }

    #[tokio::test]
    async fn test_statistics_and_clear() {
        let cache = cache_with(100);
        cache.set("a", json!(1), CacheGroup::Categories, None).await;
        cache.set("b", json!(2), CacheGroup::ApiResponses, None).await;
        cache.get("a", CacheGroup::Categories).await;
        cache.get("missing", CacheGroup::Categories).await;

        let stats = cache.statistics().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 2);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);

        assert!(cache.delete("a", CacheGroup::Categories).await);
        assert_eq!(cache.clear_all().await, 1);
        assert_eq!(cache.statistics().await.size_by_group["api_responses"], 0);
    }

    /// 讀取較慢的 store，讓 get 與 set 交錯
    struct SlowGetStore {
        inner: MemoryKvStore,
    }

    #[async_trait]
    impl KvStore for SlowGetStore {
        async fn get(&self, key: &str) -> Result<Option<Value>> {
            let value = self.inner.get(key).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            value
        }
        async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }
        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
            self.inner.scan_prefix(prefix).await
        }
    }

    /// 命中時更新存取時間不可蓋掉同時寫入的新值
    #[tokio::test]
    async fn test_hit_does_not_overwrite_concurrent_set() {
        let store = Arc::new(SlowGetStore {
            inner: MemoryKvStore::new(),
        });
        let cache = Arc::new(Cache::new(store, CacheConfig::default()));
        cache.set("k", json!("old"), CacheGroup::Products, None).await;

        let reader = cache.clone();
        let pending = tokio::spawn(async move { reader.get("k", CacheGroup::Products).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("k", json!("new"), CacheGroup::Products, None).await;

        assert_eq!(pending.await.unwrap(), Some(json!("old")));
        assert_eq!(cache.get("k", CacheGroup::Products).await, Some(json!("new")));
    }

    #[tokio::test]
    async fn test_clear_group_drops_access_records() {
        let store = Arc::new(MemoryKvStore::new());
        let cache = Cache::new(store.clone(), CacheConfig::default());
        cache.set("k", json!(1), CacheGroup::Searches, None).await;
        cache.get("k", CacheGroup::Searches).await;
        assert_eq!(store.scan_prefix("cache_access:searches:").await.unwrap().len(), 1);

        assert_eq!(cache.clear_group(CacheGroup::Searches).await, 1);
        assert!(store.scan_prefix("cache_access:searches:").await.unwrap().is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            Err(ImportError::storage("down"))
        }
        async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<()> {
            Err(ImportError::storage("down"))
        }
        async fn set_if_absent(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<bool> {
            Err(ImportError::storage("down"))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(ImportError::storage("down"))
        }
        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<(String, Value)>> {
            Err(ImportError::storage("down"))
        }
    }

    #[tokio::test]
    async fn test_store_failures_are_swallowed() {
        let cache = Cache::new(Arc::new(BrokenStore), CacheConfig::default());
        assert!(!cache.set("k", json!(1), CacheGroup::Products, None).await);
        assert!(cache.get("k", CacheGroup::Products).await.is_none());
        assert_eq!(cache.statistics().await.misses, 1);
    }
}
