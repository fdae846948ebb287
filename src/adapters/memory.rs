use crate::domain::ports::KvStore;
use crate::utils::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// 行程內的 KvStore，測試與單一行程部署使用
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.read().await.values().filter(|s| s.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let slots = self.slots.read().await;
        Ok(slots
            .get(key)
            .filter(|s| s.is_live(Instant::now()))
            .map(|s| s.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut slots = self.slots.write().await;
        slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let mut slots = self.slots.write().await;
        let now = Instant::now();
        if slots.get(key).is_some_and(|s| s.is_live(now)) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut slots = self.slots.write().await;
        Ok(slots
            .remove(key)
            .is_some_and(|s| s.is_live(Instant::now())))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let mut slots = self.slots.write().await;
        let now = Instant::now();
        // 掃描時順便清除過期項目
        slots.retain(|_, s| s.is_live(now));

        let mut found: Vec<(String, Value)> = slots
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}
