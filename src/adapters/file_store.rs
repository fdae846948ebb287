use crate::domain::ports::KvStore;
use crate::utils::error::{ImportError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    key: String,
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Utc::now())
    }
}

/// 以目錄為底的 KvStore：每個鍵一個 JSON 檔，讓不同行程（CLI、排程）共享狀態
#[derive(Debug, Clone)]
pub struct FileKvStore {
    base_path: PathBuf,
}

impl FileKvStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // 檔名用 hex 編碼，避免鍵中的 ':' 與 '/' 造成問題
    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", hex::encode(key.as_bytes())))
    }

    fn key_from_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(".json")?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn read_slot(&self, path: &Path) -> Result<Option<StoredValue>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<StoredValue>(&bytes) {
                Ok(slot) => Ok(Some(slot)),
                Err(e) => {
                    // 寫到一半的檔案視為不存在
                    tracing::warn!("⚠️ Ignoring unreadable store file {}: {}", path.display(), e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ImportError::Io(e)),
        }
    }

    fn encode(key: &str, value: Value, ttl: Option<Duration>) -> Result<Vec<u8>> {
        let expires_at = ttl
            .map(|t| chrono::Duration::from_std(t).map(|d| Utc::now() + d))
            .transpose()
            .map_err(|e| ImportError::storage(format!("ttl out of range: {}", e)))?;
        let slot = StoredValue {
            key: key.to_string(),
            value,
            expires_at,
        };
        Ok(serde_json::to_vec(&slot)?)
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let slot = self.read_slot(&self.path_for(key)).await?;
        Ok(slot.filter(StoredValue::is_live).map(|s| s.value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.path_for(key);
        let data = Self::encode(key, value, ttl)?;

        // 先寫暫存檔再 rename，讀取端不會看到半個檔案
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        self.ensure_dir().await?;
        let path = self.path_for(key);

        if let Some(existing) = self.read_slot(&path).await? {
            if existing.is_live() {
                return Ok(false);
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ImportError::Io(e)),
            }
        }

        let data = Self::encode(key, value, ttl)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match file {
            Ok(mut file) => {
                file.write_all(&data).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(ImportError::Io(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        let live = self
            .read_slot(&path)
            .await?
            .is_some_and(|s| s.is_live());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(live),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ImportError::Io(e)),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let mut dir = match tokio::fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ImportError::Io(e)),
        };

        let mut found = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(Self::key_from_file_name) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(slot) = self.read_slot(&entry.path()).await? {
                if slot.is_live() {
                    found.push((key, slot.value));
                } else {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}
