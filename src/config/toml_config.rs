use crate::config::marketplace::MarketplaceTable;
use crate::domain::model::Credentials;
use crate::domain::ports::CredentialSource;
use crate::utils::error::{ImportError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub import: BatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub access_key: String,
    pub secret_key: String,
    pub partner_tag: String,
    #[serde(default = "default_marketplace")]
    pub marketplace: String,
}

fn default_marketplace() -> String {
    "US".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// 覆寫 API 位址（測試或代理用），未設定時使用市場預設 host
    pub endpoint: Option<String>,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_variation_pages: u32,
    /// 每秒最多送出的請求數，0 表示不限速
    pub requests_per_second: u32,
    pub resources: Option<Vec<String>>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: 10,
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_variation_pages: 10,
            requests_per_second: 1,
            resources: None,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_items_per_group: usize,
    pub products_ttl_seconds: u64,
    pub searches_ttl_seconds: u64,
    pub variations_ttl_seconds: u64,
    pub categories_ttl_seconds: u64,
    pub api_responses_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_items_per_group: 1_000,
            products_ttl_seconds: 6 * 3600,
            searches_ttl_seconds: 30 * 60,
            variations_ttl_seconds: 6 * 3600,
            categories_ttl_seconds: 24 * 3600,
            api_responses_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub force_update: bool,
    pub max_retries: u32,
    pub error_log_cap: usize,
    pub lock_timeout_seconds: u64,
    pub include_variations: bool,
    pub max_category_depth: usize,
    pub fatal_auth_threshold: usize,
    pub job_retention_hours: u64,
    pub control_poll_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            force_update: false,
            max_retries: 2,
            error_log_cap: 100,
            lock_timeout_seconds: 300,
            include_variations: true,
            max_category_depth: 6,
            fatal_auth_threshold: 3,
            job_retention_hours: 7 * 24,
            control_poll_ms: 500,
        }
    }
}

impl BatchConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_hours * 3600)
    }

    pub fn control_poll(&self) -> Duration {
        Duration::from_millis(self.control_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_minutes: u64,
    pub sync_enabled: bool,
    pub sync_batch_size: usize,
    pub stale_after_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            sync_enabled: false,
            sync_batch_size: 50,
            stale_after_hours: 24,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

impl ImportConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(ImportError::Io)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| ImportError::Config {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${CATALOG_SECRET_KEY})
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ImportError::Config {
            message: format!("env substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            access_key: self.credentials.access_key.clone(),
            secret_key: self.credentials.secret_key.clone(),
            partner_tag: self.credentials.partner_tag.clone(),
            marketplace: self.credentials.marketplace.clone(),
        }
    }
}

impl Validate for ImportConfig {
    fn validate(&self) -> Result<()> {
        // 驗證憑證
        validation::validate_non_empty_string("credentials.access_key", &self.credentials.access_key)?;
        validation::validate_non_empty_string("credentials.secret_key", &self.credentials.secret_key)?;
        validation::validate_non_empty_string("credentials.partner_tag", &self.credentials.partner_tag)?;
        validation::validate_no_placeholder("credentials.secret_key", &self.credentials.secret_key)?;
        MarketplaceTable::builtin().lookup(&self.credentials.marketplace)?;

        // 驗證 API 設定
        if let Some(endpoint) = &self.api.endpoint {
            validation::validate_url("api.endpoint", endpoint)?;
        }
        validation::validate_range("api.max_attempts", self.api.max_attempts, 1, 10)?;
        validation::validate_positive_number("api.timeout_seconds", self.api.timeout_seconds as usize, 1)?;
        validation::validate_range("api.requests_per_second", self.api.requests_per_second, 0, 100)?;
        if self.api.max_delay_ms < self.api.base_delay_ms {
            return Err(ImportError::InvalidConfigValue {
                field: "api.max_delay_ms".to_string(),
                value: self.api.max_delay_ms.to_string(),
                reason: "must be greater than or equal to api.base_delay_ms".to_string(),
            });
        }

        // 驗證快取與批次設定
        validation::validate_positive_number("cache.max_items_per_group", self.cache.max_items_per_group, 4)?;
        validation::validate_positive_number("import.lock_timeout_seconds", self.import.lock_timeout_seconds as usize, 1)?;
        validation::validate_positive_number("import.max_category_depth", self.import.max_category_depth, 1)?;
        validation::validate_positive_number("scheduler.interval_minutes", self.scheduler.interval_minutes as usize, 1)?;
        validation::validate_path("storage.data_dir", &self.storage.data_dir)?;

        Ok(())
    }
}

impl CredentialSource for ImportConfig {
    fn get(&self) -> Result<Credentials> {
        Ok(self.credentials())
    }
}
