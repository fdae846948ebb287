#[cfg(feature = "cli")]
pub mod cli;
pub mod marketplace;
pub mod toml_config;

pub use marketplace::{MarketplaceInfo, MarketplaceTable};
pub use toml_config::{
    ApiConfig, BatchConfig, CacheConfig, CredentialsConfig, ImportConfig, SchedulerConfig,
    StorageConfig,
};
