pub mod adapters;
pub mod api;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::{Cli, Command};

pub use app::{ImportOneResult, ImportService};
pub use config::ImportConfig;
pub use core::orchestrator::BatchOrchestrator;
pub use utils::error::{ImportError, Result};
