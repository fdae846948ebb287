use crate::domain::model::SearchFilters;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "catalog-import")]
#[command(about = "Import and sync catalog items from the product advertising API")]
pub struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true, default_value = "catalog-import.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit JSON logs (for unattended runs)
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Log process memory and CPU usage
    #[arg(long, global = true)]
    pub monitor: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search by keywords, or look up item codes with --code
    Search {
        term: String,
        #[arg(long)]
        code: bool,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        search_index: Option<String>,
        /// Minimum price in minor units
        #[arg(long)]
        min_price: Option<i64>,
        /// Maximum price in minor units
        #[arg(long)]
        max_price: Option<i64>,
        #[arg(long)]
        brand: Option<String>,
        #[arg(long)]
        sort_by: Option<String>,
    },
    /// Import a single item
    Import {
        code: String,
        #[arg(long)]
        force: bool,
    },
    /// Import many items in one batch and wait for it to finish
    Batch {
        /// Codes separated by commas or spaces
        codes: Vec<String>,
        /// CSV file whose first column holds item codes
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Show batch progress (defaults to the most recent batch)
    Status {
        batch_id: Option<String>,
        /// Write per-item results to a CSV file
        #[arg(long)]
        export: Option<PathBuf>,
    },
    Pause {
        batch_id: String,
    },
    Resume {
        batch_id: String,
    },
    Cancel {
        batch_id: String,
    },
    /// Remove a finished batch record
    Clear {
        batch_id: String,
    },
    /// Run scheduled syncs; --once runs a single pass
    Schedule {
        #[arg(long)]
        once: bool,
    },
    CacheStats,
    CacheClear {
        /// Only clear one group (products, searches, variations, categories, api_responses)
        #[arg(long)]
        group: Option<String>,
    },
}

impl Command {
    /// 從 search 子命令取出篩選條件
    pub fn search_filters(&self) -> Option<SearchFilters> {
        match self {
            Command::Search {
                page,
                search_index,
                min_price,
                max_price,
                brand,
                sort_by,
                ..
            } => Some(SearchFilters {
                page: *page,
                search_index: search_index.clone(),
                min_price: *min_price,
                max_price: *max_price,
                brand: brand.clone(),
                sort_by: sort_by.clone(),
            }),
            _ => None,
        }
    }
}
