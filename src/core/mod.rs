pub mod cache;
pub mod normalizer;
pub mod orchestrator;
pub mod scheduler;

pub use cache::{Cache, CacheGroup, CacheStatistics};
pub use normalizer::{Normalizer, Parsed, ParsedItems};
pub use orchestrator::{BatchOrchestrator, ItemImport, LogReporter, ScheduledRun};
pub use scheduler::TokioScheduler;
