// Adapters layer: concrete implementations of the domain ports (storage, catalog, credentials)

pub mod credentials;
pub mod file_store;
pub mod kv_catalog;
pub mod memory;

pub use credentials::{EnvCredentials, StaticCredentials};
pub use file_store::FileKvStore;
pub use kv_catalog::KvCatalogStore;
pub use memory::MemoryKvStore;
