pub mod client;
pub mod signer;

pub use client::{default_resources, ApiClient, OperationKind, MAX_ITEMS_PER_REQUEST};
pub use signer::RequestSigner;
