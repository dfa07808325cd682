pub mod cache;
pub mod database;
pub mod durable;
pub mod ephemeral;
pub mod error;
pub mod hybrid;
pub mod row_helpers;
pub mod schema;
pub mod store;

pub use cache::{CacheBackend, CacheConfig, CacheStore, InProcessCache};
pub use database::Database;
pub use durable::DurableStore;
pub use ephemeral::EphemeralStore;
pub use error::StoreError;
pub use hybrid::HybridStore;
pub use store::MemoryStore;
