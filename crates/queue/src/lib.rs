pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres::{connect, PgStore};
pub use store::{FeedStore, JobQueue, SourceRegistry};
