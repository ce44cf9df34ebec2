//! SQLite persistence for scenario graphs, episode runtime records,
//! memories and the embedding cache.

mod migrations;
pub mod store;

pub use migrations::run_migrations;
pub use store::{AssignmentCount, EmbeddingCacheStat, MemoryOrder, Store};
