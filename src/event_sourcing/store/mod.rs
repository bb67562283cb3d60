// ============================================================================
// Event Store - repository contract and backends
// ============================================================================

pub mod document;
pub mod key_value;
pub mod memory;
pub mod postgres;
pub mod redis_store;
pub mod repository;
pub mod scylla_store;

pub use document::{partition_key, DocumentEventRepository, DocumentStore, EventItem, DEFAULT_BATCH_LIMIT};
pub use key_value::{aggregate_key, root_key, HistoryMode, KeyValueEventRepository, KeyValueStore};
pub use memory::{InMemoryDocumentStore, InMemoryKeyValueStore};
pub use postgres::PostgresEventRepository;
pub use redis_store::RedisKeyValueStore;
pub use repository::{
    fill_identity, validate_identifier, EventRepository, RepositoryDefaults, RepositoryError,
};
pub use scylla_store::ScyllaDocumentStore;
