use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::key_value::KeyValueStore;
use super::repository::RepositoryError;

// ============================================================================
// Redis Key-Value Store
// ============================================================================
//
// Blobs are plain string values. `set_many` sends one MULTI/EXEC pipeline so a
// persist never leaves half of its keys updated on this connection.
//
// ============================================================================

#[derive(Clone)]
pub struct RedisKeyValueStore {
    connection: MultiplexedConnection,
}

impl RedisKeyValueStore {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    pub async fn connect(url: &str) -> Result<Self, RepositoryError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to Redis");
        Ok(Self::new(connection))
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), RepositoryError> {
        if entries.is_empty() {
            return Ok(());
        }

        let key_count = entries.len();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set(key, value).ignore();
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;

        tracing::debug!(key_count, "Redis pipeline applied");
        Ok(())
    }
}
