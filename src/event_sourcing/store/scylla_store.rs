use std::sync::Arc;

use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::batch::Batch;

use super::document::{DocumentStore, EventItem};
use super::repository::{validate_identifier, RepositoryError};

// ============================================================================
// ScyllaDB Document Store
// ============================================================================
//
// Table layout (one table per event store):
//
//   PRIMARY KEY ((partition_key), sequence_no)
//   secondary index on root_id for aggregate-wide reads
//
// Each `batch_write` is one logged CQL batch.
//
// ============================================================================

const BACKEND: &str = "scylla";

const COLUMNS: &str = "partition_key, sequence_no, id, event_type, payload, version, \
                       entity_id, entity_type, root_id, application_id, user_id, \
                       account_id, group_id, created";

type ItemRow = (
    String,
    i64,
    String,
    String,
    Vec<u8>,
    i32,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

fn scylla_error<E>(err: E) -> RepositoryError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RepositoryError::backend(BACKEND, err)
}

pub struct ScyllaDocumentStore {
    session: Arc<Session>,
    keyspace: String,
}

impl ScyllaDocumentStore {
    pub fn new(session: Arc<Session>, keyspace: &str) -> Result<Self, RepositoryError> {
        validate_identifier(keyspace)?;
        Ok(Self {
            session,
            keyspace: keyspace.to_string(),
        })
    }

    /// Connect to the cluster and make sure the keyspace exists.
    pub async fn connect(nodes: &[String], keyspace: &str) -> Result<Self, RepositoryError> {
        validate_identifier(keyspace)?;

        tracing::info!(nodes = ?nodes, keyspace, "Connecting to ScyllaDB");
        let session: Session = SessionBuilder::new()
            .known_nodes(nodes)
            .build()
            .await
            .map_err(scylla_error)?;

        session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': 1}}"
                ),
                &[],
            )
            .await
            .map_err(scylla_error)?;

        Self::new(Arc::new(session), keyspace)
    }

    fn qualified(&self, table: &str) -> Result<String, RepositoryError> {
        validate_identifier(table)?;
        Ok(format!("{}.{}", self.keyspace, table))
    }

    async fn select(&self, statement: String, key: &str) -> Result<Vec<EventItem>, RepositoryError> {
        let result = self
            .session
            .query_unpaged(statement, (key,))
            .await
            .map_err(scylla_error)?;

        let mut items = Vec::new();

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(items), // No rows
        };

        for row in rows_result.rows::<ItemRow>().map_err(scylla_error)? {
            let (
                partition_key,
                sequence_no,
                id,
                event_type,
                payload,
                version,
                entity_id,
                entity_type,
                root_id,
                application_id,
                user_id,
                account_id,
                group_id,
                created,
            ) = row.map_err(scylla_error)?;

            items.push(EventItem {
                partition_key,
                sequence_no,
                id,
                event_type,
                payload,
                version,
                entity_id,
                entity_type,
                root_id,
                application_id,
                user_id,
                account_id,
                group_id,
                created,
            });
        }

        Ok(items)
    }
}

#[async_trait]
impl DocumentStore for ScyllaDocumentStore {
    async fn list_tables(&self) -> Result<Vec<String>, RepositoryError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT table_name FROM system_schema.tables WHERE keyspace_name = ?",
                (self.keyspace.as_str(),),
            )
            .await
            .map_err(scylla_error)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(Vec::new()),
        };

        let mut tables = Vec::new();
        for row in rows_result.rows::<(String,)>().map_err(scylla_error)? {
            let (name,) = row.map_err(scylla_error)?;
            tables.push(name);
        }
        Ok(tables)
    }

    async fn create_table(&self, table: &str) -> Result<(), RepositoryError> {
        let qualified = self.qualified(table)?;

        self.session
            .query_unpaged(
                format!(
                    "CREATE TABLE IF NOT EXISTS {qualified} (
                        partition_key text,
                        sequence_no bigint,
                        id text,
                        event_type text,
                        payload blob,
                        version int,
                        entity_id text,
                        entity_type text,
                        root_id text,
                        application_id text,
                        user_id text,
                        account_id text,
                        group_id text,
                        created text,
                        PRIMARY KEY ((partition_key), sequence_no)
                    ) WITH CLUSTERING ORDER BY (sequence_no ASC)"
                ),
                &[],
            )
            .await
            .map_err(scylla_error)?;

        self.session
            .query_unpaged(
                format!("CREATE INDEX IF NOT EXISTS {table}_root_id_idx ON {qualified} (root_id)"),
                &[],
            )
            .await
            .map_err(scylla_error)?;

        Ok(())
    }

    async fn batch_write(&self, table: &str, items: &[EventItem]) -> Result<(), RepositoryError> {
        if items.is_empty() {
            return Ok(());
        }

        let insert = format!(
            "INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.qualified(table)?
        );

        let mut batch = Batch::default();
        let mut values = Vec::with_capacity(items.len());

        for item in items {
            batch.append_statement(insert.as_str());
            values.push((
                &item.partition_key,
                item.sequence_no,
                &item.id,
                &item.event_type,
                &item.payload,
                item.version,
                &item.entity_id,
                &item.entity_type,
                &item.root_id,
                &item.application_id,
                &item.user_id,
                &item.account_id,
                &item.group_id,
                &item.created,
            ));
        }

        self.session
            .batch(&batch, values)
            .await
            .map_err(scylla_error)?;

        tracing::debug!(table, item_count = items.len(), "CQL batch applied");
        Ok(())
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<EventItem>, RepositoryError> {
        let statement = format!(
            "SELECT {COLUMNS} FROM {} WHERE partition_key = ? ORDER BY sequence_no ASC",
            self.qualified(table)?
        );
        self.select(statement, partition_key).await
    }

    async fn query_root(&self, table: &str, root_id: &str) -> Result<Vec<EventItem>, RepositoryError> {
        let statement = format!("SELECT {COLUMNS} FROM {} WHERE root_id = ?", self.qualified(table)?);
        self.select(statement, root_id).await
    }
}
