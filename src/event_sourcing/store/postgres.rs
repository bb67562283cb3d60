use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::repository::{
    decode_payload, prepare_batch, publish, record_persist, validate_identifier, EventRepository,
    RepositoryDefaults, RepositoryError,
};
use crate::event_sourcing::core::{AggregateRoot, CallContext, Event, EventMeta};
use crate::event_sourcing::dispatch::{EventDispatcher, EventSubscriber, SubscriberId};
use crate::metrics::Metrics;

// ============================================================================
// Relational Event Repository (PostgreSQL via sqlx)
// ============================================================================
//
// Every persist runs inside a uniquely named savepoint:
//
//   SAVEPOINT s<uuid>
//   INSERT ... VALUES (...), (...), ...
//   RELEASE SAVEPOINT s<uuid>        (or ROLLBACK TO SAVEPOINT on failure)
//
// Without a unit of work each persist gets its own transaction. With a unit of
// work the repository holds one open transaction; persists and reads go
// through it and `flush` commits it and opens the next one.
//
// ============================================================================

const BACKEND: &str = "postgres";

/// Rows per INSERT statement, keeps bind parameters under the protocol limit.
const INSERT_CHUNK: usize = 1000;

type UnitOfWork = Mutex<Option<Transaction<'static, Postgres>>>;

/// One row of the events table.
struct EventRow {
    id: String,
    entity_id: String,
    entity_type: String,
    payload: Option<Vec<u8>>,
    event_type: String,
    root_id: String,
    application_id: String,
    user_id: String,
    sequence_no: i64,
    version: i32,
    account_id: String,
    group_id: String,
    created: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            entity_id: row.try_get("entity_id")?,
            entity_type: row.try_get("entity_type")?,
            payload: row.try_get("payload")?,
            event_type: row.try_get("event_type")?,
            root_id: row.try_get("root_id")?,
            application_id: row.try_get("application_id")?,
            user_id: row.try_get("user_id")?,
            sequence_no: row.try_get("sequence_no")?,
            version: row.try_get("version")?,
            account_id: row.try_get("account_id")?,
            group_id: row.try_get("group_id")?,
            created: row.try_get("created")?,
        })
    }
}

impl EventRow {
    fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let meta = &event.meta;
        Ok(Self {
            id: event.id.clone(),
            entity_id: meta.entity_id.clone(),
            entity_type: meta.entity_type.clone(),
            payload: Some(serde_json::to_vec(&event.payload)?),
            event_type: event.event_type.clone(),
            root_id: meta.root_id.clone(),
            application_id: meta.module.clone(),
            user_id: meta.user.clone(),
            sequence_no: meta.sequence_no,
            version: event.version,
            account_id: meta.account.clone(),
            group_id: meta.group.clone(),
            created: meta.created.clone(),
        })
    }

    fn into_event(self) -> Result<Event, serde_json::Error> {
        let payload = decode_payload(self.payload.as_deref().unwrap_or_default())?;
        let meta = EventMeta {
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            root_id: self.root_id,
            sequence_no: self.sequence_no,
            user: self.user_id,
            module: self.application_id,
            account: self.account_id,
            group: self.group_id,
            created: self.created,
        };
        Ok(Event::from_parts(self.id, self.event_type, payload, self.version, meta))
    }
}

pub struct PostgresEventRepository {
    pool: PgPool,
    table: String,
    unit_of_work: Option<UnitOfWork>,
    defaults: RepositoryDefaults,
    dispatcher: EventDispatcher,
    metrics: Option<Arc<Metrics>>,
}

impl PostgresEventRepository {
    /// Repository where each persist commits on its own.
    pub fn new(pool: PgPool, table: &str, defaults: RepositoryDefaults) -> Result<Self, RepositoryError> {
        validate_identifier(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            unit_of_work: None,
            defaults,
            dispatcher: EventDispatcher::new(),
            metrics: None,
        })
    }

    /// Repository holding an open transaction until `flush`.
    pub async fn with_unit_of_work(
        pool: PgPool,
        table: &str,
        defaults: RepositoryDefaults,
    ) -> Result<Self, RepositoryError> {
        let mut repository = Self::new(pool, table, defaults)?;
        let tx = repository.pool.begin().await?;
        repository.unit_of_work = Some(Mutex::new(Some(tx)));
        Ok(repository)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.dispatcher = self.dispatcher.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_unit_of_work(&self) -> bool {
        self.unit_of_work.is_some()
    }

    /// Transaction held by the unit of work, begun again if a previous
    /// `flush` could not reopen it.
    async fn held_transaction<'g>(
        &self,
        guard: &'g mut Option<Transaction<'static, Postgres>>,
    ) -> Result<&'g mut Transaction<'static, Postgres>, RepositoryError> {
        if guard.is_none() {
            tracing::warn!(table = %self.table, "Reopening unit of work");
            *guard = Some(self.pool.begin().await?);
        }
        guard.as_mut().ok_or(RepositoryError::UnitOfWorkClosed)
    }

    async fn write(&self, ctx: &CallContext, aggregate: &AggregateRoot) -> Result<Vec<Event>, RepositoryError> {
        let savepoint = format!("s{}", Uuid::new_v4().simple());

        match &self.unit_of_work {
            Some(unit_of_work) => {
                let mut guard = unit_of_work.lock().await;
                let tx = self.held_transaction(&mut guard).await?;
                self.write_in_savepoint(tx, &savepoint, ctx, aggregate).await
            }
            None => {
                let mut tx = self.pool.begin().await?;
                let events = self.write_in_savepoint(&mut tx, &savepoint, ctx, aggregate).await?;
                tx.commit().await?;
                Ok(events)
            }
        }
    }

    async fn write_in_savepoint(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        savepoint: &str,
        ctx: &CallContext,
        aggregate: &AggregateRoot,
    ) -> Result<Vec<Event>, RepositoryError> {
        let statement = format!("SAVEPOINT {savepoint}");
        sqlx::query(&statement).execute(&mut **tx).await?;
        tracing::debug!(savepoint, event_count = aggregate.new_changes().len(), "Savepoint opened");

        let outcome = match prepare_batch(ctx, &self.defaults, aggregate) {
            Ok(events) => self.insert(tx, &events).await.map(|()| events),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(events) => {
                let statement = format!("RELEASE SAVEPOINT {savepoint}");
                sqlx::query(&statement).execute(&mut **tx).await?;
                Ok(events)
            }
            Err(err) => {
                tracing::warn!(savepoint, error = %err, "Rolling back saving events");
                let statement = format!("ROLLBACK TO SAVEPOINT {savepoint}");
                if let Err(rollback_err) = sqlx::query(&statement).execute(&mut **tx).await {
                    tracing::error!(savepoint, error = %rollback_err, "Savepoint rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn insert(&self, tx: &mut Transaction<'static, Postgres>, events: &[Event]) -> Result<(), RepositoryError> {
        let rows = events
            .iter()
            .map(EventRow::from_event)
            .collect::<Result<Vec<_>, _>>()?;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (id, entity_id, entity_type, payload, event_type, root_id, \
                 application_id, user_id, sequence_no, version, account_id, group_id, created) ",
                self.table
            ));
            builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(&row.id)
                    .push_bind(&row.entity_id)
                    .push_bind(&row.entity_type)
                    .push_bind(&row.payload)
                    .push_bind(&row.event_type)
                    .push_bind(&row.root_id)
                    .push_bind(&row.application_id)
                    .push_bind(&row.user_id)
                    .push_bind(row.sequence_no)
                    .push_bind(row.version)
                    .push_bind(&row.account_id)
                    .push_bind(&row.group_id)
                    .push_bind(&row.created);
            });

            builder.build().execute(&mut **tx).await?;
        }

        Ok(())
    }

    fn select(&self, filter: &str) -> String {
        format!(
            "SELECT id, entity_id, entity_type, payload, event_type, root_id, application_id, \
             user_id, sequence_no, version, account_id, group_id, created \
             FROM {} WHERE {filter} ORDER BY sequence_no ASC, row_id ASC",
            self.table
        )
    }

    async fn fetch_events<'q>(
        &self,
        query: sqlx::query::QueryAs<'q, Postgres, EventRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Event>, RepositoryError> {
        let rows = match &self.unit_of_work {
            Some(unit_of_work) => {
                let mut guard = unit_of_work.lock().await;
                let tx = self.held_transaction(&mut guard).await?;
                query.fetch_all(&mut **tx).await?
            }
            None => query.fetch_all(&self.pool).await?,
        };

        let events = rows
            .into_iter()
            .map(EventRow::into_event)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(table = %self.table, event_count = events.len(), "Loaded events");
        Ok(events)
    }
}

#[async_trait]
impl EventRepository for PostgresEventRepository {
    async fn persist(&self, ctx: &CallContext, aggregate: &mut AggregateRoot) -> Result<(), RepositoryError> {
        if !aggregate.has_new_changes() {
            return Ok(());
        }

        let started = Instant::now();
        let event_count = aggregate.new_changes().len();

        let result = self.write(ctx, aggregate).await;
        record_persist(self.metrics.as_deref(), BACKEND, event_count, started, result.as_ref().map(|_| ()));
        let events = result?;

        tracing::info!(aggregate_id = %aggregate.id, event_count, table = %self.table, "Events persisted");
        aggregate.mark_persisted();
        publish(&self.dispatcher, ctx, events).await;
        Ok(())
    }

    async fn get_by_aggregate(&self, root_id: &str) -> Result<Vec<Event>, RepositoryError> {
        let sql = self.select("root_id = $1");
        self.fetch_events(sqlx::query_as::<_, EventRow>(&sql).bind(root_id))
            .await
    }

    async fn get_by_aggregate_and_sequence_range(
        &self,
        root_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Event>, RepositoryError> {
        let sql = self.select("root_id = $1 AND sequence_no >= $2 AND sequence_no <= $3");
        self.fetch_events(
            sqlx::query_as::<_, EventRow>(&sql)
                .bind(root_id)
                .bind(start)
                .bind(end),
        )
        .await
    }

    async fn get_by_entity_and_aggregate(
        &self,
        entity_id: &str,
        entity_type: &str,
        root_id: &str,
    ) -> Result<Vec<Event>, RepositoryError> {
        let sql = self.select("entity_id = $1 AND entity_type = $2 AND root_id = $3");
        self.fetch_events(
            sqlx::query_as::<_, EventRow>(&sql)
                .bind(entity_id)
                .bind(entity_type)
                .bind(root_id),
        )
        .await
    }

    async fn get_aggregate_sequence_number(&self, root_id: &str) -> Result<i64, RepositoryError> {
        let sql = format!(
            "SELECT COALESCE(MAX(sequence_no), 0) FROM {} WHERE root_id = $1",
            self.table
        );
        let query = sqlx::query_scalar::<_, i64>(&sql).bind(root_id);

        let sequence_no = match &self.unit_of_work {
            Some(unit_of_work) => {
                let mut guard = unit_of_work.lock().await;
                let tx = self.held_transaction(&mut guard).await?;
                query.fetch_one(&mut **tx).await?
            }
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(sequence_no)
    }

    fn add_subscriber(&self, handler: EventSubscriber) -> SubscriberId {
        self.dispatcher.add_subscriber(handler)
    }

    fn subscriber_count(&self) -> usize {
        self.dispatcher.subscriber_count()
    }

    async fn migrate(&self) -> Result<(), RepositoryError> {
        let table = &self.table;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                row_id BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL DEFAULT '',
                payload BYTEA,
                event_type TEXT NOT NULL,
                root_id TEXT NOT NULL DEFAULT '',
                application_id TEXT NOT NULL DEFAULT '',
                user_id TEXT NOT NULL DEFAULT '',
                sequence_no BIGINT NOT NULL,
                version INTEGER NOT NULL,
                account_id TEXT NOT NULL DEFAULT '',
                group_id TEXT NOT NULL DEFAULT '',
                created TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS {table}_entity_id_idx ON {table} (entity_id);
            CREATE INDEX IF NOT EXISTS {table}_entity_type_idx ON {table} (entity_type);
            CREATE INDEX IF NOT EXISTS {table}_event_type_idx ON {table} (event_type);
            CREATE INDEX IF NOT EXISTS {table}_root_sequence_idx ON {table} (root_id, sequence_no);
            CREATE INDEX IF NOT EXISTS {table}_application_id_idx ON {table} (application_id);
            CREATE INDEX IF NOT EXISTS {table}_user_id_idx ON {table} (user_id);"
        );

        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        tracing::info!(table = %self.table, "Event table migrated");
        Ok(())
    }

    async fn flush(&self) -> Result<(), RepositoryError> {
        let Some(unit_of_work) = &self.unit_of_work else {
            return Ok(());
        };

        let mut guard = unit_of_work.lock().await;
        let committed = match guard.take() {
            Some(tx) => tx.commit().await,
            None => Ok(()),
        };

        // A fresh transaction is opened even when the commit failed. If that
        // fails too the next persist, read or flush begins one.
        *guard = Some(self.pool.begin().await?);
        committed?;

        tracing::debug!(table = %self.table, "Unit of work committed");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
