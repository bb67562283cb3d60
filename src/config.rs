use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Once};

use sqlx::postgres::PgPoolOptions;

use crate::event_sourcing::store::{
    DocumentEventRepository, EventRepository, HistoryMode, InMemoryDocumentStore,
    KeyValueEventRepository, PostgresEventRepository, RedisKeyValueStore, RepositoryDefaults, RepositoryError,
    ScyllaDocumentStore, DEFAULT_BATCH_LIMIT,
};
use crate::metrics::Metrics;

// ============================================================================
// Configuration - environment driven
// ============================================================================
//
// A `.env` file in the working directory is loaded once, then variables are
// read from the process environment:
//
//   EVENT_STORE_BACKEND        postgres | scylla | redis | memory (default)
//   DATABASE_URL               required for postgres
//   DATABASE_MAX_CONNECTIONS   default 16
//   EVENT_TABLE                default "events"
//   EVENT_UNIT_OF_WORK         true | false (default)
//   SCYLLA_NODES               comma separated, default 127.0.0.1:9042
//   SCYLLA_KEYSPACE            default "events"
//   DOCUMENT_BATCH_LIMIT       default 25
//   REDIS_URL                  default redis://127.0.0.1/
//   REDIS_ENTITY_URL           defaults to REDIS_URL
//   REDIS_HISTORY_MODE         replace (default) | append
//   EVENT_APPLICATION_ID, EVENT_ACCOUNT_ID, EVENT_GROUP_ID, EVENT_USER_ID
//
// ============================================================================

static DOTENV: Once = Once::new();

/// Load `.env` once; a missing file is fine.
pub fn init_dotenv() {
    DOTENV.call_once(|| {
        let _ = dotenvy::dotenv();
    });
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be set for the {backend} backend")]
    Missing { key: &'static str, backend: Backend },

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Scylla,
    Redis,
    #[default]
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "scylla" | "scylladb" => Ok(Self::Scylla),
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Postgres => "postgres",
            Self::Scylla => "scylla",
            Self::Redis => "redis",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend: Backend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub table: String,
    pub unit_of_work: bool,
    pub scylla_nodes: Vec<String>,
    pub scylla_keyspace: String,
    pub batch_limit: usize,
    pub redis_url: String,
    pub redis_entity_url: Option<String>,
    pub history_mode: HistoryMode,
    pub defaults: RepositoryDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            database_url: None,
            max_connections: 16,
            table: "events".to_string(),
            unit_of_work: false,
            scylla_nodes: vec!["127.0.0.1:9042".to_string()],
            scylla_keyspace: "events".to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            redis_url: "redis://127.0.0.1/".to_string(),
            redis_entity_url: None,
            history_mode: HistoryMode::default(),
            defaults: RepositoryDefaults::default(),
        }
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        key,
        message: err.to_string(),
    })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key,
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

impl Settings {
    /// Read settings from the environment, after loading `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        init_dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut settings = Self::default();

        if let Some(raw) = get("EVENT_STORE_BACKEND") {
            settings.backend = parse("EVENT_STORE_BACKEND", &raw)?;
        }
        settings.database_url = get("DATABASE_URL");
        if let Some(raw) = get("DATABASE_MAX_CONNECTIONS") {
            settings.max_connections = parse("DATABASE_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(table) = get("EVENT_TABLE") {
            settings.table = table;
        }
        if let Some(raw) = get("EVENT_UNIT_OF_WORK") {
            settings.unit_of_work = parse_bool("EVENT_UNIT_OF_WORK", &raw)?;
        }
        if let Some(raw) = get("SCYLLA_NODES") {
            settings.scylla_nodes = raw
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(keyspace) = get("SCYLLA_KEYSPACE") {
            settings.scylla_keyspace = keyspace;
        }
        if let Some(raw) = get("DOCUMENT_BATCH_LIMIT") {
            let limit: usize = parse("DOCUMENT_BATCH_LIMIT", &raw)?;
            if limit == 0 {
                return Err(ConfigError::Invalid {
                    key: "DOCUMENT_BATCH_LIMIT",
                    message: "must be at least 1".to_string(),
                });
            }
            settings.batch_limit = limit;
        }
        if let Some(url) = get("REDIS_URL") {
            settings.redis_url = url;
        }
        settings.redis_entity_url = get("REDIS_ENTITY_URL");
        if let Some(raw) = get("REDIS_HISTORY_MODE") {
            settings.history_mode = parse("REDIS_HISTORY_MODE", &raw)?;
        }

        settings.defaults = RepositoryDefaults {
            application_id: get("EVENT_APPLICATION_ID").unwrap_or_default(),
            account_id: get("EVENT_ACCOUNT_ID").unwrap_or_default(),
            group_id: get("EVENT_GROUP_ID").unwrap_or_default(),
            user_id: get("EVENT_USER_ID").unwrap_or_default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            Backend::Postgres if self.database_url.is_none() => Err(ConfigError::Missing {
                key: "DATABASE_URL",
                backend: self.backend,
            }),
            Backend::Scylla if self.scylla_nodes.is_empty() => Err(ConfigError::Missing {
                key: "SCYLLA_NODES",
                backend: self.backend,
            }),
            _ => Ok(()),
        }
    }
}

/// Connect the configured backend and return it behind the repository contract.
pub async fn connect_repository(
    settings: &Settings,
    metrics: Option<Arc<Metrics>>,
) -> Result<Box<dyn EventRepository>, RepositoryError> {
    tracing::info!(backend = %settings.backend, table = %settings.table, "Connecting event repository");

    let repository: Box<dyn EventRepository> = match settings.backend {
        Backend::Postgres => {
            let url = settings.database_url.as_deref().unwrap_or_default();
            let pool = PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .connect(url)
                .await?;
            let repository = if settings.unit_of_work {
                PostgresEventRepository::with_unit_of_work(pool, &settings.table, settings.defaults.clone()).await?
            } else {
                PostgresEventRepository::new(pool, &settings.table, settings.defaults.clone())?
            };
            match metrics {
                Some(metrics) => Box::new(repository.with_metrics(metrics)),
                None => Box::new(repository),
            }
        }
        Backend::Scylla => {
            let store = ScyllaDocumentStore::connect(&settings.scylla_nodes, &settings.scylla_keyspace).await?;
            let repository = DocumentEventRepository::new(Arc::new(store), &settings.table, settings.defaults.clone())
                .with_batch_limit(settings.batch_limit);
            match metrics {
                Some(metrics) => Box::new(repository.with_metrics(metrics)),
                None => Box::new(repository),
            }
        }
        Backend::Redis => {
            let aggregates = RedisKeyValueStore::connect(&settings.redis_url).await?;
            let entities = match &settings.redis_entity_url {
                Some(url) => RedisKeyValueStore::connect(url).await?,
                None => aggregates.clone(),
            };
            let repository =
                KeyValueEventRepository::new(Arc::new(aggregates), Arc::new(entities), settings.defaults.clone())
                    .with_history_mode(settings.history_mode);
            match metrics {
                Some(metrics) => Box::new(repository.with_metrics(metrics)),
                None => Box::new(repository),
            }
        }
        Backend::Memory => {
            let repository = DocumentEventRepository::new(
                Arc::new(InMemoryDocumentStore::new()),
                &settings.table,
                settings.defaults.clone(),
            )
            .with_batch_limit(settings.batch_limit);
            match metrics {
                Some(metrics) => Box::new(repository.with_metrics(metrics)),
                None => Box::new(repository),
            }
        }
    };

    Ok(repository)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.backend, Backend::Memory);
        assert_eq!(settings.batch_limit, 25);
        assert_eq!(settings.history_mode, HistoryMode::Replace);
    }

    #[test]
    fn test_postgres_settings() {
        let settings = settings_from(&[
            ("EVENT_STORE_BACKEND", "Postgres"),
            ("DATABASE_URL", "postgres://localhost/events"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("EVENT_UNIT_OF_WORK", "true"),
            ("EVENT_APPLICATION_ID", "blog"),
            ("EVENT_ACCOUNT_ID", "acct"),
        ])
        .unwrap();

        assert_eq!(settings.backend, Backend::Postgres);
        assert_eq!(settings.max_connections, 4);
        assert!(settings.unit_of_work);
        assert_eq!(settings.defaults.application_id, "blog");
        assert_eq!(settings.defaults.account_id, "acct");
    }

    #[test]
    fn test_postgres_requires_url() {
        let err = settings_from(&[("EVENT_STORE_BACKEND", "postgres")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "DATABASE_URL", .. }));
    }

    #[test]
    fn test_scylla_nodes_are_split() {
        let settings = settings_from(&[
            ("EVENT_STORE_BACKEND", "scylla"),
            ("SCYLLA_NODES", "10.0.0.1:9042, 10.0.0.2:9042,"),
            ("DOCUMENT_BATCH_LIMIT", "10"),
        ])
        .unwrap();

        assert_eq!(settings.scylla_nodes, vec!["10.0.0.1:9042", "10.0.0.2:9042"]);
        assert_eq!(settings.batch_limit, 10);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(matches!(
            settings_from(&[("EVENT_STORE_BACKEND", "mongo")]),
            Err(ConfigError::Invalid { key: "EVENT_STORE_BACKEND", .. })
        ));
        assert!(matches!(
            settings_from(&[("DOCUMENT_BATCH_LIMIT", "0")]),
            Err(ConfigError::Invalid { key: "DOCUMENT_BATCH_LIMIT", .. })
        ));
        assert!(matches!(
            settings_from(&[("DATABASE_MAX_CONNECTIONS", "many")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            settings_from(&[("EVENT_UNIT_OF_WORK", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            settings_from(&[("REDIS_HISTORY_MODE", "merge")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_empty_values_are_unset() {
        let settings = settings_from(&[("REDIS_URL", ""), ("EVENT_TABLE", "  ")]).unwrap();
        assert_eq!(settings.redis_url, "redis://127.0.0.1/");
        assert_eq!(settings.table, "events");
    }

    #[tokio::test]
    async fn test_memory_backend_connects() {
        let repository = connect_repository(&Settings::default(), None).await.unwrap();
        repository.migrate().await.unwrap();
        assert_eq!(repository.subscriber_count(), 0);
    }
}
