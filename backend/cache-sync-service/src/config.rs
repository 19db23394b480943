//! Configuration for the cache sync service, loaded from `CDC_`-prefixed environment variables
use resilience::RetryConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SyncServiceError};
use crate::models::EntityKind;
use crate::services::cdc::{KafkaConsumerConfig, SyncEngineConfig, TableRouter};

const ENV_PREFIX: &str = "CDC_";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Debezium topics to consume (comma-separated)
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Maximum messages per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Number of consume loops, each with its own Kafka consumer in the group
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Partition count of the in-process store
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    // ============================================
    // Store call retry
    // ============================================
    #[serde(default = "default_retry_max_retries")]
    pub retry_max_retries: u32,

    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Log a warning when a child upsert lands outside its parent's partition
    #[serde(default = "default_true")]
    pub verify_affinity: bool,

    /// Upper bound for the poll/commit failure backoff
    #[serde(default = "default_consumer_max_backoff_secs")]
    pub consumer_max_backoff_secs: u64,

    /// Extra source tables as `table=kind` pairs, e.g. `clients=customers`
    #[serde(default)]
    pub table_aliases: Vec<String>,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "cache-sync-v1".to_string()
}

fn default_topics() -> Vec<String> {
    EntityKind::ALL
        .iter()
        .map(|kind| format!("dbserver1.inventory.{}", kind.collection()))
        .collect()
}

fn default_batch_size() -> usize {
    500
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_workers() -> usize {
    1
}

fn default_partitions() -> u32 {
    1024
}

fn default_retry_max_retries() -> u32 {
    3
}

fn default_retry_initial_backoff_ms() -> u64 {
    50
}

fn default_retry_max_backoff_ms() -> u64 {
    1000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_consumer_max_backoff_secs() -> u64 {
    60
}

fn default_http_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load `.env` if present, then read and validate the environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config: Config = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Same as `from_env` over explicit `(KEY, value)` pairs; keys carry the `CDC_` prefix
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::prefixed(ENV_PREFIX).from_iter(pairs)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka_brokers.trim().is_empty() {
            return Err(SyncServiceError::Config("kafka_brokers must not be empty".into()));
        }
        if self.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(SyncServiceError::Config("at least one topic is required".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncServiceError::Config("batch_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(SyncServiceError::Config("workers must be positive".into()));
        }
        if self.partitions == 0 {
            return Err(SyncServiceError::Config("partitions must be positive".into()));
        }
        if self.poll_timeout_ms == 0 || self.store_timeout_ms == 0 {
            return Err(SyncServiceError::Config("timeouts must be positive".into()));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(SyncServiceError::Config(
                "retry_multiplier must be at least 1.0".into(),
            ));
        }
        self.table_aliases()?;
        Ok(())
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Parsed `table=kind` aliases; the kind may be given by collection or singular table name
    pub fn table_aliases(&self) -> Result<Vec<(String, EntityKind)>> {
        let builtin = TableRouter::new();

        self.table_aliases
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                let (table, kind) = entry.split_once('=').ok_or_else(|| {
                    SyncServiceError::Config(format!(
                        "table alias '{}' must look like table=kind",
                        entry
                    ))
                })?;
                let table = table.trim();
                if table.is_empty() || table.ends_with('.') {
                    return Err(SyncServiceError::Config(format!(
                        "table alias '{}' has an empty table name",
                        entry
                    )));
                }
                let kind = builtin.route(kind.trim()).ok_or_else(|| {
                    SyncServiceError::Config(format!(
                        "table alias '{}' names an unknown entity kind",
                        entry
                    ))
                })?;
                Ok((table.to_string(), kind))
            })
            .collect()
    }

    pub fn router(&self) -> Result<TableRouter> {
        Ok(self
            .table_aliases()?
            .into_iter()
            .fold(TableRouter::new(), |router, (table, kind)| {
                router.with_alias(&table, kind)
            }))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_max_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            backoff_multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
        }
    }

    pub fn engine_config(&self) -> SyncEngineConfig {
        SyncEngineConfig {
            retry: self.retry_config(),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            verify_affinity: self.verify_affinity,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn kafka_config(&self) -> KafkaConsumerConfig {
        KafkaConsumerConfig {
            brokers: self.kafka_brokers.clone(),
            group_id: self.group_id.clone(),
            batch_size: self.batch_size,
            session_timeout_ms: self.session_timeout_ms,
        }
    }

    pub fn consumer_max_backoff(&self) -> Duration {
        Duration::from_secs(self.consumer_max_backoff_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_pairs(Vec::new()).unwrap();

        assert_eq!(config.kafka_brokers, "localhost:9092");
        assert_eq!(config.topics().len(), 4);
        assert_eq!(config.workers, 1);
        assert!(config.verify_affinity);
        assert_eq!(config.retry_config().max_attempts(), 4);
        assert_eq!(
            config.engine_config().store_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_prefixed_overrides() {
        let config = Config::from_pairs(pairs(&[
            ("CDC_TOPICS", "shop.public.customers,shop.public.orders"),
            ("CDC_BATCH_SIZE", "50"),
            ("CDC_VERIFY_AFFINITY", "false"),
            ("CDC_RETRY_MAX_RETRIES", "0"),
        ]))
        .unwrap();

        assert_eq!(
            config.topics(),
            vec!["shop.public.customers", "shop.public.orders"]
        );
        assert_eq!(config.kafka_config().batch_size, 50);
        assert!(!config.engine_config().verify_affinity);
        assert_eq!(config.retry_config().max_attempts(), 1);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let err = Config::from_pairs(pairs(&[("CDC_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, SyncServiceError::Config(_)));
    }

    #[test]
    fn test_table_aliases() {
        let config = Config::from_pairs(pairs(&[(
            "CDC_TABLE_ALIASES",
            "clients=customers,sales.line_items=order_item",
        )]))
        .unwrap();

        let router = config.router().unwrap();
        assert_eq!(router.route("crm.clients"), Some(EntityKind::Customer));
        assert_eq!(router.route("line_items"), Some(EntityKind::OrderItem));
        assert_eq!(
            router.route("dbserver1.sales.line_items"),
            Some(EntityKind::OrderItem)
        );
    }

    #[test]
    fn test_bad_alias_is_rejected() {
        for alias in ["clients", "clients=widgets", "=customers", "public.=customers"] {
            let result = Config::from_pairs(pairs(&[("CDC_TABLE_ALIASES", alias)]));
            assert!(result.is_err(), "alias {alias} should be rejected");
        }
    }
}
