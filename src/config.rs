//! Configuration manager for userdir.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::event::{EventKind, RetryPolicy};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_NAME: &str = "userdir";
const DEFAULT_PORT: u16 = 3004;
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// HTTP port of the read routes.
    pub port: u16,
    #[serde(skip_deserializing)]
    pub version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to the token cache.
    #[serde(skip_serializing)]
    pub redis: Option<Redis>,
    /// Related to identity event topics.
    #[serde(skip_serializing)]
    pub kafka: Option<Kafka>,
    /// Related to OpenTelemetry export.
    #[serde(skip_serializing)]
    pub telemetry: Option<Telemetry>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            port: DEFAULT_PORT,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            postgres: None,
            redis: None,
            kafka: None,
            telemetry: None,
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Redis configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Redis {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub address: String,
    /// Maximum time spent on a token lookup, in milliseconds.
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,
}

fn default_redis_timeout() -> u64 {
    crate::cache::DEFAULT_TIMEOUT.as_millis() as u64
}

impl Redis {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Kafka configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Kafka {
    /// Brokers as `host:port`.
    pub hosts: Vec<String>,
    /// Topic carrying user creations.
    pub create: Topic,
    /// Topic carrying user updates.
    pub edit: Topic,
    /// Topic carrying user deletions.
    pub delete: Topic,
    /// First retry delay, in milliseconds.
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ms: u64,
    /// Longest retry delay, in milliseconds.
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,
}

fn default_retry_initial() -> u64 {
    RetryPolicy::default().initial.as_millis() as u64
}

fn default_retry_max() -> u64 {
    RetryPolicy::default().max.as_millis() as u64
}

/// Topic subscription.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    /// Consumer group. Defaults to `user-<action>-consumer-group`.
    pub group: Option<String>,
}

impl Kafka {
    /// Topic and consumer group of `kind`.
    pub fn subscription(&self, kind: EventKind) -> (String, String) {
        let (topic, action) = match kind {
            EventKind::Created => (&self.create, "create"),
            EventKind::Edited => (&self.edit, "edit"),
            EventKind::Deleted => (&self.delete, "delete"),
        };
        let group = topic
            .group
            .clone()
            .unwrap_or_else(|| format!("user-{action}-consumer-group"));

        (topic.name.clone(), group)
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.retry_initial_ms),
            max: Duration::from_millis(self.retry_max_ms),
        }
    }
}

/// OpenTelemetry configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`.
    pub otlp_endpoint: Option<String>,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, ConfigError> {
        let file_path = if self.path.is_file() {
            self.path
        } else {
            PathBuf::from(DEFAULT_CONFIG_PATH)
        };

        let file = File::open(&file_path).map_err(|source| ConfigError::Open {
            path: file_path.clone(),
            source,
        })?;
        let mut config = serde_yaml::from_reader::<_, Configuration>(file)?;
        config.version = VERSION.to_owned();
        config.path = file_path;

        Ok(Arc::new(config))
    }
}

/// Configuration file could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot open `{}`: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
name: directory
port: 8080
postgres:
  address: localhost:5432
redis:
  address: redis://localhost:6379
kafka:
  hosts: ["localhost:9092"]
  create:
    name: user-created
  edit:
    name: user-edited
    group: custom-group
  delete:
    name: user-deleted
"#;

    #[test]
    fn test_parse() {
        let config: Configuration = serde_yaml::from_str(CONFIG).unwrap();

        assert_eq!(config.name, "directory");
        assert_eq!(config.port, 8080);
        assert_eq!(config.redis.unwrap().timeout(), crate::cache::DEFAULT_TIMEOUT);

        let kafka = config.kafka.unwrap();
        assert_eq!(
            kafka.subscription(EventKind::Created),
            ("user-created".into(), "user-create-consumer-group".into())
        );
        assert_eq!(
            kafka.subscription(EventKind::Edited),
            ("user-edited".into(), "custom-group".into())
        );
        assert_eq!(
            kafka.subscription(EventKind::Deleted).1,
            "user-delete-consumer-group"
        );
        assert_eq!(kafka.retry(), RetryPolicy::default());
    }

    #[test]
    fn test_defaults() {
        let config: Configuration = serde_yaml::from_str("name: test").unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.postgres.is_none());
        assert!(config.kafka.is_none());
    }

    #[test]
    fn test_missing_file() {
        let result = Configuration::default()
            .path(PathBuf::from("/nonexistent/config.yaml"))
            .read();

        assert!(matches!(result, Err(ConfigError::Open { .. })));
    }

    #[test]
    fn test_invalid_file() {
        let path = std::env::temp_dir().join(format!("userdir-{}.yaml", std::process::id()));
        std::fs::write(&path, "port: not-a-port").unwrap();

        let result = Configuration::default().path(path.clone()).read();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_read_file() {
        let path = std::env::temp_dir().join(format!("userdir-ok-{}.yaml", std::process::id()));
        std::fs::write(&path, CONFIG).unwrap();

        let config = Configuration::default().path(path.clone()).read().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.version, VERSION);
    }
}
