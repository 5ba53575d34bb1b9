//! userdir is a read-only user directory synchronized from identity events.

#![forbid(unsafe_code)]
pub mod cache;
pub mod config;
pub mod crypto;
mod database;
pub mod error;
pub mod event;
mod router;
pub mod telemetry;
pub mod user;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

use cache::{Authorizer, DisabledTokenCache, RedisTokenCache};
use crypto::{Decryptor, SymmetricCipher, SymmetricKey};
pub use error::ServerError;
use event::{EventConsumer, EventKind, KafkaSource};
use user::{MemoryUserRepository, PgUserRepository, UserRepository};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: axum::http::Method,
    path: &str,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    app.oneshot(
        Request::builder()
            .method(method)
            .uri(path)
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

/// State over `repo` where requester `admin` holds token `token`.
#[cfg(test)]
pub fn test_state(repo: Arc<dyn UserRepository>) -> AppState {
    let cache = cache::tests::StaticTokenCache::default().with("admin", "token");

    AppState {
        config: Arc::new(config::Configuration::default()),
        repo,
        authorizer: Authorizer::new(Arc::new(cache)),
        metrics: None,
    }
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub repo: Arc<dyn UserRepository>,
    pub authorizer: Authorizer,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]));

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `GET /metrics` goes to Prometheus.
        .route("/metrics", get(router::metrics::handler))
        .nest("/users", router::users::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Path of the configuration file, `CONFIG_PATH` or `config.yaml`.
pub fn config_path() -> PathBuf {
    std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"))
}

/// Build the payload decryptor from `KEY` and `SALT` environment variables.
pub fn decryptor() -> Result<Arc<dyn Decryptor>, Box<dyn std::error::Error>> {
    let key = std::env::var("KEY").map_err(|_| "missing `KEY` environment variable")?;
    let salt = std::env::var("SALT").map_err(|_| "missing `SALT` environment variable")?;

    let key = SymmetricKey::derive_from_password(key.as_bytes(), salt.as_bytes())?;
    Ok(Arc::new(SymmetricCipher::new(key)))
}

/// Build the read authorizer. Redis is reached lazily: an unreachable or
/// misconfigured cache denies every read instead of blocking startup.
pub fn authorizer(config: &config::Configuration) -> Authorizer {
    let Some(redis) = &config.redis else {
        tracing::warn!("missing `redis` entry on `config.yaml` file, every read will be denied");
        return Authorizer::new(Arc::new(DisabledTokenCache));
    };

    match RedisTokenCache::new(&redis.address, redis.timeout()) {
        Ok(cache) => Authorizer::new(Arc::new(cache)).with_timeout(redis.timeout()),
        Err(err) => {
            tracing::error!(error = %err, "invalid `redis` entry, every read will be denied");
            Authorizer::new(Arc::new(DisabledTokenCache))
        },
    }
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
    metrics: Option<PrometheusHandle>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let repo: Arc<dyn UserRepository> = match config.postgres {
        Some(ref postgres) => {
            Arc::new(PgUserRepository::new(database::connect(postgres).await?))
        },
        None => {
            tracing::warn!("missing `postgres` entry on `config.yaml` file, users are kept in memory");
            Arc::new(MemoryUserRepository::new())
        },
    };

    let authorizer = authorizer(&config);

    Ok(AppState {
        config,
        repo,
        authorizer,
        metrics,
    })
}

/// Start one consumer per event kind. They stop once `shutdown` turns `true`.
pub fn spawn_consumers(
    config: &config::Configuration,
    decryptor: Arc<dyn Decryptor>,
    repo: Arc<dyn UserRepository>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let Some(kafka) = &config.kafka else {
        tracing::warn!("missing `kafka` entry on `config.yaml` file, no event will be consumed");
        return Vec::new();
    };

    EventKind::ALL
        .into_iter()
        .map(|kind| {
            let (topic, group) = kafka.subscription(kind);
            tracing::info!(%kind, %topic, %group, "starting consumer");

            let source = KafkaSource::new(kafka.hosts.clone(), topic, group);
            let consumer = EventConsumer::new(
                kind,
                source,
                Arc::clone(&decryptor),
                Arc::clone(&repo),
                shutdown.clone(),
            )
            .with_retry(kafka.retry());

            tokio::spawn(consumer.run())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use super::*;

    #[tokio::test]
    async fn test_unreachable_cache_denies_without_blocking() {
        let mut config = config::Configuration::default();
        config.redis = Some(config::Redis {
            address: "redis://127.0.0.1:1".into(),
            timeout_ms: 100,
        });

        let state = tokio::time::timeout(
            Duration::from_secs(5),
            initialize_state(Arc::new(config), None),
        )
        .await
        .expect("startup must not wait for the cache")
        .unwrap();

        let response = make_request(
            app(state),
            Method::GET,
            "/users/u1?token=token&requesterId=admin",
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_cache_address_denies() {
        let mut config = config::Configuration::default();
        config.redis = Some(config::Redis {
            address: "not a url".into(),
            timeout_ms: 100,
        });

        assert!(!authorizer(&config).verify("admin", "token").await);
    }
}
