//! Token cache gateway and read authorization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime, Timeouts};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Cache could not answer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Redis(#[from] deadpool_redis::redis::RedisError),
    #[error(transparent)]
    Pool(#[from] deadpool_redis::PoolError),
    #[error(transparent)]
    CreatePool(#[from] deadpool_redis::CreatePoolError),
    #[error("cache lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("no cache configured")]
    Disabled,
}

/// Read-only access to tokens issued by the identity system.
#[async_trait]
pub trait TokenCache: Send + Sync {
    /// Current valid token of `requester_id`, if any.
    async fn get(&self, requester_id: &str) -> Result<Option<String>, CacheError>;
}

/// [`TokenCache`] backed by Redis `GET`.
///
/// Connections are opened on first use, so an unreachable Redis only fails
/// lookups.
#[derive(Clone)]
pub struct RedisTokenCache {
    pool: Pool,
}

impl RedisTokenCache {
    /// Create a pool for a Redis instance, e.g. `redis://127.0.0.1:6379`.
    /// Nothing is connected yet; only the address is checked.
    pub fn new(address: &str, timeout: Duration) -> Result<Self, CacheError> {
        let mut timeouts = Timeouts::default();
        timeouts.wait = Some(timeout);
        timeouts.create = Some(timeout);
        timeouts.recycle = Some(timeout);
        let mut pool = PoolConfig::default();
        pool.timeouts = timeouts;

        let mut config = Config::from_url(address);
        config.pool = Some(pool);
        let pool = config.create_pool(Some(Runtime::Tokio1))?;

        tracing::info!(%address, "redis pool created");

        Ok(Self { pool })
    }
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn get(&self, requester_id: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get::<_, Option<String>>(requester_id).await?)
    }
}

/// Cache used when none is configured. Every lookup fails.
#[derive(Debug, Default, Clone)]
pub struct DisabledTokenCache;

#[async_trait]
impl TokenCache for DisabledTokenCache {
    async fn get(&self, _requester_id: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Disabled)
    }
}

/// Decides whether a requester may read the directory.
#[derive(Clone)]
pub struct Authorizer {
    cache: Arc<dyn TokenCache>,
    timeout: Duration,
}

impl Authorizer {
    /// Create a new [`Authorizer`].
    pub fn new(cache: Arc<dyn TokenCache>) -> Self {
        Self {
            cache,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Update lookup timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow only when the cached token of `requester_id` equals `token`.
    ///
    /// Fails closed: a missing entry, a cache error or a timeout all deny.
    pub async fn verify(&self, requester_id: &str, token: &str) -> bool {
        let allowed = if requester_id.is_empty() || token.is_empty() {
            false
        } else {
            match tokio::time::timeout(self.timeout, self.cache.get(requester_id)).await {
                Ok(Ok(Some(cached))) => cached == token,
                Ok(Ok(None)) => false,
                Ok(Err(err)) => {
                    tracing::warn!(%requester_id, error = %err, "token cache unavailable, denying");
                    false
                },
                Err(_) => {
                    let err = CacheError::Timeout(self.timeout);
                    tracing::warn!(%requester_id, error = %err, "token cache unavailable, denying");
                    false
                },
            }
        };

        let result = if allowed { "allow" } else { "deny" };
        metrics::counter!("authorization_checks_total", "result" => result).increment(1);

        allowed
    }
}
