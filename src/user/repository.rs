//! User store port.

use async_trait::async_trait;

use crate::user::{Profile, Projection, User};

pub(crate) type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by a [`UserRepository`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user not found")]
    NotFound,
    #[error("store unavailable")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            err => StoreError::Unavailable(Box::new(err)),
        }
    }
}

/// Keyed collection of [`User`].
///
/// Every operation is atomic for a single `id`.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Find a user by its ID, with every read field. Images are stored but
    /// never read back.
    async fn find_by_id(&self, id: &str) -> Result<User>;

    /// List every user, ordered by ID, populating projected fields only.
    async fn find_all(&self, projection: &Projection) -> Result<Vec<User>>;

    /// Insert a user, or merge `profile` into the existing one.
    async fn upsert(&self, id: &str, profile: &Profile) -> Result<()>;

    /// Merge `profile` into an existing user.
    /// Returns `false` without inserting anything when `id` is absent.
    async fn update(&self, id: &str, profile: &Profile) -> Result<bool>;

    /// Remove a user. Returns `false` when `id` was already absent.
    async fn delete_by_id(&self, id: &str) -> Result<bool>;
}
