//! In-memory user store.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::user::repository::Result;
use crate::user::{Profile, Projection, StoreError, User, UserRepository};

/// [`UserRepository`] kept in process memory.
///
/// Used when no PostgreSQL instance is configured. Content is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryUserRepository {
    users: DashMap<String, Profile>,
}

impl MemoryUserRepository {
    /// Create a new [`MemoryUserRepository`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_id(&self, id: &str) -> Result<User> {
        self.users
            .get(id)
            .map(|profile| {
                Projection::default().apply(User {
                    id: id.to_owned(),
                    profile: profile.clone(),
                })
            })
            .ok_or(StoreError::NotFound)
    }

    async fn find_all(&self, projection: &Projection) -> Result<Vec<User>> {
        let mut users = self
            .users
            .iter()
            .map(|entry| {
                projection.apply(User {
                    id: entry.key().clone(),
                    profile: entry.value().clone(),
                })
            })
            .collect::<Vec<_>>();
        users.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(users)
    }

    async fn upsert(&self, id: &str, profile: &Profile) -> Result<()> {
        // The entry holds the shard lock until merged.
        match self.users.entry(id.to_owned()) {
            Entry::Occupied(mut entry) => entry.get_mut().merge(profile),
            Entry::Vacant(entry) => {
                entry.insert(profile.clone());
            },
        }

        Ok(())
    }

    async fn update(&self, id: &str, profile: &Profile) -> Result<bool> {
        match self.users.get_mut(id) {
            Some(mut current) => {
                current.merge(profile);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        Ok(self.users.remove(id).is_some())
    }
}
