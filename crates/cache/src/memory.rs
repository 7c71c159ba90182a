//! In-process cache backed by mini-moka.

use std::time::Duration;

use identity::{Group, User};
use mini_moka::sync::Cache;

use super::{CacheBackend, CacheError};

/// In-memory cache backend. The default when no external store is configured.
pub struct MemoryCache {
    /// Resolved identities, expired on a timer so group changes propagate.
    users: Cache<String, User>,
    /// Synced directory groups. Never expire; the sync task replaces them.
    groups: Cache<String, Group>,
}

impl MemoryCache {
    /// Create a new in-memory cache where user entries live for `user_ttl`.
    pub fn new(user_ttl: Duration) -> Self {
        let users = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(user_ttl)
            .build();

        let groups = Cache::builder().max_capacity(100_000).build();

        Self { users, groups }
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCache {
    async fn get_user(&self, key: &str) -> Result<Option<User>, CacheError> {
        Ok(self.users.get(&key.to_string()))
    }

    async fn set_user(&self, key: &str, user: &User) -> Result<(), CacheError> {
        let key = key.to_string();

        if self.users.get(&key).is_none() {
            self.users.insert(key, user.clone());
        }

        Ok(())
    }

    async fn get_group(&self, object_id: &str) -> Result<Option<Group>, CacheError> {
        Ok(self.groups.get(&object_id.to_string()))
    }

    async fn set_group(&self, object_id: &str, group: &Group) -> Result<(), CacheError> {
        self.groups.insert(object_id.to_string(), group.clone());
        Ok(())
    }
}
