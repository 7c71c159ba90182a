//! Redis cache backend for multi-replica deployments.

use std::time::Duration;

use identity::{Group, User};
use ::redis::aio::ConnectionManager;

use super::{CacheBackend, CacheError};

const USER_KEY_PREFIX: &str = "azad:user:";
const GROUP_KEY_PREFIX: &str = "azad:group:";

/// Redis cache backend. Records are stored as JSON strings so replicas
/// running different builds can still read each other's entries.
pub struct RedisCache {
    manager: ConnectionManager,
    user_ttl: Duration,
}

impl RedisCache {
    /// Connect to the redis server and verify it responds.
    pub async fn connect(url: &str, user_ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Connection(format!("invalid redis url: {e}")))?;

        let mut manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(format!("failed to connect to redis: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .map_err(|e| CacheError::Connection(format!("failed to ping redis server: {e}")))?;

        Ok(Self { manager, user_ttl })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: String) -> Result<Option<T>, CacheError> {
        let mut conn = self.manager.clone();

        let value: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Query(e.to_string()))?;

        value.map(|json| serde_json::from_str(&json)).transpose().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl CacheBackend for RedisCache {
    async fn get_user(&self, key: &str) -> Result<Option<User>, CacheError> {
        self.get_json(format!("{USER_KEY_PREFIX}{key}")).await
    }

    async fn set_user(&self, key: &str, user: &User) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(user)?;

        // NX keeps the first record when concurrent logins race, EX mirrors
        // the in-memory TTL.
        let _: Option<String> = redis::cmd("SET")
            .arg(format!("{USER_KEY_PREFIX}{key}"))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(self.user_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_group(&self, object_id: &str) -> Result<Option<Group>, CacheError> {
        self.get_json(format!("{GROUP_KEY_PREFIX}{object_id}")).await
    }

    async fn set_group(&self, object_id: &str, group: &Group) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(group)?;

        let _: String = redis::cmd("SET")
            .arg(format!("{GROUP_KEY_PREFIX}{object_id}"))
            .arg(json)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Query(e.to_string()))?;

        Ok(())
    }
}
