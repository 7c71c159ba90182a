//! Storage backends for resolved identities and synced directory groups.
//!
//! The request pipeline stores one [`User`] record per login and reads it back
//! on subsequent requests; the group sync task keeps a [`Group`] record per
//! directory group. Backends are selected through the `[cache]` configuration
//! section.

#![deny(missing_docs)]

mod memory;
mod redis;

use std::{sync::Arc, time::Duration};

use config::{CacheBackendKind, CacheConfig};
use identity::{Group, User};

pub use memory::MemoryCache;
pub use self::redis::RedisCache;

/// Errors that can occur in cache backends.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to reach the backing store.
    #[error("cache connection error: {0}")]
    Connection(String),

    /// A read or write against the backing store failed.
    #[error("cache query error: {0}")]
    Query(String),

    /// A stored record could not be encoded or decoded.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trait for identity cache backends.
///
/// User writes are set-if-absent: when two requests for the same identity race,
/// the first write wins and the loser's record is discarded. Group writes
/// always overwrite so the sync task can refresh names in place.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    /// Look up a resolved user by its cache key.
    async fn get_user(&self, key: &str) -> Result<Option<User>, CacheError>;

    /// Store a resolved user unless a record already exists for the key.
    async fn set_user(&self, key: &str, user: &User) -> Result<(), CacheError>;

    /// Look up a synced group by its directory object id.
    async fn get_group(&self, object_id: &str) -> Result<Option<Group>, CacheError>;

    /// Store or replace a synced group.
    async fn set_group(&self, object_id: &str, group: &Group) -> Result<(), CacheError>;
}

/// Creates the cache backend selected by the configuration.
///
/// User entries expire after twice the group sync interval, which guarantees a
/// cached identity never outlives two directory refreshes.
pub async fn from_config(
    config: &CacheConfig,
    sync_interval: Duration,
) -> Result<Arc<dyn CacheBackend>, CacheError> {
    let user_ttl = sync_interval * 2;

    match config.backend {
        CacheBackendKind::Memory => Ok(Arc::new(MemoryCache::new(user_ttl))),
        CacheBackendKind::Redis => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| CacheError::Connection("no redis url configured".to_string()))?;

            Ok(Arc::new(RedisCache::connect(url, user_ttl).await?))
        }
    }
}
