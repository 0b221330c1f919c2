//! The shared content cache: entry format, key derivation and the
//! store contract.

mod cache_control;
mod entry;
mod key;
pub mod memory;
mod redis;

pub use cache_control::CacheControl;
pub use entry::CacheEntry;
pub use key::KeyConfig;
pub use self::redis::RedisConfig;

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// The narrow capability the decision engine needs from a store.
///
/// `get` and `set` never fail from the caller's point of view: a read
/// problem is a miss, a write problem is logged and counted. Only the
/// operator-facing `invalidate` surfaces errors.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    async fn set(&self, key: &str, entry: CacheEntry);

    /// Delete every entry whose key matches the glob pattern (`*` is the
    /// only wildcard).
    async fn invalidate(&self, pattern: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub r#type: String,
    pub redis: RedisConfig,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.r#type != "redis" {
            return Err(ProxyError::Config("cache type must be 'redis'".to_string()));
        }
        self.redis
            .validate()
            .map_err(|e| ProxyError::Config(format!("redis is invalid: {e}")))
    }

    pub fn build(&self) -> Result<Arc<dyn Cache>> {
        self.validate()?;
        Ok(Arc::new(self.redis.build()?))
    }
}
