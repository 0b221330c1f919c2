//! Redis-backed implementation of the [`Cache`] contract.
//!
//! Entries are stored as `zstd(msgpack(CacheEntry))` under the derived
//! key, written with `SET NX EX` so concurrent writers race and the
//! first stored value wins for the full ttl. The connection is
//! established lazily and re-established by the connection manager, so
//! a down store degrades the node to a pass-through proxy instead of
//! keeping it from starting.

use crate::buffer::BufferPool;
use crate::cache::{Cache, CacheEntry};
use crate::error::{ProxyError, Result};
use crate::metrics;
use async_trait::async_trait;
use log::{error, info};
use redis::aio::ConnectionManager;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    pub addr: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    /// Per-operation deadlines, in seconds.
    pub get_timeout: u64,
    pub set_timeout: u64,
    pub connection_timeout: u64,
}

impl RedisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(ProxyError::Config("addr must not be empty".to_string()));
        }
        if self.db < 0 {
            return Err(ProxyError::Config("db must not be < 0".to_string()));
        }
        if self.get_timeout == 0 {
            return Err(ProxyError::Config("get_timeout must be > 0".to_string()));
        }
        if self.set_timeout == 0 {
            return Err(ProxyError::Config("set_timeout must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<RedisCache> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host, port)))
            .ok_or_else(|| ProxyError::Config(format!("invalid redis addr '{}'", self.addr)))?;
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        Ok(RedisCache {
            client,
            conn: OnceCell::new(),
            get_timeout: Duration::from_secs(self.get_timeout),
            set_timeout: Duration::from_secs(self.set_timeout),
            conn_timeout: Duration::from_secs(self.connection_timeout.max(1)),
            pool: BufferPool::new(),
        })
    }
}

pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    get_timeout: Duration,
    set_timeout: Duration,
    conn_timeout: Duration,
    pool: BufferPool,
}

impl RedisCache {
    // First use connects; later uses clone the multiplexed manager. A
    // failed connect leaves the cell empty so the next operation retries.
    async fn manager(&self) -> std::result::Result<ConnectionManager, redis::RedisError> {
        self.conn
            .get_or_try_init(|| async {
                tokio::time::timeout(self.conn_timeout, ConnectionManager::new(self.client.clone()))
                    .await
                    .map_err(|_| {
                        redis::RedisError::from((redis::ErrorKind::IoError, "connect timeout"))
                    })?
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let lookup = async {
            let mut conn = self.manager().await?;
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<Vec<u8>>>(&mut conn)
                .await
        };
        let compressed = match tokio::time::timeout(self.get_timeout, lookup).await {
            Err(_) => {
                error!("cant get cache: timeout; cache_key={key}");
                metrics::CACHE_ERRORS.inc();
                return None;
            }
            Ok(Err(e)) => {
                error!("cant get cache: {e}; cache_key={key}");
                metrics::CACHE_ERRORS.inc();
                return None;
            }
            Ok(Ok(None)) => return None,
            Ok(Ok(Some(data))) => data,
        };

        let mut buf = self.pool.get();
        let entry = match decode_entry(&compressed, &mut buf) {
            Ok(entry) => entry,
            Err(e) => {
                error!("cant decode cache: {e}; cache_key={key}");
                metrics::CACHE_ERRORS.inc();
                return None;
            }
        };
        // a stored policy that no longer satisfies the persistence
        // invariant is treated as a miss
        if !entry.cache_header.should_persist() {
            return None;
        }
        Some(entry)
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        let ttl = entry.cache_header.ttl();
        if ttl.is_zero() {
            return;
        }
        let mut serialized = self.pool.get();
        let mut compressed = self.pool.get();
        if let Err(e) = encode_entry(&entry, &mut serialized, &mut compressed) {
            error!("cant encode cache: {e}; cache_key={key}");
            metrics::CACHE_ERRORS.inc();
            return;
        }
        let store = async {
            let mut conn = self.manager().await?;
            // NX: concurrent writers race, the first stored value wins
            // for the full ttl and later writers see no error
            redis::cmd("SET")
                .arg(key)
                .arg(&compressed[..])
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async::<_, Option<String>>(&mut conn)
                .await
        };
        match tokio::time::timeout(self.set_timeout, store).await {
            Err(_) => {
                error!("cant save cache: timeout; cache_key={key}");
                metrics::CACHE_ERRORS.inc();
            }
            Ok(Err(e)) => {
                error!("cant save cache: {e}; cache_key={key}");
                metrics::CACHE_ERRORS.inc();
            }
            Ok(Ok(_)) => {}
        }
    }

    async fn invalidate(&self, pattern: &str) -> Result<()> {
        metrics::CACHE_INVALIDATIONS.inc();
        let mut conn = self.manager().await.map_err(ProxyError::from)?;
        let mut deleted: u64 = 0;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .query_async(&mut conn)
                .await
                .map_err(ProxyError::from)?;
            for key in keys {
                match redis::cmd("DEL").arg(&key).query_async::<_, i64>(&mut conn).await {
                    Ok(_) => {
                        deleted += 1;
                        metrics::CACHE_INVALIDATED_ITEMS.inc();
                    }
                    Err(e) => {
                        error!("cant delete cache key {key}: {e}");
                        metrics::CACHE_ERRORS.inc();
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        info!("invalidate cache; invalidate_key={pattern} items_count={deleted}");
        Ok(())
    }
}

fn encode_entry(
    entry: &CacheEntry,
    serialized: &mut Vec<u8>,
    compressed: &mut Vec<u8>,
) -> Result<()> {
    rmp_serde::encode::write_named(serialized, entry)
        .map_err(|e| ProxyError::Store(format!("encode entry: {e}")))?;
    zstd::stream::copy_encode(&serialized[..], compressed, COMPRESSION_LEVEL)
        .map_err(|e| ProxyError::Store(format!("compress entry: {e}")))?;
    Ok(())
}

fn decode_entry(compressed: &[u8], buf: &mut Vec<u8>) -> Result<CacheEntry> {
    zstd::stream::copy_decode(compressed, &mut *buf)
        .map_err(|e| ProxyError::Store(format!("decompress entry: {e}")))?;
    rmp_serde::decode::from_slice(buf).map_err(|e| ProxyError::Store(format!("decode entry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheControl;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_entry_round_trip() {
        let entry = CacheEntry {
            saved_at: SystemTime::now() - Duration::from_secs(5),
            cache_header: CacheControl::parse("public, s-maxage=60, stale-if-error=600"),
            headers: vec![
                ("content-type".to_string(), "text/html".to_string()),
                ("vary".to_string(), "a".to_string()),
                ("vary".to_string(), "b".to_string()),
            ],
            body: b"this is body".to_vec(),
        };
        let mut serialized = Vec::new();
        let mut compressed = Vec::new();
        encode_entry(&entry, &mut serialized, &mut compressed).unwrap();
        assert_ne!(compressed, serialized);

        let mut buf = Vec::new();
        let decoded = decode_entry(&compressed, &mut buf).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let mut buf = Vec::new();
        assert!(decode_entry(b"not zstd at all", &mut buf).is_err());
    }

    #[test]
    fn test_config_validation() {
        let config = RedisConfig {
            addr: "127.0.0.1:6379".to_string(),
            username: None,
            password: None,
            db: 0,
            get_timeout: 1,
            set_timeout: 1,
            connection_timeout: 1,
        };
        config.validate().unwrap();
        config.build().unwrap();

        let bad = RedisConfig { addr: String::new(), ..config };
        assert!(bad.validate().is_err());
    }
}
