//! Top-level YAML configuration.
//!
//! Unknown fields anywhere in the tree are rejected, so a typo in an
//! operator config fails startup instead of silently disabling a rule.

use crate::cache::{CacheConfig, KeyConfig};
use crate::error::{ProxyError, Result};
use crate::proxy::FallbackConfig;
use crate::upstream::UpstreamConfig;
use crate::user::UserConfig;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};

const DEFAULT_LISTEN_ADDR: &str = ":8080";
const DEFAULT_DIAGNOSTIC_ADDR: &str = ":7070";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub diagnostic_addr: String,
    pub can_persist_cache: UserConfig,
    pub can_load_cache: UserConfig,
    pub can_force_emit_debug_logging: UserConfig,
    #[serde(default)]
    pub cache_key_config: KeyConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub ordered_cache_control_fallback: FallbackConfig,
}

impl Config {
    pub fn parse(data: &str) -> Result<Config> {
        let mut config: Config = serde_yaml::from_str(data)
            .map_err(|e| ProxyError::Config(format!("error on unmarshal: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.listen_addr.is_empty() {
            self.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if self.diagnostic_addr.is_empty() {
            self.diagnostic_addr = DEFAULT_DIAGNOSTIC_ADDR.to_string();
        }
        resolve_addr(&self.listen_addr)
            .map_err(|e| ProxyError::Config(format!("listen_addr invalid: {e}")))?;
        resolve_addr(&self.diagnostic_addr)
            .map_err(|e| ProxyError::Config(format!("diagnostic_addr invalid: {e}")))?;
        self.can_force_emit_debug_logging
            .validate()
            .map_err(|e| ProxyError::Config(format!("can_force_emit_debug_logging invalid: {e}")))?;
        self.can_persist_cache
            .validate()
            .map_err(|e| ProxyError::Config(format!("can_persist_cache invalid: {e}")))?;
        self.can_load_cache
            .validate()
            .map_err(|e| ProxyError::Config(format!("can_load_cache invalid: {e}")))?;
        self.cache_key_config
            .validate()
            .map_err(|e| ProxyError::Config(format!("cache_key_config invalid: {e}")))?;
        self.upstream
            .validate()
            .map_err(|e| ProxyError::Config(format!("upstream invalid: {e}")))?;
        self.cache
            .validate()
            .map_err(|e| ProxyError::Config(format!("cache invalid: {e}")))?;
        self.ordered_cache_control_fallback
            .validate()
            .map_err(|e| ProxyError::Config(format!("ordered_cache_control_fallback invalid: {e}")))?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        resolve_addr(&self.listen_addr)
    }

    pub fn diagnostic_addr(&self) -> Result<SocketAddr> {
        resolve_addr(&self.diagnostic_addr)
    }
}

/// Resolve a listen address, accepting the `:port` shorthand for
/// "all interfaces".
pub fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    addr.to_socket_addrs()
        .map_err(|e| ProxyError::Config(format!("cant resolve '{addr}': {e}")))?
        .next()
        .ok_or_else(|| ProxyError::Config(format!("'{addr}' resolves to nothing")))
}
