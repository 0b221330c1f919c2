use thiserror::Error;

/// Crate wide error type.
///
/// Most failures in the hot path are not surfaced through this type at
/// all: cache read problems degrade to a miss and cache write problems
/// are logged and counted. What remains are startup failures (config,
/// listeners) and upstream dispatch failures, which the proxy maps to
/// a 503.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("upstream request: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("cache store: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for ProxyError {
    fn from(e: redis::RedisError) -> Self {
        ProxyError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
