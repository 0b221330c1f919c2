//! Process logger bootstrap and the per-request session logger.
//!
//! The global level comes from `LOG_LEVEL`. Session records are emitted
//! under a dedicated target that the sink always passes through at
//! debug; the [`SessionLog`] itself gates by its effective level, so a
//! request matching the force-debug predicate logs at debug even when
//! the process runs at info.

use crate::error::{ProxyError, Result};
use log::{Level, LevelFilter};
use once_cell::sync::OnceCell;
use std::sync::Arc;

pub const SESSION_TARGET: &str = "cachefront::session";

static GLOBAL_LEVEL: OnceCell<Level> = OnceCell::new();

/// Initialize the process logger from the `LOG_LEVEL` environment
/// variable. An unknown level is a startup error.
pub fn init_from_env() -> Result<()> {
    let level = level_from_env()?;
    let _ = GLOBAL_LEVEL.set(level);
    env_logger::Builder::new()
        .filter_level(level.to_level_filter())
        .filter_module(SESSION_TARGET, LevelFilter::Debug)
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| ProxyError::Config(format!("cant init logger: {e}")))?;
    Ok(())
}

fn level_from_env() -> Result<Level> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_default();
    match level.to_ascii_lowercase().as_str() {
        "" | "info" => Ok(Level::Info),
        "debug" => Ok(Level::Debug),
        "warn" => Ok(Level::Warn),
        "error" => Ok(Level::Error),
        other => Err(ProxyError::Config(format!("unknown LOG_LEVEL '{other}'"))),
    }
}

fn global_level() -> Level {
    *GLOBAL_LEVEL.get().unwrap_or(&Level::Info)
}

/// A logger bound to one request.
///
/// Carried alongside the request (and cloned into detached refresh and
/// store tasks) instead of being looked up from ambient context. Every
/// line carries the request id.
#[derive(Debug, Clone)]
pub struct SessionLog {
    request_id: Arc<str>,
    max: Level,
}

impl SessionLog {
    pub fn new(request_id: &str, force_debug: bool) -> Self {
        let max = if force_debug {
            Level::Debug
        } else {
            global_level()
        };
        SessionLog {
            request_id: Arc::from(request_id),
            max,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn debug_enabled(&self) -> bool {
        Level::Debug <= self.max
    }

    pub fn debug(&self, msg: &str) {
        self.emit(Level::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.emit(Level::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.emit(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.emit(Level::Error, msg);
    }

    fn emit(&self, level: Level, msg: &str) {
        if level <= self.max {
            log::log!(target: SESSION_TARGET, level, "request_id={} {}", self.request_id, msg);
        }
    }
}
