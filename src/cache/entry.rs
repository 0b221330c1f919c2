//! The persisted cache entry and its freshness windows.

use crate::cache::CacheControl;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use hyper::{Body, Response};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// One cached 200 response: the full body, the origin headers and the
/// resolved cache policy, stamped with the time it was saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub saved_at: SystemTime,
    pub cache_header: CacheControl,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CacheEntry {
    /// Build an entry from an upstream 200 response. Returns `None` when
    /// the resolved policy does not allow persistence.
    pub fn from_response(
        headers: &HeaderMap,
        cache_control: CacheControl,
        body: Vec<u8>,
    ) -> Option<CacheEntry> {
        if !cache_control.should_persist() {
            return None;
        }
        let headers = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Some(CacheEntry {
            saved_at: SystemTime::now(),
            cache_header: cache_control,
            headers,
            body,
        })
    }

    // A saved_at in the future (clock skew between nodes) counts as age
    // zero, never as an error.
    fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.saved_at).unwrap_or(Duration::ZERO)
    }

    /// Within the shared max-age window: can be served directly.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.cache_header.public && self.age(now) < self.cache_header.s_maxage
    }

    /// Within the stale-while-revalidate window: serve now, refresh in
    /// the background. The windows are independent, not nested; with
    /// `s-maxage=0` an entry is never fresh but may still be stale
    /// servable.
    pub fn serve_stale_while_revalidate(&self, now: SystemTime) -> bool {
        self.cache_header.public && self.age(now) < self.cache_header.stale_while_revalidate
    }

    /// Within the stale-if-error window: usable only when the upstream
    /// fails or answers 5xx.
    pub fn serve_stale_if_error(&self, now: SystemTime) -> bool {
        self.cache_header.public && self.age(now) < self.cache_header.stale_if_error
    }

    /// Render the entry as a client response. The stored internal status
    /// header and any stored `Set-Cookie` are suppressed; the caller sets
    /// its own `X-Cache-Status` afterwards.
    pub fn to_response(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.clone()));
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if name == "x-cache-status" || name == "set-cookie" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        response
    }
}
