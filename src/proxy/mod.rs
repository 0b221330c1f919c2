//! The caching decision engine.
//!
//! For every inbound request the proxy decides between five outcomes,
//! reported in the `X-Cache-Status` response header: `HIT` (fresh cache
//! entry), `HIT-STALE` (stale entry served now, refreshed in the
//! background), `HIT-ERROR` (stale entry served because the upstream
//! failed), `MISS` (forwarded to the origin) and `ERROR` (origin non-200
//! passed through). There is deliberately no request coalescing: two
//! concurrent misses both fetch and both try to store, and the store's
//! SETNX picks the winner.

mod fallback;

pub use fallback::{CacheControlResolver, FallbackConfig, FallbackRuleConfig};

use crate::buffer::{self, BufferPool};
use crate::cache::{Cache, CacheEntry, KeyConfig};
use crate::logging::SessionLog;
use crate::metrics;
use crate::request::RequestHead;
use crate::upstream::Upstream;
use crate::user::User;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, StatusCode};
use hyper::{Body, Response};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

pub const X_CACHE_STATUS: &str = "x-cache-status";

pub struct CacheProxy {
    can_persist_cache: User,
    can_load_cache: User,
    key_config: KeyConfig,
    upstream: Arc<dyn Upstream>,
    cache: Arc<dyn Cache>,
    resolver: Arc<CacheControlResolver>,
    pool: BufferPool,
}

impl CacheProxy {
    pub fn new(
        can_persist_cache: User,
        can_load_cache: User,
        key_config: KeyConfig,
        upstream: Arc<dyn Upstream>,
        cache: Arc<dyn Cache>,
        resolver: CacheControlResolver,
    ) -> CacheProxy {
        CacheProxy {
            can_persist_cache,
            can_load_cache,
            key_config,
            upstream,
            cache,
            resolver: Arc::new(resolver),
            pool: BufferPool::new(),
        }
    }

    pub async fn serve(&self, head: RequestHead, body: Body, log: &SessionLog) -> Response<Body> {
        let can_persist = self.can_persist_cache.is_user(&head);
        let can_load = self.can_load_cache.is_user(&head);
        let now = SystemTime::now();

        // Bypass: non-GET or a request that may neither read nor write
        // the cache behaves like a plain proxy. The store is never
        // consulted on this path.
        if head.method != Method::GET || (!can_persist && !can_load) {
            log.debug(&format!(
                "just proxy pass; can_persist_cache={can_persist} can_load_cache={can_load}"
            ));
            let body = self.read_request_body(body).await;
            return match self.upstream.send(&head, body).await {
                Ok(response) => with_cache_status(response, "MISS"),
                Err(e) => {
                    log.error(&format!("cant send request to upstream: {e}"));
                    service_unavailable()
                }
            };
        }

        let body = self.read_request_body(body).await;
        let key = self.key_config.apply(&head);

        let mut entry: Option<CacheEntry> = None;
        if can_load {
            let start = Instant::now();
            entry = self.cache.get(&key).await;
            let cache_status = if entry.is_some() { "HIT" } else { "MISS" };
            metrics::CACHE_LOAD_TIME
                .with_label_values(&[cache_status])
                .observe(start.elapsed().as_secs_f64());
            log.debug(&format!(
                "load cache item; found={} cache_status={cache_status}",
                entry.is_some()
            ));
        }

        if let Some(entry) = entry.as_ref() {
            if entry.is_fresh(now) {
                log.debug("response from cache");
                return from_entry(entry, "HIT");
            }
        }

        if let Some(stale) = entry.as_ref() {
            if stale.serve_stale_while_revalidate(now) {
                log.debug("response from stale");
                let response = from_entry(stale, "HIT-STALE");
                if can_persist {
                    self.spawn_refresh(head, key, log.clone());
                }
                return response;
            }
        }

        let response = match self.upstream.send(&head, body).await {
            Err(e) => {
                if let Some(stale) = entry.as_ref() {
                    if stale.serve_stale_if_error(now) {
                        log.debug(&format!("use stale cache: {e}"));
                        return from_entry(stale, "HIT-ERROR");
                    }
                }
                log.error(&format!("cant send request to upstream: {e}"));
                return service_unavailable();
            }
            Ok(response) => response,
        };

        let status = response.status();
        if status != StatusCode::OK {
            if status.as_u16() >= 500 {
                if let Some(stale) = entry.as_ref() {
                    if stale.serve_stale_if_error(now) {
                        log.info(&format!("response from cache due to upstream status {status}"));
                        return from_entry(stale, "HIT-ERROR");
                    }
                }
            }
            log.debug(&format!("response to client with upstream status {status}"));
            return with_cache_status(response, "ERROR");
        }

        let cache_control = self.resolver.resolve(&head, response.headers(), log);
        if !can_persist || !cache_control.should_persist() {
            log.debug("response to client without cache save");
            return with_cache_status(response, "MISS");
        }

        // Miss with persist: buffer the full body so the same bytes go to
        // the client and, once complete, to the detached store task.
        let (parts, mut upstream_body) = response.into_parts();
        let mut buf = self.pool.get();
        if let Err(e) = buffer::read_body(&mut upstream_body, &mut buf).await {
            log.error(&format!("cant read all body from upstream: {e}"));
            let partial = Bytes::copy_from_slice(&buf);
            return with_cache_status(Response::from_parts(parts, Body::from(partial)), "MISS");
        }
        let shared = Bytes::copy_from_slice(&buf);
        drop(buf);

        // the stored headers are the origin headers, before this node
        // stamps its own status header
        let entry_headers = parts.headers.clone();
        let response =
            with_cache_status(Response::from_parts(parts, Body::from(shared.clone())), "MISS");

        let cache = Arc::clone(&self.cache);
        let log = log.clone();
        tokio::spawn(async move {
            let Some(entry) = CacheEntry::from_response(&entry_headers, cache_control, shared.to_vec())
            else {
                return;
            };
            cache.set(&key, entry).await;
            log.debug("persist cache; is_saved=true");
        });
        response
    }

    /// Serve-stale refresh: fetch the origin once, store the result if it
    /// is a persistable 200. Runs detached from the request so a client
    /// disconnect cannot cancel the store; failures only log.
    fn spawn_refresh(&self, head: RequestHead, key: String, log: SessionLog) {
        let upstream = Arc::clone(&self.upstream);
        let cache = Arc::clone(&self.cache);
        let resolver = Arc::clone(&self.resolver);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let response = match upstream.send(&head, Bytes::new()).await {
                Ok(response) => response,
                Err(e) => {
                    log.error(&format!("upstream error on stale refresh: {e}"));
                    return;
                }
            };
            let (parts, mut body) = response.into_parts();
            if parts.status != StatusCode::OK {
                log.warn(&format!("not cachable status code {} on stale refresh", parts.status));
                return;
            }
            let mut buf = pool.get();
            if let Err(e) = buffer::read_body(&mut body, &mut buf).await {
                log.error(&format!("cant read upstream body on stale refresh: {e}"));
                return;
            }
            let cache_control = resolver.resolve(&head, &parts.headers, &log);
            if !cache_control.should_persist() {
                return;
            }
            let Some(entry) = CacheEntry::from_response(&parts.headers, cache_control, buf.to_vec())
            else {
                return;
            };
            cache.set(&key, entry).await;
            log.debug("stale cache refreshed; is_refreshed=true");
        });
    }

    async fn read_request_body(&self, mut body: Body) -> Bytes {
        let mut buf = self.pool.get();
        // a body that errors mid-read forwards whatever arrived
        let _ = buffer::read_body(&mut body, &mut buf).await;
        if buf.is_empty() {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(&buf)
        }
    }
}

/// Replace any upstream copy of the status header with this node's own;
/// every response leaves with exactly one.
fn with_cache_status(mut response: Response<Body>, status: &'static str) -> Response<Body> {
    response.headers_mut().remove(X_CACHE_STATUS);
    response.headers_mut().insert(
        HeaderName::from_static(X_CACHE_STATUS),
        HeaderValue::from_static(status),
    );
    response
}

fn from_entry(entry: &CacheEntry, status: &'static str) -> Response<Body> {
    with_cache_status(entry.to_response(), status)
}

fn service_unavailable() -> Response<Body> {
    let mut response = Response::new(Body::from("service unavailable"));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    with_cache_status(response, "ERROR")
}
