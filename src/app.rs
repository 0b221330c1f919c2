//! The outer edge of the main listener: request id minting, per-request
//! logger binding, debug access logging and panic recovery around the
//! caching engine.

use crate::logging::SessionLog;
use crate::proxy::CacheProxy;
use crate::request::RequestHead;
use crate::user::User;
use futures::FutureExt;
use http::header::HeaderValue;
use http::StatusCode;
use hyper::{Body, Request, Response};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct App {
    proxy: CacheProxy,
    force_debug: User,
}

impl App {
    pub fn new(proxy: CacheProxy, force_debug: User) -> App {
        App { proxy, force_debug }
    }

    pub async fn handle(&self, mut request: Request<Body>) -> Response<Body> {
        // take the inbound request id or mint one, and back-propagate it
        // so the upstream sees the same id
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                let id = Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    request.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                id
            });

        let (parts, body) = request.into_parts();
        let head = RequestHead::from_parts(&parts);
        let log = SessionLog::new(&request_id, self.force_debug.is_user(&head));

        let access = if log.debug_enabled() {
            Some(AccessRecord::from_head(&head))
        } else {
            None
        };

        let start = Instant::now();
        let response = match AssertUnwindSafe(self.proxy.serve(head, body, &log))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                log.error(&format!("panic on request handler: {}", panic_message(panic.as_ref())));
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        };

        if let Some(access) = access {
            log.debug(&format!(
                "handle request; status_code={} request_duration_ms={} request_path={} method={} request_query={} user_agent={} response_size={} remote_addr={}",
                response.status().as_u16(),
                start.elapsed().as_millis(),
                access.path,
                access.method,
                access.query,
                access.user_agent,
                response_size(&response),
                access.remote_addr,
            ));
        }
        response
    }
}

struct AccessRecord {
    method: String,
    path: String,
    query: String,
    user_agent: String,
    remote_addr: String,
}

impl AccessRecord {
    fn from_head(head: &RequestHead) -> AccessRecord {
        AccessRecord {
            method: head.method.to_string(),
            path: head.uri.path().to_string(),
            query: head.uri.query().unwrap_or_default().to_string(),
            user_agent: header_str(head, http::header::USER_AGENT.as_str()),
            remote_addr: header_str(head, "x-real-ip"),
        }
    }
}

fn header_str(head: &RequestHead, name: &str) -> String {
    head.headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

// Every body this node produces is backed by a materialized buffer, so
// the hint is exact; for streamed pass-through bodies it falls back to
// the upstream content length when known.
fn response_size(response: &Response<Body>) -> u64 {
    use hyper::body::HttpBody;
    response.body().size_hint().exact().unwrap_or(0)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
