//! The diagnostic listener: health probes, metrics exposition and the
//! operator-triggered cache invalidation.

use crate::cache::Cache;
use crate::metrics;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use hyper::{Body, Request, Response};
use std::sync::Arc;
use std::time::Duration;

const INVALIDATE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle(cache: Arc<dyn Cache>, request: Request<Body>) -> Response<Body> {
    match request.uri().path() {
        "/healthz" | "/readyz" => text_response(StatusCode::OK, "ok"),
        "/invalidate" => invalidate(cache, &request).await,
        "/metrics" => {
            let mut response = Response::new(Body::from(metrics::gather_text()));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn invalidate(cache: Arc<dyn Cache>, request: &Request<Body>) -> Response<Body> {
    let pattern = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == "pattern")
            .map(|(_, value)| value.into_owned())
    });
    let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
        return text_response(StatusCode::BAD_REQUEST, "query 'pattern' is empty");
    };
    // the scan gets a bounded deadline of its own: the probing client
    // has usually given up long before a runaway scan would
    match tokio::time::timeout(INVALIDATE_TIMEOUT, cache.invalidate(&pattern)).await {
        Err(_) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "cant invalidate cache: deadline exceeded",
        ),
        Ok(Err(e)) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("cant invalidate cache: {e}"),
        ),
        Ok(Ok(())) => text_response(StatusCode::OK, "ok"),
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
