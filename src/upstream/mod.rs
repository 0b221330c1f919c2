//! Forwarding requests to the single configured origin.

mod transport;

pub use transport::{TransportPool, TransportPoolConfig};

use crate::error::{ProxyError, Result};
use crate::request::RequestHead;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, HOST, USER_AGENT};
use http::{HeaderMap, Request, Uri};
use hyper::{Body, Response};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(360);

// Hop-by-hop headers are stripped both from the forward request and
// from the origin response. Accept-Encoding rides along: the node
// caches identity bodies only.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "accept-encoding",
];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub host: String,
    pub scheme: String,
    /// Hard per-request deadline in seconds; 0 means the 360 s default.
    #[serde(default)]
    pub request_timeout: u64,
    pub transport_pool_config: TransportPoolConfig,
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ProxyError::Config("host must not be empty".to_string()));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ProxyError::Config(
                "scheme must be 'http' or 'https'".to_string(),
            ));
        }
        Uri::try_from(format!("{}://{}/", self.scheme, self.host))
            .map_err(|e| ProxyError::Config(format!("invalid upstream target: {e}")))?;
        self.transport_pool_config.validate()
    }

    pub fn build(&self) -> SingleHostUpstream {
        let request_timeout = if self.request_timeout == 0 {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            Duration::from_secs(self.request_timeout)
        };
        SingleHostUpstream {
            pool: TransportPool::new(self.transport_pool_config.clone()),
            request_timeout,
            scheme: self.scheme.clone(),
            host: self.host.clone(),
        }
    }
}

/// The dispatcher contract the decision engine depends on.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, head: &RequestHead, body: Bytes) -> Result<Response<Body>>;
}

pub struct SingleHostUpstream {
    pool: TransportPool,
    request_timeout: Duration,
    scheme: String,
    host: String,
}

impl SingleHostUpstream {
    fn build_forward(&self, head: &RequestHead, body: Bytes) -> Result<Request<Body>> {
        let path_and_query = head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.host.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::Internal(format!("build forward uri: {e}")))?;

        let body = if body.is_empty() {
            Body::empty()
        } else {
            Body::from(body)
        };
        let mut forward = Request::builder()
            .method(head.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| ProxyError::Internal(format!("build forward request: {e}")))?;

        *forward.headers_mut() = head.headers.clone();
        remove_hop_headers(forward.headers_mut());
        let host = HeaderValue::from_str(&self.host)
            .map_err(|e| ProxyError::Internal(format!("invalid upstream host: {e}")))?;
        forward.headers_mut().insert(HOST, host);
        // suppress the client library default when the client sent none
        if !forward.headers_mut().contains_key(USER_AGENT) {
            forward
                .headers_mut()
                .insert(USER_AGENT, HeaderValue::from_static(""));
        }
        Ok(forward)
    }
}

#[async_trait]
impl Upstream for SingleHostUpstream {
    async fn send(&self, head: &RequestHead, body: Bytes) -> Result<Response<Body>> {
        let forward = self.build_forward(head, body)?;
        let client = self.pool.next();
        match tokio::time::timeout(self.request_timeout, client.request(forward)).await {
            // the in-flight call is abandoned on timeout
            Err(_) => Err(ProxyError::UpstreamTimeout),
            Ok(Err(e)) => Err(ProxyError::Upstream(e)),
            Ok(Ok(mut response)) => {
                remove_hop_headers(response.headers_mut());
                Ok(response)
            }
        }
    }
}

pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderName;
    use http::Method;

    fn upstream() -> SingleHostUpstream {
        UpstreamConfig {
            host: "origin.internal:8080".to_string(),
            scheme: "http".to_string(),
            request_timeout: 0,
            transport_pool_config: TransportPoolConfig {
                size: 1,
                max_idle_conns_per_host: 4,
                idle_conn_timeout: 60,
                conn_timeout: 5,
                keep_alive_timeout: 30,
                max_life_time: 300,
            },
        }
        .build()
    }

    fn head(headers: &[(&str, &str)]) -> RequestHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestHead {
            method: Method::GET,
            uri: "http://client.example/some/path?x=1".parse().unwrap(),
            headers: map,
        }
    }

    #[test]
    fn test_config_validation() {
        let upstream = upstream();
        assert_eq!(upstream.request_timeout, DEFAULT_REQUEST_TIMEOUT);

        let config = UpstreamConfig {
            host: String::new(),
            scheme: "http".to_string(),
            request_timeout: 0,
            transport_pool_config: TransportPoolConfig {
                size: 1,
                max_idle_conns_per_host: 4,
                idle_conn_timeout: 60,
                conn_timeout: 5,
                keep_alive_timeout: 30,
                max_life_time: 300,
            },
        };
        assert!(config.validate().is_err());

        let config = UpstreamConfig {
            host: "origin".to_string(),
            scheme: "gopher".to_string(),
            ..config
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_forward_request_rewrites_target() {
        let forward = upstream()
            .build_forward(&head(&[("x-request-id", "abc")]), Bytes::new())
            .unwrap();
        assert_eq!(forward.uri().scheme_str(), Some("http"));
        assert_eq!(forward.uri().authority().unwrap().as_str(), "origin.internal:8080");
        assert_eq!(forward.uri().path_and_query().unwrap().as_str(), "/some/path?x=1");
        assert_eq!(forward.headers().get(HOST).unwrap(), "origin.internal:8080");
        assert_eq!(forward.headers().get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn test_forward_request_strips_hop_headers() {
        let forward = upstream()
            .build_forward(
                &head(&[
                    ("connection", "keep-alive"),
                    ("keep-alive", "timeout=5"),
                    ("proxy-connection", "keep-alive"),
                    ("proxy-authenticate", "Basic"),
                    ("proxy-authorization", "Basic x"),
                    ("te", "trailers"),
                    ("trailer", "Expires"),
                    ("transfer-encoding", "chunked"),
                    ("upgrade", "websocket"),
                    ("accept-encoding", "gzip"),
                    ("accept", "text/html"),
                ]),
                Bytes::new(),
            )
            .unwrap();
        for name in HOP_HEADERS {
            assert!(forward.headers().get(*name).is_none(), "{name} not stripped");
        }
        assert_eq!(forward.headers().get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_forward_request_suppresses_default_user_agent() {
        let forward = upstream().build_forward(&head(&[]), Bytes::new()).unwrap();
        assert_eq!(forward.headers().get(USER_AGENT).unwrap(), "");

        let forward = upstream()
            .build_forward(&head(&[("user-agent", "curl/8.0")]), Bytes::new())
            .unwrap();
        assert_eq!(forward.headers().get(USER_AGENT).unwrap(), "curl/8.0");
    }

    #[test]
    fn test_response_hop_header_strip() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        remove_hop_headers(&mut headers);
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("content-type").is_some());
    }
}
