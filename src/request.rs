//! A cheap, body-less view of an inbound request.
//!
//! The predicate engine, the key derivation and the upstream dispatcher
//! all inspect the same few request facets. [`RequestHead`] carries
//! exactly those and is `Clone`, so detached refresh and store tasks can
//! keep a copy after the client response has completed.

use http::header::COOKIE;
use http::request::Parts;
use http::{HeaderMap, Method, Uri};

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn from_parts(parts: &Parts) -> Self {
        RequestHead {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Decoded query pairs in arrival order. A key without `=` yields an
    /// empty value.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(query) = self.uri.query() else {
            return Vec::new();
        };
        url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Cookies from all `Cookie` headers, in arrival order. Cookies with
    /// an invalid name are skipped.
    pub fn cookies(&self) -> Vec<(String, String)> {
        let mut cookies = Vec::new();
        for header in self.headers.get_all(COOKIE) {
            let Ok(header) = header.to_str() else {
                continue;
            };
            for pair in header.split(';') {
                let pair = pair.trim();
                let Some((name, value)) = pair.split_once('=') else {
                    continue;
                };
                if !is_cookie_name(name) {
                    continue;
                }
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                cookies.push((name.to_string(), value.to_string()));
            }
        }
        cookies
    }
}

// cookie-name is an RFC 2616 token: no separators, no whitespace, no
// control characters.
fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            matches!(b,
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' |
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' |
                b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
        })
}
