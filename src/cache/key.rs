//! Deterministic cache key derivation.
//!
//! The key is `<path>|<md5-hex>` where the digest covers a fixed-order
//! material string built from the selected headers, query parameters and
//! cookies. Entries sort lexicographically by key inside each section so
//! two equivalent requests with different submission order collide on
//! the same key; values of a multi-valued key keep their arrival order.

use crate::error::{ProxyError, Result};
use crate::request::RequestHead;
use md5::{Digest, Md5};
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

const DELIMITER: &str = "|";

/// Which request facets participate in the key.
///
/// Each axis is either an explicit allow-list or an "all" flag, never
/// both. Headers additionally honor an explicit deny list and the
/// implicit [`NOT_CACHABLE_HEADERS`] deny list under `all_headers`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KeyConfig {
    pub headers: Vec<String>,
    pub cookies: Vec<String>,
    pub query: Vec<String>,

    pub not_headers: Vec<String>,

    pub all_cookies: bool,
    pub all_query: bool,
    pub all_headers: bool,

    #[serde(skip)]
    compiled: OnceCell<CompiledSets>,
}

#[derive(Debug)]
struct CompiledSets {
    headers: HashSet<String>,
    not_headers: HashSet<String>,
    cookies: HashSet<String>,
    query: HashSet<String>,
}

impl KeyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.headers.is_empty() && self.all_headers {
            return Err(ProxyError::Config(
                "only one of 'headers' and 'all_headers' may be set".to_string(),
            ));
        }
        if !self.cookies.is_empty() && self.all_cookies {
            return Err(ProxyError::Config(
                "only one of 'cookies' and 'all_cookies' may be set".to_string(),
            ));
        }
        if !self.query.is_empty() && self.all_query {
            return Err(ProxyError::Config(
                "only one of 'query' and 'all_query' may be set".to_string(),
            ));
        }
        Ok(())
    }

    // The lookup sets are built exactly once, on first use; concurrent
    // first callers race on the init and all observe the published value.
    fn compiled(&self) -> &CompiledSets {
        self.compiled.get_or_init(|| CompiledSets {
            headers: self.headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            not_headers: self.not_headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            cookies: self.cookies.iter().cloned().collect(),
            query: self.query.iter().cloned().collect(),
        })
    }

    /// Derive the cache key for a request.
    pub fn apply(&self, head: &RequestHead) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.raw_material(head).as_bytes());
        format!("{}{}{}", head.path(), DELIMITER, hex::encode(hasher.finalize()))
    }

    fn raw_material(&self, head: &RequestHead) -> String {
        let sets = self.compiled();
        let mut material = String::with_capacity(512);

        material.push_str("headers");
        material.push_str(DELIMITER);
        if !self.headers.is_empty() || self.all_headers {
            let mut selected = BTreeMap::new();
            for name in head.headers.keys() {
                let lower = name.as_str();
                let allowed = sets.headers.contains(lower)
                    || (self.all_headers
                        && !is_blocklisted_header(lower)
                        && !sets.not_headers.contains(lower));
                if !allowed {
                    continue;
                }
                let value = head
                    .headers
                    .get_all(name)
                    .iter()
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .collect::<Vec<_>>()
                    .join(DELIMITER);
                selected.insert(canonical_header_name(lower), value);
            }
            push_section(&mut material, &selected);
        }

        material.push_str(DELIMITER);
        material.push_str("query");
        material.push_str(DELIMITER);
        if !self.query.is_empty() || self.all_query {
            let mut selected: BTreeMap<String, String> = BTreeMap::new();
            for (name, value) in head.query_pairs() {
                if !self.all_query && !sets.query.contains(&name) {
                    continue;
                }
                selected
                    .entry(name)
                    .and_modify(|joined| {
                        joined.push_str(DELIMITER);
                        joined.push_str(&value);
                    })
                    .or_insert(value);
            }
            push_section(&mut material, &selected);
        }

        material.push_str(DELIMITER);
        material.push_str("cookies");
        material.push_str(DELIMITER);
        if !self.cookies.is_empty() || self.all_cookies {
            let mut selected = BTreeMap::new();
            for (name, value) in head.cookies() {
                if self.all_cookies || sets.cookies.contains(&name) {
                    // a repeated cookie name keeps the last value
                    selected.insert(name, value);
                }
            }
            push_section(&mut material, &selected);
        }

        material
    }
}

fn push_section(material: &mut String, entries: &BTreeMap<String, String>) {
    let mut first = true;
    for (name, value) in entries {
        if !first {
            material.push_str(DELIMITER);
        }
        first = false;
        material.push_str(name);
        material.push('=');
        material.push_str(value);
    }
}

// Title-Case each dash-separated segment, the canonical wire form of a
// header name.
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Headers that never participate in key derivation under
/// `all_headers`: they describe transport, caching or client plumbing,
/// not content identity.
static NOT_CACHABLE_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // caching
        "age",
        "cache-control",
        "clear-site-data",
        "expires",
        "no-vary-search",
        // conditionals
        "last-modified",
        "etag",
        "if-match",
        "if-none-match",
        "if-modified-since",
        "if-unmodified-since",
        "vary",
        // connection management
        "connection",
        "keep-alive",
        // content negotiation
        "accept-encoding",
        // controls
        "max-forwards",
        // proxies
        "forwarded",
        "via",
        // other
        "upgrade",
        // common non-standard request fields
        "x-requested-with",
        "x-forwarded-for",
        "x-forwarded-host",
        "x-forwarded-proto",
        "x-forwarded-port",
        "x-forwarded-scheme",
        "proxy-connection",
        "x-csrf-token",
        "x-request-id",
        "x-correlation-id",
        "correlation-id",
        "save-data",
        "x-real-ip",
        "sec-ch-ua",
        "sec-ch-ua-platform",
        "dnt",
        "upgrade-insecure-requests",
        "sec-fetch-site",
        "sec-fetch-mode",
        "sec-fetch-user",
        "sec-fetch-dest",
        "accept-language",
        "priority",
        // session state
        "cookie",
    ]
    .into_iter()
    .collect()
});

fn is_blocklisted_header(lower_name: &str) -> bool {
    NOT_CACHABLE_HEADERS.contains(lower_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};
    use http::{HeaderMap, Method};

    fn request(query: &str, headers: &[(&str, &str)], cookie_header: Option<&str>) -> RequestHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        if let Some(cookies) = cookie_header {
            map.insert(http::header::COOKIE, HeaderValue::from_str(cookies).unwrap());
        }
        RequestHead {
            method: Method::GET,
            uri: format!("http://127.0.0.1/?{query}").parse().unwrap(),
            headers: map,
        }
    }

    #[test]
    fn test_raw_material_all_axes() {
        let config = KeyConfig {
            all_cookies: true,
            all_query: true,
            all_headers: true,
            ..KeyConfig::default()
        };
        let head = request(
            "a=1&b=2&d&c=4",
            &[("h1", "hv1"), ("h2", "hv2")],
            Some("c1=cv1; c3=cv3; c1=cv2; Without time=is invalid"),
        );
        assert_eq!(
            config.raw_material(&head),
            "headers|H1=hv1|H2=hv2|query|a=1|b=2|c=4|d=|cookies|c1=cv2|c3=cv3"
        );
    }

    #[test]
    fn test_raw_material_header_allow_list() {
        let config = KeyConfig {
            headers: vec!["host".to_string()],
            all_query: true,
            ..KeyConfig::default()
        };
        let head = request(
            "1_three&0_one=two",
            &[("host", "www.google.com"), ("another", "one")],
            Some("c1=cv2; c1=cv2"),
        );
        assert_eq!(
            config.raw_material(&head),
            "headers|Host=www.google.com|query|0_one=two|1_three=|cookies|"
        );
    }

    #[test]
    fn test_raw_material_empty_config_keeps_section_labels() {
        let config = KeyConfig::default();
        let head = request("a=1", &[("h1", "hv1")], Some("c1=v"));
        assert_eq!(config.raw_material(&head), "headers||query||cookies|");
    }

    #[test]
    fn test_all_headers_respects_deny_lists() {
        let config = KeyConfig {
            all_headers: true,
            not_headers: vec!["X-Custom".to_string()],
            ..KeyConfig::default()
        };
        let head = request(
            "",
            &[
                ("h1", "hv1"),
                ("x-custom", "denied"),
                ("accept-encoding", "gzip"),
                ("x-request-id", "abc"),
            ],
            None,
        );
        assert_eq!(config.raw_material(&head), "headers|H1=hv1|query||cookies|");
    }

    #[test]
    fn test_multi_values_join_in_arrival_order() {
        let config = KeyConfig {
            all_headers: true,
            all_query: true,
            ..KeyConfig::default()
        };
        let head = request("x=2&x=1", &[("h1", "b"), ("h1", "a")], None);
        assert_eq!(config.raw_material(&head), "headers|H1=b|a|query|x=2|1|cookies|");
    }

    #[test]
    fn test_key_determinism_and_format() {
        let config = KeyConfig {
            all_query: true,
            ..KeyConfig::default()
        };
        let first = request("a=1&b=2", &[], None);
        let second = request("b=2&a=1", &[], None);
        // submission order of distinct keys does not matter
        assert_eq!(config.apply(&first), config.apply(&second));

        let mut hasher = Md5::new();
        hasher.update(config.raw_material(&first).as_bytes());
        assert_eq!(config.apply(&first), format!("/|{}", hex::encode(hasher.finalize())));
    }

    #[test]
    fn test_validate_rejects_both_axis_forms() {
        let config = KeyConfig {
            headers: vec!["host".to_string()],
            all_headers: true,
            ..KeyConfig::default()
        };
        assert!(config.validate().is_err());
        let config = KeyConfig {
            cookies: vec!["c".to_string()],
            all_cookies: true,
            ..KeyConfig::default()
        };
        assert!(config.validate().is_err());
        let config = KeyConfig {
            query: vec!["q".to_string()],
            all_query: true,
            ..KeyConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
