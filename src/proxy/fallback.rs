//! Resolving the effective cache policy for a (request, response) pair.
//!
//! Operators can cache responses for specific client classes (search
//! bots, anonymous traffic) even when the origin sent no directives,
//! without teaching the origin about CDN policy: the first fallback rule
//! whose user predicate matches the request overrides whatever the
//! origin said.

use crate::cache::CacheControl;
use crate::error::Result;
use crate::logging::SessionLog;
use crate::request::RequestHead;
use crate::user::{User, UserConfig};
use http::header::CACHE_CONTROL;
use http::{HeaderMap, Method};
use serde::Deserialize;

pub struct FallbackRule {
    user: User,
    cache_control: CacheControl,
}

#[derive(Default)]
pub struct CacheControlResolver {
    rules: Vec<FallbackRule>,
}

impl CacheControlResolver {
    pub fn new(rules: Vec<FallbackRule>) -> Self {
        CacheControlResolver { rules }
    }

    /// The effective cache policy: empty for non-GET, the first matching
    /// fallback override, or the parsed origin directive.
    pub fn resolve(
        &self,
        head: &RequestHead,
        response_headers: &HeaderMap,
        log: &SessionLog,
    ) -> CacheControl {
        if head.method != Method::GET {
            return CacheControl::default();
        }
        let base = response_headers
            .get(CACHE_CONTROL)
            .map(|v| CacheControl::parse(&String::from_utf8_lossy(v.as_bytes())))
            .unwrap_or_default();
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.user.is_user(head) {
                log.debug(&format!("use fallback cache control; fallback_index={i}"));
                return rule.cache_control.clone();
            }
        }
        base
    }
}

/// Ordered `{user, cache_control}` pairs from the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct FallbackConfig(pub Vec<FallbackRuleConfig>);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackRuleConfig {
    pub user: UserConfig,
    pub cache_control: CacheControl,
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<()> {
        self.build().map(|_| ())
    }

    pub fn build(&self) -> Result<CacheControlResolver> {
        let rules = self
            .0
            .iter()
            .map(|rule| {
                Ok(FallbackRule {
                    user: rule.user.build()?,
                    cache_control: rule.cache_control.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CacheControlResolver::new(rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use http::Uri;
    use std::time::Duration;

    fn resolver() -> CacheControlResolver {
        CacheControlResolver::new(vec![FallbackRule {
            user: User::path_pattern("^/fallback$").unwrap(),
            cache_control: CacheControl {
                public: true,
                max_age: Duration::ZERO,
                s_maxage: Duration::from_secs(3600),
                stale_while_revalidate: Duration::from_secs(7200),
                stale_if_error: Duration::from_secs(10800),
            },
        }])
    }

    fn head(method: Method, uri: &str) -> RequestHead {
        RequestHead {
            method,
            uri: uri.parse::<Uri>().unwrap(),
            headers: HeaderMap::new(),
        }
    }

    fn response_headers(cache_control: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = cache_control {
            headers.insert(CACHE_CONTROL, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn test_no_match_no_header_is_empty() {
        let log = SessionLog::new("test", false);
        let cc = resolver().resolve(&head(Method::GET, "http://localhost/"), &response_headers(None), &log);
        assert_eq!(cc, CacheControl::default());
    }

    #[test]
    fn test_no_match_keeps_origin_directive() {
        let log = SessionLog::new("test", false);
        let cc = resolver().resolve(
            &head(Method::GET, "http://localhost/"),
            &response_headers(Some(
                "public, max-age=100, s-maxage=200, stale-while-revalidate=300, stale-if-error=400",
            )),
            &log,
        );
        assert_eq!(cc.max_age, Duration::from_secs(100));
        assert_eq!(cc.s_maxage, Duration::from_secs(200));
        assert_eq!(cc.stale_while_revalidate, Duration::from_secs(300));
        assert_eq!(cc.stale_if_error, Duration::from_secs(400));
    }

    #[test]
    fn test_match_overrides_origin_directive() {
        let log = SessionLog::new("test", false);
        let cc = resolver().resolve(
            &head(Method::GET, "http://localhost/fallback"),
            &response_headers(Some("public, max-age=100, s-maxage=200")),
            &log,
        );
        assert_eq!(cc.s_maxage, Duration::from_secs(3600));
        assert_eq!(cc.stale_while_revalidate, Duration::from_secs(7200));
        assert_eq!(cc.stale_if_error, Duration::from_secs(10800));
    }

    #[test]
    fn test_non_get_is_never_persistable() {
        let log = SessionLog::new("test", false);
        let cc = resolver().resolve(
            &head(Method::POST, "http://localhost/fallback"),
            &response_headers(Some("public, s-maxage=200")),
            &log,
        );
        assert_eq!(cc, CacheControl::default());
        assert!(!cc.should_persist());
    }

    #[test]
    fn test_empty_config_builds_empty_resolver() {
        let resolver = FallbackConfig::default().build().unwrap();
        let log = SessionLog::new("test", false);
        let cc = resolver.resolve(
            &head(Method::GET, "http://localhost/"),
            &response_headers(Some("public, s-maxage=200")),
            &log,
        );
        assert_eq!(cc.s_maxage, Duration::from_secs(200));
    }

    #[test]
    fn test_config_build() {
        let config: FallbackConfig = serde_yaml::from_str(
            r#"
- user:
    path:
      pattern: "^/public/"
  cache_control:
    public: true
    s-maxage: 300
"#,
        )
        .unwrap();
        config.validate().unwrap();
        let resolver = config.build().unwrap();
        let log = SessionLog::new("test", false);
        let cc = resolver.resolve(
            &head(Method::GET, "http://localhost/public/index.html"),
            &response_headers(None),
            &log,
        );
        assert!(cc.should_persist());
        assert_eq!(cc.s_maxage, Duration::from_secs(300));
    }
}
