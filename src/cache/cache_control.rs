//! The subset of `Cache-Control` this node honors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parsed cache directives, all durations in whole seconds.
///
/// Also deserialized directly from the fallback-override config, where
/// the directive names are the YAML keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheControl {
    pub public: bool,
    #[serde(rename = "max-age", with = "secs")]
    pub max_age: Duration,
    #[serde(rename = "s-maxage", with = "secs")]
    pub s_maxage: Duration,
    #[serde(rename = "stale-while-revalidate", with = "secs")]
    pub stale_while_revalidate: Duration,
    #[serde(rename = "stale-if-error", with = "secs")]
    pub stale_if_error: Duration,
}

impl CacheControl {
    /// Parse a `Cache-Control` header value.
    ///
    /// Unknown directives and non-integer values are silently ignored;
    /// missing directives stay zero. This parser never fails.
    pub fn parse(header: &str) -> CacheControl {
        let mut result = CacheControl::default();
        for token in header.trim().to_ascii_lowercase().split(' ') {
            let token = token.trim_matches(|c: char| c.is_whitespace() || c == ',');
            if token.is_empty() {
                continue;
            }
            if token == "public" {
                result.public = true;
                continue;
            }
            if let Some(value) = token.strip_prefix("max-age=") {
                if let Ok(seconds) = value.parse::<u64>() {
                    result.max_age = Duration::from_secs(seconds);
                }
                continue;
            }
            if let Some(value) = token.strip_prefix("s-maxage=") {
                if let Ok(seconds) = value.parse::<u64>() {
                    result.s_maxage = Duration::from_secs(seconds);
                }
                continue;
            }
            if let Some(value) = token.strip_prefix("stale-while-revalidate=") {
                if let Ok(seconds) = value.parse::<u64>() {
                    result.stale_while_revalidate = Duration::from_secs(seconds);
                }
                continue;
            }
            if let Some(value) = token.strip_prefix("stale-if-error=") {
                if let Ok(seconds) = value.parse::<u64>() {
                    result.stale_if_error = Duration::from_secs(seconds);
                }
            }
        }
        result
    }

    /// Whether this CDN is allowed to persist a response carrying these
    /// directives. `public` alone is not enough: at least one shared
    /// window must be non-zero.
    pub fn should_persist(&self) -> bool {
        self.public
            && (!self.s_maxage.is_zero()
                || !self.stale_while_revalidate.is_zero()
                || !self.stale_if_error.is_zero())
    }

    /// Store expiry: the widest of the three shared windows.
    pub fn ttl(&self) -> Duration {
        self.s_maxage
            .max(self.stale_while_revalidate)
            .max(self.stale_if_error)
    }
}

/// Durations serialize as plain seconds, both in the YAML config and in
/// the persisted entry format.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let cases = [
            (
                "public, max-age=100, s-maxage=200, stale-while-revalidate=300, stale-if-error=400",
                CacheControl {
                    public: true,
                    max_age: Duration::from_secs(100),
                    s_maxage: Duration::from_secs(200),
                    stale_while_revalidate: Duration::from_secs(300),
                    stale_if_error: Duration::from_secs(400),
                },
            ),
            ("nothing", CacheControl::default()),
            ("", CacheControl::default()),
            ("PUBLIC, S-MAXAGE=60", CacheControl {
                public: true,
                s_maxage: Duration::from_secs(60),
                ..CacheControl::default()
            }),
            // non-integer values are ignored
            ("public, s-maxage=soon", CacheControl {
                public: true,
                ..CacheControl::default()
            }),
        ];
        for (header, want) in cases {
            assert_eq!(CacheControl::parse(header), want, "{header:?}");
        }
    }

    #[test]
    fn test_should_persist() {
        assert!(!CacheControl::default().should_persist());
        assert!(!CacheControl::parse("public").should_persist());
        assert!(!CacheControl::parse("public, max-age=60").should_persist());
        assert!(!CacheControl::parse("s-maxage=60").should_persist());
        assert!(CacheControl::parse("public, s-maxage=60").should_persist());
        assert!(CacheControl::parse("public, stale-while-revalidate=60").should_persist());
        assert!(CacheControl::parse("public, stale-if-error=60").should_persist());
    }

    #[test]
    fn test_ttl() {
        let cc = CacheControl::parse("public, s-maxage=60, stale-while-revalidate=600, stale-if-error=30");
        assert_eq!(cc.ttl(), Duration::from_secs(600));
        assert_eq!(CacheControl::default().ttl(), Duration::ZERO);
    }

    #[test]
    fn test_config_deserialization() {
        let cc: CacheControl = serde_yaml::from_str(
            "public: true\ns-maxage: 300\nstale-while-revalidate: 600\n",
        )
        .unwrap();
        assert!(cc.public);
        assert_eq!(cc.s_maxage, Duration::from_secs(300));
        assert_eq!(cc.stale_while_revalidate, Duration::from_secs(600));
        assert_eq!(cc.stale_if_error, Duration::ZERO);
    }
}
