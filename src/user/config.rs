//! YAML shape of a user predicate tree.
//!
//! Every node sets exactly one variant field; anything else is rejected
//! at load time so an ambiguous config cannot silently pick a branch.

use crate::error::{ProxyError, Result};
use crate::user::User;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    #[serde(default)]
    pub any: Option<Vec<UserConfig>>,
    #[serde(default)]
    pub and: Option<Vec<UserConfig>>,
    #[serde(default)]
    pub not: Option<Box<UserConfig>>,
    #[serde(default)]
    pub cookie: Option<CookieConfig>,
    #[serde(default)]
    pub user_agent: Option<UserAgentConfig>,
    #[serde(default)]
    pub header: Option<HeaderConfig>,
    #[serde(default)]
    pub query: Option<QueryConfig>,
    #[serde(default)]
    pub path: Option<PathConfig>,
    #[serde(default)]
    pub always: Option<bool>,
    #[serde(default)]
    pub never: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    #[serde(default)]
    pub exists: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserAgentConfig {
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderConfig {
    #[serde(default)]
    pub exists: Option<String>,
    #[serde(default)]
    pub pattern: Option<HeaderPatternConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderPatternConfig {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    #[serde(default)]
    pub count: Option<QueryCountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryCountConfig {
    pub gte: usize,
    pub lte: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathConfig {
    #[serde(default)]
    pub pattern: Option<String>,
}

impl UserConfig {
    pub fn validate(&self) -> Result<()> {
        self.build().map(|_| ())
    }

    /// Compile the config tree into an immutable predicate.
    pub fn build(&self) -> Result<User> {
        let set = self.set_fields();
        match set.len() {
            0 => return Err(ProxyError::Config("empty user predicate".to_string())),
            1 => {}
            _ => {
                return Err(ProxyError::Config(format!(
                    "only one predicate may be set per node, found '{}' and '{}'",
                    set[0], set[1]
                )))
            }
        }

        if self.always.is_some() {
            return Ok(User::always());
        }
        if self.never.is_some() {
            return Ok(User::never());
        }
        if let Some(not) = &self.not {
            return Ok(User::not(not.build()?));
        }
        if let Some(user_agent) = &self.user_agent {
            let pattern = user_agent
                .pattern
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ProxyError::Config("'user_agent' requires 'pattern'".to_string()))?;
            return User::user_agent_pattern(pattern);
        }
        if let Some(cookie) = &self.cookie {
            let name = cookie
                .exists
                .as_deref()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| ProxyError::Config("'cookie' requires 'exists'".to_string()))?;
            return Ok(User::cookie_exists(name));
        }
        if let Some(header) = &self.header {
            if let Some(name) = header.exists.as_deref().filter(|n| !n.is_empty()) {
                return Ok(User::header_exists(name));
            }
            if let Some(pattern) = &header.pattern {
                if !pattern.name.is_empty() {
                    return User::header_pattern(&pattern.name, &pattern.pattern);
                }
            }
            return Err(ProxyError::Config(
                "'header' requires 'exists' or 'pattern'".to_string(),
            ));
        }
        if let Some(and) = &self.and {
            let users = and.iter().map(|c| c.build()).collect::<Result<Vec<_>>>()?;
            return Ok(User::and(users));
        }
        if let Some(any) = &self.any {
            let users = any.iter().map(|c| c.build()).collect::<Result<Vec<_>>>()?;
            return Ok(User::any(users));
        }
        if let Some(query) = &self.query {
            let count = query
                .count
                .as_ref()
                .ok_or_else(|| ProxyError::Config("'query' requires 'count'".to_string()))?;
            return User::query_count(count.gte, count.lte);
        }
        if let Some(path) = &self.path {
            let pattern = path
                .pattern
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ProxyError::Config("'path' requires 'pattern'".to_string()))?;
            return User::path_pattern(pattern);
        }
        unreachable!("set_fields covered every variant")
    }

    fn set_fields(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.any.is_some() {
            set.push("any");
        }
        if self.always.is_some() {
            set.push("always");
        }
        if self.not.is_some() {
            set.push("not");
        }
        if self.never.is_some() {
            set.push("never");
        }
        if self.and.is_some() {
            set.push("and");
        }
        if self.cookie.is_some() {
            set.push("cookie");
        }
        if self.header.is_some() {
            set.push("header");
        }
        if self.user_agent.is_some() {
            set.push("user_agent");
        }
        if self.query.is_some() {
            set.push("query");
        }
        if self.path.is_some() {
            set.push("path");
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> UserConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_build_nested_tree() {
        let config = parse(
            r#"
any:
  - not:
      header:
        exists: authorization
  - user_agent:
      pattern: ".*yandex.*"
  - query:
      count:
        gte: 0
        lte: 3
"#,
        );
        config.validate().unwrap();
        let user = config.build().unwrap();
        assert!(matches!(user, User::Any(ref users) if users.len() == 3));
    }

    #[test]
    fn test_two_variants_rejected() {
        let config = parse("always: true\nnever: true\n");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'always' and 'never'"), "{err}");
    }

    #[test]
    fn test_empty_node_rejected() {
        let config = parse("not: {}\n");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("empty user predicate"), "{err}");
    }

    #[test]
    fn test_missing_option_rejected() {
        let config = parse("cookie: {}\n");
        assert!(config.validate().is_err());
        let config = parse("header: {}\n");
        assert!(config.validate().is_err());
        let config = parse("path: {}\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let config = parse("path:\n  pattern: '('\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: std::result::Result<UserConfig, _> = serde_yaml::from_str("frobnicate: true\n");
        assert!(parsed.is_err());
    }
}
