//! Request classification predicates.
//!
//! A [`User`] is a tree of boolean combinators over request facets. The
//! proxy is configured with three of them: who may populate the cache,
//! who may read from it and who gets forced debug logging. Evaluation
//! is short-circuit and allocation free.

mod config;

pub use config::UserConfig;

use crate::error::{ProxyError, Result};
use crate::request::RequestHead;
use http::header::USER_AGENT;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug)]
pub enum User {
    Always,
    Never,
    Not(Box<User>),
    Any(Vec<User>),
    And(Vec<User>),
    HeaderExists { name: String },
    HeaderPattern { name: String, pattern: Regex },
    CookieExists { name: String },
    UserAgentPattern(Regex),
    PathPattern(Regex),
    QueryCount { gte: usize, lte: usize },
}

impl User {
    pub fn always() -> User {
        User::Always
    }

    pub fn never() -> User {
        User::Never
    }

    pub fn not(user: User) -> User {
        User::Not(Box::new(user))
    }

    pub fn any(users: Vec<User>) -> User {
        User::Any(users)
    }

    pub fn and(users: Vec<User>) -> User {
        User::And(users)
    }

    pub fn header_exists(name: &str) -> User {
        User::HeaderExists {
            name: name.to_ascii_lowercase(),
        }
    }

    pub fn header_pattern(name: &str, pattern: &str) -> Result<User> {
        Ok(User::HeaderPattern {
            name: name.to_ascii_lowercase(),
            pattern: compile(pattern)?,
        })
    }

    pub fn cookie_exists(name: &str) -> User {
        User::CookieExists {
            name: name.to_ascii_lowercase(),
        }
    }

    pub fn user_agent_pattern(pattern: &str) -> Result<User> {
        Ok(User::UserAgentPattern(compile(pattern)?))
    }

    pub fn path_pattern(pattern: &str) -> Result<User> {
        Ok(User::PathPattern(compile(pattern)?))
    }

    pub fn query_count(gte: usize, lte: usize) -> Result<User> {
        if lte < gte {
            return Err(ProxyError::Config("query count requires lte >= gte".to_string()));
        }
        Ok(User::QueryCount { gte, lte })
    }

    /// Does the request belong to this user class?
    pub fn is_user(&self, head: &RequestHead) -> bool {
        match self {
            User::Always => true,
            User::Never => false,
            User::Not(user) => !user.is_user(head),
            User::Any(users) => users.iter().any(|u| u.is_user(head)),
            User::And(users) => users.iter().all(|u| u.is_user(head)),
            User::HeaderExists { name } => head.headers.contains_key(name.as_str()),
            User::HeaderPattern { name, pattern } => head
                .headers
                .get(name.as_str())
                .map(|v| pattern.is_match(&String::from_utf8_lossy(v.as_bytes())))
                .unwrap_or(false),
            User::CookieExists { name } => head
                .cookies()
                .iter()
                .any(|(cookie, _)| cookie.eq_ignore_ascii_case(name)),
            User::UserAgentPattern(pattern) => {
                let agent = head
                    .headers
                    .get(USER_AGENT)
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .unwrap_or_default();
                pattern.is_match(&agent)
            }
            User::PathPattern(pattern) => pattern.is_match(head.uri.path()),
            User::QueryCount { gte, lte } => {
                let count = head
                    .query_pairs()
                    .into_iter()
                    .map(|(k, _)| k)
                    .collect::<HashSet<_>>()
                    .len();
                count >= *gte && count <= *lte
            }
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ProxyError::Config(format!("invalid pattern: {e}")))
}

/// The indented multi-line form is logged at startup so an operator can
/// see how each configured class was understood.
impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            User::Always => write!(f, "always"),
            User::Never => write!(f, "never"),
            User::Not(user) => write!(f, "not = \n{}", indent(&user.to_string())),
            User::Any(users) => write!(f, "any = \n{}", children(users)),
            User::And(users) => write!(f, "and = \n{}", children(users)),
            User::HeaderExists { name } => write!(f, "header.exists = {name}"),
            User::HeaderPattern { name, pattern } => {
                write!(f, "header.pattern = {name} match '{pattern}'")
            }
            User::CookieExists { name } => write!(f, "cookie.exists = {name}"),
            User::UserAgentPattern(pattern) => write!(f, "user_agent.pattern = {pattern}"),
            User::PathPattern(pattern) => write!(f, "path.pattern = {pattern}"),
            User::QueryCount { gte, lte } => write!(f, "query.count = [{gte}, {lte}]"),
        }
    }
}

fn children(users: &[User]) -> String {
    users
        .iter()
        .map(|u| indent(&u.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use http::{HeaderMap, Method};

    fn head(uri: &str, headers: &[(&str, &str)]) -> RequestHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestHead {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers: map,
        }
    }

    #[test]
    fn test_query_count() {
        let cases = [
            (1, 10, "", false),
            (0, 1, "one=1&one=2", true),
            (0, 1, "", true),
            (0, 1, "one=1&one=2&two=3", false),
        ];
        for (gte, lte, query, want) in cases {
            let user = User::query_count(gte, lte).unwrap();
            let uri = format!("http://127.0.0.1/?{query}");
            assert_eq!(user.is_user(&head(&uri, &[])), want, "[{gte}, {lte}] and '{query}'");
        }
        assert!(User::query_count(2, 1).is_err());
    }

    #[test]
    fn test_header_predicates() {
        let r = head("http://127.0.0.1/", &[("Authorization", "Bearer x")]);
        assert!(User::header_exists("authorization").is_user(&r));
        assert!(User::header_exists("AUTHORIZATION").is_user(&r));
        assert!(!User::header_exists("cookie").is_user(&r));
        assert!(User::header_pattern("Authorization", "^Bearer ").unwrap().is_user(&r));
        assert!(!User::header_pattern("Authorization", "^Basic ").unwrap().is_user(&r));
        assert!(!User::header_pattern("missing", ".*x").unwrap().is_user(&r));
        assert!(User::header_pattern("x", "(").is_err());
    }

    #[test]
    fn test_cookie_exists() {
        let r = head("http://127.0.0.1/", &[("cookie", "Token=abc; other=1")]);
        assert!(User::cookie_exists("token").is_user(&r));
        assert!(!User::cookie_exists("session").is_user(&r));
    }

    #[test]
    fn test_user_agent_and_path() {
        let r = head("http://127.0.0.1/bots/info", &[("user-agent", "Yandex Bot (http://yandex.com/bots)")]);
        assert!(User::user_agent_pattern(".*http.?://yandex.com/bots.*").unwrap().is_user(&r));
        assert!(User::path_pattern("^/bots/").unwrap().is_user(&r));
        assert!(!User::path_pattern("^/public/").unwrap().is_user(&r));
        // user agent missing: matched against the empty string
        let bare = head("http://127.0.0.1/", &[]);
        assert!(User::user_agent_pattern("^$").unwrap().is_user(&bare));
    }

    #[test]
    fn test_combinators() {
        let r = head("http://127.0.0.1/", &[("authorization", "x")]);
        assert!(User::always().is_user(&r));
        assert!(!User::never().is_user(&r));
        assert!(User::not(User::never()).is_user(&r));
        assert!(User::any(vec![User::never(), User::always()]).is_user(&r));
        assert!(!User::any(vec![]).is_user(&r));
        assert!(User::and(vec![]).is_user(&r));
        assert!(!User::and(vec![User::always(), User::never()]).is_user(&r));
    }

    #[test]
    fn test_display_indents_children() {
        let user = User::any(vec![
            User::not(User::header_exists("authorization")),
            User::never(),
        ]);
        assert_eq!(
            user.to_string(),
            "any = \n  not = \n    header.exists = authorization\n  never"
        );
    }
}
