use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::error::TopologyError;

pub const DASHBOARD_SERVICE: &str = "api@internal";

static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
static ARGUMENT_REGEX: OnceLock<Regex> = OnceLock::new();

/// Parsed form of a router rule such as ``Host(`a.com`) && PathPrefix(`/api`)``.
/// Host terms are alternatives, a path prefix narrows every host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatcher {
    pub hosts: Vec<String>,
    pub path_prefix: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Token {
    Host(Vec<String>),
    PathPrefix(String),
    And,
    Or,
    Open,
    Close,
}

#[derive(Debug)]
enum RuleExpr {
    Host(Vec<String>),
    PathPrefix(String),
    And(Vec<RuleExpr>),
    Or(Vec<RuleExpr>),
}

fn tokenize(rule: &str) -> Result<Vec<Token>, String> {
    let token_regex = TOKEN_REGEX.get_or_init(|| {
        Regex::new(r"^\s*(?:(&&)|(\|\|)|(\()|(\))|(Host|PathPrefix)\s*\(([^)]*)\))").expect("static regex")
    });
    let argument_regex =
        ARGUMENT_REGEX.get_or_init(|| Regex::new(r#"`([^`]*)`|"([^"]*)""#).expect("static regex"));

    let mut tokens = vec![];
    let mut rest = rule;
    while !rest.trim().is_empty() {
        let captures = token_regex.captures(rest).ok_or("unsupported matcher")?;
        let token = if captures.get(1).is_some() {
            Token::And
        } else if captures.get(2).is_some() {
            Token::Or
        } else if captures.get(3).is_some() {
            Token::Open
        } else if captures.get(4).is_some() {
            Token::Close
        } else {
            let arguments = argument_regex
                .captures_iter(&captures[6])
                .filter_map(|arg| arg.get(1).or(arg.get(2)).map(|m| m.as_str().to_string()))
                .collect::<Vec<String>>();
            if arguments.is_empty() {
                return Err("matcher without arguments".to_string());
            }
            match &captures[5] {
                "Host" => Token::Host(arguments.into_iter().map(|h| h.to_ascii_lowercase()).collect()),
                _ => {
                    if arguments.len() != 1 {
                        return Err("only one PathPrefix value is supported".to_string());
                    }
                    if !arguments[0].starts_with('/') {
                        return Err("PathPrefix must start with `/`".to_string());
                    }
                    Token::PathPrefix(arguments[0].clone())
                }
            }
        };
        tokens.push(token);
        rest = &rest[captures[0].len()..];
    }
    Ok(tokens)
}

/// `||` binds looser than `&&`, parentheses group.
struct RuleParser {
    tokens: std::vec::IntoIter<Token>,
    peeked: Option<Token>,
}

impl RuleParser {
    fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            self.peeked = self.tokens.next();
        }
        self.peeked.as_ref()
    }

    fn next(&mut self) -> Option<Token> {
        self.peeked.take().or_else(|| self.tokens.next())
    }

    fn or_expr(&mut self) -> Result<RuleExpr, String> {
        let mut terms = vec![self.and_expr()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            terms.push(self.and_expr()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { RuleExpr::Or(terms) })
    }

    fn and_expr(&mut self) -> Result<RuleExpr, String> {
        let mut terms = vec![self.atom()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            terms.push(self.atom()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { RuleExpr::And(terms) })
    }

    fn atom(&mut self) -> Result<RuleExpr, String> {
        match self.next() {
            Some(Token::Host(hosts)) => Ok(RuleExpr::Host(hosts)),
            Some(Token::PathPrefix(prefix)) => Ok(RuleExpr::PathPrefix(prefix)),
            Some(Token::Open) => {
                let inner = self.or_expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("unbalanced parentheses".to_string()),
                }
            }
            _ => Err("expected a matcher".to_string()),
        }
    }
}

/// Hosts of an expression made only of `Host` terms joined by `||`.
fn host_alternatives(expr: &RuleExpr) -> Option<Vec<String>> {
    match expr {
        RuleExpr::Host(hosts) => Some(hosts.clone()),
        RuleExpr::Or(terms) => terms
            .iter()
            .map(host_alternatives)
            .collect::<Option<Vec<Vec<String>>>>()
            .map(|groups| groups.concat()),
        _ => None,
    }
}

impl RuleMatcher {
    /// Accepts host alternatives joined by `||`, optionally narrowed by one `&& PathPrefix`.
    pub fn parse(rule: &str) -> Result<RuleMatcher, TopologyError> {
        let invalid = |reason: &str| TopologyError::InvalidRule {
            rule: rule.to_string(),
            reason: reason.to_string(),
        };
        let tokens = tokenize(rule).map_err(|reason| invalid(&reason))?;
        if tokens.is_empty() {
            return Err(invalid("a Host matcher is required"));
        }
        let mut parser = RuleParser {
            tokens: tokens.into_iter(),
            peeked: None,
        };
        let expr = parser.or_expr().map_err(|reason| invalid(&reason))?;
        if parser.next().is_some() {
            return Err(invalid("unbalanced parentheses"));
        }

        if let Some(hosts) = host_alternatives(&expr) {
            return Ok(RuleMatcher {
                hosts,
                path_prefix: None,
            });
        }
        match expr {
            RuleExpr::And(terms) if terms.len() == 2 => {
                let (hosts, prefix) = match (&terms[0], &terms[1]) {
                    (RuleExpr::PathPrefix(prefix), other) | (other, RuleExpr::PathPrefix(prefix)) => {
                        (host_alternatives(other), prefix.clone())
                    }
                    _ => (None, String::new()),
                };
                match hosts {
                    Some(hosts) => Ok(RuleMatcher {
                        hosts,
                        path_prefix: Some(prefix),
                    }),
                    None => Err(invalid("expected Host alternatives joined by `||` and at most one `&& PathPrefix`")),
                }
            }
            RuleExpr::PathPrefix(_) => Err(invalid("a Host matcher is required")),
            _ => Err(invalid("expected Host alternatives joined by `||` and at most one `&& PathPrefix`")),
        }
    }

    /// `host` is the raw Host header value, a port suffix is ignored.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host = strip_port(host).to_ascii_lowercase();
        let host_matches = self.hosts.iter().any(|h| *h == host);
        let path_matches = match &self.path_prefix {
            Some(prefix) => path.starts_with(prefix.as_str()),
            None => true,
        };
        host_matches && path_matches
    }
}

pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        //[::1]:80
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceTarget {
    Upstream { name: String, address: String },
    Dashboard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub user: String,
    #[serde(skip_serializing)]
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Middleware {
    BasicAuth { users: Vec<Credential> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteRule {
    pub name: String,
    pub rule: String,
    #[serde(skip_serializing)]
    pub matcher: RuleMatcher,
    pub entrypoints: Vec<String>,
    pub tls: bool,
    pub cert_resolver: Option<String>,
    pub middlewares: Vec<String>,
    pub service: ServiceTarget,
    pub provider: String,
}

impl RouteRule {
    /// Rule length, as Traefik ranks routers without an explicit priority.
    pub fn priority(&self) -> usize {
        self.rule.len()
    }

    pub fn listens_on(&self, entrypoint: &str) -> bool {
        self.entrypoints.is_empty() || self.entrypoints.iter().any(|e| e == entrypoint)
    }
}

/// Routes in declaration order plus the middlewares they reference by name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteTable {
    pub routes: Vec<RouteRule>,
    pub middlewares: HashMap<String, Middleware>,
}

impl RouteTable {
    /// Appends `other` after the current routes, earlier middleware names win.
    pub fn merge(&mut self, other: RouteTable) {
        self.routes.extend(other.routes);
        for (name, middleware) in other.middlewares {
            self.middlewares.entry(name).or_insert(middleware);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_host() {
        let matcher = RuleMatcher::parse("Host(`django.localhost`)").unwrap();
        assert_eq!(matcher.hosts, vec!["django.localhost".to_string()]);
        assert!(matcher.path_prefix.is_none());
    }

    #[test]
    fn parses_host_alternatives_and_prefix() {
        let matcher =
            RuleMatcher::parse("(Host(`a.com`) || Host(`B.com`)) && PathPrefix(`/api`)").unwrap();
        assert_eq!(matcher.hosts, vec!["a.com".to_string(), "b.com".to_string()]);
        assert_eq!(matcher.path_prefix.as_deref(), Some("/api"));
        assert!(matcher.matches("b.com:8080", "/api/items"));
        assert!(!matcher.matches("b.com", "/static/app.css"));
        assert!(!matcher.matches("c.com", "/api"));
    }

    #[test]
    fn parses_comma_separated_hosts() {
        let matcher = RuleMatcher::parse("Host(`a.com`, \"www.a.com\")").unwrap();
        assert_eq!(matcher.hosts.len(), 2);
        assert!(matcher.matches("WWW.A.COM", "/"));
    }

    #[test]
    fn rejects_unknown_matchers() {
        assert!(RuleMatcher::parse("Host(`a.com`) && Method(`GET`)").is_err());
        assert!(RuleMatcher::parse("PathPrefix(`/api`)").is_err());
        assert!(RuleMatcher::parse("Host()").is_err());
    }

    #[test]
    fn rejects_operator_placements_outside_the_supported_shape() {
        for rule in [
            "Host(`a.com`) || PathPrefix(`/health`)",
            "Host(`a.com`) && Host(`b.com`)",
            "Host(`a.com`) || (Host(`b.com`) && PathPrefix(`/api`))",
            "Host(`a.com`) || Host(`b.com`) && PathPrefix(`/api`)",
            "Host(`a.com`) && PathPrefix(`/a`) && PathPrefix(`/b`)",
            "(Host(`a.com`) && PathPrefix(`/api`)",
            "Host(`a.com`) &&",
            "Host(`a.com`) Host(`b.com`)",
        ] {
            assert!(RuleMatcher::parse(rule).is_err(), "{rule}");
        }
    }

    #[test]
    fn prefix_may_come_first() {
        let matcher = RuleMatcher::parse("PathPrefix(`/api`) && (Host(`a.com`) || Host(`b.com`))").unwrap();
        assert_eq!(matcher.hosts, vec!["a.com".to_string(), "b.com".to_string()]);
        assert_eq!(matcher.path_prefix.as_deref(), Some("/api"));
        let matcher = RuleMatcher::parse("Host(`a.com`) && (PathPrefix(`/`))").unwrap();
        assert_eq!(matcher.path_prefix.as_deref(), Some("/"));
    }

    #[test]
    fn strips_ports() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
    }
}
