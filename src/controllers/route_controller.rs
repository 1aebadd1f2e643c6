use std::cmp::Reverse;

use http::HeaderMap;

use crate::{
    controllers::auth_controller::{check_basic_auth, AuthOutcome},
    models::route_rule::{strip_port, Middleware, RouteRule, RouteTable},
};

pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// What a listener knows about itself when resolving a request.
#[derive(Debug, Clone)]
pub struct EntryPointContext {
    pub name: String,
    pub secure: bool,
    /// Every plaintext request is sent to https before routing.
    pub redirect_to_https: bool,
    pub https_port: u16,
    /// Some listener terminates TLS, so sending clients to https can work.
    pub https_available: bool,
    /// Unauthenticated dashboard listener (`api.insecure`), no routing happens here.
    pub dashboard_only: bool,
}

/// Parts of an incoming request routing looks at.
pub struct IncomingRequest<'a> {
    pub host: &'a str,
    pub path: &'a str,
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
}

#[derive(Debug, PartialEq)]
pub enum RouteDecision<'t> {
    Redirect(String),
    NotFound,
    Challenge,
    Misconfigured(String),
    Forward(&'t RouteRule),
}

pub fn https_location(host: &str, path_and_query: &str, https_port: u16) -> String {
    let host = strip_port(host);
    if https_port == DEFAULT_HTTPS_PORT {
        format!("https://{host}{path_and_query}")
    } else {
        format!("https://{host}:{https_port}{path_and_query}")
    }
}

/// host match by priority, then https redirection, then credentials, then forward.
pub fn resolve<'t>(
    table: &'t RouteTable,
    entrypoint: &EntryPointContext,
    request: &IncomingRequest,
) -> RouteDecision<'t> {
    if entrypoint.redirect_to_https && !entrypoint.secure {
        return RouteDecision::Redirect(https_location(
            request.host,
            request.path_and_query,
            entrypoint.https_port,
        ));
    }
    //longest rule wins, declaration order breaks ties
    let route = match table
        .routes
        .iter()
        .filter(|route| route.listens_on(&entrypoint.name) && route.matcher.matches(request.host, request.path))
        .min_by_key(|route| Reverse(route.priority()))
    {
        Some(route) => route,
        None => return RouteDecision::NotFound,
    };
    if route.tls && !entrypoint.secure && entrypoint.https_available {
        return RouteDecision::Redirect(https_location(
            request.host,
            request.path_and_query,
            entrypoint.https_port,
        ));
    }
    for name in &route.middlewares {
        match table.middlewares.get(name) {
            Some(Middleware::BasicAuth { users }) => match check_basic_auth(request.headers, users) {
                AuthOutcome::Granted => {}
                AuthOutcome::Missing | AuthOutcome::Rejected => return RouteDecision::Challenge,
            },
            None => {
                return RouteDecision::Misconfigured(format!(
                    "router `{}` references unknown middleware `{}`",
                    route.name, name
                ))
            }
        }
    }
    RouteDecision::Forward(route)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::{engine::general_purpose::STANDARD, Engine};
    use http::{header::AUTHORIZATION, HeaderValue};

    use super::*;
    use crate::models::route_rule::{Credential, RuleMatcher, ServiceTarget};

    fn route(name: &str, rule: &str, tls: bool, middlewares: &[&str]) -> RouteRule {
        RouteRule {
            name: name.to_string(),
            rule: rule.to_string(),
            matcher: RuleMatcher::parse(rule).unwrap(),
            entrypoints: vec![],
            tls,
            cert_resolver: None,
            middlewares: middlewares.iter().map(|m| m.to_string()).collect(),
            service: ServiceTarget::Upstream {
                name: name.to_string(),
                address: format!("{name}:8000"),
            },
            provider: "file".to_string(),
        }
    }

    fn table() -> RouteTable {
        let mut middlewares = HashMap::new();
        middlewares.insert(
            "auth".to_string(),
            Middleware::BasicAuth {
                users: vec![Credential {
                    user: "testuser".to_string(),
                    hash: bcrypt::hash("password", 4).unwrap(),
                }],
            },
        );
        RouteTable {
            routes: vec![
                route("api", "Host(`app.com`) && PathPrefix(`/api`)", false, &[]),
                route("app", "Host(`app.com`)", false, &[]),
                route("secure", "Host(`secure.com`)", true, &[]),
                route("admin", "Host(`admin.com`)", false, &["auth"]),
                route("broken", "Host(`broken.com`)", false, &["missing"]),
            ],
            middlewares,
        }
    }

    fn web() -> EntryPointContext {
        EntryPointContext {
            name: "web".to_string(),
            secure: false,
            redirect_to_https: false,
            https_port: DEFAULT_HTTPS_PORT,
            https_available: true,
            dashboard_only: false,
        }
    }

    fn request<'a>(host: &'a str, path: &'a str, headers: &'a HeaderMap) -> IncomingRequest<'a> {
        IncomingRequest {
            host,
            path,
            path_and_query: path,
            headers,
        }
    }

    fn forwarded_to(decision: RouteDecision) -> String {
        match decision {
            RouteDecision::Forward(route) => route.name.clone(),
            other => panic!("expected a forward, got {other:?}"),
        }
    }

    #[test]
    fn most_specific_matching_route_wins() {
        let table = table();
        let headers = HeaderMap::new();
        assert_eq!(forwarded_to(resolve(&table, &web(), &request("app.com", "/api/v1", &headers))), "api");
        assert_eq!(forwarded_to(resolve(&table, &web(), &request("APP.com:80", "/", &headers))), "app");
        assert_eq!(resolve(&table, &web(), &request("other.com", "/", &headers)), RouteDecision::NotFound);
    }

    #[test]
    fn path_prefix_rules_outrank_bare_hosts_declared_first() {
        let table = RouteTable {
            routes: vec![
                route("web", "Host(`a.com`)", false, &[]),
                route("webapi", "Host(`a.com`) && PathPrefix(`/api`)", false, &[]),
                route("other", "Host(`b.com`)", false, &[]),
                route("again", "Host(`b.com`)", false, &[]),
            ],
            middlewares: HashMap::new(),
        };
        let headers = HeaderMap::new();
        assert_eq!(forwarded_to(resolve(&table, &web(), &request("a.com", "/api/x", &headers))), "webapi");
        assert_eq!(forwarded_to(resolve(&table, &web(), &request("a.com", "/", &headers))), "web");
        assert_eq!(forwarded_to(resolve(&table, &web(), &request("b.com", "/", &headers))), "other");
    }

    #[test]
    fn plaintext_request_to_tls_route_is_redirected() {
        let table = table();
        let headers = HeaderMap::new();
        let req = IncomingRequest {
            host: "secure.com",
            path: "/items",
            path_and_query: "/items?page=2",
            headers: &headers,
        };
        assert_eq!(
            resolve(&table, &web(), &req),
            RouteDecision::Redirect("https://secure.com/items?page=2".to_string())
        );
        let websecure = EntryPointContext {
            name: "websecure".to_string(),
            secure: true,
            ..web()
        };
        assert_eq!(forwarded_to(resolve(&table, &websecure, &req)), "secure");
    }

    #[test]
    fn tls_routes_are_served_in_plaintext_when_no_listener_has_certificates() {
        let table = table();
        let headers = HeaderMap::new();
        let plaintext_only = EntryPointContext {
            https_available: false,
            ..web()
        };
        assert_eq!(
            forwarded_to(resolve(&table, &plaintext_only, &request("secure.com", "/", &headers))),
            "secure"
        );
    }

    #[test]
    fn entrypoint_redirection_applies_before_routing() {
        let table = table();
        let headers = HeaderMap::new();
        let redirecting = EntryPointContext {
            redirect_to_https: true,
            https_port: 8443,
            ..web()
        };
        assert_eq!(
            resolve(&table, &redirecting, &request("unknown.com:80", "/", &headers)),
            RouteDecision::Redirect("https://unknown.com:8443/".to_string())
        );
    }

    #[test]
    fn basic_auth_gates_forwarding() {
        let table = table();
        let none = HeaderMap::new();
        assert_eq!(resolve(&table, &web(), &request("admin.com", "/", &none)), RouteDecision::Challenge);

        let mut wrong = HeaderMap::new();
        wrong.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", STANDARD.encode("testuser:wrong"))).unwrap(),
        );
        assert_eq!(resolve(&table, &web(), &request("admin.com", "/", &wrong)), RouteDecision::Challenge);

        let mut right = HeaderMap::new();
        right.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", STANDARD.encode("testuser:password"))).unwrap(),
        );
        assert_eq!(forwarded_to(resolve(&table, &web(), &request("admin.com", "/", &right))), "admin");
    }

    #[test]
    fn unknown_middleware_is_a_configuration_error() {
        let table = table();
        let headers = HeaderMap::new();
        assert!(matches!(
            resolve(&table, &web(), &request("broken.com", "/", &headers)),
            RouteDecision::Misconfigured(_)
        ));
    }

    #[test]
    fn routes_only_answer_on_their_entrypoints() {
        let mut table = table();
        table.routes[1].entrypoints = vec!["websecure".to_string()];
        let headers = HeaderMap::new();
        assert_eq!(resolve(&table, &web(), &request("app.com", "/", &headers)), RouteDecision::NotFound);
    }
}
