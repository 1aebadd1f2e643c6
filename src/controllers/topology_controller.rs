use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use crate::{
    controllers::auth_controller::parse_users,
    error::{ConfigError, TopologyError},
    models::{
        route_rule::{Middleware, RouteRule, RouteTable, RuleMatcher, ServiceTarget, DASHBOARD_SERVICE},
        topology_model::{ServiceSpec, TopologyDescriptor, Variant},
    },
    utils::env_utils::is_truthy,
};

pub const LABEL_PREFIX: &str = "traefik.";
const ROUTERS_PREFIX: &str = "traefik.http.routers.";
const MIDDLEWARES_PREFIX: &str = "traefik.http.middlewares.";
const SERVICES_PREFIX: &str = "traefik.http.services.";
pub const FILE_PROVIDER: &str = "file";

pub fn load_topology(path: &Path) -> Result<TopologyDescriptor, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_topology(path, &raw)
}

pub fn parse_topology(path: &Path, raw: &str) -> Result<TopologyDescriptor, ConfigError> {
    toml::from_str::<TopologyDescriptor>(raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Dependency order in which the services have to be started, ties broken by name.
pub fn start_order(descriptor: &TopologyDescriptor) -> Result<Vec<String>, TopologyError> {
    for (name, service) in &descriptor.services {
        if let Some(dependency) = service
            .depends_on
            .iter()
            .find(|d| !descriptor.services.contains_key(d.as_str()))
        {
            return Err(TopologyError::UnknownDependency {
                service: name.clone(),
                dependency: dependency.clone(),
            });
        }
    }
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = descriptor
        .services
        .iter()
        .map(|(name, service)| {
            (
                name.as_str(),
                service.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let mut order = vec![];
    loop {
        let ready = remaining
            .iter()
            .find(|(_, dependencies)| dependencies.is_empty())
            .map(|(name, _)| *name);
        let name = match ready {
            Some(name) => name,
            None => break,
        };
        remaining.remove(name);
        for dependencies in remaining.values_mut() {
            dependencies.remove(name);
        }
        order.push(name.to_string());
    }
    if !remaining.is_empty() {
        return Err(TopologyError::Cycle(
            remaining.keys().map(|name| name.to_string()).collect(),
        ));
    }
    Ok(order)
}

pub fn is_enabled(labels: &BTreeMap<String, String>, exposed_by_default: bool) -> bool {
    match labels.get("traefik.enable") {
        Some(value) => is_truthy(value),
        None => exposed_by_default,
    }
}

/// Strips a `@provider` qualifier from a middleware or service reference.
fn local_name(reference: &str) -> &str {
    match reference.split_once('@') {
        Some((name, provider)) if provider != "internal" => name,
        _ => reference,
    }
}

/// Routers, middlewares and load balancer ports declared in one owner's labels.
/// `host` is how the proxy reaches the owner, `fallback_port` is used when no
/// load balancer port label exists.
pub fn routes_from_labels(
    owner: &str,
    host: &str,
    labels: &BTreeMap<String, String>,
    fallback_port: Option<u16>,
    provider: &str,
) -> Result<RouteTable, TopologyError> {
    let invalid = |label: &str, reason: &str| TopologyError::InvalidLabel {
        service: owner.to_string(),
        label: label.to_string(),
        reason: reason.to_string(),
    };

    let mut routers: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    let mut middlewares = BTreeMap::new();
    let mut service_ports: BTreeMap<&str, u16> = BTreeMap::new();
    for (label, value) in labels {
        if let Some(rest) = label.strip_prefix(ROUTERS_PREFIX) {
            let (router, key) = rest.split_once('.').ok_or_else(|| invalid(label, "missing router option"))?;
            routers.entry(router).or_default().insert(key, value.as_str());
        } else if let Some(rest) = label.strip_prefix(MIDDLEWARES_PREFIX) {
            match rest.split_once('.') {
                Some((name, "basicauth.users")) => {
                    let users = parse_users(owner, label, value)?;
                    middlewares.insert(name.to_string(), Middleware::BasicAuth { users });
                }
                _ => return Err(invalid(label, "unsupported middleware option")),
            }
        } else if let Some(rest) = label.strip_prefix(SERVICES_PREFIX) {
            match rest.split_once('.') {
                Some((name, "loadbalancer.server.port")) => {
                    let port = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|_| invalid(label, "port must be a number"))?;
                    service_ports.insert(name, port);
                }
                _ => return Err(invalid(label, "unsupported service option")),
            }
        }
    }

    let mut routes = vec![];
    for (router, options) in routers {
        let rule = options
            .get("rule")
            .ok_or_else(|| invalid(&format!("{ROUTERS_PREFIX}{router}.rule"), "router has no rule"))?;
        let matcher = RuleMatcher::parse(rule)?;
        let service_name = match options.get("service") {
            Some(service) => local_name(service).to_string(),
            None if service_ports.len() == 1 => service_ports.keys().next().map(|s| s.to_string()).unwrap_or_default(),
            None => owner.to_string(),
        };
        let service = if service_name == DASHBOARD_SERVICE {
            ServiceTarget::Dashboard
        } else {
            let port = service_ports
                .get(service_name.as_str())
                .copied()
                .or(fallback_port)
                .ok_or_else(|| invalid(&format!("{ROUTERS_PREFIX}{router}"), "no port known for the target service"))?;
            ServiceTarget::Upstream {
                name: service_name.clone(),
                address: format!("{host}:{port}"),
            }
        };
        let split_list = |key: &str| {
            options
                .get(key)
                .map(|value| {
                    value
                        .split(',')
                        .map(|item| local_name(item.trim()).to_string())
                        .filter(|item| !item.is_empty())
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default()
        };
        let tls = match options.get("tls") {
            Some(value) => is_truthy(value),
            // a cert resolver implies tls
            None => options.contains_key("tls.certresolver"),
        };
        routes.push(RouteRule {
            name: router.to_string(),
            rule: rule.to_string(),
            matcher,
            entrypoints: split_list("entrypoints"),
            tls,
            cert_resolver: options.get("tls.certresolver").map(|r| r.to_string()),
            middlewares: split_list("middlewares"),
            service,
            provider: provider.to_string(),
        });
    }
    Ok(RouteTable {
        routes,
        middlewares: middlewares.into_iter().collect(),
    })
}

/// Route table of every enabled service in the descriptor, reached by service name.
pub fn routes_from_topology(descriptor: &TopologyDescriptor) -> Result<RouteTable, TopologyError> {
    let mut table = RouteTable::default();
    for (name, service) in &descriptor.services {
        if !is_enabled(&service.labels, false) {
            continue;
        }
        table.merge(service_routes(name, service)?);
    }
    Ok(table)
}

fn service_routes(name: &str, service: &ServiceSpec) -> Result<RouteTable, TopologyError> {
    let ports = service.container_ports();
    let fallback_port = if ports.len() == 1 { Some(ports[0]) } else { None };
    routes_from_labels(name, name, &service.labels, fallback_port, FILE_PROVIDER)
}

fn mounts_source_tree(service: &ServiceSpec) -> bool {
    service.build.is_some()
        && service.volumes.iter().any(|volume| {
            let source = volume.split(':').next().unwrap_or_default();
            source.starts_with('.') || source.starts_with('/')
        })
}

/// `stack_gate entrypoint` anywhere in entrypoint + command, shell payloads such as
/// `sh -c "stack_gate entrypoint -- ..."` are split into words as well.
fn waits_for_dependencies(service: &ServiceSpec) -> bool {
    let words = service
        .entrypoint
        .iter()
        .chain(service.command.iter())
        .flat_map(|arg| arg.split_whitespace())
        .map(|word| word.trim_matches(|c| c == '"' || c == '\''))
        .collect::<Vec<&str>>();
    words
        .windows(2)
        .any(|pair| (pair[0] == "stack_gate" || pair[0].ends_with("/stack_gate")) && pair[1] == "entrypoint")
}

/// Everything that makes a descriptor unfit for production.
pub fn production_violations(descriptor: &TopologyDescriptor) -> Vec<TopologyError> {
    let mut violations = vec![];
    let violation = |service: &str, reason: String| TopologyError::Production {
        service: service.to_string(),
        reason,
    };
    for (name, service) in &descriptor.services {
        if mounts_source_tree(service) {
            violations.push(violation(name, "source tree is bind-mounted".to_string()));
        }
        if service.environment.get("DEBUG").map(|v| is_truthy(v)).unwrap_or(false) {
            violations.push(violation(name, "DEBUG is enabled".to_string()));
        }
        let depends_on_database = service.depends_on.iter().any(|dependency| {
            descriptor
                .services
                .get(dependency)
                .map(ServiceSpec::is_database)
                .unwrap_or(false)
        });
        if depends_on_database && !waits_for_dependencies(service) {
            violations.push(violation(
                name,
                "depends on a database but does not wait for it (use `stack_gate entrypoint`)".to_string(),
            ));
        }
        if !is_enabled(&service.labels, false) {
            continue;
        }
        match service_routes(name, service) {
            Ok(table) => {
                for route in &table.routes {
                    if !route.tls {
                        violations.push(violation(name, format!("router `{}` is not TLS only", route.name)));
                    }
                    let authenticated = route.middlewares.iter().any(|m| {
                        matches!(table.middlewares.get(m), Some(Middleware::BasicAuth { .. }))
                    });
                    if route.service == ServiceTarget::Dashboard && !authenticated {
                        violations.push(violation(
                            name,
                            format!("dashboard router `{}` has no basicauth middleware", route.name),
                        ));
                    }
                }
            }
            Err(err) => violations.push(err),
        }
    }
    violations
}

#[derive(Debug)]
pub struct TopologyReport {
    pub start_order: Vec<String>,
    pub routes: RouteTable,
    pub violations: Vec<TopologyError>,
}

pub fn check_topology(descriptor: &TopologyDescriptor) -> Result<TopologyReport, TopologyError> {
    let start_order = start_order(descriptor)?;
    let routes = routes_from_topology(descriptor)?;
    let violations = match descriptor.variant {
        Variant::Prod => production_violations(descriptor),
        Variant::Dev => vec![],
    };
    Ok(TopologyReport {
        start_order,
        routes,
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(depends_on: &[&str]) -> ServiceSpec {
        ServiceSpec {
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn descriptor(services: Vec<(&str, ServiceSpec)>, variant: Variant) -> TopologyDescriptor {
        TopologyDescriptor {
            name: "test".to_string(),
            variant,
            volumes: vec![],
            services: services.into_iter().map(|(n, s)| (n.to_string(), s)).collect(),
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn starts_dependencies_first() {
        let topology = descriptor(
            vec![
                ("web", service(&["db"])),
                ("traefik", service(&[])),
                ("db", service(&[])),
                ("worker", service(&["db", "web"])),
            ],
            Variant::Dev,
        );
        assert_eq!(start_order(&topology).unwrap(), vec!["db", "traefik", "web", "worker"]);
    }

    #[test]
    fn reports_unknown_dependencies_and_cycles() {
        let unknown = descriptor(vec![("web", service(&["db"]))], Variant::Dev);
        assert!(matches!(
            start_order(&unknown),
            Err(TopologyError::UnknownDependency { dependency, .. }) if dependency == "db"
        ));

        let cycle = descriptor(
            vec![("a", service(&["b"])), ("b", service(&["a"])), ("c", service(&[]))],
            Variant::Dev,
        );
        match start_order(&cycle) {
            Err(TopologyError::Cycle(members)) => assert_eq!(members, vec!["a", "b"]),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn builds_routes_from_labels() {
        let labels = labels(&[
            ("traefik.enable", "true"),
            ("traefik.http.routers.django.rule", "Host(`django-traefik.your-domain.com`)"),
            ("traefik.http.routers.django.tls", "true"),
            ("traefik.http.routers.django.tls.certresolver", "letsencrypt"),
        ]);
        let table = routes_from_labels("web", "web", &labels, Some(8000), FILE_PROVIDER).unwrap();
        assert_eq!(table.routes.len(), 1);
        let route = &table.routes[0];
        assert!(route.tls);
        assert_eq!(route.cert_resolver.as_deref(), Some("letsencrypt"));
        assert_eq!(
            route.service,
            ServiceTarget::Upstream {
                name: "web".to_string(),
                address: "web:8000".to_string()
            }
        );
    }

    #[test]
    fn dashboard_router_with_auth_middleware() {
        let hash = bcrypt::hash("password", 4).unwrap().replace('$', "$$");
        let labels = labels(&[
            ("traefik.http.routers.dashboard.rule", "Host(`dashboard.your-domain.com`)"),
            ("traefik.http.routers.dashboard.tls", "true"),
            ("traefik.http.routers.dashboard.service", "api@internal"),
            ("traefik.http.routers.dashboard.middlewares", "auth@docker"),
            ("traefik.http.middlewares.auth.basicauth.users", &format!("testuser:{hash}")),
        ]);
        let table = routes_from_labels("traefik", "traefik", &labels, None, FILE_PROVIDER).unwrap();
        assert_eq!(table.routes[0].service, ServiceTarget::Dashboard);
        assert_eq!(table.routes[0].middlewares, vec!["auth"]);
        assert!(table.middlewares.contains_key("auth"));
    }

    #[test]
    fn missing_port_is_an_error() {
        let labels = labels(&[("traefik.http.routers.web.rule", "Host(`a.com`)")]);
        assert!(routes_from_labels("web", "web", &labels, None, FILE_PROVIDER).is_err());
    }

    #[test]
    fn production_checks_flag_unsafe_services() {
        let web = ServiceSpec {
            build: Some(Default::default()),
            volumes: vec!["./app:/usr/src/app".to_string()],
            environment: [("DEBUG".to_string(), "1".to_string())].into_iter().collect(),
            depends_on: vec!["db".to_string()],
            expose: vec![8000],
            labels: labels(&[
                ("traefik.enable", "true"),
                ("traefik.http.routers.web.rule", "Host(`a.com`)"),
            ]),
            ..Default::default()
        };
        let db = ServiceSpec {
            image: Some("postgres:15-alpine".to_string()),
            ..Default::default()
        };
        let topology = descriptor(vec![("web", web), ("db", db)], Variant::Prod);
        let report = check_topology(&topology).unwrap();
        let reasons = report
            .violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<String>>();
        assert_eq!(reasons.len(), 4, "{reasons:?}");
        assert!(reasons.iter().any(|r| r.contains("bind-mounted")));
        assert!(reasons.iter().any(|r| r.contains("DEBUG")));
        assert!(reasons.iter().any(|r| r.contains("does not wait")));
        assert!(reasons.iter().any(|r| r.contains("not TLS only")));
    }

    #[test]
    fn shell_wrapped_entrypoint_counts_as_waiting() {
        let db = ServiceSpec {
            image: Some("postgres:15-alpine".to_string()),
            ..Default::default()
        };
        let waiting = |entrypoint: &[&str], command: &[&str]| ServiceSpec {
            entrypoint: entrypoint.iter().map(|a| a.to_string()).collect(),
            command: command.iter().map(|a| a.to_string()).collect(),
            depends_on: vec!["db".to_string()],
            ..Default::default()
        };
        let cases = [
            (waiting(&[], &["sh", "-c", "stack_gate entrypoint -- gunicorn app.main:app"]), true),
            (waiting(&["/usr/local/bin/stack_gate", "entrypoint", "--"], &["gunicorn"]), true),
            (waiting(&["/usr/local/bin/stack_gate"], &["entrypoint", "--", "gunicorn"]), true),
            (waiting(&[], &["sh", "-c", "gunicorn app.main:app"]), false),
            (waiting(&[], &["stack_gate", "topology", "entrypoint.toml"]), false),
        ];
        for (web, waits) in cases {
            let command = web.command.join(" ");
            let topology = descriptor(vec![("web", web), ("db", db.clone())], Variant::Prod);
            let flagged = production_violations(&topology)
                .iter()
                .any(|v| v.to_string().contains("does not wait"));
            assert_eq!(flagged, !waits, "{command}");
        }
    }

    #[test]
    fn path_prefix_router_is_not_shadowed_by_an_earlier_host_router() {
        use crate::controllers::route_controller::{resolve, EntryPointContext, IncomingRequest, RouteDecision};

        let labels = labels(&[
            ("traefik.http.routers.web.rule", "Host(`a.com`)"),
            ("traefik.http.routers.webapi.rule", "Host(`a.com`) && PathPrefix(`/api`)"),
        ]);
        let table = routes_from_labels("web", "web", &labels, Some(8000), FILE_PROVIDER).unwrap();
        let entrypoint = EntryPointContext {
            name: "web".to_string(),
            secure: false,
            redirect_to_https: false,
            https_port: 443,
            https_available: true,
            dashboard_only: false,
        };
        let headers = http::HeaderMap::new();
        let routed = |path: &str| {
            let request = IncomingRequest {
                host: "a.com",
                path,
                path_and_query: path,
                headers: &headers,
            };
            match resolve(&table, &entrypoint, &request) {
                RouteDecision::Forward(route) => route.name.clone(),
                other => panic!("expected a forward, got {other:?}"),
            }
        };
        assert_eq!(routed("/api/x"), "webapi");
        assert_eq!(routed("/"), "web");
    }

    #[test]
    fn dev_variant_is_not_held_to_production_rules() {
        let web = ServiceSpec {
            build: Some(Default::default()),
            volumes: vec!["./app:/usr/src/app".to_string()],
            ..Default::default()
        };
        let report = check_topology(&descriptor(vec![("web", web)], Variant::Dev)).unwrap();
        assert!(report.violations.is_empty());
    }
}
