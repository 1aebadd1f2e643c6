use std::collections::{BTreeMap, BTreeSet};

use bollard::{container::ListContainersOptions, Docker, API_DEFAULT_VERSION};

use crate::{
    controllers::topology_controller::{is_enabled, routes_from_labels},
    error::ProxyError,
    models::{proxy_config_model::DockerProviderConfig, route_rule::RouteTable},
};

pub const DOCKER_PROVIDER: &str = "docker";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// What the provider needs to know about one running container.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredContainer {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// network name -> container ip
    pub addresses: BTreeMap<String, String>,
    pub private_ports: BTreeSet<u16>,
}

pub fn connect(config: &DockerProviderConfig) -> Result<Docker, ProxyError> {
    let docker = match config.endpoint.as_deref() {
        Some(endpoint) if endpoint.starts_with("unix://") => Docker::connect_with_socket(
            endpoint.trim_start_matches("unix://"),
            CONNECT_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )?,
        Some(endpoint) => Docker::connect_with_http(endpoint, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
        None => Docker::connect_with_local_defaults()?,
    };
    Ok(docker)
}

pub async fn discover_containers(docker: &Docker) -> Result<Vec<DiscoveredContainer>, ProxyError> {
    let options = ListContainersOptions::<String> {
        all: false,
        ..Default::default()
    };
    let summaries = docker.list_containers(Some(options)).await?;
    let containers = summaries
        .into_iter()
        .map(|summary| {
            let labels = summary
                .labels
                .unwrap_or_default()
                .into_iter()
                .collect::<BTreeMap<String, String>>();
            let name = labels
                .get(COMPOSE_SERVICE_LABEL)
                .cloned()
                .or_else(|| {
                    summary
                        .names
                        .as_ref()
                        .and_then(|names| names.first())
                        .map(|name| name.trim_start_matches('/').to_string())
                })
                .or(summary.id.clone())
                .unwrap_or_default();
            let addresses = summary
                .network_settings
                .and_then(|settings| settings.networks)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(network, endpoint)| {
                    endpoint
                        .ip_address
                        .filter(|ip| !ip.is_empty())
                        .map(|ip| (network, ip))
                })
                .collect();
            let private_ports = summary
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|port| port.private_port)
                .collect();
            DiscoveredContainer {
                name,
                labels,
                addresses,
                private_ports,
            }
        })
        .collect();
    Ok(containers)
}

/// Address of the container on `network`, compose prefixes the project name so a suffix match counts.
fn container_ip<'a>(container: &'a DiscoveredContainer, network: Option<&str>) -> Option<&'a String> {
    match network {
        Some(network) => container
            .addresses
            .iter()
            .find(|(name, _)| *name == network || name.ends_with(&format!("_{network}")))
            .map(|(_, ip)| ip),
        None => container.addresses.values().next(),
    }
}

/// A broken container is logged and skipped so it cannot take the other routes down.
pub fn routes_from_containers(
    containers: &[DiscoveredContainer],
    config: &DockerProviderConfig,
) -> RouteTable {
    let mut table = RouteTable::default();
    for container in containers {
        if !is_enabled(&container.labels, config.exposed_by_default) {
            continue;
        }
        let ip = match container_ip(container, config.network.as_deref()) {
            Some(ip) => ip,
            None => {
                tracing::warn!("docker provider: no reachable address for {}", container.name);
                continue;
            }
        };
        let fallback_port = if container.private_ports.len() == 1 {
            container.private_ports.iter().next().copied()
        } else {
            None
        };
        match routes_from_labels(&container.name, ip, &container.labels, fallback_port, DOCKER_PROVIDER) {
            Ok(routes) => table.merge(routes),
            Err(err) => tracing::warn!("docker provider: skipping {}: {}", container.name, err),
        }
    }
    table
}
