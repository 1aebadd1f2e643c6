use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Dev,
    Prod,
}

/// Declarative description of the services making up one deployment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyDescriptor {
    pub name: String,
    pub variant: Variant,
    #[serde(default)]
    pub volumes: Vec<String>,
    //BTreeMap keeps iteration order stable for start ordering
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceSpec {
    pub image: Option<String>,
    pub build: Option<BuildSpec>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    /// `host:container` bindings.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Ports reachable only on the internal network.
    #[serde(default)]
    pub expose: Vec<u16>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub env_file: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub restart: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BuildSpec {
    pub context: String,
    pub dockerfile: Option<String>,
}

impl ServiceSpec {
    /// Container-side port of every `ports` binding followed by `expose`.
    pub fn container_ports(&self) -> Vec<u16> {
        let mut ports = self
            .ports
            .iter()
            .filter_map(|binding| {
                binding
                    .rsplit(':')
                    .next()
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse::<u16>().ok())
            })
            .collect::<Vec<u16>>();
        for port in &self.expose {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }

    pub fn is_database(&self) -> bool {
        self.image
            .as_deref()
            .map(|image| image.starts_with("postgres"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_ports_combine_bindings_and_expose() {
        let service = ServiceSpec {
            ports: vec!["8008:8000".to_string(), "127.0.0.1:5433:5432/tcp".to_string()],
            expose: vec![8000, 9000],
            ..Default::default()
        };
        assert_eq!(service.container_ports(), vec![8000, 5432, 9000]);
    }
}
