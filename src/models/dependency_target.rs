use std::fmt::Display;

use reqwest::Url;

use crate::error::ConfigError;

pub const DEFAULT_POSTGRES_PORT: u16 = 5432;

/// A network service that must accept connections before startup proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTarget {
    pub host: String,
    pub port: u16,
}

impl DependencyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        DependencyTarget {
            host: host.into(),
            port,
        }
    }

    /// Derives the target from a connection url such as
    /// `postgresql://user:pass@db:5432/name`.
    pub fn from_database_url(database_url: &str) -> Result<DependencyTarget, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidVar {
            key: "DATABASE_URL".to_string(),
            reason,
        };
        let url = Url::parse(database_url).map_err(|err| invalid(err.to_string()))?;
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']'),
            _ => return Err(invalid("url has no host".to_string())),
        };
        Ok(DependencyTarget::new(
            host,
            url.port().unwrap_or(DEFAULT_POSTGRES_PORT),
        ))
    }

    /// Address suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for DependencyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}
