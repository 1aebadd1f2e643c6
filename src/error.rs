use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::models::dependency_target::DependencyTarget;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidVar { key: String, reason: String },

    #[error("cannot derive a readiness target: set DATABASE_URL or SQL_HOST")]
    MissingTarget,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown bootstrap step `{0}`")]
    UnknownStep(String),

    #[error("no foreground command given")]
    MissingCommand,
}

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("{target} not reachable after {attempts} attempts ({elapsed:?})")]
    Timeout {
        target: DependencyTarget,
        attempts: u32,
        elapsed: Duration,
    },
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("bootstrap step {step} ({action}) failed: {source}")]
    ActionFailed {
        step: usize,
        action: String,
        #[source]
        source: Box<BootstrapError>,
    },

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("command `{command}` exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read migrations from {path}: {source}")]
    Migrations {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("service `{service}` depends on unknown service `{dependency}`")]
    UnknownDependency { service: String, dependency: String },

    #[error("dependency cycle between services: {0:?}")]
    Cycle(Vec<String>),

    #[error("invalid label `{label}` on `{service}`: {reason}")]
    InvalidLabel {
        service: String,
        label: String,
        reason: String,
    },

    #[error("invalid rule `{rule}`: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("production check failed for `{service}`: {reason}")]
    Production { service: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid certificate material: {0}")]
    Certificate(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid entrypoint address `{0}`")]
    Address(String),
}

#[derive(Error, Debug)]
pub enum EntrypointError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("failed to exec `{command}`: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("foreground process exited with {0}")]
    Exited(i32),
}

impl EntrypointError {
    /// Process exit code the binary reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Bootstrap(_) => 1,
            Self::Readiness(_) => 2,
            Self::Exec { .. } => 127,
            Self::Exited(code) => *code,
        }
    }
}
