use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Static proxy configuration, keys follow the Traefik TOML layout.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfig {
    #[serde(default)]
    pub log: LogConfig,
    /// Presence of the `[accessLog]` table turns access logging on.
    pub access_log: Option<AccessLogConfig>,
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub entry_points: BTreeMap<String, EntryPointConfig>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub certificates_resolvers: BTreeMap<String, CertificateResolverConfig>,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccessLogConfig {}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub dashboard: bool,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EntryPointConfig {
    pub address: String,
    pub http: Option<EntryPointHttpConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPointHttpConfig {
    pub redirections: Option<RedirectionsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectionsConfig {
    pub entry_point: Option<EntryPointRedirection>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntryPointRedirection {
    pub to: String,
    #[serde(default = "default_redirect_scheme")]
    pub scheme: String,
}

fn default_redirect_scheme() -> String {
    "https".to_string()
}

impl EntryPointConfig {
    pub fn redirection(&self) -> Option<&EntryPointRedirection> {
        self.http
            .as_ref()
            .and_then(|http| http.redirections.as_ref())
            .and_then(|redirections| redirections.entry_point.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvidersConfig {
    pub docker: Option<DockerProviderConfig>,
    pub file: Option<FileProviderConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerProviderConfig {
    #[serde(default = "default_true")]
    pub exposed_by_default: bool,
    pub endpoint: Option<String>,
    pub network: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileProviderConfig {
    pub filename: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateResolverConfig {
    pub acme: AcmeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeConfig {
    pub email: String,
    pub storage: PathBuf,
    pub http_challenge: Option<HttpChallengeConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpChallengeConfig {
    pub entry_point: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub certificates: Vec<StaticCertificate>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticCertificate {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Server names this pair answers for; without any it becomes the default certificate.
    #[serde(default)]
    pub domains: Vec<String>,
}
