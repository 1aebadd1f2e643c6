use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    controllers::readiness_controller::ReadinessPolicy,
    error::ConfigError,
    models::{
        bootstrap_models::{parse_steps, BootstrapStep, DEFAULT_BOOTSTRAP_STEPS},
        dependency_target::{DependencyTarget, DEFAULT_POSTGRES_PORT},
    },
};

pub const DEFAULT_SEED_EMAIL: &str = "test@test.com";
pub const DEFAULT_APP_HOME: &str = "/home/app/web";

/// Everything the container entrypoint reads from its environment.
#[derive(Debug, Clone)]
pub struct EntrypointConfig {
    /// `DATABASE`, the gate only runs for `postgres` when set.
    pub database_kind: Option<String>,
    /// Connection string for tokio_postgres, a url or `key=value` pairs.
    pub connection_string: Option<String>,
    pub target: Option<DependencyTarget>,
    pub debug: bool,
    pub allowed_hosts: Vec<String>,
    pub app_home: PathBuf,
    pub migrations_dir: PathBuf,
    pub steps: Vec<BootstrapStep>,
    pub seed_email: String,
    pub readiness: ReadinessPolicy,
}

impl EntrypointConfig {
    pub fn load() -> Result<EntrypointConfig, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<EntrypointConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let database_url = var("DATABASE_URL");
        let target = match (var("SQL_HOST"), &database_url) {
            (Some(host), _) => {
                let port = parse_or(&var, "SQL_PORT", DEFAULT_POSTGRES_PORT)?;
                Some(DependencyTarget::new(host, port))
            }
            (None, Some(url)) => Some(DependencyTarget::from_database_url(url)?),
            (None, None) => None,
        };
        let connection_string = match (&database_url, &target) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(target)) => Some(format!(
                "host={} port={} user={} password={} dbname={}",
                target.host,
                target.port,
                var("SQL_USER").unwrap_or_else(|| "postgres".to_string()),
                var("SQL_PASSWORD").unwrap_or_default(),
                var("SQL_DATABASE").unwrap_or_else(|| "postgres".to_string()),
            )),
            (None, None) => None,
        };

        let debug = var("DEBUG").map(|v| is_truthy(&v)).unwrap_or(false);
        let allowed_hosts: Vec<String> = var("ALLOWED_HOSTS")
            .or_else(|| var("DJANGO_ALLOWED_HOSTS"))
            .map(|hosts| hosts.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let app_home = PathBuf::from(var("APP_HOME").unwrap_or_else(|| DEFAULT_APP_HOME.to_string()));
        let migrations_dir = var("MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| app_home.join("migrations"));
        let steps = parse_steps(&var("BOOTSTRAP_STEPS").unwrap_or_else(|| DEFAULT_BOOTSTRAP_STEPS.to_string()))?;
        let seed_email = var("SEED_USER_EMAIL").unwrap_or_else(|| DEFAULT_SEED_EMAIL.to_string());

        let defaults = ReadinessPolicy::default();
        let interval = Duration::from_millis(parse_or(
            &var,
            "READINESS_INTERVAL_MS",
            defaults.interval.as_millis() as u64,
        )?);
        let readiness = ReadinessPolicy {
            interval,
            multiplier: parse_or(&var, "READINESS_MULTIPLIER", defaults.multiplier)?,
            max_interval: Duration::from_millis(parse_or(
                &var,
                "READINESS_MAX_INTERVAL_MS",
                defaults.max_interval.as_millis() as u64,
            )?),
            timeout: match var("READINESS_TIMEOUT_SECS") {
                Some(raw) => {
                    let secs: f64 = parse_value("READINESS_TIMEOUT_SECS", &raw)?;
                    let timeout = Duration::try_from_secs_f64(secs).map_err(|err| ConfigError::InvalidVar {
                        key: "READINESS_TIMEOUT_SECS".to_string(),
                        reason: err.to_string(),
                    })?;
                    Some(timeout)
                }
                None => None,
            },
            connect_timeout: interval.max(Duration::from_millis(100)),
        };

        if !debug && allowed_hosts.iter().any(|h| h == "*") {
            tracing::warn!("ALLOWED_HOSTS accepts every host while DEBUG is off");
        }

        Ok(EntrypointConfig {
            database_kind: var("DATABASE"),
            connection_string,
            target,
            debug,
            allowed_hosts,
            app_home,
            migrations_dir,
            steps,
            seed_email,
            readiness,
        })
    }

    /// The original entrypoint only waits when `DATABASE=postgres`; unset means wait when possible.
    pub fn readiness_target(&self) -> Result<Option<&DependencyTarget>, ConfigError> {
        match self.database_kind.as_deref() {
            Some("postgres") => self.target.as_ref().map(Some).ok_or(ConfigError::MissingTarget),
            Some(_) => Ok(None),
            None => Ok(self.target.as_ref()),
        }
    }

    pub fn needs_database(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step, BootstrapStep::Migrate | BootstrapStep::Seed))
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|err| ConfigError::InvalidVar {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<EntrypointConfig, ConfigError> {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<String, String>>();
        EntrypointConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn reads_django_style_environment() {
        let config = config(&[
            ("DEBUG", "1"),
            ("DJANGO_ALLOWED_HOSTS", "localhost 127.0.0.1 [::1]"),
            ("SQL_HOST", "db"),
            ("SQL_PORT", "5432"),
            ("SQL_USER", "hello_django"),
            ("SQL_PASSWORD", "hello_django"),
            ("SQL_DATABASE", "hello_django_dev"),
            ("DATABASE", "postgres"),
        ])
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.allowed_hosts, vec!["localhost", "127.0.0.1", "[::1]"]);
        assert_eq!(config.readiness_target().unwrap(), Some(&DependencyTarget::new("db", 5432)));
        assert_eq!(
            config.connection_string.as_deref(),
            Some("host=db port=5432 user=hello_django password=hello_django dbname=hello_django_dev")
        );
        assert_eq!(config.steps, vec![BootstrapStep::Migrate, BootstrapStep::Seed]);
        assert_eq!(config.seed_email, DEFAULT_SEED_EMAIL);
    }

    #[test]
    fn reads_fastapi_style_environment() {
        let config = config(&[(
            "DATABASE_URL",
            "postgresql://fastapi_traefik:fastapi_traefik@db:5432/fastapi_traefik",
        )])
        .unwrap();
        assert!(!config.debug);
        assert_eq!(config.readiness_target().unwrap(), Some(&DependencyTarget::new("db", 5432)));
        assert_eq!(config.readiness.interval, Duration::from_millis(100));
        assert!(config.readiness.timeout.is_none());
        assert_eq!(config.migrations_dir, PathBuf::from(DEFAULT_APP_HOME).join("migrations"));
    }

    #[test]
    fn skips_the_gate_for_other_databases() {
        let config = config(&[("DATABASE", "sqlite"), ("SQL_HOST", "db")]).unwrap();
        assert_eq!(config.readiness_target().unwrap(), None);
    }

    #[test]
    fn postgres_without_target_is_an_error() {
        let config = config(&[("DATABASE", "postgres")]).unwrap();
        assert!(matches!(config.readiness_target(), Err(ConfigError::MissingTarget)));
    }

    #[test]
    fn readiness_settings_are_tunable() {
        let config = config(&[
            ("SQL_HOST", "db"),
            ("READINESS_INTERVAL_MS", "250"),
            ("READINESS_MULTIPLIER", "2"),
            ("READINESS_MAX_INTERVAL_MS", "2000"),
            ("READINESS_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.readiness.interval, Duration::from_millis(250));
        assert_eq!(config.readiness.multiplier, 2.0);
        assert_eq!(config.readiness.max_interval, Duration::from_secs(2));
        assert_eq!(config.readiness.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn unrepresentable_timeouts_are_config_errors() {
        for raw in ["-1", "NaN", "inf"] {
            let result = config(&[("SQL_HOST", "db"), ("READINESS_TIMEOUT_SECS", raw)]);
            assert!(
                matches!(&result, Err(ConfigError::InvalidVar { key, .. }) if key == "READINESS_TIMEOUT_SECS"),
                "{raw}: {result:?}"
            );
        }
        let config = config(&[("SQL_HOST", "db"), ("READINESS_TIMEOUT_SECS", "0.5")]).unwrap();
        assert_eq!(config.readiness.timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let result = config(&[("SQL_HOST", "db"), ("SQL_PORT", "abc")]);
        assert!(matches!(result, Err(ConfigError::InvalidVar { key, .. }) if key == "SQL_PORT"));
    }
}
