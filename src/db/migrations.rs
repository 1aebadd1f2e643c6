use std::{collections::HashSet, fmt::Display, path::Path};

use tokio_postgres::{types::Type, Error, Row};

use crate::error::BootstrapError;

use super::{tables::ETables, users::create_users_table_sql};

pub const BASELINE_VERSION: &str = "0000_create_users";
/// Advisory lock key shared by every replica running migrations against the same database.
pub const MIGRATION_LOCK_KEY: i64 = 0x7374_6163_6b5f_6761;

#[allow(non_camel_case_types)]
pub enum SchemaMigrationColumns {
    VERSION,
    APPLIED_AT,
}

impl Display for SchemaMigrationColumns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SchemaMigrationColumns {
    pub fn as_str(&self) -> &str {
        match *self {
            Self::VERSION => "version",
            Self::APPLIED_AT => "applied_at",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub sql: String,
}

/// The baseline followed by every `*.sql` file in `dir`, ordered by file name.
/// A missing directory only yields the baseline.
pub fn load_migrations(dir: &Path) -> Result<Vec<Migration>, BootstrapError> {
    let mut migrations = vec![Migration {
        version: BASELINE_VERSION.to_string(),
        sql: create_users_table_sql(),
    }];
    if !dir.is_dir() {
        tracing::debug!("no migrations directory at {}", dir.display());
        return Ok(migrations);
    }
    let read_error = |source| BootstrapError::Migrations {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = vec![];
    for entry in std::fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("sql") {
            files.push(path);
        }
    }
    files.sort();
    for path in files {
        let version = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };
        let sql = std::fs::read_to_string(&path).map_err(|source| BootstrapError::Migrations {
            path: path.clone(),
            source,
        })?;
        migrations.push(Migration { version, sql });
    }
    Ok(migrations)
}

/// Keeps declaration order, drops what is already applied.
pub fn pending_migrations<'a>(
    available: &'a [Migration],
    applied: &HashSet<String>,
) -> Vec<&'a Migration> {
    available
        .iter()
        .filter(|migration| !applied.contains(&migration.version))
        .collect()
}

pub async fn create_schema_migrations_table_query(
    postgres_client: &tokio_postgres::Client,
) -> Result<(), Error> {
    postgres_client
        .batch_execute(
            format!(
                "CREATE TABLE IF NOT EXISTS {sm} (
                    {version} TEXT PRIMARY KEY,
                    {applied_at} TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );",
                sm = ETables::SCHEMA_MIGRATIONS,
                version = SchemaMigrationColumns::VERSION,
                applied_at = SchemaMigrationColumns::APPLIED_AT,
            )
            .as_str(),
        )
        .await
}

pub async fn applied_versions_query(
    postgres_client: &tokio_postgres::Client,
) -> Result<Vec<Row>, Error> {
    postgres_client
        .query_typed(
            format!(
                "SELECT {version} FROM {sm}",
                version = SchemaMigrationColumns::VERSION,
                sm = ETables::SCHEMA_MIGRATIONS,
            )
            .as_str(),
            &[],
        )
        .await
}

/// Session level lock, blocks until no other replica is migrating.
pub async fn acquire_migration_lock_query(postgres_client: &tokio_postgres::Client) -> Result<(), Error> {
    postgres_client
        .query_typed("SELECT pg_advisory_lock($1)", &[(&MIGRATION_LOCK_KEY, Type::INT8)])
        .await?;
    Ok(())
}

pub async fn release_migration_lock_query(postgres_client: &tokio_postgres::Client) -> Result<(), Error> {
    postgres_client
        .query_typed("SELECT pg_advisory_unlock($1)", &[(&MIGRATION_LOCK_KEY, Type::INT8)])
        .await?;
    Ok(())
}

/// Runs the migration body and records its version in one transaction.
pub async fn apply_migration_query(
    postgres_client: &tokio_postgres::Client,
    migration: &Migration,
) -> Result<(), Error> {
    postgres_client.batch_execute("BEGIN").await?;
    let apply_result = async {
        postgres_client.batch_execute(&migration.sql).await?;
        postgres_client
            .query_typed(
                format!(
                    "INSERT INTO {sm} ({version}) VALUES ($1)",
                    sm = ETables::SCHEMA_MIGRATIONS,
                    version = SchemaMigrationColumns::VERSION,
                )
                .as_str(),
                &[(&migration.version, Type::TEXT)],
            )
            .await?;
        postgres_client.batch_execute("COMMIT").await
    }
    .await;
    if let Err(err) = apply_result {
        if let Err(rollback_err) = postgres_client.batch_execute("ROLLBACK").await {
            tracing::error!("rollback of {} failed: {}", migration.version, rollback_err);
        }
        return Err(err);
    }
    Ok(())
}
