use std::{collections::HashSet, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_postgres::Client;

use crate::{
    db::{
        migrations::{
            acquire_migration_lock_query, apply_migration_query, applied_versions_query,
            create_schema_migrations_table_query, load_migrations, pending_migrations,
            release_migration_lock_query, Migration, SchemaMigrationColumns,
        },
        users::{PostgresUserRepository, UserRepository},
    },
    error::{BootstrapError, EntrypointError},
    models::bootstrap_models::{BootstrapStep, ForegroundCommand},
};

/// A one-shot setup operation. Running it again after success must change nothing.
#[async_trait]
pub trait BootstrapAction: Send + Sync {
    fn name(&self) -> String;
    async fn apply(&self) -> Result<(), BootstrapError>;
}

pub struct MigrateAction {
    pub postgres_client: Arc<Client>,
    pub migrations_dir: PathBuf,
}

#[async_trait]
impl BootstrapAction for MigrateAction {
    fn name(&self) -> String {
        "migrate".to_string()
    }

    /// Replicas starting together take turns; later ones find nothing pending.
    async fn apply(&self) -> Result<(), BootstrapError> {
        let migrations = load_migrations(&self.migrations_dir)?;
        acquire_migration_lock_query(&self.postgres_client).await?;
        let result = self.apply_locked(&migrations).await;
        if let Err(err) = release_migration_lock_query(&self.postgres_client).await {
            tracing::warn!("releasing the migration lock failed: {}", err);
        }
        result
    }
}

impl MigrateAction {
    async fn apply_locked(&self, migrations: &[Migration]) -> Result<(), BootstrapError> {
        create_schema_migrations_table_query(&self.postgres_client).await?;
        let applied = applied_versions_query(&self.postgres_client)
            .await?
            .iter()
            .map(|row| row.get::<&str, String>(SchemaMigrationColumns::VERSION.as_str()))
            .collect::<HashSet<String>>();
        let pending = pending_migrations(migrations, &applied);
        if pending.is_empty() {
            tracing::info!("No migrations to apply");
        }
        for migration in pending {
            tracing::info!("Applying migration {}", migration.version);
            apply_migration_query(&self.postgres_client, migration).await?;
        }
        Ok(())
    }
}

/// get-or-create on the unique email, so restarts and parallel replicas never duplicate it.
pub struct SeedUserAction<R: UserRepository> {
    pub repository: R,
    pub email: String,
}

#[async_trait]
impl<R: UserRepository> BootstrapAction for SeedUserAction<R> {
    fn name(&self) -> String {
        "seed".to_string()
    }

    async fn apply(&self) -> Result<(), BootstrapError> {
        let (user, created) = self.repository.get_or_create(&self.email).await?;
        if created {
            tracing::info!("User added: {} (id {})", user.email, user.id);
        } else {
            tracing::info!("User {} already present", user.email);
        }
        Ok(())
    }
}

/// An external management command run through `sh -c` inside the app directory.
pub struct CommandAction {
    pub command: String,
    pub working_dir: PathBuf,
}

#[async_trait]
impl BootstrapAction for CommandAction {
    fn name(&self) -> String {
        format!("cmd:{}", self.command)
    }

    async fn apply(&self) -> Result<(), BootstrapError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.command);
        if self.working_dir.is_dir() {
            command.current_dir(&self.working_dir);
        }
        let status = command.status().await.map_err(|source| BootstrapError::Spawn {
            command: self.command.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(BootstrapError::CommandFailed {
                command: self.command.clone(),
                status: status.to_string(),
            })
        }
    }
}

/// Ordered setup actions, each must finish before the next starts.
#[derive(Default)]
pub struct BootstrapSequencer {
    actions: Vec<Box<dyn BootstrapAction>>,
}

impl BootstrapSequencer {
    pub fn new() -> Self {
        BootstrapSequencer { actions: vec![] }
    }

    pub fn with_action(mut self, action: Box<dyn BootstrapAction>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Stops at the first failure, nothing after it runs and nothing is rolled back.
    pub async fn run(&self) -> Result<usize, BootstrapError> {
        for (index, action) in self.actions.iter().enumerate() {
            let step = index + 1;
            tracing::info!("bootstrap step {}/{}: {}", step, self.actions.len(), action.name());
            if let Err(err) = action.apply().await {
                tracing::error!("bootstrap step {} ({}) failed: {}", step, action.name(), err);
                return Err(BootstrapError::ActionFailed {
                    step,
                    action: action.name(),
                    source: Box::new(err),
                });
            }
        }
        Ok(self.actions.len())
    }
}

/// Builds the sequencer for the configured steps. A client is only required when a step uses it.
pub fn build_sequencer(
    steps: &[BootstrapStep],
    postgres_client: Option<Arc<Client>>,
    migrations_dir: PathBuf,
    seed_email: &str,
    app_home: PathBuf,
) -> Result<BootstrapSequencer, BootstrapError> {
    let mut sequencer = BootstrapSequencer::new();
    for step in steps {
        let action: Box<dyn BootstrapAction> = match step {
            BootstrapStep::Migrate => Box::new(MigrateAction {
                postgres_client: require_client(&postgres_client, step)?,
                migrations_dir: migrations_dir.clone(),
            }),
            BootstrapStep::Seed => Box::new(SeedUserAction {
                repository: PostgresUserRepository {
                    postgres_client: require_client(&postgres_client, step)?,
                },
                email: seed_email.to_string(),
            }),
            BootstrapStep::Command(command) => Box::new(CommandAction {
                command: command.clone(),
                working_dir: app_home.clone(),
            }),
        };
        sequencer = sequencer.with_action(action);
    }
    Ok(sequencer)
}

fn require_client(
    postgres_client: &Option<Arc<Client>>,
    step: &BootstrapStep,
) -> Result<Arc<Client>, BootstrapError> {
    postgres_client
        .clone()
        .ok_or_else(|| BootstrapError::Other(format!("step `{step}` needs a database connection")))
}

/// Hands control to the foreground process.
pub trait Launcher {
    /// Only returns if the process could not take over, or when it ran in place and exited.
    fn launch(&self, command: &ForegroundCommand) -> Result<i32, EntrypointError>;
}

/// Replaces the current process image on unix, so the server receives signals directly.
pub struct ExecLauncher;

impl Launcher for ExecLauncher {
    #[cfg(unix)]
    fn launch(&self, command: &ForegroundCommand) -> Result<i32, EntrypointError> {
        use std::os::unix::process::CommandExt;

        tracing::info!("exec {}", command);
        let source = std::process::Command::new(&command.program)
            .args(&command.args)
            .exec();
        Err(EntrypointError::Exec {
            command: command.to_string(),
            source,
        })
    }

    #[cfg(not(unix))]
    fn launch(&self, command: &ForegroundCommand) -> Result<i32, EntrypointError> {
        tracing::info!("spawning {}", command);
        let status = std::process::Command::new(&command.program)
            .args(&command.args)
            .status()
            .map_err(|source| EntrypointError::Exec {
                command: command.to_string(),
                source,
            })?;
        Ok(status.code().unwrap_or(1))
    }
}

pub async fn bootstrap_then_launch(
    sequencer: &BootstrapSequencer,
    launcher: &dyn Launcher,
    command: &ForegroundCommand,
) -> Result<i32, EntrypointError> {
    let completed = sequencer.run().await?;
    tracing::info!("{} bootstrap step(s) completed", completed);
    launcher.launch(command)
}
