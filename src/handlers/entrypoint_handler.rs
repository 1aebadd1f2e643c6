use crate::{
	controllers::{
		bootstrap_controller::{bootstrap_then_launch, build_sequencer, BootstrapSequencer, Launcher},
		readiness_controller::{wait_until_ready, TcpProbe},
	},
	error::{BootstrapError, ConfigError, EntrypointError},
	models::bootstrap_models::ForegroundCommand,
	utils::{env_utils::EntrypointConfig, postgres_utils},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct EntrypointOptions {
	pub skip_wait: bool,
	pub skip_bootstrap: bool,
}

/// wait for the database, run the bootstrap steps, then hand over to `command`.
/// With the exec launcher this only returns on failure.
pub async fn run_entrypoint(
	config: &EntrypointConfig,
	options: EntrypointOptions,
	command: &ForegroundCommand,
	launcher: &dyn Launcher,
) -> Result<i32, EntrypointError> {
	if !config.debug && config.allowed_hosts.is_empty() {
		tracing::warn!("ALLOWED_HOSTS is empty, the application may refuse every request");
	}

	if options.skip_wait {
		tracing::info!("readiness wait skipped");
	} else if let Some(target) = config.readiness_target()? {
		tracing::info!("Waiting for {}...", target);
		let probe = TcpProbe {
			connect_timeout: config.readiness.connect_timeout,
		};
		let report = wait_until_ready(target, &probe, &config.readiness).await?;
		tracing::info!("{} started ({} probe(s), {:?})", target, report.attempts, report.elapsed);
	}

	let sequencer = if options.skip_bootstrap {
		BootstrapSequencer::new()
	} else {
		let postgres_client = if config.needs_database() {
			let connection_string = config
				.connection_string
				.as_deref()
				.ok_or(ConfigError::MissingTarget)?;
			Some(
				postgres_utils::connect(connection_string)
					.await
					.map_err(BootstrapError::from)?,
			)
		} else {
			None
		};
		build_sequencer(
			&config.steps,
			postgres_client,
			config.migrations_dir.clone(),
			&config.seed_email,
			config.app_home.clone(),
		)?
	};

	bootstrap_then_launch(&sequencer, launcher, command).await
}
