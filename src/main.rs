extern crate dotenv;

use std::{path::PathBuf, process::exit};

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use stack_gate::{
	controllers::{
		auth_controller::htpasswd_line,
		bootstrap_controller::ExecLauncher,
		topology_controller::{check_topology, load_topology},
	},
	error::EntrypointError,
	handlers::{
		entrypoint_handler::{run_entrypoint, EntrypointOptions},
		server_handler::run_proxy,
	},
	models::{bootstrap_models::ForegroundCommand, route_rule::ServiceTarget},
	utils::{env_utils::EntrypointConfig, tracing_utils},
};

#[derive(Parser)]
#[command(name = "stack_gate", version, about = "Container entrypoint and label driven reverse proxy")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Wait for the database, run bootstrap steps, then exec the given command
	Entrypoint {
		#[arg(long)]
		skip_wait: bool,
		#[arg(long)]
		skip_bootstrap: bool,
		#[arg(last = true, required = true)]
		command: Vec<String>,
	},
	/// Run the reverse proxy from a static configuration file
	Proxy {
		#[arg(long, short, default_value = "traefik.toml")]
		config: PathBuf,
	},
	/// Validate a topology descriptor and print its start order and routes
	Topology { file: PathBuf },
	/// Print a `user:hash` line for a basicauth middleware
	Htpasswd {
		user: String,
		password: String,
		#[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
		cost: u32,
		/// Double every `$` for use inside a compose file
		#[arg(long)]
		compose: bool,
	},
}

async fn entrypoint(options: EntrypointOptions, argv: Vec<String>) -> Result<i32, EntrypointError> {
	let config = EntrypointConfig::load()?;
	let command = ForegroundCommand::from_argv(argv)?;
	run_entrypoint(&config, options, &command, &ExecLauncher).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	dotenv().ok();
	let cli = Cli::parse();

	match cli.command {
		Command::Entrypoint { skip_wait, skip_bootstrap, command } => {
			let debug = std::env::var("DEBUG").map(|v| stack_gate::utils::env_utils::is_truthy(&v)).unwrap_or(false);
			tracing_utils::init(if debug { "debug" } else { "info" });
			match entrypoint(EntrypointOptions { skip_wait, skip_bootstrap }, command).await {
				Ok(code) => exit(code),
				Err(err) => {
					tracing::error!("{}", err);
					exit(err.exit_code());
				}
			}
		},
		Command::Proxy { config } => {
			if let Err(err) = run_proxy(&config).await {
				tracing_utils::init("info");
				tracing::error!("{}", err);
				exit(1);
			}
		},
		Command::Topology { file } => {
			tracing_utils::init("warn");
			let descriptor = load_topology(&file)?;
			let report = check_topology(&descriptor)?;
			println!("{} ({:?})", descriptor.name, descriptor.variant);
			println!("start order: {}", report.start_order.join(" -> "));
			for route in &report.routes.routes {
				let target = match &route.service {
					ServiceTarget::Upstream { address, .. } => address.clone(),
					ServiceTarget::Dashboard => "api@internal".to_string(),
				};
				println!("route {}: {} -> {}{}", route.name, route.rule, target, if route.tls { " [tls]" } else { "" });
			}
			if !report.violations.is_empty() {
				for violation in &report.violations {
					eprintln!("error: {}", violation);
				}
				exit(1);
			}
		},
		Command::Htpasswd { user, password, cost, compose } => {
			println!("{}", htpasswd_line(&user, &password, cost, compose)?);
		},
	}
	return Ok(())
}
