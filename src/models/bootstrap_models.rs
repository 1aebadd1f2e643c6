use std::{fmt::Display, str::FromStr};

use crate::error::ConfigError;

pub const DEFAULT_BOOTSTRAP_STEPS: &str = "migrate;seed";

/// One configured setup step of the entrypoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapStep {
    Migrate,
    Seed,
    Command(String),
}

impl FromStr for BootstrapStep {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "migrate" => Ok(BootstrapStep::Migrate),
            "seed" => Ok(BootstrapStep::Seed),
            other => match other.strip_prefix("cmd:") {
                Some(command) if !command.trim().is_empty() => {
                    Ok(BootstrapStep::Command(command.trim().to_string()))
                }
                _ => Err(ConfigError::UnknownStep(other.to_string())),
            },
        }
    }
}

impl Display for BootstrapStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Migrate => write!(f, "migrate"),
            Self::Seed => write!(f, "seed"),
            Self::Command(command) => write!(f, "cmd:{command}"),
        }
    }
}

/// Parses a `;` separated step list, blank entries are ignored.
pub fn parse_steps(raw: &str) -> Result<Vec<BootstrapStep>, ConfigError> {
    raw.split(';')
        .filter(|step| !step.trim().is_empty())
        .map(BootstrapStep::from_str)
        .collect()
}

/// The long-running process the entrypoint hands over to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ForegroundCommand {
    pub fn from_argv(argv: Vec<String>) -> Result<ForegroundCommand, ConfigError> {
        let mut argv = argv.into_iter();
        match argv.next() {
            Some(program) => Ok(ForegroundCommand {
                program,
                args: argv.collect(),
            }),
            None => Err(ConfigError::MissingCommand),
        }
    }
}

impl Display for ForegroundCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
