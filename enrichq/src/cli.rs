use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ConfigOverrides, CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(name = "enrichq")]
#[command(about = "Resumable batch enrichment of identifiers against a credentialed lookup API")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Create default configuration file at ./config/enrichq.toml
    #[arg(long, global = true)]
    pub init: bool,

    /// Configuration file
    #[arg(short, long, global = true, value_name = "FILE", default_value = CONFIG_PATH)]
    pub config: PathBuf,

    /// Identifier list to import (one per line, or CSV with the identifier last)
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Keep the existing queue and only add unseen identifiers from --input
    #[arg(long, conflicts_with = "fresh")]
    pub resume: bool,

    /// Drop the existing queue and reload it from --input (default when --input is given)
    #[arg(long, conflicts_with = "resume")]
    pub fresh: bool,

    /// Number of concurrent dispatch workers (overrides config)
    #[arg(short = 'j', long, value_name = "N")]
    pub workers: Option<usize>,

    /// Attempts per identifier before it is marked failed (overrides config)
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// Maximum retry rounds after the main loop (overrides config)
    #[arg(long, value_name = "N")]
    pub max_rounds: Option<u32>,

    /// Valid credentials wanted before each dispatch round (overrides config)
    #[arg(long, value_name = "N")]
    pub min_credentials: Option<usize>,

    /// Verbose logging (use -v for details, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export execution logs to a file (specify file path)
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Import identifiers (optional) and process the queue (default)
    Run,

    /// Print queue statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write all pending identifiers to a hand-off file
    Export {
        /// Destination file
        output: PathBuf,
    },

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// How the queue is prepared before a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Drop prior contents and load the input file
    Fresh,
    /// Keep prior contents; only unseen identifiers are added
    Resume,
}

/// Flattened view of the command line used by the application
#[derive(Debug, Clone)]
pub struct Args {
    pub command: Commands,
    pub init: bool,
    pub config: PathBuf,
    pub input: Option<PathBuf>,
    pub resume: bool,
    pub fresh: bool,
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub max_rounds: Option<u32>,
    pub min_credentials: Option<usize>,
    pub verbose: u8,
    pub log_file: Option<String>,
}

impl From<&Cli> for Args {
    fn from(cli: &Cli) -> Self {
        Args {
            command: cli.command.clone().unwrap_or(Commands::Run),
            init: cli.init,
            config: cli.config.clone(),
            input: cli.input.clone(),
            resume: cli.resume,
            fresh: cli.fresh,
            workers: cli.workers,
            max_attempts: cli.max_attempts,
            max_rounds: cli.max_rounds,
            min_credentials: cli.min_credentials,
            verbose: cli.verbose,
            log_file: cli.log_file.clone(),
        }
    }
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.init || matches!(self.command, Commands::Init { .. }) {
            return Ok(());
        }

        if self.fresh && self.input.is_none() {
            return Err("--fresh requires --input (there is nothing to reload)".to_string());
        }

        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err("Workers must be greater than 0".to_string());
            }
            if workers > 500 {
                return Err("Workers cannot exceed 500 to avoid overwhelming the lookup API".to_string());
            }
        }

        if self.max_attempts == Some(0) {
            return Err("Max attempts must be greater than 0".to_string());
        }

        if self.min_credentials == Some(0) {
            return Err("Min credentials must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Fresh when an input file is given unless --resume; otherwise resume
    pub fn resume_mode(&self) -> ResumeMode {
        if self.resume {
            ResumeMode::Resume
        } else if self.fresh || self.input.is_some() {
            ResumeMode::Fresh
        } else {
            ResumeMode::Resume
        }
    }

    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            workers: self.workers,
            max_attempts: self.max_attempts,
            max_rounds: self.max_rounds,
            min_credentials: self.min_credentials,
        }
    }
}
