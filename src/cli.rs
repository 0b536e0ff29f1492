//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged with
//! the configuration from the `hostwatch.toml` file and environment variables.

use clap::{Parser, Subcommand, ValueEnum};
use figment::{
    providers::Serialized,
    value::{Dict, Map},
    Error, Figment, Metadata, Profile, Provider,
};
use std::net::SocketAddr;
use std::path::PathBuf;

/// A host telemetry agent: samples system metrics, persists them and alerts on thresholds.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). `RUST_LOG` takes precedence.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Do not write to the time-series backend.
    #[arg(long, global = true)]
    pub no_backend: bool,

    /// Address for the HTTP/WebSocket consumer surface.
    #[arg(long, value_name = "ADDR", global = true)]
    pub web_listen: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the agent (the default).
    Run,
    /// Run the agent and print a summary line for every snapshot.
    Watch,
    /// Sample every enabled provider once, print the snapshot and exit.
    Once {
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Load and validate the configuration and alert rules, then exit.
    CheckConfig,
    /// Replay the local fallback log to the backend, then exit.
    Resync,
    /// Export the snapshot history log as JSON or CSV, then exit.
    Export {
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
        /// History log to read. Defaults to `history.path`.
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,
        /// Write here instead of standard output.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        // `Serialized::default` nests dotted keys, so each flag lands in its section.
        let mut figment = Figment::new();

        if let Some(level) = &self.log_level {
            figment = figment.merge(Serialized::default("log_level", level));
        }

        // Only an explicit `--no-backend` overrides the file; its absence is not `enabled = true`.
        if self.no_backend {
            figment = figment.merge(Serialized::default("backend.enabled", false));
        }

        if let Some(addr) = self.web_listen {
            figment = figment
                .merge(Serialized::default("web.listen_address", addr.to_string()))
                .merge(Serialized::default("web.enabled", true));
        }

        figment.data()
    }
}
