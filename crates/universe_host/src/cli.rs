//! Command-line interface for the universe host.
//!
//! Every option overrides the matching value from the configuration file.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "universe.toml";

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the storage directory
    pub storage_dir: Option<PathBuf>,
    /// Optional override for bind address
    pub bind_address: Option<String>,
    pub max_clients: Option<usize>,
    /// Run without the TCP listener
    pub no_listen: bool,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

/// Builds the clap command definition.
pub fn command() -> Command {
    Command::new("Universe Host")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-world universe server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::new("storage")
                .short('s')
                .long("storage")
                .value_name("DIR")
                .help("Directory for client and world data"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (e.g., 0.0.0.0:21025)"),
        )
        .arg(
            Arg::new("max-clients")
                .short('m')
                .long("max-clients")
                .value_name("COUNT")
                .help("Maximum number of remote clients")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("no-listen")
                .long("no-listen")
                .help("Do not accept TCP connections")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG)),
            storage_dir: matches.get_one::<String>("storage").map(PathBuf::from),
            bind_address: matches.get_one::<String>("bind").cloned(),
            max_clients: matches.get_one::<usize>("max-clients").copied(),
            no_listen: matches.get_flag("no-listen"),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
