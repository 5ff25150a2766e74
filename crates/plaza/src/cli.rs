//! Command-line interface for the plaza server.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments. Every option except `--config` overrides the
/// matching value from the configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the reliable (TCP) bind address
    pub reliable_bind: Option<String>,
    /// Optional override for the unreliable (UDP) bind address
    pub unreliable_bind: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(command().get_matches())
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("plaza.toml")),
            reliable_bind: matches.get_one::<String>("reliable-bind").cloned(),
            unreliable_bind: matches.get_one::<String>("unreliable-bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Plaza Presence Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Real-time presence server with reliable and unreliable transports")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("plaza.toml"),
        )
        .arg(
            Arg::new("reliable-bind")
                .short('r')
                .long("reliable-bind")
                .value_name("ADDRESS")
                .help("Reliable (TCP) bind address (e.g., 0.0.0.0:9000)"),
        )
        .arg(
            Arg::new("unreliable-bind")
                .short('u')
                .long("unreliable-bind")
                .value_name("ADDRESS")
                .help("Unreliable (UDP) bind address (e.g., 0.0.0.0:9001)"),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::from_matches(command().get_matches_from(["plaza"]));
        assert_eq!(args.config_path, PathBuf::from("plaza.toml"));
        assert!(args.reliable_bind.is_none());
        assert!(args.unreliable_bind.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::from_matches(command().get_matches_from([
            "plaza",
            "--config",
            "custom.toml",
            "--reliable-bind",
            "0.0.0.0:7000",
            "-u",
            "0.0.0.0:7001",
            "--log-level",
            "debug",
            "--json-logs",
        ]));
        assert_eq!(args.config_path, PathBuf::from("custom.toml"));
        assert_eq!(args.reliable_bind.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(args.unreliable_bind.as_deref(), Some("0.0.0.0:7001"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }
}
