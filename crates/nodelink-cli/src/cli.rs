//! Clap CLI definitions for nodelink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  nodelink node                              Run a node from ~/.nodelink/config.toml
  nodelink node --benchmark                  Also serve the benchmark service
  nodelink relay --listen 0.0.0.0:31005      Run an uplink relay
  nodelink uplink-probe --relay host:31005 --account alice
  nodelink config show                       Print the effective configuration";

/// nodelink: node-to-node messaging, remote calls and uplink relaying.
#[derive(Parser)]
#[command(name = "nodelink", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node until Ctrl+C.
    Node {
        /// Register the remote benchmark service.
        #[arg(long)]
        benchmark: bool,
        /// Additional contact point to listen on (`tcp:host:port`), repeatable.
        #[arg(long)]
        listen: Vec<String>,
    },
    /// Run an uplink relay until Ctrl+C.
    Relay {
        /// Listen address; overrides `uplink.listen_addr`.
        #[arg(long)]
        listen: Option<String>,
        /// Echo unsupported default-channel messages back to the sender.
        #[arg(long)]
        echo: bool,
    },
    /// Connect to an uplink relay, print the session details and disconnect.
    UplinkProbe {
        /// Relay address (`host:port`).
        #[arg(long)]
        relay: String,
        /// Account name used for the namespace.
        #[arg(long)]
        account: String,
        /// Session qualifier; defaults to "default".
        #[arg(long)]
        qualifier: Option<String>,
        /// How long to collect tool announcements before disconnecting.
        #[arg(long, default_value_t = 1000)]
        listen_ms: u64,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Inspect the configuration [*].
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Generate shell completions.
    Completion {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the config file location.
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_probe_arguments() {
        let cli = Cli::try_parse_from([
            "nodelink",
            "uplink-probe",
            "--relay",
            "127.0.0.1:31005",
            "--account",
            "alice",
        ])
        .unwrap();
        match cli.command {
            Commands::UplinkProbe {
                relay,
                account,
                qualifier,
                listen_ms,
                json,
            } => {
                assert_eq!(relay, "127.0.0.1:31005");
                assert_eq!(account, "alice");
                assert!(qualifier.is_none());
                assert_eq!(listen_ms, 1000);
                assert!(!json);
            }
            _ => panic!("wrong command"),
        }
    }
}
