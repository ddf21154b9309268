//! nodelink CLI: runs nodes and uplink relays, and probes relays.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use clap::Parser;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Commands::Node { benchmark, listen } => cmd::node::cmd_node(cli.config, benchmark, listen),
        Commands::Relay { listen, echo } => cmd::relay::cmd_relay(cli.config, listen, echo),
        Commands::UplinkProbe {
            relay,
            account,
            qualifier,
            listen_ms,
            json,
        } => cmd::probe::cmd_uplink_probe(&relay, &account, qualifier, listen_ms, json),
        Commands::Config(sub) => match sub {
            ConfigCommands::Show => cmd::config::cmd_config_show(cli.config),
            ConfigCommands::Path => cmd::config::cmd_config_path(cli.config),
        },
        Commands::Completion { shell } => {
            cmd::config::cmd_completion(shell);
            Ok(())
        }
    };

    if let Err(e) = result {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
