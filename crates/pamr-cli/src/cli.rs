//! Clap CLI definitions for PAMR.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  pamr router                          Run a router on the default port
  pamr router --port 0 --verbose       Run on an ephemeral port, log agent events
  pamr reload --cookie <admin>         Re-read the reserved agents file
  pamr list pamr://4096/               List objects exported by agent 4096";

/// PAMR: message routing for endpoints behind firewalls.
#[derive(Parser)]
#[command(name = "pamr", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.pamr/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a router until interrupted.
    Router(RouterArgs),
    /// Ask a running router to reload its reserved agents file.
    Reload {
        /// Admin cookie (`configuration` entry of the reserved agents file).
        #[arg(long)]
        cookie: String,
        /// Router address (default: agent.router_address).
        #[arg(long)]
        address: Option<String>,
        /// Router port (default: agent.router_port).
        #[arg(long)]
        port: Option<u16>,
    },
    /// List the objects exported by an agent.
    List {
        /// `pamr://<agent-id>/` URI or a bare agent id.
        target: String,
        /// Output as JSON for scripting.
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct RouterArgs {
    /// Address to bind.
    #[arg(long)]
    pub bind: Option<String>,
    /// Port to bind (0 picks a free one).
    #[arg(long)]
    pub port: Option<u16>,
    /// Heartbeat timeout in milliseconds.
    #[arg(long)]
    pub heartbeat_timeout: Option<u64>,
    /// Forget disconnected agents after this many milliseconds.
    #[arg(long)]
    pub evict_timeout: Option<u64>,
    /// Reserved agents file.
    #[arg(long)]
    pub reserved_agents: Option<PathBuf>,
    /// Log agent connections and disconnections.
    #[arg(long, short)]
    pub verbose: bool,
}

impl RouterArgs {
    /// Apply the flags given on the command line over `config`.
    pub fn apply(&self, config: &mut pamr_types::RouterConfig) {
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ms) = self.heartbeat_timeout {
            config.heartbeat_timeout_ms = ms;
        }
        if let Some(ms) = self.evict_timeout {
            config.client_eviction_timeout_ms = Some(ms);
        }
        if let Some(path) = &self.reserved_agents {
            config.reserved_agents_file = Some(path.clone());
        }
        if self.verbose {
            config.admin_verbose = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_router_flags_override_config() {
        let cli = Cli::parse_from([
            "pamr",
            "router",
            "--port",
            "0",
            "--evict-timeout",
            "500",
            "-v",
        ]);
        let Commands::Router(args) = cli.command else {
            panic!("expected router command");
        };
        let mut config = pamr_types::RouterConfig::default();
        args.apply(&mut config);
        assert_eq!(config.port, 0);
        assert_eq!(config.client_eviction_timeout_ms, Some(500));
        assert!(config.admin_verbose);
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_list_parses_target() {
        let cli = Cli::parse_from(["pamr", "list", "4096", "--json"]);
        assert!(matches!(cli.command, Commands::List { json: true, .. }));
    }
}
