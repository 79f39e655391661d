//! CLI surface (collaborator contract, spec §6): `clap` derive, grounded
//! on the teacher's `cli.rs` shape, with the spec's own subcommand set
//! substituted in. A thin dispatcher — it parses and calls into the
//! running gateway's control surface, it does not reimplement
//! daemonization depth (no sandbox, no prerequisite-process machinery).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xzcli", version, about = "MCP aggregation gateway")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "XZCLI_CONFIG", default_value = "~/.xzcli/config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway.
    Start {
        /// Detach into the background after startup succeeds.
        #[arg(long)]
        daemon: bool,
    },
    /// Stop a running gateway.
    Stop,
    /// Restart a running gateway.
    Restart {
        #[arg(long)]
        daemon: bool,
    },
    /// Show the status of a running gateway.
    Status,
    /// Attach to a running gateway's live status stream.
    Attach,
    /// Set a configuration value (`key=value`).
    SetConfig { entry: String },
    /// Get a configuration value, or the whole config if omitted.
    GetConfig { key: Option<String> },
}

/// Process exit codes per the CLI surface contract.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

/// Parse `key=value` into its two halves; usage error (exit 2) if
/// `entry` has no `=`.
pub fn parse_set_config(entry: &str) -> Result<(&str, &str), &'static str> {
    entry
        .split_once('=')
        .ok_or("expected key=value")
        .map(|(k, v)| (k.trim(), v.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_config_pair() {
        assert_eq!(parse_set_config("log_level=debug"), Ok(("log_level", "debug")));
    }

    #[test]
    fn rejects_set_config_without_equals() {
        assert!(parse_set_config("log_level").is_err());
    }
}
