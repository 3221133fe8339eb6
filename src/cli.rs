//! Command line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fleetbench::workloads::WorkloadKind;

/// Runs benchmark workloads across a client/server fleet.
#[derive(Debug, Parser)]
#[command(name = "fleetbench", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file. Defaults to `fleetbench.toml` in the working directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Fleet layout (JSON). Without one the run is single-role.
    #[arg(long, global = true)]
    pub layout: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs a workload once.
    Run {
        workload: WorkloadKind,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Prints a locally saved state record.
    State {
        key: String,
    },

    /// Prints the effective configuration.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["fleetbench", "run", "sysbench", "--json"]);
        match cli.command {
            Command::Run { workload, json } => {
                assert_eq!(workload, WorkloadKind::Sysbench);
                assert!(json);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "fleetbench",
            "state",
            "SpecCpuState",
            "--config",
            "bench.toml",
            "--layout",
            "layout.json",
            "-v",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("bench.toml")));
        assert_eq!(cli.layout, Some(PathBuf::from("layout.json")));
        assert!(matches!(cli.command, Command::State { ref key } if key == "SpecCpuState"));
    }

    #[test]
    fn cli_rejects_unknown_workload() {
        assert!(Cli::try_parse_from(["fleetbench", "run", "geekbench"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
