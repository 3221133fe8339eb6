mod cli;
mod ui;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use fleetbench::cancel::CancelSource;
use fleetbench::config::EngineConfig;
use fleetbench::layout::Layout;
use fleetbench::state::{FileStateBackend, StateStore};
use fleetbench::workloads::WorkloadKind;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.validate()?;

    match cli.command {
        Command::Run { workload, json } => run(&config, cli.layout.as_deref(), workload, json).await,
        Command::State { key } => {
            let store = StateStore::new(Arc::new(FileStateBackend::new(&config.state.dir)?));
            let record: Value = store.get_or_create(&key)?;
            if record.is_null() {
                bail!("no state saved under '{key}' in {}", config.state.dir.display());
            }
            ui::print_json(&record);
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: &EngineConfig, layout: Option<&Path>, kind: WorkloadKind, json: bool) -> Result<()> {
    let layout = match layout {
        Some(path) => Layout::load(path).with_context(|| format!("failed to load layout {}", path.display()))?,
        None => Layout::default(),
    };
    let workload = config.workloads.build(kind, &layout)?;
    let engine = config.engine_builder()?.layout(layout).build();

    let source = CancelSource::new();
    let cancel = source.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            source.cancel();
        }
    });

    let progress = ui::RunProgress::start(&workload.identity().to_string());
    let report = engine.execute(workload.as_ref(), &cancel).await;
    progress.complete(&report);
    if json {
        ui::print_json(&report);
    }

    report.into_result()?;
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
