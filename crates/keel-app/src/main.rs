use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use keel_config::config::CONFIG_FILE;
use keel_config::KeelConfig;
use keel_core::logging::{self, LogLevel, LogOptions};

mod events;
mod host;

use host::Host;

/// Headless Keel host: runs the module runtime for a number of ticks,
/// optionally restoring and saving a project document.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
struct Cli {
    /// Configuration file; a missing file means defaults
    #[arg(short, long, env = "KEEL_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Project document to restore before the first tick
    #[arg(long)]
    load: Option<PathBuf>,

    /// Where to write the project document after the last tick
    #[arg(long)]
    save: Option<PathBuf>,

    /// Number of ticks to run (overrides `runtime.ticks`)
    #[arg(short, long)]
    ticks: Option<u64>,

    /// Keys pressed on successive ticks, e.g. "+5r"
    #[arg(short, long, default_value = "")]
    keys: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KeelConfig::load_or_default(&cli.config)?;
    config.supports_host(env!("CARGO_PKG_VERSION"))?;

    let log_buffer = logging::init(&LogOptions {
        filter: config.logging.filter.clone(),
        dir: config.logging.dir.clone(),
        ..LogOptions::default()
    })?;
    tracing::info!(config = %cli.config.display(), "keel starting up");

    let result = run(&cli, &config);

    for entry in logging::recent_entries(&log_buffer, LogLevel::Warn) {
        eprintln!("{entry}");
    }
    result
}

fn run(cli: &Cli, config: &KeelConfig) -> Result<()> {
    let mut host = Host::new(config)?;

    if let Some(path) = load_path(cli, config) {
        host.load(&path)?;
    }

    let ticks = cli.ticks.unwrap_or(config.runtime.ticks);
    let keys: Vec<char> = cli.keys.chars().collect();
    let summary = host.run(ticks, &keys)?;
    println!("{summary}");
    if let Some(counter) = host.counter() {
        let state = counter.borrow().state();
        println!("counter: {} after {} ticks", state.count, state.ticks_seen);
    }

    if let Some(path) = cli.save.as_ref().or(config.project.state_file.as_ref()) {
        host.save(path)
            .with_context(|| format!("could not save project to {}", path.display()))?;
    }

    host.shutdown();
    Ok(())
}

/// `--load` must exist; the configured state file is only loaded if present.
fn load_path(cli: &Cli, config: &KeelConfig) -> Option<PathBuf> {
    if let Some(path) = &cli.load {
        return Some(path.clone());
    }
    config
        .project
        .state_file
        .as_deref()
        .filter(|path| path.exists())
        .map(Path::to_path_buf)
}
