use clap::Parser;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use cli::{run_command, Cli};
use crguard::config::Config;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // the config decides the log level, so it is read before tracing exists
    let loaded = match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(cli.debug, rust_log.as_deref(), &config.general.log_level);
    let (filter, rejected) = match EnvFilter::try_new(&directive) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new("info"), Some((directive, e))),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Some((directive, e)) = rejected {
        warn!(%directive, "Invalid log filter, using info: {}", e);
    }

    if let Err(e) = run_command(cli, config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// `--debug` wins, then a non-empty `RUST_LOG`, then `general.log_level`
fn filter_directive(debug: bool, rust_log: Option<&str>, log_level: &str) -> String {
    if debug {
        return "debug".to_string();
    }
    rust_log
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(log_level)
        .to_string()
}
