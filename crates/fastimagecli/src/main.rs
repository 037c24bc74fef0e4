use anyhow::{Context, Result};
use clap::Parser;
use fastimage_service::config::Config;
use fastimage_service::{logging, metrics};

use settings::{Cli, Command};

mod commands;
mod decoder;
mod settings;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = Some(cache_dir);
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let result = match cli.command {
        Command::Fetch {
            urls,
            slots,
            progress,
            offline,
        } => commands::fetch(&config, urls, slots, progress, offline).await,
        Command::Invalidate { prefix } => commands::invalidate(&config, &prefix),
        Command::Clear => commands::clear(&config),
        Command::Path { url } => commands::path(&config, &url),
        Command::Cleanup => commands::cleanup(&config),
    };

    if let Err(ref error) = result {
        logging::ensure_log_error(error);
    }
    result
}
