use std::io;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use fern::colors::{Color, ColoredLevelConfig};
use log::warn;
use tokio::sync::watch;

mod aw_client;
mod backfill;
mod config;
mod datetime;
mod reconcile;
mod status;
mod time_entry;
mod toggl;
mod watcher;

use aw_client::{ensure_bucket, AwClient};
use status::StatusLine;
use toggl::TogglClient;

/// bucketに付けるevent typeのタグ。
const EVENT_TYPE: &str = "toggl_data";

/// Togglのtime entryをActivityWatchへ同期するwatcher。
///
/// 設定ファイルで指定されたpoll間隔で実行中のentryをheartbeatとして送り、
/// 起動時にオプションで過去の月を同期する。
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// Connect to a testing instance of aw-server
    #[clap(long)]
    testing: bool,

    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose).context("Failed to set up logging")?;

    let config = config::load().context("Failed to load config")?;
    if config.api_token.is_empty() {
        warn!(
            "Toggl API token not specified in config file (in folder {}). \
             Get your API token on the Toggl website.",
            config::config_dir()?.display()
        );
        process::exit(1);
    }

    let toggl = TogglClient::new(&config.api_token).context("Failed to build toggl client")?;
    let aw = AwClient::new(config::WATCHER_NAME, args.testing)
        .context("Failed to build aw-server client")?;
    let bucket = aw.bucket_name();
    ensure_bucket(&aw, &bucket, EVENT_TYPE).await?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let ctrl_c_tx = stop_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(true);
        }
    });

    let mut status = StatusLine::new(io::stdout());

    if config.backfill {
        let since = config
            .backfill_since
            .unwrap_or_else(|| datetime::today() - chrono::Duration::days(32));
        backfill::run(
            &toggl,
            &aw,
            &bucket,
            since,
            config.update_existing_events,
            config.poll_time,
            &mut status,
            &mut stop_rx,
        )
        .await?;
    }

    watcher::run(
        &toggl,
        &aw,
        &bucket,
        config.poll_time,
        &mut status,
        &mut stop_rx,
    )
    .await?;

    drop(stop_tx);
    Ok(())
}

/// loggerを初期化する。診断はstderrへ出し、stdoutのステータス行を汚さない。
fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .debug(Color::BrightBlack)
        .warn(Color::Yellow)
        .error(Color::Red);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] {} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .context("Failed to initialize logger")?;

    Ok(())
}
