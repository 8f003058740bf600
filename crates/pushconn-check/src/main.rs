//! pushconn-check - run the reachability check by hand.
//!
//! Loads the same configuration file the push client uses and fetches the
//! connectivity-check page, printing `online` or `offline`. With `--repeat`
//! it keeps probing at `--interval` and only prints when the verdict changes,
//! which is handy for watching a captive portal come and go.

use anyhow::{Context, Result};
use clap::Parser;
use pushconn_core::config::parse_duration;
use pushconn_core::{ConnectivityConfig, HttpWebchecker};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "pushconn-check")]
#[command(about = "Check internet reachability the way the push client does")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Keep probing until interrupted
    #[arg(short, long)]
    repeat: bool,

    /// Delay between checks with --repeat (e.g. "30s", "1m")
    #[arg(short, long, default_value = "30s", value_parser = parse_interval)]
    interval: Duration,
}

fn parse_interval(text: &str) -> std::result::Result<Duration, String> {
    let interval = parse_duration(text).map_err(|e| e.to_string())?;
    if interval.is_zero() {
        return Err("interval must be positive".to_string());
    }
    Ok(interval)
}

fn verdict(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // RUST_LOG wins over --debug when set.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .compact();
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.with_max_level(log_level).init(),
    }

    let config = ConnectivityConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let checker = HttpWebchecker::new(
        config.connectivity_check_url.clone(),
        config.connectivity_check_md5.clone(),
        config.webcheck_timeout,
    )?;
    debug!("probing {}", checker.url());

    let mut online = checker.check().await;
    println!("{}", verdict(online));
    if !args.repeat {
        return Ok(if online { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    info!("re-checking every {:?}; press Ctrl-C to stop", args.interval);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received, exiting");
                return Ok(ExitCode::SUCCESS);
            }
            _ = tokio::time::sleep(args.interval) => {}
        }

        let now = checker.check().await;
        if now != online {
            println!("{}", verdict(now));
            online = now;
        } else {
            debug!("still {}", verdict(now));
        }
    }
}
