use clap::Parser;
use client::config::SyncConfig;
use client::network;
use log::{info, warn};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the game server (overrides CLICKER_SERVER_URL)
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Bearer token presented when connecting (overrides CLICKER_AUTH_TOKEN)
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Taps generated per second by the auto-clicker
    #[arg(short = 'r', long, default_value = "10")]
    taps_per_second: f64,

    /// Combo multiplier reported with every tap
    #[arg(short = 'c', long, default_value = "1.0")]
    combo: f64,

    /// Stop after this many seconds; runs until Ctrl+C when omitted
    #[arg(short = 'd', long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    if !args.taps_per_second.is_finite() || args.taps_per_second <= 0.0 {
        return Err("--taps-per-second must be positive".into());
    }

    let mut config = SyncConfig::from_env();
    if let Some(server) = args.server {
        config = config.with_server_url(server);
    }
    if let Some(token) = args.token {
        config = config.with_auth_token(token);
    }

    info!("Starting auto-clicker...");
    info!("Connecting to: {}", config.server_url);
    info!(
        "{} taps/s at combo x{}",
        args.taps_per_second, args.combo
    );

    let (handle, driver) = network::start(&config);
    let mut errors = handle.subscribe_errors();
    let mut challenges = handle.subscribe_challenges();

    handle.connect().await?;

    let mut taps = interval(Duration::from_secs_f64(1.0 / args.taps_per_second));
    taps.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = interval(Duration::from_secs(1));

    let stop_after = run_for(args.duration.map(Duration::from_secs));
    tokio::pin!(stop_after);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = taps.tick() => handle.send_tap(1, args.combo)?,

            _ = report.tick() => {
                let snapshot = handle.snapshot();
                info!(
                    "[{:?}] essence {:.1} (+{:.1}/s), {} clicks, server seq {}",
                    handle.connection_state(),
                    snapshot.essence,
                    snapshot.production_per_second,
                    snapshot.total_clicks,
                    snapshot.confirmed_server_seq
                );
            }

            error = errors.recv() => match error {
                Ok(e) => warn!("{}", e),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} errors not shown", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            completed = challenges.recv() => {
                if let Ok(ids) = completed {
                    info!("Challenges completed: {}", ids.join(", "));
                }
            }

            _ = &mut stop_after => {
                info!("Run duration elapsed");
                break;
            }

            _ = &mut ctrl_c => {
                info!("Interrupted, flushing and shutting down");
                break;
            }
        }
    }

    handle.shutdown()?;
    driver.await?;

    let snapshot = handle.snapshot();
    info!(
        "Final essence {:.1}, {} clicks",
        snapshot.essence, snapshot.total_clicks
    );

    Ok(())
}

async fn run_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => std::future::pending().await,
    }
}
