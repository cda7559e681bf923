// src/main.rs - host shell for the interpreter
//
// Runs the tick loop against the simulation backends, with stdin as the
// console command source. Real deployments replace the backends with the
// actual motion and thermal executors.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use gantry::Config;
use gantry::sim::SimRig;

#[derive(Parser)]
#[command(name = "gantry-host", version, about = "G-code interpreter and motion sequencer")]
struct Args {
    /// Configuration file
    #[arg(default_value = "gantry.toml")]
    config: PathBuf,

    /// Control loop period in milliseconds
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    tracing::info!("starting gantry host v{}", env!("CARGO_PKG_VERSION"));

    let config = if args.config.exists() {
        Config::load(&args.config).map_err(|e| {
            tracing::error!("failed to load config from {}: {}", args.config.display(), e);
            e
        })?
    } else {
        tracing::warn!("{} not found, using built-in defaults", args.config.display());
        Config::default()
    };

    let mut rig = SimRig::new(&config);

    // Feed stdin lines to the console source without ever blocking the
    // control loop.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let local = LocalSet::new();
    local.spawn_local(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(args.tick_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    break;
                }
                _ = interval.tick() => {
                    while let Ok(line) = line_rx.try_recv() {
                        rig.send(&line);
                    }
                    rig.tick();
                    for reply in rig.replies() {
                        println!("{reply}");
                    }
                }
            }
        }
    });
    local.await;

    Ok(())
}
