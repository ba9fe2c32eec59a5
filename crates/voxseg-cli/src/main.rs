//! `voxseg` – runs the VoxSeg ingestion and query node.
//!
//! 1. Initialises tracing (see `voxseg_server::telemetry`).
//! 2. Loads `~/.voxseg/config.toml`, writing a default file on first run.
//! 3. Starts a [`VoxsegNode`] over an in-process [`SensorBus`] with the
//!    stand-in [`EmptyWorld`] engine.
//! 4. Logs synchronizer statistics periodically until **Ctrl-C**.
//!
//! No transport adapter ships with this binary: nothing publishes onto its
//! bus and no compute client is exposed, so the process ingests nothing and
//! answers no requests. It is a dry run of the node wiring and config;
//! embed [`VoxsegNode`] and publish onto the [`SensorBus`] from a transport
//! to serve real traffic.

mod config;

use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use voxseg_middleware::SensorBus;
use voxseg_perception::PassthroughDecoder;
use voxseg_server::{EmptyWorld, VoxsegNode, init_tracing};

/// How often the running node reports its counters.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn main() {
    // Tracing first: the OTLP exporter must exist before the runtime does.
    let _tracing = init_tracing("voxseg");

    print_banner();

    let cfg = load_or_create_config();

    let shutdown = Arc::new(Notify::new());
    let notifier = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        notifier.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; stop the process with a signal instead");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to start the Tokio runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(cfg, shutdown)) {
        error!(error = %e, "VoxSeg node failed");
        println!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    println!("{}", "  ✓ Exiting VoxSeg.".green());
}

async fn serve(cfg: config::Config, shutdown: Arc<Notify>) -> Result<(), String> {
    let bus = SensorBus::new(cfg.bus_capacity.max(1));
    let world = EmptyWorld::new(cfg.world.grid_size, cfg.world.origin, cfg.world.resolution);

    let (node, _client) = VoxsegNode::spawn(cfg.node_config(), world, PassthroughDecoder, &bus)
        .map_err(|e| e.to_string())?;

    let mode = match cfg.batch_size {
        Some(n) if n > 0 => format!("automatic, every {n} frames"),
        _ => "manual (on compute request)".to_string(),
    };
    println!("  World updates: {}", mode.bold());
    println!(
        "  Sync: slop {}s, queue {}, pose channels {}",
        cfg.sync.slop, cfg.sync.queue_size, cfg.sync.pose_channels
    );
    println!(
        "  {} no transport attached; the bus has no publishers and requests are not served",
        "Dry run:".yellow().bold()
    );
    println!("\n  {} Press Ctrl-C to stop.\n", "Node running.".green().bold());

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                let stats = node.sync_stats();
                info!(
                    received = stats.received,
                    matched = stats.matched,
                    evicted = stats.evicted,
                    rejected = stats.rejected,
                    pending_frames = node.server().pending_frames(),
                    "synchronizer stats"
                );
            }
        }
    }

    node.shutdown();
    Ok(())
}

fn load_or_create_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#" _  _ ____ _  _ ____ ____ ____ "#.bold().cyan());
    println!("{}", r#" |  | |  |  \/  [__  |___ | __ "#.bold().cyan());
    println!("{}", r#"  \/  |__| _/\_ ___] |___ |__] "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "VoxSeg".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Open-vocabulary voxel segmentation node");
    println!();
}
