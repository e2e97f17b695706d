//! RLC AM Link Simulator
//!
//! Runs two RLC AM stacks against each other over a lossy loopback channel
//! and reports per side metrics.

mod config;
mod link;

use anyhow::Result;
use clap::Parser;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::SimConfig;
use crate::link::{Link, SideReport};

/// RLC acknowledged mode loopback simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file, defaults are used when absent
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Traffic duration in ms
    #[arg(long)]
    duration_ms: Option<u64>,

    /// PDU loss probability (0.0 - 1.0)
    #[arg(long)]
    loss: Option<f64>,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Run as fast as possible instead of one tick per millisecond
    #[arg(long)]
    no_pace: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting RLC AM link simulator");

    let mut cfg = match &args.config {
        Some(path) => {
            info!("Configuration file: {}", path);
            SimConfig::from_toml_file(path)?
        }
        None => SimConfig::default(),
    };
    if let Some(duration_ms) = args.duration_ms {
        cfg.run.duration_ms = duration_ms;
    }
    if let Some(loss) = args.loss {
        cfg.channel.loss = loss;
    }
    if let Some(seed) = args.seed {
        cfg.run.seed = seed;
    }
    cfg.validate()?;

    info!("Bearer configuration: {:?}", cfg.bearer);
    info!("Channel:");
    info!("  Loss: {}", cfg.channel.loss);
    info!("  Grants: {}..={} B", cfg.channel.min_grant, cfg.channel.max_grant);
    info!("Traffic:");
    info!("  Duration: {} ms (+{} ms drain)", cfg.run.duration_ms, cfg.run.drain_ms);
    info!("  SDUs per tick: {}, max size {} B", cfg.run.sdu_rate, cfg.run.max_sdu_size);
    info!("  Seed: {}", cfg.run.seed);

    let lossless = cfg.channel.loss == 0.0;
    let mut link = Link::new(cfg)?;

    // Wait for completion or shutdown signal
    tokio::select! {
        result = run_link(&mut link, !args.no_pace) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, stopping early");
        }
    }

    let report = link.report()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!("Simulation finished after {} ms", report.ticks);
        log_side("eNB", &report.enb);
        log_side("UE", &report.ue);
    }

    if lossless && !report.is_clean() {
        anyhow::bail!("Lossless run lost or reordered SDUs");
    }
    Ok(())
}

async fn run_link(link: &mut Link, pace: bool) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    while !link.finished() {
        if pace {
            interval.tick().await;
        } else if link.ticks() % 64 == 0 {
            // Let the signal handler run
            tokio::task::yield_now().await;
        }
        link.step()?;
    }
    Ok(())
}

fn log_side(name: &str, side: &SideReport) {
    let m = &side.metrics;
    info!("{} Statistics:", name);
    info!("  SDUs offered: {}, rejected: {}", side.sdus_offered, side.sdus_rejected);
    info!(
        "  SDUs received: {}, lost: {}, out of order: {}",
        side.sdus_received, side.sdus_lost, side.sdus_out_of_order
    );
    info!(
        "  PDUs sent: {}, dropped by channel: {}, rejected: {}",
        side.pdus_sent, side.pdus_dropped, side.pdus_rejected
    );
    info!("  Reestablishments: {}", side.reestablishments);
    info!(
        "  RLC Tx: {} SDUs / {} PDUs ({} B), Rx: {} SDUs / {} PDUs ({} B), lost PDUs: {}",
        m.num_tx_sdus, m.num_tx_pdus, m.num_tx_pdu_bytes,
        m.num_rx_sdus, m.num_rx_pdus, m.num_rx_pdu_bytes, m.num_lost_pdus
    );
}
