//! memberd - gossip membership coordination simulator
//!
//! Runs a set of nodes over a lossy, duplicating, reordering in-memory
//! network and reports whether their membership views converged.

use clap::Parser;
use memberd::config::Config;
use memberd::sim::Simulation;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let level = if config.verbose { "memberd=debug" } else { "memberd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config);

    info!(
        "memberd v{} - member-gossip coordination simulator",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        nodes = config.nodes,
        rounds = config.rounds,
        loss = config.loss_rate,
        duplicates = config.duplicate_rate,
        seed = config.seed,
        "starting simulation"
    );

    let mut sim = match Simulation::new(config) {
        Ok(sim) => sim,
        Err(e) => {
            error!("Failed to initialize simulation: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let report = match sim.run() {
        Ok(report) => report,
        Err(e) => {
            error!("Simulation error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        sent = report.network.sent,
        lost = report.network.lost,
        duplicated = report.network.duplicated,
        delivered = report.network.delivered,
        push_pulls = report.network.push_pulls,
        "network totals"
    );
    info!(
        running = report.running,
        alive = report.alive,
        left = report.left,
        responses = report.responses,
        "final membership"
    );

    if report.converged {
        info!(
            "Converged after round {} of {}",
            report.converged_at.unwrap_or(report.rounds),
            report.rounds
        );
        ExitCode::SUCCESS
    } else {
        warn!("Views did not converge within {} rounds", report.rounds);
        ExitCode::FAILURE
    }
}
