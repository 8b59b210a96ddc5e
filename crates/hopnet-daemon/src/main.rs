//! Hopnet daemon.
//!
//! Runs a small network of routers in one process, pushes random traffic
//! from every router's outbound tunnel into other routers' inbound tunnels,
//! and prints a JSON report of what the data plane did.

mod config;
mod sim;

use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = config::DaemonConfig::load()?;

    // 2. Initialize tracing
    let directive = format!("hopnet={}", config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    info!(
        routers = config.simulation.routers,
        hops = config.simulation.hops,
        messages = config.simulation.messages,
        "hopnet daemon starting"
    );

    // 3. Start the network and build tunnels
    let mut network = sim::Simulation::start(config.simulation.clone(), config.tunnel.clone())?;

    // 4. Push traffic and wait for it to land
    network.send_traffic()?;
    network.settle();

    // 5. Report
    let report = network.report();
    info!(sent = report.sent, delivered = report.delivered, "traffic settled");
    println!("{}", serde_json::to_string_pretty(&report)?);

    // 6. Shut down
    network.shutdown();
    Ok(())
}
