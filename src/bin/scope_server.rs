//! Serves a simulated microscope over the gRPC bridge.
//!
//! Loads settings from `rust_scope.toml` / `RUSTSCOPE_*` environment
//! variables, starts the hardware agent around the demo backend and exposes
//! it on the configured endpoint. Ctrl-C shuts the hardware down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use rust_scope::agent::Agent;
use rust_scope::config::Settings;
use rust_scope::hardware::agent::MicroscopeAgent;
use rust_scope::hardware::demo::DemoBackend;
use rust_scope::hardware::MicroscopeHardware;
use rust_scope::net::server::RemoteMicroscopeServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rust_scope::init_logging();

    let settings = Settings::load().context("loading settings")?;
    let addr: SocketAddr = format!("{}:{}", settings.network.host, settings.network.port)
        .parse()
        .context("parsing bridge address")?;

    let backend = DemoBackend::new(&settings);
    let (worker, hardware, signals) = MicroscopeAgent::new(backend, &settings);
    let agent = Agent::spawn(worker);

    let hardware: Arc<dyn MicroscopeHardware> = Arc::new(hardware);
    let (bridge, relay) = RemoteMicroscopeServer::new(Arc::clone(&hardware), signals, &settings);

    let server = tokio::spawn(bridge.serve(addr));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    hardware.shutdown().await?;
    agent.join().await?;
    relay.stop().await?;
    server.abort();
    Ok(())
}
