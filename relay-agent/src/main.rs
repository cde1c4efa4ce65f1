//! RelayHub Agent - relay controller binary
//!
//! Usage:
//!   relayhub-agent                  run the agent
//!   relayhub-agent store-password   read the device password from stdin into the OS keyring

use anyhow::{bail, Context, Result};
use relayhub_agent::config::AgentConfig;
use relayhub_agent::discovery::DeviceIdentity;
use relayhub_agent::recovery::{ProcessRestarter, RESTART_EXIT_CODE};
use relayhub_agent::remote::FirebaseTransport;
use relayhub_agent::telemetry::SystemProbe;
use relayhub_agent::{agent::RunExit, DeviceAgent, RelayBank, RemoteStateClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relayhub_agent=info")),
        )
        .init();

    let config = AgentConfig::load().await.context("Failed to load configuration")?;

    if std::env::args().nth(1).as_deref() == Some("store-password") {
        return store_password(&config);
    }

    info!(
        "RelayHub Agent v{} starting for device {}",
        env!("CARGO_PKG_VERSION"),
        config.device.device_id
    );
    config.validate().context("Invalid configuration")?;

    // The bank drives every line OFF before anything else can touch it
    let driver = config.open_driver().context("Failed to open relay driver")?;
    let ratings = config.power_ratings().context("Invalid power ratings")?;
    let bank = RelayBank::new(&config.relays.pins, ratings, driver)
        .context("Failed to initialise relay bank")?
        .with_names(&config.relays.names);

    let transport = FirebaseTransport::new(&config.remote).context("Failed to build store transport")?;
    let credentials = config.credentials().context("Missing device credentials")?;
    let client = RemoteStateClient::new(transport, credentials, config.remote.request_timeout())
        .with_refresh_margin(config.remote.refresh_margin());

    let mut agent = DeviceAgent::new(
        &config,
        client,
        bank,
        Box::new(SystemProbe::new()),
        Box::new(ProcessRestarter::new(config.recovery.restart_mode)),
        DeviceIdentity::discover(),
    );

    match agent.run(shutdown_signal()).await {
        RunExit::Shutdown => {
            info!("Agent stopped");
            Ok(())
        }
        RunExit::Restarted => std::process::exit(RESTART_EXIT_CODE),
    }
}

fn store_password(config: &AgentConfig) -> Result<()> {
    if config.remote.device_email.is_empty() {
        bail!("remote.device_email must be set before storing a password");
    }
    let mut password = String::new();
    std::io::stdin()
        .read_line(&mut password)
        .context("Failed to read password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("empty password");
    }
    AgentConfig::save_password(&config.remote.device_email, password)
        .context("Failed to store password in keyring")?;
    info!("Password stored for {}", config.remote.device_email);
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
