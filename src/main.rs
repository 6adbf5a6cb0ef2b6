//! `relay` entry point.
//!
//! `relay serve` runs the bus ingestors, dispatcher and WebSocket gateway.
//! `relay proxy` runs the ingress router in front of the REST API, gateway
//! and UI.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use relay_core::InstanceId;
use relay_hub::{HubConfig, RegistryConfig};
use relay_ingress::IngressConfig;
use relay_server::{
    AppState, Authenticator, Gateway, GatewayConfig, NamedTask, ShutdownCoordinator, wait_for_signal,
};
use relay_settings::RelaySettings;
use tracing::{error, info};

/// Real-time result relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time result distribution relay", version)]
struct Cli {
    /// Settings file. Defaults to `~/.relay/settings.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestors, dispatcher and WebSocket gateway.
    Serve,
    /// Run the ingress router.
    Proxy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => relay_settings::load_settings_from_path(path),
        None => relay_settings::load_settings(),
    }
    .context("failed to load settings")?;

    relay_core::logging::init_subscriber(
        &settings.logging.level,
        settings.logging.format,
        &settings.logging.module_levels,
    );

    match cli.command {
        Command::Serve => serve(settings).await,
        Command::Proxy => proxy(settings).await,
    }
}

fn hub_config(settings: &RelaySettings) -> HubConfig {
    HubConfig {
        channels: settings.bus.channels.clone(),
        ingest_buffer: settings.bus.ingest_buffer,
        backoff: settings.bus.backoff,
        registry: RegistryConfig {
            replay_capacity: settings.replay.capacity,
            buffer_unclaimed: settings.replay.buffer_unclaimed,
        },
        grace_period: Duration::from_secs(settings.replay.grace_period_secs),
        sweep_interval: Duration::from_secs(settings.replay.sweep_interval_secs),
    }
}

async fn serve(settings: RelaySettings) -> Result<()> {
    let metrics = relay_server::metrics::install_recorder().context("failed to install metrics recorder")?;
    let coordinator =
        ShutdownCoordinator::with_timeout(Duration::from_secs(settings.server.shutdown_timeout_secs));
    let shutdown = coordinator.token();

    let bus = relay_bus::open(
        &settings.bus.url,
        Duration::from_secs(settings.bus.connect_timeout_secs),
    )
    .with_context(|| format!("failed to open bus {}", settings.bus.url))?;

    let hub = relay_hub::start(Arc::clone(&bus.messages), hub_config(&settings), &shutdown);
    let config = GatewayConfig::from_settings(&settings);
    let presence_interval = config.presence_interval;
    let bind = config.bind_addr();
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&hub.registry),
        Authenticator::from_settings(&settings.auth),
        config,
        shutdown.clone(),
    ));

    let state = AppState {
        gateway: Arc::clone(&gateway),
        jobs: Arc::clone(&bus.jobs),
        metrics,
        start_time: Instant::now(),
    };
    let server = relay_server::start(state, shutdown.clone())
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    let mut tasks: Vec<NamedTask> = hub
        .tasks
        .into_iter()
        .map(|handle| NamedTask::new("hub", handle))
        .collect();
    tasks.push(NamedTask::new("server", server.task));
    if let Some(interval) = presence_interval {
        let instance = InstanceId::new();
        info!(%instance, interval_secs = interval.as_secs(), "presence enabled");
        let presence = tokio::spawn(relay_server::presence::run_presence(
            Arc::clone(&bus.presence),
            Arc::clone(&gateway),
            instance,
            interval,
            shutdown.clone(),
        ));
        tasks.push(NamedTask::new("presence", presence));
    }

    info!(
        addr = %server.addr,
        bus = %settings.bus.url,
        channels = ?settings.bus.channels,
        "relay ready"
    );

    let mut dispatcher = hub.dispatcher;
    let outcome = tokio::select! {
        () = wait_for_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
        joined = &mut dispatcher => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "dispatcher failed");
                Err(anyhow::Error::new(e).context("dispatcher failed"))
            }
            Err(e) => Err(anyhow!("dispatcher task aborted: {e}")),
        },
    };

    info!("shutting down");
    if !dispatcher.is_finished() {
        let dispatcher = tokio::spawn(async move {
            let _ = dispatcher.await;
        });
        tasks.push(NamedTask::new("dispatcher", dispatcher));
    }
    let report = coordinator.drain(tasks).await;
    info!(finished = report.finished, clean = report.is_clean(), "shutdown complete");
    outcome
}

async fn proxy(settings: RelaySettings) -> Result<()> {
    let coordinator =
        ShutdownCoordinator::with_timeout(Duration::from_secs(settings.server.shutdown_timeout_secs));
    let config = IngressConfig::from_settings(&settings.proxy);
    let bind = config.bind_addr();
    let handle = relay_ingress::start(config, coordinator.token())
        .await
        .with_context(|| format!("failed to start proxy on {bind}"))?;
    info!(addr = %handle.addr, "proxy ready");

    wait_for_signal().await;
    info!("shutting down");
    let report = coordinator.drain(vec![NamedTask::new("proxy", handle.task)]).await;
    info!(clean = report.is_clean(), "shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["relay", "serve"]).unwrap();
        assert!(matches!(cli.command, Command::Serve));
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["relay", "proxy", "--config", "/etc/relay.json"]).unwrap();
        assert!(matches!(cli.command, Command::Proxy));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/relay.json")));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["relay"]).is_err());
    }

    #[test]
    fn hub_config_follows_settings() {
        let mut settings = RelaySettings::default();
        settings.bus.channels = vec!["A".into(), "B".into()];
        settings.replay.capacity = 7;
        settings.replay.buffer_unclaimed = false;
        settings.replay.grace_period_secs = 12;

        let config = hub_config(&settings);
        assert_eq!(config.channels, vec!["A".to_owned(), "B".to_owned()]);
        assert_eq!(config.registry.replay_capacity, 7);
        assert!(!config.registry.buffer_unclaimed);
        assert_eq!(config.grace_period, Duration::from_secs(12));
    }
}
