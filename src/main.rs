//! ddm daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

mod config;
mod control;
mod controller;
mod inventory;
mod locator;
mod prober;
mod runtime;
mod types;
mod zone;

use config::Config;
use control::{ControlLoop, FleetCommands, Pacing};
use controller::CapacityController;
use locator::GuestLocator;
use prober::HealthProber;
use runtime::{CommandReload, RemoteExec, SshExec};
use zone::ZonePublisher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting ddm with config: {:?}", cfg);

    // Static inventory
    let hosts_path = cfg.hosts_path();
    let hosts = inventory::load(&hosts_path).await?;
    if hosts.is_empty() {
        anyhow::bail!("No usable host addresses in {}", hosts_path.display());
    }
    info!("Loaded {} host(s) from {}", hosts.len(), hosts_path.display());

    // The zone file itself may not exist yet, but its directory must.
    let zone_dir = cfg
        .zone_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    if !tokio::fs::metadata(zone_dir)
        .await
        .with_context(|| format!("Zone directory {} is not accessible", zone_dir.display()))?
        .is_dir()
    {
        anyhow::bail!("{} is not a directory", zone_dir.display());
    }

    let publisher_ip = match cfg.publisher_ip {
        Some(ip) => ip,
        None => zone::detect_publisher_ip()
            .await
            .context("Failed to detect this server's address; set publisher_ip")?,
    };
    info!("Publishing name-server address {}", publisher_ip);

    // Collaborators
    let exec: Arc<dyn RemoteExec> = Arc::new(SshExec::new(cfg.ssh_program.clone()));
    let reload = Arc::new(CommandReload::new(
        cfg.reload_command.clone(),
        cfg.reload_timeout(),
    ));

    let control = ControlLoop::new(
        CapacityController::new(hosts, cfg.minimum_proxies, cfg.maximum_proxies),
        GuestLocator::new(
            exec.clone(),
            cfg.host_username.clone(),
            cfg.vm_name.clone(),
            cfg.locate_timeout(),
        ),
        HealthProber::new(cfg.probe_timeout(), cfg.probe_port)?,
        ZonePublisher::new(
            cfg.domain.clone(),
            cfg.service_label.clone(),
            cfg.zone_file.clone(),
            publisher_ip,
            reload,
        ),
        exec,
        FleetCommands::from_config(&cfg),
        Pacing::from_config(&cfg),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut control_handle = tokio::spawn(control.run(shutdown_rx));

    // Graceful Shutdown
    tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, finishing current iteration..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
        }
        res = &mut control_handle => {
            warn!("Control loop exited unexpectedly");
            res?;
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    control_handle.await?;

    info!("Shutdown complete.");
    Ok(())
}
