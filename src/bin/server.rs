//! Standalone headless server binary.
//!
//! This is a thin entry point: it parses process configuration from
//! environment variables, installs structured logging, builds the
//! composition root via [`sonos_cast_core::bootstrap`], starts the
//! background discovery/GENA tasks, and serves the HTTP/WS API until
//! it receives a shutdown signal. All real behavior lives in the
//! library; this file only wires it to the process.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use sonos_cast_core::{
    bootstrap_services_with_network, AppState, LocalIpDetector, NetworkContext,
};

/// Reads a `u16` from an environment variable, falling back to `default` if
/// unset or unparseable.
fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads a `u64` from an environment variable, falling back to `default` if
/// unset or unparseable.
fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads a `bool` from an environment variable, falling back to `default` if
/// unset or unparseable. Accepts "true"/"false" (case-insensitive) and "1"/"0".
fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Builds the application [`Config`](sonos_cast_core::Config) from environment
/// variables, layering overrides on top of the library defaults.
fn config_from_env() -> sonos_cast_core::Config {
    let mut config = sonos_cast_core::Config::default();
    config.preferred_port = env_u16("SONOS_CAST_BIND_PORT", config.preferred_port);
    config.topology_refresh_interval = env_u64(
        "SONOS_CAST_TOPOLOGY_REFRESH_INTERVAL",
        config.topology_refresh_interval,
    );
    config.discovery_ssdp_multicast = env_bool(
        "SONOS_CAST_DISCOVERY_SSDP_MULTICAST",
        config.discovery_ssdp_multicast,
    );
    config.discovery_ssdp_broadcast = env_bool(
        "SONOS_CAST_DISCOVERY_SSDP_BROADCAST",
        config.discovery_ssdp_broadcast,
    );
    config.discovery_mdns = env_bool("SONOS_CAST_DISCOVERY_MDNS", config.discovery_mdns);
    config
}

/// Resolves the network context for this process.
///
/// If `SONOS_CAST_ADVERTISE_IP` is set, the server advertises that fixed
/// address to Sonos speakers (the expected setup for a headless server with
/// a known LAN address). Otherwise the local IP is auto-detected and is
/// allowed to change at runtime, e.g. across a Wi-Fi reconnect.
fn resolve_network(config: &sonos_cast_core::Config) -> Result<NetworkContext, String> {
    if let Ok(raw_ip) = std::env::var("SONOS_CAST_ADVERTISE_IP") {
        let advertise_ip: IpAddr = raw_ip
            .parse()
            .map_err(|e| format!("invalid SONOS_CAST_ADVERTISE_IP '{raw_ip}': {e}"))?;
        Ok(NetworkContext::explicit(
            config.preferred_port,
            advertise_ip,
        ))
    } else {
        NetworkContext::auto_detect(config.preferred_port, LocalIpDetector::arc())
            .map_err(|e| format!("failed to auto-detect local IP: {e}"))
    }
}

/// Waits for either Ctrl+C or, on Unix, a SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("Received Ctrl+C, shutting down"),
        () = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env();

    let network = match resolve_network(&config) {
        Ok(network) => network,
        Err(e) => {
            log::error!("Failed to resolve network configuration: {e}");
            std::process::exit(1);
        }
    };

    let services = match bootstrap_services_with_network(&config, network) {
        Ok(services) => services,
        Err(e) => {
            log::error!("Failed to bootstrap services: {e}");
            std::process::exit(1);
        }
    };

    Arc::clone(&services.discovery_service).start_topology_monitor();
    services.discovery_service.start_renewal_task();

    let app_state = AppState::builder()
        .from_services(&services)
        .config(Arc::new(RwLock::new(config)))
        .build();

    // The stream-surface HTTP server is latency-sensitive: Sonos speakers
    // pull audio from it at a fixed cadence, so it runs on the dedicated
    // streaming runtime rather than sharing threads with discovery and GENA
    // work on the main runtime.
    let server_state = app_state.clone();
    let server_task = services.streaming_runtime.spawn(async move {
        if let Err(e) = sonos_cast_core::start_server(server_state).await {
            log::error!("HTTP server exited with error: {e}");
        }
    });

    let gena_state = app_state.clone();
    let gena_task = tokio::spawn(async move {
        if let Err(e) = sonos_cast_core::start_gena_server(gena_state).await {
            log::error!("GENA callback server exited with error: {e}");
        }
    });

    app_state.mark_services_started();
    log::info!("Server started");

    shutdown_signal().await;

    services.shutdown().await;
    server_task.abort();
    gena_task.abort();

    log::info!("Shutdown complete");
}
