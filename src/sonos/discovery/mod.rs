//! Multi-method Sonos speaker discovery.
//!
//! Combines SSDP multicast, SSDP broadcast, and mDNS/Bonjour discovery,
//! merges results by normalized UUID, and resolves friendly name + model
//! for each speaker from its device description XML.

pub mod mdns;
pub mod ssdp;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;

use crate::protocol_constants::SOAP_TIMEOUT_SECS;
use crate::sonos::utils::extract_xml_text;
use crate::state::Config;

use mdns::MdnsConfig;
use ssdp::SsdpConfig;
pub use types::{
    is_virtual_interface, normalize_uuid, DeviceInfo, DiscoveredSpeaker, DiscoveryError,
    DiscoveryErrorKind, DiscoveryMethod, DiscoveryResult, Speaker,
};

/// Configuration bundling all three discovery methods plus their enable flags.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub ssdp: SsdpConfig,
    pub mdns: MdnsConfig,
    pub enable_ssdp_multicast: bool,
    pub enable_ssdp_broadcast: bool,
    pub enable_mdns: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ssdp: SsdpConfig::default(),
            mdns: MdnsConfig::default(),
            enable_ssdp_multicast: true,
            enable_ssdp_broadcast: true,
            enable_mdns: true,
        }
    }
}

impl From<&Config> for DiscoveryConfig {
    fn from(config: &Config) -> Self {
        Self {
            ssdp: SsdpConfig {
                send_count: config.ssdp_send_count,
                retry_delay: Duration::from_millis(config.ssdp_retry_delay_ms),
                ..SsdpConfig::default()
            },
            mdns: MdnsConfig {
                browse_timeout: Duration::from_millis(config.mdns_browse_timeout_ms),
            },
            enable_ssdp_multicast: config.discovery_ssdp_multicast,
            enable_ssdp_broadcast: config.discovery_ssdp_broadcast,
            enable_mdns: config.discovery_mdns,
        }
    }
}

/// Runs and merges all enabled discovery methods, then resolves metadata.
///
/// The mDNS daemon is created lazily and reused across calls: `mdns-sd`
/// spins up a background thread per daemon, so repeated topology refreshes
/// should not pay that cost every time.
pub struct DiscoveryCoordinator {
    config: DiscoveryConfig,
    http_client: Client,
    mdns_daemon: AsyncMutex<OnceLock<Arc<mdns_sd::ServiceDaemon>>>,
}

impl DiscoveryCoordinator {
    /// Creates a new coordinator with the given discovery configuration.
    #[must_use]
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            http_client: Client::builder()
                .timeout(Duration::from_secs(SOAP_TIMEOUT_SECS))
                .build()
                .expect("Failed to create discovery HTTP client"),
            mdns_daemon: AsyncMutex::new(OnceLock::new()),
        }
    }

    async fn get_mdns_daemon(&self) -> Result<Arc<mdns_sd::ServiceDaemon>, DiscoveryError> {
        let lock = self.mdns_daemon.lock().await;
        if let Some(daemon) = lock.get() {
            return Ok(Arc::clone(daemon));
        }
        let daemon = Arc::new(mdns::create_daemon()?);
        let _ = lock.set(Arc::clone(&daemon));
        Ok(daemon)
    }

    /// Discovers all Sonos speakers reachable via enabled methods.
    ///
    /// Failures in individual methods are logged and excluded from the
    /// merged result; only when every enabled method fails is an error
    /// returned.
    pub async fn discover_speakers(&self) -> DiscoveryResult<Vec<Speaker>> {
        let mut method_errors: Vec<(DiscoveryMethod, DiscoveryErrorKind)> = Vec::new();
        let mut merged: HashMap<String, DiscoveredSpeaker> = HashMap::new();
        let mut any_enabled = false;

        if self.config.enable_ssdp_multicast {
            any_enabled = true;
            match ssdp::discover_multicast(&self.config.ssdp).await {
                Ok(found) => merge_into(&mut merged, found),
                Err(e) => {
                    log::warn!("[Discovery] SSDP multicast failed: {}", e);
                    method_errors.push((DiscoveryMethod::SsdpMulticast, to_error_kind(&e)));
                }
            }
        }

        if self.config.enable_ssdp_broadcast {
            any_enabled = true;
            match ssdp::discover_broadcast(&self.config.ssdp).await {
                Ok(found) => merge_into(&mut merged, found),
                Err(e) => {
                    log::warn!("[Discovery] SSDP broadcast failed: {}", e);
                    method_errors.push((DiscoveryMethod::SsdpBroadcast, to_error_kind(&e)));
                }
            }
        }

        if self.config.enable_mdns {
            any_enabled = true;
            match self.get_mdns_daemon().await {
                Ok(daemon) => match mdns::discover_mdns(&daemon, &self.config.mdns).await {
                    Ok(found) => merge_into(&mut merged, found),
                    Err(e) => {
                        log::warn!("[Discovery] mDNS failed: {}", e);
                        method_errors.push((DiscoveryMethod::Mdns, to_error_kind(&e)));
                    }
                },
                Err(e) => {
                    log::warn!("[Discovery] mDNS daemon unavailable: {}", e);
                    method_errors.push((DiscoveryMethod::Mdns, to_error_kind(&e)));
                }
            }
        }

        if any_enabled && merged.is_empty() && !method_errors.is_empty() {
            return Err(DiscoveryError::AllMethodsFailed(method_errors));
        }

        let speakers = self.resolve_metadata(merged.into_values().collect()).await;
        Ok(speakers
            .into_iter()
            .filter(|s| !s.is_infrastructure_device())
            .collect())
    }

    /// Fetches device description metadata for each discovered speaker,
    /// concurrently, falling back to bare IP/UUID when the fetch fails.
    async fn resolve_metadata(&self, discovered: Vec<DiscoveredSpeaker>) -> Vec<Speaker> {
        let futures = discovered.into_iter().map(|d| async move {
            let ip = d.preferred_ip().to_string();
            match fetch_device_info(&self.http_client, &ip).await {
                Ok(info) => Speaker {
                    ip,
                    name: info.friendly_name,
                    uuid: normalize_uuid(&info.uuid),
                    model_name: info.model_name,
                },
                Err(e) => {
                    log::debug!(
                        "[Discovery] Device description fetch failed for {}: {}",
                        ip,
                        e
                    );
                    Speaker {
                        ip,
                        name: format!("Sonos {}", d.uuid),
                        uuid: normalize_uuid(&d.uuid),
                        model_name: None,
                    }
                }
            }
        });
        futures::future::join_all(futures).await
    }
}

/// Merges newly discovered speakers into the accumulator, keyed by
/// normalized UUID so the same physical speaker found by multiple methods
/// collapses into one entry.
fn merge_into(acc: &mut HashMap<String, DiscoveredSpeaker>, found: Vec<DiscoveredSpeaker>) {
    for speaker in found {
        let key = normalize_uuid(&speaker.uuid);
        acc.entry(key)
            .and_modify(|existing| existing.merge(speaker.clone()))
            .or_insert(speaker);
    }
}

fn to_error_kind(e: &DiscoveryError) -> DiscoveryErrorKind {
    match e {
        DiscoveryError::SocketBind(err) => DiscoveryErrorKind::SocketBind(err.to_string()),
        DiscoveryError::NoInterfaces => {
            DiscoveryErrorKind::Permission("no usable network interfaces".to_string())
        }
        DiscoveryError::MdnsDaemon(msg) => DiscoveryErrorKind::DaemonError(msg.clone()),
        other => DiscoveryErrorKind::DaemonError(other.to_string()),
    }
}

/// Fetches and parses a speaker's device description XML directly from its IP.
///
/// Used both by [`DiscoveryCoordinator::resolve_metadata`] and by
/// [`probe_speaker_by_ip`] for manually-entered speaker addresses.
async fn fetch_device_info(client: &Client, ip: &str) -> DiscoveryResult<DeviceInfo> {
    let url = format!("http://{}:1400/xml/device_description.xml", ip);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|_| DiscoveryError::IpUnreachable(ip.to_string()))?;

    if !response.status().is_success() {
        return Err(DiscoveryError::IpUnreachable(ip.to_string()));
    }

    let body = response
        .text()
        .await
        .map_err(|_| DiscoveryError::IpUnreachable(ip.to_string()))?;

    let uuid = extract_xml_text(&body, "UDN")
        .ok_or_else(|| DiscoveryError::NotSonosDevice(ip.to_string()))?;

    if !uuid.contains("RINCON_") {
        return Err(DiscoveryError::NotSonosDevice(ip.to_string()));
    }

    let friendly_name =
        extract_xml_text(&body, "friendlyName").unwrap_or_else(|| format!("Sonos ({})", ip));
    let model_name = extract_xml_text(&body, "modelName");
    let model_number = extract_xml_text(&body, "modelNumber");

    Ok(DeviceInfo {
        uuid,
        friendly_name,
        model_name,
        model_number,
    })
}

/// Probes a single IP address to confirm it is a reachable Sonos speaker
/// and resolve its metadata, bypassing multicast/broadcast/mDNS entirely.
///
/// Used for manually-entered speaker addresses where automatic discovery
/// did not find the device (e.g. it's on a different subnet/VLAN).
pub async fn probe_speaker_by_ip(ip: &str) -> DiscoveryResult<Speaker> {
    let client = Client::builder()
        .timeout(Duration::from_secs(SOAP_TIMEOUT_SECS))
        .build()
        .map_err(|_| DiscoveryError::IpUnreachable(ip.to_string()))?;

    let info = fetch_device_info(&client, ip).await?;

    Ok(Speaker {
        ip: ip.to_string(),
        name: info.friendly_name,
        uuid: normalize_uuid(&info.uuid),
        model_name: info.model_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_config_from_config_carries_flags() {
        let mut config = Config::default();
        config.discovery_mdns = false;
        config.ssdp_send_count = 5;

        let discovery_config = DiscoveryConfig::from(&config);
        assert!(!discovery_config.enable_mdns);
        assert_eq!(discovery_config.ssdp.send_count, 5);
    }

    #[test]
    fn merge_into_collapses_by_normalized_uuid() {
        let mut acc = HashMap::new();
        merge_into(
            &mut acc,
            vec![DiscoveredSpeaker::new(
                "192.168.1.10".to_string(),
                "RINCON_ABC123_MS".to_string(),
                DiscoveryMethod::Mdns,
            )],
        );
        merge_into(
            &mut acc,
            vec![DiscoveredSpeaker::with_location(
                "192.168.1.10".to_string(),
                "RINCON_ABC123".to_string(),
                "http://192.168.1.10:1400/xml/device_description.xml".to_string(),
                DiscoveryMethod::SsdpMulticast,
            )],
        );

        assert_eq!(acc.len(), 1);
        let merged = acc.get("RINCON_ABC123").expect("merged by normalized uuid");
        assert!(merged.methods.contains(&DiscoveryMethod::Mdns));
        assert!(merged.methods.contains(&DiscoveryMethod::SsdpMulticast));
    }
}
