//! Background speaker discovery and zone-group topology tracking.
//!
//! Periodically re-discovers speakers, fetches the canonical zone-group
//! description from a reachable coordinator, and diffs it against the last
//! known snapshot so subscribers only see a [`TopologyEvent::GroupsDiscovered`]
//! when membership actually changed. Also keeps GENA `GroupRenderingControl`
//! subscriptions in sync with whichever IPs are currently acting as group
//! coordinators, and runs the periodic renewal loop for every subscription
//! this process holds (coordinators and, transiently, sync-session members).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::context::NetworkContext;
use crate::events::{EventEmitter, NetworkEvent, NetworkHealth, SonosEvent, TopologyEvent};
use crate::protocol_constants::{GENA_RENEWAL_BUFFER_SECS, GENA_RENEWAL_CHECK_SECS};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::sonos::gena::GenaSubscriptionManager;
use crate::sonos::services::SonosService;
use crate::sonos::types::ZoneGroup;
use crate::sonos::SonosTopologyClient;
use crate::state::SonosState;
use crate::utils::now_millis;

/// Configuration for [`TopologyMonitor`], separated from its constructed
/// dependencies so callers can pass interval/network/plumbing together.
pub struct TopologyMonitorConfig {
    /// Interval between automatic topology refreshes, in seconds.
    pub topology_refresh_interval_secs: u64,
    /// Network configuration, used to build the GENA callback base URL.
    pub network: NetworkContext,
    /// Notifier used to trigger a refresh outside the normal interval
    /// (e.g. after a GENA `SubscriptionLost` event).
    pub refresh_notify: Arc<Notify>,
    /// HTTP client shared with the rest of the Sonos control surface.
    pub http_client: Client,
    /// Task spawner for background loops.
    pub spawner: TokioSpawner,
}

/// Live network health, as last computed by the discovery loop.
#[derive(Debug, Clone)]
pub struct NetworkHealthState {
    /// Current health status.
    pub health: NetworkHealth,
    /// Human-readable reason, present only when `health` is not `Ok`.
    pub reason: Option<String>,
}

impl Default for NetworkHealthState {
    fn default() -> Self {
        Self {
            health: NetworkHealth::Ok,
            reason: None,
        }
    }
}

/// Discovers speakers, tracks zone-group topology, and manages
/// `GroupRenderingControl` GENA subscriptions for discovered coordinators.
pub struct TopologyMonitor {
    sonos: Arc<dyn SonosTopologyClient>,
    gena_manager: Arc<GenaSubscriptionManager>,
    sonos_state: Arc<SonosState>,
    emitter: Arc<dyn EventEmitter>,
    config: TopologyMonitorConfig,
    health: RwLock<NetworkHealthState>,
    cancel_token: CancellationToken,
}

impl TopologyMonitor {
    /// Creates a new `TopologyMonitor`. Does not start any background work;
    /// call [`Self::start_monitoring`] and [`Self::start_renewal_task`] once
    /// wired into an `Arc`.
    pub fn new(
        sonos: Arc<dyn SonosTopologyClient>,
        gena_manager: Arc<GenaSubscriptionManager>,
        sonos_state: Arc<SonosState>,
        emitter: Arc<dyn EventEmitter>,
        config: TopologyMonitorConfig,
    ) -> Self {
        Self {
            sonos,
            gena_manager,
            sonos_state,
            emitter,
            config,
            health: RwLock::new(NetworkHealthState::default()),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Returns the shared HTTP client (exposed for manual IP probing).
    pub fn http_client(&self) -> &Client {
        &self.config.http_client
    }

    /// Returns the most recently computed network health.
    #[must_use]
    pub fn get_network_health(&self) -> NetworkHealthState {
        self.health.read().clone()
    }

    /// Wakes the refresh loop immediately instead of waiting for the next
    /// interval tick.
    pub fn trigger_refresh(&self) {
        self.config.refresh_notify.notify_one();
    }

    /// Starts the periodic topology discovery loop.
    ///
    /// Runs on the provided spawner and continues until the monitor's
    /// internal cancellation token is triggered by [`Self::shutdown`].
    pub fn start_monitoring(self: Arc<Self>) {
        let this = Arc::clone(&self);
        self.config.spawner.spawn(async move {
            this.run_discovery_loop().await;
        });
    }

    /// Starts the periodic GENA subscription renewal loop.
    pub fn start_renewal_task(&self) {
        let gena_manager = Arc::clone(&self.gena_manager);
        let cancel_token = self.cancel_token.clone();
        self.config.spawner.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GENA_RENEWAL_CHECK_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => return,
                    _ = interval.tick() => {
                        gena_manager.renew_expiring(GENA_RENEWAL_BUFFER_SECS).await;
                    }
                }
            }
        });
    }

    /// Unsubscribes every `GroupRenderingControl` subscription this monitor
    /// holds and stops the background loops. Safe to call once.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        let ips = self
            .gena_manager
            .get_subscribed_ips(SonosService::GroupRenderingControl);
        for ip in ips {
            self.gena_manager
                .unsubscribe_by_ip_and_service(&ip, SonosService::GroupRenderingControl)
                .await;
        }
    }

    async fn run_discovery_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.topology_refresh_interval_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return,
                _ = interval.tick() => {}
                () = self.config.refresh_notify.notified() => {}
            }

            self.refresh_once().await;
        }
    }

    async fn refresh_once(&self) {
        let speakers = match self.sonos.discover_speakers().await {
            Ok(speakers) => {
                self.set_health(NetworkHealth::Ok, None);
                speakers
            }
            Err(e) => {
                log::warn!("[Topology] Speaker discovery failed: {}", e);
                self.set_health(NetworkHealth::Degraded, Some(e.to_string()));
                return;
            }
        };

        if speakers.is_empty() {
            return;
        }

        let mut groups: Option<Vec<ZoneGroup>> = None;
        for speaker in &speakers {
            match self.sonos.get_zone_groups(&speaker.ip).await {
                Ok(found) => {
                    groups = Some(found);
                    break;
                }
                Err(e) => {
                    log::debug!(
                        "[Topology] GetZoneGroupState failed for {}: {}",
                        speaker.ip,
                        e
                    );
                }
            }
        }

        let Some(groups) = groups else {
            log::warn!("[Topology] No reachable coordinator returned zone-group state");
            self.set_health(
                NetworkHealth::Degraded,
                Some("no reachable coordinator for zone-group state".to_string()),
            );
            return;
        };
        self.set_health(NetworkHealth::Ok, None);

        let changed = {
            let current = self.sonos_state.groups.read();
            *current != groups
        };

        if changed {
            {
                let mut current = self.sonos_state.groups.write();
                *current = groups.clone();
            }

            let valid_ips: HashSet<String> = speakers.iter().map(|s| s.ip.clone()).collect();
            self.sonos_state.cleanup_stale_entries(&valid_ips);

            self.emitter.emit_topology(TopologyEvent::GroupsDiscovered {
                group_count: groups.len(),
                timestamp: now_millis(),
            });
            self.emitter.emit_sonos(SonosEvent::ZoneGroupsUpdated {
                groups: groups.clone(),
                timestamp: now_millis(),
            });

            self.sync_group_rendering_subscriptions(&groups).await;
        }
    }

    /// Ensures every current coordinator is subscribed to
    /// `GroupRenderingControl` and that no stale coordinator (one that has
    /// since become a member, or dropped off the network) stays subscribed.
    async fn sync_group_rendering_subscriptions(&self, groups: &[ZoneGroup]) {
        let callback_url = self.config.network.gena_base_url();
        let coordinator_ips: HashSet<String> =
            groups.iter().map(|g| g.coordinator_ip.clone()).collect();

        let subscribed_ips: HashSet<String> = self
            .gena_manager
            .get_subscribed_ips(SonosService::GroupRenderingControl)
            .into_iter()
            .collect();

        for ip in subscribed_ips.difference(&coordinator_ips) {
            self.gena_manager
                .unsubscribe_by_ip_and_service(ip, SonosService::GroupRenderingControl)
                .await;
        }

        for ip in &coordinator_ips {
            if self
                .gena_manager
                .is_subscribed(ip, SonosService::GroupRenderingControl)
            {
                continue;
            }
            if let Err(e) = self
                .gena_manager
                .subscribe(
                    ip.clone(),
                    SonosService::GroupRenderingControl,
                    callback_url.clone(),
                )
                .await
            {
                log::warn!(
                    "[Topology] Failed to subscribe GroupRenderingControl for {}: {}",
                    ip,
                    e
                );
            }
        }
    }

    fn set_health(&self, health: NetworkHealth, reason: Option<String>) {
        let changed = {
            let current = self.health.read();
            current.health != health || current.reason != reason
        };
        if !changed {
            return;
        }
        *self.health.write() = NetworkHealthState {
            health,
            reason: reason.clone(),
        };
        self.emitter.emit_network(NetworkEvent::HealthChanged {
            health,
            reason,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NetworkContext;
    use crate::events::NoopEventEmitter;
    use crate::sonos::discovery::{DiscoveryError, Speaker};
    use crate::sonos::soap::SoapResult;
    use crate::sonos::traits::{SonosDiscovery, SonosTopology};
    use async_trait::async_trait;

    struct FakeTopologyClient {
        speakers: Vec<Speaker>,
        groups: Vec<ZoneGroup>,
        fail_discovery: bool,
    }

    #[async_trait]
    impl SonosDiscovery for FakeTopologyClient {
        async fn discover_speakers(&self) -> crate::sonos::discovery::DiscoveryResult<Vec<Speaker>> {
            if self.fail_discovery {
                return Err(DiscoveryError::NoInterfaces);
            }
            Ok(self.speakers.clone())
        }
    }

    #[async_trait]
    impl SonosTopology for FakeTopologyClient {
        async fn get_zone_groups(&self, _ip: &str) -> SoapResult<Vec<ZoneGroup>> {
            Ok(self.groups.clone())
        }
    }

    fn make_monitor(client: FakeTopologyClient) -> TopologyMonitor {
        let (gena_manager, _rx) = GenaSubscriptionManager::new(Client::new());
        TopologyMonitor::new(
            Arc::new(client),
            Arc::new(gena_manager),
            Arc::new(SonosState::default()),
            Arc::new(NoopEventEmitter),
            TopologyMonitorConfig {
                topology_refresh_interval_secs: 30,
                network: NetworkContext::for_test(),
                refresh_notify: Arc::new(Notify::new()),
                http_client: Client::new(),
                spawner: TokioSpawner::current(),
            },
        )
    }

    fn sample_group() -> ZoneGroup {
        ZoneGroup {
            id: "RINCON_1:0".to_string(),
            name: "Living Room".to_string(),
            coordinator_uuid: "RINCON_1".to_string(),
            coordinator_ip: "192.168.1.50".to_string(),
            members: vec![],
        }
    }

    #[tokio::test]
    async fn refresh_updates_state_on_change() {
        let monitor = make_monitor(FakeTopologyClient {
            speakers: vec![Speaker {
                ip: "192.168.1.50".to_string(),
                name: "Living Room".to_string(),
                uuid: "RINCON_1".to_string(),
                model_name: None,
            }],
            groups: vec![sample_group()],
            fail_discovery: false,
        });

        monitor.refresh_once().await;

        assert_eq!(monitor.sonos_state.groups.read().len(), 1);
        assert_eq!(monitor.get_network_health().health, NetworkHealth::Ok);
    }

    #[tokio::test]
    async fn refresh_marks_degraded_on_discovery_failure() {
        let monitor = make_monitor(FakeTopologyClient {
            speakers: vec![],
            groups: vec![],
            fail_discovery: true,
        });

        monitor.refresh_once().await;

        let health = monitor.get_network_health();
        assert_eq!(health.health, NetworkHealth::Degraded);
        assert!(health.reason.is_some());
    }

    #[tokio::test]
    async fn refresh_is_noop_when_groups_unchanged() {
        let monitor = make_monitor(FakeTopologyClient {
            speakers: vec![Speaker {
                ip: "192.168.1.50".to_string(),
                name: "Living Room".to_string(),
                uuid: "RINCON_1".to_string(),
                model_name: None,
            }],
            groups: vec![sample_group()],
            fail_discovery: false,
        });

        monitor.refresh_once().await;
        monitor.refresh_once().await;

        assert_eq!(monitor.sonos_state.groups.read().len(), 1);
    }
}
