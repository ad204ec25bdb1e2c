//! UPnP GENA subscription lifecycle coordinator.
//!
//! Owns the subscription store and HTTP client, constructs typed events from
//! NOTIFY bodies via [`super::gena_parser`], and applies per-`(speakerIp,
//! service)` sequence-number gating so stale or duplicate NOTIFYs are dropped
//! rather than re-processed.

use dashmap::DashMap;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::SonosEvent;
use crate::protocol_constants::GENA_EVENT_CHANNEL_CAPACITY;

use super::gena_client::GenaClient;
use super::gena_parser::{
    parse_av_transport_events, parse_group_rendering_events, parse_rendering_control_events,
    parse_zone_topology_events,
};
use super::gena_store::GenaSubscriptionStore;
use super::services::SonosService;

/// Errors arising from GENA subscription HTTP operations.
#[derive(Debug, Error)]
pub enum GenaError {
    /// The underlying HTTP request failed.
    #[error("GENA HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// SUBSCRIBE returned a non-success status.
    #[error("GENA subscription failed with status {0}")]
    SubscriptionFailed(u16),

    /// A renewal SUBSCRIBE returned a non-success status.
    #[error("GENA renewal failed with status {0}")]
    RenewalFailed(u16),

    /// The speaker's SUBSCRIBE response was missing the `SID` header.
    #[error("GENA response missing SID header")]
    MissingSid,

    /// A NOTIFY or callback request referenced a token not known to this
    /// server (expired, never issued, or for a different process instance).
    #[error("unknown GENA callback token")]
    UnknownToken,
}

/// Convenient Result alias for GENA operations.
pub type GenaResult<T> = Result<T, GenaError>;

/// Tracks the last accepted `SEQ` value per `(speakerIp, service)` so stale
/// or duplicate NOTIFYs can be dropped. `None` means "accept unconditionally",
/// which is the state immediately after a fresh SUBSCRIBE.
#[derive(Default)]
struct SeqGate {
    last_seq: DashMap<(String, SonosService), u64>,
}

impl SeqGate {
    /// Returns `true` if this sequence number should be accepted (and records
    /// it as the new high-water mark).
    fn accept(&self, ip: &str, service: SonosService, seq: Option<u64>) -> bool {
        let Some(seq) = seq else {
            // No SEQ header: can't gate, accept and don't update state.
            return true;
        };
        let key = (ip.to_string(), service);
        match self.last_seq.get(&key).map(|r| *r) {
            Some(last) if seq <= last => false,
            _ => {
                self.last_seq.insert(key, seq);
                true
            }
        }
    }

    /// Resets gating state for a `(speakerIp, service)` pair so the next
    /// NOTIFY is always accepted. Called whenever a fresh SID is issued.
    fn reset(&self, ip: &str, service: SonosService) {
        self.last_seq.remove(&(ip.to_string(), service));
    }
}

/// Coordinates GENA subscriptions (SUBSCRIBE/RENEW/UNSUBSCRIBE) and NOTIFY
/// event construction for all tracked speakers.
pub struct GenaSubscriptionManager {
    store: GenaSubscriptionStore,
    client: GenaClient,
    seq_gate: SeqGate,
    event_tx: mpsc::Sender<SonosEvent>,
    /// Maps the opaque callback-path token handed to each speaker back to
    /// the subscription's real SID, so the callback server never exposes
    /// SIDs (or the shared-path ambiguity of the legacy single callback) to
    /// the network.
    tokens: DashMap<String, String>,
}

impl GenaSubscriptionManager {
    /// Creates a new manager and its internal event channel.
    ///
    /// The returned receiver carries events the manager raises itself
    /// (currently only `SubscriptionLost`), as opposed to events parsed from
    /// inbound NOTIFY bodies, which are returned directly from
    /// [`Self::handle_notify`].
    pub fn new(http_client: Client) -> (Self, mpsc::Receiver<SonosEvent>) {
        let (event_tx, event_rx) = mpsc::channel(GENA_EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            store: GenaSubscriptionStore::new(),
            client: GenaClient::new(http_client),
            seq_gate: SeqGate::default(),
            event_tx,
            tokens: DashMap::new(),
        };
        (manager, event_rx)
    }

    /// Returns whether a subscription exists for the given IP and service.
    #[must_use]
    pub fn is_subscribed(&self, ip: &str, service: SonosService) -> bool {
        self.store.is_subscribed(ip, service)
    }

    /// Returns all IPs currently subscribed for the given service.
    #[must_use]
    pub fn get_subscribed_ips(&self, service: SonosService) -> Vec<String> {
        self.store.get_subscribed_ips(service)
    }

    /// Subscribes to a service on a speaker, if not already subscribed.
    ///
    /// `gena_base_url` is the scheme+host+port of this process's GENA
    /// callback server (no path). A fresh opaque token is minted per
    /// subscription and the speaker is given `{gena_base_url}/gena/{token}`
    /// as its NOTIFY callback; see [`Self::resolve_token`].
    ///
    /// Uses `try_mark_pending` to avoid duplicate in-flight SUBSCRIBE
    /// requests for the same `(ip, service)` pair.
    pub async fn subscribe(
        &self,
        ip: String,
        service: SonosService,
        gena_base_url: String,
    ) -> GenaResult<()> {
        if self.store.is_subscribed(&ip, service) {
            return Ok(());
        }
        if !self.store.try_mark_pending(&ip, service) {
            return Ok(());
        }

        let token = Uuid::new_v4().to_string();
        let callback_url = format!("{gena_base_url}/gena/{token}");

        let result = self.client.subscribe(&ip, service, &callback_url).await;
        match result {
            Ok(resp) => {
                self.seq_gate.reset(&ip, service);
                self.tokens.insert(token, resp.sid.clone());
                self.store
                    .insert(resp.sid, ip, service, callback_url, resp.timeout_secs);
                Ok(())
            }
            Err(e) => {
                self.store.clear_pending(&ip, service);
                Err(e)
            }
        }
    }

    /// Resolves a callback-path token to the `(speakerIp, service)` pair it
    /// was issued for. Returns `None` for unknown tokens (expired, never
    /// issued, or issued by a prior process instance) — callers should
    /// respond `412 Precondition Failed`.
    #[must_use]
    pub fn resolve_token(&self, token: &str) -> Option<(String, SonosService)> {
        let sid = self.tokens.get(token)?.clone();
        self.store.get(&sid)
    }

    /// Unsubscribes a speaker from a service, swallowing any transport
    /// errors (there's nothing useful the caller can do with them).
    pub async fn unsubscribe_by_ip_and_service(&self, ip: &str, service: SonosService) {
        let Some(sid) = self
            .store
            .get_sids_by_ip(ip)
            .into_iter()
            .find(|sid| matches!(self.store.get(sid), Some((_, s)) if s == service))
        else {
            return;
        };
        self.client.unsubscribe(ip, service, &sid).await;
        self.store.remove(&sid);
        self.tokens.retain(|_, v| v != &sid);
    }

    /// Renews subscriptions expiring within `buffer_secs`, dropping (and
    /// emitting `SubscriptionLost` for) any that fail to renew.
    ///
    /// Also sweeps subscriptions that have already passed their expiry
    /// before a renewal was attempted — a safety net for when this loop
    /// itself stalls (e.g. the process was suspended) — and reports those
    /// the same way.
    pub async fn renew_expiring(&self, buffer_secs: u64) {
        for (sid, ip, service, _callback_url) in self.store.get_expiring(buffer_secs) {
            match self.client.renew(&ip, service, &sid).await {
                Ok(timeout_secs) => self.store.update_expiry(&sid, timeout_secs),
                Err(e) => {
                    log::warn!(
                        "[Gena] Renewal failed for {ip} ({service:?}), dropping subscription: {e}"
                    );
                    self.store.remove(&sid);
                    self.tokens.retain(|_, v| v != &sid);
                    let _ = self
                        .event_tx
                        .send(SonosEvent::SubscriptionLost {
                            speaker_ip: ip,
                            service,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        }

        for (sid, ip, service) in self.store.purge_expired() {
            log::warn!(
                "[Gena] Subscription for {ip} ({service:?}) expired before renewal ran, dropping"
            );
            self.tokens.retain(|_, v| v != &sid);
            let _ = self
                .event_tx
                .send(SonosEvent::SubscriptionLost {
                    speaker_ip: ip,
                    service,
                    reason: "subscription expired before renewal".to_string(),
                })
                .await;
        }
    }

    /// Parses a NOTIFY body for the given SID and returns the typed events it
    /// produced, applying sequence-number gating.
    ///
    /// `get_expected_stream` lets the AVTransport parser detect when a
    /// speaker's current URI has diverged from what we expect it to be
    /// playing (source stolen by another controller).
    pub fn handle_notify<F>(
        &self,
        sid: &str,
        body: &str,
        get_expected_stream: Option<F>,
    ) -> Vec<SonosEvent>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some((ip, service)) = self.store.get(sid) else {
            return Vec::new();
        };

        let seq = extract_seq(body);
        if !self.seq_gate.accept(&ip, service, seq) {
            log::debug!("[Gena] Dropping stale NOTIFY for {ip} ({service:?}), seq={seq:?}");
            return Vec::new();
        }

        match service {
            SonosService::AVTransport => parse_av_transport_events(&ip, body, get_expected_stream),
            SonosService::GroupRenderingControl => parse_group_rendering_events(&ip, body),
            SonosService::RenderingControl => parse_rendering_control_events(&ip, body),
            SonosService::ZoneGroupTopology => parse_zone_topology_events(body),
        }
    }
}

/// Extracts the `SEQ` header value from a raw NOTIFY body representation.
///
/// GENA carries `SEQ` as an HTTP header rather than in the XML body; callers
/// that have access to the request headers pass the value through a
/// `SEQ: <n>` line prepended to the body by the HTTP layer (see
/// `api::http::handle_gena_notify`).
fn extract_seq(body: &str) -> Option<u64> {
    body.lines()
        .next()
        .and_then(|line| line.strip_prefix("SEQ: "))
        .and_then(|v| v.parse().ok())
}
