//! Event system for real-time client communication.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services to emit events
//! - Event types for various domains (streams, Sonos, network, etc.)
//!
//! The actual transport implementation (WebSocket, SSE, etc.) is handled
//! separately in the `api` module using [`BroadcastEventBridge`].

mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events broadcast to clients.
///
/// This enum categorizes all real-time events that can be sent to connected
/// clients. Each category has its own inner event type with specific variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Events from Sonos speakers (GENA notifications).
    Sonos(SonosEvent),

    /// Events related to audio streaming.
    Stream(StreamEvent),

    /// Events related to network health and connectivity.
    Network(NetworkEvent),

    /// Events from topology discovery.
    Topology(TopologyEvent),

    /// Events related to latency measurement.
    Latency(LatencyEvent),
}

use crate::sonos::services::SonosService;
use crate::sonos::types::{TransportState, ZoneGroup};

/// Events from Sonos speakers via GENA notifications.
///
/// These are the parsed, typed facts extracted from NOTIFY bodies (or raised
/// internally by the subscription manager itself, e.g. `SubscriptionLost`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SonosEvent {
    /// AVTransport reported a new transport state and/or current track URI.
    TransportState {
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        state: TransportState,
        #[serde(rename = "currentUri", skip_serializing_if = "Option::is_none")]
        current_uri: Option<String>,
        timestamp: u64,
    },
    /// The playing URI diverged from what this coordinator expects to be
    /// streaming — someone else changed the source out from under us.
    SourceChanged {
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        #[serde(rename = "currentUri")]
        current_uri: String,
        #[serde(rename = "expectedUri")]
        expected_uri: Option<String>,
        timestamp: u64,
    },
    /// Group (or Master-channel rendering control) volume changed.
    GroupVolume {
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        volume: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        fixed: Option<bool>,
        timestamp: u64,
    },
    /// Group (or Master-channel rendering control) mute state changed.
    GroupMute {
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        muted: bool,
        timestamp: u64,
    },
    /// Zone group topology changed; carries the full new snapshot.
    ZoneGroupsUpdated {
        groups: Vec<ZoneGroup>,
        timestamp: u64,
    },
    /// A GENA subscription was lost (expired without renewal, or the
    /// speaker dropped it) and needs to be re-established.
    SubscriptionLost {
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        service: SonosService,
        reason: String,
    },
}

/// Why a speaker was removed from a synchronized playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpeakerRemovalReason {
    /// The speaker left the sync session voluntarily (API request).
    Requested,
    /// The speaker's Sonos source changed away from the expected stream.
    SourceChanged,
    /// The speaker became unreachable (SOAP/network failure).
    Unreachable,
    /// The speaker's GENA subscription was lost and could not be renewed.
    SubscriptionLost,
}

/// Events related to audio stream state changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    /// A new stream was created.
    Created {
        /// The unique identifier for the stream.
        #[serde(rename = "streamId")]
        stream_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A stream was removed/ended.
    Ended {
        /// The unique identifier for the stream.
        #[serde(rename = "streamId")]
        stream_id: String,
        /// Why the stream ended (e.g. `"producer_timeout"`). `None` for a
        /// normal client-initiated stop.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The cadence buffer crossed its high-water mark in quality mode; asks
    /// the producer to stop sending frames until `ResumeProducer` follows.
    PauseProducer {
        #[serde(rename = "streamId")]
        stream_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The cadence buffer drained below the low-water mark; the producer may
    /// resume sending frames.
    ResumeProducer {
        #[serde(rename = "streamId")]
        stream_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Playback started on a speaker.
    PlaybackStarted {
        /// The stream ID being played.
        #[serde(rename = "streamId")]
        stream_id: String,
        /// The speaker IP address receiving the stream.
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        /// The full URL the speaker is fetching audio from.
        #[serde(rename = "streamUrl")]
        stream_url: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Playback stopped on a speaker.
    PlaybackStopped {
        /// The stream ID that was stopped.
        #[serde(rename = "streamId")]
        stream_id: String,
        /// The speaker IP address that stopped playback.
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Network health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum NetworkHealth {
    /// All systems operational.
    #[default]
    Ok,
    /// Speakers discovered but communication is failing.
    Degraded,
}

/// Events related to network health and speaker reachability.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NetworkEvent {
    /// Network health status changed.
    HealthChanged {
        /// Current health status.
        health: NetworkHealth,
        /// Human-readable reason for the status (if degraded).
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events from topology discovery operations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TopologyEvent {
    /// Zone groups discovered or updated.
    GroupsDiscovered {
        /// Number of groups discovered.
        #[serde(rename = "groupCount")]
        group_count: usize,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events related to audio latency measurement.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LatencyEvent {
    /// Latency measurement updated for a speaker.
    Updated {
        /// The stream ID being measured.
        #[serde(rename = "streamId")]
        stream_id: String,
        /// The speaker IP address where latency was measured.
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        /// The playback epoch ID.
        #[serde(rename = "epochId")]
        epoch_id: u64,
        /// Measured latency in milliseconds.
        #[serde(rename = "latencyMs")]
        latency_ms: u64,
        /// Measurement jitter in milliseconds.
        #[serde(rename = "jitterMs")]
        jitter_ms: u64,
        /// Confidence score (0.0 - 1.0).
        confidence: f32,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Latency measurement has gone stale.
    Stale {
        /// The stream ID that went stale.
        #[serde(rename = "streamId")]
        stream_id: String,
        /// The speaker IP address that went stale.
        #[serde(rename = "speakerIp")]
        speaker_ip: String,
        /// The epoch ID that went stale.
        #[serde(rename = "epochId")]
        epoch_id: u64,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

// From implementations for converting inner events to BroadcastEvent
impl From<SonosEvent> for BroadcastEvent {
    fn from(event: SonosEvent) -> Self {
        BroadcastEvent::Sonos(event)
    }
}

impl From<StreamEvent> for BroadcastEvent {
    fn from(event: StreamEvent) -> Self {
        BroadcastEvent::Stream(event)
    }
}

impl From<NetworkEvent> for BroadcastEvent {
    fn from(event: NetworkEvent) -> Self {
        BroadcastEvent::Network(event)
    }
}

impl From<TopologyEvent> for BroadcastEvent {
    fn from(event: TopologyEvent) -> Self {
        BroadcastEvent::Topology(event)
    }
}

impl From<LatencyEvent> for BroadcastEvent {
    fn from(event: LatencyEvent) -> Self {
        BroadcastEvent::Latency(event)
    }
}
