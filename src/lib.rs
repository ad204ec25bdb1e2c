//! Streaming coordinator core - shared library for the browser-to-Sonos
//! audio streaming system.
//!
//! This crate bridges a browser audio source to Sonos speakers: speaker
//! discovery and control (UPnP/SOAP), GENA event subscription, audio
//! transcoding and pacing, and the HTTP/WS surface a frontend talks to. It
//! is designed to back a standalone headless server binary.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`runtime`]: Task spawning abstraction for async runtime independence
//! - [`events`]: Event system for real-time client communication
//! - [`context`]: Network configuration and URL building
//! - [`state`]: Core application state and configuration
//! - [`sonos`]: Sonos speaker control and discovery (UPnP/SOAP)
//! - [`stream`]: Audio streaming and transcoding
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! The crate defines several traits to decouple core logic from transport
//! specifics:
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): Spawning background tasks
//! - [`EventEmitter`](events::EventEmitter): Emitting domain events
//! - [`IpDetector`](context::IpDetector): Local IP detection
//!
//! Each trait has a default implementation suitable for the standalone
//! server binary.

// Allow missing docs for now during migration - will be cleaned up later
#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod context;
pub mod error;
pub mod events;
pub mod protocol_constants;
pub mod runtime;
pub mod services;
pub mod sonos;
pub mod state;
pub mod stream;
pub mod streaming_runtime;
pub mod utils;

// Re-export commonly used types at the crate root
pub use context::{IpDetector, LocalIpDetector, NetworkContext, NetworkError, UrlBuilder};
pub use error::{
    CoordinatorError, CoordinatorResult, DiscoveryResult, ErrorCode, GenaResult, SoapResult,
};
pub use events::{
    BroadcastEvent, BroadcastEventBridge, EventEmitter, LatencyEvent, NetworkEvent, NetworkHealth,
    SonosEvent, SpeakerRemovalReason, StreamEvent, TopologyEvent,
};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use state::{Config, SonosState, StreamingConfig};
pub use utils::{now_millis, validate_speaker_ip, IpValidationError};

// Re-export Sonos types
pub use sonos::discovery::{probe_speaker_by_ip, Speaker};
pub use sonos::types::{TransportState, ZoneGroup};
pub use sonos::{SonosClient, SonosClientImpl, SonosPlayback, SonosService, SonosTopologyClient};

// Re-export service types
pub use services::playback_session_store::PlaybackSession;

// Re-export stream types
pub use stream::{AudioCodec, AudioFormat, StreamMetadata, TaggedFrame};

// Re-export bootstrap types
pub use bootstrap::{bootstrap_services, bootstrap_services_with_network, BootstrappedServices};

// Re-export streaming runtime
pub use streaming_runtime::StreamingRuntime;

// Re-export API types
pub use api::{
    start_gena_server, start_server, AppState, AppStateBuilder, ServerError, WsConnectionManager,
};
