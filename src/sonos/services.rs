//! Sonos UPnP service definitions.
//!
//! This module provides a single source of truth for Sonos service URNs,
//! control paths, and event paths used by both SOAP commands and GENA subscriptions.

use serde::Serialize;

/// Sonos UPnP services used for control and event subscriptions.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SonosService {
    /// Audio/Video transport control (play, pause, stop, seek).
    AVTransport,
    /// Group volume and mute control (for coordinator speakers).
    GroupRenderingControl,
    /// Individual speaker volume and mute control.
    /// Used for per-room control during synchronized multi-room playback.
    RenderingControl,
    /// Zone group topology and membership information.
    ZoneGroupTopology,
}

impl SonosService {
    /// Returns the UPnP service URN for SOAP requests.
    #[must_use]
    pub fn urn(&self) -> &'static str {
        match self {
            Self::AVTransport => "urn:schemas-upnp-org:service:AVTransport:1",
            Self::GroupRenderingControl => "urn:schemas-upnp-org:service:GroupRenderingControl:1",
            Self::RenderingControl => "urn:schemas-upnp-org:service:RenderingControl:1",
            Self::ZoneGroupTopology => "urn:schemas-upnp-org:service:ZoneGroupTopology:1",
        }
    }

    /// Returns the UPnP control endpoint path for SOAP requests.
    #[must_use]
    pub fn control_path(&self) -> &'static str {
        match self {
            Self::AVTransport => "/MediaRenderer/AVTransport/Control",
            Self::GroupRenderingControl => "/MediaRenderer/GroupRenderingControl/Control",
            Self::RenderingControl => "/MediaRenderer/RenderingControl/Control",
            Self::ZoneGroupTopology => "/ZoneGroupTopology/Control",
        }
    }

    /// Returns the UPnP event endpoint path for GENA subscriptions.
    #[must_use]
    pub fn event_path(&self) -> &'static str {
        match self {
            Self::AVTransport => "/MediaRenderer/AVTransport/Event",
            Self::GroupRenderingControl => "/MediaRenderer/GroupRenderingControl/Event",
            Self::RenderingControl => "/MediaRenderer/RenderingControl/Event",
            Self::ZoneGroupTopology => "/ZoneGroupTopology/Event",
        }
    }

    /// Returns a human-readable name for this service.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AVTransport => "AVTransport",
            Self::GroupRenderingControl => "GroupRenderingControl",
            Self::RenderingControl => "RenderingControl",
            Self::ZoneGroupTopology => "ZoneGroupTopology",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_SERVICES: [SonosService; 4] = [
        SonosService::AVTransport,
        SonosService::GroupRenderingControl,
        SonosService::RenderingControl,
        SonosService::ZoneGroupTopology,
    ];

    #[test]
    fn urn_identifies_the_upnp_service_version() {
        for service in ALL_SERVICES {
            assert!(service.urn().starts_with("urn:schemas-upnp-org:service:"));
            assert!(service.urn().ends_with(":1"));
        }
    }

    #[test]
    fn control_and_event_paths_share_the_same_service_segment() {
        // GENA subscribes to <path>/Event and SOAP controls <path>/Control on
        // the same UPnP service; a mismatch here would subscribe to one
        // service while controlling another.
        for service in ALL_SERVICES {
            let control = service.control_path();
            let event = service.event_path();
            assert!(control.ends_with("/Control"));
            assert!(event.ends_with("/Event"));
            assert_eq!(
                control.trim_end_matches("/Control"),
                event.trim_end_matches("/Event")
            );
        }
    }

    #[test]
    fn name_is_human_readable_and_distinct() {
        let names: Vec<&str> = ALL_SERVICES.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), names.iter().collect::<std::collections::HashSet<_>>().len());
    }
}
