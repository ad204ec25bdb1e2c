//! Domain types shared across Sonos control, topology, and event parsing.

use std::str::FromStr;

use serde::Serialize;

/// AVTransport playback state, as reported by `GetTransportInfo` and GENA
/// `LastChange` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    Playing,
    Paused,
    Stopped,
    Transitioning,
    NoMediaPresent,
}

impl FromStr for TransportState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAYING" => Ok(Self::Playing),
            "PAUSED_PLAYBACK" => Ok(Self::Paused),
            "STOPPED" => Ok(Self::Stopped),
            "TRANSITIONING" => Ok(Self::Transitioning),
            "NO_MEDIA_PRESENT" => Ok(Self::NoMediaPresent),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Playing => "PLAYING",
            Self::Paused => "PAUSED_PLAYBACK",
            Self::Stopped => "STOPPED",
            Self::Transitioning => "TRANSITIONING",
            Self::NoMediaPresent => "NO_MEDIA_PRESENT",
        };
        write!(f, "{s}")
    }
}

/// A member speaker within a zone group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneGroupMember {
    pub uuid: String,
    pub ip: String,
    pub zone_name: String,
    pub model: String,
}

/// A Sonos zone group: one coordinator plus zero or more grouped members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneGroup {
    pub id: String,
    pub name: String,
    pub coordinator_uuid: String,
    pub coordinator_ip: String,
    pub members: Vec<ZoneGroupMember>,
}

/// Result of `GetPositionInfo`, used to derive playback latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionInfo {
    pub track: u32,
    pub track_duration: String,
    pub track_uri: String,
    pub rel_time: String,
    pub rel_time_ms: u64,
}

impl PositionInfo {
    /// Parses a UPnP "H:MM:SS" (or "HH:MM:SS") timestamp into milliseconds.
    ///
    /// Returns 0 for malformed input rather than failing; position info is
    /// best-effort telemetry, not a control input.
    #[must_use]
    pub fn parse_time_to_ms(time: &str) -> u64 {
        let parts: Vec<&str> = time.split(':').collect();
        if parts.len() != 3 {
            return 0;
        }
        let hours: u64 = parts[0].parse().unwrap_or(0);
        let minutes: u64 = parts[1].parse().unwrap_or(0);
        let seconds: u64 = parts[2].parse().unwrap_or(0);
        ((hours * 3600) + (minutes * 60) + seconds) * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_state_round_trips_known_values() {
        assert_eq!("PLAYING".parse(), Ok(TransportState::Playing));
        assert_eq!("PAUSED_PLAYBACK".parse(), Ok(TransportState::Paused));
        assert_eq!("STOPPED".parse(), Ok(TransportState::Stopped));
        assert_eq!(TransportState::Playing.to_string(), "PLAYING");
    }

    #[test]
    fn transport_state_rejects_unknown_value() {
        assert_eq!("SOMETHING_ELSE".parse::<TransportState>(), Err(()));
    }

    #[test]
    fn parse_time_to_ms_parses_hms() {
        assert_eq!(PositionInfo::parse_time_to_ms("0:01:30"), 90_000);
        assert_eq!(PositionInfo::parse_time_to_ms("1:00:00"), 3_600_000);
    }

    #[test]
    fn parse_time_to_ms_malformed_returns_zero() {
        assert_eq!(PositionInfo::parse_time_to_ms("not-a-time"), 0);
        assert_eq!(PositionInfo::parse_time_to_ms(""), 0);
    }
}
