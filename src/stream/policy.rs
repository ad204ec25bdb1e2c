//! Per-stream latency/backpressure policy.
//!
//! A stream negotiates one of two latency modes at HANDSHAKE time. The mode
//! picks a fixed bundle of cadence parameters rather than exposing each one
//! individually on the wire — callers choose "quality" (favor a deep buffer,
//! tolerate a pause hint to the producer) or "realtime" (favor a shallow
//! buffer, tolerate dropped frames) and the server derives the rest.

use serde::Deserialize;

/// Negotiated latency/quality tradeoff for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMode {
    /// Deep ring buffer, no catch-up, backpressure pauses the producer.
    Quality,
    /// Shallow ring buffer, catch-up discards backlog, drops frames silently
    /// under pressure instead of pausing the producer.
    Realtime,
}

impl Default for LatencyMode {
    fn default() -> Self {
        Self::Quality
    }
}

impl LatencyMode {
    /// Parses a HANDSHAKE `latencyMode` string, defaulting to `quality` for
    /// anything unrecognized rather than rejecting the handshake.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("realtime") => Self::Realtime,
            _ => Self::Quality,
        }
    }
}

/// What happens when the cadence ring buffer can't absorb incoming frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureBehavior {
    /// Ask the producer to pause via a `PAUSE_PRODUCER` WS hint, resuming it
    /// once the buffer drains below the low-water mark.
    PauseProducer,
    /// Drop the oldest buffered frames to keep pace; never hints the producer.
    DropOldest,
}

/// Cadence parameters derived from a stream's [`LatencyMode`].
///
/// See the ring-buffer/catch-up/backpressure table this mirrors: quality
/// mode favors a deep buffer and never discards backlog; realtime mode
/// favors low latency and discards backlog rather than letting it grow.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Ring buffer capacity, expressed as a duration of audio.
    pub ring_buffer_ms: u64,
    /// Queued backlog (ms) above which catch-up discards frames. `None`
    /// means catch-up is disabled for this mode.
    pub catch_up_trigger_ms: Option<u64>,
    /// Backlog (ms) catch-up discards down to once triggered.
    pub catch_up_target_ms: Option<u64>,
    /// What to do when the buffer can't absorb incoming frames.
    pub backpressure: BackpressureBehavior,
    /// Hard cap (ms) on queued backlog before the oldest frames are discarded
    /// outright, independent of catch-up.
    pub queue_cap_ms: u64,
}

/// Hysteresis ratio between the high-water (pause) and low-water (resume)
/// marks for `PauseProducer` backpressure, applied to `queue_cap_ms`.
pub const BACKPRESSURE_HYSTERESIS_RATIO: f64 = 0.67;

impl Policy {
    /// Derives the cadence policy for a given latency mode.
    #[must_use]
    pub const fn for_mode(mode: LatencyMode) -> Self {
        match mode {
            LatencyMode::Quality => Self {
                ring_buffer_ms: 10_000,
                catch_up_trigger_ms: None,
                catch_up_target_ms: None,
                backpressure: BackpressureBehavior::PauseProducer,
                queue_cap_ms: 2_000,
            },
            LatencyMode::Realtime => Self {
                ring_buffer_ms: 3_000,
                catch_up_trigger_ms: Some(1_000),
                catch_up_target_ms: Some(200),
                backpressure: BackpressureBehavior::DropOldest,
                queue_cap_ms: 500,
            },
        }
    }

    /// The backpressure low-water mark in ms, below which a paused producer
    /// is resumed. Only meaningful when `backpressure == PauseProducer`.
    #[must_use]
    pub fn resume_threshold_ms(&self) -> u64 {
        (self.queue_cap_ms as f64 * BACKPRESSURE_HYSTERESIS_RATIO) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_to_quality() {
        assert_eq!(LatencyMode::parse(None), LatencyMode::Quality);
        assert_eq!(LatencyMode::parse(Some("bogus")), LatencyMode::Quality);
    }

    #[test]
    fn parse_recognizes_realtime() {
        assert_eq!(LatencyMode::parse(Some("realtime")), LatencyMode::Realtime);
    }

    #[test]
    fn quality_policy_disables_catch_up_and_pauses_producer() {
        let policy = Policy::for_mode(LatencyMode::Quality);
        assert_eq!(policy.ring_buffer_ms, 10_000);
        assert!(policy.catch_up_trigger_ms.is_none());
        assert_eq!(policy.backpressure, BackpressureBehavior::PauseProducer);
        assert_eq!(policy.queue_cap_ms, 2_000);
    }

    #[test]
    fn realtime_policy_enables_catch_up_and_drops_frames() {
        let policy = Policy::for_mode(LatencyMode::Realtime);
        assert_eq!(policy.ring_buffer_ms, 3_000);
        assert_eq!(policy.catch_up_trigger_ms, Some(1_000));
        assert_eq!(policy.catch_up_target_ms, Some(200));
        assert_eq!(policy.backpressure, BackpressureBehavior::DropOldest);
        assert_eq!(policy.queue_cap_ms, 500);
    }

    #[test]
    fn resume_threshold_applies_hysteresis_ratio() {
        let policy = Policy::for_mode(LatencyMode::Quality);
        assert_eq!(policy.resume_threshold_ms(), 1_340);
    }
}
