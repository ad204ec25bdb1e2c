//! Playback latency measurement.
//!
//! Runs one background polling task per `(streamId, speakerIp)` session that
//! opted into video sync. Each tick derives a raw latency sample from
//! `GetPositionInfo`, folds it into an EMA, and emits a [`LatencyEvent`] for
//! WebSocket clients to re-lock video playback against audio.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, LatencyEvent};
use crate::protocol_constants::{
    LATENCY_CONFIDENCE_THRESHOLD_MS, LATENCY_CONFIDENCE_WINDOW, LATENCY_EMA_ALPHA,
    LATENCY_JITTER_WINDOW, LATENCY_POLL_INTERVAL_MS, LATENCY_STALE_TIMEOUT_SECS,
    SONOS_JITTER_BUFFER_MS,
};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::sonos::SonosPlayback;
use crate::stream::StreamManager;
use crate::utils::now_millis;

/// Composite key identifying one monitored playback session.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct SessionKey {
    stream_id: String,
    speaker_ip: String,
}

/// Tracks raw-latency history and EMA state for one monitored session.
struct SessionHistory {
    ema: Option<f64>,
    samples: VecDeque<f64>,
    tracked_epoch: Option<u64>,
    last_sample_at: Option<Instant>,
    stale: bool,
}

impl SessionHistory {
    fn new() -> Self {
        Self {
            ema: None,
            samples: VecDeque::with_capacity(LATENCY_JITTER_WINDOW),
            tracked_epoch: None,
            last_sample_at: None,
            stale: false,
        }
    }

    fn reset_for_new_epoch(&mut self, epoch_id: u64) {
        self.tracked_epoch = Some(epoch_id);
        self.ema = None;
        self.samples.clear();
        self.last_sample_at = None;
        self.stale = false;
    }

    fn record_sample(&mut self, raw_ms: f64) -> (f64, f64, f32) {
        let ema = match self.ema {
            Some(prev) => LATENCY_EMA_ALPHA * raw_ms + (1.0 - LATENCY_EMA_ALPHA) * prev,
            None => raw_ms,
        };
        self.ema = Some(ema);

        if self.samples.len() >= LATENCY_JITTER_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(raw_ms);

        let jitter = stddev(&self.samples);
        let confidence = confidence_score(&self.samples, ema);

        self.last_sample_at = Some(Instant::now());
        self.stale = false;

        (ema, jitter, confidence)
    }
}

/// Population standard deviation of the given samples (0.0 for < 2 samples).
fn stddev(samples: &VecDeque<f64>) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance =
        samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}

/// Fraction of the last `LATENCY_CONFIDENCE_WINDOW` samples within
/// `LATENCY_CONFIDENCE_THRESHOLD_MS` of the current EMA.
fn confidence_score(samples: &VecDeque<f64>, ema: f64) -> f32 {
    let recent: Vec<&f64> = samples
        .iter()
        .rev()
        .take(LATENCY_CONFIDENCE_WINDOW)
        .collect();
    if recent.is_empty() {
        return 0.0;
    }
    let within = recent
        .iter()
        .filter(|v| (***v - ema).abs() <= LATENCY_CONFIDENCE_THRESHOLD_MS)
        .count();
    within as f32 / LATENCY_CONFIDENCE_WINDOW as f32
}

/// Measures and reports playback latency for speakers with video sync enabled.
///
/// One task per `(streamId, speakerIp)`, cancelled independently via a child
/// [`CancellationToken`] so stopping a single speaker doesn't disturb others
/// sharing the stream.
pub struct LatencyMonitor {
    sonos: Arc<dyn SonosPlayback>,
    stream_manager: Arc<StreamManager>,
    emitter: Arc<dyn EventEmitter>,
    cancel_token: CancellationToken,
    spawner: TokioSpawner,
    sessions: DashMap<SessionKey, CancellationToken>,
}

impl LatencyMonitor {
    /// Creates a new LatencyMonitor.
    ///
    /// `cancel_token` is the application-wide shutdown token; each session's
    /// task is cancelled both individually (via `stop_speaker`/`stop_stream`)
    /// and collectively when this token fires.
    pub fn new(
        sonos: Arc<dyn SonosPlayback>,
        stream_manager: Arc<StreamManager>,
        emitter: Arc<dyn EventEmitter>,
        cancel_token: CancellationToken,
        spawner: TokioSpawner,
    ) -> Self {
        Self {
            sonos,
            stream_manager,
            emitter,
            cancel_token,
            spawner,
            sessions: DashMap::new(),
        }
    }

    /// Starts latency monitoring for one speaker within a stream.
    ///
    /// A no-op if this `(streamId, speakerIp)` pair is already monitored.
    pub async fn start_monitoring(&self, stream_id: &str, speaker_ip: &str) {
        let key = SessionKey {
            stream_id: stream_id.to_string(),
            speaker_ip: speaker_ip.to_string(),
        };
        if self.sessions.contains_key(&key) {
            return;
        }

        let Ok(ip_addr) = speaker_ip.parse::<IpAddr>() else {
            log::warn!(
                "[LatencyMonitor] Cannot monitor {} for {}: not a valid IP",
                speaker_ip,
                stream_id
            );
            return;
        };

        let session_token = self.cancel_token.child_token();
        self.sessions.insert(key, session_token.clone());

        let sonos = Arc::clone(&self.sonos);
        let stream_manager = Arc::clone(&self.stream_manager);
        let emitter = Arc::clone(&self.emitter);
        let stream_id = stream_id.to_string();
        let speaker_ip = speaker_ip.to_string();

        log::info!(
            "[LatencyMonitor] Starting latency monitoring: stream={} speaker={}",
            stream_id,
            speaker_ip
        );

        self.spawner.spawn(async move {
            run_session(
                sonos,
                stream_manager,
                emitter,
                stream_id,
                speaker_ip,
                ip_addr,
                session_token,
            )
            .await;
        });
    }

    /// Stops latency monitoring for one speaker within a stream.
    pub async fn stop_speaker(&self, stream_id: &str, speaker_ip: &str) {
        let key = SessionKey {
            stream_id: stream_id.to_string(),
            speaker_ip: speaker_ip.to_string(),
        };
        if let Some((_, token)) = self.sessions.remove(&key) {
            token.cancel();
        }
    }

    /// Stops latency monitoring for every speaker on a stream.
    pub async fn stop_stream(&self, stream_id: &str) {
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|e| e.key().stream_id == stream_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, token)) = self.sessions.remove(&key) {
                token.cancel();
            }
        }
    }
}

/// Emits a `Stale` event once per stale transition, using the last known
/// epoch. No-op while still in the initial `Warming` state (no sample yet).
fn maybe_emit_stale(
    history: &mut SessionHistory,
    emitter: &Arc<dyn EventEmitter>,
    stream_id: &str,
    speaker_ip: &str,
) {
    if history.stale {
        return;
    }
    let Some(last_sample_at) = history.last_sample_at else {
        return;
    };
    if last_sample_at.elapsed() <= Duration::from_secs(LATENCY_STALE_TIMEOUT_SECS) {
        return;
    }
    if let Some(epoch_id) = history.tracked_epoch {
        emitter.emit_latency(LatencyEvent::Stale {
            stream_id: stream_id.to_string(),
            speaker_ip: speaker_ip.to_string(),
            epoch_id,
            timestamp: now_millis(),
        });
    }
    history.stale = true;
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    sonos: Arc<dyn SonosPlayback>,
    stream_manager: Arc<StreamManager>,
    emitter: Arc<dyn EventEmitter>,
    stream_id: String,
    speaker_ip: String,
    ip_addr: IpAddr,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(LATENCY_POLL_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut history = SessionHistory::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::debug!(
                    "[LatencyMonitor] Stopping session: stream={} speaker={}",
                    stream_id,
                    speaker_ip
                );
                return;
            }
            _ = interval.tick() => {}
        }

        let Some(stream) = stream_manager.get_stream(&stream_id) else {
            log::debug!(
                "[LatencyMonitor] Stream {} gone, ending session for {}",
                stream_id,
                speaker_ip
            );
            return;
        };

        let Some(epoch) = stream.timing.current_epoch_for(ip_addr) else {
            maybe_emit_stale(&mut history, &emitter, &stream_id, &speaker_ip);
            continue;
        };

        if history.tracked_epoch != Some(epoch.id) {
            history.reset_for_new_epoch(epoch.id);
        }

        let position = match sonos.get_position_info(&speaker_ip).await {
            Ok(p) => p,
            Err(e) => {
                log::debug!(
                    "[LatencyMonitor] GetPositionInfo failed for {}: {}",
                    speaker_ip,
                    e
                );
                maybe_emit_stale(&mut history, &emitter, &stream_id, &speaker_ip);
                continue;
            }
        };

        let elapsed_ms = Instant::now().duration_since(epoch.audio_epoch).as_millis() as i64;
        let correction_ms = (stream.streaming_buffer_ms + SONOS_JITTER_BUFFER_MS) as i64;
        let raw_ms = ((elapsed_ms - position.rel_time_ms as i64 - correction_ms).max(0)) as f64;

        let (ema, jitter, confidence) = history.record_sample(raw_ms);

        emitter.emit_latency(LatencyEvent::Updated {
            stream_id: stream_id.clone(),
            speaker_ip: speaker_ip.clone(),
            epoch_id: epoch.id,
            latency_ms: ema.round().max(0.0) as u64,
            jitter_ms: jitter.round() as u64,
            confidence,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stddev_of_constant_samples_is_zero() {
        let samples: VecDeque<f64> = [50.0, 50.0, 50.0].into_iter().collect();
        assert_eq!(stddev(&samples), 0.0);
    }

    #[test]
    fn stddev_of_single_sample_is_zero() {
        let samples: VecDeque<f64> = [50.0].into_iter().collect();
        assert_eq!(stddev(&samples), 0.0);
    }

    #[test]
    fn confidence_is_one_when_all_recent_samples_near_ema() {
        let samples: VecDeque<f64> = [100.0, 101.0, 99.0, 100.0, 102.0].into_iter().collect();
        assert_eq!(confidence_score(&samples, 100.0), 1.0);
    }

    #[test]
    fn confidence_drops_when_samples_diverge_from_ema() {
        let samples: VecDeque<f64> = [100.0, 500.0, 500.0, 500.0, 500.0].into_iter().collect();
        assert!(confidence_score(&samples, 100.0) < 0.5);
    }

    #[test]
    fn session_history_resets_on_epoch_change() {
        let mut history = SessionHistory::new();
        history.reset_for_new_epoch(1);
        history.record_sample(100.0);
        assert!(history.ema.is_some());

        history.reset_for_new_epoch(2);
        assert!(history.ema.is_none());
        assert!(history.samples.is_empty());
        assert_eq!(history.tracked_epoch, Some(2));
    }

    #[test]
    fn record_sample_applies_ema_smoothing() {
        let mut history = SessionHistory::new();
        let (ema1, _, _) = history.record_sample(100.0);
        assert_eq!(ema1, 100.0);

        let (ema2, _, _) = history.record_sample(200.0);
        // alpha=0.2: 0.2*200 + 0.8*100 = 120
        assert!((ema2 - 120.0).abs() < f64::EPSILON);
    }
}
