//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services for business logic.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant as TokioInstant, MissedTickBehavior};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::response::{api_error, api_ok, api_success};
use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::{ErrorCode, CoordinatorError, CoordinatorResult};
use crate::protocol_constants::{
    APP_NAME, ICY_METAINT, MAX_CADENCE_QUEUE_SIZE, SERVICE_ID, WAV_STREAM_SIZE_MAX,
};
use crate::stream::{
    apply_fade_in, create_fade_out_frame, create_wav_header, crossfade_samples,
    extract_last_sample_pair, is_crossfade_compatible, AudioCodec, AudioFormat,
    IcyMetadataInjector, TaggedFrame,
};
use crate::utils::validate_speaker_ip;

/// Boxed stream type for audio data with ICY metadata support.
type AudioStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Threshold for counting delivery gaps (100ms).
/// PCM at 48kHz stereo 16-bit = 192KB/s, so 100ms = ~19KB of audio.
const DELIVERY_GAP_THRESHOLD_MS: u64 = 100;

/// Only log gaps exceeding this threshold to avoid log spam (500ms).
const DELIVERY_GAP_LOG_THRESHOLD_MS: u64 = 500;

/// Creates an IO error for broadcast channel lag.
///
/// Logs a warning and returns a formatted error. Centralizes the handling
/// of `BroadcastStreamRecvError::Lagged` to avoid duplication.
fn lagged_error(frames: u64) -> std::io::Error {
    log::warn!(
        "[Stream] Broadcast receiver lagged by {} frames - possible CPU contention",
        frames
    );
    std::io::Error::other(format!("lagged by {} frames", frames))
}

/// Creates a WAV audio stream with fixed-cadence output and crossfade on silence transitions.
///
/// Maintains real-time cadence regardless of input timing:
/// - Incoming frames are queued (bounded to `queue_size`)
/// - Metronome ticks every `frame_duration_ms`
/// - On each tick: send queued frame if available, else send silence
///
/// Crossfade on silence transitions:
/// - When entering silence: emits a fade-out frame from the last audio sample to zero
/// - When exiting silence: applies fade-in to the first audio frame
///
/// This ensures Sonos always receives continuous data with smooth transitions,
/// eliminating pops from abrupt audio/silence boundaries.
fn create_wav_stream_with_cadence(
    mut rx: broadcast::Receiver<Bytes>,
    silence_frame: Bytes,
    guard: Arc<LoggingStreamGuard>,
    queue_size: usize,
    frame_duration_ms: u32,
    audio_format: AudioFormat,
    prefill_frames: Vec<Bytes>,
) -> impl Stream<Item = Result<TaggedFrame, std::io::Error>> {
    stream! {
        let cadence_duration = Duration::from_millis(frame_duration_ms as u64);

        // Pre-populate queue with prefill frames to eliminate handoff gap.
        // This ensures the first tick immediately yields audio.
        let mut queue: VecDeque<Bytes> = VecDeque::with_capacity(queue_size.max(prefill_frames.len()));
        for frame in prefill_frames {
            queue.push_back(frame);
        }

        // Fire first tick immediately to get audio flowing before Sonos times out.
        // On resume, Sonos closes the connection within milliseconds if no audio arrives.
        let mut metronome = interval(cadence_duration);
        metronome.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut rx_closed = false;
        let mut in_silence = false;
        let mut silence_start: Option<TokioInstant> = None;

        // Crossfade is only supported for 16-bit PCM. The handshake enforces this
        // for PCM streams, but we guard here defensively in case the invariant breaks.
        let crossfade_enabled = is_crossfade_compatible(&audio_format);
        if !crossfade_enabled {
            log::warn!(
                "[Stream] Crossfade disabled: requires 16-bit PCM, got {}-bit",
                audio_format.bits_per_sample
            );
        }

        // Crossfade state: track last sample pair for fade-out generation
        let fade_samples = crossfade_samples(audio_format.sample_rate);
        let samples_per_frame = audio_format.frame_samples(frame_duration_ms);
        let mut last_sample_pair: Option<(i16, i16)> = None;

        // Rate-limit lagged warnings (max once per second)
        let mut last_lagged_log: Option<TokioInstant> = None;

        loop {
            // Exit when channel closed AND queue drained
            if rx_closed && queue.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                // PRIORITY 1: Metronome tick - MUST emit something every frame_duration_ms
                _ = metronome.tick() => {
                    if let Some(frame) = queue.pop_front() {
                        // Real audio available
                        let was_in_silence = in_silence;
                        if in_silence {
                            if let Some(start) = silence_start.take() {
                                log::info!(
                                    "[Stream] Exiting silence (cadence) after {:.1}s",
                                    start.elapsed().as_secs_f32()
                                );
                            }
                            in_silence = false;
                        }

                        // Track last sample pair for potential future fade-out
                        if crossfade_enabled {
                            last_sample_pair = extract_last_sample_pair(&frame, audio_format.channels);
                        }

                        // Apply fade-in if we just exited silence (and crossfade is enabled)
                        if was_in_silence && crossfade_enabled {
                            let mut faded = frame.to_vec();
                            apply_fade_in(&mut faded, audio_format.channels, fade_samples);
                            yield Ok(TaggedFrame::Audio(Bytes::from(faded)));
                        } else {
                            yield Ok(TaggedFrame::Audio(frame));
                        }
                    } else if !rx_closed {
                        // No frame available, emit silence
                        let entering_silence = !in_silence;
                        if entering_silence {
                            log::info!("[Stream] Entering silence (cadence) - queue empty");
                            in_silence = true;
                            silence_start = Some(TokioInstant::now());

                            // Generate fade-out frame if crossfade is enabled and we have last sample values
                            if crossfade_enabled {
                                if let Some((left, right)) = last_sample_pair.take() {
                                    let fade_out = create_fade_out_frame(
                                        left,
                                        right,
                                        audio_format.channels,
                                        fade_samples,
                                        samples_per_frame,
                                    );
                                    yield Ok(TaggedFrame::Silence(fade_out));
                                } else {
                                    yield Ok(TaggedFrame::Silence(silence_frame.clone()));
                                }
                            } else {
                                yield Ok(TaggedFrame::Silence(silence_frame.clone()));
                            }
                        } else {
                            yield Ok(TaggedFrame::Silence(silence_frame.clone()));
                        }
                    }
                    // If rx_closed and queue empty, don't yield - loop will break

                    // Drain any pending frames from rx into queue after emitting.
                    // This prevents starvation: with biased select, ticks always win,
                    // so without this drain, frames could pile up in rx while we
                    // emit silence (especially during recovery from underflow).
                    if !rx_closed {
                        loop {
                            match rx.try_recv() {
                                Ok(frame) => {
                                    if queue.len() >= queue_size {
                                        queue.pop_front();
                                        guard.record_frame_dropped();
                                    }
                                    queue.push_back(frame);
                                }
                                Err(broadcast::error::TryRecvError::Empty) => break,
                                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                                    let now = TokioInstant::now();
                                    if last_lagged_log.map_or(true, |t| now.duration_since(t).as_secs() >= 1) {
                                        log::warn!("[Stream] Lagged by {n} frames (during drain)");
                                        last_lagged_log = Some(now);
                                    }
                                    // Continue draining - next try_recv will get latest
                                }
                                Err(broadcast::error::TryRecvError::Closed) => {
                                    rx_closed = true;
                                    log::debug!("[Stream] Channel closed, draining {} queued frames", queue.len());
                                    break;
                                }
                            }
                        }
                    }
                }

                // PRIORITY 2: Receive frames into queue (when channel open and tick not ready)
                result = rx.recv(), if !rx_closed => {
                    match result {
                        Ok(frame) => {
                            if queue.len() >= queue_size {
                                // Queue full - drop oldest to maintain bounded latency
                                queue.pop_front();
                                guard.record_frame_dropped();
                                log::trace!("[Stream] Queue full, dropped oldest frame");
                            }
                            queue.push_back(frame);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let now = TokioInstant::now();
                            if last_lagged_log.map_or(true, |t| now.duration_since(t).as_secs() >= 1) {
                                log::warn!("[Stream] Lagged by {n} frames");
                                last_lagged_log = Some(now);
                            }
                            // Continue - next recv will get latest
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            rx_closed = true;
                            log::debug!("[Stream] Channel closed, draining {} queued frames", queue.len());
                        }
                    }
                }
            }
        }
    }
}

/// Wrapper that logs HTTP audio stream lifecycle and tracks delivery timing.
///
/// Logs when the stream starts and ends, and tracks gaps in frame delivery
/// to help diagnose issues where Sonos stops receiving audio unexpectedly.
struct LoggingStreamGuard {
    stream_id: String,
    client_ip: IpAddr,
    frames_sent: AtomicU64,
    first_error: parking_lot::Mutex<Option<String>>,
    /// Tracks delivery timing to detect gaps
    delivery_stats: parking_lot::Mutex<DeliveryStats>,
}

/// Tracks frame delivery timing statistics.
struct DeliveryStats {
    last_delivery: Option<Instant>,
    max_gap_ms: u64,
    gaps_over_threshold: u64,
    /// Number of times silence mode was entered
    silence_events: u64,
    /// Total silence frames injected
    silence_frames: u64,
    /// Frames dropped due to cadence queue overflow
    frames_dropped: u64,
}

impl LoggingStreamGuard {
    fn new(stream_id: String, client_ip: IpAddr) -> Self {
        log::info!(
            "[Stream] HTTP stream started: stream={}, client={}",
            stream_id,
            client_ip
        );
        Self {
            stream_id,
            client_ip,
            frames_sent: AtomicU64::new(0),
            first_error: parking_lot::Mutex::new(None),
            delivery_stats: parking_lot::Mutex::new(DeliveryStats {
                last_delivery: None,
                max_gap_ms: 0,
                gaps_over_threshold: 0,
                silence_events: 0,
                silence_frames: 0,
                frames_dropped: 0,
            }),
        }
    }

    /// Records that silence mode was entered.
    fn record_silence_event(&self) {
        self.delivery_stats.lock().silence_events += 1;
    }

    /// Records a silence frame being sent.
    fn record_silence_frame(&self) {
        self.delivery_stats.lock().silence_frames += 1;
    }

    /// Records a frame being dropped due to queue overflow.
    fn record_frame_dropped(&self) {
        self.delivery_stats.lock().frames_dropped += 1;
    }

    fn record_frame(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut stats = self.delivery_stats.lock();

        if let Some(last) = stats.last_delivery {
            let gap_ms = now.duration_since(last).as_millis() as u64;

            if gap_ms > stats.max_gap_ms {
                stats.max_gap_ms = gap_ms;
            }

            if gap_ms > DELIVERY_GAP_THRESHOLD_MS {
                stats.gaps_over_threshold += 1;
                // Only log significant gaps to avoid spam; summary captures total count
                if gap_ms > DELIVERY_GAP_LOG_THRESHOLD_MS {
                    log::warn!(
                        "[Stream] Delivery gap detected: stream={}, client={}, gap={}ms",
                        self.stream_id,
                        self.client_ip,
                        gap_ms
                    );
                }
            }
        }

        stats.last_delivery = Some(now);
    }

    fn record_error(&self, err: &str) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err.to_string());
        }
    }
}

impl Drop for LoggingStreamGuard {
    fn drop(&mut self) {
        let frames = self.frames_sent.load(Ordering::Relaxed);
        let first_error = self.first_error.get_mut();
        let stats = self.delivery_stats.get_mut();

        // Calculate time since last frame delivery
        let final_gap_ms = stats
            .last_delivery
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let stalled_suffix = if final_gap_ms > DELIVERY_GAP_LOG_THRESHOLD_MS {
            " (stalled)"
        } else {
            ""
        };

        // Build silence stats string if any silence was injected
        let silence_info = if stats.silence_events > 0 {
            format!(
                ", silence_events={}, silence_frames={}",
                stats.silence_events, stats.silence_frames
            )
        } else {
            String::new()
        };

        // Build dropped frames string if any frames were dropped
        let dropped_info = if stats.frames_dropped > 0 {
            format!(", frames_dropped={}", stats.frames_dropped)
        } else {
            String::new()
        };

        if let Some(ref err) = *first_error {
            log::warn!(
                "[Stream] HTTP stream ended with error{}: stream={}, client={}, frames_sent={}, \
                 max_gap={}ms, gaps_over_{}ms={}, final_gap={}ms{}{}, error={}",
                stalled_suffix,
                self.stream_id,
                self.client_ip,
                frames,
                stats.max_gap_ms,
                DELIVERY_GAP_THRESHOLD_MS,
                stats.gaps_over_threshold,
                final_gap_ms,
                silence_info,
                dropped_info,
                err
            );
        } else {
            log::info!(
                "[Stream] HTTP stream ended normally{}: stream={}, client={}, frames_sent={}, \
                 max_gap={}ms, gaps_over_{}ms={}, final_gap={}ms{}{}",
                stalled_suffix,
                self.stream_id,
                self.client_ip,
                frames,
                stats.max_gap_ms,
                DELIVERY_GAP_THRESHOLD_MS,
                stats.gaps_over_threshold,
                final_gap_ms,
                silence_info,
                dropped_info
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PlaybackRequest {
    ip: String,
    #[serde(rename = "streamId")]
    stream_id: String,
}

#[derive(Deserialize)]
struct VolumeRequest {
    volume: u8,
}

#[derive(Deserialize)]
struct MuteRequest {
    mute: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/speakers", get(list_speakers))
        .route("/api/groups", get(list_groups))
        .route("/api/state", get(get_current_state))
        .route("/api/refresh", post(handle_refresh))
        .route("/api/playback/start", post(handle_start_playback))
        .route(
            "/api/speakers/{ip}/volume",
            get(get_volume).post(set_volume),
        )
        .route("/api/speakers/{ip}/mute", get(get_mute).post(set_mute))
        .route("/stream/{id}/live", get(stream_audio))
        .route("/stream/{id}/live.wav", get(stream_audio))
        .route("/stream/{id}/live.flac", get(stream_audio))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe: "Is the process running?"
///
/// Always returns 200 OK if the server is responding. Use `/ready` for
/// readiness checks that verify the service can handle requests.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let max_streams = state.config.read().streaming.max_concurrent_streams;
    api_success(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "limits": {
            "maxStreams": max_streams
        },
        "wsConnections": {
            "active": state.ws_manager.connection_count(),
            "oldestAgeMs": state.ws_manager.oldest_connection_age_ms()
        }
    }))
}

/// Readiness probe: "Can the service handle requests?"
///
/// Returns 200 OK only when:
/// - Server port has been assigned (listening)
/// - Local IP has been detected (can build stream URLs)
///
/// Returns 503 Service Unavailable with details when not ready.
async fn readiness_check(State(state): State<AppState>) -> Response {
    let port = state.network.get_port();
    let local_ip = state.network.local_ip.read().clone();
    let has_groups = !state.sonos_state.groups.read().is_empty();

    let port_ready = port > 0;
    let ip_ready = !local_ip.is_empty();
    let ready = port_ready && ip_ready;

    let status = if ready { "ready" } else { "not_ready" };
    let checks = json!({
        "port": { "ready": port_ready, "value": port },
        "localIp": { "ready": ip_ready, "value": if ip_ready { &local_ip } else { "(not detected)" } },
        "discovery": { "ready": has_groups, "info": "optional - speakers discovered" }
    });

    let body = json!({
        "status": status,
        "ready": ready,
        "checks": checks
    });

    if ready {
        api_success(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

async fn list_speakers(State(state): State<AppState>) -> Response {
    match state.sonos.discover_speakers().await {
        Ok(speakers) => api_success(json!({ "speakers": speakers })).into_response(),
        Err(e) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "discovery_failed", e).into_response()
        }
    }
}

async fn list_groups(State(state): State<AppState>) -> impl IntoResponse {
    let groups = state.sonos_state.groups.read().clone();
    api_success(json!({ "groups": groups }))
}

/// Returns current system state (groups, transport states, volumes, mute states).
async fn get_current_state(State(state): State<AppState>) -> impl IntoResponse {
    api_success(state.sonos_state.to_json())
}

/// Triggers a manual topology refresh.
async fn handle_refresh(State(state): State<AppState>) -> impl IntoResponse {
    state.discovery_service.trigger_refresh();
    api_ok()
}

async fn handle_start_playback(
    State(state): State<AppState>,
    Json(payload): Json<PlaybackRequest>,
) -> CoordinatorResult<impl IntoResponse> {
    let artwork_url = String::new();
    state
        .stream_coordinator
        .start_playback(&payload.ip, &payload.stream_id, None, &artwork_url)
        .await?;

    Ok(api_ok())
}

// ─────────────────────────────────────────────────────────────────────────────
// Manual Speaker Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Parses and validates an IP address for use as a Sonos speaker.
///
/// Returns the canonical IPv4 string representation on success.
fn parse_and_validate_ip(ip: &str) -> CoordinatorResult<String> {
    let parsed: IpAddr = ip
        .parse()
        .map_err(|_| CoordinatorError::InvalidIp("Invalid IP address format".into()))?;

    let ipv4 =
        validate_speaker_ip(&parsed).map_err(|e| CoordinatorError::InvalidIp(e.message().into()))?;

    Ok(ipv4.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Volume/Mute Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Gets the current group volume for a speaker.
async fn get_volume(
    Path(ip): Path<String>,
    State(state): State<AppState>,
) -> CoordinatorResult<impl IntoResponse> {
    let volume = state.sonos.get_group_volume(&ip).await?;
    Ok(api_success(json!({ "ip": ip, "volume": volume })))
}

/// Sets the group volume for a speaker.
async fn set_volume(
    Path(ip): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<VolumeRequest>,
) -> CoordinatorResult<impl IntoResponse> {
    state.sonos.set_group_volume(&ip, payload.volume).await?;
    Ok(api_success(json!({ "ip": ip, "volume": payload.volume })))
}

/// Gets the current group mute state for a speaker.
async fn get_mute(
    Path(ip): Path<String>,
    State(state): State<AppState>,
) -> CoordinatorResult<impl IntoResponse> {
    let mute = state.sonos.get_group_mute(&ip).await?;
    Ok(api_success(json!({ "ip": ip, "mute": mute })))
}

/// Sets the group mute state for a speaker.
async fn set_mute(
    Path(ip): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<MuteRequest>,
) -> CoordinatorResult<impl IntoResponse> {
    state.sonos.set_group_mute(&ip, payload.mute).await?;
    Ok(api_success(json!({ "ip": ip, "mute": payload.mute })))
}

async fn stream_audio(
    Path(id): Path<String>,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> CoordinatorResult<Response> {
    let stream_state = state
        .stream_coordinator
        .get_stream(&id)
        .ok_or_else(|| CoordinatorError::StreamNotFound(id.clone()))?;

    let remote_ip = remote_addr.ip();

    // === Range Header Logging (empirical testing) ===
    // Captures what Sonos sends on pause/resume to inform our handling strategy.
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(ref range) = range_header {
        log::warn!(
            "[Stream] RANGE REQUEST: client={}, stream={}, codec={:?}, range='{}'",
            remote_ip,
            id,
            stream_state.codec,
            range
        );
        // Log other potentially relevant headers for context
        if let Some(if_range) = headers.get("if-range").and_then(|v| v.to_str().ok()) {
            log::warn!("[Stream]   If-Range: {}", if_range);
        }
        if let Some(user_agent) = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
        {
            log::warn!("[Stream]   User-Agent: {}", user_agent);
        }
    } else {
        log::info!(
            "[Stream] New connection: client={}, stream={}, codec={:?}",
            remote_ip,
            id,
            stream_state.codec
        );
    }

    // Detect resume: epoch >= 1 means there was a previous HTTP connection.
    let is_resume = stream_state.timing.epoch_count() >= 1;

    // Upfront buffering delay for PCM streams BEFORE subscribing.
    // This lets the ring buffer accumulate more frames. Subscribing after
    // ensures the broadcast receiver doesn't fill up during the delay.
    // Delay matches streaming_buffer_ms so cadence queue starts full.
    //
    // SKIP on resume: Sonos closes the connection within milliseconds if we delay.
    // The buffer already has frames from before the pause, so no delay is needed.
    // TEST: Disable prefill delay to see if SOAP latency provides natural buffering
    let prefill_delay_ms = 0; // was: stream_state.streaming_buffer_ms
    if stream_state.codec == AudioCodec::Pcm && prefill_delay_ms > 0 && !is_resume {
        log::debug!(
            "[Stream] Applying {}ms prefill delay for PCM stream",
            prefill_delay_ms
        );
        tokio::time::sleep(Duration::from_millis(prefill_delay_ms)).await;
    } else if is_resume && stream_state.codec == AudioCodec::Pcm {
        log::info!(
            "[Stream] Skipping {}ms prefill delay on resume (epoch={})",
            prefill_delay_ms,
            stream_state.timing.epoch_count()
        );

        // Send Play command to Sonos on resume.
        // When user resumes from Sonos app, Sonos makes a new HTTP request but stays
        // in "paused" transport state. The Play command tells Sonos to start playback.
        // Fire-and-forget: we spawn this so it doesn't block the HTTP response.
        let sonos = Arc::clone(&state.sonos);
        let ip = remote_ip.to_string();
        tokio::spawn(async move {
            if let Err(e) = sonos.play(&ip).await {
                log::warn!("[Stream] Play command on resume failed for {}: {}", ip, e);
            }
        });
    }

    // Capture connected_at AFTER prefill delay so latency metrics
    // reflect actual transport latency, not intentional buffering.
    let connected_at = Instant::now();

    // Subscribe AFTER delay to get fresh prefill snapshot and avoid rx backlog
    let (epoch_candidate, prefill_frames, rx) = stream_state.subscribe();

    log::debug!(
        "[Stream] Client {} connected to stream {}, sending {} prefill frames",
        remote_ip,
        id,
        prefill_frames.len()
    );

    // Type alias for tagged frame stream
    type TaggedStream = Pin<Box<dyn Stream<Item = Result<TaggedFrame, std::io::Error>> + Send>>;

    // Create logging guard early so we can pass it to the cadence stream for drop tracking.
    // Uses Arc so it can be shared between cadence stream, silence tracking, and final frame recording.
    let guard = Arc::new(LoggingStreamGuard::new(id.to_string(), remote_ip));

    // Build combined stream - PCM gets cadence-based streaming, compressed codecs don't.
    //
    // Why PCM-only: Sonos treats PCM/WAV as a "file" requiring continuous data flow.
    // CPU spikes that delay delivery cause Sonos to close the connection.
    // The cadence stream maintains 20ms output cadence, injecting silence when needed.
    //
    // Compressed codecs (AAC, MP3, FLAC) have their own framing and silence
    // representation - raw zeros would corrupt the stream. These codecs also
    // tend to be more resilient to jitter due to their buffering behavior.
    let combined_stream: TaggedStream = if stream_state.codec == AudioCodec::Pcm {
        // PCM: fixed-cadence streaming with queue buffer and silence injection.
        // Prefill frames are pre-populated in the queue to eliminate handoff gap.
        let frame_duration_ms = stream_state.frame_duration_ms;
        let silence_frame = stream_state.audio_format.silence_frame(frame_duration_ms);

        // Calculate queue size from streaming buffer (ceil division)
        // queue_size = ceil(buffer_ms / frame_ms), clamped to [1, MAX_CADENCE_QUEUE_SIZE]
        let queue_size = stream_state
            .streaming_buffer_ms
            .div_ceil(frame_duration_ms as u64) as usize;
        let queue_size = queue_size.clamp(1, MAX_CADENCE_QUEUE_SIZE);

        Box::pin(create_wav_stream_with_cadence(
            rx,
            silence_frame,
            Arc::clone(&guard),
            queue_size,
            frame_duration_ms,
            stream_state.audio_format,
            prefill_frames,
        ))
    } else {
        // Compressed codecs: no silence injection, chain prefill before live
        let prefill_stream = futures::stream::iter(
            prefill_frames
                .into_iter()
                .map(|b| Ok(TaggedFrame::Audio(b))),
        );
        let live_stream = BroadcastStream::new(rx).map(|res| match res {
            Ok(frame) => Ok(TaggedFrame::Audio(frame)),
            Err(BroadcastStreamRecvError::Lagged(n)) => Err(lagged_error(n)),
        });
        Box::pin(futures::StreamExt::chain(prefill_stream, live_stream))
    };

    // === Epoch Hook ===
    // This embeds epoch lifecycle management in the HTTP layer. While this might seem
    // like a separation of concerns violation, it's intentional because:
    //
    // 1. Requires ConnectInfo<SocketAddr> - only available via Axum extractors
    // 2. Must detect actual audio consumption - the stream poll is the only reliable signal
    // 3. HTTP connection lifecycle defines epoch boundary - Sonos reconnects = new epoch
    //
    // The epoch establishes T0 for latency measurement: the timestamp of the oldest
    // audio frame being served when Sonos first polls data from this connection.
    let hook_state = Some((
        Arc::clone(&stream_state),
        epoch_candidate,
        connected_at,
        remote_ip,
    ));

    let tracked_stream = combined_stream.scan(
        hook_state,
        |state, item: Result<TaggedFrame, std::io::Error>| {
            if let Some((stream_state, epoch_candidate, connected_at, remote_ip)) = state.take() {
                // Only fire epoch on REAL, NON-EMPTY audio (not silence or empty buffers)
                if let Ok(ref frame) = item {
                    if frame.is_real_audio() && !frame.as_bytes().is_empty() {
                        let first_audio_polled_at = Instant::now();
                        stream_state.timing.start_new_epoch(
                            epoch_candidate,
                            connected_at,
                            first_audio_polled_at,
                            remote_ip,
                        );
                    } else {
                        // Silence or empty frame - don't burn the hook, wait for real audio
                        *state = Some((stream_state, epoch_candidate, connected_at, remote_ip));
                    }
                } else {
                    // Error - don't burn the hook
                    *state = Some((stream_state, epoch_candidate, connected_at, remote_ip));
                }
            }
            futures::future::ready(Some(item))
        },
    );

    // Content-Type based on output codec
    let content_type = stream_state.codec.mime_type();

    // ICY metadata only supported for MP3/AAC streams (not PCM/FLAC)
    let supports_icy = matches!(stream_state.codec, AudioCodec::Mp3 | AudioCodec::Aac);
    let wants_icy =
        supports_icy && headers.get("icy-metadata").and_then(|v| v.to_str().ok()) == Some("1");

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        // DLNA streaming header: indicates real-time playback vs download-first
        .header("TransferMode.dlna.org", "Streaming")
        // Stream identification for renderers that display station name
        .header("icy-name", APP_NAME);

    if wants_icy {
        builder = builder.header("icy-metaint", ICY_METAINT.to_string());
    }

    // PCM: Use fixed Content-Length to avoid chunked transfer encoding.
    // Some renderers (including Sonos) stutter or disconnect with chunked encoding.
    // The stream will end before reaching this length, but it signals "file-like"
    // behavior to the renderer.
    if stream_state.codec == AudioCodec::Pcm {
        builder = builder.header(header::CONTENT_LENGTH, WAV_STREAM_SIZE_MAX.to_string());
    }

    // Unwrap TaggedFrame to Bytes, tracking silence events/frames for the final summary.
    // This must happen before the TaggedFrame type information is lost.
    let guard_for_silence = Arc::clone(&guard);
    let mut silence_event_recorded = false;
    let unwrapped_stream = tracked_stream.map(move |res| {
        if let Ok(ref frame) = res {
            match frame {
                TaggedFrame::Silence(_) => {
                    // Record first silence frame as an "event" (entering silence mode)
                    if !silence_event_recorded {
                        guard_for_silence.record_silence_event();
                        silence_event_recorded = true;
                    }
                    guard_for_silence.record_silence_frame();
                }
                TaggedFrame::Audio(_) => {
                    // Reset so next silence burst counts as new event
                    silence_event_recorded = false;
                }
            }
        }
        res.map(TaggedFrame::into_bytes)
    });

    // Apply ICY injection or PCM/WAV header to the unwrapped stream
    let inner_stream: AudioStream = if wants_icy {
        let stream_ref = Arc::clone(&stream_state);
        let mut injector = IcyMetadataInjector::new();

        Box::pin(unwrapped_stream.map(move |res| {
            let chunk = res?;
            let metadata = stream_ref.metadata.read();
            Ok::<Bytes, std::io::Error>(injector.inject(chunk.as_ref(), &metadata))
        }))
    } else if stream_state.codec == AudioCodec::Pcm {
        // PCM streams need WAV header prepended per-connection (Sonos may reconnect)
        let audio_format = stream_state.audio_format;
        let wav_header = create_wav_header(&audio_format);
        Box::pin(futures::StreamExt::chain(
            futures::stream::once(async move { Ok(wav_header) }),
            unwrapped_stream,
        ))
    } else {
        Box::pin(unwrapped_stream)
    };

    // Wrap stream with logging guard to track delivery timing and errors.
    // The guard logs summary stats on drop when the stream ends.
    let guard_for_frames = Arc::clone(&guard);
    let final_stream: AudioStream = Box::pin(inner_stream.map(move |res| {
        match &res {
            Ok(_) => guard_for_frames.record_frame(),
            Err(e) => guard_for_frames.record_error(&e.to_string()),
        }
        res
    }));

    builder
        .body(Body::from_stream(final_stream))
        .map_err(|e| CoordinatorError::Internal(e.to_string()))
}
