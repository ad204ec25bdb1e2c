//! GENA NOTIFY callback server.
//!
//! Bound on its own ephemeral port (see [`crate::api::start_gena_server`]),
//! distinct from the stream-surface HTTP server. Each subscription is given a
//! per-token callback path (`/gena/<token>`) at SUBSCRIBE time; unknown
//! tokens (expired, never issued, or left over from a prior process
//! instance) are rejected with `412 Precondition Failed` before the request
//! body is even read.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode},
    response::IntoResponse,
    routing::any,
    Router,
};

use crate::api::AppState;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol_constants::MAX_GENA_BODY_SIZE;

/// Builds the router for the dedicated GENA callback server.
pub fn create_gena_router(state: AppState) -> Router {
    Router::new()
        .route("/gena/{token}", any(handle_gena_notify))
        .with_state(state)
}

/// Validates required GENA headers and extracts SID and SEQ values.
fn validate_gena_headers(headers: &HeaderMap) -> CoordinatorResult<(String, String)> {
    let nt = headers.get("NT").and_then(|v| v.to_str().ok());
    if nt != Some("upnp:event") {
        log::warn!("[GENA] NOTIFY missing or invalid NT header: {:?}", nt);
        return Err(CoordinatorError::InvalidRequest(
            "Missing or invalid NT header".into(),
        ));
    }

    let nts = headers.get("NTS").and_then(|v| v.to_str().ok());
    if nts != Some("upnp:propchange") {
        log::warn!("[GENA] NOTIFY missing or invalid NTS header: {:?}", nts);
        return Err(CoordinatorError::InvalidRequest(
            "Missing or invalid NTS header".into(),
        ));
    }

    let sid = match headers.get("SID").and_then(|v| v.to_str().ok()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            log::warn!("[GENA] NOTIFY missing SID header");
            return Err(CoordinatorError::InvalidRequest("Missing SID header".into()));
        }
    };

    let seq = headers
        .get("SEQ")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("?")
        .to_string();

    Ok((sid, seq))
}

async fn handle_gena_notify(
    State(state): State<AppState>,
    Path(token): Path<String>,
    req: Request<Body>,
) -> CoordinatorResult<impl IntoResponse> {
    let (parts, body) = req.into_parts();

    if parts.method.as_str() != "NOTIFY" {
        return Err(CoordinatorError::InvalidRequest(format!(
            "Expected NOTIFY method, got {}",
            parts.method
        )));
    }

    if state.gena_manager.resolve_token(&token).is_none() {
        return Err(CoordinatorError::UnknownGenaCallback(token));
    }

    let (sid, seq) = validate_gena_headers(&parts.headers)?;

    let body_bytes = axum::body::to_bytes(body, MAX_GENA_BODY_SIZE)
        .await
        .map_err(|e| {
            log::warn!("[GENA] Failed to read NOTIFY body: {}", e);
            CoordinatorError::InvalidRequest("Failed to read body".into())
        })?;

    // The SEQ value travels as an HTTP header, not in the XML body; prepend
    // it as the first line so `sonos::gena::extract_seq` can apply the
    // sequence-number gate before the body is parsed.
    let body_with_seq = format!("SEQ: {}\n{}", seq, String::from_utf8_lossy(&body_bytes));

    let events = state.discovery_service.handle_gena_notify(&sid, &body_with_seq);

    if events.is_empty() {
        log::trace!(
            "[GENA] NOTIFY from {} (SEQ: {}) - no parseable events",
            sid,
            seq
        );
    } else {
        log::debug!(
            "[GENA] NOTIFY from {} (SEQ: {}) - {} events",
            sid,
            seq,
            events.len()
        );
    }

    Ok(StatusCode::OK)
}
