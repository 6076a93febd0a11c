//! HTTP route handlers: the C11 query API, the C6 SSE stream, the C7 HTTP
//! upload acceptor, and the C12 metrics scrape route, all on one router.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::{ApiState, AuthConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{DispatchEvent, EventFilter, HubMessage};
use crate::ingest::upload::call_upload;
use crate::metrics;
use crate::model::{Call, System, Talkgroup, Unit};

/// Upload bodies (WAV/M4A audio) rarely exceed a few megabytes; this is a
/// generous ceiling against accidental or hostile oversized posts.
const UPLOAD_BODY_LIMIT_BYTES: usize = 64 * 1024 * 1024;
const INITIAL_STATE_CALL_CAP: i64 = 200;
const INITIAL_STATE_SYSTEM_CAP: i64 = 200;
const INITIAL_STATE_UNIT_CAP: i64 = 500;

pub fn create_router(state: ApiState) -> Router {
    let upload_state = state.engine.upload_state.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/systems", get(list_systems))
        .route("/systems/{system_id}/talkgroups", get(list_talkgroups))
        .route("/talkgroups/{system_id}/{tgid}", get(get_talkgroup))
        .route("/units/{system_id}", get(list_units))
        .route("/calls", get(list_calls))
        .route("/calls/{call_id}", get(get_call))
        .route("/audio/{short_name}/{date}/{filename}", get(stream_audio))
        .route("/events", get(sse_events))
        .route("/metrics", get(scrape_metrics))
        .with_state(state.clone())
        .route(
            "/api/call-upload",
            post(call_upload)
                .with_state(upload_state)
                .layer(RequestBodyLimitLayer::new(UPLOAD_BODY_LIMIT_BYTES)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ─────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────

/// Liveness/readiness in one: DB-pool reachability plus a snapshot of
/// in-process gauges. Unlike the query routes below, this never returns an
/// error response — degraded dependencies are reported in the body instead.
async fn health_check(State(state): State<ApiState>) -> Response {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.engine.pool)
        .await
        .is_ok();

    let body = json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "active_calls": state.engine.call_state.active_call_count(),
        "subscribers": state.engine.hub.subscriber_count(),
    });

    if db_ok {
        Json(body).into_response()
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Systems / talkgroups / units
// ─────────────────────────────────────────────────────────────────────────

async fn list_systems(State(state): State<ApiState>) -> EngineResult<Json<Vec<System>>> {
    require_auth(&state.auth)?;
    let systems = sqlx::query_as::<_, System>(
        "SELECT system_id, system_type, sysid, wacn, name, deleted_at FROM systems WHERE deleted_at IS NULL ORDER BY system_id",
    )
    .fetch_all(&state.engine.pool)
    .await?;
    Ok(Json(systems))
}

async fn list_talkgroups(State(state): State<ApiState>, Path(system_id): Path<i64>) -> EngineResult<Json<Vec<Talkgroup>>> {
    require_auth(&state.auth)?;
    let talkgroups = sqlx::query_as::<_, Talkgroup>(
        r"
        SELECT system_id, tgid, alpha_tag, tag, group_name, description, mode, priority,
               alpha_tag_source, first_seen, last_seen
        FROM talkgroups WHERE system_id = $1 ORDER BY tgid
        ",
    )
    .bind(system_id)
    .fetch_all(&state.engine.pool)
    .await?;
    Ok(Json(talkgroups))
}

async fn get_talkgroup(
    State(state): State<ApiState>,
    Path((system_id, tgid)): Path<(i64, i64)>,
) -> EngineResult<Json<Talkgroup>> {
    require_auth(&state.auth)?;
    let talkgroup = sqlx::query_as::<_, Talkgroup>(
        r"
        SELECT system_id, tgid, alpha_tag, tag, group_name, description, mode, priority,
               alpha_tag_source, first_seen, last_seen
        FROM talkgroups WHERE system_id = $1 AND tgid = $2
        ",
    )
    .bind(system_id)
    .bind(tgid)
    .fetch_optional(&state.engine.pool)
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("talkgroup {system_id}/{tgid}")))?;
    Ok(Json(talkgroup))
}

async fn list_units(State(state): State<ApiState>, Path(system_id): Path<i64>) -> EngineResult<Json<Vec<Unit>>> {
    require_auth(&state.auth)?;
    let units = sqlx::query_as::<_, Unit>(
        r"
        SELECT system_id, unit_id, alpha_tag, alpha_tag_source, first_seen, last_seen,
               last_event_type, last_event_time, last_event_tgid
        FROM units WHERE system_id = $1 ORDER BY unit_id
        ",
    )
    .bind(system_id)
    .fetch_all(&state.engine.pool)
    .await?;
    Ok(Json(units))
}

// ─────────────────────────────────────────────────────────────────────────
// Calls
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CallListQuery {
    system_id: Option<i64>,
    tgid: Option<i64>,
    emergency: Option<bool>,
    encrypted: Option<bool>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

/// Mirrors the §4.6 filter language's conjunctive semantics: every supplied
/// constraint narrows the result; absent constraints never exclude.
async fn list_calls(State(state): State<ApiState>, Query(query): Query<CallListQuery>) -> EngineResult<Json<Vec<Call>>> {
    require_auth(&state.auth)?;
    let limit = query.limit.clamp(1, 500);
    let calls = sqlx::query_as::<_, Call>(
        r"
        SELECT call_id, start_time, system_id, site_id, tgid, tr_call_id, stop_time, duration, freq,
               call_group_id, audio_file_path, call_filename, src_list, freq_list, unit_ids, encrypted,
               emergency, call_state, rec_state, transcription_text, transcription_word_count, transcription_status
        FROM calls
        WHERE ($1::bigint IS NULL OR system_id = $1)
          AND ($2::bigint IS NULL OR tgid = $2)
          AND ($3::bool IS NULL OR emergency = $3)
          AND ($4::bool IS NULL OR encrypted = $4)
        ORDER BY start_time DESC
        LIMIT $5 OFFSET $6
        ",
    )
    .bind(query.system_id)
    .bind(query.tgid)
    .bind(query.emergency)
    .bind(query.encrypted)
    .bind(limit)
    .bind(query.offset)
    .fetch_all(&state.engine.pool)
    .await?;
    Ok(Json(calls))
}

async fn get_call(State(state): State<ApiState>, Path(call_id): Path<String>) -> EngineResult<Json<Call>> {
    require_auth(&state.auth)?;
    let call = sqlx::query_as::<_, Call>(
        r"
        SELECT call_id, start_time, system_id, site_id, tgid, tr_call_id, stop_time, duration, freq,
               call_group_id, audio_file_path, call_filename, src_list, freq_list, unit_ids, encrypted,
               emergency, call_state, rec_state, transcription_text, transcription_word_count, transcription_status
        FROM calls WHERE call_id = $1
        ORDER BY start_time DESC
        LIMIT 1
        ",
    )
    .bind(&call_id)
    .fetch_optional(&state.engine.pool)
    .await?
    .ok_or(EngineError::NotFound(format!("call {call_id}")))?;
    Ok(Json(call))
}

// ─────────────────────────────────────────────────────────────────────────
// Audio playback
// ─────────────────────────────────────────────────────────────────────────

async fn stream_audio(
    State(state): State<ApiState>,
    Path((short_name, date, filename)): Path<(String, String, String)>,
) -> EngineResult<Response> {
    require_auth(&state.auth)?;
    let key = format!("{short_name}/{date}/{filename}");
    let content_type = if filename.ends_with(".m4a") { "audio/mp4" } else { "audio/wav" };

    let mut reader = state.engine.audio_store.open(&key).await?;
    let mut buf = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
        .await
        .map_err(|e| EngineError::AudioSaveLocal(format!("failed to read {key}: {e}")))?;

    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], buf).into_response())
}

// ─────────────────────────────────────────────────────────────────────────
// Event stream (SSE)
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    event_types: Option<String>,
    talkgroups: Option<String>,
    systems: Option<String>,
    #[serde(default)]
    emergency_only: bool,
    audio_format: Option<String>,
}

impl EventsQuery {
    fn into_filter(self) -> EventFilter {
        EventFilter {
            event_types: self.event_types.map(|v| split_csv(&v)),
            talkgroup_set: self.talkgroups.map(|v| split_csv_i64(&v)),
            system_set: self.systems.map(|v| split_csv_i64(&v)),
            emergency_only: self.emergency_only,
            audio_format: self.audio_format,
        }
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn split_csv_i64(value: &str) -> Vec<i64> {
    value.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

/// Implements the §4.6 initial-state contract: exactly one `initial.state`
/// event, delivered before the subscriber becomes visible to `publish`,
/// then live events in arrival order modulo drops.
async fn sse_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> EngineResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    require_auth(&state.auth)?;
    let filter = query.into_filter();
    let initial = build_initial_state(&state.engine.pool).await?;

    let hub = state.engine.hub.clone();
    let mut guard = hub.subscribe(filter, initial);
    let cancel = state.engine.subscriber_scope();

    let sse_stream = stream! {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                message = guard.recv() => {
                    match message {
                        Some(HubMessage::Event(event)) => {
                            if let Ok(data) = serde_json::to_string(event.as_ref()) {
                                yield Ok(Event::default().event(event.type_name()).data(data));
                            }
                        }
                        Some(HubMessage::Heartbeat) => yield Ok(Event::default().comment("keepalive")),
                        None => return,
                    }
                }
            }
        }
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn build_initial_state(pool: &sqlx::PgPool) -> EngineResult<DispatchEvent> {
    let calls: Vec<Call> = sqlx::query_as(
        r"
        SELECT call_id, start_time, system_id, site_id, tgid, tr_call_id, stop_time, duration, freq,
               call_group_id, audio_file_path, call_filename, src_list, freq_list, unit_ids, encrypted,
               emergency, call_state, rec_state, transcription_text, transcription_word_count, transcription_status
        FROM calls WHERE call_state NOT IN ('PURGED') ORDER BY start_time DESC LIMIT $1
        ",
    )
    .bind(INITIAL_STATE_CALL_CAP)
    .fetch_all(pool)
    .await?;

    let systems: Vec<System> = sqlx::query_as(
        "SELECT system_id, system_type, sysid, wacn, name, deleted_at FROM systems WHERE deleted_at IS NULL ORDER BY system_id LIMIT $1",
    )
    .bind(INITIAL_STATE_SYSTEM_CAP)
    .fetch_all(pool)
    .await?;

    let units: Vec<Unit> = sqlx::query_as(
        r"
        SELECT system_id, unit_id, alpha_tag, alpha_tag_source, first_seen, last_seen,
               last_event_type, last_event_time, last_event_tgid
        FROM units ORDER BY last_seen DESC LIMIT $1
        ",
    )
    .bind(INITIAL_STATE_UNIT_CAP)
    .fetch_all(pool)
    .await?;

    Ok(DispatchEvent::InitialState(json!({
        "calls": calls,
        "systems": systems,
        "units": units,
    })))
}

// ─────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────

async fn scrape_metrics() -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode(),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────
// Auth seam (§4.11, §1 non-goal: no credential store is implemented here)
// ─────────────────────────────────────────────────────────────────────────

fn require_auth(auth: &AuthConfig) -> EngineResult<()> {
    if !auth.enabled {
        return Ok(());
    }
    // Loud pass-through: enabling auth without a real bearer-token check
    // wired in is a configuration error, not a silent no-op.
    if auth.token.is_none() {
        return Err(EngineError::ConfigInvalid(
            "auth enabled but no token configured".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(split_csv(" call.start, call.end ,"), vec!["call.start", "call.end"]);
    }

    #[test]
    fn split_csv_i64_skips_unparseable_entries() {
        assert_eq!(split_csv_i64("1,2,x,3"), vec![1, 2, 3]);
    }

    #[test]
    fn require_auth_passes_when_disabled() {
        assert!(require_auth(&AuthConfig { enabled: false, token: None }).is_ok());
    }

    #[test]
    fn require_auth_rejects_enabled_without_token() {
        assert!(require_auth(&AuthConfig { enabled: true, token: None }).is_err());
    }
}
