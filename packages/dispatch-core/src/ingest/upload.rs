//! HTTP upload acceptor ingest source. Accepts a multipart POST in the
//! rdio-scanner / OpenMHz call-upload shape (audio file plus form fields
//! describing the call) and emits the same canonical `audio` record the
//! other two ingest sources produce.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::handlers::HandlerRegistry;
use crate::metrics;
use crate::records::parse_payload;

#[derive(Debug, Default)]
struct UploadFields {
    system: Option<String>,
    date_time: Option<i64>,
    frequency: Option<i64>,
    talkgroup: Option<i64>,
    source: Option<i64>,
    emergency: bool,
    encrypted: bool,
    audio_name: Option<String>,
    audio_bytes: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct UploadState {
    pub registry: Arc<HandlerRegistry>,
    pub fallback_instance_key: String,
}

/// `POST /api/call-upload` handler. Wired into the HTTP router alongside the
/// SSE and query routes; not a standalone server.
pub async fn call_upload(
    State(state): State<UploadState>,
    mut multipart: Multipart,
) -> Response {
    let mut fields = UploadFields::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return bad_request(&format!("malformed multipart body: {e}")),
        };

        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "audio" => {
                fields.audio_name = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(b) => fields.audio_bytes = Some(b.to_vec()),
                    Err(e) => return bad_request(&format!("failed to read audio field: {e}")),
                }
            }
            "system" | "systemLabel" => {
                if let Ok(text) = field.text().await {
                    fields.system.get_or_insert(text);
                }
            }
            "dateTime" => {
                if let Ok(text) = field.text().await {
                    fields.date_time = text.parse().ok();
                }
            }
            "frequency" => {
                if let Ok(text) = field.text().await {
                    fields.frequency = text.parse().ok();
                }
            }
            "talkgroup" => {
                if let Ok(text) = field.text().await {
                    fields.talkgroup = text.parse().ok();
                }
            }
            "source" => {
                if let Ok(text) = field.text().await {
                    fields.source = text.parse().ok();
                }
            }
            "emergency" => {
                if let Ok(text) = field.text().await {
                    fields.emergency = text == "1" || text.eq_ignore_ascii_case("true");
                }
            }
            "encrypted" => {
                if let Ok(text) = field.text().await {
                    fields.encrypted = text == "1" || text.eq_ignore_ascii_case("true");
                }
            }
            _ => {
                // Unrecognized fields (API key, site labels, etc.) are accepted
                // and ignored rather than rejected, matching the permissive
                // upload shape described in the external interface.
            }
        }
    }

    let Some(audio_bytes) = fields.audio_bytes else {
        return bad_request("missing `audio` field");
    };
    let Some(talkgroup) = fields.talkgroup else {
        return bad_request("missing `talkgroup` field");
    };
    let system = fields.system.unwrap_or_else(|| state.fallback_instance_key.clone());
    let start_time = fields.date_time.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let filename = fields
        .audio_name
        .unwrap_or_else(|| format!("{system}-{talkgroup}-{start_time}.wav"));
    let ext = filename.rsplit('.').next().unwrap_or("wav").to_ascii_lowercase();
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &audio_bytes);
    let b64_field = if ext == "m4a" { "audio_m4a_base64" } else { "audio_wav_base64" };

    let mut call_obj = serde_json::Map::new();
    call_obj.insert(
        "metadata".to_string(),
        json!({
            "filename": filename,
            "talkgroup": talkgroup,
            "start_time": start_time as f64,
            "freq": fields.frequency,
            "emergency": fields.emergency,
            "encrypted": fields.encrypted,
            "short_name": system,
            "freq_list": Value::Array(vec![]),
            "src_list": source_list(fields.source),
        }),
    );
    call_obj.insert(b64_field.to_string(), Value::String(b64));

    let payload = json!({
        "type": "audio",
        "instance_id": state.fallback_instance_key,
        "timestamp": start_time,
        "call": Value::Object(call_obj),
    });

    let bytes = match serde_json::to_vec(&payload) {
        Ok(b) => b,
        Err(e) => return internal_error(&format!("failed to build record: {e}")),
    };
    let record = match parse_payload(&bytes, &state.fallback_instance_key) {
        Ok(r) => r,
        Err(e) => {
            metrics::RECORDS_REJECTED_TOTAL.with_label_values(&["parse_error"]).inc();
            return bad_request(&format!("failed to parse upload: {e}"));
        }
    };

    if let Err(e) = state.registry.dispatch(record, "http").await {
        return internal_error(&format!("dispatch failed: {e}"));
    }

    StatusCode::NO_CONTENT.into_response()
}

fn source_list(source: Option<i64>) -> Value {
    match source {
        Some(src) => Value::Array(vec![json!({ "src": src, "pos": 0.0 })]),
        None => Value::Array(vec![]),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "code": "malformed_record", "message": message }))).into_response()
}

fn internal_error(message: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "code": "internal_error", "message": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64_field_chosen_by_extension() {
        assert_eq!(if "wav" == "m4a" { "audio_m4a_base64" } else { "audio_wav_base64" }, "audio_wav_base64");
    }

    #[test]
    fn source_list_wraps_a_single_source() {
        let list = source_list(Some(4242));
        assert_eq!(list[0]["src"], 4242);
    }

    #[test]
    fn source_list_empty_when_absent() {
        assert_eq!(source_list(None), Value::Array(vec![]));
    }
}
