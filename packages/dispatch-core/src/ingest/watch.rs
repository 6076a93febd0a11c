//! Directory watcher ingest source. Monitors a directory tree for completed
//! audio recordings (an audio file plus a JSON sidecar carrying call
//! metadata), and synthesizes the same `call_start` / `call_end` / `audio`
//! records a live MQTT feed would have produced, since the files on disk
//! already describe a finished call rather than an in-progress one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::handlers::HandlerRegistry;
use crate::metrics;
use crate::records::parse_payload;

const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a"];

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub root: PathBuf,
    pub fallback_instance_key: String,
    /// `short_name` to report when the sidecar doesn't carry one itself.
    pub default_short_name: String,
    /// How many past days to scan for pre-existing recordings on startup.
    pub backfill_days: u32,
}

pub struct DirectoryWatchIngest {
    _watcher: RecommendedWatcher,
}

impl DirectoryWatchIngest {
    /// Starts watching `config.root`, backfilling first, then reacting to
    /// new files as `notify` reports them.
    pub fn start(
        config: WatchConfig,
        registry: Arc<HandlerRegistry>,
        cancel: CancellationToken,
    ) -> notify::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&config.root, RecursiveMode::Recursive)?;

        let backfill_root = config.root.clone();
        let backfill_registry = registry.clone();
        let backfill_config = config.clone();
        let backfill_cancel = cancel.clone();
        tokio::spawn(async move {
            backfill(&backfill_root, &backfill_config, &backfill_registry, &backfill_cancel).await;
        });

        tokio::spawn(async move {
            let mut seen_stems: HashSet<PathBuf> = HashSet::new();
            loop {
                let event = tokio::select! {
                    event = rx.recv() => match event {
                        Some(e) => e,
                        None => return,
                    },
                    _ = cancel.cancelled() => return,
                };

                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }

                for path in &event.paths {
                    let Some(stem_path) = audio_stem(path) else { continue };
                    if !seen_stems.insert(stem_path.clone()) {
                        continue;
                    }
                    if let Err(e) = ingest_recording(&stem_path, &config, &registry).await {
                        log::warn!("directory watch failed for {}: {e}", stem_path.display());
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

/// Returns the extensionless path (the "stem path") if `path` is a file with
/// a recognized audio extension, so both the `.wav` and its `.json` sidecar
/// map to the same key.
fn audio_stem(path: &Path) -> Option<PathBuf> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(path.with_extension(""))
}

fn find_audio_file(stem_path: &Path) -> Option<PathBuf> {
    AUDIO_EXTENSIONS
        .iter()
        .map(|ext| stem_path.with_extension(ext))
        .find(|p| p.is_file())
}

async fn backfill(
    root: &Path,
    config: &WatchConfig,
    registry: &Arc<HandlerRegistry>,
    cancel: &CancellationToken,
) {
    if !root.exists() {
        log::warn!("directory watch root {} does not exist yet", root.display());
        return;
    }

    let cutoff = chrono::Utc::now() - chrono::Duration::days(config.backfill_days as i64);
    let mut stems: HashSet<PathBuf> = HashSet::new();

    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if cancel.is_cancelled() {
            return;
        }
        let path = entry.path();
        let Some(stem_path) = audio_stem(path) else { continue };
        if !stems.insert(stem_path.clone()) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let modified: chrono::DateTime<chrono::Utc> = modified.into();
                if modified < cutoff {
                    continue;
                }
            }
        }
        if let Err(e) = ingest_recording(&stem_path, config, registry).await {
            log::warn!("backfill failed for {}: {e}", stem_path.display());
        }
    }
}

/// Loads the audio file and its JSON sidecar for `stem_path`, synthesizes
/// `call_start`, `call_end`, and `audio` payloads, and dispatches them in
/// that order.
async fn ingest_recording(
    stem_path: &Path,
    config: &WatchConfig,
    registry: &Arc<HandlerRegistry>,
) -> Result<(), String> {
    let audio_path = find_audio_file(stem_path).ok_or("no audio file for sidecar")?;
    let sidecar_path = stem_path.with_extension("json");
    if !sidecar_path.is_file() {
        return Err("no JSON sidecar found".to_string());
    }

    let sidecar_bytes = tokio::fs::read(&sidecar_path).await.map_err(|e| e.to_string())?;
    let sidecar: Value = serde_json::from_slice(&sidecar_bytes).map_err(|e| e.to_string())?;
    let audio_bytes = tokio::fs::read(&audio_path).await.map_err(|e| e.to_string())?;

    let short_name = sidecar
        .get("short_name")
        .and_then(Value::as_str)
        .unwrap_or(&config.default_short_name)
        .to_string();
    let talkgroup = sidecar.get("talkgroup").and_then(Value::as_i64).unwrap_or(0);
    let start_time = sidecar.get("start_time").and_then(Value::as_f64);
    let stop_time = sidecar.get("stop_time").and_then(Value::as_f64);
    let now = chrono::Utc::now().timestamp();

    if let Some(start) = start_time {
        let call_start = call_envelope_json("call_start", &config.fallback_instance_key, now, &sidecar, &short_name, talkgroup, start, None);
        dispatch_synthetic(registry, call_start, &config.fallback_instance_key).await;
    }
    if let Some(stop) = stop_time {
        let call_end = call_envelope_json("call_end", &config.fallback_instance_key, now, &sidecar, &short_name, talkgroup, stop, stop_time);
        dispatch_synthetic(registry, call_end, &config.fallback_instance_key).await;
    }

    let filename = audio_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("recording")
        .to_string();
    let ext = audio_path.extension().and_then(|e| e.to_str()).unwrap_or("wav");
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &audio_bytes);

    let mut call_obj = serde_json::Map::new();
    call_obj.insert(
        "metadata".to_string(),
        json!({
            "filename": filename,
            "talkgroup": talkgroup,
            "start_time": start_time.unwrap_or(now as f64),
            "stop_time": stop_time,
            "call_length": sidecar.get("call_length").and_then(Value::as_f64),
            "freq": sidecar.get("freq").and_then(Value::as_i64),
            "emergency": sidecar.get("emergency").and_then(Value::as_bool).unwrap_or(false),
            "encrypted": sidecar.get("encrypted").and_then(Value::as_bool).unwrap_or(false),
            "short_name": short_name,
            "freq_list": sidecar.get("freq_list").cloned().unwrap_or_else(|| json!([])),
            "src_list": sidecar.get("src_list").cloned().unwrap_or_else(|| json!([])),
        }),
    );
    let b64_field = if ext == "wav" { "audio_wav_base64" } else { "audio_m4a_base64" };
    call_obj.insert(b64_field.to_string(), Value::String(b64));

    let audio = json!({
        "type": "audio",
        "instance_id": config.fallback_instance_key,
        "timestamp": now,
        "call": Value::Object(call_obj),
    });
    dispatch_synthetic(registry, audio, &config.fallback_instance_key).await;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn call_envelope_json(
    type_name: &str,
    instance_key: &str,
    timestamp: i64,
    sidecar: &Value,
    short_name: &str,
    talkgroup: i64,
    envelope_time: f64,
    length_anchor: Option<f64>,
) -> Value {
    let start_time = sidecar.get("start_time").and_then(Value::as_f64);
    json!({
        "type": type_name,
        "instance_id": instance_key,
        "timestamp": timestamp,
        "call": {
            "sys_name": short_name,
            "talkgroup": talkgroup,
            "start_time": if type_name == "call_start" { Some(envelope_time) } else { start_time },
            "stop_time": if type_name == "call_end" { Some(envelope_time) } else { None::<f64> },
            "length": sidecar.get("call_length").and_then(Value::as_f64).or(length_anchor.and_then(|_| start_time.map(|s| (envelope_time - s).max(0.0)))),
            "unit": sidecar.get("unit").and_then(Value::as_i64),
            "emergency": sidecar.get("emergency").and_then(Value::as_bool).unwrap_or(false),
            "encrypted": sidecar.get("encrypted").and_then(Value::as_bool).unwrap_or(false),
            "freq": sidecar.get("freq").and_then(Value::as_i64),
        },
    })
}

async fn dispatch_synthetic(registry: &Arc<HandlerRegistry>, payload: Value, fallback_instance_key: &str) {
    let bytes = match serde_json::to_vec(&payload) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("failed to serialize synthetic watch record: {e}");
            return;
        }
    };
    match parse_payload(&bytes, fallback_instance_key) {
        Ok(record) => {
            if let Err(e) = registry.dispatch(record, "watch").await {
                log::warn!("watch dispatch failed: {e}");
            }
        }
        Err(e) => {
            log::warn!("watch synthetic record failed to parse: {e}");
            metrics::RECORDS_REJECTED_TOTAL.with_label_values(&["parse_error"]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_stem_recognizes_supported_extensions() {
        assert_eq!(audio_stem(Path::new("/x/1234.wav")), Some(PathBuf::from("/x/1234")));
        assert_eq!(audio_stem(Path::new("/x/1234.mp3")), Some(PathBuf::from("/x/1234")));
        assert_eq!(audio_stem(Path::new("/x/1234.json")), None);
    }

    #[test]
    fn call_envelope_json_marks_start_time_on_call_start() {
        let sidecar = json!({"start_time": 100.0, "call_length": 12.0});
        let value = call_envelope_json("call_start", "test", 100, &sidecar, "sys", 42, 100.0, None);
        assert_eq!(value["type"], "call_start");
        assert_eq!(value["call"]["talkgroup"], 42);
        assert_eq!(value["call"]["start_time"], 100.0);
        assert!(value["call"]["stop_time"].is_null());
    }
}
