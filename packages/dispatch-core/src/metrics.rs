//! Prometheus metrics registry (C8). One custom [`Registry`] holding every
//! counter/gauge/histogram the engine exposes, scraped over HTTP at
//! `/metrics` by the query API (C12) rather than a dedicated listener.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingest --------
pub static RECORDS_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("records_received_total", "inbound records by type and source"),
        &["record_type", "source"],
    )
    .unwrap()
});

pub static RECORDS_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("records_rejected_total", "records rejected at the handler, by reason"),
        &["reason"],
    )
    .unwrap()
});

pub static MQTT_RECONNECTS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("mqtt_reconnects_total", "MQTT client reconnect attempts").unwrap());

pub static WATCH_FILES_INGESTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("watch_files_ingested_total", "audio files picked up by the directory watcher").unwrap()
});

pub static HTTP_UPLOADS_ACCEPTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("http_uploads_accepted_total", "audio uploads accepted over HTTP").unwrap()
});

// -------- Call state --------
pub static ACTIVE_CALLS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("active_calls", "currently open calls").unwrap());

pub static CALLS_STARTED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("calls_started_total", "calls opened").unwrap());

pub static CALLS_ENDED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("calls_ended_total", "calls closed").unwrap());

pub static CALLS_PURGED_STALE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("calls_purged_stale_total", "calls force-closed by the stale purge sweep").unwrap()
});

pub static CALL_COALESCE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("call_coalesce_total", "call_start records folded into an existing open call").unwrap()
});

// -------- Audio store --------
pub static AUDIO_SAVED_LOCAL_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("audio_saved_local_total", "audio artifacts written to local disk").unwrap());

pub static AUDIO_UPLOADED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("audio_uploaded_total", "audio artifacts uploaded to the object store").unwrap()
});

pub static AUDIO_UPLOAD_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("audio_upload_failed_total", "object-store uploads that failed or timed out").unwrap()
});

pub static UPLOAD_QUEUE_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("upload_queue_dropped_total", "upload jobs dropped because the queue was full").unwrap()
});

pub static RECONCILER_CHECKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("reconciler_checked_total", "local files the reconciler checked against the object store").unwrap()
});

pub static RECONCILER_UPLOADED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("reconciler_uploaded_total", "files the reconciler re-uploaded").unwrap()
});

pub static RECONCILER_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("reconciler_failed_total", "reconciler re-upload attempts that failed").unwrap()
});

pub static PRUNER_DELETED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("pruner_deleted_total", "local audio files deleted by the pruner").unwrap());

pub static PRUNER_SKIPPED_UNSAFE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "pruner_skipped_unsafe_total",
        "candidate deletions the pruner skipped because the object store copy was missing",
    )
    .unwrap()
});

// -------- Transcription --------
pub static TRANSCRIPTIONS_REQUESTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("transcriptions_requested_total", "audio artifacts submitted to the STT backend").unwrap()
});

pub static TRANSCRIPTIONS_SUCCEEDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("transcriptions_succeeded_total", "STT requests that returned a transcript").unwrap()
});

pub static TRANSCRIPTIONS_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("transcriptions_failed_total", "STT requests that failed after retries").unwrap()
});

pub static TRANSCRIPTIONS_SKIPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("transcriptions_skipped_total", "audio skipped before STT submission, by reason"),
        &["reason"],
    )
    .unwrap()
});

pub static TRANSCRIPTION_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "transcription_latency_seconds",
        "wall-clock latency of STT requests",
    ))
    .unwrap()
});

pub static TRANSCRIPTION_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("transcription_queue_depth", "pending items in the transcription worker queue").unwrap()
});

// -------- Subscriber hub --------
pub static SUBSCRIBERS_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("subscribers_connected", "currently connected SSE subscribers").unwrap());

pub static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_published_total", "events published to the subscriber hub, by event type"),
        &["event_type"],
    )
    .unwrap()
});

pub static SUBSCRIBER_EVENTS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "subscriber_events_dropped_total",
        "events dropped because a subscriber's queue was full",
    )
    .unwrap()
});

pub static SUBSCRIBERS_DISCONNECTED_SLOW_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "subscribers_disconnected_slow_total",
        "subscribers closed for missing two consecutive heartbeats",
    )
    .unwrap()
});

// -------- Database / HTTP --------
pub static DB_POOL_SIZE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("db_pool_size", "configured database connection pool size").unwrap());

pub static DB_POOL_IN_USE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("db_pool_in_use", "database connections currently checked out").unwrap());

pub static HTTP_REQUEST_DURATION_SECONDS: Lazy<prometheus::HistogramVec> = Lazy::new(|| {
    prometheus::HistogramVec::new(
        HistogramOpts::new("http_request_duration_seconds", "HTTP query API request latency"),
        &["method", "route", "status"],
    )
    .unwrap()
});

/// Registers every metric above with [`REGISTRY`]. Idempotent to call more
/// than once only in tests; production code calls it exactly once at
/// startup.
pub fn init() {
    for result in [
        REGISTRY.register(Box::new(RECORDS_RECEIVED_TOTAL.clone())),
        REGISTRY.register(Box::new(RECORDS_REJECTED_TOTAL.clone())),
        REGISTRY.register(Box::new(MQTT_RECONNECTS_TOTAL.clone())),
        REGISTRY.register(Box::new(WATCH_FILES_INGESTED_TOTAL.clone())),
        REGISTRY.register(Box::new(HTTP_UPLOADS_ACCEPTED_TOTAL.clone())),
        REGISTRY.register(Box::new(ACTIVE_CALLS.clone())),
        REGISTRY.register(Box::new(CALLS_STARTED_TOTAL.clone())),
        REGISTRY.register(Box::new(CALLS_ENDED_TOTAL.clone())),
        REGISTRY.register(Box::new(CALLS_PURGED_STALE_TOTAL.clone())),
        REGISTRY.register(Box::new(CALL_COALESCE_TOTAL.clone())),
        REGISTRY.register(Box::new(AUDIO_SAVED_LOCAL_TOTAL.clone())),
        REGISTRY.register(Box::new(AUDIO_UPLOADED_TOTAL.clone())),
        REGISTRY.register(Box::new(AUDIO_UPLOAD_FAILED_TOTAL.clone())),
        REGISTRY.register(Box::new(UPLOAD_QUEUE_DROPPED_TOTAL.clone())),
        REGISTRY.register(Box::new(RECONCILER_CHECKED_TOTAL.clone())),
        REGISTRY.register(Box::new(RECONCILER_UPLOADED_TOTAL.clone())),
        REGISTRY.register(Box::new(RECONCILER_FAILED_TOTAL.clone())),
        REGISTRY.register(Box::new(PRUNER_DELETED_TOTAL.clone())),
        REGISTRY.register(Box::new(PRUNER_SKIPPED_UNSAFE_TOTAL.clone())),
        REGISTRY.register(Box::new(TRANSCRIPTIONS_REQUESTED_TOTAL.clone())),
        REGISTRY.register(Box::new(TRANSCRIPTIONS_SUCCEEDED_TOTAL.clone())),
        REGISTRY.register(Box::new(TRANSCRIPTIONS_FAILED_TOTAL.clone())),
        REGISTRY.register(Box::new(TRANSCRIPTIONS_SKIPPED_TOTAL.clone())),
        REGISTRY.register(Box::new(TRANSCRIPTION_LATENCY_SECONDS.clone())),
        REGISTRY.register(Box::new(TRANSCRIPTION_QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(SUBSCRIBERS_CONNECTED.clone())),
        REGISTRY.register(Box::new(EVENTS_PUBLISHED_TOTAL.clone())),
        REGISTRY.register(Box::new(SUBSCRIBER_EVENTS_DROPPED_TOTAL.clone())),
        REGISTRY.register(Box::new(SUBSCRIBERS_DISCONNECTED_SLOW_TOTAL.clone())),
        REGISTRY.register(Box::new(DB_POOL_SIZE.clone())),
        REGISTRY.register(Box::new(DB_POOL_IN_USE.clone())),
        REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone())),
    ] {
        if let Err(e) = result {
            log::warn!("metric registration failed: {e}");
        }
    }
}

/// Encodes the registry in Prometheus text exposition format for the
/// `/metrics` route.
pub fn encode() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        log::warn!("metrics encode failed: {e}");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_under_repeated_registration_attempts() {
        init();
        init();
        let out = encode();
        assert!(!out.is_empty());
    }

    #[test]
    fn encode_includes_a_known_metric_name() {
        init();
        ACTIVE_CALLS.set(3);
        let out = String::from_utf8(encode()).unwrap();
        assert!(out.contains("active_calls"));
    }
}
