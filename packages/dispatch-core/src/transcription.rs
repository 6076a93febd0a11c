//! Transcription Queue (C5): a bounded queue feeding a fixed worker pool
//! that streams audio to an STT backend and denormalizes the result onto
//! the `call` and `call_group` rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::error::EngineResult;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub queue_size: usize,
    pub workers: usize,
    pub request_timeout: Duration,
    pub min_duration: f64,
    pub max_duration: f64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            queue_size: 128,
            workers: 2,
            request_timeout: Duration::from_secs(60),
            min_duration: 1.0,
            max_duration: 300.0,
        }
    }
}

/// STT backend abstraction. The production implementation wraps a
/// `reqwest::Client` POSTing audio bytes to a configured endpoint.
#[async_trait]
pub trait SttBackend: Send + Sync {
    async fn transcribe(&self, audio_path: &str) -> anyhow::Result<TranscriptResult>;
}

pub struct TranscriptResult {
    pub text: String,
    pub word_count: i32,
}

pub struct ReqwestSttBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl ReqwestSttBackend {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl SttBackend for ReqwestSttBackend {
    async fn transcribe(&self, audio_path: &str) -> anyhow::Result<TranscriptResult> {
        let bytes = tokio::fs::read(audio_path).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name("audio.wav");
        let form = reqwest::multipart::Form::new().part("audio", part);
        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        let text = body
            .get("text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let word_count = text.split_whitespace().count() as i32;
        Ok(TranscriptResult { text, word_count })
    }
}

struct Job {
    call_id: String,
    call_start_time: chrono::DateTime<chrono::Utc>,
    audio_path: String,
    call_group_id: Option<i64>,
}

pub struct TranscriptionQueue {
    sender: mpsc::Sender<Job>,
    stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl TranscriptionQueue {
    pub fn start(pool: PgPool, config: TranscriptionConfig, backend: Arc<dyn SttBackend>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker_id in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let pool = pool.clone();
            let backend = backend.clone();
            let timeout = config.request_timeout;
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else {
                        log::debug!("transcription worker {worker_id} exiting: channel closed");
                        break;
                    };
                    process_job(&pool, backend.as_ref(), job, timeout).await;
                }
            });
        }

        Self {
            sender,
            stopped: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Enqueues a call for transcription if it passes the filtering rules
    /// (§4.5: not encrypted, duration in range, audio present — enforced by
    /// the caller before this is invoked). Non-blocking: a full queue marks
    /// the call `transcription_status = skipped_queue_full` and counts it.
    pub async fn enqueue(
        &self,
        call_id: String,
        call_start_time: chrono::DateTime<chrono::Utc>,
        audio_path: String,
        call_group_id: Option<i64>,
        pool: &PgPool,
    ) {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            log::debug!("transcription queue stopped, dropping job for call {call_id}");
            return;
        }
        metrics::TRANSCRIPTION_QUEUE_DEPTH.set(self.sender.capacity() as i64);
        if self
            .sender
            .try_send(Job {
                call_id: call_id.clone(),
                call_start_time,
                audio_path,
                call_group_id,
            })
            .is_err()
        {
            metrics::TRANSCRIPTIONS_SKIPPED_TOTAL.with_label_values(&["queue_full"]).inc();
            let _ = sqlx::query("UPDATE calls SET transcription_status = 'skipped_queue_full' WHERE call_id = $1")
                .bind(&call_id)
                .execute(pool)
                .await;
        }
    }

    /// Stops accepting new jobs and waits for workers to drain whatever is
    /// already queued. Mirrors the async uploader's stop semantics.
    pub async fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::Release);
        self.sender.closed().await;
    }
}

async fn process_job(pool: &PgPool, backend: &dyn SttBackend, job: Job, timeout: Duration) {
    metrics::TRANSCRIPTIONS_REQUESTED_TOTAL.inc();
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(timeout, backend.transcribe(&job.audio_path)).await;
    metrics::TRANSCRIPTION_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());

    match outcome {
        Ok(Ok(result)) => {
            if let Err(e) = persist_transcription(pool, &job, &result).await {
                log::warn!("failed to persist transcription for {}: {e}", job.call_id);
                metrics::TRANSCRIPTIONS_FAILED_TOTAL.inc();
                return;
            }
            metrics::TRANSCRIPTIONS_SUCCEEDED_TOTAL.inc();
        }
        Ok(Err(e)) => {
            log::warn!("STT request failed for {}: {e}", job.call_id);
            metrics::TRANSCRIPTIONS_FAILED_TOTAL.inc();
            let _ = sqlx::query("UPDATE calls SET transcription_status = 'failed' WHERE call_id = $1")
                .bind(&job.call_id)
                .execute(pool)
                .await;
        }
        Err(_) => {
            log::warn!("STT request timed out for {}", job.call_id);
            metrics::TRANSCRIPTIONS_FAILED_TOTAL.inc();
            let _ = sqlx::query("UPDATE calls SET transcription_status = 'failed' WHERE call_id = $1")
                .bind(&job.call_id)
                .execute(pool)
                .await;
        }
    }
}

async fn persist_transcription(pool: &PgPool, job: &Job, result: &TranscriptResult) -> EngineResult<()> {
    let mut tx = pool.begin().await?;

    // At most one primary transcription per call: clear any prior flag
    // before inserting the new one.
    sqlx::query("UPDATE transcriptions SET is_primary = false WHERE call_id = $1")
        .bind(&job.call_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r"
        INSERT INTO transcriptions (call_id, call_start_time, is_primary, text, word_count, status)
        VALUES ($1, $2, true, $3, $4, 'done')
        ",
    )
    .bind(&job.call_id)
    .bind(job.call_start_time)
    .bind(&result.text)
    .bind(result.word_count)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r"
        UPDATE calls SET transcription_text = $2, transcription_word_count = $3, transcription_status = 'done', call_state = 'DONE'
        WHERE call_id = $1
        ",
    )
    .bind(&job.call_id)
    .bind(&result.text)
    .bind(result.word_count)
    .execute(&mut *tx)
    .await?;

    if let Some(call_group_id) = job.call_group_id {
        sqlx::query(
            r"
            UPDATE call_groups SET primary_call_id = COALESCE(primary_call_id, $2)
            WHERE call_group_id = $1
            ",
        )
        .bind(call_group_id)
        .bind(&job.call_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Filtering rules applied before a call reaches the queue (§4.5).
pub fn should_transcribe(encrypted: bool, duration: Option<f64>, has_audio: bool, config: &TranscriptionConfig) -> bool {
    if encrypted || !has_audio {
        return false;
    }
    match duration {
        Some(d) => d >= config.min_duration && d <= config.max_duration,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_calls_are_never_transcribed() {
        let config = TranscriptionConfig::default();
        assert!(!should_transcribe(true, Some(10.0), true, &config));
    }

    #[test]
    fn missing_audio_is_skipped() {
        let config = TranscriptionConfig::default();
        assert!(!should_transcribe(false, Some(10.0), false, &config));
    }

    #[test]
    fn duration_outside_range_is_skipped() {
        let config = TranscriptionConfig::default();
        assert!(!should_transcribe(false, Some(0.1), true, &config));
        assert!(!should_transcribe(false, Some(500.0), true, &config));
        assert!(should_transcribe(false, Some(10.0), true, &config));
    }
}
