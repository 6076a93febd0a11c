//! Async uploader: a bounded FIFO of object-store PUT jobs fed by the local
//! write path. Enqueue never blocks; on a full queue the job is dropped
//! with a warning because the local copy is already authoritative.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::metrics;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub queue_size: usize,
    pub workers: usize,
    pub put_timeout: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            workers: 4,
            put_timeout: Duration::from_secs(30),
        }
    }
}

struct UploadJob {
    key: String,
    bytes: Bytes,
    content_type: String,
}

/// Put a single object. Implemented by the S3-backed object store; split
/// out as a trait so the uploader, reconciler, and pruner can share one
/// small async surface without depending on the full `AudioStore` trait.
#[async_trait::async_trait]
pub trait ObjectPut: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> anyhow::Result<()>;
}

pub struct AsyncUploader {
    sender: mpsc::Sender<UploadJob>,
    stopped: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl AsyncUploader {
    pub fn start(config: UploaderConfig, backend: Arc<dyn ObjectPut>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let stopped = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for worker_id in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let backend = backend.clone();
            let timeout = config.put_timeout;
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else {
                        log::debug!("upload worker {worker_id} exiting: channel closed");
                        break;
                    };
                    match tokio::time::timeout(
                        timeout,
                        backend.put(&job.key, job.bytes, &job.content_type),
                    )
                    .await
                    {
                        Ok(Ok(())) => {
                            metrics::AUDIO_UPLOADED_TOTAL.inc();
                        }
                        Ok(Err(e)) => {
                            log::warn!("object upload failed for {}: {e}", job.key);
                            metrics::AUDIO_UPLOAD_FAILED_TOTAL.inc();
                        }
                        Err(_) => {
                            log::warn!("object upload timed out for {}", job.key);
                            metrics::AUDIO_UPLOAD_FAILED_TOTAL.inc();
                        }
                    }
                }
            });
        }

        Self {
            sender,
            stopped,
            dropped,
        }
    }

    /// Non-blocking enqueue. Drops the job (and counts it) when the queue is
    /// full or the uploader has been stopped — never blocks the caller.
    pub fn enqueue(&self, key: String, bytes: Bytes, content_type: String) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        match self.sender.try_send(UploadJob {
            key,
            bytes,
            content_type,
        }) {
            Ok(()) => {}
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::UPLOAD_QUEUE_DROPPED_TOTAL.inc();
                log::warn!("async uploader queue full, dropping job (local copy is authoritative)");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting new jobs, closes the queue, and waits for in-flight
    /// workers to drain naturally as the channel empties and closes.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.sender.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingBackend {
        puts: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ObjectPut for CountingBackend {
        async fn put(&self, _key: &str, _bytes: Bytes, _content_type: &str) -> anyhow::Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("simulated failure")
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_never_blocks_and_processes_jobs() {
        let backend = Arc::new(CountingBackend {
            puts: AtomicUsize::new(0),
            fail: false,
        });
        let uploader = AsyncUploader::start(
            UploaderConfig {
                queue_size: 8,
                workers: 2,
                put_timeout: Duration::from_secs(1),
            },
            backend.clone(),
        );

        for i in 0..5 {
            uploader.enqueue(format!("k{i}"), Bytes::from_static(b"x"), "audio/wav".into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.puts.load(Ordering::SeqCst), 5);
        assert_eq!(uploader.dropped_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let backend = Arc::new(CountingBackend {
            puts: AtomicUsize::new(0),
            fail: false,
        });
        // Zero workers: nothing drains the queue, so it fills up fast.
        let uploader = AsyncUploader::start(
            UploaderConfig {
                queue_size: 1,
                workers: 0,
                put_timeout: Duration::from_secs(1),
            },
            backend,
        );
        for i in 0..10 {
            uploader.enqueue(format!("k{i}"), Bytes::from_static(b"x"), "audio/wav".into());
        }
        assert!(uploader.dropped_count() > 0);
    }
}
