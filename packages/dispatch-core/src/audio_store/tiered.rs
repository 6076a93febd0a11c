//! Tiered store: local disk is primary and authoritative for `save`/`open`;
//! the object store is a best-effort backup fed asynchronously through the
//! uploader queue, topped up by the reconciler and trimmed by the pruner.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use super::{AsyncUploader, AudioStore, LocalAudioStore, ObjectAudioStore};
use crate::error::EngineResult;

pub struct TieredAudioStore {
    local: LocalAudioStore,
    remote: Arc<ObjectAudioStore>,
    uploader: AsyncUploader,
}

impl TieredAudioStore {
    pub fn new(local: LocalAudioStore, remote: Arc<ObjectAudioStore>, uploader: AsyncUploader) -> Self {
        Self {
            local,
            remote,
            uploader,
        }
    }

    pub async fn shutdown(&self) {
        self.uploader.stop().await;
    }
}

#[async_trait]
impl AudioStore for TieredAudioStore {
    /// Writes locally and returns as soon as that succeeds (§8 invariant 6:
    /// the local write is durable before `save` returns). The object-store
    /// copy is enqueued but never awaited here.
    async fn save(&self, key: &str, bytes: Bytes, content_type: &str) -> EngineResult<()> {
        self.local.write_atomic(key, &bytes).await?;
        self.uploader
            .enqueue(key.to_string(), bytes, content_type.to_string());
        Ok(())
    }

    async fn open(&self, key: &str) -> EngineResult<Box<dyn AsyncRead + Send + Unpin>> {
        if self.local.exists(key) {
            return self.local.open(key).await;
        }
        self.remote.open(key).await
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.local.local_path(key)
    }

    async fn url(&self, key: &str) -> Option<String> {
        if self.local.exists(key) {
            return None;
        }
        self.remote.url(key).await
    }

    fn exists(&self, key: &str) -> bool {
        self.local.exists(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_store::UploaderConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingBackend {
        puts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::audio_store::ObjectPut for RecordingBackend {
        async fn put(&self, _key: &str, _bytes: Bytes, _content_type: &str) -> anyhow::Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn save_returns_after_local_write_and_enqueues_remote() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalAudioStore::new(dir.path().to_path_buf());
        let puts = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(RecordingBackend { puts: puts.clone() });
        let uploader = AsyncUploader::start(
            UploaderConfig {
                queue_size: 8,
                workers: 1,
                put_timeout: std::time::Duration::from_secs(1),
            },
            backend,
        );

        // remote isn't exercised by `save` directly in this test since it
        // only needs the uploader path; build a throwaway client-backed
        // store purely to satisfy TieredAudioStore's field type would
        // require AWS config, so this test exercises LocalAudioStore +
        // AsyncUploader wiring directly instead of the full tiered facade.
        local
            .write_atomic("sys/2025-01-21/1.wav", &Bytes::from_static(b"x"))
            .await
            .unwrap();
        uploader.enqueue("sys/2025-01-21/1.wav".into(), Bytes::from_static(b"x"), "audio/wav".into());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(puts.load(Ordering::SeqCst), 1);
        assert!(local.exists("sys/2025-01-21/1.wav"));
    }
}
