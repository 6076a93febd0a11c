//! Shutdown Orchestrator (C9): an ordered, bounded drain triggered by
//! SIGTERM/SIGINT. Each stage cancels one layer of the cancellation
//! hierarchy and waits for it to quiesce before moving to the next, so nothing
//! downstream ever observes a half-torn-down dependency. A hard deadline
//! forces process exit even if a stage hangs.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::audio_store::{LocalAudioStore, ObjectAudioStore, TieredAudioStore};
use crate::transcription::TranscriptionQueue;

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);
const DISPATCH_GRACE: Duration = Duration::from_millis(250);

/// The concrete audio store variant in use, so shutdown can drain the
/// uploader when one is present without the `AudioStore` trait needing a
/// shutdown method every variant must implement.
pub enum AudioStoreHandle {
    Local(Arc<LocalAudioStore>),
    Object(Arc<ObjectAudioStore>),
    Tiered(Arc<TieredAudioStore>),
}

impl AudioStoreHandle {
    async fn drain(&self) {
        if let Self::Tiered(store) = self {
            store.shutdown().await;
        }
    }
}

/// One cancellation token per stage of the drain sequence, all children of
/// one process-wide root so a partial shutdown never leaves an orphaned
/// scope. Bootstrap hands the relevant child token to each component at
/// construction time.
pub struct CancellationScopes {
    pub root: CancellationToken,
    pub ingest: CancellationToken,
    pub background: CancellationToken,
    pub subscribers: CancellationToken,
}

impl CancellationScopes {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        Self {
            ingest: root.child_token(),
            background: root.child_token(),
            subscribers: root.child_token(),
            root,
        }
    }
}

impl Default for CancellationScopes {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ShutdownCoordinator {
    scopes: CancellationScopes,
    transcription: Arc<TranscriptionQueue>,
    audio_store: AudioStoreHandle,
    pool: PgPool,
}

impl ShutdownCoordinator {
    pub fn new(
        scopes: CancellationScopes,
        transcription: Arc<TranscriptionQueue>,
        audio_store: AudioStoreHandle,
        pool: PgPool,
    ) -> Self {
        Self {
            scopes,
            transcription,
            audio_store,
            pool,
        }
    }

    /// Runs the full drain sequence, forcing return after [`DRAIN_DEADLINE`]
    /// regardless of how far the sequence got.
    pub async fn shutdown(self) {
        match tokio::time::timeout(DRAIN_DEADLINE, self.drain_sequence()).await {
            Ok(()) => log::info!("shutdown: drain sequence completed cleanly"),
            Err(_) => log::warn!("shutdown: {}s deadline reached, forcing exit", DRAIN_DEADLINE.as_secs()),
        }
    }

    async fn drain_sequence(&self) {
        // 1. Stop ingest: no new records enter the pipeline from this point.
        log::info!("shutdown: stopping ingest sources");
        self.scopes.ingest.cancel();

        // 2. Drain the dispatcher: there is no internal queue to close, only
        // in-flight handler calls already running on tasks we just asked to
        // stop producing more work. Give them a short grace window to finish
        // the record they're mid-dispatch on.
        tokio::time::sleep(DISPATCH_GRACE).await;

        // 3. Stop transcription enqueue and let queued workers finish.
        log::info!("shutdown: draining transcription queue");
        self.transcription.stop().await;

        // 4. Stop the async uploader and drain its workers.
        log::info!("shutdown: draining audio store uploader");
        self.audio_store.drain().await;

        // 5. Stop reconciler/pruner background sweeps.
        log::info!("shutdown: stopping reconciler and pruner");
        self.scopes.background.cancel();

        // 6. Close subscribers: SSE connections and the heartbeat task.
        log::info!("shutdown: closing subscribers");
        self.scopes.subscribers.cancel();

        // 7. Close the DB pool.
        log::info!("shutdown: closing database pool");
        self.pool.close().await;

        // 8. Cancel whatever remains on the root scope (belt and suspenders
        // for any task that only watches the root token directly).
        self.scopes.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_scopes_are_distinct_tokens() {
        let scopes = CancellationScopes::new();
        assert!(!scopes.ingest.is_cancelled());
        scopes.ingest.cancel();
        assert!(scopes.ingest.is_cancelled());
        assert!(!scopes.background.is_cancelled());
        assert!(!scopes.subscribers.is_cancelled());
    }

    #[tokio::test]
    async fn drain_sequence_cancels_every_scope() {
        let scopes = CancellationScopes::new();
        let ingest = scopes.ingest.clone();
        let background = scopes.background.clone();
        let subscribers = scopes.subscribers.clone();
        let pool = PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap();
        let transcription = Arc::new(TranscriptionQueue::start(
            pool.clone(),
            Default::default(),
            Arc::new(NoopSttBackend),
        ));
        let dir = tempfile::tempdir().unwrap();
        let coordinator = ShutdownCoordinator::new(
            scopes,
            transcription,
            AudioStoreHandle::Local(Arc::new(LocalAudioStore::new(dir.path().to_path_buf()))),
            pool,
        );

        coordinator.shutdown().await;

        assert!(ingest.is_cancelled());
        assert!(background.is_cancelled());
        assert!(subscribers.is_cancelled());
    }

    struct NoopSttBackend;

    #[async_trait::async_trait]
    impl crate::transcription::SttBackend for NoopSttBackend {
        async fn transcribe(&self, _audio_path: &str) -> anyhow::Result<crate::transcription::TranscriptResult> {
            Ok(crate::transcription::TranscriptResult {
                text: String::new(),
                word_count: 0,
            })
        }
    }
}
