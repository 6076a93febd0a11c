//! Reconciler: periodic sweeper that replays uploads the async uploader
//! missed (queue was full, process crashed mid-upload, object store was
//! briefly unreachable).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::metrics;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub startup_delay: Duration,
    /// §9 open question: left configurable, default 24h.
    pub window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            startup_delay: Duration::from_secs(120),
            window: Duration::from_secs(24 * 3600),
        }
    }
}

#[async_trait::async_trait]
pub trait ReconcilerBackend: Send + Sync {
    async fn head(&self, key: &str) -> anyhow::Result<bool>;
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct ReconcilerStats {
    pub checked: AtomicU64,
    pub uploaded: AtomicU64,
    pub failed: AtomicU64,
}

pub struct Reconciler {
    stats: Arc<ReconcilerStats>,
}

impl Reconciler {
    /// Spawns the periodic sweep as a background task and returns a handle
    /// exposing live counters. The task itself is cancelled via `cancel`.
    pub fn start(
        root: PathBuf,
        config: ReconcilerConfig,
        backend: Arc<dyn ReconcilerBackend>,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(ReconcilerStats::default());
        let task_stats = stats.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(config.startup_delay) => {}
                _ = cancel.cancelled() => return,
            }

            loop {
                if let Err(e) = run_cycle(&root, &config, backend.as_ref(), &task_stats).await {
                    log::warn!("reconciler cycle failed: {e}");
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });

        Self { stats }
    }

    pub fn checked(&self) -> u64 {
        self.stats.checked.load(Ordering::Relaxed)
    }
    pub fn uploaded(&self) -> u64 {
        self.stats.uploaded.load(Ordering::Relaxed)
    }
    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }
}

async fn run_cycle(
    root: &Path,
    config: &ReconcilerConfig,
    backend: &dyn ReconcilerBackend,
    stats: &ReconcilerStats,
) -> anyhow::Result<()> {
    let cutoff = chrono::Utc::now() - chrono::Duration::from_std(config.window)?;

    // Layout is <root>/<short_name>/<YYYY-MM-DD>/<filename>, so files sit at
    // depth 3 relative to root.
    for entry in walkdir::WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
    {
        let Some(date_dir) = entry.path().parent().and_then(|p| p.file_name()) else {
            continue;
        };
        let Some(date_str) = date_dir.to_str() else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        if date.and_hms_opt(0, 0, 0).unwrap().and_utc() < cutoff {
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let key = entry
            .path()
            .strip_prefix(root)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");

        stats.checked.fetch_add(1, Ordering::Relaxed);
        metrics::RECONCILER_CHECKED_TOTAL.inc();

        match tokio::time::timeout(Duration::from_secs(5), backend.head(&key)).await {
            Ok(Ok(true)) => continue,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                log::warn!("reconciler HEAD failed for {key}: {e}");
                continue;
            }
            Err(_) => {
                log::warn!("reconciler HEAD timed out for {key}");
                continue;
            }
        }

        let bytes = match tokio::fs::read(entry.path()).await {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                log::warn!("reconciler read failed for {key}: {e}");
                continue;
            }
        };

        match tokio::time::timeout(
            Duration::from_secs(30),
            backend.put(&key, bytes, "application/octet-stream"),
        )
        .await
        {
            Ok(Ok(())) => {
                stats.uploaded.fetch_add(1, Ordering::Relaxed);
                metrics::RECONCILER_UPLOADED_TOTAL.inc();
            }
            _ => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::RECONCILER_FAILED_TOTAL.inc();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_is_24_hours() {
        assert_eq!(ReconcilerConfig::default().window, Duration::from_secs(24 * 3600));
    }
}
