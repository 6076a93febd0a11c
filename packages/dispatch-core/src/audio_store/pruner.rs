//! Cache pruner: evicts local audio once it is safely backed up, bounded by
//! age and/or total-bytes retention. Safety gate: never delete a file whose
//! key is absent from the object store (§8 invariant 8).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    pub interval: Duration,
    /// Zero disables the age bound.
    pub max_age: Duration,
    /// Zero disables the bytes bound.
    pub max_bytes: u64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_age: Duration::ZERO,
            max_bytes: 0,
        }
    }
}

#[async_trait::async_trait]
pub trait PrunerBackend: Send + Sync {
    async fn head(&self, key: &str) -> anyhow::Result<bool>;
}

pub struct CachePruner;

impl CachePruner {
    pub fn start(
        root: PathBuf,
        config: PrunerConfig,
        backend: Arc<dyn PrunerBackend>,
        cancel: CancellationToken,
    ) -> Self {
        tokio::spawn(async move {
            loop {
                if config.max_age == Duration::ZERO && config.max_bytes == 0 {
                    log::info!("cache pruner disabled (no age or byte bound configured)");
                    return;
                }
                if let Err(e) = run_cycle(&root, &config, backend.as_ref()).await {
                    log::warn!("pruner cycle failed: {e}");
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
        Self
    }
}

struct FileEntry {
    path: PathBuf,
    key: String,
    modified: SystemTime,
    size: u64,
}

async fn run_cycle(root: &Path, config: &PrunerConfig, backend: &dyn PrunerBackend) -> anyhow::Result<()> {
    let mut entries = Vec::new();
    let mut total_bytes: u64 = 0;

    for entry in walkdir::WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(key) = entry
            .path()
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
        else {
            continue;
        };
        total_bytes += meta.len();
        entries.push(FileEntry {
            path: entry.path().to_path_buf(),
            key,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        });
    }

    // Oldest-first so age-based and bytes-based pruning both converge on
    // the same eviction order.
    entries.sort_by_key(|e| e.modified);

    let now = SystemTime::now();
    for entry in entries {
        let age = now.duration_since(entry.modified).unwrap_or(Duration::ZERO);
        let over_age = config.max_age != Duration::ZERO && age > config.max_age;
        let over_bytes = config.max_bytes != 0 && total_bytes > config.max_bytes;
        if !over_age && !over_bytes {
            continue;
        }

        match backend.head(&entry.key).await {
            Ok(true) => {
                if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                    log::warn!("pruner failed to remove {}: {e}", entry.path.display());
                } else {
                    total_bytes = total_bytes.saturating_sub(entry.size);
                }
            }
            Ok(false) => {
                log::warn!(
                    "pruner skipping {}: not present in object store",
                    entry.key
                );
            }
            Err(e) => {
                log::warn!("pruner HEAD failed for {}: {e}", entry.key);
            }
        }
    }

    prune_empty_dirs(root);
    Ok(())
}

/// After each cycle, empty per-date and per-system directories are pruned.
fn prune_empty_dirs(root: &Path) {
    let Ok(systems) = std::fs::read_dir(root) else {
        return;
    };
    for system_dir in systems.flatten() {
        let system_path = system_dir.path();
        if !system_path.is_dir() {
            continue;
        }
        if let Ok(dates) = std::fs::read_dir(&system_path) {
            for date_dir in dates.flatten() {
                let date_path = date_dir.path();
                if date_path.is_dir() {
                    let _ = std::fs::remove_dir(&date_path);
                }
            }
        }
        let _ = std::fs::remove_dir(&system_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_both_bounds_disabled() {
        let config = PrunerConfig::default();
        assert_eq!(config.max_age, Duration::ZERO);
        assert_eq!(config.max_bytes, 0);
    }
}
