//! Tiered Audio Store (C4).
//!
//! One [`AudioStore`] interface over three concrete variants: local-only,
//! object-only, and tiered (local primary + object backup). The local leg's
//! write protocol is grounded on the donor's `ManualSpeakerConfig::save`
//! atomic temp-file-then-rename pattern; the object leg is an async,
//! best-effort backup fed by a bounded uploader queue.

mod local;
mod object;
mod pruner;
mod reconciler;
mod tiered;
mod uploader;

pub use local::LocalAudioStore;
pub use object::ObjectAudioStore;
pub use pruner::{CachePruner, PrunerConfig};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use tiered::TieredAudioStore;
pub use uploader::{AsyncUploader, ObjectPut, UploaderConfig};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::{EngineError, EngineResult};

/// Joins `key` against `root` and rejects any resolution that escapes it.
/// §8 invariant 7: the absolute resolved path always has the audio root as
/// a prefix.
pub fn safe_join(root: &Path, key: &str) -> EngineResult<PathBuf> {
    if key.contains("..") || key.starts_with('/') || key.contains('\0') {
        return Err(EngineError::PathTraversal(key.to_string()));
    }
    let joined = root.join(key);
    let root_abs = dunce_canonicalize_best_effort(root);
    let joined_abs = dunce_canonicalize_best_effort(&joined);
    if !joined_abs.starts_with(&root_abs) {
        return Err(EngineError::PathTraversal(key.to_string()));
    }
    Ok(joined)
}

/// `canonicalize` requires the path to exist; fall back to lexical
/// normalization for paths that don't exist yet (e.g. a save's destination).
fn dunce_canonicalize_best_effort(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    out.pop();
                }
                std::path::Component::CurDir => {}
                other => out.push(other.as_os_str()),
            }
        }
        out
    })
}

/// Builds the on-disk key for an audio artifact: `{short_name}/{YYYY-MM-DD}/{filename}`.
pub fn audio_key(short_name: &str, date: chrono::NaiveDate, filename: &str) -> String {
    format!("{short_name}/{}/{filename}", date.format("%Y-%m-%d"))
}

/// Builds the object-store key layout: `<prefix>/audio/...` or `audio/...`.
pub fn object_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}/audio/{key}"),
        _ => format!("audio/{key}"),
    }
}

#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Durable return after the local write succeeds; the object-store leg
    /// (if configured) is best-effort and asynchronous.
    async fn save(&self, key: &str, bytes: Bytes, content_type: &str) -> EngineResult<()>;

    /// Local hit first; on miss, fetches from the object store and caches
    /// locally before returning.
    async fn open(&self, key: &str) -> EngineResult<Box<dyn AsyncRead + Send + Unpin>>;

    fn local_path(&self, key: &str) -> Option<PathBuf>;
    async fn url(&self, key: &str) -> Option<String>;
    fn exists(&self, key: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dotdot_traversal() {
        let root = Path::new("/data/audio");
        assert!(safe_join(root, "../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_absolute_key() {
        let root = Path::new("/data/audio");
        assert!(safe_join(root, "/etc/passwd").is_err());
    }

    #[test]
    fn accepts_well_formed_key() {
        let root = Path::new("/data/audio");
        let resolved = safe_join(root, "warco/2025-01-21/9179.wav").unwrap();
        assert_eq!(resolved, PathBuf::from("/data/audio/warco/2025-01-21/9179.wav"));
    }

    #[test]
    fn object_key_includes_prefix_when_configured() {
        assert_eq!(object_key(Some("fleet1"), "warco/x.wav"), "fleet1/audio/warco/x.wav");
        assert_eq!(object_key(None, "warco/x.wav"), "audio/warco/x.wav");
        assert_eq!(object_key(Some(""), "warco/x.wav"), "audio/warco/x.wav");
    }

    #[test]
    fn audio_key_layout_matches_spec() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 1, 21).unwrap();
        assert_eq!(audio_key("warco", date, "9179-123.wav"), "warco/2025-01-21/9179-123.wav");
    }
}
