//! Local-disk leg of the audio store: the atomic temp-file-then-rename
//! write protocol, grounded on the donor's `ManualSpeakerConfig::save`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use super::{safe_join, AudioStore};
use crate::error::{EngineError, EngineResult};

pub struct LocalAudioStore {
    root: PathBuf,
}

impl LocalAudioStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Writes `bytes` to a sibling temp file (`.audio-*.tmp`) in the same
    /// directory as the destination, then renames into place. On any
    /// failure the temp file is removed rather than left behind.
    pub async fn write_atomic(&self, key: &str, bytes: &Bytes) -> EngineResult<PathBuf> {
        let dest = safe_join(&self.root, key)?;
        let dir = dest.parent().ok_or_else(|| {
            EngineError::AudioSaveLocal(format!("key {key} has no parent directory"))
        })?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp_name = format!(".audio-{}.tmp", uuid::Uuid::new_v4());
        let tmp_path = dir.join(tmp_name);

        if let Err(e) = tokio::fs::write(&tmp_path, bytes).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(EngineError::AudioSaveLocal(e.to_string()));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &dest).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(EngineError::AudioSaveLocal(e.to_string()));
        }

        Ok(dest)
    }
}

#[async_trait]
impl AudioStore for LocalAudioStore {
    async fn save(&self, key: &str, bytes: Bytes, _content_type: &str) -> EngineResult<()> {
        self.write_atomic(key, &bytes).await?;
        Ok(())
    }

    async fn open(&self, key: &str) -> EngineResult<Box<dyn AsyncRead + Send + Unpin>> {
        let path = safe_join(&self.root, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| EngineError::NotFound(format!("{key}: {e}")))?;
        Ok(Box::new(file))
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        safe_join(&self.root, key).ok().filter(|p| p.exists())
    }

    async fn url(&self, _key: &str) -> Option<String> {
        None
    }

    fn exists(&self, key: &str) -> bool {
        safe_join(&self.root, key)
            .map(|p| p.exists())
            .unwrap_or(false)
    }
}

impl LocalAudioStore {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalAudioStore::new(dir.path().to_path_buf());
        store
            .save("warco/2025-01-21/9179.wav", Bytes::from_static(b"RIFF..."), "audio/wav")
            .await
            .unwrap();
        assert!(store.exists("warco/2025-01-21/9179.wav"));

        let mut file = store.open("warco/2025-01-21/9179.wav").await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf).await.unwrap();
        assert_eq!(buf, b"RIFF...");
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalAudioStore::new(dir.path().to_path_buf());
        store
            .save("warco/2025-01-21/9179.wav", Bytes::from_static(b"x"), "audio/wav")
            .await
            .unwrap();
        let date_dir = dir.path().join("warco/2025-01-21");
        let leftover = std::fs::read_dir(&date_dir)
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().starts_with(".audio-"));
        assert!(!leftover);
    }

    #[tokio::test]
    async fn save_rejects_traversal_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalAudioStore::new(dir.path().to_path_buf());
        let result = store
            .save("../../etc/passwd", Bytes::from_static(b"x"), "audio/wav")
            .await;
        assert!(matches!(result, Err(EngineError::PathTraversal(_))));
    }
}
