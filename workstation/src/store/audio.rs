//! Filesystem store for voice blobs.
//!
//! Messages carry audio metadata only; the bytes live under
//! `<data>/audio/{input|output}/<session_id>/<message_id>.<ext>` and are
//! served on demand through `audio.request`.

use std::path::{Path, PathBuf};

use base64::Engine;
use tokio::fs;
use tracing::warn;

use tiflis_protocol::AudioDirection;

/// Blob store rooted at the daemon's data directory.
#[derive(Clone)]
pub struct AudioStore {
    root: PathBuf,
}

impl AudioStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("audio"),
        }
    }

    fn direction_dir(direction: AudioDirection) -> &'static str {
        match direction {
            AudioDirection::Input => "input",
            AudioDirection::Output => "output",
        }
    }

    /// Canonical path for one blob.
    pub fn blob_path(
        &self,
        direction: AudioDirection,
        session_id: &str,
        message_id: &str,
        ext: &str,
    ) -> PathBuf {
        self.root
            .join(Self::direction_dir(direction))
            .join(session_id)
            .join(format!("{message_id}.{ext}"))
    }

    /// Persist a blob and return its path as stored in the message record.
    pub async fn write(
        &self,
        direction: AudioDirection,
        session_id: &str,
        message_id: &str,
        ext: &str,
        bytes: &[u8],
    ) -> Result<String, std::io::Error> {
        let path = self.blob_path(direction, session_id, message_id, ext);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Read a blob back as base64, ready for an `audio.response` frame.
    /// Missing or unreadable blobs return `None` — the client resolves its
    /// pending playback callbacks with an empty result.
    pub async fn read_base64(&self, path: &str) -> Option<String> {
        match fs::read(path).await {
            Ok(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            Err(e) => {
                warn!("Audio blob {path} unreadable: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths_follow_the_layout() {
        let store = AudioStore::new(Path::new("/var/lib/tiflisd"));
        let path = store.blob_path(AudioDirection::Output, "supervisor", "s-1", "opus");
        assert_eq!(
            path,
            PathBuf::from("/var/lib/tiflisd/audio/output/supervisor/s-1.opus")
        );
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AudioStore::new(dir.path());
        let stored = store
            .write(AudioDirection::Input, "claude-abc12345", "m-1", "wav", b"RIFFdata")
            .await
            .unwrap();
        let encoded = store.read_base64(&stored).await.unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, b"RIFFdata");
    }

    #[tokio::test]
    async fn missing_blob_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = AudioStore::new(dir.path());
        assert!(store.read_base64("/nonexistent/blob.opus").await.is_none());
    }
}
