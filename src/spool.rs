//! Notification spool for an external mailer.
//!
//! Each message becomes one JSON file. Files are written under a `.tmp`
//! name and renamed, so a reader polling for `*.json` never sees a partial
//! message.

use std::path::PathBuf;

use async_trait::async_trait;
use faxline_delivery::{DeliveryError, NotificationMessage, NotificationSink};
use tracing::debug;
use uuid::Uuid;

/// Writes notifications into a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolSink {
    dir: PathBuf,
}

impl SpoolSink {
    /// Creates a sink writing into `dir`; the directory is created on first
    /// use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl NotificationSink for SpoolSink {
    async fn send(&self, message: NotificationMessage) -> faxline_delivery::Result<()> {
        let spool_error = |e: std::io::Error| {
            DeliveryError::notification(format!("spool {}: {e}", self.dir.display()))
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(spool_error)?;

        let body = serde_json::to_vec_pretty(&message)
            .map_err(|e| DeliveryError::serialization(e.to_string()))?;
        let name = Uuid::new_v4();
        let staging = self.dir.join(format!("{name}.tmp"));
        let path = self.dir.join(format!("{name}.json"));

        tokio::fs::write(&staging, body).await.map_err(spool_error)?;
        tokio::fs::rename(&staging, &path).await.map_err(spool_error)?;

        debug!(path = %path.display(), to = %message.to, "notification spooled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> NotificationMessage {
        NotificationMessage {
            to: "ops@example.com".to_string(),
            subject: "Fax Failed to 13105550000".to_string(),
            body: "Your fax transmission has failed (USER_BUSY).".to_string(),
        }
    }

    #[tokio::test]
    async fn writes_one_json_file_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SpoolSink::new(dir.path().join("outbox"));

        sink.send(message()).await.unwrap();
        sink.send(message()).await.unwrap();

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path().join("outbox")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            files.push(entry.path());
        }

        assert_eq!(files.len(), 2);
        for file in files {
            assert_eq!(file.extension().and_then(|e| e.to_str()), Some("json"));
            let stored: NotificationMessage =
                serde_json::from_slice(&tokio::fs::read(&file).await.unwrap()).unwrap();
            assert_eq!(stored, message());
        }
    }

    #[tokio::test]
    async fn unwritable_spool_is_a_notification_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        tokio::fs::write(&blocker, b"not a directory").await.unwrap();

        let err = SpoolSink::new(&blocker).send(message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotificationFailed { .. }));
    }
}
