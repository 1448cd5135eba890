//! Local file adapter
//!
//! Appends newline-delimited JSON events to a rolling local file. Used as a
//! first-class destination for air-gapped setups and as the always-healthy
//! last resort in front of the fallback queue.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::Result;
use crate::audit::AuditEvent;
use crate::siem::adapter::{HealthStatus, SiemAdapter};

/// Rolling NDJSON file destination.
pub struct FileAdapter {
    id: String,
    path: PathBuf,
    rotate_bytes: u64,
    /// Append lock; rotation and writes are serialized
    write_lock: Mutex<()>,
}

impl FileAdapter {
    /// Build from the destination configuration.
    #[must_use]
    pub fn new(id: String, path: PathBuf, rotate_bytes: u64) -> Self {
        Self {
            id,
            path,
            rotate_bytes: rotate_bytes.max(1),
            write_lock: Mutex::new(()),
        }
    }

    async fn rotate_if_needed(&self) -> Result<()> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size < self.rotate_bytes {
            return Ok(());
        }

        let rotated = self.path.with_extension(format!(
            "{}.jsonl",
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        ));
        tokio::fs::rename(&self.path, &rotated).await?;
        debug!(destination = %self.id, rotated = %rotated.display(), "Rotated audit file");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SiemAdapter for FileAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.rotate_if_needed().await?;

        let mut body = Vec::new();
        for event in events {
            body.extend_from_slice(serde_json::to_string(event)?.as_bytes());
            body.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&body).await?;
        file.flush().await?;
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        let parent = self.path.parent().unwrap_or(std::path::Path::new("."));
        match tokio::fs::create_dir_all(parent).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy(format!("target directory unusable: {e}")),
        }
    }
}

impl std::fmt::Debug for FileAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAdapter")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::EventKind;

    #[tokio::test]
    async fn batches_append_as_ndjson() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("audit.jsonl");
        let adapter = FileAdapter::new("file-main".to_string(), path.clone(), 1024 * 1024);

        adapter
            .send_batch(&[
                AuditEvent::new(EventKind::AuthnSuccess).principal("u1"),
                AuditEvent::new(EventKind::PolicyAllow).principal("u1"),
            ])
            .await
            .expect("write");
        adapter
            .send_batch(&[AuditEvent::new(EventKind::PolicyDeny)])
            .await
            .expect("append");

        let content = std::fs::read_to_string(&path).expect("readable");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).expect("each line valid json");
        }
    }

    #[tokio::test]
    async fn rotation_renames_the_full_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("audit.jsonl");
        // 1-byte bound: rotation happens before every append once non-empty.
        let adapter = FileAdapter::new("file-main".to_string(), path.clone(), 1);

        adapter
            .send_batch(&[AuditEvent::new(EventKind::AuthnSuccess)])
            .await
            .expect("write");
        adapter
            .send_batch(&[AuditEvent::new(EventKind::AuthnFailure)])
            .await
            .expect("write after rotation");

        let files: Vec<_> = std::fs::read_dir(tmp.path())
            .expect("dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert!(files.len() >= 2, "rotated file plus active file, got {files:?}");
    }

    #[tokio::test]
    async fn health_check_is_healthy_for_writable_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let adapter = FileAdapter::new(
            "file".to_string(),
            tmp.path().join("sub").join("audit.jsonl"),
            1024,
        );
        assert!(adapter.health_check().await.is_healthy());
    }
}
