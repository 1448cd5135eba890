//! Durable fallback queue for undeliverable audit batches
//!
//! Batches that exhausted their retries are appended as newline-delimited
//! JSON under a process-owned directory, laid out as
//! `<base>/<YYYYMMDD>/<HHMMSS>-<seq>.jsonl`. Appends are serialized by one
//! async lock; readers work on closed file contents and never take it.
//! Files rotate by size.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;
use crate::audit::AuditEvent;

/// One fallback line: a batch that could not be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackEntry {
    /// Destination the batch was meant for
    pub destination: String,
    /// When delivery was abandoned
    pub failed_at: DateTime<Utc>,
    /// The undelivered events
    pub events: Vec<AuditEvent>,
    /// The final error that exhausted the retries
    pub last_error: String,
}

struct ActiveFile {
    path: PathBuf,
    bytes_written: u64,
    seq: u32,
}

/// Append-only local queue of undelivered batches.
pub struct FallbackQueue {
    base_dir: PathBuf,
    rotate_bytes: u64,
    writer: Mutex<Option<ActiveFile>>,
}

impl FallbackQueue {
    /// Create over `base_dir`, rotating files at `rotate_bytes`.
    #[must_use]
    pub fn new(base_dir: PathBuf, rotate_bytes: u64) -> Self {
        Self {
            base_dir,
            rotate_bytes: rotate_bytes.max(1),
            writer: Mutex::new(None),
        }
    }

    /// Default location: a process-owned subdirectory of the system temp
    /// area. Never the shared temp root itself — a fixed well-known path
    /// there would be open to symlink squatting.
    #[must_use]
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir()
            .join(format!("sark-{}", std::process::id()))
            .join("siem_fallback")
    }

    /// Base directory (for the health surface).
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.base_dir
    }

    /// Append one undelivered batch.
    pub async fn append(
        &self,
        destination: &str,
        events: &[AuditEvent],
        last_error: &str,
    ) -> Result<()> {
        let entry = FallbackEntry {
            destination: destination.to_string(),
            failed_at: Utc::now(),
            events: events.to_vec(),
            last_error: last_error.to_string(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let needs_new = match writer.as_ref() {
            None => true,
            Some(active) => active.bytes_written >= self.rotate_bytes,
        };
        if needs_new {
            let seq = writer.as_ref().map_or(0, |a| a.seq + 1);
            let path = self.next_path(seq).await?;
            *writer = Some(ActiveFile {
                path,
                bytes_written: 0,
                seq,
            });
        }

        let active = writer.as_mut().expect("writer initialized above");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        active.bytes_written += line.len() as u64;

        debug!(
            destination,
            events = entry.events.len(),
            file = %active.path.display(),
            "Batch appended to fallback queue"
        );
        Ok(())
    }

    /// Every entry currently on disk, oldest file first.
    pub async fn read_all(&self) -> Result<Vec<FallbackEntry>> {
        let mut entries = Vec::new();
        for path in self.files().await? {
            entries.extend(read_entries(&path).await?);
        }
        Ok(entries)
    }

    /// All fallback files, oldest first, with their parsed entries.
    /// Used by the replay sweep; unparseable lines are skipped with a warning.
    pub async fn files_with_entries(&self) -> Result<Vec<(PathBuf, Vec<FallbackEntry>)>> {
        let mut out = Vec::new();
        for path in self.files().await? {
            out.push((path.clone(), read_entries(&path).await?));
        }
        Ok(out)
    }

    /// Remove a fully replayed file.
    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        // Never let the replay sweep delete the file the writer is appending to.
        let mut writer = self.writer.lock().await;
        if writer.as_ref().is_some_and(|a| a.path == path) {
            *writer = None;
        }
        drop(writer);
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    /// Replace a file's contents with the entries that still need delivery.
    pub async fn rewrite_file(&self, path: &Path, remaining: &[FallbackEntry]) -> Result<()> {
        let mut content = String::new();
        for entry in remaining {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn next_path(&self, seq: u32) -> Result<PathBuf> {
        let now = Utc::now();
        let dir = self.base_dir.join(now.format("%Y%m%d").to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir.join(format!("{}-{seq:04}.jsonl", now.format("%H%M%S"))))
    }

    async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut day_dirs = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(day) = day_dirs.next_entry().await? {
            if !day.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = tokio::fs::read_dir(day.path()).await?;
            while let Some(file) = inner.next_entry().await? {
                let path = file.path();
                if path.extension().is_some_and(|e| e == "jsonl") {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

async fn read_entries(path: &Path) -> Result<Vec<FallbackEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<FallbackEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Skipping unparseable fallback line");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::EventKind;

    fn events(n: usize) -> Vec<AuditEvent> {
        (0..n).map(|_| AuditEvent::new(EventKind::PolicyDeny)).collect()
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = FallbackQueue::new(tmp.path().to_path_buf(), 1024 * 1024);

        queue
            .append("splunk-main", &events(2), "connection refused")
            .await
            .expect("append");
        queue.append("datadog", &events(1), "502").await.expect("append");

        let entries = queue.read_all().await.expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].destination, "splunk-main");
        assert_eq!(entries[0].events.len(), 2);
        assert_eq!(entries[0].last_error, "connection refused");
        assert_eq!(entries[1].destination, "datadog");
    }

    #[tokio::test]
    async fn empty_queue_reads_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = FallbackQueue::new(tmp.path().join("never-created"), 1024);
        assert!(queue.read_all().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn files_rotate_at_the_size_bound() {
        let tmp = tempfile::tempdir().expect("tempdir");
        // Tiny bound: every append lands in a fresh file.
        let queue = FallbackQueue::new(tmp.path().to_path_buf(), 1);

        queue.append("d", &events(1), "e1").await.expect("append");
        queue.append("d", &events(1), "e2").await.expect("append");
        queue.append("d", &events(1), "e3").await.expect("append");

        let files = queue.files().await.expect("list");
        assert_eq!(files.len(), 3, "one file per append at a 1-byte bound");
        // Layout: <base>/<YYYYMMDD>/<HHMMSS>-<seq>.jsonl
        let name = files[0].file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.ends_with(".jsonl"));
        assert!(name.contains('-'));
    }

    #[tokio::test]
    async fn rewrite_keeps_only_remaining_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = FallbackQueue::new(tmp.path().to_path_buf(), 1024 * 1024);
        queue.append("a", &events(1), "x").await.expect("append");
        queue.append("b", &events(1), "x").await.expect("append");

        let files = queue.files_with_entries().await.expect("list");
        assert_eq!(files.len(), 1);
        let (path, entries) = &files[0];
        assert_eq!(entries.len(), 2);

        queue.rewrite_file(path, &entries[1..]).await.expect("rewrite");
        let remaining = queue.read_all().await.expect("read");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].destination, "b");
    }

    #[tokio::test]
    async fn remove_file_clears_replayed_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let queue = FallbackQueue::new(tmp.path().to_path_buf(), 1024 * 1024);
        queue.append("a", &events(1), "x").await.expect("append");

        let files = queue.files().await.expect("list");
        queue.remove_file(&files[0]).await.expect("remove");
        assert!(queue.read_all().await.expect("read").is_empty());

        // The writer re-creates a file on the next append.
        queue.append("a", &events(1), "y").await.expect("append");
        assert_eq!(queue.read_all().await.expect("read").len(), 1);
    }

    #[test]
    fn default_dir_is_process_owned() {
        let dir = FallbackQueue::default_dir();
        let s = dir.to_string_lossy();
        assert!(s.contains(&format!("sark-{}", std::process::id())));
        assert!(s.ends_with("siem_fallback"));
    }
}
