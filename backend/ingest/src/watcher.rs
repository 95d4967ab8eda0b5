//! Upload directory watcher.
//!
//! Polls a directory on a fixed tick and submits every image file it has not
//! seen under its current `name:size:mtime` key. A file is only submitted once
//! its key is the same on two consecutive scans, so uploads still being
//! written are left alone. A rewritten file gets a new key and therefore a new
//! analysis; a restart re-submits known files, which the trigger maps back
//! onto their existing instances.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::trigger::{IngestTrigger, UploadEvent};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

pub struct DirectoryWatcher {
    dir: PathBuf,
    interval: Duration,
    /// Keys already submitted, limited to files still in the directory.
    seen: HashSet<String>,
    /// Key each unsubmitted file had on the previous scan.
    settling: HashMap<PathBuf, String>,
}

impl DirectoryWatcher {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            seen: HashSet::new(),
            settling: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List image files whose event key has not been seen yet and did not
    /// change since the previous scan, oldest name first.
    pub async fn scan_once(&mut self) -> Result<Vec<UploadEvent>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read upload directory {}", self.dir.display()))?;

        let mut events = Vec::new();
        let mut present = HashSet::new();
        let mut settling = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_image(&path) {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {}
                _ => continue,
            }
            let event = match UploadEvent::from_path(&path).await {
                Ok(event) => event,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable upload");
                    continue;
                }
            };
            present.insert(event.key.clone());
            if self.seen.contains(&event.key) {
                continue;
            }
            if self.settling.get(&path) == Some(&event.key) {
                self.seen.insert(event.key.clone());
                events.push(event);
            } else {
                debug!(path = %path.display(), "Upload not settled yet");
                settling.insert(path, event.key);
            }
        }
        // Forget files that were removed or rewritten.
        self.seen.retain(|key| present.contains(key));
        self.settling = settling;

        events.sort_by(|a, b| a.image.name.cmp(&b.image.name));
        Ok(events)
    }

    /// Tick until `shutdown` flips to true, submitting new uploads.
    pub async fn run(mut self, trigger: IngestTrigger, mut shutdown: watch::Receiver<bool>) {
        info!(
            dir = %self.dir.display(),
            interval_ms = self.interval.as_millis() as u64,
            "Upload watcher started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let events = match self.scan_once().await {
                        Ok(events) => events,
                        Err(e) => {
                            error!(error = %e, "Upload directory scan failed");
                            continue;
                        }
                    };
                    for event in events {
                        let key = event.key.clone();
                        if let Err(e) = trigger.submit(event).await {
                            // Forget the key so the next tick retries it.
                            self.seen.remove(&key);
                            error!(key = %key, error = %e, "Failed to start analysis");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(dir = %self.dir.display(), "Upload watcher stopped");
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_extensions() {
        assert!(is_image(Path::new("a/cat.PNG")));
        assert!(is_image(Path::new("sign.jpeg")));
        assert!(!is_image(Path::new("notes.txt")));
        assert!(!is_image(Path::new("README")));
    }

    #[tokio::test]
    async fn scan_reports_each_upload_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.png"), b"png").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"jpeg").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let mut watcher = DirectoryWatcher::new(dir.path(), Duration::from_millis(10));
        assert!(watcher.scan_once().await.unwrap().is_empty(), "first sighting only settles");
        let first = watcher.scan_once().await.unwrap();
        let names: Vec<&str> = first.iter().map(|e| e.image.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
        assert!(first[0].key.starts_with("a.jpg:4:"));

        assert!(watcher.scan_once().await.unwrap().is_empty());

        std::fs::write(dir.path().join("a.jpg"), b"jpeg, rewritten").unwrap();
        assert!(watcher.scan_once().await.unwrap().is_empty());
        let second = watcher.scan_once().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].instance_id(), first[0].instance_id());
    }

    #[tokio::test]
    async fn growing_file_waits_until_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.tif");
        let mut watcher = DirectoryWatcher::new(dir.path(), Duration::from_millis(10));

        std::fs::write(&path, b"II*").unwrap();
        assert!(watcher.scan_once().await.unwrap().is_empty());
        std::fs::write(&path, b"II*\0 partial upload").unwrap();
        assert!(watcher.scan_once().await.unwrap().is_empty());
        std::fs::write(&path, b"II*\0 partial upload, complete").unwrap();
        assert!(watcher.scan_once().await.unwrap().is_empty());

        let events = watcher.scan_once().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].key.starts_with("scan.tif:29:"));
    }

    #[tokio::test]
    async fn removed_files_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DirectoryWatcher::new(dir.path(), Duration::from_millis(10));
        for name in ["a.png", "b.png"] {
            std::fs::write(dir.path().join(name), b"png").unwrap();
        }
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap().len(), 2);
        assert_eq!(watcher.seen.len(), 2);

        std::fs::remove_file(dir.path().join("a.png")).unwrap();
        assert!(watcher.scan_once().await.unwrap().is_empty());
        assert_eq!(watcher.seen.len(), 1);
        assert!(watcher.settling.is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let mut watcher = DirectoryWatcher::new("/definitely/not/here", Duration::from_secs(1));
        assert!(watcher.scan_once().await.is_err());
    }
}
