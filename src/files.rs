//! Scratch directory ownership: job naming, discovery and reclamation.
//!
//! Every file this service creates is named `{audio|video}_{job id}.{ext}`.
//! The engine picks the extension, so finished downloads are found by prefix,
//! and the periodic sweep only ever touches names carrying an owned prefix.
//! There is no in-memory registry; the directory listing is the source of
//! truth and needs no locking.

use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use tokio::{
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::MediaKind;

pub const MAX_FILE_AGE: Duration = Duration::from_secs(60 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DELETE_GRACE: Duration = Duration::from_secs(60);

const OWNED_PREFIXES: [&str; 2] = ["audio_", "video_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Files older than this are reclaimed by the sweep.
    pub max_file_age: Duration,
    pub sweep_interval: Duration,
    /// Delay between serving a download and deleting it.
    pub delete_grace: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_file_age: MAX_FILE_AGE,
            sweep_interval: SWEEP_INTERVAL,
            delete_grace: DELETE_GRACE,
        }
    }
}

/// `<unix seconds>_<32 hex chars>`. Fixed width, so no id is a prefix of
/// another, and the random part keeps ids distinct within one clock tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    fn generate(now: DateTime<Utc>) -> Self {
        Self(format!(
            "{:010}_{}",
            now.timestamp().max(0),
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: JobId,
    pub kind: MediaKind,
    pub created_at: DateTime<Utc>,
}

impl DownloadJob {
    pub fn prefix(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.id)
    }

    /// Output template handed to the engine; `%(ext)s` is filled in by it.
    pub fn output_template(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.%(ext)s", self.prefix()))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct FileManager {
    dir: PathBuf,
    policy: RetentionPolicy,
}

impl FileManager {
    pub fn new(dir: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    pub fn allocate_id(&self) -> JobId {
        JobId::generate(Utc::now())
    }

    pub fn new_job(&self, kind: MediaKind) -> DownloadJob {
        DownloadJob {
            id: self.allocate_id(),
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn output_template(&self, job: &DownloadJob) -> PathBuf {
        job.output_template(&self.dir)
    }

    pub async fn locate(&self, prefix: &str) -> Option<PathBuf> {
        locate(&self.dir, prefix).await
    }

    /// Deletes `path` after the configured grace period.
    pub fn schedule_grace_delete(&self, path: PathBuf) -> JoinHandle<()> {
        schedule_delete(path, self.policy.delete_grace)
    }

    /// Removes whatever a failed engine run left behind for `job`.
    pub async fn discard(&self, job: &DownloadJob) -> usize {
        let prefix = job.prefix();
        let mut removed = 0;

        for path in list_owned_files(&self.dir).await.unwrap_or_default() {
            if file_name_has_prefix(&path, &prefix) && remove_file_quietly(&path).await {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Discarded {removed} partial file(s) for job {}", job.id);
        }
        removed
    }

    /// One reclamation pass over the scratch directory.
    pub async fn sweep_once(&self, now: SystemTime) -> std::io::Result<SweepReport> {
        let mut report = SweepReport::default();

        for path in list_owned_files(&self.dir).await? {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => {
                    warn!("Could not read metadata of {:?}: {error}", path);
                    report.failed += 1;
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let modified_at = match metadata.modified() {
                Ok(value) => value,
                Err(error) => {
                    warn!("Could not read modification time of {:?}: {error}", path);
                    report.failed += 1;
                    continue;
                }
            };

            let age = now.duration_since(modified_at).unwrap_or(Duration::ZERO);
            if age <= self.policy.max_file_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed += 1,
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => {
                    warn!("Could not delete expired file {:?}: {error}", path);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Runs [`FileManager::sweep_once`] on every interval tick, starting
    /// immediately. A failed pass is logged and the loop keeps going.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                match self.sweep_once(SystemTime::now()).await {
                    Ok(report) if report.removed > 0 || report.failed > 0 => {
                        info!(
                            "Sweep removed {} expired file(s), {} failure(s)",
                            report.removed, report.failed
                        );
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!("Could not sweep scratch directory {:?}: {error}", self.dir);
                    }
                }
            }
        })
    }
}

/// First regular file in `dir` named `<prefix>` or `<prefix>.<anything>`.
pub async fn locate(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Could not open scratch directory {:?}: {error}", dir);
            return None;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(error) => {
                warn!("Could not list scratch directory {:?}: {error}", dir);
                return None;
            }
        };

        let path = entry.path();
        if !file_name_has_prefix(&path, prefix) {
            continue;
        }

        if let Ok(file_type) = entry.file_type().await
            && file_type.is_file()
        {
            return Some(path);
        }
    }
}

/// Deletes `path`. Absence counts as success; other failures are logged.
/// Returns whether this call removed the file.
pub async fn remove_file_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not delete {:?}: {error}", path);
            }
            false
        }
    }
}

/// One-shot deferred deletion. Aborting the handle, or shutting the runtime
/// down, abandons it and leaves the file to the sweep.
pub fn schedule_delete(path: PathBuf, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if remove_file_quietly(&path).await {
            debug!("Deleted served file {:?}", path);
        }
    })
}

fn file_name_has_prefix(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(prefix))
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn is_owned(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| OWNED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)))
}

async fn list_owned_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_owned(&path) {
            paths.push(path);
        }
    }

    Ok(paths)
}
