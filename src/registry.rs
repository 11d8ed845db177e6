//! In-memory table of active sync jobs
//!
//! One mutex covers every check-and-mutate so the overlap scan and the insert
//! that follows it are a single atomic step. Critical sections are
//! O(active jobs); jobs are few.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::paths;
use crate::progress::ProgressField;

/// One in-flight transfer.
///
/// Live fields are written only by the job's own progress reader. Each field
/// is individually atomic, so a view may combine values from two consecutive
/// progress lines but never observes a torn value.
#[derive(Debug)]
pub struct SyncJob {
    id: Uuid,
    path: String,
    started_at: DateTime<Utc>,
    progress: AtomicU64,
    speed: AtomicU64,
    downloaded: AtomicU64,
    time_left: Mutex<String>,
    cancel: CancellationToken,
}

/// Observable state of a job as reported to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub path: String,
    pub progress: u64,
    pub speed: u64,
    pub downloaded: u64,
    pub time_left: String,
    pub started_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            started_at: Utc::now(),
            progress: AtomicU64::new(0),
            speed: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            time_left: Mutex::new(String::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn apply(&self, field: ProgressField) {
        match field {
            ProgressField::Progress(v) => self.progress.store(v, Ordering::Relaxed),
            ProgressField::Speed(v) => self.speed.store(v, Ordering::Relaxed),
            ProgressField::Downloaded(v) => self.downloaded.store(v, Ordering::Relaxed),
            ProgressField::TimeLeft(s) => *self.time_left.lock() = s,
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            path: self.path.clone(),
            progress: self.progress.load(Ordering::Relaxed),
            speed: self.speed.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            time_left: self.time_left.lock().clone(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    jobs: HashMap<String, Arc<SyncJob>>,
    /// Paths whose local subtree is being deleted right now
    removals: HashSet<String>,
}

impl RegistryState {
    fn overlapping(&self, path: &str) -> Option<String> {
        self.jobs
            .keys()
            .chain(self.removals.iter())
            .find(|existing| paths::overlaps(existing, path))
            .cloned()
    }
}

/// Path -> job map enforcing that no two registered paths overlap.
#[derive(Debug, Default)]
pub struct SyncJobRegistry {
    state: Mutex<RegistryState>,
}

impl SyncJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `job` unless its path overlaps (equal, prefix of, or prefixed by)
    /// a registered job or an in-flight removal.
    pub fn try_insert(&self, job: Arc<SyncJob>) -> bool {
        let mut state = self.state.lock();
        if let Some(existing) = state.overlapping(job.path()) {
            debug!(path = job.path(), existing = %existing, "refusing overlapping job");
            return false;
        }
        state.jobs.insert(job.path().to_string(), job);
        true
    }

    /// Delete the exact-match entry, if any.
    pub fn remove(&self, path: &str) -> Option<Arc<SyncJob>> {
        self.state.lock().jobs.remove(path)
    }

    /// Remove `job`'s entry only if it is still the registered job for its
    /// path. Safe to call more than once.
    pub fn release(&self, job: &SyncJob) -> bool {
        let mut state = self.state.lock();
        match state.jobs.get(job.path()) {
            Some(current) if current.id() == job.id() => {
                state.jobs.remove(job.path());
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<SyncJob>> {
        self.state.lock().jobs.get(path).cloned()
    }

    /// First registered path (job or removal) overlapping `path`.
    pub fn overlapping(&self, path: &str) -> Option<String> {
        self.state.lock().overlapping(path)
    }

    /// Views of every job, sorted by path descending.
    pub fn snapshot(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = {
            let state = self.state.lock();
            state.jobs.values().map(|job| job.view()).collect()
        };
        views.sort_by(|a, b| b.path.cmp(&a.path));
        views
    }

    /// Reserve `path` for deletion. While the guard lives, overlapping jobs
    /// cannot be inserted and overlapping removals are refused.
    pub fn reserve_removal(self: &Arc<Self>, path: &str) -> Option<RemovalGuard> {
        let mut state = self.state.lock();
        if state.overlapping(path).is_some() {
            return None;
        }
        state.removals.insert(path.to_string());
        Some(RemovalGuard {
            registry: Arc::clone(self),
            path: path.to_string(),
        })
    }

    /// Trigger every registered job's cancellation handle.
    pub fn cancel_all(&self) -> usize {
        let state = self.state.lock();
        for job in state.jobs.values() {
            job.cancel();
        }
        state.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }
}

/// Holds a removal reservation; dropping it releases the path.
#[derive(Debug)]
pub struct RemovalGuard {
    registry: Arc<SyncJobRegistry>,
    path: String,
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        self.registry.state.lock().removals.remove(&self.path);
    }
}

/// Unregisters a job when dropped, whatever way its task ends.
pub struct RegistryLease {
    registry: Arc<SyncJobRegistry>,
    job: Arc<SyncJob>,
}

impl RegistryLease {
    pub fn new(registry: Arc<SyncJobRegistry>, job: Arc<SyncJob>) -> Self {
        Self { registry, job }
    }

    /// Unregister now instead of at drop.
    pub fn release(&self) {
        self.registry.release(&self.job);
    }
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        self.release();
    }
}
