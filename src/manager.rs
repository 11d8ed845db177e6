//! Public operations behind the HTTP API

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::SyncError;
use crate::paths;
use crate::registry::{JobView, SyncJob, SyncJobRegistry};
use crate::remote::RemoteTools;
use crate::supervisor::SyncProcessSupervisor;
use crate::tree::{self, DirStatus, DirTree};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Owns the registry and supervisor; shared behind an `Arc` by every handler.
pub struct SyncJobManager {
    registry: Arc<SyncJobRegistry>,
    supervisor: SyncProcessSupervisor,
    tools: Arc<dyn RemoteTools>,
    data_path: PathBuf,
}

impl SyncJobManager {
    pub fn new(data_path: PathBuf, tools: Arc<dyn RemoteTools>, grace: Duration) -> Self {
        let registry = Arc::new(SyncJobRegistry::new());
        let supervisor = SyncProcessSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&tools),
            data_path.clone(),
            grace,
        );
        Self {
            registry,
            supervisor,
            tools,
            data_path,
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn grace_period(&self) -> Duration {
        self.supervisor.grace_period()
    }

    /// Begin mirroring `path` if it exists remotely and no overlapping job is
    /// running. Returns as soon as the transfer is launched.
    pub async fn start(&self, path: &str) -> Result<(), SyncError> {
        let path = paths::normalize_slash_path(path).ok_or(SyncError::InvalidPath)?;
        let remote = tree::build_remote(self.tools.as_ref(), &DirTree::new()).await?;
        if !remote.contains(&path) {
            return Err(SyncError::InvalidPath);
        }

        let job = Arc::new(SyncJob::new(path));
        if !self.registry.try_insert(Arc::clone(&job)) {
            return Err(SyncError::AlreadyStarted);
        }
        info!(job_id = %job.id(), path = job.path(), "sync started");
        // Completion is reported by the task unregistering the job
        drop(self.supervisor.launch(job));
        Ok(())
    }

    /// Request cancellation of the job registered at exactly `path`, if any.
    pub fn cancel(&self, path: &str) {
        let path = paths::normalize_slash_path(path).unwrap_or_else(|| path.to_string());
        if let Some(job) = self.registry.lookup(&path) {
            info!(job_id = %job.id(), path = job.path(), "sync cancel requested");
            job.cancel();
        }
    }

    pub fn list(&self) -> Vec<JobView> {
        self.registry.snapshot()
    }

    /// Delete a mirrored subtree from the data root.
    pub async fn remove(&self, path: &str) -> Result<(), SyncError> {
        let path = paths::normalize_slash_path(path).ok_or(SyncError::InvalidPath)?;
        if path == paths::ROOT {
            return Err(SyncError::InvalidPath);
        }
        if !self.local_tree().await?.contains(&path) {
            return Err(SyncError::InvalidPath);
        }

        let _reservation = self
            .registry
            .reserve_removal(&path)
            .ok_or(SyncError::SyncInProgress)?;
        let target = paths::local_path(&self.data_path, &path);
        tokio::fs::remove_dir_all(&target)
            .await
            .map_err(|e| SyncError::io(format!("remove {}", target.display()), e))?;
        info!(path, "removed local directory");
        Ok(())
    }

    /// Sync status of every remote directory, ascending by path.
    pub async fn dir_statuses(&self) -> Result<Vec<DirStatus>, SyncError> {
        let local = self.local_tree().await?;
        let remote = tree::build_remote(self.tools.as_ref(), &local).await?;
        Ok(remote.statuses())
    }

    /// Cancel every job and wait up to `timeout` for all of them to exit.
    /// Returns whether the registry drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            info!(jobs = cancelled, "cancelling active syncs");
        }
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.registry.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.registry.len(), "syncs still running at shutdown");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        true
    }

    async fn local_tree(&self) -> Result<DirTree, SyncError> {
        let root = self.data_path.clone();
        tokio::task::spawn_blocking(move || tree::build_local(&root))
            .await
            .map_err(|e| SyncError::io("walk local tree", io::Error::other(e)))?
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::remote::testing::ScriptTools;
    use tempfile::TempDir;

    const LISTING: &str = "printf '/\\n/a\\n/a/b\\n/c\\n'";

    fn manager(transfer: &str) -> (TempDir, SyncJobManager) {
        let tmp = tempfile::tempdir().unwrap();
        let tools: Arc<dyn RemoteTools> = Arc::new(ScriptTools::new(LISTING, transfer));
        let manager =
            SyncJobManager::new(tmp.path().to_path_buf(), tools, Duration::from_millis(200));
        (tmp, manager)
    }

    async fn wait_idle(manager: &SyncJobManager) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !manager.list().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "jobs did not drain");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn kind(result: Result<(), SyncError>) -> ErrorKind {
        result.unwrap_err().kind()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_conflicts_until_cancelled() {
        let (_tmp, manager) = manager("sleep 30");
        manager.start("/a").await.unwrap();
        let err = manager.start("/a").await.unwrap_err();
        assert_eq!(err.to_string(), "sync already started");

        manager.cancel("/a");
        wait_idle(&manager).await;
        manager.start("/a").await.unwrap();
        manager.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_succeeds_again_after_completion() {
        let (_tmp, manager) = manager("true");
        manager.start("/a").await.unwrap();
        wait_idle(&manager).await;
        manager.start("/a").await.unwrap();
        wait_idle(&manager).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nested_start_conflicts_but_disjoint_does_not() {
        let (_tmp, manager) = manager("sleep 30");
        manager.start("/a").await.unwrap();
        assert_eq!(kind(manager.start("/a/b").await), ErrorKind::Conflict);
        assert_eq!(kind(manager.start("/").await), ErrorKind::Conflict);
        manager.start("/c").await.unwrap();

        let paths: Vec<_> = manager.list().into_iter().map(|v| v.path).collect();
        assert_eq!(paths, vec!["/c", "/a"]);
        assert!(manager.shutdown(Duration::from_secs(2)).await);
        assert!(manager.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_rejects_unknown_and_malformed_paths() {
        let (_tmp, manager) = manager("true");
        assert_eq!(kind(manager.start("relative").await), ErrorKind::Validation);
        assert_eq!(kind(manager.start("/a/../c").await), ErrorKind::Validation);
        assert_eq!(kind(manager.start("/missing").await), ErrorKind::Validation);
        assert!(manager.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_normalizes_the_path() {
        let (_tmp, manager) = manager("sleep 30");
        manager.start("/a/b/").await.unwrap();
        assert_eq!(manager.list()[0].path, "/a/b");
        manager.cancel("/a/b/");
        wait_idle(&manager).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_surfaces_listing_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let tools: Arc<dyn RemoteTools> = Arc::new(ScriptTools::new("exit 255", "true"));
        let manager = SyncJobManager::new(tmp.path().to_path_buf(), tools, Duration::from_millis(200));
        assert_eq!(kind(manager.start("/a").await), ErrorKind::Command);
    }

    #[tokio::test]
    async fn cancel_unknown_path_is_a_no_op() {
        let (_tmp, manager) = manager("true");
        manager.cancel("/nothing");
        manager.cancel("not even a path");
        assert!(manager.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_waits_for_overlapping_syncs() {
        let (tmp, manager) = manager("sleep 30");
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("a/b/file"), b"data").unwrap();

        manager.start("/a/b").await.unwrap();
        let err = manager.remove("/a").await.unwrap_err();
        assert_eq!(err.to_string(), "sync in progress");
        assert!(tmp.path().join("a/b/file").exists());

        manager.cancel("/a/b");
        wait_idle(&manager).await;
        manager.remove("/a").await.unwrap();
        assert!(!tmp.path().join("a").exists());
    }

    #[tokio::test]
    async fn remove_rejects_root_and_missing_paths() {
        let (tmp, manager) = manager("true");
        std::fs::create_dir_all(tmp.path().join("a")).unwrap();
        assert_eq!(kind(manager.remove("/").await), ErrorKind::Validation);
        assert_eq!(kind(manager.remove("/missing").await), ErrorKind::Validation);
        assert_eq!(kind(manager.remove("a").await), ErrorKind::Validation);
        assert!(tmp.path().join("a").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dir_statuses_merge_local_state() {
        let (tmp, manager) = manager("true");
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();

        let statuses = manager.dir_statuses().await.unwrap();
        assert_eq!(
            statuses,
            vec![
                DirStatus { path: "/".into(), synced: false },
                DirStatus { path: "/a".into(), synced: true },
                DirStatus { path: "/a/b".into(), synced: true },
                DirStatus { path: "/c".into(), synced: false },
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_with_nothing_running_returns_immediately() {
        let (_tmp, manager) = manager("true");
        assert!(manager.shutdown(Duration::from_millis(10)).await);
    }
}
