//! Per-job transfer process supervision
//!
//! Each job gets one task that owns the transfer child. The task reads
//! progress tokens from stdout, forwards stderr to the log, watches the job's
//! cancellation token and unregisters the job as soon as the child exits.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::logging::forward_lines;
use crate::paths;
use crate::progress::{parse_token, ProgressTokens};
use crate::registry::{RegistryLease, SyncJob, SyncJobRegistry};
use crate::remote::RemoteTools;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct SyncProcessSupervisor {
    registry: Arc<SyncJobRegistry>,
    tools: Arc<dyn RemoteTools>,
    data_path: PathBuf,
    grace: Duration,
}

impl SyncProcessSupervisor {
    pub fn new(
        registry: Arc<SyncJobRegistry>,
        tools: Arc<dyn RemoteTools>,
        data_path: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            tools,
            data_path,
            grace,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Spawn the supervising task for an already registered job.
    ///
    /// The job is unregistered when its process exits, when setup fails, or
    /// when the task is dropped.
    pub fn launch(&self, job: Arc<SyncJob>) -> JoinHandle<()> {
        let span = info_span!("sync", job_id = %job.id(), path = job.path());
        let lease = RegistryLease::new(Arc::clone(&self.registry), Arc::clone(&job));
        let tools = Arc::clone(&self.tools);
        let data_path = self.data_path.clone();
        let grace = self.grace;

        tokio::spawn(
            async move {
                let outcome = supervise(tools.as_ref(), &data_path, grace, &job).await;
                lease.release();
                match outcome {
                    Ok(status) if status.success() => info!("transfer finished"),
                    Ok(status) if job.is_cancelled() => info!(%status, "transfer cancelled"),
                    Ok(status) => error!(%status, "transfer exited with failure"),
                    Err(e) => error!(error = %e, "transfer could not run"),
                }
            }
            .instrument(span),
        )
    }
}

async fn supervise(
    tools: &dyn RemoteTools,
    data_path: &Path,
    grace: Duration,
    job: &Arc<SyncJob>,
) -> io::Result<ExitStatus> {
    let destination = paths::transfer_destination(data_path, job.path());
    tokio::fs::create_dir_all(&destination).await.map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("create destination {}: {e}", destination.display()),
        )
    })?;

    let mut cmd = tools.transfer_command(job.path(), &destination);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    info!(pid = child.id(), destination = %destination.display(), "transfer started");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, "transfer").in_current_span());
    }
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_progress(stdout, Arc::clone(job)).in_current_span());
    }

    tokio::select! {
        status = child.wait() => status,
        _ = job.cancellation().cancelled() => {
            info!("cancellation requested");
            terminate_gracefully(&mut child, grace).await
        }
    }
}

/// Apply each progress token to `job` until the stream closes.
async fn read_progress<R>(stdout: R, job: Arc<SyncJob>)
where
    R: AsyncRead + Unpin,
{
    let mut tokens = FramedRead::new(stdout, ProgressTokens);
    while let Some(token) = tokens.next().await {
        match token {
            Ok(token) => match parse_token(&token) {
                Ok(field) => job.apply(field),
                Err(e) => warn!(error = %e, "unparsed progress token"),
            },
            Err(e) => {
                debug!(error = %e, "progress stream closed");
                break;
            }
        }
    }
}

/// Stop `child`: request termination, wait up to `grace`, then force it.
///
/// On unix the request is SIGTERM to the child's process group (falling back
/// to the child alone) and the forced stop is SIGKILL to the same target.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    request_stop(child);

    tokio::select! {
        status = child.wait() => status,
        _ = tokio::time::sleep(grace) => {
            warn!(grace_ms = grace.as_millis() as u64, "process outlived grace period, killing");
            force_stop(child);
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn signal_tree(child: &Child, signal: libc::c_int) {
    let Some(pid) = child.id() else {
        return;
    };
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) takes plain integers and touches no memory
    unsafe {
        if libc::kill(-pid, signal) != 0 && libc::kill(pid, signal) != 0 {
            debug!(pid, signal, error = %io::Error::last_os_error(), "signal not delivered");
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    signal_tree(child, libc::SIGTERM);
}

#[cfg(unix)]
fn force_stop(child: &mut Child) {
    signal_tree(child, libc::SIGKILL);
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_stop(_child: &mut Child) {}
