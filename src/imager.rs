//! Operator-side session orchestration
//!
//! One `Imager` drives one target through spawn, handshake, discovery, diff,
//! archive and fetch. Phases run strictly in order and the first failure ends
//! the run; nothing is retried. Every phase change is published on a watch
//! channel as a (phase, progress) pair, with -1 meaning indeterminate.

use crate::archive::ArchiveSummary;
use crate::error::TakiError;
use crate::fsdiff::FsDiff;
use crate::handshake::wait_for_server_start;
use crate::logger::Logger;
use crate::manifest::DiffManifest;
use crate::meta_cache::MetaCache;
use crate::process_io::AgentSpawner;
use crate::protocol::method;
use crate::rpc::RpcClient;
use crate::rpcfs::RpcFs;
use crate::server::{DiffReport, GenerateDiffRef, GetRootsRes, ServerConfig, TaskProgressReq};
use crate::task::{ProgressCell, Progressive};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Spawn,
    Handshake,
    Discover,
    SyncCache,
    Configure,
    Diff,
    Archive,
    Fetch,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Spawn => "spawn",
            Phase::Handshake => "handshake",
            Phase::Discover => "discover",
            Phase::SyncCache => "sync-cache",
            Phase::Configure => "configure",
            Phase::Diff => "diff",
            Phase::Archive => "archive",
            Phase::Fetch => "fetch",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseUpdate {
    pub phase: Phase,
    pub progress: f64,
}

#[derive(Debug, Clone)]
pub struct ImagerConfig {
    /// Display name, usually `<pod>/<container>`
    pub target: String,
    /// Command that starts the agent
    pub argv: Vec<String>,
    /// Tar file of the image the target was started from
    pub base_image: PathBuf,
    pub local_output: PathBuf,
    pub remote_output: String,
    pub exclude: Vec<String>,
    pub poll_interval: Duration,
    pub read_chunk: usize,
}

#[derive(Debug, Error)]
#[error("{target}: {phase} failed: {source}")]
pub struct ImagerError {
    pub target: String,
    pub phase: Phase,
    #[source]
    pub source: TakiError,
}

#[derive(Debug, Clone)]
pub struct ImageReport {
    pub target: String,
    pub session: String,
    pub container_name: Option<String>,
    pub root: String,
    pub archive: PathBuf,
    pub manifest: PathBuf,
    pub bytes: u64,
    pub diff: FsDiff,
    pub path_errors: usize,
    /// Diff files the agent could not read while archiving
    pub archive_skipped: Vec<String>,
    pub elapsed: Duration,
}

pub struct Imager {
    cfg: ImagerConfig,
    session: String,
    cache: Arc<MetaCache>,
    spawner: Arc<dyn AgentSpawner>,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
    status: watch::Sender<PhaseUpdate>,
    progress: ProgressCell,
    child: Mutex<Option<Child>>,
}

impl Imager {
    pub fn new(
        cfg: ImagerConfig,
        cache: Arc<MetaCache>,
        spawner: Arc<dyn AgentSpawner>,
        logger: Arc<dyn Logger>,
        cancel: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(PhaseUpdate {
            phase: Phase::Spawn,
            progress: ProgressCell::INDETERMINATE,
        });
        Imager {
            cfg,
            session: uuid::Uuid::new_v4().to_string(),
            cache,
            spawner,
            logger,
            cancel,
            status,
            progress: ProgressCell::indeterminate(),
            child: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.cfg.target
    }

    pub fn subscribe(&self) -> watch::Receiver<PhaseUpdate> {
        self.status.subscribe()
    }

    pub fn status(&self) -> PhaseUpdate {
        *self.status.borrow()
    }

    /// Hard teardown of the spawned agent. Cancellation alone never kills it.
    pub fn kill(&self) -> Result<(), TakiError> {
        if let Some(child) = self.child.lock().as_mut() {
            child.start_kill()?;
        }
        Ok(())
    }

    fn publish(&self, phase: Phase, progress: f64) {
        let changed = self.status.borrow().phase != phase;
        self.progress.set(progress);
        self.status.send_replace(PhaseUpdate { phase, progress });
        if changed {
            self.logger.phase(&self.cfg.target, &phase.to_string());
        }
    }

    pub async fn run(&self) -> Result<ImageReport, ImagerError> {
        self.logger.session_start(&self.cfg.target, &self.session);
        match self.run_phases().await {
            Ok(report) => Ok(report),
            Err(source) => {
                let phase = self.status().phase;
                self.logger.error(&phase.to_string(), &source.to_string());
                Err(ImagerError {
                    target: self.cfg.target.clone(),
                    phase,
                    source,
                })
            }
        }
    }

    async fn run_phases(&self) -> Result<ImageReport, TakiError> {
        let started = Instant::now();
        let cancel = &self.cancel;

        self.publish(Phase::Spawn, ProgressCell::INDETERMINATE);
        let base = self.cache.request(&self.cfg.base_image);
        let io = self.spawner.spawn(&self.cfg.argv)?;
        *self.child.lock() = io.child;

        self.publish(Phase::Handshake, ProgressCell::INDETERMINATE);
        let mut reader = BufReader::new(io.reader);
        let hs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TakiError::Cancelled),
            hs = wait_for_server_start(&mut reader) => hs?,
        };
        // The BufReader may already hold the first frame bytes
        let client = Arc::new(RpcClient::new(reader, io.writer));

        self.publish(Phase::Discover, ProgressCell::INDETERMINATE);
        let res: GetRootsRes = client.call(method::GET_ROOTS, &(), cancel).await?;
        // Interactive disambiguation would hook in here
        if res.roots.len() != 1 {
            return Err(TakiError::Ambiguity(res.roots));
        }
        let root = res.roots[0].clone();

        self.publish(Phase::SyncCache, ProgressCell::INDETERMINATE);
        let base_meta = base.wait_cancellable(cancel).await?;

        self.publish(Phase::Configure, ProgressCell::INDETERMINATE);
        let server_cfg = ServerConfig {
            root: root.clone(),
            exclude: self.cfg.exclude.clone(),
            output: self.cfg.remote_output.clone(),
        };
        client
            .call::<_, ()>(method::SET_CONFIG, &server_cfg, cancel)
            .await?;

        self.publish(Phase::Diff, ProgressCell::INDETERMINATE);
        client
            .call::<_, ()>(
                method::GENERATE_DIFF,
                &GenerateDiffRef { base: &base_meta },
                cancel,
            )
            .await?;
        let report: DiffReport = client.call(method::GET_DIFF, &(), cancel).await?;
        self.logger.diff(
            report.diff.added.len(),
            report.diff.removed.len(),
            report.diff.modified.len(),
        );

        self.publish(Phase::Archive, 0.0);
        let handle: u64 = client.call(method::TAR_START, &(), cancel).await?;
        loop {
            let p: f64 = client
                .call(method::TASK_PROGRESS, &TaskProgressReq { handle }, cancel)
                .await?;
            self.publish(Phase::Archive, p);
            if p >= 1.0 {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TakiError::Cancelled),
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
            }
        }
        let summary: ArchiveSummary = client
            .call(method::TAR_RESULT, &TaskProgressReq { handle }, cancel)
            .await?;
        for path in &summary.skipped {
            self.logger
                .path_error(path, "unreadable on the agent, not archived");
        }

        self.publish(Phase::Fetch, 0.0);
        if let Some(parent) = self.cfg.local_output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let fs = RpcFs::new(Arc::clone(&client), cancel.clone());
        let mut remote = fs.open_read(&self.cfg.remote_output).await?;
        let mut local = tokio::fs::File::create(&self.cfg.local_output).await?;
        let bytes = remote
            .copy_to(&mut local, self.cfg.read_chunk, |done, total| {
                let p = if total == 0 { 1.0 } else { done as f64 / total as f64 };
                self.publish(Phase::Fetch, p.min(1.0));
            })
            .await?;
        remote.close().await?;

        let manifest_path = DiffManifest::path_for(&self.cfg.local_output);
        DiffManifest {
            timestamp: Utc::now().to_rfc3339(),
            session: self.session.clone(),
            target: self.cfg.target.clone(),
            root: root.clone(),
            container_name: hs.container_name.clone(),
            base_image: self.cfg.base_image.clone(),
            archive: self.cfg.local_output.clone(),
            archive_bytes: bytes,
            diff: report.diff.clone(),
            path_errors: report.path_errors.clone(),
            archive_skipped: summary.skipped.clone(),
        }
        .write(&manifest_path)?;

        drop(client);
        self.reap();
        self.publish(Phase::Done, 1.0);
        let elapsed = started.elapsed();
        self.logger.done(&self.cfg.target, bytes, elapsed.as_secs_f64());

        Ok(ImageReport {
            target: self.cfg.target.clone(),
            session: self.session.clone(),
            container_name: hs.container_name,
            root,
            archive: self.cfg.local_output.clone(),
            manifest: manifest_path,
            bytes,
            diff: report.diff,
            path_errors: report.path_errors.len(),
            archive_skipped: summary.skipped,
            elapsed,
        })
    }

    /// Give the agent a moment to exit after its stdin closes, then kill it.
    fn reap(&self) {
        if let Some(mut child) = self.child.lock().take() {
            tokio::spawn(async move {
                let exited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                if exited.is_err() {
                    let _ = child.kill().await;
                }
            });
        }
    }
}

impl Progressive for Imager {
    /// Progress of the current phase; -1 while it is indeterminate
    fn progress(&self) -> f64 {
        self.progress.get()
    }
}

/// Run every imager concurrently. Results come back in input order and one
/// failure never affects the others.
pub async fn image_all(imagers: &[Arc<Imager>]) -> Vec<Result<ImageReport, ImagerError>> {
    join_all(imagers.iter().map(|m| m.run())).await
}
