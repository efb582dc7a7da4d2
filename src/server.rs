//! Agent-side session: the `TakiServer` service plus the `RpcFs` file table
//!
//! One `Session` exists per agent process and is shared by every in-flight
//! request on its channel.

use crate::archive::{ArchiveJob, ArchiveSummary, ArchiveTask, Archiver};
use crate::error::{TakiError, TaskError};
use crate::fsdiff::FsDiff;
use crate::logger::Logger;
use crate::meta::DirMeta;
use crate::meta_builder::DirMetaBuilder;
use crate::protocol::method;
use crate::rpc::Router;
use crate::rpcfs::{self, HasFiles, VirtualFileTable};
use crate::task::{AsyncTask, Progressive, TaskState};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type TaskHandle = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Root of the target filesystem, usually `/proc/<pid>/root`
    pub root: String,
    /// Root-relative paths left out of the live tree
    pub exclude: Vec<String>,
    /// Where the archive is written on the agent side
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRootsRes {
    pub roots: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateDiffReq {
    pub base: DirMeta,
}

/// Borrowed twin of `GenerateDiffReq` so the operator can send a cached tree
/// without cloning it. Both encode identically.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GenerateDiffRef<'a> {
    pub base: &'a DirMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub diff: FsDiff,
    /// Live-tree build failures, path to message
    pub path_errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskProgressReq {
    pub handle: TaskHandle,
}

/// Lists filesystem roots that differ from the agent's own.
pub trait RootProbe: Send + Sync {
    fn candidate_roots(&self) -> Result<Vec<String>, TakiError>;
}

/// Compares `<proc>/<pid>/root` identities against the agent's root.
#[derive(Debug, Clone)]
pub struct ProcRootProbe {
    pub proc_dir: PathBuf,
    pub self_root: PathBuf,
}

impl Default for ProcRootProbe {
    fn default() -> Self {
        ProcRootProbe {
            proc_dir: PathBuf::from("/proc"),
            self_root: PathBuf::from("/"),
        }
    }
}

impl RootProbe for ProcRootProbe {
    fn candidate_roots(&self) -> Result<Vec<String>, TakiError> {
        let mut seen = HashSet::new();
        seen.insert(identity(&self.self_root)?);

        let mut pids: Vec<u64> = std::fs::read_dir(&self.proc_dir)?
            .flatten()
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();

        let mut roots = Vec::new();
        for pid in pids {
            let root = self.proc_dir.join(pid.to_string()).join("root");
            let id = match identity(&root) {
                Ok(id) => id,
                // Processes exit or hide their root while we scan
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            if seen.insert(id) {
                roots.push(root.to_string_lossy().into_owned());
            }
        }
        Ok(roots)
    }
}

#[cfg(unix)]
fn identity(path: &Path) -> io::Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let md = std::fs::metadata(path)?;
    Ok((md.dev(), md.ino()))
}

#[cfg(not(unix))]
fn identity(path: &Path) -> io::Result<(u64, u64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("no inode identity for {}", path.display()),
    ))
}

/// Live tree plus the diff computed from it.
#[derive(Debug)]
struct LiveScan {
    live: DirMeta,
    diff: FsDiff,
    path_errors: BTreeMap<String, String>,
}

enum SessionTask {
    /// Live-tree build; reports no progress
    Scan(AsyncTask<Arc<LiveScan>>),
    Archive(Arc<ArchiveTask>),
}

struct TaskTable {
    next: TaskHandle,
    tasks: HashMap<TaskHandle, SessionTask>,
}

impl TaskTable {
    fn insert(&mut self, task: SessionTask) -> TaskHandle {
        let h = self.next;
        self.next += 1;
        self.tasks.insert(h, task);
        h
    }
}

pub struct Session {
    config: RwLock<Option<ServerConfig>>,
    scan: RwLock<Option<Arc<LiveScan>>>,
    tasks: Mutex<TaskTable>,
    files: VirtualFileTable,
    probe: Arc<dyn RootProbe>,
    archiver: Arc<dyn Archiver>,
    logger: Arc<dyn Logger>,
}

impl HasFiles for Session {
    fn files(&self) -> &VirtualFileTable {
        &self.files
    }
}

impl Session {
    pub fn new(
        probe: Arc<dyn RootProbe>,
        archiver: Arc<dyn Archiver>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Session {
            config: RwLock::new(None),
            scan: RwLock::new(None),
            tasks: Mutex::new(TaskTable {
                next: 1,
                tasks: HashMap::new(),
            }),
            files: VirtualFileTable::new(),
            probe,
            archiver,
            logger,
        }
    }

    pub fn config(&self) -> Option<ServerConfig> {
        self.config.read().clone()
    }

    fn require_config(&self) -> Result<ServerConfig, TakiError> {
        self.config().ok_or(TakiError::Config)
    }

    fn require_scan(&self) -> Result<Arc<LiveScan>, TakiError> {
        self.scan
            .read()
            .clone()
            .ok_or(TakiError::NotReady("GenerateDiff has not completed"))
    }

    pub async fn get_roots(&self) -> Result<GetRootsRes, TakiError> {
        self.logger.request(method::GET_ROOTS);
        let probe = Arc::clone(&self.probe);
        let roots = blocking(move || probe.candidate_roots()).await?;
        Ok(GetRootsRes { roots })
    }

    pub fn set_config(&self, cfg: ServerConfig) {
        self.logger.request(method::SET_CONFIG);
        *self.config.write() = Some(cfg);
    }

    /// Build the live tree under the configured root and diff it against
    /// `base`. The result stays in the session.
    pub async fn generate_diff(&self, base: DirMeta) -> Result<(), TakiError> {
        self.logger.request(method::GENERATE_DIFF);
        let cfg = self.require_config()?;
        let task = AsyncTask::spawn_blocking(move || {
            let mut builder = DirMetaBuilder::new().with_excludes(&cfg.exclude);
            builder.add_fs(Path::new(&cfg.root))?;
            let (live, errors) = builder.finish();
            let mut diff = FsDiff::compare(&base, &live);
            diff.sort();
            let path_errors = errors
                .into_iter()
                .map(|(path, err)| (path, err.to_string()))
                .collect();
            Ok(Arc::new(LiveScan {
                live,
                diff,
                path_errors,
            }))
        });
        self.tasks.lock().insert(SessionTask::Scan(task.clone()));

        let scan = task.wait().await.map_err(TakiError::Shared)?;
        for (path, msg) in &scan.path_errors {
            self.logger.path_error(path, msg);
        }
        self.logger.diff(
            scan.diff.added.len(),
            scan.diff.removed.len(),
            scan.diff.modified.len(),
        );
        *self.scan.write() = Some(scan);
        Ok(())
    }

    pub fn get_diff(&self) -> Result<DiffReport, TakiError> {
        self.logger.request(method::GET_DIFF);
        let scan = self.require_scan()?;
        Ok(DiffReport {
            diff: scan.diff.clone(),
            path_errors: scan.path_errors.clone(),
        })
    }

    /// Start archiving every added and modified file. Returns the task handle
    /// to poll with `TaskProgress`.
    pub fn tar_start(&self) -> Result<TaskHandle, TakiError> {
        self.logger.request(method::TAR_START);
        let cfg = self.require_config()?;
        let scan = self.require_scan()?;

        let files = scan.diff.added_modified();
        let sizes = files
            .iter()
            .map(|f| {
                let size = scan.live.get_file(f).map(|fm| fm.size).unwrap_or(0);
                (f.clone(), size)
            })
            .collect();
        let job = ArchiveJob {
            root: PathBuf::from(&cfg.root),
            files,
            output: PathBuf::from(&cfg.output),
        };
        let task = ArchiveTask::start(Arc::clone(&self.archiver), job, sizes);

        let logger = Arc::clone(&self.logger);
        let watched = Arc::clone(&task);
        tokio::spawn(async move {
            match watched.task().wait().await {
                Ok(summary) => {
                    for path in &summary.skipped {
                        logger.path_error(path, "unreadable while archiving, left out");
                    }
                }
                Err(e) => logger.error("archive", &e.to_string()),
            }
        });
        Ok(self.tasks.lock().insert(SessionTask::Archive(task)))
    }

    fn archive_task(&self, handle: TaskHandle) -> Result<Arc<ArchiveTask>, TakiError> {
        let tasks = self.tasks.lock();
        match tasks.tasks.get(&handle) {
            Some(SessionTask::Archive(t)) => Ok(Arc::clone(t)),
            Some(SessionTask::Scan(_)) => Err(TaskError::NotProgressive.into()),
            None if handle >= tasks.next => Err(TaskError::NotStarted.into()),
            None => Err(TaskError::NotExist.into()),
        }
    }

    pub fn task_progress(&self, handle: TaskHandle) -> Result<f64, TakiError> {
        let t = self.archive_task(handle)?;
        match t.task().state() {
            TaskState::Failed(e) => Err(TakiError::Shared(e)),
            _ => Ok(t.progress()),
        }
    }

    /// Outcome of a finished archive task, including the files left out.
    pub fn tar_result(&self, handle: TaskHandle) -> Result<ArchiveSummary, TakiError> {
        self.logger.request(method::TAR_RESULT);
        match self.archive_task(handle)?.task().state() {
            TaskState::Succeeded(summary) => Ok(summary),
            TaskState::Failed(e) => Err(TakiError::Shared(e)),
            TaskState::Pending => Err(TakiError::NotReady("archive has not finished")),
        }
    }
}

/// The full method table served by the agent.
pub fn router() -> Router<Session> {
    rpcfs::routes(Router::new())
        .route(method::GET_ROOTS, |s: Arc<Session>, _: ()| async move {
            s.get_roots().await
        })
        .route(method::SET_CONFIG, |s: Arc<Session>, cfg: ServerConfig| async move {
            s.set_config(cfg);
            Ok(())
        })
        .route(
            method::GENERATE_DIFF,
            |s: Arc<Session>, req: GenerateDiffReq| async move { s.generate_diff(req.base).await },
        )
        .route(method::GET_DIFF, |s: Arc<Session>, _: ()| async move {
            s.get_diff()
        })
        .route(method::TAR_START, |s: Arc<Session>, _: ()| async move {
            s.tar_start()
        })
        .route(
            method::TASK_PROGRESS,
            |s: Arc<Session>, req: TaskProgressReq| async move { s.task_progress(req.handle) },
        )
        .route(
            method::TAR_RESULT,
            |s: Arc<Session>, req: TaskProgressReq| async move { s.tar_result(req.handle) },
        )
}

async fn blocking<T, F>(f: F) -> Result<T, TakiError>
where
    F: FnOnce() -> Result<T, TakiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TakiError::protocol(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::BuiltinTarArchiver;
    use crate::logger::NoopLogger;
    use crate::meta_builder::build_from_tar_file;
    use tempfile::TempDir;

    struct FixedProbe(Vec<String>);

    impl RootProbe for FixedProbe {
        fn candidate_roots(&self) -> Result<Vec<String>, TakiError> {
            Ok(self.0.clone())
        }
    }

    fn session() -> Session {
        Session::new(
            Arc::new(FixedProbe(vec!["/proc/7/root".into()])),
            Arc::new(BuiltinTarArchiver),
            Arc::new(NoopLogger),
        )
    }

    #[tokio::test]
    async fn test_task_progress_before_tar_start() {
        let s = session();
        assert!(matches!(
            s.task_progress(1),
            Err(TakiError::Task(TaskError::NotStarted))
        ));
        assert!(matches!(
            s.task_progress(0),
            Err(TakiError::Task(TaskError::NotExist))
        ));
    }

    #[tokio::test]
    async fn test_calls_before_set_config() {
        let s = session();
        assert!(matches!(
            s.generate_diff(DirMeta::new("")).await,
            Err(TakiError::Config)
        ));
        assert!(matches!(s.tar_start(), Err(TakiError::Config)));
        assert!(matches!(s.get_diff(), Err(TakiError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_get_roots_uses_probe() {
        let res = session().get_roots().await.unwrap();
        assert_eq!(res.roots, vec!["/proc/7/root"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_proc_probe_dedupes_and_skips_self() {
        use std::os::unix::fs::symlink;
        let proc_dir = TempDir::new().unwrap();
        let own_root = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let mk = |pid: &str, to: &Path| {
            let d = proc_dir.path().join(pid);
            std::fs::create_dir(&d).unwrap();
            symlink(to, d.join("root")).unwrap();
        };
        mk("1", own_root.path());
        mk("20", target.path());
        mk("31", target.path());
        mk("40", &proc_dir.path().join("missing"));
        std::fs::create_dir(proc_dir.path().join("sys")).unwrap();

        let probe = ProcRootProbe {
            proc_dir: proc_dir.path().to_path_buf(),
            self_root: own_root.path().to_path_buf(),
        };
        let roots = probe.candidate_roots().unwrap();
        assert_eq!(
            roots,
            vec![proc_dir.path().join("20/root").to_string_lossy().into_owned()]
        );
    }

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (path, data) in files {
            let p = root.join(path);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, data).unwrap();
        }
    }

    #[tokio::test]
    async fn test_diff_and_archive() {
        let base_dir = TempDir::new().unwrap();
        write_tree(
            base_dir.path(),
            &[("a/x", b"one"), ("b/1", b"1"), ("b/2", b"2"), ("same", b"s")],
        );
        let mut base = DirMetaBuilder::new();
        base.add_fs(base_dir.path()).unwrap();
        let (base, _) = base.finish();

        let live_dir = TempDir::new().unwrap();
        write_tree(
            live_dir.path(),
            &[
                ("a/x", b"two"),
                ("a/y", b"new file"),
                ("same", b"s"),
                ("proc/1/status", b"excluded"),
            ],
        );
        let out_dir = TempDir::new().unwrap();
        let output = out_dir.path().join("root.tar");

        let s = session();
        s.set_config(ServerConfig {
            root: live_dir.path().to_string_lossy().into_owned(),
            exclude: vec!["proc".into()],
            output: output.to_string_lossy().into_owned(),
        });
        s.generate_diff(base).await.unwrap();
        // The scan occupies handle 1 and reports no progress
        assert!(matches!(
            s.task_progress(1),
            Err(TakiError::Task(TaskError::NotProgressive))
        ));

        let report = s.get_diff().unwrap();
        assert_eq!(report.diff.added, vec!["a/y"]);
        assert_eq!(report.diff.modified, vec!["a/x"]);
        assert_eq!(report.diff.removed, vec!["b/1", "b/2"]);

        let h = s.tar_start().unwrap();
        assert_eq!(h, 2);
        loop {
            let p = s.task_progress(h).unwrap();
            if p >= 1.0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let archived = build_from_tar_file(&output).unwrap();
        let mut paths = archived.root().file_paths();
        paths.sort();
        assert_eq!(paths, vec!["a/x", "a/y"]);
    }

    #[derive(Default)]
    struct RecordingLogger {
        path_errors: Mutex<Vec<String>>,
    }

    impl Logger for RecordingLogger {
        fn path_error(&self, path: &str, _msg: &str) {
            self.path_errors.lock().push(path.to_string());
        }
    }

    #[tokio::test]
    async fn test_files_lost_before_archiving_are_reported() {
        let live_dir = TempDir::new().unwrap();
        write_tree(live_dir.path(), &[("keep", b"k"), ("tmp/gone", b"g")]);
        let out_dir = TempDir::new().unwrap();
        let logger = Arc::new(RecordingLogger::default());
        let s = Session::new(
            Arc::new(FixedProbe(Vec::new())),
            Arc::new(BuiltinTarArchiver),
            logger.clone(),
        );
        s.set_config(ServerConfig {
            root: live_dir.path().to_string_lossy().into_owned(),
            exclude: Vec::new(),
            output: out_dir.path().join("root.tar").to_string_lossy().into_owned(),
        });
        s.generate_diff(DirMeta::new("")).await.unwrap();
        std::fs::remove_file(live_dir.path().join("tmp/gone")).unwrap();

        let h = s.tar_start().unwrap();
        let summary = loop {
            match s.tar_result(h) {
                Ok(summary) => break summary,
                Err(TakiError::NotReady(_)) => {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(summary.archived, 1);
        assert_eq!(summary.skipped, vec!["tmp/gone"]);

        for _ in 0..200 {
            if !logger.path_errors.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(*logger.path_errors.lock(), vec!["tmp/gone".to_string()]);

        assert!(matches!(
            s.tar_result(1),
            Err(TakiError::Task(TaskError::NotProgressive))
        ));
        assert!(matches!(
            s.tar_result(9),
            Err(TakiError::Task(TaskError::NotStarted))
        ));
    }

    #[tokio::test]
    async fn test_failed_archive_surfaces_through_progress() {
        let live_dir = TempDir::new().unwrap();
        write_tree(live_dir.path(), &[("f", b"x")]);
        let s = session();
        s.set_config(ServerConfig {
            root: live_dir.path().to_string_lossy().into_owned(),
            exclude: Vec::new(),
            output: live_dir
                .path()
                .join("no/such/dir/out.tar")
                .to_string_lossy()
                .into_owned(),
        });
        s.generate_diff(DirMeta::new("")).await.unwrap();
        let h = s.tar_start().unwrap();
        let err = loop {
            match s.task_progress(h) {
                Ok(p) => {
                    assert!(p < 1.0);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Err(e) => break e,
            }
        };
        assert!(matches!(err, TakiError::Shared(_)));
    }
}
