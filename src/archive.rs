//! Packing the diff set into a single archive on the agent side
//!
//! The archiver reports each file as it lands in the archive; `ArchiveTask`
//! turns those reports into byte-weighted progress using the sizes recorded in
//! the live tree.

use crate::error::TakiError;
use crate::task::{AsyncTask, ProgressCell, Progressive, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tar::Builder;

/// What to pack: root-relative `files` under `root`, written to `output`.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub root: PathBuf,
    pub files: Vec<String>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub archived: u64,
    /// Files that could not be read and were left out
    pub skipped: Vec<String>,
}

pub trait Archiver: Send + Sync {
    /// Pack `job`, calling `on_file` with the relative path of each file as
    /// it is completed. Runs on a blocking thread.
    fn archive(&self, job: &ArchiveJob, on_file: &mut dyn FnMut(&str))
        -> Result<ArchiveSummary, TakiError>;
}

/// Shells out to GNU `tar`, reading its verbose listing for progress.
///
/// The file list is NUL-separated and read verbatim, so names that start with
/// `-` or contain newlines stay file names. Files that vanish or cannot be
/// read are left out and reported in the summary.
#[derive(Debug, Clone)]
pub struct TarCommandArchiver {
    pub program: String,
    /// Compress with xz (`J`)
    pub xz: bool,
}

impl Default for TarCommandArchiver {
    fn default() -> Self {
        TarCommandArchiver {
            program: "tar".to_string(),
            xz: true,
        }
    }
}

impl Archiver for TarCommandArchiver {
    fn archive(
        &self,
        job: &ArchiveJob,
        on_file: &mut dyn FnMut(&str),
    ) -> Result<ArchiveSummary, TakiError> {
        let mut list = tempfile::Builder::new().prefix("tar-list-").tempfile()?;
        for file in &job.files {
            list.write_all(file.as_bytes())?;
            list.write_all(b"\0")?;
        }
        list.flush()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-c").arg("-v");
        if self.xz {
            cmd.arg("-J");
        }
        let mut child = cmd
            .arg("-f")
            .arg(&job.output)
            .arg("-C")
            .arg(&job.root)
            .arg("--ignore-failed-read")
            .arg("--null")
            .arg("--verbatim-files-from")
            .arg("-T")
            .arg(list.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain stderr on its own thread so a chatty tar never blocks
        let stderr = child.stderr.take();
        let err_reader = thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut s) = stderr {
                let _ = s.read_to_string(&mut text);
            }
            text
        });

        let mut summary = ArchiveSummary::default();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                let name = line.trim_end_matches('\r');
                if name.is_empty() {
                    continue;
                }
                summary.archived += 1;
                on_file(name);
            }
        }

        let status = child.wait()?;
        let stderr = err_reader.join().unwrap_or_default();
        summary.skipped = unreadable_paths(&stderr, &job.files);
        // 1: a file changed while being read
        match status.code() {
            Some(0) | Some(1) => Ok(summary),
            _ => Err(TakiError::Remote(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                stderr.trim()
            ))),
        }
    }
}

/// Job files that tar reported as unreadable, in report order.
///
/// Diagnostics look like `tar: <path>: [Warning: ]Cannot <op>: <reason>`.
fn unreadable_paths(stderr: &str, files: &[String]) -> Vec<String> {
    let wanted: HashSet<&str> = files.iter().map(String::as_str).collect();
    let mut out: Vec<String> = Vec::new();
    for line in stderr.lines() {
        let Some((_, rest)) = line.split_once(": ") else {
            continue;
        };
        let Some(end) = rest
            .find(": Warning: Cannot ")
            .or_else(|| rest.find(": Cannot "))
        else {
            continue;
        };
        let name = &rest[..end];
        let name = name.strip_prefix("./").unwrap_or(name);
        if wanted.contains(name) && !out.iter().any(|s| s == name) {
            out.push(name.to_string());
        }
    }
    out
}

/// Pure-Rust uncompressed tar writer. Symlinks are stored as links.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTarArchiver;

impl Archiver for BuiltinTarArchiver {
    fn archive(
        &self,
        job: &ArchiveJob,
        on_file: &mut dyn FnMut(&str),
    ) -> Result<ArchiveSummary, TakiError> {
        let out = File::create(&job.output)?;
        let mut builder = Builder::new(io::BufWriter::new(out));
        builder.follow_symlinks(false);

        let mut summary = ArchiveSummary::default();
        for rel in &job.files {
            match builder.append_path_with_name(job.root.join(rel), rel) {
                Ok(()) => {
                    summary.archived += 1;
                    on_file(rel);
                }
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
                {
                    summary.skipped.push(rel.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        builder.into_inner()?.flush()?;
        Ok(summary)
    }
}

/// Byte counter fed by archiver completion lines.
#[derive(Debug)]
struct ByteProgress {
    sizes: HashMap<String, u64>,
    total: u64,
    done: AtomicU64,
    /// done / total, held below 1.0 until the archiver returns
    fraction: ProgressCell,
}

impl ByteProgress {
    fn new(sizes: HashMap<String, u64>, total: u64) -> Self {
        ByteProgress {
            sizes,
            total,
            done: AtomicU64::new(0),
            fraction: ProgressCell::new(0.0),
        }
    }

    fn record(&self, line: &str) {
        // Lines may carry trailing whitespace or a leading "./"
        let name = line.trim_end();
        let name = name.strip_prefix("./").unwrap_or(name);
        if let Some(size) = self.sizes.get(name) {
            let done = self.done.fetch_add(*size, Ordering::Relaxed) + size;
            if self.total > 0 {
                self.fraction
                    .set((done as f64 / self.total as f64).min(0.999));
            }
        }
    }
}

/// A running archive job with byte-weighted progress.
pub struct ArchiveTask {
    task: AsyncTask<ArchiveSummary>,
    progress: Arc<ByteProgress>,
}

impl ArchiveTask {
    /// Start `job` on the blocking pool. `sizes` maps each file in the job to
    /// its expected size.
    pub fn start(
        archiver: Arc<dyn Archiver>,
        job: ArchiveJob,
        sizes: HashMap<String, u64>,
    ) -> Arc<Self> {
        let total = job
            .files
            .iter()
            .map(|f| sizes.get(f).copied().unwrap_or(0))
            .sum();
        let progress = Arc::new(ByteProgress::new(sizes, total));
        let counter = Arc::clone(&progress);
        let task = AsyncTask::spawn_blocking(move || {
            archiver.archive(&job, &mut |line: &str| counter.record(line))
        });
        Arc::new(ArchiveTask { task, progress })
    }

    pub fn task(&self) -> &AsyncTask<ArchiveSummary> {
        &self.task
    }

    pub fn total_bytes(&self) -> u64 {
        self.progress.total
    }

    pub fn done_bytes(&self) -> u64 {
        self.progress.done.load(Ordering::Relaxed)
    }
}

impl Progressive for ArchiveTask {
    /// Reaches 1.0 only once the archiver has succeeded.
    fn progress(&self) -> f64 {
        if let TaskState::Succeeded(_) = self.task.state() {
            return 1.0;
        }
        self.progress.fraction.get()
    }
}
