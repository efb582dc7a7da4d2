//! Remote file access over the agent channel
//!
//! The agent keeps a `VirtualFileTable` of open files addressed by integer
//! handles; the operator drives it through `RpcFs` and `RemoteFile`. Handles
//! start at 1, are never reused, and die on `Fclose`.

use crate::error::TakiError;
use crate::protocol::{method, MAX_READ_SIZE};
use crate::rpc::{Router, RpcClient};
use glob_match::glob_match;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        OpenFlags {
            read: true,
            ..Default::default()
        }
    }

    /// Create or truncate for writing
    pub fn create() -> Self {
        OpenFlags {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    Start,
    Current,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FopenReq {
    pub path: String,
    pub flags: OpenFlags,
    pub perm: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HandleReq {
    pub handle: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FreadReq {
    pub handle: u64,
    pub n: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FwriteReq {
    pub handle: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FseekReq {
    pub handle: u64,
    pub offset: i64,
    pub whence: Whence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadDirReq {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobReq {
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    /// Seconds since the Unix epoch, when the platform reports it
    pub modified: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub mode: u32,
}

type SharedFile = Arc<AsyncMutex<File>>;

struct FileSlots {
    next: u64,
    files: HashMap<u64, SharedFile>,
}

/// Agent-side handle table. The map lock is only held for lookups; each
/// file has its own lock for the duration of an operation.
pub struct VirtualFileTable {
    slots: Mutex<FileSlots>,
}

impl Default for VirtualFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileTable {
    pub fn new() -> Self {
        VirtualFileTable {
            slots: Mutex::new(FileSlots {
                next: 1,
                files: HashMap::new(),
            }),
        }
    }

    fn get(&self, handle: u64) -> Result<SharedFile, TakiError> {
        self.slots
            .lock()
            .files
            .get(&handle)
            .cloned()
            .ok_or(TakiError::Handle(handle))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn open(&self, req: FopenReq) -> Result<u64, TakiError> {
        let mut opts = OpenOptions::new();
        opts.read(req.flags.read)
            .write(req.flags.write)
            .append(req.flags.append)
            .create(req.flags.create)
            .truncate(req.flags.truncate);
        #[cfg(unix)]
        {
            if req.perm != 0 {
                opts.mode(req.perm);
            }
        }
        let file = opts.open(&req.path).await?;

        let mut slots = self.slots.lock();
        let handle = slots.next;
        slots.next += 1;
        slots.files.insert(handle, Arc::new(AsyncMutex::new(file)));
        Ok(handle)
    }

    /// Read up to `n` bytes (capped at `MAX_READ_SIZE`). Fewer bytes than
    /// asked for means end of file.
    pub async fn read(&self, handle: u64, n: u64) -> Result<Vec<u8>, TakiError> {
        let file = self.get(handle)?;
        let mut file = file.lock().await;
        let n = n.min(MAX_READ_SIZE as u64);
        let mut buf = Vec::with_capacity(n as usize);
        (&mut *file).take(n).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn write(&self, handle: u64, data: &[u8]) -> Result<u64, TakiError> {
        let file = self.get(handle)?;
        let mut file = file.lock().await;
        let n = file.write(data).await?;
        file.flush().await?;
        Ok(n as u64)
    }

    pub async fn seek(&self, handle: u64, offset: i64, whence: Whence) -> Result<u64, TakiError> {
        let pos = match whence {
            Whence::Start => SeekFrom::Start(u64::try_from(offset).map_err(|_| {
                TakiError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "negative offset from start",
                ))
            })?),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        let file = self.get(handle)?;
        let mut file = file.lock().await;
        Ok(file.seek(pos).await?)
    }

    pub async fn stat(&self, handle: u64) -> Result<FileStat, TakiError> {
        let file = self.get(handle)?;
        let file = file.lock().await;
        let md = file.metadata().await?;
        Ok(FileStat {
            size: md.len(),
            mode: mode_of(&md),
            is_dir: md.is_dir(),
            modified: md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
        })
    }

    pub fn close(&self, handle: u64) -> Result<(), TakiError> {
        self.slots
            .lock()
            .files
            .remove(&handle)
            .map(|_| ())
            .ok_or(TakiError::Handle(handle))
    }

    /// Entries of a directory, sorted by name. Symlinks are not followed.
    pub async fn read_dir(&self, path: &str) -> Result<Vec<DirEntryInfo>, TakiError> {
        let mut rd = tokio::fs::read_dir(path).await?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let md = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(md) => md,
                // Vanished between listing and stat
                Err(_) => continue,
            };
            out.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: md.is_dir(),
                is_symlink: md.file_type().is_symlink(),
                size: md.len(),
                mode: mode_of(&md),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, TakiError> {
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || glob_paths(&pattern))
            .await
            .map_err(|e| TakiError::protocol(format!("glob task failed: {e}")))
    }
}

#[cfg(unix)]
fn mode_of(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
fn mode_of(md: &std::fs::Metadata) -> u32 {
    use crate::meta::{MODE_DIR, MODE_FILE};
    let perm = if md.permissions().readonly() { 0o444 } else { 0o644 };
    if md.is_dir() {
        MODE_DIR | perm | 0o111
    } else {
        MODE_FILE | perm
    }
}

/// Expand a slash pattern one segment at a time. Only segments containing
/// wildcards list directories; unreadable directories match nothing.
fn glob_paths(pattern: &str) -> Vec<String> {
    let absolute = pattern.starts_with('/');
    let mut current = vec![if absolute {
        PathBuf::from("/")
    } else {
        PathBuf::from(".")
    }];
    for seg in pattern.split('/').filter(|s| !s.is_empty() && *s != ".") {
        let wild = seg.contains(['*', '?', '[', '{']);
        let mut next = Vec::new();
        for base in &current {
            if !wild {
                let p = base.join(seg);
                if std::fs::symlink_metadata(&p).is_ok() {
                    next.push(p);
                }
                continue;
            }
            let Ok(entries) = std::fs::read_dir(base) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                if glob_match(seg, &name.to_string_lossy()) {
                    next.push(entry.path());
                }
            }
        }
        current = next;
    }
    let mut out: Vec<String> = current
        .into_iter()
        .map(|p| {
            let s = p.to_string_lossy().into_owned();
            match s.strip_prefix("./") {
                Some(rel) => rel.to_string(),
                None => s,
            }
        })
        .collect();
    out.sort();
    out
}

/// State that exposes a file table to the `RpcFs.*` routes.
pub trait HasFiles {
    fn files(&self) -> &VirtualFileTable;
}

/// Register every `RpcFs` method on `router`.
pub fn routes<S>(router: Router<S>) -> Router<S>
where
    S: HasFiles + Send + Sync + 'static,
{
    router
        .route(method::FOPEN, |s: Arc<S>, req: FopenReq| async move {
            s.files().open(req).await
        })
        .route(method::FREAD, |s: Arc<S>, req: FreadReq| async move {
            s.files().read(req.handle, req.n).await
        })
        .route(method::FWRITE, |s: Arc<S>, req: FwriteReq| async move {
            s.files().write(req.handle, &req.data).await
        })
        .route(method::FSEEK, |s: Arc<S>, req: FseekReq| async move {
            s.files().seek(req.handle, req.offset, req.whence).await
        })
        .route(method::FSTAT, |s: Arc<S>, req: HandleReq| async move {
            s.files().stat(req.handle).await
        })
        .route(method::FCLOSE, |s: Arc<S>, req: HandleReq| async move {
            s.files().close(req.handle)
        })
        .route(method::READ_DIR, |s: Arc<S>, req: ReadDirReq| async move {
            s.files().read_dir(&req.path).await
        })
        .route(method::GLOB, |s: Arc<S>, req: GlobReq| async move {
            s.files().glob(&req.pattern).await
        })
}

/// Operator-side entry point to the agent's file table.
#[derive(Clone)]
pub struct RpcFs {
    client: Arc<RpcClient>,
    cancel: CancellationToken,
}

impl RpcFs {
    pub fn new(client: Arc<RpcClient>, cancel: CancellationToken) -> Self {
        RpcFs { client, cancel }
    }

    pub async fn open(&self, path: &str, flags: OpenFlags, perm: u32) -> Result<RemoteFile, TakiError> {
        let req = FopenReq {
            path: path.to_string(),
            flags,
            perm,
        };
        let handle: u64 = self.client.call(method::FOPEN, &req, &self.cancel).await?;
        Ok(RemoteFile {
            fs: self.clone(),
            path: path.to_string(),
            handle,
            closed: false,
        })
    }

    pub async fn open_read(&self, path: &str) -> Result<RemoteFile, TakiError> {
        self.open(path, OpenFlags::read_only(), 0).await
    }

    pub async fn create(&self, path: &str, perm: u32) -> Result<RemoteFile, TakiError> {
        self.open(path, OpenFlags::create(), perm).await
    }

    pub async fn read_dir(&self, path: &str) -> Result<Vec<DirEntryInfo>, TakiError> {
        let req = ReadDirReq {
            path: path.to_string(),
        };
        self.client.call(method::READ_DIR, &req, &self.cancel).await
    }

    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, TakiError> {
        let req = GlobReq {
            pattern: pattern.to_string(),
        };
        self.client.call(method::GLOB, &req, &self.cancel).await
    }
}

/// Proxy for one open remote file. Operations must be issued one at a time.
pub struct RemoteFile {
    fs: RpcFs,
    path: String,
    handle: u64,
    closed: bool,
}

impl RemoteFile {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn live_handle(&self) -> Result<u64, TakiError> {
        if self.closed {
            Err(TakiError::Handle(self.handle))
        } else {
            Ok(self.handle)
        }
    }

    /// Up to `n` bytes; a short or empty result means end of file.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>, TakiError> {
        let req = FreadReq {
            handle: self.live_handle()?,
            n: n.min(MAX_READ_SIZE) as u64,
        };
        self.fs.client.call(method::FREAD, &req, &self.fs.cancel).await
    }

    /// One write call; the agent may accept fewer bytes than offered.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TakiError> {
        let req = FwriteReq {
            handle: self.live_handle()?,
            data: data.to_vec(),
        };
        let n: u64 = self.fs.client.call(method::FWRITE, &req, &self.fs.cancel).await?;
        Ok(n as usize)
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), TakiError> {
        while !data.is_empty() {
            let chunk = &data[..data.len().min(MAX_READ_SIZE)];
            let n = self.write(chunk).await?;
            if n == 0 {
                return Err(TakiError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            data = &data[n..];
        }
        Ok(())
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, TakiError> {
        let (offset, whence) = match pos {
            SeekFrom::Start(o) => {
                let o = i64::try_from(o).map_err(|_| {
                    TakiError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("seek offset {o} out of range"),
                    ))
                })?;
                (o, Whence::Start)
            }
            SeekFrom::Current(o) => (o, Whence::Current),
            SeekFrom::End(o) => (o, Whence::End),
        };
        let req = FseekReq {
            handle: self.live_handle()?,
            offset,
            whence,
        };
        self.fs.client.call(method::FSEEK, &req, &self.fs.cancel).await
    }

    pub async fn stat(&self) -> Result<FileStat, TakiError> {
        let req = HandleReq {
            handle: self.live_handle()?,
        };
        self.fs.client.call(method::FSTAT, &req, &self.fs.cancel).await
    }

    pub async fn close(&mut self) -> Result<(), TakiError> {
        let req = HandleReq {
            handle: self.live_handle()?,
        };
        // Stays open locally if the call fails so it can be retried
        self.fs
            .client
            .call::<_, ()>(method::FCLOSE, &req, &self.fs.cancel)
            .await?;
        self.closed = true;
        Ok(())
    }

    /// Stream the rest of the file into `dst` in `chunk`-sized reads.
    /// `progress` gets (bytes copied, remote size) after every chunk.
    pub async fn copy_to<W, F>(&mut self, dst: &mut W, chunk: usize, mut progress: F) -> Result<u64, TakiError>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(u64, u64),
    {
        let total = self.stat().await?.size;
        let chunk = chunk.clamp(1, MAX_READ_SIZE);
        let mut copied = 0u64;
        progress(0, total);
        loop {
            let buf = self.read(chunk).await?;
            dst.write_all(&buf).await?;
            copied += buf.len() as u64;
            progress(copied, total);
            if buf.len() < chunk {
                break;
            }
        }
        dst.flush().await?;
        Ok(copied)
    }
}
