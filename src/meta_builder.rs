//! Fill a `DirMeta` tree from a live filesystem or a tar stream
//!
//! Both sources funnel through `DirMetaBuilder::insert`, so tree shape and
//! exclusion semantics are identical regardless of where entries come from.
//! Recoverable per-path failures (permissions, vanished files, special files)
//! are collected into `path_errors` and never abort the walk.

use crate::error::TakiError;
use crate::meta::{
    clean_path, split_path, DirMeta, FileMeta, MODE_DIR, MODE_FILE, MODE_PERM_MASK, MODE_SYMLINK,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::Path;
use tar::{Archive, EntryType};
use walkdir::WalkDir;

// Streaming hash buffer; files are never read whole into memory
const HASH_BUF_SIZE: usize = 64 * 1024;

/// One traversal entry handed to `insert`.
pub enum Entry<'a> {
    Dir { mode: u32 },
    File { mode: u32, reader: &'a mut dyn Read },
    Symlink { mode: u32, target: &'a str },
    /// Devices, FIFOs, sockets: recorded as path errors, never opened
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    SkipDir,
}

pub struct DirMetaBuilder {
    root: DirMeta,
    /// Per-path failures keyed by root-relative path
    path_errors: HashMap<String, io::Error>,
    /// Root-relative paths to leave out; a directory takes its subtree with it
    excludes: HashSet<String>,
    buf: Vec<u8>,
}

impl Default for DirMetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DirMetaBuilder {
    pub fn new() -> Self {
        DirMetaBuilder {
            root: DirMeta::new(""),
            path_errors: HashMap::new(),
            excludes: HashSet::new(),
            buf: vec![0u8; HASH_BUF_SIZE],
        }
    }

    pub fn with_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excludes
            .extend(excludes.into_iter().map(|e| clean_path(e.as_ref())));
        self
    }

    pub fn root(&self) -> &DirMeta {
        &self.root
    }

    pub fn path_errors(&self) -> &HashMap<String, io::Error> {
        &self.path_errors
    }

    pub fn has_errors(&self) -> bool {
        !self.path_errors.is_empty()
    }

    pub fn finish(self) -> (DirMeta, HashMap<String, io::Error>) {
        (self.root, self.path_errors)
    }

    pub fn record_error(&mut self, path: &str, err: io::Error) {
        self.path_errors.insert(clean_path(path), err);
    }

    fn is_excluded(&self, parts: &[&str]) -> bool {
        if self.excludes.is_empty() {
            return false;
        }
        (1..=parts.len()).any(|n| self.excludes.contains(&parts[..n].join("/")))
    }

    /// Insert a single entry. Missing parent directories are created on the
    /// way; a path that cleans to the root itself is ignored.
    pub fn insert(&mut self, path: &str, entry: Entry<'_>) -> Visit {
        let mut parts = split_path(path);
        if parts.is_empty() {
            return Visit::Continue;
        }
        if self.is_excluded(&parts) {
            return match entry {
                Entry::Dir { .. } => Visit::SkipDir,
                _ => Visit::Continue,
            };
        }
        let rel = parts.join("/");
        let name = parts.pop().unwrap_or_default().to_string();
        let parent = parts.join("/");

        match entry {
            Entry::Dir { mode } => {
                let dm = self.root.make_dir(&rel);
                dm.mode = MODE_DIR | (mode & MODE_PERM_MASK);
            }
            Entry::File { mode, reader } => match hash_reader(&mut self.buf, reader) {
                Ok((size, hash)) => {
                    self.root.make_dir(&parent).add_file(FileMeta {
                        name,
                        mode: MODE_FILE | (mode & MODE_PERM_MASK),
                        hash,
                        size,
                    });
                }
                Err(e) => {
                    self.path_errors.insert(rel, e);
                }
            },
            Entry::Symlink { mode, target } => {
                let mut reader = target.as_bytes();
                match hash_reader(&mut self.buf, &mut reader) {
                    Ok((size, hash)) => {
                        self.root.make_dir(&parent).add_file(FileMeta {
                            name,
                            mode: MODE_SYMLINK | (mode & MODE_PERM_MASK),
                            hash,
                            size,
                        });
                    }
                    Err(e) => {
                        self.path_errors.insert(rel, e);
                    }
                }
            }
            Entry::Unsupported(kind) => {
                self.path_errors.insert(
                    rel,
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("unsupported file type: {kind}"),
                    ),
                );
            }
        }
        Visit::Continue
    }

    /// Walk a live directory tree. Symlinks are recorded, never followed.
    /// Fails only if `root` itself cannot be read.
    pub fn add_fs(&mut self, root: &Path) -> Result<(), TakiError> {
        let mut it = WalkDir::new(root).follow_links(false).into_iter();
        while let Some(next) = it.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 {
                        return Err(walk_error(err).into());
                    }
                    let rel = err
                        .path()
                        .and_then(|p| p.strip_prefix(root).ok())
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.record_error(&rel, walk_error(err));
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(p) => p.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            let ft = entry.file_type();
            let visit = if ft.is_dir() {
                let mode = entry.metadata().map(|md| perm_bits(&md)).unwrap_or(0o755);
                self.insert(&rel, Entry::Dir { mode })
            } else if ft.is_symlink() {
                match (entry.metadata(), fs::read_link(entry.path())) {
                    (Ok(md), Ok(target)) => {
                        let target = target.to_string_lossy();
                        self.insert(
                            &rel,
                            Entry::Symlink {
                                mode: perm_bits(&md),
                                target: &target,
                            },
                        )
                    }
                    (Err(e), _) => {
                        self.record_error(&rel, walk_error(e));
                        Visit::Continue
                    }
                    (_, Err(e)) => {
                        self.record_error(&rel, e);
                        Visit::Continue
                    }
                }
            } else if ft.is_file() {
                match (entry.metadata(), File::open(entry.path())) {
                    (Ok(md), Ok(mut file)) => self.insert(
                        &rel,
                        Entry::File {
                            mode: perm_bits(&md),
                            reader: &mut file,
                        },
                    ),
                    (Err(e), _) => {
                        self.record_error(&rel, walk_error(e));
                        Visit::Continue
                    }
                    (_, Err(e)) => {
                        self.record_error(&rel, e);
                        Visit::Continue
                    }
                }
            } else {
                self.insert(&rel, Entry::Unsupported(special_kind(&ft)))
            };
            if visit == Visit::SkipDir {
                it.skip_current_dir();
            }
        }
        Ok(())
    }

    /// Decode a sequential tar stream. Stream corruption is fatal; individual
    /// unreadable entries are not.
    pub fn add_tar<R: Read>(&mut self, rd: R) -> Result<(), TakiError> {
        let mut archive = Archive::new(rd);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let header = entry.header();
            let mode = header.mode().unwrap_or(0o644);
            let kind = header.entry_type();
            match kind {
                EntryType::Directory => {
                    self.insert(&path, Entry::Dir { mode });
                }
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    self.insert(
                        &path,
                        Entry::File {
                            mode,
                            reader: &mut entry,
                        },
                    );
                }
                EntryType::Symlink => match entry.link_name() {
                    Ok(Some(target)) => {
                        let target = target.to_string_lossy().into_owned();
                        self.insert(
                            &path,
                            Entry::Symlink {
                                mode,
                                target: &target,
                            },
                        );
                    }
                    Ok(None) => self.record_error(
                        &path,
                        io::Error::new(io::ErrorKind::InvalidData, "symlink without target"),
                    ),
                    Err(e) => self.record_error(&path, e),
                },
                EntryType::Link => match entry.link_name() {
                    Ok(Some(target)) => {
                        let target = target.to_string_lossy().into_owned();
                        self.insert_hard_link(&path, &target);
                    }
                    Ok(None) => self.record_error(
                        &path,
                        io::Error::new(io::ErrorKind::InvalidData, "hard link without target"),
                    ),
                    Err(e) => self.record_error(&path, e),
                },
                EntryType::Char => {
                    self.insert(&path, Entry::Unsupported("character device"));
                }
                EntryType::Block => {
                    self.insert(&path, Entry::Unsupported("block device"));
                }
                EntryType::Fifo => {
                    self.insert(&path, Entry::Unsupported("fifo"));
                }
                // pax/GNU metadata records are consumed by the tar reader
                _ => {}
            }
        }
        Ok(())
    }

    /// A tar hard link carries no data; it takes the record of its target.
    fn insert_hard_link(&mut self, path: &str, target: &str) {
        let mut parts = split_path(path);
        if parts.is_empty() || self.is_excluded(&parts) {
            return;
        }
        let Some(mut fm) = self.root.get_file(target).cloned() else {
            self.record_error(
                path,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("hard link target '{target}' not in archive"),
                ),
            );
            return;
        };
        fm.name = parts.pop().unwrap_or_default().to_string();
        self.root.make_dir(&parts.join("/")).add_file(fm);
    }
}

/// Hash the contents of a reader through `buf`, returning total size and hex digest.
pub fn hash_reader(buf: &mut [u8], rd: &mut dyn Read) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    loop {
        let n = match rd.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, format!("{:x}", hasher.finalize())))
}

/// Build a tree from a tar file on disk.
pub fn build_from_tar_file(path: &Path) -> Result<DirMetaBuilder, TakiError> {
    let file = File::open(path)?;
    let mut builder = DirMetaBuilder::new();
    builder.add_tar(io::BufReader::new(file))?;
    Ok(builder)
}

fn walk_error(err: walkdir::Error) -> io::Error {
    let msg = err.to_string();
    err.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg))
}

#[cfg(unix)]
fn perm_bits(md: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & MODE_PERM_MASK
}

#[cfg(not(unix))]
fn perm_bits(md: &Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else if md.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn special_kind(ft: &fs::FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;
    if ft.is_char_device() {
        "character device"
    } else if ft.is_block_device() {
        "block device"
    } else if ft.is_fifo() {
        "fifo"
    } else if ft.is_socket() {
        "socket"
    } else {
        "unknown"
    }
}

#[cfg(not(unix))]
fn special_kind(_ft: &fs::FileType) -> &'static str {
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, data).unwrap();
    }

    fn tar_file(b: &mut Builder<Vec<u8>>, path: &str, data: &[u8], mode: u32) {
        let mut h = Header::new_gnu();
        h.set_entry_type(EntryType::Regular);
        h.set_size(data.len() as u64);
        h.set_mode(mode);
        h.set_cksum();
        b.append_data(&mut h, path, data).unwrap();
    }

    fn tar_link(b: &mut Builder<Vec<u8>>, kind: EntryType, path: &str, target: &str) {
        let mut h = Header::new_gnu();
        h.set_entry_type(kind);
        h.set_size(0);
        h.set_mode(0o777);
        h.set_cksum();
        b.append_link(&mut h, path, target).unwrap();
    }

    fn sha(data: &[u8]) -> String {
        let mut buf = [0u8; 16];
        hash_reader(&mut buf, &mut &data[..]).unwrap().1
    }

    #[test]
    fn test_hash_reader_small_buffer() {
        let data = vec![7u8; 10_000];
        let mut buf = [0u8; 13];
        let (size, hash) = hash_reader(&mut buf, &mut &data[..]).unwrap();
        assert_eq!(size, 10_000);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, sha(&data));
        // Known vector: sha256("")
        assert_eq!(
            sha(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_add_fs_basic_and_deterministic() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a/x", b"hello");
        write(tmp.path(), "a/b/y", b"world!");
        write(tmp.path(), "top", b"");

        let mut b1 = DirMetaBuilder::new();
        b1.add_fs(tmp.path()).unwrap();
        let mut b2 = DirMetaBuilder::new();
        b2.add_fs(tmp.path()).unwrap();
        assert!(!b1.has_errors());
        assert_eq!(b1.root(), b2.root());

        let x = b1.root().get_file("a/x").unwrap();
        assert_eq!(x.size, 5);
        assert_eq!(x.hash, sha(b"hello"));
        assert_eq!(x.mode & !MODE_PERM_MASK, MODE_FILE);
        assert_eq!(b1.root().get_file("a/b/y").unwrap().size, 6);
        assert_eq!(b1.root().get_file("top").unwrap().size, 0);
    }

    #[test]
    fn test_add_fs_excludes_subtree_and_exact_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "proc/1/status", b"x");
        write(tmp.path(), "etc/passwd", b"root");
        write(tmp.path(), "etc/hostname", b"box");

        let mut b = DirMetaBuilder::new().with_excludes(["proc", "/etc/hostname"]);
        b.add_fs(tmp.path()).unwrap();
        assert!(b.root().get_dir("proc").is_none());
        assert!(b.root().get_file("etc/hostname").is_none());
        assert!(b.root().get_file("etc/passwd").is_some());
    }

    #[test]
    fn test_add_fs_missing_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut b = DirMetaBuilder::new();
        assert!(b.add_fs(&tmp.path().join("nope")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_add_fs_special_file_is_path_error() {
        use std::os::unix::net::UnixListener;
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "ok", b"fine");
        let _sock = UnixListener::bind(tmp.path().join("sock")).unwrap();

        let mut b = DirMetaBuilder::new();
        b.add_fs(tmp.path()).unwrap();
        assert!(b.root().get_file("ok").is_some());
        assert!(b.root().get_file("sock").is_none());
        let err = b.path_errors().get("sock").unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[cfg(unix)]
    #[test]
    fn test_add_fs_records_symlink_without_following() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "real", b"data");
        std::os::unix::fs::symlink("/etc/passwd", tmp.path().join("link")).unwrap();

        let mut b = DirMetaBuilder::new();
        b.add_fs(tmp.path()).unwrap();
        let link = b.root().get_file("link").unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.hash, sha(b"/etc/passwd"));
        assert_eq!(link.size, "/etc/passwd".len() as u64);
    }

    #[test]
    fn test_add_tar_creates_missing_dirs() {
        let mut tb = Builder::new(Vec::new());
        // Child arrives before its directory entry
        tar_file(&mut tb, "usr/bin/tool", b"elf", 0o755);
        let mut h = Header::new_gnu();
        h.set_entry_type(EntryType::Directory);
        h.set_size(0);
        h.set_mode(0o700);
        h.set_cksum();
        tb.append_data(&mut h, "usr/", &[][..]).unwrap();
        let data = tb.into_inner().unwrap();

        let mut b = DirMetaBuilder::new();
        b.add_tar(&data[..]).unwrap();
        let usr = b.root().get_dir("usr").unwrap();
        assert_eq!(usr.mode, MODE_DIR | 0o700);
        let tool = b.root().get_file("usr/bin/tool").unwrap();
        assert_eq!(tool.mode, MODE_FILE | 0o755);
        assert_eq!(tool.hash, sha(b"elf"));
    }

    #[test]
    fn test_add_tar_links_and_devices() {
        let mut tb = Builder::new(Vec::new());
        tar_file(&mut tb, "bin/busybox", b"multi-call", 0o755);
        tar_link(&mut tb, EntryType::Link, "bin/ls", "bin/busybox");
        tar_link(&mut tb, EntryType::Link, "bin/gone", "bin/missing");
        tar_link(&mut tb, EntryType::Symlink, "bin/sh", "busybox");
        let mut h = Header::new_gnu();
        h.set_entry_type(EntryType::Char);
        h.set_size(0);
        h.set_mode(0o666);
        h.set_cksum();
        tb.append_data(&mut h, "dev/null", &[][..]).unwrap();
        let data = tb.into_inner().unwrap();

        let mut b = DirMetaBuilder::new();
        b.add_tar(&data[..]).unwrap();
        let root = b.root();
        let ls = root.get_file("bin/ls").unwrap();
        assert_eq!(ls.name, "ls");
        assert_eq!(ls.hash, root.get_file("bin/busybox").unwrap().hash);
        assert!(root.get_file("bin/sh").unwrap().is_symlink());
        assert!(root.get_file("dev/null").is_none());
        assert!(b.path_errors().contains_key("dev/null"));
        assert!(b.path_errors().contains_key("bin/gone"));
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_and_tar_sources_agree() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "etc/conf", b"k=v");
        write(tmp.path(), "var/log/app.log", b"line\n");
        for (rel, mode) in [
            ("etc", 0o755),
            ("var", 0o755),
            ("var/log", 0o750),
            ("etc/conf", 0o644),
            ("var/log/app.log", 0o600),
        ] {
            fs::set_permissions(tmp.path().join(rel), fs::Permissions::from_mode(mode)).unwrap();
        }

        let mut tb = Builder::new(Vec::new());
        for rel in ["etc", "etc/conf", "var", "var/log", "var/log/app.log"] {
            tb.append_path_with_name(tmp.path().join(rel), rel).unwrap();
        }
        let data = tb.into_inner().unwrap();

        let mut from_fs = DirMetaBuilder::new();
        from_fs.add_fs(tmp.path()).unwrap();
        let mut from_tar = DirMetaBuilder::new();
        from_tar.add_tar(&data[..]).unwrap();
        assert_eq!(from_fs.root(), from_tar.root());
    }
}
