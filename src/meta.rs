//! Content-addressed directory metadata tree
//!
//! A `DirMeta` tree records every file as (name, mode, hash, size). Files and
//! subdirectories live in separate maps, so a file and a directory may share a
//! name without colliding.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SEP: char = '/';

// File-type bits folded into `mode`, matching the Unix st_mode layout
pub const MODE_DIR: u32 = 0o040000;
pub const MODE_FILE: u32 = 0o100000;
pub const MODE_SYMLINK: u32 = 0o120000;
pub const MODE_PERM_MASK: u32 = 0o7777;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub mode: u32,
    /// Hex SHA-256 of the full contents (the link target for symlinks)
    pub hash: String,
    pub size: u64,
}

impl FileMeta {
    pub fn is_symlink(&self) -> bool {
        self.mode & !MODE_PERM_MASK == MODE_SYMLINK
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
    pub name: String,
    pub mode: u32,
    pub files: HashMap<String, FileMeta>,
    pub dirs: HashMap<String, DirMeta>,
}

impl Default for DirMeta {
    fn default() -> Self {
        DirMeta::new("")
    }
}

impl DirMeta {
    pub fn new(name: impl Into<String>) -> Self {
        DirMeta {
            name: name.into(),
            mode: MODE_DIR | 0o755,
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }

    pub fn add_file(&mut self, fm: FileMeta) {
        self.files.insert(fm.name.clone(), fm);
    }

    pub fn add_dir(&mut self, dm: DirMeta) {
        self.dirs.insert(dm.name.clone(), dm);
    }

    /// Like `mkdir -p`: returns the directory at `path`, creating any missing
    /// directories along the way. Existing directories are never replaced.
    pub fn make_dir(&mut self, path: &str) -> &mut DirMeta {
        let mut dm = self;
        for name in split_path(path) {
            dm = dm
                .dirs
                .entry(name.to_string())
                .or_insert_with(|| DirMeta::new(name));
        }
        dm
    }

    pub fn get_dir(&self, path: &str) -> Option<&DirMeta> {
        let mut dm = self;
        for name in split_path(path) {
            dm = dm.dirs.get(name)?;
        }
        Some(dm)
    }

    /// Look up a file by its root-relative path. Returns `None` when either
    /// the parent directory or the file itself is missing.
    pub fn get_file(&self, path: &str) -> Option<&FileMeta> {
        let mut parts = split_path(path);
        let name = parts.pop()?;
        let mut dm = self;
        for dir in parts {
            dm = dm.dirs.get(dir)?;
        }
        dm.files.get(name)
    }

    /// Every file path under this directory, slash separated and relative to it.
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for name in self.files.keys() {
            out.push(join_path(prefix, name));
        }
        for (name, dir) in &self.dirs {
            dir.collect_paths(&join_path(prefix, name), out);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len() + self.dirs.values().map(DirMeta::file_count).sum::<usize>()
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum::<u64>()
            + self.dirs.values().map(DirMeta::total_size).sum::<u64>()
    }
}

/// Split a slash path into clean components: empty and `.` parts are dropped,
/// `..` removes the previous component and never climbs above the root.
pub fn split_path(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for part in path.split(SEP) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    parts
}

/// Canonical slash form of a root-relative path ("" for the root itself).
pub fn clean_path(path: &str) -> String {
    split_path(path).join("/")
}

pub fn join_path(root: &str, name: &str) -> String {
    if root.is_empty() {
        name.to_string()
    } else {
        format!("{root}{SEP}{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, hash: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.into(),
            mode: MODE_FILE | 0o644,
            hash: hash.into(),
            size,
        }
    }

    #[test]
    fn test_split_path_cleans() {
        assert_eq!(split_path("./a//b/./c/"), vec!["a", "b", "c"]);
        assert_eq!(split_path("a/../b"), vec!["b"]);
        assert_eq!(split_path("../../x"), vec!["x"]);
        assert!(split_path(".").is_empty());
        assert!(split_path("/").is_empty());
        assert_eq!(clean_path("/etc//passwd"), "etc/passwd");
    }

    #[test]
    fn test_make_dir_creates_and_reuses() {
        let mut root = DirMeta::new("");
        root.make_dir("a/b/c").add_file(file("f", "h", 1));
        // A second make_dir on an existing prefix must not wipe children
        root.make_dir("a/b");
        assert!(root.get_file("a/b/c/f").is_some());
        assert_eq!(root.make_dir(".").name, "");
    }

    #[test]
    fn test_get_file_resolves_through_parent() {
        let mut root = DirMeta::new("");
        root.make_dir("etc").add_file(file("passwd", "h1", 10));
        root.add_file(file("top", "h2", 3));

        assert_eq!(root.get_file("etc/passwd").map(|f| f.size), Some(10));
        assert_eq!(root.get_file("./top").map(|f| f.hash.as_str()), Some("h2"));
        // Missing parent and missing leaf both come back empty
        assert!(root.get_file("var/passwd").is_none());
        assert!(root.get_file("etc/shadow").is_none());
        // A directory is not a file
        assert!(root.get_file("etc").is_none());
        assert!(root.get_file("").is_none());
    }

    #[test]
    fn test_get_dir() {
        let mut root = DirMeta::new("");
        root.make_dir("usr/lib");
        assert_eq!(root.get_dir("usr/lib").map(|d| d.name.as_str()), Some("lib"));
        assert!(root.get_dir("usr/share").is_none());
        assert_eq!(root.get_dir("").map(|d| d.name.as_str()), Some(""));
    }

    #[test]
    fn test_counts_and_paths() {
        let mut root = DirMeta::new("");
        root.add_file(file("a", "1", 5));
        root.make_dir("d").add_file(file("b", "2", 7));
        root.make_dir("d/e").add_file(file("c", "3", 11));

        let mut paths = root.file_paths();
        paths.sort();
        assert_eq!(paths, vec!["a", "d/b", "d/e/c"]);
        assert_eq!(root.file_count(), 3);
        assert_eq!(root.total_size(), 23);
    }

    #[test]
    fn test_symlink_mode() {
        let mut link = file("l", "h", 4);
        assert!(!link.is_symlink());
        link.mode = MODE_SYMLINK | 0o777;
        assert!(link.is_symlink());
    }
}
