//! Filesystem diff: the full list of files added, removed, and modified
//! between a base tree and a target tree.

use crate::meta::{join_path, DirMeta};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsDiff {
    /// Paths present only in the target
    pub added: Vec<String>,
    /// Paths present only in the base
    pub removed: Vec<String>,
    /// Paths in both whose records differ (mode, hash, or size)
    pub modified: Vec<String>,
}

impl FsDiff {
    /// Compare `base` against `target`. Every file under a wholly added or
    /// removed directory is listed individually.
    pub fn compare(base: &DirMeta, target: &DirMeta) -> Self {
        let mut diff = FsDiff::default();
        diff.compare_dirs("", base, target);
        diff
    }

    fn compare_dirs(&mut self, root: &str, lt: &DirMeta, rt: &DirMeta) {
        for (name, lf) in &lt.files {
            match rt.files.get(name) {
                Some(rf) if rf != lf => self.modified.push(join_path(root, name)),
                Some(_) => {}
                None => self.removed.push(join_path(root, name)),
            }
        }
        for name in rt.files.keys() {
            if !lt.files.contains_key(name) {
                self.added.push(join_path(root, name));
            }
        }

        for (name, ld) in &lt.dirs {
            let path = join_path(root, name);
            match rt.dirs.get(name) {
                Some(rd) => self.compare_dirs(&path, ld, rd),
                None => collect_files(&path, ld, &mut self.removed),
            }
        }
        for (name, rd) in &rt.dirs {
            if !lt.dirs.contains_key(name) {
                collect_files(&join_path(root, name), rd, &mut self.added);
            }
        }
    }

    /// Added followed by modified: everything that has to be collected.
    pub fn added_modified(&self) -> Vec<String> {
        let mut lst = Vec::with_capacity(self.added.len() + self.modified.len());
        lst.extend(self.added.iter().cloned());
        lst.extend(self.modified.iter().cloned());
        lst
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Lexically sort each bucket. Comparison order is otherwise unspecified.
    pub fn sort(&mut self) {
        self.added.sort();
        self.removed.sort();
        self.modified.sort();
    }
}

fn collect_files(root: &str, dm: &DirMeta, out: &mut Vec<String>) {
    out.extend(dm.files.keys().map(|name| join_path(root, name)));
    for (name, dir) in &dm.dirs {
        collect_files(&join_path(root, name), dir, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FileMeta, MODE_FILE};

    fn file(name: &str, hash: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.into(),
            mode: MODE_FILE | 0o644,
            hash: hash.into(),
            size,
        }
    }

    fn tree(entries: &[(&str, &str, u64)]) -> DirMeta {
        let mut root = DirMeta::new("");
        for (path, hash, size) in entries {
            let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
            root.make_dir(parent).add_file(file(name, hash, *size));
        }
        root
    }

    fn sorted(mut d: FsDiff) -> FsDiff {
        d.sort();
        d
    }

    #[test]
    fn test_identical_trees_have_empty_diff() {
        let t = tree(&[("a/x", "h1", 10), ("a/b/c", "h2", 3), ("top", "h3", 0)]);
        let d = FsDiff::compare(&t, &t);
        assert!(d.is_empty());
    }

    #[test]
    fn test_disjoint_trees() {
        let a = tree(&[("a/1", "h", 1), ("a/sub/2", "h", 2)]);
        let b = tree(&[("b/3", "h", 3), ("4", "h", 4)]);
        let d = sorted(FsDiff::compare(&a, &b));
        let mut a_paths = a.file_paths();
        let mut b_paths = b.file_paths();
        a_paths.sort();
        b_paths.sort();
        assert_eq!(d.removed, a_paths);
        assert_eq!(d.added, b_paths);
        assert!(d.modified.is_empty());
    }

    #[test]
    fn test_modified_and_added_in_same_dir() {
        let base = tree(&[("a/x", "H1", 10)]);
        let target = tree(&[("a/x", "H2", 10), ("a/y", "H3", 1)]);
        let d = sorted(FsDiff::compare(&base, &target));
        assert_eq!(d.modified, vec!["a/x"]);
        assert_eq!(d.added, vec!["a/y"]);
        assert!(d.removed.is_empty());
    }

    #[test]
    fn test_removed_dir_lists_every_file() {
        let base = tree(&[("b/1", "h", 1), ("b/2", "h", 2), ("keep", "k", 1)]);
        let target = tree(&[("keep", "k", 1)]);
        let d = sorted(FsDiff::compare(&base, &target));
        assert_eq!(d.removed, vec!["b/1", "b/2"]);
        assert!(d.added.is_empty());
        assert!(d.modified.is_empty());
    }

    #[test]
    fn test_added_nested_dirs_enumerated_at_every_depth() {
        let base = tree(&[]);
        let target = tree(&[("n/1", "h", 1), ("n/m/2", "h", 1), ("n/m/o/3", "h", 1)]);
        let d = sorted(FsDiff::compare(&base, &target));
        assert_eq!(d.added, vec!["n/1", "n/m/2", "n/m/o/3"]);
    }

    #[test]
    fn test_mode_only_change_is_modified() {
        let base = tree(&[("bin/tool", "h", 5)]);
        let mut target = base.clone();
        target.dirs.get_mut("bin").unwrap().files.get_mut("tool").unwrap().mode =
            MODE_FILE | 0o4755;
        let d = FsDiff::compare(&base, &target);
        assert_eq!(d.modified, vec!["bin/tool"]);
    }

    #[test]
    fn test_added_modified_order() {
        let d = FsDiff {
            added: vec!["a".into()],
            removed: vec!["r".into()],
            modified: vec!["m".into()],
        };
        assert_eq!(d.added_modified(), vec!["a", "m"]);
    }
}
