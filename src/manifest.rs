//! JSON sidecar written next to every fetched archive
//!
//! The archive only holds added and modified files; the manifest records the
//! rest of what the comparison found (removed files, unreadable paths) plus
//! enough context to tie the archive back to its target.

use crate::error::TakiError;
use crate::fsdiff::FsDiff;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiffManifest {
    pub timestamp: String,
    pub session: String,
    pub target: String,
    pub root: String,
    pub container_name: Option<String>,
    pub base_image: PathBuf,
    pub archive: PathBuf,
    pub archive_bytes: u64,
    pub diff: FsDiff,
    pub path_errors: BTreeMap<String, String>,
    /// Diff files that could not be read when the archive was made
    #[serde(default)]
    pub archive_skipped: Vec<String>,
}

impl DiffManifest {
    /// `<archive>.diff.json`
    pub fn path_for(archive: &Path) -> PathBuf {
        let mut name = archive.as_os_str().to_owned();
        name.push(".diff.json");
        PathBuf::from(name)
    }

    pub fn write(&self, path: &Path) -> Result<(), TakiError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(io::Error::from)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, TakiError> {
        let file = File::open(path)?;
        let manifest: DiffManifest =
            serde_json::from_reader(BufReader::new(file)).map_err(io::Error::from)?;
        Ok(manifest)
    }
}
