//! Clap definitions for the `taki` and `taki-agent` binaries

use crate::config::TakiConfig;
use anyhow::{bail, Result};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::{Path, PathBuf};

/// Differential forensic imaging of running Kubernetes containers
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct TakiOpts {
    /// Targets as <pod>/<container>
    #[arg(required = true, value_name = "POD/CONTAINER")]
    pub targets: Vec<String>,

    /// Tar file of the image the targets were started from
    #[arg(short = 'b', long)]
    pub base_image: PathBuf,

    /// Directory for fetched archives and their manifests
    #[arg(short = 'o', long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Config file (default: ~/.config/taki/taki.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// kubectl command, e.g. "kubectl --context prod"
    #[arg(long)]
    pub kubectl: Option<String>,

    /// Image carrying the agent binary
    #[arg(long)]
    pub agent_image: Option<String>,

    /// Agent binary path inside the agent image
    #[arg(long)]
    pub agent_path: Option<String>,

    /// Archive path on the agent side
    #[arg(long)]
    pub remote_output: Option<String>,

    /// Root-relative path to leave out of the live tree (repeatable;
    /// replaces the configured list)
    #[arg(long = "exclude", action = ArgAction::Append)]
    pub exclude: Vec<String>,

    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    #[arg(long)]
    pub read_chunk_kb: Option<usize>,

    /// Extra argument passed through to the agent (repeatable)
    #[arg(long = "agent-arg", action = ArgAction::Append, allow_hyphen_values = true)]
    pub agent_args: Vec<String>,

    /// Append timestamped events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Do not draw progress bars
    #[arg(long)]
    pub no_progress: bool,
}

impl TakiOpts {
    /// Overlay flags that were given on top of the loaded config.
    pub fn apply(&self, cfg: &mut TakiConfig) {
        if let Some(v) = &self.namespace {
            cfg.namespace = Some(v.clone());
        }
        if let Some(v) = &self.kubectl {
            cfg.kubectl = v.clone();
        }
        if let Some(v) = &self.agent_image {
            cfg.agent_image = v.clone();
        }
        if let Some(v) = &self.agent_path {
            cfg.agent_path = v.clone();
        }
        if let Some(v) = &self.remote_output {
            cfg.remote_output = v.clone();
        }
        if !self.exclude.is_empty() {
            cfg.exclude = self.exclude.clone();
        }
        if let Some(v) = self.poll_interval_ms {
            cfg.poll_interval_ms = v;
        }
        if let Some(v) = self.read_chunk_kb {
            cfg.read_chunk_kb = v;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ArchiverKind {
    /// External `tar` with xz compression
    Tar,
    /// In-process writer, uncompressed
    Builtin,
}

/// In-container agent; speaks the taki protocol on stdin/stdout
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct AgentOpts {
    /// Append timestamped events to this file (stdout carries the protocol)
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ArchiverKind::Tar)]
    pub archiver: ArchiverKind,

    /// tar program for the `tar` archiver
    #[arg(long, default_value = "tar")]
    pub tar_program: String,

    /// Skip xz compression with the `tar` archiver
    #[arg(long)]
    pub no_compress: bool,

    /// procfs mount used to find target roots
    #[arg(long, default_value = "/proc")]
    pub proc_dir: PathBuf,
}

/// Split `<pod>/<container>`.
pub fn parse_target(s: &str) -> Result<(String, String)> {
    match s.split_once('/') {
        Some((pod, container))
            if !pod.is_empty() && !container.is_empty() && !container.contains('/') =>
        {
            Ok((pod.to_string(), container.to_string()))
        }
        _ => bail!("target must look like <pod>/<container>, got {s:?}"),
    }
}

/// Local archive path: `<dir>/<pod>_<container>.<ext>`, where `<ext>` follows
/// the remote archive name (`tar.xz` by default).
pub fn local_archive_path(dir: &Path, pod: &str, container: &str, remote_output: &str) -> PathBuf {
    let remote_name = remote_output.rsplit('/').next().unwrap_or(remote_output);
    let ext = match remote_name.split_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext,
        _ => "tar",
    };
    dir.join(format!("{pod}_{container}.{ext}"))
}
