//! Operator configuration, read from TOML
//!
//! Lookup order: `--config <file>`, then `$HOME/.config/taki/taki.toml`, then
//! built-in defaults. Command-line flags override whatever was loaded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakiConfig {
    /// kubectl command; may carry extra words such as `--context prod`
    pub kubectl: String,
    pub namespace: Option<String>,
    pub agent_image: String,
    /// Agent binary inside the debug image
    pub agent_path: String,
    /// Archive path on the agent side
    pub remote_output: String,
    /// Root-relative paths left out of the live tree
    pub exclude: Vec<String>,
    pub poll_interval_ms: u64,
    pub read_chunk_kb: usize,
}

impl Default for TakiConfig {
    fn default() -> Self {
        TakiConfig {
            kubectl: "kubectl".to_string(),
            namespace: None,
            agent_image: "taki-agent:latest".to_string(),
            agent_path: "/taki-agent".to_string(),
            remote_output: "/root/root.tar.xz".to_string(),
            exclude: vec!["proc".into(), "sys".into(), "dev".into()],
            poll_interval_ms: 250,
            read_chunk_kb: 256,
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Taki");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("taki");
    }
    PathBuf::from(".taki")
}

pub fn config_path() -> PathBuf {
    config_dir().join("taki.toml")
}

impl TakiConfig {
    /// Load `path` if given (it must exist), else the default location if
    /// present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let p = config_path();
                if p.is_file() {
                    Self::from_file(&p)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// `kubectl [-n ns] debug -i <pod> --image=<img> --target=<container> -- <agent> [args]`
    ///
    /// `-i` without `-t`: a TTY would rewrite the binary frame stream.
    pub fn debug_argv(&self, pod: &str, container: &str, agent_args: &[String]) -> Vec<String> {
        let mut argv: Vec<String> = self.kubectl.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            argv.push("kubectl".to_string());
        }
        if let Some(ns) = &self.namespace {
            argv.push("-n".to_string());
            argv.push(ns.clone());
        }
        argv.extend([
            "debug".to_string(),
            "-i".to_string(),
            pod.to_string(),
            format!("--image={}", self.agent_image),
            format!("--target={container}"),
            "--".to_string(),
            self.agent_path.clone(),
        ]);
        argv.extend(agent_args.iter().cloned());
        argv
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn read_chunk(&self) -> usize {
        self.read_chunk_kb.max(1) * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("taki.toml");
        std::fs::write(&p, "namespace = \"prod\"\nexclude = [\"proc\"]\n").unwrap();
        let cfg = TakiConfig::load(Some(&p)).unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("prod"));
        assert_eq!(cfg.exclude, vec!["proc"]);
        assert_eq!(cfg.agent_image, "taki-agent:latest");
        assert_eq!(cfg.read_chunk(), 256 * 1024);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(TakiConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("taki.toml");
        std::fs::write(&p, "poll_interval_ms = \"soon\"").unwrap();
        let err = TakiConfig::load(Some(&p)).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
    }

    #[test]
    fn test_debug_argv() {
        let cfg = TakiConfig {
            kubectl: "kubectl --context lab".into(),
            namespace: Some("web".into()),
            ..Default::default()
        };
        let argv = cfg.debug_argv("api-7f9c", "app", &["--log-file".into(), "/tmp/a.log".into()]);
        assert_eq!(
            argv,
            vec![
                "kubectl",
                "--context",
                "lab",
                "-n",
                "web",
                "debug",
                "-i",
                "api-7f9c",
                "--image=taki-agent:latest",
                "--target=app",
                "--",
                "/taki-agent",
                "--log-file",
                "/tmp/a.log",
            ]
        );
    }
}
