//! Spawning the agent and exposing its stdio as one duplex stream
//!
//! `kubectl debug` interleaves its own banner (on stderr) with the agent's
//! stdout, so the operator reads both through a single merged reader.

use crate::error::TakiError;
use futures::stream;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::io::{ReaderStream, StreamReader};

pub struct AgentIo {
    /// Agent output: banner text, then frames
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Agent input
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// The spawned process, when there is one to kill
    pub child: Option<Child>,
}

pub trait AgentSpawner: Send + Sync {
    fn spawn(&self, argv: &[String]) -> Result<AgentIo, TakiError>;
}

/// Runs `argv` as a local process, merging stdout and stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl AgentSpawner for CommandSpawner {
    fn spawn(&self, argv: &[String]) -> Result<AgentIo, TakiError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TakiError::protocol("empty agent command"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let missing = || TakiError::protocol("agent stdio not captured");
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;
        let stdin = child.stdin.take().ok_or_else(missing)?;

        let merged = stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));
        Ok(AgentIo {
            reader: Box::new(StreamReader::new(merged)),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}
