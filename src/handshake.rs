//! Text preamble that precedes the binary frame stream
//!
//! `kubectl debug` prints its own banner lines before the agent even starts.
//! The operator reads lines until the exact sentinel and only then hands the
//! reader over to the frame decoder.

use crate::error::TakiError;
use crate::protocol::{CONTAINER_NAME_PREFIX, MAX_BANNER_LINE, SERVER_START_LINE};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Debug container name reported by kubectl, for diagnostics only
    pub container_name: Option<String>,
    /// Every non-sentinel line seen before the sentinel
    pub banner: Vec<String>,
}

/// Consume banner lines up to and including the sentinel.
///
/// Reads never go past the sentinel's newline, so whatever follows is left
/// in `rd` for the frame decoder.
pub async fn wait_for_server_start<R>(rd: &mut R) -> Result<Handshake, TakiError>
where
    R: AsyncBufRead + Unpin,
{
    let mut hs = Handshake::default();
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let n = (&mut *rd)
            .take(MAX_BANNER_LINE as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(TakiError::protocol(
                "agent output ended before the server start line",
            ));
        }
        let line = trim_line_end(&buf);
        let text = String::from_utf8_lossy(line);
        if text == SERVER_START_LINE {
            return Ok(hs);
        }
        if let Some(name) = text.strip_prefix(CONTAINER_NAME_PREFIX) {
            // kubectl ends the sentence with a period
            hs.container_name = Some(name.trim().trim_end_matches('.').to_string());
        }
        hs.banner.push(text.into_owned());
    }
}

/// Agent side: print the sentinel. Nothing but frames may follow it.
pub async fn announce<W>(wr: &mut W) -> Result<(), TakiError>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(SERVER_START_LINE.as_bytes()).await?;
    wr.write_all(b"\n").await?;
    wr.flush().await?;
    Ok(())
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    if let [rest @ .., b'\n'] = line {
        line = rest;
    }
    if let [rest @ .., b'\r'] = line {
        line = rest;
    }
    line
}
