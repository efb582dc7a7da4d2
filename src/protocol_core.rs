//! Frame codec for the binary phase of the agent channel
//!
//! Every frame is a fixed header followed by the method name and a bincode
//! payload:
//!
//! ```text
//! MAGIC (4) | VERSION (2) | KIND (1) | CALL ID (8) | METHOD LEN (2) | PAYLOAD LEN (4)
//! ```
//!
//! All integers are little endian. Responses carry an empty method name.

use crate::error::TakiError;
use crate::protocol::{MAGIC, MAX_FRAME_SIZE, MAX_METHOD_LEN, VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub id: u64,
    pub method_len: u16,
    pub payload_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub id: u64,
    pub method: String,
    pub payload: Vec<u8>,
}

/// Validate frame payload size using protocol::MAX_FRAME_SIZE directly
pub fn validate_frame_size(size: usize) -> Result<(), TakiError> {
    if size > MAX_FRAME_SIZE {
        return Err(TakiError::protocol(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

pub fn build_frame_header(h: &FrameHeader) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = h.kind;
    header[7..15].copy_from_slice(&h.id.to_le_bytes());
    header[15..17].copy_from_slice(&h.method_len.to_le_bytes());
    header[17..21].copy_from_slice(&h.payload_len.to_le_bytes());
    header
}

pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<FrameHeader, TakiError> {
    if &header[0..4] != MAGIC {
        return Err(TakiError::protocol("invalid magic in frame header"));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(TakiError::protocol(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&header[7..15]);
    let h = FrameHeader {
        kind: header[6],
        id: u64::from_le_bytes(id),
        method_len: u16::from_le_bytes([header[15], header[16]]),
        payload_len: u32::from_le_bytes([header[17], header[18], header[19], header[20]]),
    };
    if h.method_len as usize > MAX_METHOD_LEN {
        return Err(TakiError::protocol(format!(
            "method name too long: {} bytes",
            h.method_len
        )));
    }
    validate_frame_size(h.payload_len as usize)?;
    Ok(h)
}

pub async fn write_frame<W>(wr: &mut W, frame: &Frame) -> Result<(), TakiError>
where
    W: AsyncWrite + Unpin,
{
    if frame.method.len() > MAX_METHOD_LEN {
        return Err(TakiError::protocol(format!(
            "method name too long: {}",
            frame.method
        )));
    }
    validate_frame_size(frame.payload.len())?;
    let header = build_frame_header(&FrameHeader {
        kind: frame.kind,
        id: frame.id,
        method_len: frame.method.len() as u16,
        payload_len: frame.payload.len() as u32,
    });
    wr.write_all(&header).await?;
    wr.write_all(frame.method.as_bytes()).await?;
    wr.write_all(&frame.payload).await?;
    wr.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream ended cleanly between frames.
pub async fn read_frame<R>(rd: &mut R) -> Result<Option<Frame>, TakiError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = rd.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TakiError::protocol("stream ended inside a frame header"));
        }
        filled += n;
    }
    let h = parse_frame_header(&header)?;

    let mut method = vec![0u8; h.method_len as usize];
    rd.read_exact(&mut method).await?;
    let method = String::from_utf8(method)
        .map_err(|_| TakiError::protocol("method name is not UTF-8"))?;
    let mut payload = vec![0u8; h.payload_len as usize];
    rd.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        kind: h.kind,
        id: h.id,
        method,
        payload,
    }))
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, TakiError> {
    bincode::serialize(value).map_err(|e| TakiError::protocol(format!("encode: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TakiError> {
    bincode::deserialize(bytes).map_err(|e| TakiError::protocol(format!("decode: {e}")))
}
