//! Notification Wire Protocol
//!
//! Length-prefixed, checksummed frames over a plain TCP stream.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on a single frame body; larger frames are treated as a
/// protocol violation rather than an allocation request.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Frames exchanged on a notification connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    // ========== Handshake ==========
    /// Shared-secret authentication; must be the first frame
    Auth { secret: String },

    /// Authentication accepted
    AuthOk,

    /// Authentication rejected; the server closes the connection
    AuthErr,

    // ========== Request/Response ==========
    /// Fetch the current value for a config key
    Echo { name: String, tags: Vec<String> },

    /// Echo response; `None` when no entry exists for the key
    EchoReply { payload: Option<Vec<u8>> },

    // ========== Pub/Sub ==========
    /// Register this connection for a topic
    Subscribe { topic: String },

    /// Subscription accepted
    SubAck,

    /// A value was published on a subscribed topic
    Publish { topic: String, payload: Vec<u8> },

    // ========== Liveness ==========
    /// Client keep-alive
    Heartbeat,

    /// Keep-alive response
    HeartbeatAck,
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Get the frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "Auth",
            Frame::AuthOk => "AuthOk",
            Frame::AuthErr => "AuthErr",
            Frame::Echo { .. } => "Echo",
            Frame::EchoReply { .. } => "EchoReply",
            Frame::Subscribe { .. } => "Subscribe",
            Frame::SubAck => "SubAck",
            Frame::Publish { .. } => "Publish",
            Frame::Heartbeat => "Heartbeat",
            Frame::HeartbeatAck => "HeartbeatAck",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(body: &[u8]) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_LEN {
        return Err(Error::Frame(format!("frame too large: {} bytes", header.length)));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Frame("frame checksum mismatch".into()));
    }

    Frame::deserialize(&body)
}

/// Write a framed message to a writer
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = frame.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
