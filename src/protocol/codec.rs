//! Framed reader/writer for the control channel.
//!
//! Every frame is a `u32` big-endian length prefix followed by the bincode
//! encoding of a [`Frame`]. The reader enforces a size cap so a corrupt
//! length prefix cannot make it allocate without bound.

use super::types::Frame;
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are treated as protocol corruption.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame, blocking the calling task until one arrives.
    /// An error here means the connection is unusable.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_FRAME_BYTES {
            anyhow::bail!("frame of {} bytes exceeds cap", len);
        }

        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;

        Ok(bincode::deserialize(&buf)?)
    }

    /// Gives the underlying transport back, e.g. to rejoin the halves of a
    /// stream after the handshake phase.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let body = bincode::serialize(frame)?;

        if body.len() > MAX_FRAME_BYTES {
            anyhow::bail!("refusing to send frame of {} bytes", body.len());
        }

        self.inner.write_all(&(body.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;

        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
