//! Length-prefixed framing shared by the stream transports.
//!
//! Format: `[4-byte length (big-endian)][frame]`. A zero length is rejected.
//!
//! Inbound bytes accumulate in a buffer owned by the stream and a frame is
//! only taken out once it is complete, so a `receive` dropped mid-frame
//! (for example by a caller's timeout) loses nothing.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use rsm_core::config::TuningOptions;
use rsm_core::{Result, RsmError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::connector::{map_io, ByteStream, CloseSignal};

const LENGTH_PREFIX: usize = 4;

struct ReadState<R> {
    io: R,
    buf: BytesMut,
    /// Body bytes of a rejected oversized frame still to be skipped
    discard: usize,
}

pub struct FramedStream<R, W> {
    reader: Mutex<ReadState<R>>,
    writer: Mutex<BufWriter<W>>,
    peer: String,
    buffer_size: usize,
    max_frame_size: usize,
    closed: CloseSignal,
}

impl<R, W> FramedStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, peer: impl Into<String>, tuning: &TuningOptions) -> Self {
        Self {
            reader: Mutex::new(ReadState {
                io: reader,
                buf: BytesMut::with_capacity(tuning.buffer_size),
                discard: 0,
            }),
            writer: Mutex::new(BufWriter::with_capacity(tuning.buffer_size, writer)),
            peer: peer.into(),
            buffer_size: tuning.buffer_size,
            max_frame_size: tuning.max_frame_size,
            closed: CloseSignal::new(),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .map_err(map_io)?;
        writer.write_all(frame).await.map_err(map_io)?;
        writer.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Cancel-safe: only `read_buf` suspends, and it appends to the shared
    /// buffer atomically
    async fn read_frame(&self) -> Result<Bytes> {
        let mut guard = self.reader.lock().await;
        let state = &mut *guard;
        loop {
            if let Some(frame) = split_frame(&mut state.buf, &mut state.discard, self.max_frame_size)? {
                return Ok(frame);
            }
            if state.buf.capacity() == state.buf.len() {
                state.buf.reserve(self.buffer_size.max(LENGTH_PREFIX));
            }
            let n = state.io.read_buf(&mut state.buf).await.map_err(map_io)?;
            if n == 0 {
                return Err(RsmError::ConnectionClosed);
            }
        }
    }
}

/// Take the next complete frame out of `buf`, if there is one
fn split_frame(buf: &mut BytesMut, discard: &mut usize, max_frame_size: usize) -> Result<Option<Bytes>> {
    if *discard > 0 {
        let skipped = (*discard).min(buf.len());
        buf.advance(skipped);
        *discard -= skipped;
        if *discard > 0 {
            return Ok(None);
        }
    }
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        buf.advance(LENGTH_PREFIX);
        return Err(RsmError::malformed("zero-length frame"));
    }
    if len > max_frame_size {
        // The body is skipped on later reads so the stream stays aligned
        buf.advance(LENGTH_PREFIX);
        *discard = len;
        return Err(RsmError::ResourceExhausted(format!(
            "inbound frame of {} bytes exceeds limit {}",
            len, max_frame_size
        )));
    }
    if buf.len() < LENGTH_PREFIX + len {
        buf.reserve(LENGTH_PREFIX + len - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}

#[async_trait]
impl<R, W> ByteStream for FramedStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_closed() {
            return Err(RsmError::ConnectionClosed);
        }
        if frame.len() > self.max_frame_size {
            return Err(RsmError::ResourceExhausted(format!(
                "frame of {} bytes exceeds limit {}",
                frame.len(),
                self.max_frame_size
            )));
        }

        tokio::select! {
            res = self.write_frame(&frame) => res?,
            _ = self.closed.closed() => return Err(RsmError::ConnectionClosed),
        }

        tracing::trace!(bytes = frame.len(), peer = %self.peer, "Frame sent");
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes> {
        if self.closed.is_closed() {
            return Err(RsmError::ConnectionClosed);
        }

        let frame = tokio::select! {
            res = self.read_frame() => res?,
            _ = self.closed.closed() => return Err(RsmError::ConnectionClosed),
        };

        tracing::trace!(bytes = frame.len(), peer = %self.peer, "Frame received");
        Ok(frame)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.close() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "Shutdown after close failed");
        }
        tracing::debug!(peer = %self.peer, "Stream closed");
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
