//! One-directional byte relay

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Why a relay loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The source reached end of stream
    Eof,
    /// The liveness predicate failed or the stream was cancelled
    Closed,
    /// The per-chunk observer asked to stop
    Stopped,
}

/// Copies bytes from a reader to a writer through an owned buffer.
///
/// Cancelling the token aborts a pending read or write so a blocked relay
/// direction unwinds as soon as its session closes.
pub struct ByteRelayStream<R, W> {
    reader: R,
    writer: W,
    buffer: Box<[u8]>,
    cancel: CancellationToken,
}

impl<R, W> ByteRelayStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `capacity` of zero is raised to one byte
    pub fn new(reader: R, writer: W, capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            reader,
            writer,
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            cancel,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Relay until EOF, closure, cancellation or an observer stop.
    ///
    /// `is_open` is checked before every read and again before the matching
    /// write. Every chunk is flushed before `on_chunk` sees its length. I/O
    /// failures are returned, never swallowed.
    pub async fn direct_data<P, F>(&mut self, mut is_open: P, mut on_chunk: F) -> Result<RelayOutcome, RelayError>
    where
        P: FnMut() -> bool,
        F: FnMut(usize) -> bool,
    {
        while is_open() {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(RelayOutcome::Closed),
                read = self.reader.read(&mut self.buffer) => read?,
            };

            // A zero-length read into a non-empty buffer is end of stream.
            if read == 0 {
                return Ok(RelayOutcome::Eof);
            }

            if !is_open() {
                return Ok(RelayOutcome::Closed);
            }

            let chunk = &self.buffer[..read];
            let writer = &mut self.writer;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(RelayOutcome::Closed),
                written = async {
                    writer.write_all(chunk).await?;
                    writer.flush().await
                } => written?,
            }

            if !on_chunk(read) {
                return Ok(RelayOutcome::Stopped);
            }
        }

        Ok(RelayOutcome::Closed)
    }

    /// Give back the reader and writer, releasing the buffer
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}
