//! Framed transport over a duplex byte stream.
//!
//! [`split`] turns any `AsyncRead + AsyncWrite` stream into a
//! [`FrameWriter`] and a [`FrameReader`]:
//!
//! - The writer is shared. Every [`FrameWriter::send`] holds one async
//!   mutex for the whole encode-and-flush of a frame, so frames written by
//!   concurrent callers and handlers never interleave on the wire.
//! - The reader is owned. It is handed to the receiver loop by value, which
//!   makes the inbound frame sequence single-consumer and not restartable.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::rpc::framing::FrameCodec;
use crate::{AppError, Result};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split `stream` into its framed write and read halves.
pub fn split<S>(stream: S, max_frame_bytes: usize) -> (FrameWriter, FrameReader)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader: BoxedReader = Box::new(read_half);
    let writer: BoxedWriter = Box::new(write_half);

    (
        FrameWriter {
            sink: Mutex::new(Some(FramedWrite::new(writer, FrameCodec::new()))),
        },
        FrameReader {
            frames: FramedRead::new(reader, FrameCodec::with_max_frame_bytes(max_frame_bytes)),
        },
    )
}

/// Write half of the transport; safe to share between tasks.
pub struct FrameWriter {
    /// `None` once the writer has been shut down.
    sink: Mutex<Option<FramedWrite<BoxedWriter, FrameCodec>>>,
}

impl FrameWriter {
    /// Write `text` as one terminated frame and flush it.
    ///
    /// # Errors
    ///
    /// - [`AppError::Disconnected`] if the writer was shut down.
    /// - [`AppError::Io`] if the underlying write fails.
    pub async fn send(&self, text: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(AppError::Disconnected("transport writer is closed".into()));
        };
        sink.send(text).await
    }

    /// Flush and shut down the write half. Idempotent.
    pub async fn shutdown(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(err) = SinkExt::<String>::close(&mut sink).await {
                debug!(%err, "transport: error while closing writer");
            }
        }
    }

    /// Whether [`FrameWriter::shutdown`] has run.
    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}

/// Read half of the transport: a lazy sequence of complete frames.
///
/// The sequence ends when the peer closes the stream or a read fails.
pub struct FrameReader {
    frames: FramedRead<BoxedReader, FrameCodec>,
}

impl FrameReader {
    /// Next complete frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        self.frames.next().await
    }
}
