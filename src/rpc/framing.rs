//! Frame codec for the peer's byte stream.
//!
//! Wraps [`tokio_util::codec::AnyDelimiterCodec`] so that every message on
//! the wire is one UTF-8 JSON text terminated by the single control byte
//! [`FRAME_TERMINATOR`] (ASCII EOT, `0x04`).
//!
//! # Usage
//!
//! Use [`FrameCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound). Inbound frames are
//! yielded as raw [`Bytes`] so that UTF-8 and JSON validation happen in the
//! envelope layer, where a bad frame can be skipped without tearing down
//! the stream.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};
use tracing::debug;

use crate::{AppError, Result};

/// Byte that terminates every frame in both directions.
pub const FRAME_TERMINATOR: u8 = 0x04;

/// Default maximum inbound frame length: 16 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Delimiter codec for the bidirectional peer stream.
///
/// # Decoder
///
/// Slices the buffered input on [`FRAME_TERMINATOR`]. Partial input is kept
/// until the terminator arrives; several frames delivered in one read are
/// returned by successive `decode` calls. A frame longer than the configured
/// maximum returns [`AppError::Protocol`]`("frame too long: …")`.
///
/// # Encoder
///
/// Outbound text is written as `text` followed by [`FRAME_TERMINATOR`]. The
/// length limit applies to decoding only.
#[derive(Debug)]
pub struct FrameCodec {
    inner: AnyDelimiterCodec,
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a codec with the [`DEFAULT_MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a codec that rejects inbound frames longer than `max_frame_bytes`.
    #[must_use]
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                vec![FRAME_TERMINATOR],
                vec![FRAME_TERMINATOR],
                max_frame_bytes,
            ),
            max_frame_bytes,
        }
    }

    /// Largest inbound frame this codec accepts.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn map_error(&self, err: AnyDelimiterCodecError) -> AppError {
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => AppError::Protocol(format!(
                "frame too long: exceeded {} bytes",
                self.max_frame_bytes
            )),
            AnyDelimiterCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode(src).map_err(|e| self.map_error(e))
    }

    /// Only terminated frames count; a trailing partial frame at end of
    /// stream is dropped.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(
                        bytes = src.len(),
                        "frame codec: discarding unterminated data at end of stream"
                    );
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl<T> Encoder<T> for FrameCodec
where
    T: AsRef<str>,
{
    type Error = AppError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(|e| self.map_error(e))
    }
}
