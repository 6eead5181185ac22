//! Value framing for streamed response bodies.
//!
//! HTTP chunk boundaries do not survive the transport: hyper splits and
//! merges them as it reads. The JSON encoder writes one value per line, so
//! the client reframes JSON bodies by lines with [`JsonLinesCodec`], which
//! wraps [`LinesCodec`] with a maximum line length so a misbehaving server
//! cannot make it buffer without bound. Other encodings carry arbitrary
//! bytes; when the client asks for it, each value is sent behind a length
//! prefix and rebuilt with [`ValueFrameCodec`].

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LinesCodec, LinesCodecError};

use crate::config::DEFAULT_MAX_LINE_BYTES;
use crate::{AppError, Result};

/// Line decoder yielding one JSON value per non-empty line.
#[derive(Debug)]
pub struct JsonLinesCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
}

impl JsonLinesCodec {
    /// Codec with the default 1 MiB line limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Codec with a custom line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    fn parse(line: Option<String>) -> Result<Option<Value>> {
        match line {
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|err| AppError::Http(format!("malformed json value: {err}"))),
            None => Ok(None),
        }
    }

    fn map_error(&self, err: LinesCodecError) -> AppError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => AppError::Http(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLinesCodec {
    type Item = Value;
    type Error = AppError;

    /// Decode the next complete value from `src`, skipping blank lines.
    /// Returns `Ok(None)` while no complete line is buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(line) => return Self::parse(line),
                Err(err) => return Err(self.map_error(err)),
            }
        }
    }

    /// Decode the final value when the body ends without a trailing newline.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(line) => return Self::parse(line),
                Err(err) => return Err(self.map_error(err)),
            }
        }
    }
}

/// Largest value accepted behind a length prefix.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Length-prefixed framing of encoded values, one frame per value.
#[derive(Debug)]
pub struct ValueFrameCodec {
    frames: LengthDelimitedCodec,
}

impl ValueFrameCodec {
    /// Codec accepting values up to [`MAX_FRAME_BYTES`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }

    /// Frame one encoded value into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Encode` if the value exceeds [`MAX_FRAME_BYTES`].
    pub fn frame(&mut self, value: Bytes) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(value.len() + 4);
        self.encode(value, &mut dst)?;
        Ok(dst.freeze())
    }
}

impl Default for ValueFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Bytes> for ValueFrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.frames
            .encode(item, dst)
            .map_err(|err| AppError::Encode(format!("value frame: {err}")))
    }
}

impl Decoder for ValueFrameCodec {
    type Item = Bytes;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        self.frames
            .decode(src)
            .map(|frame| frame.map(BytesMut::freeze))
            .map_err(|err| AppError::Http(format!("malformed value frame: {err}")))
    }

    /// Fails if the body ends inside a frame.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(AppError::Http(format!(
                "body ended inside a value frame ({} bytes left)",
                src.len()
            ))),
        }
    }
}
