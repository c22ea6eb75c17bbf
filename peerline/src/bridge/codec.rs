//! Line codec for peer communication.
//!
//! Uses LinesCodec for framing + the protocol module for (de)serialization.
//! Works over any AsyncRead/AsyncWrite (stdio, pipes, sockets, in-memory duplex).

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{self, Message, ParseError};

/// Default upper bound for a single line (8 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Codec that frames messages by newline and serializes them as compact JSON.
///
/// Decoding yields one item per non-blank line. Lines that do not parse, or
/// that exceed the length limit, come out as `Err(ParseError)` items so the
/// stream itself stays usable; only I/O failures end it.
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn next_message(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Result<Message, ParseError>>, io::Error> {
        loop {
            let framed = if eof {
                self.inner.decode_eof(src)
            } else {
                self.inner.decode(src)
            };
            let line = match framed {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Err(ParseError::LineTooLong {
                        max: self.max_length,
                    })));
                }
                // The inner codec only reports I/O errors for lines that are
                // not UTF-8; the offending line is already consumed.
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Ok(Some(Err(ParseError::InvalidUtf8)));
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            };

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            tracing::trace!(line, "Received line");
            return Ok(Some(protocol::decode(line)));
        }
    }
}

impl Decoder for LineCodec {
    type Item = Result<Message, ParseError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_message(src, true)
    }
}

impl Encoder<Message> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item
            .to_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(line = %line, "Sending line");
        self.inner.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}
