//! Self-delimiting frame codec over async byte streams.
//!
//! Each frame is: `[b"WH"][u32 big-endian length][u16 header check][postcard packet]`.
//!
//! The magic lets a reader find the next frame boundary again after a
//! corrupted header, and the check catches a damaged length before the
//! reader waits for bytes that will never belong to one frame. A frame whose
//! header is sound but whose body fails to decode is reported once and
//! skipped; the following frame decodes normally.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Packet;

/// Frame start marker.
pub const MAGIC: [u8; 2] = *b"WH";

/// Magic, length prefix and header check.
pub const HEADER_LEN: usize = MAGIC.len() + 4 + 2;

/// Maximum allowed frame body (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Read granularity of [`FrameReader`].
const READ_CHUNK: usize = 8 * 1024;

/// Failure to turn a [`Packet`] into a frame.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// Postcard could not serialize the packet.
    #[error("packet serialization failed: {0}")]
    Serialize(#[from] postcard::Error),
    /// The serialized packet does not fit in one frame.
    #[error("frame of {0} bytes exceeds 16 MiB limit")]
    TooLarge(usize),
}

/// Failure to read the next [`Packet`] from a stream.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The underlying stream reached end of file.
    #[error("stream closed")]
    Eof,
    /// The bytes at the current position are not a frame header.
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),
    /// The length prefix does not match its header check.
    #[error("corrupted frame header (length {0})")]
    BadHeader(u32),
    /// The header announced a body larger than [`MAX_FRAME`].
    #[error("frame of {0} bytes exceeds 16 MiB limit")]
    TooLarge(u32),
    /// The frame body is not a valid packet.
    #[error("malformed frame body: {0}")]
    Malformed(#[from] postcard::Error),
}

impl DecodeError {
    /// Returns `true` if the stream itself failed, as opposed to one frame.
    ///
    /// After a non-fatal error the same [`FrameReader`] can keep reading.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Eof)
    }
}

/// Encodes `packet` as one complete frame.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let body = postcard::to_allocvec(packet)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or(EncodeError::TooLarge(body.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&header_check(len).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Check word protecting the length prefix.
///
/// Any single damaged byte in the length or in the check itself is caught.
/// The complement keeps an all-zero header from passing.
pub const fn header_check(len: u32) -> u16 {
    let [a, b, c, d] = len.to_be_bytes();
    !u16::from_be_bytes([a ^ c, b ^ d])
}

/// Streaming decoder yielding packets from a byte stream.
///
/// Bytes are consumed as they arrive, so frames split across many short
/// reads decode correctly. [`next_packet`](Self::next_packet) is cancel-safe:
/// dropping its future never loses buffered bytes.
#[derive(Debug)]
pub struct FrameReader<R> {
    /// The byte source.
    reader: R,
    /// Bytes read but not yet decoded.
    buf: Vec<u8>,
    /// Set after a header error; cleared once the next magic is found.
    resync: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Starts decoding at the current position of `reader`.
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            resync: false,
        }
    }

    /// Returns the underlying reader, discarding any buffered bytes.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Waits for and decodes the next packet.
    pub async fn next_packet(&mut self) -> Result<Packet, DecodeError> {
        loop {
            if self.resync {
                if let Some(at) = self.buf.windows(MAGIC.len()).position(|w| w == MAGIC) {
                    self.buf.drain(..at);
                    self.resync = false;
                } else {
                    // Keep a trailing first magic byte; its partner may be next.
                    let keep = usize::from(self.buf.last() == Some(&MAGIC[0]));
                    let cut = self.buf.len() - keep;
                    self.buf.drain(..cut);
                    self.fill().await?;
                }
                continue;
            }

            if self.buf.len() >= HEADER_LEN {
                let magic = [self.buf[0], self.buf[1]];
                if magic != MAGIC {
                    self.buf.drain(..1);
                    self.resync = true;
                    return Err(DecodeError::BadMagic(magic));
                }

                let len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]);
                if u16::from_be_bytes([self.buf[6], self.buf[7]]) != header_check(len) {
                    self.buf.drain(..MAGIC.len());
                    self.resync = true;
                    return Err(DecodeError::BadHeader(len));
                }
                if len > MAX_FRAME {
                    self.buf.drain(..MAGIC.len());
                    self.resync = true;
                    return Err(DecodeError::TooLarge(len));
                }

                let end = HEADER_LEN + len as usize;
                if self.buf.len() >= end {
                    let decoded = postcard::from_bytes::<Packet>(&self.buf[HEADER_LEN..end]);
                    self.buf.drain(..end);
                    return decoded.map_err(DecodeError::from);
                }
            }

            self.fill().await?;
        }
    }

    /// Appends at least one byte from the stream to the buffer.
    async fn fill(&mut self) -> Result<(), DecodeError> {
        self.buf.reserve(READ_CHUNK);
        match self.reader.read_buf(&mut self.buf).await? {
            0 => Err(DecodeError::Eof),
            _ => Ok(()),
        }
    }
}
