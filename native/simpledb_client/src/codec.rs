/// Framing primitives for the PostgreSQL v3 wire protocol
///
/// Every message after startup is `tag (1 byte) | length (u32, includes itself) | body`.
/// Startup-phase messages from the client omit the tag. This module splits an
/// incoming byte stream into frames without ever holding more than the bytes
/// received so far, and provides the checked readers/writers the message layer
/// builds on.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::constants::MAX_FRAME_LEN;

/// Errors raised while framing or decoding wire messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid frame length {0}")]
    InvalidLength(u32),
    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),
    #[error("string is missing its terminator")]
    UnterminatedString,
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("cstr must not contain a NUL byte")]
    InteriorNul,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unsupported protocol version {0:#x}")]
    UnsupportedVersion(i32),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// A complete tagged message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

/// Incremental frame splitter over a byte stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Split off the next complete tagged frame, if one is fully buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.buf[0];
        let body_len = frame_body_len(&self.buf[1..5])?;
        if self.buf.len() < 5 + body_len {
            return Ok(None);
        }
        self.buf.advance(5);
        let body = self.buf.split_to(body_len).freeze();
        Ok(Some(Frame { tag, body }))
    }

    /// Split off the next complete untagged frame (startup phase).
    pub fn next_untagged(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let body_len = frame_body_len(&self.buf[..4])?;
        if self.buf.len() < 4 + body_len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(body_len).freeze()))
    }
}

/// Decode a length prefix and return the body length it announces.
fn frame_body_len(prefix: &[u8]) -> Result<usize, CodecError> {
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len < 4 {
        // the length always counts its own four bytes
        return Err(CodecError::InvalidLength(len));
    }
    let body_len = (len - 4) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge(body_len));
    }
    Ok(body_len)
}

/// Write a length-prefixed message, optionally preceded by its tag.
///
/// The body is produced by `body`; the length is patched in afterwards.
pub fn write_message<F>(buf: &mut BytesMut, tag: Option<u8>, body: F) -> Result<(), CodecError>
where
    F: FnOnce(&mut BytesMut) -> Result<(), CodecError>,
{
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let len_pos = buf.len();
    buf.put_u32(0);
    body(buf)?;
    let len = buf.len() - len_pos;
    if len - 4 > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge(len - 4));
    }
    buf[len_pos..len_pos + 4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(())
}

pub fn write_cstr(buf: &mut BytesMut, val: &[u8]) -> Result<(), CodecError> {
    if val.contains(&0) {
        return Err(CodecError::InteriorNul);
    }
    buf.put_slice(val);
    buf.put_u8(0);
    Ok(())
}

pub fn read_cstr(buf: &mut Bytes, what: &'static str) -> Result<String, CodecError> {
    let pos = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(CodecError::UnterminatedString)?;
    let raw = buf.split_to(pos);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(what))
}

pub fn read_u8(buf: &mut Bytes, what: &'static str) -> Result<u8, CodecError> {
    ensure_remaining(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn read_i16(buf: &mut Bytes, what: &'static str) -> Result<i16, CodecError> {
    ensure_remaining(buf, 2, what)?;
    Ok(buf.get_i16())
}

pub fn read_i32(buf: &mut Bytes, what: &'static str) -> Result<i32, CodecError> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_i32())
}

pub fn read_u32(buf: &mut Bytes, what: &'static str) -> Result<u32, CodecError> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_u32())
}

/// Read an `i32` length followed by that many bytes; `-1` encodes NULL.
pub fn read_nullable_bytes(buf: &mut Bytes, what: &'static str) -> Result<Option<Bytes>, CodecError> {
    let len = read_i32(buf, what)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(CodecError::InvalidLength(len as u32));
    }
    let len = len as usize;
    ensure_remaining(buf, len, what)?;
    Ok(Some(buf.split_to(len)))
}

pub fn write_nullable_bytes(buf: &mut BytesMut, val: Option<&[u8]>) {
    match val {
        None => buf.put_i32(-1),
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
    }
}

fn ensure_remaining(buf: &Bytes, n: usize, what: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Truncated(what));
    }
    Ok(())
}
