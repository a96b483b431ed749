//! The AMQP 0-9-1 frame envelope: `type(1) | channel(2) | length(4) | payload[length] | 0xCE`.
//!
//! Grounded on `libamqpprox/amqpprox_frame.cpp`: fixed 7-byte header, a
//! trailing sentinel octet, and a hard cap on frame size shared with the
//! buffer pool's largest size class.

use bytes::{BufMut, Bytes, BytesMut};

/// Default maximum permitted frame size, matching `Frame::maxFrameSize` in
/// the original implementation. Frames whose `length + 8` exceeds this are
/// rejected on decode and refused on encode.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 150_000;

/// Bytes of framing overhead around every payload: 1 (type) + 2 (channel) +
/// 4 (length) + 1 (frame-end sentinel).
pub const FRAME_OVERHEAD: usize = 8;

const FRAME_HEADER_SIZE: usize = 7;
const FRAME_END: u8 = 0xCE;

pub const FRAME_TYPE_METHOD: u8 = 1;
pub const FRAME_TYPE_HEADER: u8 = 2;
pub const FRAME_TYPE_BODY: u8 = 3;
pub const FRAME_TYPE_HEARTBEAT: u8 = 8;

/// A decoded AMQP frame. `payload` borrows from the buffer it was decoded
/// from; callers that need to retain it past the buffer's lifetime should
/// copy it out (e.g. into a [`bytes::Bytes`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub frame_type: u8,
    pub channel: u16,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FRAME_TYPE_HEARTBEAT && self.channel == 0 && self.payload.is_empty()
    }
}

/// Outcome of attempting to decode a frame from the front of a buffer.
#[derive(Debug)]
pub enum DecodeOutcome<'a> {
    /// A full frame was decoded. `consumed` is the number of bytes (header +
    /// payload + sentinel) that made up the frame.
    Frame { frame: Frame<'a>, consumed: usize },
    /// Not enough bytes are buffered yet to know whether there is a full
    /// frame; the caller should read more and retry once more data arrives.
    NeedMoreData,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame length {length} exceeds maximum frame size {max}")]
    TooLarge { length: u32, max: usize },
    #[error("missing frame-end sentinel (0xCE), got {0:#04x}")]
    BadSentinel(u8),
}

/// Attempt to decode one frame from the front of `buf`.
///
/// Mirrors `Frame::decode`: requires at least [`FRAME_OVERHEAD`] bytes to
/// even read the header, then requires `7 + length + 1` bytes total before
/// declaring success. A sentinel mismatch is a session-fatal decode error,
/// not a "need more data" condition, matching the original's `throw` on a
/// bad trailing byte.
pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<DecodeOutcome<'_>, DecodeError> {
    if buf.len() < FRAME_OVERHEAD {
        return Ok(DecodeOutcome::NeedMoreData);
    }

    let frame_type = buf[0];
    let channel = u16::from_be_bytes([buf[1], buf[2]]);
    let length = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);

    if (length as usize) + FRAME_OVERHEAD > max_frame_size {
        return Err(DecodeError::TooLarge {
            length,
            max: max_frame_size,
        });
    }

    let total_len = FRAME_HEADER_SIZE + length as usize + 1;
    if buf.len() < total_len {
        return Ok(DecodeOutcome::NeedMoreData);
    }

    let sentinel = buf[FRAME_HEADER_SIZE + length as usize];
    if sentinel != FRAME_END {
        return Err(DecodeError::BadSentinel(sentinel));
    }

    let payload = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length as usize];
    Ok(DecodeOutcome::Frame {
        frame: Frame {
            frame_type,
            channel,
            payload,
        },
        consumed: total_len,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("frame length {length} exceeds maximum frame size {max}")]
    TooLarge { length: usize, max: usize },
}

/// Encode a frame, appending it to `out`.
pub fn encode(
    frame_type: u8,
    channel: u16,
    payload: &[u8],
    max_frame_size: usize,
    out: &mut BytesMut,
) -> Result<(), EncodeError> {
    if payload.len() + FRAME_OVERHEAD > max_frame_size {
        return Err(EncodeError::TooLarge {
            length: payload.len(),
            max: max_frame_size,
        });
    }
    out.reserve(payload.len() + FRAME_OVERHEAD);
    out.put_u8(frame_type);
    out.put_u16(channel);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.put_u8(FRAME_END);
    Ok(())
}

/// Convenience wrapper returning a freshly allocated [`Bytes`].
pub fn encode_to_bytes(
    frame_type: u8,
    channel: u16,
    payload: &[u8],
    max_frame_size: usize,
) -> Result<Bytes, EncodeError> {
    let mut out = BytesMut::new();
    encode(frame_type, channel, payload, max_frame_size, &mut out)?;
    Ok(out.freeze())
}
