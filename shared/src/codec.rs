//! Marker-delimited codec for tracker TCP framing
//!
//! All frames are laid out as:
//! ```text
//! [ 78 78 ][ len ][ proto ][ payload .. ][ serial u16 ][ checksum u16 ][ 0D 0A ]
//! ```
//!
//! `len` counts protocol, payload, serial and checksum, so a whole frame is
//! `len + 5` bytes. The checksum is the byte-sum of `len..=serial` truncated
//! to 16 bits, big-endian on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Start-of-frame marker
pub const START_MARKER: [u8; 2] = [0x78, 0x78];

/// End-of-frame marker
pub const STOP_MARKER: [u8; 2] = [0x0D, 0x0A];

/// Bytes not counted by the length byte (start marker, length byte, stop marker)
pub const FRAME_OVERHEAD: usize = 5;

/// Smallest well-formed frame: empty payload
pub const MIN_FRAME_LEN: usize = 10;

/// Largest payload that still fits a one-byte length field
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 5;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes (min: {MIN_FRAME_LEN})")]
    TooShort(usize),

    #[error("Bad start marker: {0:02x?}")]
    BadStartMarker([u8; 2]),

    #[error("Length mismatch: length byte implies {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Checksum mismatch: received {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { received: u16, computed: u16 },

    #[error("Bad stop marker: {0:02x?}")]
    BadStopMarker([u8; 2]),

    #[error("Payload too large: {0} bytes (max: {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),
}

/// One decoded frame, markers and checksum stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u8,
    pub serial: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(protocol: u8, serial: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol,
            serial,
            payload: payload.into(),
        }
    }

    /// Re-encode this frame to its wire form
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        encode(self.protocol, self.serial, &self.payload)
    }
}

/// Plain 16-bit byte-sum (not a CRC)
pub fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |acc, byte| acc.wrapping_add(u16::from(*byte)))
}

/// Encode a frame into a freshly allocated buffer
pub fn encode(protocol: u8, serial: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    encode_into(protocol, serial, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame directly into a provided buffer
pub fn encode_into(
    protocol: u8,
    serial: u16,
    payload: &[u8],
    buf: &mut BytesMut,
) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let length = payload.len() + 5;
    buf.reserve(length + FRAME_OVERHEAD);

    buf.put_slice(&START_MARKER);
    let body_start = buf.len();
    buf.put_u8(length as u8);
    buf.put_u8(protocol);
    buf.put_slice(payload);
    buf.put_u16(serial);

    let sum = checksum(&buf[body_start..]);
    buf.put_u16(sum);
    buf.put_slice(&STOP_MARKER);

    Ok(())
}

/// Build an acknowledgment frame: echoed protocol and serial, one-byte response code
pub fn ack(protocol: u8, serial: u16, code: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + 1);
    // A one-byte payload can never exceed the length field
    let _ = encode_into(protocol, serial, &[code], &mut buf);
    buf.freeze()
}

/// Decode exactly one frame from `buf`
///
/// The slice must hold the whole frame and nothing else.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    let len = buf.len();
    if len < MIN_FRAME_LEN {
        return Err(FrameError::TooShort(len));
    }

    if buf[..2] != START_MARKER {
        return Err(FrameError::BadStartMarker([buf[0], buf[1]]));
    }

    let expected = buf[2] as usize + FRAME_OVERHEAD;
    if len != expected {
        return Err(FrameError::LengthMismatch {
            expected,
            actual: len,
        });
    }

    let received = u16::from_be_bytes([buf[len - 4], buf[len - 3]]);
    let computed = checksum(&buf[2..len - 4]);
    if received != computed {
        return Err(FrameError::ChecksumMismatch { received, computed });
    }

    if buf[len - 2..] != STOP_MARKER {
        return Err(FrameError::BadStopMarker([buf[len - 2], buf[len - 1]]));
    }

    Ok(Frame {
        protocol: buf[3],
        serial: u16::from_be_bytes([buf[len - 6], buf[len - 5]]),
        payload: Bytes::copy_from_slice(&buf[4..len - 6]),
    })
}

/// Position of the first start marker in `buf`, if any
fn find_start(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == START_MARKER)
}

/// Streaming decoder that reassembles frames from an arbitrary chunked byte stream
///
/// Frames may span chunks and one chunk may carry several frames. Noise before
/// a start marker is dropped; a candidate that fails validation is skipped and
/// scanning resumes at the next marker.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    discarded: u64,
    rejected: u64,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            discarded: 0,
            rejected: 0,
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// - `Ok(Some(frame))` a complete frame was consumed
    /// - `Ok(None)` more data is needed
    /// - `Err(..)` a candidate was rejected and dropped; the decoder has
    ///   already resynchronised, so keep calling until `Ok(None)`
    pub fn decode_next(&mut self) -> Result<Option<Frame>, FrameError> {
        match find_start(&self.buffer) {
            Some(pos) => self.discard(pos),
            None => {
                // A trailing 0x78 may be the first half of a marker
                let keep = usize::from(self.buffer.last() == Some(&START_MARKER[0]));
                self.discard(self.buffer.len() - keep);
                return Ok(None);
            }
        }

        if self.buffer.len() < 3 {
            return Ok(None);
        }

        let total = self.buffer[2] as usize + FRAME_OVERHEAD;
        if total < MIN_FRAME_LEN {
            self.reject();
            return Err(FrameError::TooShort(total));
        }

        if self.buffer.len() < total {
            return Ok(None);
        }

        match decode(&self.buffer[..total]) {
            Ok(frame) => {
                self.buffer.advance(total);
                Ok(Some(frame))
            }
            Err(e) => {
                self.reject();
                Err(e)
            }
        }
    }

    /// Drop the first byte of the current candidate so the next scan moves past it
    fn reject(&mut self) {
        self.rejected += 1;
        self.discard(1);
    }

    fn discard(&mut self, n: usize) {
        if n > 0 {
            self.buffer.advance(n);
            self.discarded += n as u64;
        }
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes dropped while resynchronising
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Number of start-marker candidates that failed validation
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }
}
