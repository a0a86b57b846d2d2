//! Frame codec.
//!
//! Frame format: `[size:2][type:1][reserved:1][id:4][reserved:8][payload:N]`
//!
//! - **size**: payload length in bytes, excluding the header (big-endian u16)
//! - **type**: message type code, see [`FrameType`]
//! - **id**: message id shared by every frame of one call (big-endian u32)
//! - **payload**: message body, interpreted by the message layer
//!
//! The codec does not look inside the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size: 2 (size) + 1 (type) + 1 + 4 (id) + 8 = 16 bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest frame on the wire, header included.
pub const MAX_FRAME_SIZE: usize = 65536;

/// Maximum payload size of a single frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Frame codec error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Payload exceeds the per-frame limit.
    #[error("frame payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge {
        /// Payload size in bytes.
        size: usize,
    },

    /// The type byte is not a known message type.
    #[error("unknown frame type {code:#04x}")]
    UnknownType {
        /// The type byte read from the header.
        code: u8,
    },
}

/// Message type carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connection handshake request.
    InitRequest = 0x01,
    /// Connection handshake response.
    InitResponse = 0x02,
    /// First frame of an outbound call.
    CallRequest = 0x03,
    /// First frame of a call response.
    CallResponse = 0x04,
    /// Further fragments of a call request.
    CallRequestContinue = 0x13,
    /// Further fragments of a call response.
    CallResponseContinue = 0x14,
    /// Caller abandoned the call.
    Cancel = 0xc0,
    /// Speculative-execution claim.
    Claim = 0xc1,
    /// Liveness probe.
    PingRequest = 0xd0,
    /// Liveness probe answer.
    PingResponse = 0xd1,
    /// Failure of a call or of the whole connection.
    Error = 0xff,
}

impl FrameType {
    /// Decode a type byte. Unknown codes yield `None`.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FrameType::InitRequest),
            0x02 => Some(FrameType::InitResponse),
            0x03 => Some(FrameType::CallRequest),
            0x04 => Some(FrameType::CallResponse),
            0x13 => Some(FrameType::CallRequestContinue),
            0x14 => Some(FrameType::CallResponseContinue),
            0xc0 => Some(FrameType::Cancel),
            0xc1 => Some(FrameType::Claim),
            0xd0 => Some(FrameType::PingRequest),
            0xd1 => Some(FrameType::PingResponse),
            0xff => Some(FrameType::Error),
            _ => None,
        }
    }

    /// The one-byte wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The continuation type following a first call frame of this type.
    pub const fn continuation(self) -> Option<Self> {
        match self {
            FrameType::CallRequest => Some(FrameType::CallRequestContinue),
            FrameType::CallResponse => Some(FrameType::CallResponseContinue),
            _ => None,
        }
    }

    /// Whether frames of this type carry call arguments.
    pub const fn carries_args(self) -> bool {
        matches!(
            self,
            FrameType::CallRequest
                | FrameType::CallResponse
                | FrameType::CallRequestContinue
                | FrameType::CallResponseContinue
        )
    }
}

/// One wire-level unit: header fields plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type.
    pub frame_type: FrameType,
    /// Message id.
    pub id: u32,
    /// Uninterpreted payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(frame_type: FrameType, id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            id,
            payload: payload.into(),
        }
    }

    /// Frame with an empty payload.
    pub fn empty(frame_type: FrameType, id: u32) -> Self {
        Self::new(frame_type, id, Bytes::new())
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let size = self.payload.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge { size });
        }
        dst.reserve(HEADER_SIZE + size);
        dst.put_u16(size as u16);
        dst.put_u8(self.frame_type.code());
        dst.put_u8(0);
        dst.put_u32(self.id);
        dst.put_bytes(0, 8);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tributary_transport::frame::{decode_frame, Frame, FrameType};
    ///
    /// let frame = Frame::new(FrameType::PingRequest, 7, &b""[..]);
    /// let bytes = frame.encode().expect("encode");
    /// assert_eq!(bytes.len(), 16);
    ///
    /// let (decoded, consumed) = decode_frame(&bytes).expect("decode");
    /// assert_eq!(decoded, frame);
    /// assert_eq!(consumed, 16);
    /// ```
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

struct FrameHeader {
    size: usize,
    frame_type: FrameType,
    id: u32,
}

fn parse_header(mut buf: &[u8]) -> Result<FrameHeader, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::InsufficientData {
            needed: HEADER_SIZE,
            have: buf.len(),
        });
    }
    let size = buf.get_u16() as usize;
    let code = buf.get_u8();
    let _reserved = buf.get_u8();
    let id = buf.get_u32();

    if size > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge { size });
    }
    let frame_type = FrameType::from_code(code).ok_or(FrameError::UnknownType { code })?;

    Ok(FrameHeader {
        size,
        frame_type,
        id,
    })
}

/// Decode one complete frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed.
///
/// # Errors
///
/// - `InsufficientData`: fewer bytes than the header or the declared payload
/// - `PayloadTooLarge`: declared size exceeds [`MAX_PAYLOAD_SIZE`]
/// - `UnknownType`: the type byte is not a known message type
pub fn decode_frame(data: &[u8]) -> Result<(Frame, usize), FrameError> {
    let header = parse_header(data)?;
    let total = HEADER_SIZE + header.size;
    if data.len() < total {
        return Err(FrameError::InsufficientData {
            needed: total,
            have: data.len(),
        });
    }
    let frame = Frame {
        frame_type: header.frame_type,
        id: header.id,
        payload: Bytes::copy_from_slice(&data[HEADER_SIZE..total]),
    };
    Ok((frame, total))
}

/// Try to take one frame off a streaming read buffer.
///
/// # Returns
///
/// - `Ok(Some(frame))` if a complete frame was split off the buffer
/// - `Ok(None)` if more data is needed (the buffer is left untouched)
/// - `Err` if the header is malformed
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = parse_header(buf)?;
    let total = HEADER_SIZE + header.size;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let mut raw = buf.split_to(total);
    raw.advance(HEADER_SIZE);
    Ok(Some(Frame {
        frame_type: header.frame_type,
        id: header.id,
        payload: raw.freeze(),
    }))
}
