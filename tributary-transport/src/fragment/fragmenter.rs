use bytes::{BufMut, BytesMut};

use super::{CallArgs, CallMessage};
use crate::error::ProtocolError;
use crate::frame::{Frame, MAX_PAYLOAD_SIZE};
use crate::message::FLAG_MORE_FRAGMENTS;

/// Bytes of `csumtype:1 csum:4`.
const CHECKSUM_FIELDS: usize = 5;

/// Smallest argument region that still makes progress: one prefix plus one byte.
const MIN_ARGS_CAPACITY: usize = 3;

/// Writes argument chunks frame after frame.
struct ArgWriter<'a> {
    args: &'a CallArgs,
    current: usize,
    offset: usize,
}

impl ArgWriter<'_> {
    /// Fill one frame's argument region. Returns whether more frames follow.
    fn fill(&mut self, region: &mut BytesMut, capacity: usize) -> bool {
        let mut remaining = capacity;
        let mut first_chunk = true;
        loop {
            if !first_chunk {
                self.current += 1;
                self.offset = 0;
            }
            first_chunk = false;

            let arg = self.args.get(self.current);
            let n = (arg.len() - self.offset).min(remaining - 2);
            region.put_u16(n as u16);
            region.put_slice(&arg[self.offset..self.offset + n]);
            self.offset += n;
            remaining -= 2 + n;

            if self.offset < arg.len() {
                return true;
            }
            if self.current == 2 {
                return false;
            }
            if remaining < 2 {
                return true;
            }
        }
    }
}

/// Split a call into frames of at most `max_payload` payload bytes.
///
/// # Errors
///
/// Returns `FieldTooLong` if a head field does not fit its length prefix, and
/// `NoRoomForArgs` if the head fields leave no usable space in the first
/// frame.
///
/// # Examples
///
/// ```
/// use tributary_transport::fragment::{
///     encode_call, reassemble, CallArgs, CallHead, CallMessage, ChecksumType,
/// };
/// use tributary_transport::message::CallRequestHead;
/// use tributary_transport::{TransportHeaders, MAX_PAYLOAD_SIZE};
/// use tributary_core::TraceContext;
/// use std::time::Duration;
///
/// let message = CallMessage {
///     head: CallHead::Request(CallRequestHead {
///         ttl: Duration::from_secs(1),
///         trace: TraceContext::new_root(),
///         service: "kv".to_string(),
///         headers: TransportHeaders::new(),
///     }),
///     checksum_type: ChecksumType::Crc32C,
///     args: CallArgs::new("get", "", "key"),
/// };
///
/// let frames = encode_call(1, &message, MAX_PAYLOAD_SIZE).expect("encode");
/// assert_eq!(frames.len(), 1);
/// assert_eq!(reassemble(&frames).expect("reassemble"), message);
/// ```
pub fn encode_call(
    id: u32,
    message: &CallMessage,
    max_payload: usize,
) -> Result<Vec<Frame>, ProtocolError> {
    let max_payload = max_payload.min(MAX_PAYLOAD_SIZE);
    let checksum_type = message.checksum_type;

    let mut head = BytesMut::new();
    message.head.encode(&mut head)?;

    let mut writer = ArgWriter {
        args: &message.args,
        current: 0,
        offset: 0,
    };
    let mut frames = Vec::new();
    let mut running = 0u32;

    loop {
        let first = frames.is_empty();
        let fixed = 1 + if first { head.len() } else { 0 } + CHECKSUM_FIELDS;
        let capacity = max_payload.saturating_sub(fixed);
        if capacity < MIN_ARGS_CAPACITY {
            return Err(ProtocolError::NoRoomForArgs {
                available: capacity,
            });
        }

        let mut region = BytesMut::with_capacity(capacity);
        let more = writer.fill(&mut region, capacity);

        let mut covered = BytesMut::with_capacity(fixed - 4);
        covered.put_u8(if more { FLAG_MORE_FRAGMENTS } else { 0 });
        if first {
            covered.extend_from_slice(&head);
        }
        covered.put_u8(checksum_type.code());
        running = checksum_type.chain(running, &[&covered, &region]);

        let mut payload = BytesMut::with_capacity(fixed + region.len());
        payload.extend_from_slice(&covered);
        payload.put_u32(running);
        payload.extend_from_slice(&region);

        let frame_type = if first {
            message.head.frame_type()
        } else {
            message.head.continue_type()
        };
        frames.push(Frame::new(frame_type, id, payload.freeze()));

        if !more {
            return Ok(frames);
        }
    }
}
