use bytes::{Buf, Bytes, BytesMut};

use super::{CallArgs, CallHead, CallMessage, ChecksumType};
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameType};
use crate::message::{decode_call_request, decode_call_response, ArgsFragment};

/// Accumulates the fragments of one call.
///
/// Each fragment's checksum is verified before any of its chunks are
/// appended.
#[derive(Debug)]
pub struct Reassembler {
    checksum_type: ChecksumType,
    running: u32,
    current: usize,
    chunks: usize,
    args: [BytesMut; 3],
    finished: bool,
}

impl Reassembler {
    /// Start reassembling a call whose first fragment uses `checksum_type`.
    pub fn new(checksum_type: ChecksumType) -> Self {
        Self {
            checksum_type,
            running: 0,
            current: 0,
            chunks: 0,
            args: [BytesMut::new(), BytesMut::new(), BytesMut::new()],
            finished: false,
        }
    }

    /// Checksum type fixed by the first fragment.
    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum_type
    }

    /// Append one fragment.
    ///
    /// Returns the arguments once the fragment without the more-fragments
    /// flag has been appended.
    ///
    /// # Errors
    ///
    /// - `ChecksumTypeChanged` / `ChecksumMismatch`: integrity failure
    /// - `Framing`: truncated chunks, more than three arguments, or a final
    ///   fragment that leaves the arguments incomplete
    pub fn push(&mut self, fragment: ArgsFragment) -> Result<Option<CallArgs>, ProtocolError> {
        if self.finished {
            return Err(ProtocolError::Framing("fragment after final fragment"));
        }
        if fragment.checksum_type != self.checksum_type {
            return Err(ProtocolError::ChecksumTypeChanged {
                first: self.checksum_type.code(),
                later: fragment.checksum_type.code(),
            });
        }

        let computed = self
            .checksum_type
            .chain(self.running, &[&fragment.covered, &fragment.region]);
        if computed != fragment.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: fragment.checksum,
                actual: computed,
            });
        }
        self.running = computed;

        let mut region: Bytes = fragment.region;
        let mut first_chunk = true;
        while region.has_remaining() {
            if !first_chunk {
                self.current += 1;
                if self.current > 2 {
                    return Err(ProtocolError::Framing("more than three arguments"));
                }
            }
            first_chunk = false;

            if region.remaining() < 2 {
                return Err(ProtocolError::Framing("truncated chunk length"));
            }
            let len = region.get_u16() as usize;
            if region.remaining() < len {
                return Err(ProtocolError::Framing("chunk overruns fragment"));
            }
            self.args[self.current].extend_from_slice(&region[..len]);
            region.advance(len);
            self.chunks += 1;
        }

        if fragment.more {
            return Ok(None);
        }
        if self.current != 2 || self.chunks < 3 {
            return Err(ProtocolError::Framing("final fragment leaves arguments incomplete"));
        }
        self.finished = true;
        let [arg1, arg2, arg3] = std::mem::take(&mut self.args);
        Ok(Some(CallArgs {
            arg1: arg1.freeze(),
            arg2: arg2.freeze(),
            arg3: arg3.freeze(),
        }))
    }
}

/// Reassemble the ordered frames of one call.
///
/// # Errors
///
/// Returns a checksum error if any fragment fails verification and a framing
/// error if the frames do not form exactly one complete call.
pub fn reassemble(frames: &[Frame]) -> Result<CallMessage, ProtocolError> {
    let (first, rest) = frames
        .split_first()
        .ok_or(ProtocolError::Framing("no frames"))?;

    let (head, fragment) = match first.frame_type {
        FrameType::CallRequest => {
            let (head, fragment) = decode_call_request(first.payload.clone())?;
            (CallHead::Request(head), fragment)
        }
        FrameType::CallResponse => {
            let (head, fragment) = decode_call_response(first.payload.clone())?;
            (CallHead::Response(head), fragment)
        }
        frame_type => {
            return Err(ProtocolError::UnexpectedFrame {
                frame_type,
                id: first.id,
            })
        }
    };

    let mut reassembler = Reassembler::new(fragment.checksum_type);
    let mut args = reassembler.push(fragment)?;
    for frame in rest {
        if args.is_some() {
            return Err(ProtocolError::Framing("fragment after final fragment"));
        }
        if frame.frame_type != head.continue_type() || frame.id != first.id {
            return Err(ProtocolError::UnexpectedFrame {
                frame_type: frame.frame_type,
                id: frame.id,
            });
        }
        args = reassembler.push(ArgsFragment::decode_continue(frame.payload.clone())?)?;
    }

    let args = args.ok_or(ProtocolError::Framing("missing final fragment"))?;
    Ok(CallMessage {
        head,
        checksum_type: reassembler.checksum_type(),
        args,
    })
}
