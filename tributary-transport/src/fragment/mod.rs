//! Fragmentation of calls into frames and reassembly on receipt.
//!
//! A call's three arguments are written as `len:2 bytes` chunks into the
//! space left in each frame after its fixed fields. The first chunk of a
//! continuation frame continues the argument the previous frame stopped in.
//! Every further chunk in a frame starts the next argument. An argument that
//! is empty, or that ended exactly at a frame boundary, still gets a
//! zero-length chunk so that empty and omitted stay distinguishable.
//!
//! Every fragment carries a checksum over all of its payload bytes except the
//! checksum field itself, chained from the previous fragment's checksum.

mod checksum;
mod fragmenter;
mod reassembler;

pub use checksum::ChecksumType;
pub use fragmenter::encode_call;
pub use reassembler::{reassemble, Reassembler};

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::frame::FrameType;
use crate::message::{CallRequestHead, CallResponseHead};

/// The three argument payloads of a call.
///
/// `arg1` names the method, `arg2` holds application headers and `arg3` the
/// body. Their interpretation belongs to the arg scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    /// Method or endpoint name.
    pub arg1: Bytes,
    /// Application headers.
    pub arg2: Bytes,
    /// Body.
    pub arg3: Bytes,
}

impl CallArgs {
    /// Bundle three arguments.
    pub fn new(arg1: impl Into<Bytes>, arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        Self {
            arg1: arg1.into(),
            arg2: arg2.into(),
            arg3: arg3.into(),
        }
    }

    /// Combined length of all three arguments.
    pub fn total_len(&self) -> usize {
        self.arg1.len() + self.arg2.len() + self.arg3.len()
    }

    fn get(&self, index: usize) -> &Bytes {
        match index {
            0 => &self.arg1,
            1 => &self.arg2,
            _ => &self.arg3,
        }
    }
}

/// Fixed first-frame fields of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallHead {
    /// Request fields.
    Request(CallRequestHead),
    /// Response fields.
    Response(CallResponseHead),
}

impl CallHead {
    /// Type of the first frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            CallHead::Request(_) => FrameType::CallRequest,
            CallHead::Response(_) => FrameType::CallResponse,
        }
    }

    /// Type of the continuation frames.
    pub fn continue_type(&self) -> FrameType {
        match self {
            CallHead::Request(_) => FrameType::CallRequestContinue,
            CallHead::Response(_) => FrameType::CallResponseContinue,
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            CallHead::Request(head) => head.encode(buf),
            CallHead::Response(head) => head.encode(buf),
        }
    }
}

/// A complete logical call: head fields, checksum choice and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    /// First-frame fields.
    pub head: CallHead,
    /// Checksum applied to every fragment.
    pub checksum_type: ChecksumType,
    /// Arguments.
    pub args: CallArgs,
}
