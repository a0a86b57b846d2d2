//! Explicit trace context threaded through the call path.
//!
//! There is no ambient or thread-local span. The context is populated when a
//! call starts, written into the call frame, handed to the server handler as
//! part of the inbound call, and dropped with the response.

use serde::{Deserialize, Serialize};

/// Trace identifiers carried by every call and error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TraceContext {
    /// Identifier shared by every span in one trace.
    pub trace_id: u64,
    /// Identifier of this span.
    pub span_id: u64,
    /// Identifier of the parent span, 0 for a root span.
    pub parent_id: u64,
    /// Trace flags. Bit 0 marks the trace as sampled.
    pub flags: u8,
}

impl TraceContext {
    /// Encoded size on the wire: three 8-byte ids plus one flag byte.
    pub const WIRE_SIZE: usize = 25;

    /// Flag bit marking the trace as sampled.
    pub const SAMPLED: u8 = 0x01;

    /// Start a new root trace with random identifiers.
    pub fn new_root() -> Self {
        let trace_id = nonzero_random();
        Self {
            trace_id,
            span_id: trace_id,
            parent_id: 0,
            flags: 0,
        }
    }

    /// Derive a child span of this context.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: nonzero_random(),
            parent_id: self.span_id,
            flags: self.flags,
        }
    }

    /// Return this context with the sampled flag set or cleared.
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        if sampled {
            self.flags |= Self::SAMPLED;
        } else {
            self.flags &= !Self::SAMPLED;
        }
        self
    }

    /// Whether the sampled flag is set.
    pub fn is_sampled(&self) -> bool {
        self.flags & Self::SAMPLED != 0
    }

    /// Whether this context carries no trace at all.
    pub fn is_empty(&self) -> bool {
        self.trace_id == 0 && self.span_id == 0
    }
}

fn nonzero_random() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
