//! Frame payload bodies.
//!
//! Layouts (all integers big-endian, `~N` is an N-byte length prefix):
//!
//! - CallRequest: `flags:1 ttl:4 trace:25 service~1 nh:1 (k~1 v~1){nh} csumtype:1 csum:4 args`
//! - CallResponse: `flags:1 code:1 trace:25 nh:1 (k~1 v~1){nh} csumtype:1 csum:4 args`
//! - Call*Continue: `flags:1 csumtype:1 csum:4 args`
//! - Error: `code:1 trace:25 message~2`
//! - Init*: `version:2 nh:2 (k~2 v~2){nh}`
//! - Cancel: `ttl:4 trace:25 why~2`
//! - Claim: `ttl:4 trace:25`
//! - Ping*: empty
//!
//! `args` is a sequence of `len:2 bytes` chunks, see [`crate::fragment`].

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tributary_core::{ErrorType, TraceContext};

use crate::error::ProtocolError;
use crate::fragment::ChecksumType;
use crate::headers::TransportHeaders;

/// `flags` bit marking that more fragments follow.
pub const FLAG_MORE_FRAGMENTS: u8 = 0x01;

/// Protocol version exchanged in the init handshake.
pub const PROTOCOL_VERSION: u16 = 2;

/// Init header carrying the sender's listening address.
pub const INIT_HOST_PORT: &str = "host_port";

/// Init header carrying the sender's process name.
pub const INIT_PROCESS_NAME: &str = "process_name";

/// Id used for errors that concern the whole connection.
pub const CONNECTION_ERROR_ID: u32 = u32::MAX;

/// Checked cursor over a frame payload.
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    /// Read from `buf`.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, field: &'static str) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated { field });
        }
        Ok(())
    }

    /// Read one byte.
    pub fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    /// Read a big-endian u16.
    pub fn u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16())
    }

    /// Read a big-endian u32.
    pub fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    /// Read `n` raw bytes.
    pub fn bytes(&mut self, n: usize, field: &'static str) -> Result<Bytes, ProtocolError> {
        self.need(n, field)?;
        Ok(self.buf.split_to(n))
    }

    /// Read a string with a one-byte length prefix.
    pub fn str1(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u8(field)? as usize;
        self.string(len, field)
    }

    /// Read a string with a two-byte length prefix.
    pub fn str2(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u16(field)? as usize;
        self.string(len, field)
    }

    fn string(&mut self, len: usize, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.bytes(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    /// Read a trace context.
    pub fn trace(&mut self) -> Result<TraceContext, ProtocolError> {
        self.need(TraceContext::WIRE_SIZE, "trace")?;
        Ok(TraceContext {
            trace_id: self.buf.get_u64(),
            span_id: self.buf.get_u64(),
            parent_id: self.buf.get_u64(),
            flags: self.buf.get_u8(),
        })
    }

    /// Bytes consumed so far out of `total`.
    pub fn position(&self, total: usize) -> usize {
        total - self.buf.remaining()
    }

    /// Take everything that is left.
    pub fn rest(self) -> Bytes {
        self.buf
    }
}

fn put_str1(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), ProtocolError> {
    let len = u8::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: s.len(),
        max: u8::MAX as usize,
    })?;
    buf.put_u8(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_str2(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: s.len(),
        max: u16::MAX as usize,
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_trace(buf: &mut BytesMut, trace: &TraceContext) {
    buf.put_u64(trace.trace_id);
    buf.put_u64(trace.span_id);
    buf.put_u64(trace.parent_id);
    buf.put_u8(trace.flags);
}

fn put_call_headers(buf: &mut BytesMut, headers: &TransportHeaders) -> Result<(), ProtocolError> {
    let count = u8::try_from(headers.len()).map_err(|_| ProtocolError::FieldTooLong {
        field: "transport headers",
        len: headers.len(),
        max: u8::MAX as usize,
    })?;
    buf.put_u8(count);
    for (key, value) in headers.iter() {
        put_str1(buf, key, "transport header key")?;
        put_str1(buf, value, "transport header value")?;
    }
    Ok(())
}

fn read_call_headers(reader: &mut WireReader) -> Result<TransportHeaders, ProtocolError> {
    let count = reader.u8("transport header count")?;
    let mut headers = TransportHeaders::new();
    for _ in 0..count {
        let key = reader.str1("transport header key")?;
        let value = reader.str1("transport header value")?;
        headers.insert(key, value);
    }
    Ok(headers)
}

fn ttl_to_millis(ttl: Duration) -> u32 {
    u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX)
}

/// Application status of a call response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResponseCode {
    /// The handler succeeded.
    #[default]
    Ok,
    /// The handler returned an application-level error in its args.
    ApplicationError,
}

impl ResponseCode {
    /// Decode a response code byte.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResponseCode` for anything but 0x00 and 0x01.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0x00 => Ok(ResponseCode::Ok),
            0x01 => Ok(ResponseCode::ApplicationError),
            other => Err(ProtocolError::UnknownResponseCode(other)),
        }
    }

    /// The one-byte wire code.
    pub const fn code(self) -> u8 {
        match self {
            ResponseCode::Ok => 0x00,
            ResponseCode::ApplicationError => 0x01,
        }
    }
}

/// First-frame fields of a call request, everything before the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequestHead {
    /// Time the caller is still willing to wait.
    pub ttl: Duration,
    /// Trace context of the call.
    pub trace: TraceContext,
    /// Destination service name.
    pub service: String,
    /// Transport headers.
    pub headers: TransportHeaders,
}

impl CallRequestHead {
    /// Encode the fields that follow `flags`.
    ///
    /// # Errors
    ///
    /// Returns `FieldTooLong` if a string or the header count does not fit.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(ttl_to_millis(self.ttl));
        put_trace(buf, &self.trace);
        put_str1(buf, &self.service, "service")?;
        put_call_headers(buf, &self.headers)
    }

    fn decode(reader: &mut WireReader) -> Result<Self, ProtocolError> {
        let ttl = Duration::from_millis(u64::from(reader.u32("ttl")?));
        let trace = reader.trace()?;
        let service = reader.str1("service")?;
        let headers = read_call_headers(reader)?;
        Ok(Self {
            ttl,
            trace,
            service,
            headers,
        })
    }
}

/// First-frame fields of a call response, everything before the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponseHead {
    /// Application status.
    pub code: ResponseCode,
    /// Trace context echoed from the request.
    pub trace: TraceContext,
    /// Transport headers.
    pub headers: TransportHeaders,
}

impl CallResponseHead {
    /// Encode the fields that follow `flags`.
    ///
    /// # Errors
    ///
    /// Returns `FieldTooLong` if a header does not fit.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.code.code());
        put_trace(buf, &self.trace);
        put_call_headers(buf, &self.headers)
    }

    fn decode(reader: &mut WireReader) -> Result<Self, ProtocolError> {
        let code = ResponseCode::from_code(reader.u8("response code")?)?;
        let trace = reader.trace()?;
        let headers = read_call_headers(reader)?;
        Ok(Self {
            code,
            trace,
            headers,
        })
    }
}

/// The argument-carrying part of one call frame.
///
/// `covered` is every payload byte before the checksum field and `region` is
/// every byte after it. Both are covered by the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgsFragment {
    /// Whether more fragments follow.
    pub more: bool,
    /// Checksum algorithm.
    pub checksum_type: ChecksumType,
    /// Checksum carried by the frame.
    pub checksum: u32,
    /// Payload bytes preceding the checksum field.
    pub covered: Bytes,
    /// Length-prefixed argument chunks.
    pub region: Bytes,
}

impl ArgsFragment {
    fn decode_tail(
        payload: &Bytes,
        mut reader: WireReader,
        flags: u8,
    ) -> Result<Self, ProtocolError> {
        let checksum_type = ChecksumType::from_code(reader.u8("checksum type")?)?;
        let covered = payload.slice(..reader.position(payload.len()));
        let checksum = reader.u32("checksum")?;
        Ok(Self {
            more: flags & FLAG_MORE_FRAGMENTS != 0,
            checksum_type,
            checksum,
            covered,
            region: reader.rest(),
        })
    }

    /// Decode a `Call*Continue` payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is truncated or names an unsupported
    /// checksum type.
    pub fn decode_continue(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload.clone());
        let flags = reader.u8("flags")?;
        Self::decode_tail(&payload, reader, flags)
    }
}

/// Decode a CallRequest payload into its head and first fragment.
///
/// # Errors
///
/// Returns an error if the payload is truncated or malformed.
pub fn decode_call_request(
    payload: Bytes,
) -> Result<(CallRequestHead, ArgsFragment), ProtocolError> {
    let mut reader = WireReader::new(payload.clone());
    let flags = reader.u8("flags")?;
    let head = CallRequestHead::decode(&mut reader)?;
    let fragment = ArgsFragment::decode_tail(&payload, reader, flags)?;
    Ok((head, fragment))
}

/// Decode a CallResponse payload into its head and first fragment.
///
/// # Errors
///
/// Returns an error if the payload is truncated or malformed.
pub fn decode_call_response(
    payload: Bytes,
) -> Result<(CallResponseHead, ArgsFragment), ProtocolError> {
    let mut reader = WireReader::new(payload.clone());
    let flags = reader.u8("flags")?;
    let head = CallResponseHead::decode(&mut reader)?;
    let fragment = ArgsFragment::decode_tail(&payload, reader, flags)?;
    Ok((head, fragment))
}

/// Body of an Error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Failure class.
    pub error_type: ErrorType,
    /// Trace context of the failed call.
    pub trace: TraceContext,
    /// Description.
    pub message: String,
}

impl ErrorMessage {
    /// Encode the body.
    ///
    /// Messages longer than the length prefix allows are truncated at a
    /// character boundary.
    pub fn encode(&self) -> Bytes {
        let mut message = self.message.as_str();
        if message.len() > u16::MAX as usize {
            let mut end = u16::MAX as usize;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message = &message[..end];
        }
        let mut buf = BytesMut::with_capacity(1 + TraceContext::WIRE_SIZE + 2 + message.len());
        buf.put_u8(self.error_type.code());
        put_trace(&mut buf, &self.trace);
        buf.put_u16(message.len() as u16);
        buf.put_slice(message.as_bytes());
        buf.freeze()
    }

    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated payloads or unknown error codes.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        let code = reader.u8("error code")?;
        let error_type = ErrorType::from_code(code).ok_or(ProtocolError::UnknownErrorCode(code))?;
        let trace = reader.trace()?;
        let message = reader.str2("error message")?;
        Ok(Self {
            error_type,
            trace,
            message,
        })
    }
}

/// Body of InitRequest and InitResponse frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    /// Protocol version.
    pub version: u16,
    /// Handshake headers.
    pub headers: TransportHeaders,
}

impl InitMessage {
    /// Init message advertising our address and process name.
    pub fn new(host_port: &str, process_name: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            headers: TransportHeaders::new()
                .with(INIT_HOST_PORT, host_port)
                .with(INIT_PROCESS_NAME, process_name),
        }
    }

    /// Encode the body.
    ///
    /// # Errors
    ///
    /// Returns `FieldTooLong` if a header does not fit its length prefix.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_u16(self.version);
        let count = u16::try_from(self.headers.len()).map_err(|_| ProtocolError::FieldTooLong {
            field: "init headers",
            len: self.headers.len(),
            max: u16::MAX as usize,
        })?;
        buf.put_u16(count);
        for (key, value) in self.headers.iter() {
            put_str2(&mut buf, key, "init header key")?;
            put_str2(&mut buf, value, "init header value")?;
        }
        Ok(buf.freeze())
    }

    /// Decode and validate the body.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated payloads, a version other than
    /// [`PROTOCOL_VERSION`], or missing required headers.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        let version = reader.u16("init version")?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let count = reader.u16("init header count")?;
        let mut headers = TransportHeaders::new();
        for _ in 0..count {
            let key = reader.str2("init header key")?;
            let value = reader.str2("init header value")?;
            headers.insert(key, value);
        }
        for required in [INIT_HOST_PORT, INIT_PROCESS_NAME] {
            if !headers.contains(required) {
                return Err(ProtocolError::MissingInitHeader(required));
            }
        }
        Ok(Self { version, headers })
    }

    /// Advertised `host_port`.
    pub fn host_port(&self) -> &str {
        self.headers.get(INIT_HOST_PORT).unwrap_or_default()
    }

    /// Advertised `process_name`.
    pub fn process_name(&self) -> &str {
        self.headers.get(INIT_PROCESS_NAME).unwrap_or_default()
    }
}

/// Body of a Cancel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelMessage {
    /// Remaining TTL of the cancelled call.
    pub ttl: Duration,
    /// Trace context of the cancelled call.
    pub trace: TraceContext,
    /// Reason.
    pub why: String,
}

impl CancelMessage {
    /// Encode the body.
    ///
    /// # Errors
    ///
    /// Returns `FieldTooLong` if the reason does not fit.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(4 + TraceContext::WIRE_SIZE + 2 + self.why.len());
        buf.put_u32(ttl_to_millis(self.ttl));
        put_trace(&mut buf, &self.trace);
        put_str2(&mut buf, &self.why, "cancel reason")?;
        Ok(buf.freeze())
    }

    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated payloads.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        let ttl = Duration::from_millis(u64::from(reader.u32("ttl")?));
        let trace = reader.trace()?;
        let why = reader.str2("cancel reason")?;
        Ok(Self { ttl, trace, why })
    }
}

/// Body of a Claim frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMessage {
    /// Remaining TTL of the claimed call.
    pub ttl: Duration,
    /// Trace context of the claimed call.
    pub trace: TraceContext,
}

impl ClaimMessage {
    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + TraceContext::WIRE_SIZE);
        buf.put_u32(ttl_to_millis(self.ttl));
        put_trace(&mut buf, &self.trace);
        buf.freeze()
    }

    /// Decode the body.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated payloads.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        let ttl = Duration::from_millis(u64::from(reader.u32("ttl")?));
        let trace = reader.trace()?;
        Ok(Self { ttl, trace })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> TraceContext {
        TraceContext {
            trace_id: 1,
            span_id: 2,
            parent_id: 3,
            flags: TraceContext::SAMPLED,
        }
    }

    #[test]
    fn test_error_message_layout() {
        let msg = ErrorMessage {
            error_type: ErrorType::Busy,
            trace: trace(),
            message: "overloaded".to_string(),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes.len(), 1 + 25 + 2 + 10);
        assert_eq!(ErrorMessage::decode(bytes).expect("decode"), msg);
    }

    #[test]
    fn test_error_message_unknown_code() {
        let mut bytes = ErrorMessage {
            error_type: ErrorType::Busy,
            trace: trace(),
            message: String::new(),
        }
        .encode()
        .to_vec();
        bytes[0] = 0x42;
        assert_eq!(
            ErrorMessage::decode(Bytes::from(bytes)),
            Err(ProtocolError::UnknownErrorCode(0x42))
        );
    }

    #[test]
    fn test_init_requires_headers() {
        let msg = InitMessage::new("127.0.0.1:4040", "worker");
        let decoded = InitMessage::decode(msg.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.host_port(), "127.0.0.1:4040");
        assert_eq!(decoded.process_name(), "worker");

        let missing = InitMessage {
            version: PROTOCOL_VERSION,
            headers: TransportHeaders::new().with(INIT_HOST_PORT, "0.0.0.0:0"),
        };
        assert_eq!(
            InitMessage::decode(missing.encode().expect("encode")),
            Err(ProtocolError::MissingInitHeader(INIT_PROCESS_NAME))
        );
    }

    #[test]
    fn test_init_version_mismatch() {
        let msg = InitMessage {
            version: 1,
            headers: TransportHeaders::new(),
        };
        assert_eq!(
            InitMessage::decode(msg.encode().expect("encode")),
            Err(ProtocolError::UnsupportedVersion(1))
        );
    }

    #[test]
    fn test_cancel_and_claim_layout() {
        let cancel = CancelMessage {
            ttl: Duration::from_millis(1500),
            trace: trace(),
            why: "caller gave up".to_string(),
        };
        let bytes = cancel.encode().expect("encode");
        assert_eq!(&bytes[..4], &1500u32.to_be_bytes());
        assert_eq!(CancelMessage::decode(bytes).expect("decode"), cancel);

        let claim = ClaimMessage {
            ttl: Duration::from_millis(10),
            trace: trace(),
        };
        let bytes = claim.encode();
        assert_eq!(bytes.len(), 29);
        assert_eq!(ClaimMessage::decode(bytes).expect("decode"), claim);
    }

    #[test]
    fn test_call_request_head_fields() {
        let head = CallRequestHead {
            ttl: Duration::from_millis(250),
            trace: trace(),
            service: "kv".to_string(),
            headers: TransportHeaders::new().with("as", "raw"),
        };
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        head.encode(&mut buf).expect("encode");
        buf.put_u8(ChecksumType::None.code());
        buf.put_u32(0);
        buf.put_slice(&[0, 0]);

        let (decoded, fragment) = decode_call_request(buf.freeze()).expect("decode");
        assert_eq!(decoded, head);
        assert!(!fragment.more);
        assert_eq!(fragment.checksum_type, ChecksumType::None);
        assert_eq!(&fragment.region[..], &[0, 0]);
    }

    #[test]
    fn test_truncated_request() {
        let result = decode_call_request(Bytes::from_static(&[0, 0, 0]));
        assert_eq!(result, Err(ProtocolError::Truncated { field: "ttl" }));
    }

    #[test]
    fn test_header_too_long() {
        let head = CallRequestHead {
            ttl: Duration::from_secs(1),
            trace: TraceContext::default(),
            service: "s".repeat(300),
            headers: TransportHeaders::new(),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            head.encode(&mut buf),
            Err(ProtocolError::FieldTooLong { field: "service", .. })
        ));
    }
}
