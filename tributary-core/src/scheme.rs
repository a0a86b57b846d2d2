//! Arg schemes and payload codecs.
//!
//! The transport carries arg2 (application headers) and arg3 (body) as opaque
//! bytes. How those bytes are produced and interpreted is chosen by the call's
//! `as` transport header. A [`Payload`] is the decoded view, and a
//! [`PayloadCodec`] converts between the two. Codecs are looked up by
//! [`ArgScheme`] in a [`SchemeRegistry`].
//!
//! # Example
//!
//! ```rust
//! use tributary_core::{Payload, SchemeRegistry};
//! use serde_json::json;
//!
//! let registry = SchemeRegistry::default();
//! let payload = Payload::json_body(&json!({"key": "k1"})).expect("serialize");
//!
//! let (scheme, arg2, arg3) = registry.encode(&payload).expect("encode");
//! let decoded = registry.decode(scheme, &arg2, &arg3).expect("decode");
//! assert_eq!(decoded, payload);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encoding of a call's arg2 and arg3, named by the `as` transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgScheme {
    /// Opaque bytes, passed through untouched.
    Raw,
    /// JSON object headers and a JSON body.
    Json,
    /// Length-prefixed string headers and a schema-encoded body.
    Typed,
}

impl ArgScheme {
    /// The value written in the `as` transport header.
    pub const fn as_str(self) -> &'static str {
        match self {
            ArgScheme::Raw => "raw",
            ArgScheme::Json => "json",
            ArgScheme::Typed => "thrift",
        }
    }

    /// Resolve an `as` header value.
    pub fn from_header(value: &str) -> Option<Self> {
        match value {
            "raw" => Some(ArgScheme::Raw),
            "json" => Some(ArgScheme::Json),
            "thrift" => Some(ArgScheme::Typed),
            _ => None,
        }
    }
}

impl fmt::Display for ArgScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded application payload of a call, tagged by encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw headers and body bytes.
    Raw {
        /// Application header bytes (arg2).
        headers: Bytes,
        /// Body bytes (arg3).
        body: Bytes,
    },
    /// JSON headers object and JSON body.
    Json {
        /// Application headers, serialized as a JSON object.
        headers: BTreeMap<String, String>,
        /// Body value.
        body: serde_json::Value,
    },
    /// Ordered string headers and an already-encoded schema body.
    Typed {
        /// Application headers in wire order.
        headers: Vec<(String, String)>,
        /// Schema-encoded body bytes.
        body: Bytes,
    },
}

impl Payload {
    /// Raw payload with empty headers.
    pub fn raw(body: impl Into<Bytes>) -> Self {
        Payload::Raw {
            headers: Bytes::new(),
            body: body.into(),
        }
    }

    /// JSON payload with empty headers.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if `body` cannot be serialized.
    pub fn json_body<T: Serialize>(body: &T) -> Result<Self, CodecError> {
        Ok(Payload::Json {
            headers: BTreeMap::new(),
            body: serde_json::to_value(body)?,
        })
    }

    /// The scheme this payload is encoded with.
    pub fn scheme(&self) -> ArgScheme {
        match self {
            Payload::Raw { .. } => ArgScheme::Raw,
            Payload::Json { .. } => ArgScheme::Json,
            Payload::Typed { .. } => ArgScheme::Typed,
        }
    }

    /// Deserialize the body of a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::SchemeMismatch`] for non-JSON payloads and
    /// [`CodecError::Json`] if the body does not match `T`.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Payload::Json { body, .. } => Ok(serde_json::from_value(body.clone())?),
            other => Err(CodecError::SchemeMismatch {
                expected: ArgScheme::Json,
                actual: other.scheme(),
            }),
        }
    }
}

/// Error type for payload codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization or deserialization failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload variant does not match the codec.
    #[error("expected {expected} payload, got {actual}")]
    SchemeMismatch {
        /// Scheme of the codec.
        expected: ArgScheme,
        /// Scheme of the payload handed to it.
        actual: ArgScheme,
    },
    /// Header or body bytes are structurally invalid for the scheme.
    #[error("malformed {scheme} payload: {reason}")]
    Malformed {
        /// Scheme being decoded.
        scheme: ArgScheme,
        /// What was wrong.
        reason: String,
    },
    /// No codec is registered for the scheme.
    #[error("no codec registered for scheme {0}")]
    NoCodec(ArgScheme),
}

/// Encode/decode capability for one arg scheme.
pub trait PayloadCodec: Send + Sync {
    /// The scheme this codec handles.
    fn scheme(&self) -> ArgScheme;

    /// Encode a payload into `(arg2, arg3)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload has the wrong variant or cannot be
    /// serialized.
    fn encode(&self, payload: &Payload) -> Result<(Bytes, Bytes), CodecError>;

    /// Decode `(arg2, arg3)` into a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid for this scheme.
    fn decode(&self, arg2: &Bytes, arg3: &Bytes) -> Result<Payload, CodecError>;
}

fn mismatch(expected: ArgScheme, payload: &Payload) -> CodecError {
    CodecError::SchemeMismatch {
        expected,
        actual: payload.scheme(),
    }
}

/// Pass-through codec for [`ArgScheme::Raw`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl PayloadCodec for RawCodec {
    fn scheme(&self) -> ArgScheme {
        ArgScheme::Raw
    }

    fn encode(&self, payload: &Payload) -> Result<(Bytes, Bytes), CodecError> {
        match payload {
            Payload::Raw { headers, body } => Ok((headers.clone(), body.clone())),
            other => Err(mismatch(ArgScheme::Raw, other)),
        }
    }

    fn decode(&self, arg2: &Bytes, arg3: &Bytes) -> Result<Payload, CodecError> {
        Ok(Payload::Raw {
            headers: arg2.clone(),
            body: arg3.clone(),
        })
    }
}

/// JSON codec using serde_json.
///
/// Empty arg2 decodes as no headers and empty arg3 as `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn scheme(&self) -> ArgScheme {
        ArgScheme::Json
    }

    fn encode(&self, payload: &Payload) -> Result<(Bytes, Bytes), CodecError> {
        match payload {
            Payload::Json { headers, body } => {
                let arg2 = serde_json::to_vec(headers)?;
                let arg3 = serde_json::to_vec(body)?;
                Ok((Bytes::from(arg2), Bytes::from(arg3)))
            }
            other => Err(mismatch(ArgScheme::Json, other)),
        }
    }

    fn decode(&self, arg2: &Bytes, arg3: &Bytes) -> Result<Payload, CodecError> {
        let headers = if arg2.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(arg2)?
        };
        let body = if arg3.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(arg3)?
        };
        Ok(Payload::Json { headers, body })
    }
}

/// Codec for [`ArgScheme::Typed`].
///
/// arg2 is `nh:2` followed by `nh` pairs of `key~2 value~2`. The body is
/// produced by the application's schema compiler and passed through.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypedCodec;

impl TypedCodec {
    fn malformed(reason: impl Into<String>) -> CodecError {
        CodecError::Malformed {
            scheme: ArgScheme::Typed,
            reason: reason.into(),
        }
    }

    fn read_string(buf: &mut &[u8]) -> Result<String, CodecError> {
        if buf.remaining() < 2 {
            return Err(Self::malformed("truncated string length"));
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(Self::malformed("truncated string"));
        }
        let s = std::str::from_utf8(&buf[..len])
            .map_err(|_| Self::malformed("header is not valid utf-8"))?
            .to_string();
        buf.advance(len);
        Ok(s)
    }
}

impl PayloadCodec for TypedCodec {
    fn scheme(&self) -> ArgScheme {
        ArgScheme::Typed
    }

    fn encode(&self, payload: &Payload) -> Result<(Bytes, Bytes), CodecError> {
        let (headers, body) = match payload {
            Payload::Typed { headers, body } => (headers, body),
            other => return Err(mismatch(ArgScheme::Typed, other)),
        };
        let count = u16::try_from(headers.len())
            .map_err(|_| Self::malformed("too many headers"))?;
        let mut arg2 = BytesMut::new();
        arg2.put_u16(count);
        for (key, value) in headers {
            for s in [key, value] {
                let len =
                    u16::try_from(s.len()).map_err(|_| Self::malformed("header too long"))?;
                arg2.put_u16(len);
                arg2.put_slice(s.as_bytes());
            }
        }
        Ok((arg2.freeze(), body.clone()))
    }

    fn decode(&self, arg2: &Bytes, arg3: &Bytes) -> Result<Payload, CodecError> {
        let mut headers = Vec::new();
        if !arg2.is_empty() {
            let mut buf: &[u8] = arg2;
            if buf.remaining() < 2 {
                return Err(Self::malformed("truncated header count"));
            }
            let count = buf.get_u16();
            for _ in 0..count {
                let key = Self::read_string(&mut buf)?;
                let value = Self::read_string(&mut buf)?;
                headers.push((key, value));
            }
            if buf.has_remaining() {
                return Err(Self::malformed("trailing bytes after headers"));
            }
        }
        Ok(Payload::Typed {
            headers,
            body: arg3.clone(),
        })
    }
}

/// Codecs keyed by arg scheme.
///
/// [`SchemeRegistry::default`] holds the three built-in codecs. Registering a
/// codec for a scheme replaces the previous one.
#[derive(Clone)]
pub struct SchemeRegistry {
    codecs: HashMap<ArgScheme, Arc<dyn PayloadCodec>>,
}

impl SchemeRegistry {
    /// Registry with no codecs.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register a codec under its own scheme.
    pub fn register(&mut self, codec: Arc<dyn PayloadCodec>) {
        self.codecs.insert(codec.scheme(), codec);
    }

    /// Look up the codec for a scheme.
    pub fn get(&self, scheme: ArgScheme) -> Option<Arc<dyn PayloadCodec>> {
        self.codecs.get(&scheme).cloned()
    }

    /// Encode a payload with the codec matching its variant.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NoCodec`] if the scheme has no codec, or the
    /// codec's own error.
    pub fn encode(&self, payload: &Payload) -> Result<(ArgScheme, Bytes, Bytes), CodecError> {
        let scheme = payload.scheme();
        let codec = self.get(scheme).ok_or(CodecError::NoCodec(scheme))?;
        let (arg2, arg3) = codec.encode(payload)?;
        Ok((scheme, arg2, arg3))
    }

    /// Decode `(arg2, arg3)` with the codec for `scheme`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NoCodec`] if the scheme has no codec, or the
    /// codec's own error.
    pub fn decode(
        &self,
        scheme: ArgScheme,
        arg2: &Bytes,
        arg3: &Bytes,
    ) -> Result<Payload, CodecError> {
        let codec = self.get(scheme).ok_or(CodecError::NoCodec(scheme))?;
        codec.decode(arg2, arg3)
    }
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RawCodec));
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(TypedCodec));
        registry
    }
}

impl fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.codecs.keys().map(|s| s.as_str()).collect();
        schemes.sort_unstable();
        f.debug_struct("SchemeRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_values() {
        for scheme in [ArgScheme::Raw, ArgScheme::Json, ArgScheme::Typed] {
            assert_eq!(ArgScheme::from_header(scheme.as_str()), Some(scheme));
        }
        assert_eq!(ArgScheme::from_header("protobuf"), None);
    }

    #[test]
    fn test_raw_passthrough() {
        let registry = SchemeRegistry::default();
        let payload = Payload::Raw {
            headers: Bytes::from_static(b"h"),
            body: Bytes::from_static(b"\x00\x01\x02"),
        };
        let (scheme, arg2, arg3) = registry.encode(&payload).expect("encode");
        assert_eq!(scheme, ArgScheme::Raw);
        assert_eq!(&arg2[..], b"h");
        assert_eq!(&arg3[..], b"\x00\x01\x02");
    }

    #[test]
    fn test_json_headers_and_body() {
        let mut headers = BTreeMap::new();
        headers.insert("tenant".to_string(), "blue".to_string());
        let payload = Payload::Json {
            headers,
            body: json!({"count": 3}),
        };

        let (arg2, arg3) = JsonCodec.encode(&payload).expect("encode");
        assert_eq!(&arg2[..], br#"{"tenant":"blue"}"#);

        let decoded = JsonCodec.decode(&arg2, &arg3).expect("decode");
        assert_eq!(decoded, payload);

        #[derive(Deserialize, Debug, PartialEq)]
        struct Body {
            count: u32,
        }
        assert_eq!(decoded.parse_json::<Body>().expect("body"), Body { count: 3 });
    }

    #[test]
    fn test_json_empty_args() {
        let decoded = JsonCodec
            .decode(&Bytes::new(), &Bytes::new())
            .expect("decode");
        assert_eq!(
            decoded,
            Payload::Json {
                headers: BTreeMap::new(),
                body: serde_json::Value::Null,
            }
        );
    }

    #[test]
    fn test_json_rejects_garbage() {
        let result = JsonCodec.decode(&Bytes::from_static(b"{"), &Bytes::new());
        assert!(matches!(result, Err(CodecError::Json(_))));
    }

    #[test]
    fn test_typed_header_layout() {
        let payload = Payload::Typed {
            headers: vec![("k".to_string(), "vv".to_string())],
            body: Bytes::from_static(b"body"),
        };
        let (arg2, arg3) = TypedCodec.encode(&payload).expect("encode");
        assert_eq!(&arg2[..], &[0, 1, 0, 1, b'k', 0, 2, b'v', b'v']);
        assert_eq!(&arg3[..], b"body");
        assert_eq!(TypedCodec.decode(&arg2, &arg3).expect("decode"), payload);
    }

    #[test]
    fn test_typed_truncated_headers() {
        let arg2 = Bytes::from_static(&[0, 1, 0, 5, b'k']);
        let result = TypedCodec.decode(&arg2, &Bytes::new());
        assert!(matches!(result, Err(CodecError::Malformed { .. })));
    }

    #[test]
    fn test_codec_rejects_wrong_variant() {
        let result = JsonCodec.encode(&Payload::raw("x"));
        assert!(matches!(
            result,
            Err(CodecError::SchemeMismatch {
                expected: ArgScheme::Json,
                actual: ArgScheme::Raw
            })
        ));
    }

    #[test]
    fn test_empty_registry() {
        let registry = SchemeRegistry::empty();
        let result = registry.encode(&Payload::raw("x"));
        assert!(matches!(result, Err(CodecError::NoCodec(ArgScheme::Raw))));
    }
}
