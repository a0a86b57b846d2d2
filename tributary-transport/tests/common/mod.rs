//! Shared setup for loopback integration tests.

#![allow(dead_code)]

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;
use tributary_transport::frame::try_decode_frame;
use tributary_transport::message::InitMessage;
use tributary_transport::{
    handler_fn, CallError, Channel, ChannelConfig, ErrorType, Frame, FrameType, HandlerError,
    HostPort, OutgoingResponse, SchemeRegistry,
};

/// Service name every test server registers.
pub const SERVICE: &str = "kv";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Milliseconds encoded in a request body.
pub fn millis(body: &[u8]) -> Duration {
    let millis = std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Duration::from_millis(millis)
}

/// Register the standard test methods on `channel`:
///
/// - `echo`: returns arg2 and arg3 unchanged
/// - `sleep`: sleeps for the milliseconds in arg3, then echoes
/// - `busy`: fails with `Busy`
/// - `app_error`: returns an application error response
/// - `panic`: panics
/// - `json`: echoes a JSON body with an extra `seen` field
pub fn register_handlers(channel: &Channel) {
    channel.register(
        SERVICE,
        "echo",
        handler_fn(|call| async move { Ok(OutgoingResponse::ok(call.args.arg2, call.args.arg3)) }),
    );
    channel.register(
        SERVICE,
        "sleep",
        handler_fn(|call| async move {
            tokio::time::sleep(millis(&call.args.arg3)).await;
            Ok(OutgoingResponse::ok(call.args.arg2, call.args.arg3))
        }),
    );
    channel.register(
        SERVICE,
        "busy",
        handler_fn(|_call| async move {
            Err(HandlerError::from(CallError::new(ErrorType::Busy, "shedding load")))
        }),
    );
    channel.register(
        SERVICE,
        "app_error",
        handler_fn(|_call| async move {
            Ok(OutgoingResponse::application_error("", "no such key"))
        }),
    );
    channel.register(
        SERVICE,
        "panic",
        handler_fn(|_call| async move {
            if true {
                panic!("handler bug");
            }
            Ok(OutgoingResponse::default())
        }),
    );
    channel.register(
        SERVICE,
        "json",
        handler_fn(|call| async move {
            let schemes = SchemeRegistry::default();
            let mut body: serde_json::Value = call.payload(&schemes)?.parse_json()?;
            body["seen"] = serde_json::Value::Bool(true);
            let payload = tributary_transport::Payload::json_body(&body)?;
            OutgoingResponse::from_payload(&payload, &schemes)
        }),
    );
}

/// A listening server with the standard handlers.
pub async fn server(name: &str) -> (Channel, HostPort) {
    let channel = Channel::new(ChannelConfig::local_network(name));
    register_handlers(&channel);
    let addr = channel.listen("127.0.0.1:0").await.expect("listen");
    (channel, addr)
}

/// A client channel that does not listen.
pub fn client() -> Channel {
    Channel::new(ChannelConfig::local_network("client"))
}

/// `count` distinct addresses nothing listens on.
pub async fn dead_addresses(count: usize) -> Vec<HostPort> {
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        listeners.push(
            tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind"),
        );
    }
    listeners
        .iter()
        .map(|listener| {
            let addr = listener.local_addr().expect("addr");
            HostPort::new(addr.ip(), addr.port())
        })
        .collect()
}

/// An address nothing listens on.
pub async fn dead_address() -> HostPort {
    dead_addresses(1).await[0]
}

/// Poll `condition` every 5ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// A loopback listener whose connections are driven frame by frame.
pub async fn raw_listener() -> (TcpListener, HostPort) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    (listener, HostPort::new(addr.ip(), addr.port()))
}

/// Remote end of a connection that writes whatever frames a test hands it.
pub struct RawPeer {
    stream: TcpStream,
    buf: BytesMut,
}

impl RawPeer {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.expect("accept");
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Next frame, or `None` once the other side has closed.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.buf).expect("valid frame") {
                return Some(frame);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) {
        let bytes = frame.encode().expect("encode frame");
        self.stream.write_all(&bytes).await.expect("write frame");
    }

    /// Read the init request and answer it after `delay`.
    pub async fn handshake_after(&mut self, delay: Duration) {
        let init = self.read_frame().await.expect("init request");
        assert_eq!(init.frame_type, FrameType::InitRequest);
        tokio::time::sleep(delay).await;
        let local = self.stream.local_addr().expect("addr").to_string();
        let payload = InitMessage::new(&local, "raw-peer")
            .encode()
            .expect("encode init");
        self.write_frame(&Frame::new(FrameType::InitResponse, init.id, payload))
            .await;
    }

    pub async fn handshake(&mut self) {
        self.handshake_after(Duration::ZERO).await;
    }

    /// Next call request, answering pings on the way.
    pub async fn next_call(&mut self) -> Frame {
        loop {
            let frame = self.read_frame().await.expect("call request");
            match frame.frame_type {
                FrameType::CallRequest => return frame,
                FrameType::PingRequest => {
                    self.write_frame(&Frame::empty(FrameType::PingResponse, frame.id))
                        .await;
                }
                _ => {}
            }
        }
    }

    /// Frames read until the other side closes the socket, or `None` if it is
    /// still open after `within`.
    pub async fn closed_within(&mut self, within: Duration) -> Option<Vec<Frame>> {
        tokio::time::timeout(within, async {
            let mut frames = Vec::new();
            while let Some(frame) = self.read_frame().await {
                frames.push(frame);
            }
            frames
        })
        .await
        .ok()
    }
}
