//! End-to-end calls over loopback TCP.

mod common;

use std::time::Duration;

use common::{client, init_tracing, server, SERVICE};
use serde_json::json;
use tributary_transport::{
    ChannelConfig, ChecksumType, ConnectionConfig, ErrorType, OutboundRequest, Payload,
    RetryFlags, SchemeRegistry, TraceContext, MAX_PAYLOAD_SIZE,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_trip() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);

    let trace = TraceContext::new_root();
    let response = kv
        .send(
            OutboundRequest::new("echo")
                .with_arg2("app-headers")
                .with_body("hello")
                .with_trace(trace),
        )
        .get()
        .await
        .expect("echo");

    assert_eq!(&response.arg1()[..], b"echo");
    assert_eq!(&response.arg2()[..], b"app-headers");
    assert_eq!(&response.arg3()[..], b"hello");
    assert_eq!(response.trace(), trace);
    assert!(!response.is_application_error());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_and_single_byte_bodies() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);

    for body in [&b""[..], &b"x"[..]] {
        let response = kv
            .send(OutboundRequest::new("echo").with_body(body.to_vec()))
            .get()
            .await
            .expect("echo");
        assert_eq!(&response.arg3()[..], body);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_payload_spans_many_frames() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let config = ChannelConfig::local_network("client").with_connection(
        ConnectionConfig::local_network().with_checksum(ChecksumType::Crc32),
    );
    let client = tributary_transport::Channel::new(config);
    let kv = client.sub_channel(SERVICE, [addr]);

    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    assert!(body.len() > 3 * MAX_PAYLOAD_SIZE);
    let response = kv
        .send(
            OutboundRequest::new("echo")
                .with_body(body.clone())
                .with_timeout(Duration::from_secs(5)),
        )
        .get()
        .await
        .expect("echo");
    assert_eq!(response.arg3().len(), body.len());
    assert_eq!(&response.arg3()[..], &body[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_json_payload() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);
    let schemes = SchemeRegistry::default();

    let payload = Payload::json_body(&json!({"key": "user-1"})).expect("payload");
    let request = OutboundRequest::new("json")
        .with_payload(&payload, &schemes)
        .expect("encode");
    let response = kv.send(request).get().await.expect("json");

    let body: serde_json::Value = response
        .payload(&schemes)
        .expect("decode")
        .parse_json()
        .expect("json body");
    assert_eq!(body, json!({"key": "user-1", "seen": true}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_application_error_is_a_response() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);

    let response = kv
        .send(OutboundRequest::new("app_error"))
        .get()
        .await
        .expect("application errors are responses");
    assert!(response.is_application_error());
    assert_eq!(&response.arg3()[..], b"no such key");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_error_code_reaches_caller() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);

    let future = kv.send(OutboundRequest::new("busy"));
    let err = future.get().await.expect_err("busy");
    assert_eq!(err.error_type(), ErrorType::Busy);
    assert_eq!(future.attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_panic_leaves_connection_usable() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);

    let err = kv
        .send(OutboundRequest::new("panic"))
        .get()
        .await
        .expect_err("panic");
    assert_eq!(err.error_type(), ErrorType::UnexpectedError);

    let response = kv
        .send(OutboundRequest::new("echo").with_body("still here"))
        .get()
        .await
        .expect("echo after panic");
    assert_eq!(&response.arg3()[..], b"still here");
    assert_eq!(client.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_method_and_service() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();

    let err = client
        .sub_channel(SERVICE, [addr])
        .send(OutboundRequest::new("missing"))
        .get()
        .await
        .expect_err("unknown method");
    assert_eq!(err.error_type(), ErrorType::BadRequest);

    let err = client
        .sub_channel("nobody", [addr])
        .send(OutboundRequest::new("echo"))
        .get()
        .await
        .expect_err("unknown service");
    assert_eq!(err.error_type(), ErrorType::BadRequest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_handler_times_out() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);

    let started = tokio::time::Instant::now();
    let future = kv.send(
        OutboundRequest::new("sleep")
            .with_body("2000")
            .with_timeout(Duration::from_millis(100))
            .with_retry_flags(RetryFlags::NEVER),
    );
    let err = future.get().await.expect_err("timeout");
    assert_eq!(err.error_type(), ErrorType::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(future.attempts(), 1);

    let response = kv
        .send(OutboundRequest::new("echo").with_body("after"))
        .get()
        .await
        .expect("connection survives a timeout");
    assert_eq!(&response.arg3()[..], b"after");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_share_one_connection() {
    init_tracing();
    let (_server, addr) = server("server").await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [addr]);

    // Establish the connection first so every call reuses it.
    kv.send(OutboundRequest::new("echo")).get().await.expect("warm up");

    let futures: Vec<_> = (0..200)
        .map(|i| kv.send(OutboundRequest::new("echo").with_body(i.to_string())))
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        let response = future.get().await.expect("echo");
        assert_eq!(&response.arg3()[..], i.to_string().as_bytes());
    }
    assert_eq!(client.connection_count(), 1);
}
