//! Retries across peers over loopback TCP.

mod common;

use std::time::Duration;

use common::{client, dead_address, dead_addresses, init_tracing, server, SERVICE};
use tributary_transport::{
    Channel, ChannelConfig, ErrorType, HandlerError, OutboundRequest, OutgoingResponse,
    RetryFlags, RetryOptions,
};

/// A server whose `work` method answers after `delay`.
async fn worker(delay: Duration) -> (Channel, tributary_transport::HostPort) {
    let channel = Channel::new(ChannelConfig::local_network("worker"));
    channel.register(
        SERVICE,
        "work",
        tributary_transport::handler_fn(move |call| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, HandlerError>(OutgoingResponse::ok("", call.args.arg3))
        }),
    );
    let addr = channel.listen("127.0.0.1:0").await.expect("listen");
    (channel, addr)
}

fn work(limit: u32) -> OutboundRequest {
    OutboundRequest::new("work")
        .with_body("job")
        .with_timeout(Duration::from_secs(3))
        .with_retry(
            RetryOptions::default()
                .with_limit(limit)
                .with_per_attempt_timeout(Duration::from_millis(150)),
        )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeouts_retry_until_a_prompt_peer() {
    init_tracing();
    let mut servers = Vec::new();
    for _ in 0..2 {
        servers.push(worker(Duration::from_secs(5)).await);
    }
    servers.push(worker(Duration::ZERO).await);
    let addrs: Vec<_> = servers.iter().map(|(_, addr)| *addr).collect();

    let client = client();
    let kv = client.sub_channel(SERVICE, addrs);
    let future = kv.send(work(4));
    let response = future.get().await.expect("a prompt peer answers");
    assert_eq!(&response.arg3()[..], b"job");
    assert!((1..=3).contains(&future.attempts()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_limit_bounds_attempts() {
    init_tracing();
    let mut servers = Vec::new();
    for _ in 0..3 {
        servers.push(worker(Duration::from_secs(5)).await);
    }
    let addrs: Vec<_> = servers.iter().map(|(_, addr)| *addr).collect();

    let client = client();
    let kv = client.sub_channel(SERVICE, addrs);
    let future = kv.send(work(2));
    let err = future.get().await.expect_err("every peer is slow");
    assert_eq!(err.error_type(), ErrorType::Timeout);
    assert_eq!(future.attempts(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ttl_is_shared_across_attempts() {
    init_tracing();
    let mut servers = Vec::new();
    for _ in 0..3 {
        servers.push(worker(Duration::from_secs(5)).await);
    }
    let addrs: Vec<_> = servers.iter().map(|(_, addr)| *addr).collect();

    let client = client();
    let kv = client.sub_channel(SERVICE, addrs);
    let started = tokio::time::Instant::now();
    let future = kv.send(
        OutboundRequest::new("work")
            .with_timeout(Duration::from_millis(300))
            .with_retry(RetryOptions::default().with_limit(10)),
    );
    let err = future.get().await.expect_err("budget exhausted");
    assert_eq!(err.error_type(), ErrorType::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(future.attempts() <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_errors_move_to_next_peer() {
    init_tracing();
    let (_server, live) = server("server").await;
    let dead = dead_address().await;

    let client = client();
    let kv = client.sub_channel(SERVICE, [dead, live]);
    for _ in 0..5 {
        let future = kv.send(OutboundRequest::new("echo").with_body("x"));
        let response = future.get().await.expect("live peer answers");
        assert_eq!(&response.arg3()[..], b"x");
        assert!(future.attempts() <= 2);
    }
    let dead_peer = client.peers().get(&dead);
    if let Some(dead_peer) = dead_peer {
        assert!(dead_peer.metrics().connection_failures >= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_retry_flag_sends_once() {
    init_tracing();
    let dead = dead_address().await;
    let client = client();
    let kv = client.sub_channel(SERVICE, [dead]);

    let future = kv.send(OutboundRequest::new("echo").with_retry_flags(RetryFlags::NEVER));
    let err = future.get().await.expect_err("nothing listening");
    assert_eq!(err.error_type(), ErrorType::NetworkError);
    assert_eq!(future.attempts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_header_overrides_options() {
    init_tracing();
    let dead = dead_addresses(2).await;
    let client = client();
    let kv = client.sub_channel(SERVICE, dead);

    let future = kv.send(OutboundRequest::new("echo").with_header("re", "n"));
    future.get().await.expect_err("nothing listening");
    assert_eq!(future.attempts(), 1);

    let future = kv.send(OutboundRequest::new("echo").with_header("re", "c"));
    let err = future.get().await.expect_err("nothing listening");
    assert_eq!(err.error_type(), ErrorType::NetworkError);
    assert_eq!(future.attempts(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_is_not_retried() {
    init_tracing();
    let (_a, addr_a) = server("a").await;
    let (_b, addr_b) = server("b").await;

    let client = client();
    let kv = client.sub_channel(SERVICE, [addr_a, addr_b]);
    let future = kv.send(OutboundRequest::new("busy"));
    let err = future.get().await.expect_err("busy");
    assert_eq!(err.error_type(), ErrorType::Busy);
    assert_eq!(future.attempts(), 1);

    let busy_peers: u64 = [addr_a, addr_b]
        .iter()
        .filter_map(|addr| client.peers().get(addr))
        .map(|peer| peer.metrics().busy_responses)
        .sum();
    assert_eq!(busy_peers, 1);
}
