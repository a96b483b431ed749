//! A DNS-based backend that resolves to more than one endpoint should
//! fail over to the next endpoint when the first refuses the connection,
//! rather than giving up after one attempt.

mod common;

use std::net::IpAddr;

use amqpprox::backend::Backend;

#[tokio::test]
async fn connects_to_second_endpoint_when_first_refuses() {
    // A loopback port nothing is listening on: bind then immediately drop
    // so the OS reports connection-refused rather than a hanging connect.
    let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let (broker_addr, broker_stream_rx) = common::spawn_fake_broker().await;

    let resolver = common::StaticResolver::new().with("broker.failover.test", vec![dead_addr, broker_addr]);
    let harness = common::Harness::new(resolver);
    harness.route_vhost_to_backend(
        "/prod",
        Backend::new(
            "b1",
            "dc1",
            "broker.failover.test",
            // `ip`/`port` on a dns_based backend are informational only -
            // resolution drives the real target via `resolve_target`.
            "127.0.0.1".parse::<IpAddr>().unwrap(),
            0,
        )
        .with_dns_based(true),
    );

    let proxy_addr = harness.spawn_single_connection_proxy().await;

    let broker_task = tokio::spawn(async move {
        let mut broker_stream = broker_stream_rx.await.unwrap();
        common::run_fake_broker_handshake(&mut broker_stream).await;
    });

    tokio::time::timeout(common::short_timeout(), common::run_client_handshake(proxy_addr, "/prod"))
        .await
        .expect("handshake should complete despite the first endpoint refusing");

    tokio::time::timeout(common::short_timeout(), broker_task)
        .await
        .expect("broker side should have completed")
        .unwrap();
}
