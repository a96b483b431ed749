//! End-to-end: a client opens a vhost that's mapped directly to a backend,
//! the proxy completes both sides of the handshake, and application frames
//! flow transparently once `Open` is reached.

mod common;

use std::net::IpAddr;

use amqpprox::backend::Backend;
use amqpprox::frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn client_and_broker_reach_open_and_forward_frames() {
    let (broker_addr, broker_stream_rx) = common::spawn_fake_broker().await;

    let resolver = common::StaticResolver::new().with("127.0.0.1", vec![broker_addr]);
    let harness = common::Harness::new(resolver);
    harness.route_vhost_to_backend(
        "/prod",
        Backend::new(
            "b1",
            "dc1",
            "127.0.0.1",
            "127.0.0.1".parse::<IpAddr>().unwrap(),
            broker_addr.port(),
        ),
    );

    let proxy_addr = harness.spawn_single_connection_proxy().await;

    let broker_task = tokio::spawn(async move {
        let mut broker_stream = broker_stream_rx.await.unwrap();
        common::run_fake_broker_handshake(&mut broker_stream).await;
        broker_stream
    });

    let mut client = tokio::time::timeout(
        common::short_timeout(),
        common::run_client_handshake(proxy_addr, "/prod"),
    )
    .await
    .expect("handshake should complete")
    ;

    let mut broker_stream = tokio::time::timeout(common::short_timeout(), broker_task)
        .await
        .unwrap()
        .unwrap();

    // Past `Open`, everything is opaque: a basic.publish-shaped method
    // frame from the client should land on the broker socket byte for
    // byte, and a reply from the broker should land back on the client.
    let client_frame = frame::encode_to_bytes(frame::FRAME_TYPE_METHOD, 1, b"basic.publish-stub", frame::DEFAULT_MAX_FRAME_SIZE).unwrap();
    client.write_all(&client_frame).await.unwrap();

    let mut received = vec![0u8; client_frame.len()];
    broker_stream.read_exact(&mut received).await.unwrap();
    assert_eq!(received, client_frame.to_vec());

    let broker_frame = frame::encode_to_bytes(frame::FRAME_TYPE_METHOD, 1, b"basic.deliver-stub", frame::DEFAULT_MAX_FRAME_SIZE).unwrap();
    broker_stream.write_all(&broker_frame).await.unwrap();

    let mut received = vec![0u8; broker_frame.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, broker_frame.to_vec());
}
