//! A client that sends a method out of the expected handshake order (e.g.
//! `Tune` where `StartOk` is expected) should be disconnected rather than
//! have the proxy silently wait forever or crash.

mod common;

use amqpprox::methods::{self, Tune};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn out_of_order_method_closes_the_connection() {
    let harness = common::Harness::new(common::StaticResolver::new());
    let proxy_addr = harness.spawn_single_connection_proxy().await;

    let mut client = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
    common::write_protocol_header(&mut client).await;

    let (header, _payload) = common::read_method(&mut client).await;
    assert!(header.is_connection_method(methods::METHOD_START));

    // A well-formed Tune frame is a protocol violation here: the connector
    // is waiting for StartOk.
    common::write_tune(
        &mut client,
        &Tune {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        },
    )
    .await;
    client.flush().await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(common::short_timeout(), client.read(&mut buf))
        .await
        .expect("proxy should close promptly, not hang")
        .expect("read should not error");
    assert_eq!(n, 0, "proxy should close the connection on a handshake order violation");
}
