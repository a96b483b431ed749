//! A vhost with its total connection limit set to zero should be closed
//! with a resource-error `Close` rather than routed to a backend.

mod common;

use amqpprox::connector::REPLY_RESOURCE_ERROR;
use amqpprox::methods::{self, Close};

#[tokio::test]
async fn limited_vhost_is_closed_with_resource_error() {
    let harness = common::Harness::new(common::StaticResolver::new());
    harness.limiters.add_total_connection_limiter("/limited", 0);

    let proxy_addr = harness.spawn_single_connection_proxy().await;

    let mut client = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
    common::write_protocol_header(&mut client).await;

    let (header, _payload) = common::read_method(&mut client).await;
    assert!(header.is_connection_method(methods::METHOD_START));

    common::write_start_ok(&mut client, "PLAIN", b"\0guest\0guest").await;

    let (header, payload) = common::read_method(&mut client).await;
    assert!(header.is_connection_method(methods::METHOD_TUNE));
    let tune = methods::Tune::decode(&payload).unwrap();

    common::write_tune_ok(&mut client, &tune).await;
    common::write_open(&mut client, "/limited").await;

    let (header, payload) = tokio::time::timeout(common::short_timeout(), common::read_method(&mut client))
        .await
        .expect("proxy should close promptly rather than hang during the admission sleep");
    assert!(header.is_connection_method(methods::METHOD_CLOSE));
    let close = Close::decode(&payload).unwrap();
    assert_eq!(close.reply_code, REPLY_RESOURCE_ERROR);
}
