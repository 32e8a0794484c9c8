//! Multicast echo scenario: two servers join the same group and each
//! answers a single client request; the completion resolves once the
//! aggregation window elapses with both responses collected.

use rmpv::Value;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_msgrpc::server;
use tokio_msgrpc::server::dispatcher::Dispatcher;
use tokio_msgrpc::transport::multicast::MulticastClient;
use tokio_msgrpc::MethodResolver;

fn echo_resolver() -> Arc<dyn MethodResolver> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register_fn("echo", Some(1), false, |_conn, _msgid, params| {
        let value = params[0].clone();
        async move { Ok(value) }
    });
    Arc::new(dispatcher)
}

#[tokio::test]
async fn two_servers_in_the_group_both_answer_one_request() {
    let group: Ipv4Addr = "239.5.6.7".parse().unwrap();
    let port = 27901;

    let _server_a = server::serve_multicast(group, port, 1, echo_resolver(), false)
        .await
        .unwrap();
    let _server_b = server::serve_multicast(group, port, 1, echo_resolver(), false)
        .await
        .unwrap();

    let client = MulticastClient::join(group, port, 1, None, false).await.unwrap();

    let result = client
        .create_request("echo", Value::from("hi"), Duration::from_millis(500))
        .await
        .unwrap();
    let responses = result.as_array().unwrap();
    assert_eq!(responses.len(), 2);
    for value in responses {
        assert_eq!(value.as_str(), Some("hi"));
    }
}
