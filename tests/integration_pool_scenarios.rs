//! Pooled connection handler against a real TCP echo server: checkout,
//! shared-mode reuse, and isolated-mode exclusivity.

use rmpv::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_msgrpc::client::{PooledConnectionHandler, ReconnectPolicy};
use tokio_msgrpc::server::dispatcher::Dispatcher;
use tokio_msgrpc::transport::stream::{accept_stream, StreamClient};
use tokio_msgrpc::transport::ConnectOptions;
use tokio_msgrpc::{MethodResolver, RpcError};

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn("echo", Some(1), false, |_conn, _msgid, params| {
            let value = params[0].clone();
            async move { Ok(value) }
        });
        let resolver: Arc<dyn MethodResolver> = Arc::new(dispatcher);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accept_stream(stream, resolver.clone(), false, None);
        }
    });

    addr
}

#[tokio::test]
async fn shared_mode_round_trips_through_a_checked_out_connection() {
    let addr = spawn_echo_server().await;
    let addr_string = addr.to_string();
    let connector = Arc::new(move || {
        let addr = addr_string.clone();
        Box::pin(async move { StreamClient::connect_tcp(&addr, ConnectOptions::default(), None, None).await })
            as std::pin::Pin<Box<dyn std::future::Future<Output = Result<_, RpcError>> + Send>>
    });

    let pool = PooledConnectionHandler::new(connector, Some(2), false, ReconnectPolicy::default());
    let result = pool.create_request("echo", Value::from("hi")).await.unwrap();
    assert_eq!(result.as_str(), Some("hi"));
}

#[tokio::test]
async fn isolated_mode_returns_the_connection_to_the_pool_on_checkout_drop() {
    let addr = spawn_echo_server().await;
    let addr_string = addr.to_string();
    let connector = Arc::new(move || {
        let addr = addr_string.clone();
        Box::pin(async move { StreamClient::connect_tcp(&addr, ConnectOptions::default(), None, None).await })
            as std::pin::Pin<Box<dyn std::future::Future<Output = Result<_, RpcError>> + Send>>
    });

    let pool = PooledConnectionHandler::new(connector, Some(1), true, ReconnectPolicy::default());

    {
        let checkout = pool.checkout().await;
        let result = checkout.create_request("echo", Value::from("first")).await.unwrap();
        assert_eq!(result.as_str(), Some("first"));
    }

    // The single connection should be back in the ready queue now that the
    // isolated checkout was dropped.
    let checkout = pool.checkout().await;
    let result = checkout.create_request("echo", Value::from("second")).await.unwrap();
    assert_eq!(result.as_str(), Some("second"));
}
