//! End-to-end scenarios over the stream (TCP) transport, matching the
//! concrete examples enumerated for this kind of runtime: echo, dict
//! mutation, array-params sum, notification, a failing method, and a
//! mid-request connection loss.

use rmpv::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_msgrpc::client::{ReconnectPolicy, SingleConnectionHandler};
use tokio_msgrpc::server::dispatcher::Dispatcher;
use tokio_msgrpc::transport::stream::{accept_stream, StreamClient, StreamHandle};
use tokio_msgrpc::transport::ConnectOptions;
use tokio_msgrpc::{MethodResolver, RpcError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_echo_server() -> std::net::SocketAddr {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn("echo", Some(1), false, |_conn, _msgid, params| {
            let value = params[0].clone();
            async move { Ok(value) }
        });
        dispatcher.register_fn("insert_key", Some(1), false, |_conn, _msgid, params| {
            let mut dict = params[0].clone();
            if let Value::Map(entries) = &mut dict {
                entries.push((Value::from("new_key"), Value::from(1)));
            }
            async move { Ok(dict) }
        });
        dispatcher.register_fn("sum", Some(1), false, |_conn, _msgid, params| {
            let items = params[0].as_array().cloned().unwrap_or_default();
            async move {
                let total: i64 = items.iter().filter_map(Value::as_i64).sum();
                Ok(Value::from(total))
            }
        });
        dispatcher.register_fn("fail", Some(0), false, |_conn, _msgid, _params| async move {
            Err(Value::from("method failed on purpose"))
        });
        dispatcher.register_fn("wait", Some(1), false, |_conn, _msgid, params| {
            let seconds = params[0].as_i64().unwrap_or(0);
            async move {
                tokio::time::sleep(Duration::from_secs(seconds as u64)).await;
                Ok(Value::from("done"))
            }
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
async fn echo_resolves_to_the_same_value() {
    let addr = spawn_echo_server().await;
    let client = StreamClient::connect_tcp(&addr.to_string(), ConnectOptions::default(), None, None)
        .await
        .unwrap();

    let result = client.create_request("echo", Value::from("hi")).await.unwrap();
    assert_eq!(result.as_str(), Some("hi"));
}

#[tokio::test]
async fn dict_echo_gains_the_server_inserted_key() {
    let addr = spawn_echo_server().await;
    let client = StreamClient::connect_tcp(&addr.to_string(), ConnectOptions::default(), None, None)
        .await
        .unwrap();

    let request = Value::Map(vec![(Value::from("A"), Value::from(1234))]);
    let result = client.create_request("insert_key", request).await.unwrap();

    let entries = result.as_map().unwrap();
    assert!(entries.contains(&(Value::from("A"), Value::from(1234))));
    assert!(entries.contains(&(Value::from("new_key"), Value::from(1))));
}

#[tokio::test]
async fn sum_with_array_params() {
    let addr = spawn_echo_server().await;
    let client = StreamClient::connect_tcp(&addr.to_string(), ConnectOptions::default(), None, None)
        .await
        .unwrap();

    let result = client
        .create_request("sum", Value::Array(vec![Value::from(2), Value::from(5)]))
        .await
        .unwrap();
    assert_eq!(result.as_i64(), Some(7));
}

#[tokio::test]
async fn notification_leaves_no_reply_on_the_wire() {
    let addr = spawn_echo_server().await;
    let client = StreamClient::connect_tcp(&addr.to_string(), ConnectOptions::default(), None, None)
        .await
        .unwrap();

    client
        .create_notification("notify", Value::from("NOTIFICATION"))
        .await
        .unwrap();
}

#[tokio::test]
async fn failing_request_resolves_as_a_response_error() {
    let addr = spawn_echo_server().await;
    let client = StreamClient::connect_tcp(&addr.to_string(), ConnectOptions::default(), None, None)
        .await
        .unwrap();

    let result = client.create_request("fail", Value::Nil).await;
    assert!(matches!(result, Err(RpcError::Response(_))));
}

#[tokio::test]
async fn dropping_the_connection_mid_request_fails_with_connection_closed_not_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Accept the connection, read nothing back, then drop it — simulating
        // the peer process dying mid-request.
        drop(stream);
    });

    let client = StreamClient::connect_tcp(&addr.to_string(), ConnectOptions::default(), None, None)
        .await
        .unwrap();

    let result = client.create_request("wait", Value::from(3)).await;
    assert!(matches!(result, Err(RpcError::Connection(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn echo_resolves_over_a_unix_domain_socket() {
    use tokio::net::UnixListener;

    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("tokio-msgrpc.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    tokio::spawn(async move {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn("echo", Some(1), false, |_conn, _msgid, params| {
            let value = params[0].clone();
            async move { Ok(value) }
        });
        let resolver: Arc<dyn MethodResolver> = Arc::new(dispatcher);

        let (stream, _) = listener.accept().await.unwrap();
        accept_stream(stream, resolver, false, None);
    });

    let client = StreamClient::connect_unix(
        socket_path.to_str().unwrap(),
        ConnectOptions::default(),
        None,
        None,
    )
    .await
    .unwrap();

    let result = client.create_request("echo", Value::from("hi")).await.unwrap();
    assert_eq!(result.as_str(), Some("hi"));
}

#[tokio::test]
async fn single_connection_handler_reconnects_after_the_server_restarts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let addr_string = addr.to_string();

    // Start the real listener slightly after the handler begins retrying.
    let bind_addr = addr_string.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = TcpListener::bind(&bind_addr).await.unwrap();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn("echo", Some(1), false, |_conn, _msgid, params| {
            let value = params[0].clone();
            async move { Ok(value) }
        });
        let resolver: Arc<dyn MethodResolver> = Arc::new(dispatcher);
        let (stream, _) = listener.accept().await.unwrap();
        accept_stream(stream, resolver, false, None);
    });

    let connector = move || {
        let addr = addr_string.clone();
        Box::pin(async move {
            StreamClient::connect_tcp(&addr, ConnectOptions::default(), None, None).await
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<StreamHandle, RpcError>> + Send>>
    };

    let handler = SingleConnectionHandler::spawn(Arc::new(connector), ReconnectPolicy::default());
    handler.wait_for_connection().await.unwrap();

    let result = handler.create_request("echo", Value::from("hi")).await.unwrap();
    assert_eq!(result.as_str(), Some("hi"));
}
