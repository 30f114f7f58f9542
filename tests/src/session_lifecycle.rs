//! Session lifecycle integration tests
//!
//! Tests listener and association state transitions between a client and a
//! server session on loopback.

use std::time::Duration;

use csfb_sctp::{ClientSession, SessionError, ServerSession};
use integration_tests::{
    connected_pair, init_test_logging, test_sctp_config, wait_for_condition,
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT, LOOPBACK,
};
use tokio::time::timeout;

/// Test that an ephemeral listener port can be dialed
#[tokio::test]
async fn test_listener_port_zero_is_dialable() {
    init_test_logging();

    let mut server = ServerSession::with_config(test_sctp_config());
    let port = server.start_listener(LOOPBACK, 0).await.unwrap();
    assert_ne!(port, 0);

    let mut client = ClientSession::with_config(LOOPBACK, port, test_sctp_config());
    let (connected, accepted) = timeout(DEFAULT_TEST_TIMEOUT, async {
        tokio::join!(client.establish_conn(), server.accept_conn())
    })
    .await
    .expect("handshake timed out");

    connected.expect("client failed to connect");
    accepted.expect("server failed to accept");
    assert!(client.is_connected());
    assert!(server.connection_established());
    assert_eq!(client.local_addr().map(|addr| addr.port() != 0), Some(true));
}

/// Test that the association is accepted even when the client dials first
#[tokio::test]
async fn test_accept_after_client_connected() {
    init_test_logging();

    let mut server = ServerSession::with_config(test_sctp_config());
    let port = server.start_listener(LOOPBACK, 0).await.unwrap();

    let mut client = ClientSession::with_config(LOOPBACK, port, test_sctp_config());
    client.establish_conn().await.unwrap();

    timeout(DEFAULT_TEST_TIMEOUT, server.accept_conn())
        .await
        .expect("accept timed out")
        .unwrap();
    assert!(server.connection_established());
}

/// Test lifecycle errors on an unconnected client
#[tokio::test]
async fn test_client_requires_connection() {
    init_test_logging();

    let mut client = ClientSession::with_config(LOOPBACK, 1357, test_sctp_config());
    assert!(matches!(client.send(&[1]).await, Err(SessionError::NotConnected)));
    assert!(matches!(client.receive().await, Err(SessionError::NotConnected)));
    assert!(matches!(client.close_conn().await, Err(SessionError::NotConnected)));
}

/// Test lifecycle errors on a listening server with nothing accepted
#[tokio::test]
async fn test_server_requires_accepted_connection() {
    init_test_logging();

    let mut server = ServerSession::with_config(test_sctp_config());
    server.start_listener(LOOPBACK, 0).await.unwrap();

    assert!(!server.connection_established());
    assert!(matches!(
        server.receive_through_listener().await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        server.send_from_server(&[1]).await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(server.close_conn().await, Err(SessionError::NotConnected)));

    server.close_listener().await.unwrap();
}

/// Test that a second establish is rejected instead of replacing the first
#[tokio::test]
async fn test_establish_twice_rejected() {
    init_test_logging();

    let (mut client, _server) = connected_pair(test_sctp_config()).await.unwrap();
    assert!(matches!(
        client.establish_conn().await,
        Err(SessionError::AlreadyConnected)
    ));
    assert!(client.is_connected());
}

/// Test connect failure against a port nobody listens on
#[tokio::test]
async fn test_connect_to_unused_port_fails() {
    init_test_logging();

    // Reserve a port, then free it so nothing answers there
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();
    drop(socket);

    let mut config = test_sctp_config();
    config.connect_timeout = Duration::from_millis(500);
    let mut client = ClientSession::with_config(LOOPBACK, port, config);

    let result = timeout(DEFAULT_TEST_TIMEOUT, client.establish_conn())
        .await
        .expect("connect attempt did not finish");
    assert!(matches!(result, Err(SessionError::Connect(_))));
    assert!(!client.is_connected());
}

/// Test client close then re-establish against the same listener
#[tokio::test]
async fn test_client_close_and_reconnect() {
    init_test_logging();

    let (mut client, mut server) = connected_pair(test_sctp_config()).await.unwrap();

    client.close_conn().await.unwrap();
    assert!(!client.is_connected());
    assert!(matches!(client.send(&[1]).await, Err(SessionError::NotConnected)));
    assert!(matches!(client.receive().await, Err(SessionError::NotConnected)));

    server.close_conn().await.ok();
    assert!(server.is_listening());

    let (connected, accepted) = timeout(DEFAULT_TEST_TIMEOUT, async {
        tokio::join!(client.establish_conn(), server.accept_conn())
    })
    .await
    .expect("reconnect timed out");
    connected.unwrap();
    accepted.unwrap();

    client.send(&[9, 9]).await.unwrap();
    let received = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received[..], &[9, 9]);
}

/// Test that the server keeps listening after closing its connection
#[tokio::test]
async fn test_server_close_conn_keeps_listener() {
    init_test_logging();

    let (_client, mut server) = connected_pair(test_sctp_config()).await.unwrap();

    server.close_conn().await.unwrap();
    assert!(!server.connection_established());
    assert!(server.is_listening());
    assert!(matches!(
        server.send_from_server(&[1]).await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        server.receive_through_listener().await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(server.close_conn().await, Err(SessionError::NotConnected)));

    let port = server.local_addr().unwrap().port();
    let mut second = ClientSession::with_config(LOOPBACK, port, test_sctp_config());
    let (connected, accepted) = timeout(DEFAULT_TEST_TIMEOUT, async {
        tokio::join!(second.establish_conn(), server.accept_conn())
    })
    .await
    .unwrap();
    connected.unwrap();
    accepted.unwrap();
    assert!(server.connection_established());
}

/// Test that a second accept replaces the first association
#[tokio::test]
async fn test_reaccept_replaces_connection() {
    init_test_logging();

    let (mut first, mut server) = connected_pair(test_sctp_config()).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut second = ClientSession::with_config(LOOPBACK, port, test_sctp_config());
    let (connected, accepted) = timeout(DEFAULT_TEST_TIMEOUT, async {
        tokio::join!(second.establish_conn(), server.accept_conn())
    })
    .await
    .unwrap();
    connected.unwrap();
    accepted.unwrap();

    second.send(b"second").await.unwrap();
    let received = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received[..], b"second");

    // The replaced association was aborted, so the first client sees it fail
    let stale = timeout(DEFAULT_TEST_TIMEOUT, first.receive())
        .await
        .expect("aborted association was not reported");
    assert!(matches!(stale, Err(SessionError::Receive(_))));
}

/// Test that closing the listener from another task unblocks a pending accept
#[tokio::test]
async fn test_listener_shutdown_unblocks_accept() {
    init_test_logging();

    let mut server = ServerSession::with_config(test_sctp_config());
    server.start_listener(LOOPBACK, 0).await.unwrap();
    let shutdown = server.listener_shutdown_handle().unwrap();

    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.close();
    });

    let result = timeout(DEFAULT_TEST_TIMEOUT, server.accept_conn())
        .await
        .expect("accept stayed blocked after listener shutdown");
    assert!(matches!(result, Err(SessionError::Accept(_))));
    closer.await.unwrap();

    wait_for_condition(
        || {
            let listening = server.is_listening();
            async move { !listening }
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .unwrap();
}

/// Test that closing the listener also drops the accepted association
#[tokio::test]
async fn test_close_listener_while_serving() {
    init_test_logging();

    let (_client, mut server) = connected_pair(test_sctp_config()).await.unwrap();

    server.close_listener().await.unwrap();
    assert!(!server.is_listening());
    assert!(!server.connection_established());
    assert!(matches!(server.accept_conn().await, Err(SessionError::NotListening)));
    assert!(matches!(
        server.close_listener().await,
        Err(SessionError::NotListening)
    ));
}
