//! Message exchange integration tests
//!
//! Tests SGs payload delivery in both directions and receive size limits.

use csfb_sctp::{ClientSession, SctpConfig, ServerSession, SessionError, SNDRCVINFO_LEN};
use integration_tests::{
    connected_pair, init_test_logging, test_sctp_config, DEFAULT_TEST_TIMEOUT, LOOPBACK,
};
use tokio::time::timeout;

/// Test the basic gateway to VLR exchange on an ephemeral port
#[tokio::test]
async fn test_client_to_server_basic() {
    init_test_logging();

    let mut server = ServerSession::with_config(test_sctp_config());
    let port = server.start_listener(LOOPBACK, 0).await.unwrap();

    let mut client = ClientSession::with_config(LOOPBACK, port, test_sctp_config());
    let (connected, accepted) = timeout(DEFAULT_TEST_TIMEOUT, async {
        tokio::join!(client.establish_conn(), server.accept_conn())
    })
    .await
    .unwrap();
    connected.unwrap();
    accepted.unwrap();

    client.send(&[1, 2, 3]).await.unwrap();
    assert!(client.data_io_subscribed());

    let received = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received[..], &[1, 2, 3]);
}

/// Test server to client delivery
#[tokio::test]
async fn test_server_to_client() {
    init_test_logging();

    let (mut client, mut server) = connected_pair(test_sctp_config()).await.unwrap();

    let payload = [0x09, 0x01, 0x08, 0x29, 0x10, 0x10, 0x32, 0x54, 0x76, 0x98];
    server.send_from_server(&payload).await.unwrap();
    assert!(server.data_io_subscribed());

    let received = timeout(DEFAULT_TEST_TIMEOUT, client.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received[..], &payload);
}

/// Test that messages keep their boundaries and order
#[tokio::test]
async fn test_messages_preserve_boundaries_and_order() {
    init_test_logging();

    let (mut client, mut server) = connected_pair(test_sctp_config()).await.unwrap();

    let messages: Vec<Vec<u8>> = (1..=5u8).map(|n| vec![n; n as usize * 10]).collect();
    for message in &messages {
        client.send(message).await.unwrap();
    }

    for expected in &messages {
        let received = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..], &expected[..]);
    }
}

/// Test request/response in both directions on one association
#[tokio::test]
async fn test_request_response() {
    init_test_logging();

    let (mut client, mut server) = connected_pair(test_sctp_config()).await.unwrap();

    for round in 0..3u8 {
        client.send(&[0x01, round]).await.unwrap();
        let request = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&request[..], &[0x01, round]);

        server.send_from_server(&[0x02, round]).await.unwrap();
        let response = timeout(DEFAULT_TEST_TIMEOUT, client.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&response[..], &[0x02, round]);
    }
}

/// Test payloads from one byte up to the largest that fits the record buffer
#[tokio::test]
async fn test_payload_sizes_up_to_capacity() {
    init_test_logging();

    let config = test_sctp_config();
    let max_payload = config.receive_capacity - SNDRCVINFO_LEN;
    assert_eq!(max_payload, 222);

    let (mut client, mut server) = connected_pair(config).await.unwrap();

    for size in [1, 2, 100, max_payload - 1, max_payload] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        client.send(&payload).await.unwrap();

        let received = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), size);
        assert_eq!(&received[..], &payload[..]);
    }
}

/// Test that an oversized record is reported instead of truncated
#[tokio::test]
async fn test_server_rejects_oversized_message() {
    init_test_logging();

    let config = test_sctp_config();
    let capacity = config.receive_capacity;
    let (mut client, mut server) = connected_pair(config).await.unwrap();

    client.send(&vec![0xaa; capacity]).await.unwrap();
    let result = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
        .await
        .unwrap();
    match result {
        Err(SessionError::MessageTooLarge { size, capacity: limit }) => {
            assert_eq!(size, capacity + SNDRCVINFO_LEN);
            assert_eq!(limit, capacity);
        }
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }

    // The oversized message was consumed; the association still works
    client.send(&[7]).await.unwrap();
    let next = timeout(DEFAULT_TEST_TIMEOUT, server.receive_through_listener())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&next[..], &[7]);
}

/// Test the client side size limit and a raised capacity
#[tokio::test]
async fn test_client_receive_capacity() {
    init_test_logging();

    let config = SctpConfig {
        receive_capacity: 512,
        ..test_sctp_config()
    };
    let (mut client, mut server) = connected_pair(config).await.unwrap();

    let fits = vec![0x55; 512];
    server.send_from_server(&fits).await.unwrap();
    let received = timeout(DEFAULT_TEST_TIMEOUT, client.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), 512);

    server.send_from_server(&vec![0x66; 513]).await.unwrap();
    let result = timeout(DEFAULT_TEST_TIMEOUT, client.receive()).await.unwrap();
    assert!(matches!(
        result,
        Err(SessionError::MessageTooLarge {
            size: 513,
            capacity: 512
        })
    ));
}

/// Test that empty payloads are refused locally
#[tokio::test]
async fn test_empty_payload_rejected() {
    init_test_logging();

    let (mut client, mut server) = connected_pair(test_sctp_config()).await.unwrap();
    assert!(matches!(client.send(&[]).await, Err(SessionError::Transmit(_))));
    assert!(matches!(
        server.send_from_server(&[]).await,
        Err(SessionError::Transmit(_))
    ));
    assert!(client.is_connected());
}

/// Test that a receive surfaces the peer closing the association
#[tokio::test]
async fn test_receive_after_peer_close() {
    init_test_logging();

    let (mut client, mut server) = connected_pair(test_sctp_config()).await.unwrap();

    server.close_conn().await.unwrap();
    let result = timeout(DEFAULT_TEST_TIMEOUT, client.receive())
        .await
        .expect("peer close was not reported");
    assert!(matches!(result, Err(SessionError::Receive(_))));
}
