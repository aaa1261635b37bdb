//! Unsolicited data from the peer reaching listeners and sessions.

use std::sync::Arc;

use bytes::Bytes;
use rstest::rstest;
use wireproxy::{
    Connection,
    ProxyConfig,
    completion::ExceptionKind,
    connection::{ConnectionEvent, ConsumerOptions},
    message::DestinationAddress,
    protocol::Segment,
    session::CallbackRegistration,
};
use wireproxy_testing::{
    LoggerHandle,
    MockPeer,
    RecordingCallback,
    RecordingListener,
    logger,
    replies,
};

async fn connect(peer: &Arc<MockPeer>) -> Connection {
    Connection::builder(peer.conversation())
        .config(ProxyConfig::default())
        .connect()
        .await
        .expect("connect")
}

#[tokio::test]
async fn connection_error_reaches_listeners() {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let listener = Arc::new(RecordingListener::new());
    connection.add_connection_listener(listener.clone());

    let delivered = peer
        .push(
            connection.conversation_id(),
            Segment::ASYNC_EXCEPTION,
            replies::async_exception(0, ExceptionKind::ConnectionLost, "link down"),
        )
        .await;

    assert!(delivered);
    assert_eq!(listener.wait_for_error().await, "connection lost: link down");
}

#[tokio::test]
async fn unmapped_error_code_is_reported_generically() {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let listener = Arc::new(RecordingListener::new());
    connection.add_connection_listener(listener.clone());

    peer.push(
        connection.conversation_id(),
        Segment::ASYNC_EXCEPTION,
        replies::async_exception(0, ExceptionKind::DestinationLocked, "odd"),
    )
    .await;

    let error = listener.wait_for_error().await;
    assert!(error.starts_with("internal error"), "{error}");
}

#[rstest]
#[case(1, ConnectionEvent::EngineQuiescing)]
#[case(3, ConnectionEvent::LinkLost)]
#[tokio::test]
async fn engine_events_reach_listeners(#[case] code: i16, #[case] expected: ConnectionEvent) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let listener = Arc::new(RecordingListener::new());
    connection.add_connection_listener(listener.clone());

    peer.push(connection.conversation_id(), Segment::EVENT_OCCURRED, replies::event(code))
        .await;

    assert_eq!(listener.wait_for_event().await, expected);
}

#[tokio::test]
async fn session_error_reaches_its_callback() {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let session = connection
        .create_consumer_session(&DestinationAddress::new("orders"), &ConsumerOptions::default())
        .await
        .expect("consumer");
    let callback = Arc::new(RecordingCallback::new());
    session
        .register_async_consumer_callback(CallbackRegistration::new(callback.clone()))
        .await
        .expect("register");
    let listener = Arc::new(RecordingListener::new());
    connection.add_connection_listener(listener.clone());

    peer.push(
        connection.conversation_id(),
        Segment::ASYNC_EXCEPTION,
        replies::async_exception(session.proxy_id().as_i16(), ExceptionKind::SessionDropped, "gone"),
    )
    .await;

    assert_eq!(callback.wait_for_error().await, "session dropped: gone");
    assert!(listener.errors().is_empty());
}

#[rstest]
#[tokio::test]
async fn connection_error_without_listener_is_logged(mut logger: LoggerHandle) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;

    peer.push(
        connection.conversation_id(),
        Segment::ASYNC_EXCEPTION,
        replies::async_exception(0, ExceptionKind::ConnectionLost, "link down"),
    )
    .await;

    assert!(logger.contains(log::Level::Warn, "has no listener"));
}

#[rstest]
#[tokio::test]
async fn unexpected_push_is_dropped(mut logger: LoggerHandle) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;

    peer.push(connection.conversation_id(), Segment::SEND_CONN_MSG, Bytes::new())
        .await;

    assert!(logger.contains(log::Level::Warn, "unexpected push"));
    assert!(!connection.is_closed());
}

#[rstest]
#[tokio::test]
async fn truncated_push_is_logged(mut logger: LoggerHandle) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;

    peer.push(
        connection.conversation_id(),
        Segment::PROXY_MESSAGE,
        Bytes::from_static(&[0, 1]),
    )
    .await;

    assert!(logger.contains(log::Level::Warn, "failed to handle push"));
}
