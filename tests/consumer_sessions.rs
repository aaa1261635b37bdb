//! Consumer session state machine, callbacks and flow control.

use std::{sync::Arc, time::Duration};

use rstest::{fixture, rstest};
use wireproxy::{
    Connection,
    ConsumerSession,
    Message,
    ProxyConfig,
    ProxyError,
    Reliability,
    completion::ExceptionKind,
    connection::{ConsumerOptions, ProducerOptions},
    message::{DestinationAddress, MessageHandle, ReceiveTimeout},
    protocol::Segment,
    registry::ProxyId,
    session::{CallbackRegistration, SessionState},
};
use wireproxy_testing::{
    InCallback,
    LoggerHandle,
    MockPeer,
    RecordingCallback,
    eventually,
    logger,
    replies,
    within,
};

#[fixture]
fn queue() -> DestinationAddress { DestinationAddress::new("orders") }

async fn connect(peer: &Arc<MockPeer>) -> Connection {
    Connection::builder(peer.conversation())
        .config(ProxyConfig::default())
        .connect()
        .await
        .expect("connect")
}

fn locked(value: u8) -> Message {
    Message::new(Reliability::ReliablePersistent, vec![value])
        .with_handle(MessageHandle::new(1, u64::from(value)))
}

async fn push_message(peer: &MockPeer, session: &ConsumerSession, batch: u16, message: &Message) {
    let delivered = peer
        .push(
            session.connection().conversation_id(),
            Segment::PROXY_MESSAGE,
            replies::proxy_message(session.proxy_id(), batch, message),
        )
        .await;
    assert!(delivered, "conversation has no listener");
}

async fn registered_session(
    peer: &Arc<MockPeer>,
    destination: &DestinationAddress,
    registration: impl FnOnce(CallbackRegistration) -> CallbackRegistration,
    callback: &Arc<RecordingCallback>,
) -> ConsumerSession {
    let connection = connect(peer).await;
    let session = connection
        .create_consumer_session(destination, &ConsumerOptions::default())
        .await
        .expect("consumer");
    session
        .register_async_consumer_callback(registration(CallbackRegistration::new(
            callback.clone(),
        )))
        .await
        .expect("register");
    session.start().await.expect("start");
    session
}

#[rstest]
#[tokio::test]
async fn failed_creation_buries_read_ahead_queue(queue: DestinationAddress, mut logger: LoggerHandle) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    peer.reply_once(
        Segment::CREATE_CONSUMER_SESS,
        replies::exception(ExceptionKind::NotAuthorised, "no access"),
    );
    let options = ConsumerOptions {
        read_ahead: true,
        ..ConsumerOptions::default()
    };

    let err = connection
        .create_consumer_session(&queue, &options)
        .await
        .expect_err("creation rejected");
    assert!(matches!(err, ProxyError::NotAuthorised(_)));
    let group = connection.existing_queue_group().expect("group created");
    assert!(group.is_empty());
    assert!(connection.consumer_sessions().is_empty());

    let stray = locked(1);
    assert!(
        peer.push(
            connection.conversation_id(),
            Segment::PROXY_MESSAGE,
            replies::proxy_message(ProxyId::new(1), 0, &stray),
        )
        .await
    );
    assert!(logger.contains(log::Level::Warn, "for unknown ProxyId(1)"));
}

#[rstest]
#[tokio::test]
async fn read_ahead_messages_are_received_locally(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let options = ConsumerOptions {
        read_ahead: true,
        ..ConsumerOptions::default()
    };
    let session = connection
        .create_consumer_session(&queue, &options)
        .await
        .expect("consumer");
    assert!(session.is_read_ahead());
    session.start().await.expect("start");

    let message = locked(7);
    push_message(&peer, &session, 0, &message).await;

    let received = session.receive_no_wait(None).await.expect("receive");
    assert_eq!(received, Some(message));
    assert_eq!(peer.count(Segment::RECEIVE_SESS_MSG), 0);
    assert_eq!(session.receive_no_wait(None).await.expect("receive"), None);
}

#[rstest]
#[tokio::test]
async fn receive_without_read_ahead_flows(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");
    let message = locked(3);
    peer.reply_once(
        Segment::RECEIVE_SESS_MSG,
        replies::received(Segment::RECEIVE_SESS_MSG, Some(&message)),
    );

    let received = session.receive_no_wait(None).await.expect("receive");

    assert_eq!(received, Some(message));
    assert_eq!(peer.count(Segment::RECEIVE_SESS_MSG), 1);
}

#[rstest]
#[tokio::test]
async fn synchronous_receive_is_rejected_while_registered(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let callback = Arc::new(RecordingCallback::new());
    let session = registered_session(&peer, &queue, |r| r, &callback).await;

    let err = session.receive_no_wait(None).await.expect_err("registered");
    assert!(matches!(err, ProxyError::IncorrectCall(_)));
}

#[rstest]
#[tokio::test]
async fn registering_while_started_is_rejected(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let callback = Arc::new(RecordingCallback::new());
    let session = registered_session(&peer, &queue, |r| r, &callback).await;

    let err = session
        .register_async_consumer_callback(CallbackRegistration::new(callback.clone()))
        .await
        .expect_err("started");
    assert!(matches!(err, ProxyError::IncorrectCall(_)));
    let err = session
        .deregister_async_consumer_callback()
        .await
        .expect_err("started");
    assert!(matches!(err, ProxyError::IncorrectCall(_)));
}

#[rstest]
#[tokio::test]
async fn active_message_limit_withholds_delivery(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let callback = Arc::new(RecordingCallback::new());
    let session = registered_session(&peer, &queue, |r| r.max_active_messages(5), &callback).await;

    for value in 0..6 {
        push_message(&peer, &session, 0, &locked(value)).await;
    }
    let delivered = callback.wait_for_messages(5).await;
    assert_eq!(delivered.len(), 5);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(callback.messages().len(), 5);
    let proxy_queue = session.proxy_queue().expect("queue");
    assert_eq!(proxy_queue.buffered(), 1);
    assert_eq!(proxy_queue.outstanding(), 5);

    let first = delivered[0].handle.expect("handle");
    session.delete_set(&[first], None).await.expect("delete");
    assert_eq!(peer.count(Segment::DELETE_SET), 1);

    let all = callback.wait_for_messages(6).await;
    assert_eq!(all[5], locked(5));
    assert_eq!(proxy_queue.outstanding(), 5);
}

#[rstest]
#[tokio::test]
async fn batches_respect_max_batch_size(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");
    let callback = Arc::new(RecordingCallback::new());
    session
        .register_async_consumer_callback(
            CallbackRegistration::new(callback.clone()).max_batch_size(3),
        )
        .await
        .expect("register");
    for value in 0..5 {
        push_message(&peer, &session, 0, &locked(value)).await;
    }

    session.start().await.expect("start");

    callback.wait_for_messages(5).await;
    assert_eq!(callback.batches(), vec![3, 2]);
}

#[rstest]
#[tokio::test]
async fn stop_from_callback_is_applied_afterwards(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let callback = Arc::new(RecordingCallback::acting(InCallback::Stop));
    let session = registered_session(&peer, &queue, |r| r, &callback).await;

    push_message(&peer, &session, 0, &locked(1)).await;
    callback.wait_for_messages(1).await;
    eventually(|| session.state() == SessionState::Stopped).await;

    assert_eq!(callback.in_callback_results(), vec![Ok(())]);
    assert_eq!(peer.count(Segment::STOP_SESS), 1);
    assert!(session.is_registered());

    push_message(&peer, &session, 0, &locked(2)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(callback.messages().len(), 1);

    within(session.start()).await.expect("restart");
    callback.wait_for_messages(2).await;
    eventually(|| session.state() == SessionState::Stopped).await;
    assert_eq!(peer.count(Segment::STOP_SESS), 2);
}

#[rstest]
#[tokio::test]
async fn close_from_callback_closes_session(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let callback = Arc::new(RecordingCallback::acting(InCallback::Close));
    let session = registered_session(&peer, &queue, |r| r, &callback).await;

    push_message(&peer, &session, 0, &locked(1)).await;
    eventually(|| session.is_closed()).await;

    assert_eq!(peer.count(Segment::CLOSE_CONSUMER_SESS), 1);
    assert!(session.connection().consumer_session(session.proxy_id()).is_none());
    let err = session.start().await.expect_err("closed");
    assert!(matches!(err, ProxyError::SessionUnavailable(_)));
}

#[rstest]
#[tokio::test]
async fn stop_and_deregister_from_callback(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let callback = Arc::new(RecordingCallback::acting(InCallback::StopAndDeregister));
    let session = registered_session(&peer, &queue, |r| r, &callback).await;

    push_message(&peer, &session, 0, &locked(1)).await;
    eventually(|| !session.is_registered()).await;

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(callback.in_callback_results(), vec![Ok(())]);
    assert!(session.proxy_queue().is_none());
}

#[rstest]
#[tokio::test]
async fn registration_holds_ordering_context(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let context = connection.create_ordering_context().await.expect("context");
    let producer = connection
        .create_producer_session(
            &queue,
            &ProducerOptions {
                ordering: Some(context.clone()),
                ..ProducerOptions::default()
            },
        )
        .await
        .expect("producer");
    assert_eq!(context.use_count(), 1);

    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");
    let callback = Arc::new(RecordingCallback::new());
    let with_context =
        || CallbackRegistration::new(callback.clone()).ordering_context(context.clone());

    session
        .register_async_consumer_callback(with_context())
        .await
        .expect("register");
    assert_eq!(context.use_count(), 2);
    session
        .register_async_consumer_callback(with_context())
        .await
        .expect("re-register");
    assert_eq!(context.use_count(), 2);
    session
        .register_async_consumer_callback(CallbackRegistration::new(callback.clone()))
        .await
        .expect("register without context");
    assert_eq!(context.use_count(), 1);
    session
        .register_async_consumer_callback(with_context())
        .await
        .expect("register");
    session
        .deregister_async_consumer_callback()
        .await
        .expect("deregister");
    assert_eq!(context.use_count(), 1);

    producer.close().await.expect("close producer");
    assert_eq!(context.use_count(), 0);
}

#[rstest]
#[tokio::test]
async fn failed_producer_creation_releases_context(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let context = connection.create_ordering_context().await.expect("context");
    peer.reply_once(
        Segment::CREATE_PRODUCER_SESS,
        replies::exception(ExceptionKind::LimitExceeded, "full"),
    );

    let err = connection
        .create_producer_session(
            &queue,
            &ProducerOptions {
                ordering: Some(context.clone()),
                ..ProducerOptions::default()
            },
        )
        .await
        .expect_err("rejected");
    assert!(matches!(err, ProxyError::LimitExceeded(_)));
    assert_eq!(context.use_count(), 0);
}

#[rstest]
#[tokio::test]
async fn limited_registration_replaces_read_ahead_queue(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let options = ConsumerOptions {
        read_ahead: true,
        ..ConsumerOptions::default()
    };
    let session = connection
        .create_consumer_session(&queue, &options)
        .await
        .expect("consumer");
    let callback = Arc::new(RecordingCallback::new());
    session
        .register_async_consumer_callback(
            CallbackRegistration::new(callback.clone()).max_active_messages(2),
        )
        .await
        .expect("register");
    assert!(!session.is_read_ahead());
    assert_eq!(session.proxy_queue().expect("queue").batch_sequence(), 1);
    session.start().await.expect("start");

    push_message(&peer, &session, 0, &locked(1)).await;
    push_message(&peer, &session, 1, &locked(2)).await;

    let delivered = callback.wait_for_messages(1).await;
    assert_eq!(delivered, vec![locked(2)]);
}

#[rstest]
#[tokio::test]
async fn peer_can_stop_stoppable_session(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");
    let callback = Arc::new(RecordingCallback::new());
    let unstoppable = CallbackRegistration::new(callback.clone());
    let err = session
        .register_stoppable_async_consumer_callback(unstoppable)
        .await
        .expect_err("no stoppable options");
    assert!(matches!(err, ProxyError::IncorrectCall(_)));
    session
        .register_stoppable_async_consumer_callback(
            CallbackRegistration::new(callback.clone()).stoppable(3, Duration::from_millis(10)),
        )
        .await
        .expect("register");
    session.start().await.expect("start");

    assert!(
        peer.push(
            connection.conversation_id(),
            Segment::ASYNC_SESSION_STOPPED,
            replies::session_stopped(session.proxy_id()),
        )
        .await
    );
    callback.wait_for_peer_stop().await;

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(peer.count(Segment::STOP_SESS), 0);
}

#[rstest]
#[tokio::test]
async fn stoppable_registration_needs_chunking_level(queue: DestinationAddress) {
    let peer = MockPeer::at_level(8);
    let connection = connect(&peer).await;
    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");
    let callback = Arc::new(RecordingCallback::new());

    let err = session
        .register_stoppable_async_consumer_callback(
            CallbackRegistration::new(callback).stoppable(1, Duration::ZERO),
        )
        .await
        .expect_err("level 9 needed");
    assert!(matches!(err, ProxyError::ProtocolLevel { required: 9, negotiated: 8 }));
}

#[rstest]
#[tokio::test]
async fn durable_consumer_uses_its_own_flow(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;

    let session = connection
        .create_consumer_session_for_durable_subscription(
            "audit",
            &queue,
            Some("engine-a"),
            &ConsumerOptions::default(),
        )
        .await
        .expect("durable consumer");

    assert_eq!(peer.count(Segment::CREATE_CONSUMER_FOR_DURABLE_SUB), 1);
    assert!(session.message_processor_id() > 1000);

    peer.reply_once(
        Segment::CREATE_CONSUMER_FOR_DURABLE_SUB,
        replies::exception(ExceptionKind::DurableSubscriptionNotFound, "audit"),
    );
    let err = connection
        .create_consumer_session_for_durable_subscription(
            "audit",
            &queue,
            None,
            &ConsumerOptions::default(),
        )
        .await
        .expect_err("missing subscription");
    assert!(matches!(err, ProxyError::DurableSubscriptionNotFound(_)));
}

#[rstest]
#[tokio::test]
async fn closing_connection_closes_sessions_without_flowing(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");

    connection.close(false).await.expect("close");

    assert!(session.is_closed());
    assert_eq!(peer.count(Segment::CLOSE_CONSUMER_SESS), 0);
    let err = session.receive_no_wait(None).await.expect_err("closed");
    assert!(matches!(err, ProxyError::SessionUnavailable(_)));
}

async fn read_ahead_consumer(peer: &Arc<MockPeer>, queue: &DestinationAddress) -> ConsumerSession {
    let connection = connect(peer).await;
    let options = ConsumerOptions {
        read_ahead: true,
        ..ConsumerOptions::default()
    };
    connection
        .create_consumer_session(queue, &options)
        .await
        .expect("consumer")
}

async fn read_ahead_session(peer: &Arc<MockPeer>, queue: &DestinationAddress) -> ConsumerSession {
    let session = read_ahead_consumer(peer, queue).await;
    session.start().await.expect("start");
    session
}

/// Spawn an indefinite receive and wait until it is parked.
async fn waiting_receive(
    session: &ConsumerSession,
) -> tokio::task::JoinHandle<Result<Option<Message>, ProxyError>> {
    let receiver = session.clone();
    let handle = tokio::spawn(async move {
        receiver.receive_with_wait(None, ReceiveTimeout::Indefinite).await
    });
    within(async {
        while session.receive_no_wait(None).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    handle
}

#[rstest]
#[tokio::test]
async fn unlock_all_discards_buffered_messages(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let session = read_ahead_session(&peer, &queue).await;
    push_message(&peer, &session, 0, &locked(1)).await;
    push_message(&peer, &session, 0, &locked(2)).await;

    session.unlock_all().await.expect("unlock all");

    assert_eq!(peer.count(Segment::UNLOCK_ALL), 1);
    assert_eq!(session.receive_no_wait(None).await.expect("receive"), None);
}

#[rstest]
#[tokio::test]
async fn rollback_purges_read_ahead_messages_without_flowing(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let session = read_ahead_session(&peer, &queue).await;
    push_message(&peer, &session, 0, &locked(4)).await;
    let flows = peer.requests().len();

    session.rollback_occurred().await;

    assert_eq!(peer.requests().len(), flows);
    assert_eq!(session.receive_no_wait(None).await.expect("receive"), None);
}

#[rstest]
#[tokio::test]
async fn client_cannot_activate_async_consumer(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");

    let error = session.activate_async_consumer().expect_err("client activation");

    assert!(error.is_usage_error());
}

#[rstest]
#[tokio::test]
async fn start_is_not_blocked_by_a_waiting_receive(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let session = read_ahead_consumer(&peer, &queue).await;
    let receive = waiting_receive(&session).await;

    within(session.start()).await.expect("start");
    let message = locked(9);
    push_message(&peer, &session, 0, &message).await;

    let received = within(receive).await.expect("join").expect("receive");
    assert_eq!(received, Some(message));
}

#[rstest]
#[tokio::test]
async fn close_ends_a_waiting_receive(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let session = read_ahead_consumer(&peer, &queue).await;
    let receive = waiting_receive(&session).await;

    within(session.close()).await.expect("close");

    let received = within(receive).await.expect("join").expect("receive");
    assert_eq!(received, None);
    assert_eq!(session.state(), SessionState::Closed);
}

#[rstest]
#[case::session_close(false)]
#[case::connection_close(true)]
#[tokio::test]
async fn closing_releases_the_registration_context(
    queue: DestinationAddress,
    #[case] close_connection: bool,
) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer).await;
    let context = connection.create_ordering_context().await.expect("context");
    let session = connection
        .create_consumer_session(&queue, &ConsumerOptions::default())
        .await
        .expect("consumer");
    let callback = Arc::new(RecordingCallback::new());
    session
        .register_async_consumer_callback(
            CallbackRegistration::new(callback).ordering_context(context.clone()),
        )
        .await
        .expect("register");
    assert_eq!(context.use_count(), 1);

    if close_connection {
        connection.close(false).await.expect("close connection");
    } else {
        session.close().await.expect("close session");
    }

    assert_eq!(context.use_count(), 0);
    assert!(session.ordering_context().is_none());
}
