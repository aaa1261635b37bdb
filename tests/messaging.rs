//! Connection-level send and receive, including chunked messages.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use rstest::{fixture, rstest};
use wireproxy::{
    Connection,
    Message,
    ProxyConfig,
    ProxyError,
    Reliability,
    Transaction,
    codec::{MessageCodec, RequestBuffer},
    completion::ExceptionKind,
    connection::{ReceiveOptions, SendOptions},
    message::{DestinationAddress, ReceiveTimeout},
    protocol::{Capabilities, ChunkFlags, HandshakeProperties, OptimizedTxFlags, Segment},
};
use wireproxy_testing::{MockPeer, Recorded, replies};

#[fixture]
fn queue() -> DestinationAddress { DestinationAddress::new("orders") }

async fn connect(peer: &Arc<MockPeer>, config: ProxyConfig) -> Connection {
    Connection::builder(peer.conversation())
        .config(config)
        .connect()
        .await
        .expect("connect")
}

fn chunking_config() -> ProxyConfig {
    ProxyConfig::default().chunking_threshold(100).max_slice_size(64)
}

fn large_message() -> Message {
    let body: Vec<u8> = (0..=u8::MAX).cycle().take(500).collect();
    Message::new(Reliability::ReliablePersistent, body)
}

/// Read one chunk request sent through the connection: returns its flags,
/// the destination on the first chunk, and the slice.
fn read_chunk(recorded: &Recorded) -> (ChunkFlags, Option<DestinationAddress>, Bytes) {
    let mut body = recorded.body();
    body.get_i16().expect("connection id");
    body.get_i16().expect("ordering id");
    assert_eq!(body.get_i32().expect("transaction"), 0);
    let flags = ChunkFlags::from_bits_truncate(body.get_u8().expect("flags"));
    let destination = if flags.contains(ChunkFlags::FIRST) {
        body.get_i16().expect("destination type");
        assert_eq!(body.get_opt_string().expect("alternate user"), None);
        Some(body.get_destination().expect("destination"))
    } else {
        None
    };
    (flags, destination, body.get_slice().expect("slice"))
}

#[rstest]
#[tokio::test]
async fn large_message_is_sent_in_chunks(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, chunking_config()).await;
    let message = large_message();

    connection
        .send(&message, None, &queue, &SendOptions::default())
        .await
        .expect("send");

    let chunks: Vec<Recorded> = peer
        .requests()
        .into_iter()
        .filter(|r| {
            r.segment == Segment::SEND_CHUNKED_CONN_MSG
                || r.segment == Segment::SEND_CHUNKED_CONN_MSG_NOREPLY
        })
        .collect();
    assert!(chunks.len() > 1);
    let (last, rest) = chunks.split_last().expect("chunks");
    assert!(rest.iter().all(|r| r.segment == Segment::SEND_CHUNKED_CONN_MSG_NOREPLY));
    assert!(rest.iter().all(|r| !r.exchanged));
    assert_eq!(last.segment, Segment::SEND_CHUNKED_CONN_MSG);
    assert!(last.exchanged);
    assert_eq!(peer.count(Segment::SEND_CONN_MSG), 0);

    let mut slices = Vec::new();
    for (index, recorded) in chunks.iter().enumerate() {
        let (flags, destination, slice) = read_chunk(recorded);
        assert_eq!(flags.contains(ChunkFlags::FIRST), index == 0);
        assert_eq!(flags.contains(ChunkFlags::LAST), index + 1 == chunks.len());
        assert_eq!(destination.is_some(), index == 0);
        if let Some(destination) = destination {
            assert_eq!(destination, queue);
        }
        assert!(slice.len() <= 64);
        slices.push(slice);
    }
    let decoded = replies::codec().decode(&slices).expect("reassembled");
    assert_eq!(decoded, message);
}

#[rstest]
#[case::below_threshold(9, ProxyConfig::default())]
#[case::before_chunking_level(8, chunking_config())]
#[tokio::test]
async fn message_is_sent_whole(
    queue: DestinationAddress,
    #[case] level: u16,
    #[case] config: ProxyConfig,
) {
    let peer = MockPeer::at_level(level);
    let connection = connect(&peer, config).await;
    let message = large_message();

    connection
        .send(&message, None, &queue, &SendOptions::default())
        .await
        .expect("send");

    let sends = peer.requests_for(Segment::SEND_CONN_MSG);
    assert_eq!(sends.len(), 1);
    assert_eq!(peer.count(Segment::SEND_CHUNKED_CONN_MSG), 0);
    assert_eq!(peer.count(Segment::SEND_CHUNKED_CONN_MSG_NOREPLY), 0);

    let mut body = sends[0].body();
    body.get_i16().expect("connection id");
    body.get_i16().expect("ordering id");
    assert_eq!(body.get_i32().expect("transaction"), 0);
    body.get_i16().expect("destination type");
    body.get_opt_string().expect("alternate user");
    assert_eq!(body.get_destination().expect("destination"), queue);
    assert_eq!(body.get_i32().expect("slice count"), 1);
    let slice = body.get_slice().expect("slice");
    assert_eq!(replies::codec().decode(&[slice]).expect("decode"), message);
}

#[rstest]
#[case(Reliability::BestEffortNonPersistent, Segment::SEND_CONN_MSG_NOREPLY, false)]
#[case(Reliability::ExpressNonPersistent, Segment::SEND_CONN_MSG_NOREPLY, false)]
#[case(Reliability::ReliableNonPersistent, Segment::SEND_CONN_MSG, true)]
#[case(Reliability::AssuredPersistent, Segment::SEND_CONN_MSG, true)]
#[tokio::test]
async fn reliability_decides_whether_send_waits(
    queue: DestinationAddress,
    #[case] reliability: Reliability,
    #[case] segment: Segment,
    #[case] exchanged: bool,
) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default()).await;

    connection
        .send(
            &Message::new(reliability, b"hello".to_vec()),
            None,
            &queue,
            &SendOptions::default(),
        )
        .await
        .expect("send");

    let sends = peer.requests_for(segment);
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].exchanged, exchanged);
}

#[rstest]
#[tokio::test]
async fn express_sends_can_be_exchanged(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default().exchange_express_sends(true)).await;

    connection
        .send(
            &Message::new(Reliability::ExpressNonPersistent, b"hello".to_vec()),
            None,
            &queue,
            &SendOptions::default(),
        )
        .await
        .expect("send");

    assert_eq!(peer.count(Segment::SEND_CONN_MSG), 1);
    assert_eq!(peer.count(Segment::SEND_CONN_MSG_NOREPLY), 0);
}

#[rstest]
#[tokio::test]
async fn transacted_send_goes_without_reply(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default()).await;
    let transaction = connection
        .create_uncoordinated_transaction(false)
        .await
        .expect("transaction");
    let id = transaction.id();
    let transaction = Transaction::from(transaction);

    connection
        .send(
            &Message::new(Reliability::AssuredPersistent, b"hello".to_vec()),
            Some(&transaction),
            &queue,
            &SendOptions::default(),
        )
        .await
        .expect("send");

    let sends = peer.requests_for(Segment::SEND_CONN_MSG_NOREPLY);
    assert_eq!(sends.len(), 1);
    let mut body = sends[0].body();
    body.get_i16().expect("connection id");
    body.get_i16().expect("ordering id");
    assert_eq!(body.get_i32().expect("transaction"), id);
}

#[rstest]
#[tokio::test]
async fn completed_transaction_is_rejected(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default()).await;
    let local = connection
        .create_uncoordinated_transaction(false)
        .await
        .expect("transaction");
    local.commit().await.expect("commit");

    let err = connection
        .send(
            &Message::new(Reliability::AssuredPersistent, b"late".to_vec()),
            Some(&Transaction::from(local)),
            &queue,
            &SendOptions::default(),
        )
        .await
        .expect_err("transaction completed");
    assert!(matches!(err, ProxyError::IncorrectCall(_)));
    assert_eq!(peer.count(Segment::SEND_CONN_MSG_NOREPLY), 0);
}

#[rstest]
#[tokio::test]
async fn optimized_transaction_is_created_by_first_send(queue: DestinationAddress) {
    let peer = MockPeer::new(HandshakeProperties::new(
        9,
        Capabilities::TRANSACTIONS | Capabilities::REQUIRES_OPTIMIZED_TX,
    ));
    let connection = connect(&peer, ProxyConfig::default()).await;
    let local = connection
        .create_uncoordinated_transaction(true)
        .await
        .expect("transaction");
    assert_eq!(peer.count(Segment::CREATE_UCTRANSACTION), 0);
    assert!(!local.is_server_transaction_created());
    let transaction = Transaction::from(local.clone());

    for _ in 0..2 {
        connection
            .send(
                &Message::new(Reliability::AssuredPersistent, b"work".to_vec()),
                Some(&transaction),
                &queue,
                &SendOptions::default(),
            )
            .await
            .expect("send");
    }

    let flags: Vec<OptimizedTxFlags> = peer
        .requests_for(Segment::SEND_CONN_MSG_NOREPLY)
        .iter()
        .map(|recorded| {
            let mut body = recorded.body();
            body.get_i16().expect("connection id");
            body.get_i16().expect("ordering id");
            OptimizedTxFlags::from_bits_truncate(body.get_u32().expect("flags"))
        })
        .collect();
    assert_eq!(flags.len(), 2);
    assert!(flags[0].contains(OptimizedTxFlags::CREATE | OptimizedTxFlags::SUBORDINATES_ALLOWED));
    assert!(!flags[1].contains(OptimizedTxFlags::CREATE));
    assert!(local.is_server_transaction_created());

    local.commit().await.expect("commit");
    assert_eq!(peer.count(Segment::COMMIT_TRANSACTION), 1);
}

#[tokio::test]
async fn optimized_transaction_without_work_completes_locally() {
    let peer = MockPeer::new(HandshakeProperties::new(
        9,
        Capabilities::TRANSACTIONS | Capabilities::REQUIRES_OPTIMIZED_TX,
    ));
    let connection = connect(&peer, ProxyConfig::default()).await;
    let local = connection
        .create_uncoordinated_transaction(false)
        .await
        .expect("transaction");

    local.rollback().await.expect("rollback");

    assert_eq!(peer.count(Segment::ROLLBACK_TRANSACTION), 0);
    let err = local.commit().await.expect_err("already completed");
    assert!(matches!(err, ProxyError::IncorrectCall(_)));
}

#[rstest]
#[tokio::test]
async fn receive_returns_message_from_reply(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default()).await;
    let message = Message::new(Reliability::ReliablePersistent, b"payload".to_vec());
    peer.reply_once(
        Segment::RECEIVE_CONN_MSG,
        replies::received(Segment::RECEIVE_CONN_MSG, Some(&message)),
    );

    let received = connection
        .receive_no_wait(&queue, None, &ReceiveOptions::default())
        .await
        .expect("receive");
    assert_eq!(received, Some(message));

    let nothing = connection
        .receive_no_wait(&queue, None, &ReceiveOptions::default())
        .await
        .expect("receive");
    assert_eq!(nothing, None);
}

#[rstest]
#[tokio::test]
async fn pushed_slices_complete_with_receive_reply(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default()).await;
    let message = large_message();
    let encoded = replies::slices(&message).concat();
    let third = encoded.len() / 3;
    let (first, rest) = encoded.split_at(third);
    let (middle, last) = rest.split_at(third);

    for (flags, part) in [(ChunkFlags::FIRST, first), (ChunkFlags::MIDDLE, middle)] {
        assert!(
            peer.push(
                connection.conversation_id(),
                Segment::CHUNKED_SYNC_CONN_MSG,
                replies::connection_chunk(flags, part),
            )
            .await
        );
    }
    let mut body = RequestBuffer::new();
    body.put_i32(1);
    body.put_slice(last).expect("slice");
    peer.reply_once(
        Segment::RECEIVE_CONN_MSG,
        replies::success(Segment::RECEIVE_CONN_MSG, body),
    );

    let received = connection
        .receive_no_wait(&queue, None, &ReceiveOptions::default())
        .await
        .expect("receive");
    assert_eq!(received, Some(message));
}

#[rstest]
#[tokio::test]
async fn receive_failure_maps_through_cascade(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default()).await;
    peer.reply_once(
        Segment::RECEIVE_CONN_MSG,
        replies::exception(ExceptionKind::DestinationLocked, "locked"),
    );

    let err = connection
        .receive_no_wait(&queue, None, &ReceiveOptions::default())
        .await
        .expect_err("locked");
    assert!(matches!(err, ProxyError::DestinationLocked(_)));
}

#[rstest]
#[tokio::test]
async fn waiting_receives_on_one_connection_run_in_turn(queue: DestinationAddress) {
    let peer = MockPeer::at_level(9);
    let connection = connect(&peer, ProxyConfig::default()).await;
    peer.hold(Segment::RECEIVE_CONN_MSG);
    let spawn_receive = || {
        let connection = connection.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            connection
                .receive_with_wait(&queue, None, ReceiveTimeout::Indefinite, &ReceiveOptions::default())
                .await
        })
    };

    let first_receive = spawn_receive();
    tokio::time::timeout(Duration::from_secs(5), async {
        while peer.count(Segment::RECEIVE_CONN_MSG) < 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("first receive never flowed");
    let message = large_message();
    let encoded = replies::slices(&message).concat();
    let (first, last) = encoded.split_at(encoded.len() / 2);
    assert!(
        peer.push(
            connection.conversation_id(),
            Segment::CHUNKED_SYNC_CONN_MSG,
            replies::connection_chunk(ChunkFlags::FIRST, first),
        )
        .await
    );

    let second_receive = spawn_receive();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(peer.count(Segment::RECEIVE_CONN_MSG), 1);

    let mut body = RequestBuffer::new();
    body.put_i32(1);
    body.put_slice(last).expect("slice");
    peer.reply_once(
        Segment::RECEIVE_CONN_MSG,
        replies::success(Segment::RECEIVE_CONN_MSG, body),
    );
    peer.release(Segment::RECEIVE_CONN_MSG);
    let received = first_receive.await.expect("first task").expect("first receive");
    assert_eq!(received, Some(message));

    peer.release(Segment::RECEIVE_CONN_MSG);
    let received = second_receive.await.expect("second task").expect("second receive");
    assert_eq!(received, None);
    assert_eq!(peer.count(Segment::RECEIVE_CONN_MSG), 2);
}
