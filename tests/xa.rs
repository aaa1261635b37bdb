//! XA branches across resources sharing an xid table.

use std::sync::Arc;

use rstest::{fixture, rstest};
use wireproxy::{
    Connection,
    Message,
    Reliability,
    Transaction,
    XaResource,
    connection::SendOptions,
    error::XaError,
    message::DestinationAddress,
    protocol::{Capabilities, HandshakeProperties, OptimizedTxFlags, Segment},
    transaction::{XaFlags, XaVote, Xid, XidTable},
};
use wireproxy_testing::{MockPeer, Recorded, replies};

#[fixture]
fn xid() -> Xid { Xid::new(7, b"global-1".to_vec(), b"branch-1".to_vec()) }

fn optimized_peer() -> Arc<MockPeer> {
    MockPeer::new(HandshakeProperties::new(
        9,
        Capabilities::TRANSACTIONS | Capabilities::REQUIRES_OPTIMIZED_TX,
    ))
}

async fn resource(peer: &Arc<MockPeer>, table: &Arc<XidTable>) -> XaResource {
    let connection = Connection::builder(peer.conversation())
        .xid_table(Arc::clone(table))
        .connect()
        .await
        .expect("connect");
    connection.get_xa_resource().await.expect("xa resource")
}

async fn send_work(resource: &XaResource) {
    resource
        .connection()
        .send(
            &Message::new(Reliability::AssuredPersistent, b"work".to_vec()),
            Some(&Transaction::from(resource.clone())),
            &DestinationAddress::new("ledger"),
            &SendOptions::default(),
        )
        .await
        .expect("send");
}

/// Transaction id and xid at the head of a branch flow.
fn branch_of(recorded: &Recorded) -> (i32, Xid) {
    let mut body = recorded.body();
    body.get_i16().expect("connection id");
    let transaction = body.get_i32().expect("transaction id");
    (transaction, body.get_xid().expect("xid"))
}

#[rstest]
#[tokio::test]
async fn branch_flows_every_step_without_optimization(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;

    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    assert!(resource.is_enlisted());
    send_work(&resource).await;
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");
    assert!(!resource.is_enlisted());

    peer.reply_once(Segment::XA_PREPARE, replies::vote(0));
    assert_eq!(resource.prepare(&xid).await, Ok(XaVote::Ok));
    assert!(table.contains(&xid));
    resource.commit(&xid, false).await.expect("commit");

    let xa_codes = Segment::XA_START.code()..=Segment::XA_FORGET.code();
    let xa_flows: Vec<Segment> = peer
        .segments()
        .into_iter()
        .filter(|segment| xa_codes.contains(&segment.code()))
        .collect();
    assert_eq!(
        xa_flows,
        vec![Segment::XA_START, Segment::XA_END, Segment::XA_PREPARE, Segment::XA_COMMIT]
    );
    let (transaction, flowed) = branch_of(&peer.requests_for(Segment::XA_START)[0]);
    assert_eq!(flowed, xid);
    let send = &peer.requests_for(Segment::SEND_CONN_MSG_NOREPLY)[0];
    let mut body = send.body();
    body.get_i16().expect("connection id");
    body.get_i16().expect("ordering id");
    assert_eq!(body.get_i32().expect("transaction"), transaction);
    assert!(table.is_empty());
}

#[rstest]
#[tokio::test]
async fn read_only_vote_completes_branch(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");

    peer.reply_once(Segment::XA_PREPARE, replies::vote(3));

    assert_eq!(resource.prepare(&xid).await, Ok(XaVote::ReadOnly));
    assert!(table.is_empty());
}

#[rstest]
#[tokio::test]
async fn untouched_optimized_branch_never_flows(xid: Xid) {
    let peer = optimized_peer();
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;

    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");

    assert_eq!(resource.prepare(&xid).await, Ok(XaVote::ReadOnly));
    assert!(table.is_empty());
    assert_eq!(peer.segments(), vec![Segment::CONNECT]);
}

#[rstest]
#[case::one_phase(true, Err(XaError::HeuristicRollback))]
#[case::two_phase(false, Ok(()))]
#[tokio::test]
async fn failed_untouched_branch_commits_locally(
    xid: Xid,
    #[case] one_phase: bool,
    #[case] expected: Result<(), XaError>,
) {
    let peer = optimized_peer();
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    resource.end(&xid, XaFlags::FAIL).await.expect("end");

    assert_eq!(resource.commit(&xid, one_phase).await, expected);
    assert_eq!(peer.count(Segment::XA_COMMIT), 0);
}

#[rstest]
#[tokio::test]
async fn optimized_branch_is_created_by_first_work_and_end_rides_on_prepare(xid: Xid) {
    let peer = optimized_peer();
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");

    send_work(&resource).await;
    send_work(&resource).await;
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");
    assert_eq!(peer.count(Segment::XA_START), 0);
    assert_eq!(peer.count(Segment::XA_END), 0);

    let sends = peer.requests_for(Segment::SEND_CONN_MSG_NOREPLY);
    let mut first = sends[0].body();
    first.get_i16().expect("connection id");
    first.get_i16().expect("ordering id");
    let flags = OptimizedTxFlags::from_bits_truncate(first.get_u32().expect("flags"));
    assert!(flags.contains(OptimizedTxFlags::TRANSACTED | OptimizedTxFlags::CREATE));
    first.get_u32().expect("conversation id");
    first.get_i32().expect("transaction id");
    assert_eq!(first.get_xid().expect("xid"), xid);
    let mut second = sends[1].body();
    second.get_i16().expect("connection id");
    second.get_i16().expect("ordering id");
    let flags = OptimizedTxFlags::from_bits_truncate(second.get_u32().expect("flags"));
    assert!(!flags.contains(OptimizedTxFlags::CREATE));

    peer.reply_once(Segment::XA_PREPARE, replies::vote(0));
    assert_eq!(resource.prepare(&xid).await, Ok(XaVote::Ok));
    let prepare = &peer.requests_for(Segment::XA_PREPARE)[0];
    let mut body = prepare.body();
    body.get_i16().expect("connection id");
    body.get_i32().expect("transaction id");
    body.get_xid().expect("xid");
    assert!(body.get_bool().expect("end owed"));
    assert_eq!(
        XaFlags::from_bits_truncate(body.get_u32().expect("end flags")),
        XaFlags::SUCCESS
    );

    resource.commit(&xid, false).await.expect("commit");
    let commit = &peer.requests_for(Segment::XA_COMMIT)[0];
    let mut body = commit.body();
    body.get_i16().expect("connection id");
    body.get_i32().expect("transaction id");
    body.get_xid().expect("xid");
    assert!(!body.get_bool().expect("end already sent"));
    assert!(table.is_empty());
}

#[rstest]
#[tokio::test]
async fn completion_is_delegated_to_the_owner(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let owner = resource(&peer, &table).await;
    let other = resource(&peer, &table).await;
    assert!(!owner.is_same_rm(&other));
    owner.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    owner.end(&xid, XaFlags::SUCCESS).await.expect("end");
    assert!(table.owner(&xid).is_some_and(|found| found.same_as(&owner)));

    other.commit(&xid, true).await.expect("commit");

    let commits = peer.requests_for(Segment::XA_COMMIT);
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].conversation, owner.connection().conversation_id());
    assert!(table.is_empty());
}

#[rstest]
#[tokio::test]
async fn joined_branch_ends_once_everyone_has_ended(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let primary = resource(&peer, &table).await;
    let joiner = resource(&peer, &table).await;
    primary.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    joiner.start(&xid, XaFlags::JOIN).await.expect("join");

    primary.end(&xid, XaFlags::SUCCESS).await.expect("primary end");
    assert_eq!(peer.count(Segment::XA_END), 0);
    joiner.end(&xid, XaFlags::SUCCESS).await.expect("joiner end");

    let ends = peer.requests_for(Segment::XA_END);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].conversation, primary.connection().conversation_id());
}

#[rstest]
#[tokio::test]
async fn misuse_is_reported_as_xa_errors(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let first = resource(&peer, &table).await;
    let second = resource(&peer, &table).await;
    first.start(&xid, XaFlags::NO_FLAGS).await.expect("start");

    assert_eq!(first.start(&xid, XaFlags::NO_FLAGS).await, Err(XaError::Protocol));
    assert_eq!(second.start(&xid, XaFlags::NO_FLAGS).await, Err(XaError::DuplicateXid));
    assert!(!second.is_enlisted());
    let unknown = Xid::new(7, b"global-2".to_vec(), b"branch-1".to_vec());
    assert_eq!(second.start(&unknown, XaFlags::JOIN).await, Err(XaError::UnknownXid));
    assert_eq!(first.end(&unknown, XaFlags::SUCCESS).await, Err(XaError::Protocol));
    assert!(first.is_enlisted());
}

#[rstest]
#[tokio::test]
async fn peer_xa_error_is_surfaced(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");
    peer.reply_once(Segment::XA_PREPARE, replies::xa_exception(100, "branch rolled back"));

    assert_eq!(resource.prepare(&xid).await, Err(XaError::RollbackOccurred));
    assert!(table.is_empty());
}

#[rstest]
#[tokio::test]
async fn prepare_transport_failure_invalidates_connection(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");
    peer.fail_once(
        Segment::XA_PREPARE,
        wireproxy::error::TransportError::Lost("reset".into()),
    );

    assert_eq!(resource.prepare(&xid).await, Err(XaError::ResourceManagerFailure));
    assert!(resource.connection().is_closed());
    assert!(table.contains(&xid));
}

#[tokio::test]
async fn recover_lists_in_doubt_branches() {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    let in_doubt = Xid::new(1, b"g".to_vec(), b"b".to_vec());
    let mut body = wireproxy::codec::RequestBuffer::new();
    body.put_i32(1);
    body.put_xid(&in_doubt).expect("xid fits");
    peer.reply_once(Segment::XA_RECOVER, replies::success(Segment::XA_RECOVER, body));

    let found = resource
        .recover(XaFlags::START_RSCAN | XaFlags::END_RSCAN)
        .await
        .expect("recover");

    assert_eq!(found, vec![in_doubt]);
}

#[tokio::test]
async fn recover_needs_optimized_transaction_level() {
    let peer = MockPeer::at_level(4);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;

    assert_eq!(
        resource.recover(XaFlags::START_RSCAN).await,
        Err(XaError::ResourceManagerFailure)
    );
    assert_eq!(peer.count(Segment::XA_RECOVER), 0);
}

#[rstest]
#[tokio::test]
async fn forget_drops_the_branch_and_flows(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");
    assert_eq!(resource.prepare(&xid).await, Ok(XaVote::Ok));

    resource.forget(&xid).await.expect("forget");

    assert!(!table.contains(&xid));
    let forgets = peer.requests_for(Segment::XA_FORGET);
    assert_eq!(forgets.len(), 1);
    let mut body = forgets[0].body();
    body.get_i16().expect("connection id");
    assert_eq!(body.get_xid().expect("xid"), xid);
}

#[tokio::test]
async fn transaction_timeout_is_kept_locally() {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    let flows = peer.requests().len();

    assert_eq!(resource.transaction_timeout(), 0);
    assert!(resource.set_transaction_timeout(30));
    assert_eq!(resource.transaction_timeout(), 30);
    assert_eq!(peer.requests().len(), flows);
}

#[rstest]
#[tokio::test]
async fn prepared_branch_on_closed_connection_asks_for_retry(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    send_work(&resource).await;
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");
    assert_eq!(resource.prepare(&xid).await, Ok(XaVote::Ok));
    resource.connection().close(true).await.expect("close");

    assert_eq!(resource.commit(&xid, false).await, Err(XaError::ResourceManagerFailure));
    assert_eq!(resource.rollback(&xid).await, Err(XaError::ResourceManagerFailure));
    assert!(table.contains(&xid));
    assert_eq!(peer.count(Segment::XA_COMMIT), 0);
    assert_eq!(peer.count(Segment::XA_ROLLBACK), 0);
}

#[rstest]
#[tokio::test]
async fn unprepared_branch_on_closed_connection_is_rolled_back(xid: Xid) {
    let peer = MockPeer::at_level(9);
    let table = XidTable::new();
    let resource = resource(&peer, &table).await;
    resource.start(&xid, XaFlags::NO_FLAGS).await.expect("start");
    send_work(&resource).await;
    resource.end(&xid, XaFlags::SUCCESS).await.expect("end");
    resource.connection().close(true).await.expect("close");

    assert_eq!(resource.rollback(&xid).await, Err(XaError::RollbackOccurred));
    assert!(!table.contains(&xid));
    assert_eq!(peer.count(Segment::XA_ROLLBACK), 0);
}
