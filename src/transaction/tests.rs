//! Tests for transaction bookkeeping that needs no peer.

use std::sync::Arc;

use rstest::rstest;

use super::*;
use crate::codec::RequestBuffer;

#[test]
fn completion_defaults_to_medium() {
    assert_eq!(LowestPriority::default().completion_priority(), Priority::Medium);
}

#[rstest]
#[case(&[Priority::High], Priority::Medium)]
#[case(&[Priority::Low], Priority::Low)]
#[case(&[Priority::High, Priority::Low, Priority::Medium], Priority::Low)]
fn completion_never_overtakes_recorded_sends(
    #[case] sends: &[Priority],
    #[case] expected: Priority,
) {
    let lowest = LowestPriority::default();
    for priority in sends {
        lowest.record(*priority);
    }
    assert_eq!(lowest.completion_priority(), expected);
}

#[test]
fn missing_transaction_is_valid_and_written_as_zero() {
    assert!(ensure_valid(None).is_ok());
    let mut request = RequestBuffer::new();
    put_transaction(&mut request, None).expect("encode");
    assert_eq!(request.freeze().as_ref(), &[0, 0, 0, 0]);
}

#[test]
fn xid_displays_as_hex() {
    let xid = Xid::new(0x1f, vec![0xab, 0x01], vec![0x02]);
    assert_eq!(xid.to_string(), "0x1f:ab01:02");
    assert_eq!(format!("{xid:?}"), "Xid(0x1f:ab01:02)");
}

#[test]
fn shared_table_is_one_instance() {
    assert!(Arc::ptr_eq(&XidTable::shared(), &XidTable::shared()));
    let private = XidTable::new();
    assert!(!Arc::ptr_eq(&private, &XidTable::shared()));
    assert!(private.is_empty());
}
