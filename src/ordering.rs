//! Reference-counted ordering contexts.
//!
//! An [`OrderingContext`] groups producers and consumers whose messages must
//! be processed in order. Every producer session created with a context and
//! every consumer registration that names one holds a use of it; the count
//! returns to zero once all of them are closed or deregistered.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::warn;

struct OrderingContextInner {
    id: i16,
    uses: AtomicUsize,
}

/// Handle to an ordering context allocated by a connection.
#[derive(Clone)]
pub struct OrderingContext(Arc<OrderingContextInner>);

impl OrderingContext {
    pub(crate) fn new(id: i16) -> Self {
        Self(Arc::new(OrderingContextInner {
            id,
            uses: AtomicUsize::new(0),
        }))
    }

    /// Identifier written into requests.
    #[must_use]
    pub fn id(&self) -> i16 { self.0.id }

    /// Number of sessions and registrations currently using the context.
    #[must_use]
    pub fn use_count(&self) -> usize { self.0.uses.load(Ordering::Acquire) }

    pub(crate) fn increment_use_count(&self) { self.0.uses.fetch_add(1, Ordering::AcqRel); }

    /// Release one use. The count never drops below zero.
    pub(crate) fn decrement_use_count(&self) {
        let released = self
            .0
            .uses
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |uses| uses.checked_sub(1));
        if released.is_err() {
            warn!("ordering context {} released more often than used", self.0.id);
        }
    }

    /// Returns true when both handles refer to the same context.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}

impl PartialEq for OrderingContext {
    fn eq(&self, other: &Self) -> bool { self.same_as(other) }
}

impl Eq for OrderingContext {}

impl fmt::Debug for OrderingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderingContext")
            .field("id", &self.0.id)
            .field("uses", &self.use_count())
            .finish()
    }
}

/// Wire id of an optional context.
pub(crate) fn wire_id(context: Option<&OrderingContext>) -> i16 {
    context.map_or(crate::protocol::NO_ORDER_CONTEXT, OrderingContext::id)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decrement_never_underflows() {
        let context = OrderingContext::new(3);
        context.decrement_use_count();
        assert_eq!(context.use_count(), 0);
        context.increment_use_count();
        context.decrement_use_count();
        context.decrement_use_count();
        assert_eq!(context.use_count(), 0);
    }

    #[test]
    fn clones_share_the_count() {
        let context = OrderingContext::new(1);
        let other = context.clone();
        other.increment_use_count();
        assert_eq!(context.use_count(), 1);
        assert!(context.same_as(&other));
        assert_ne!(context, OrderingContext::new(1));
    }

    proptest! {
        #[test]
        fn count_tracks_balanced_operations(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let context = OrderingContext::new(9);
            let mut expected = 0usize;
            for increment in ops {
                if increment {
                    context.increment_use_count();
                    expected += 1;
                } else {
                    context.decrement_use_count();
                    expected = expected.saturating_sub(1);
                }
                prop_assert_eq!(context.use_count(), expected);
            }
        }
    }
}
