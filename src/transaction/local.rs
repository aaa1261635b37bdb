//! Uncoordinated transactions.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::debug;

use super::LowestPriority;
use crate::{
    codec::RequestBuffer,
    completion::cascade,
    connection::Connection,
    error::{ProxyError, Result},
    protocol::{OptimizedTxFlags, Segment},
};

struct LocalInner {
    connection: Connection,
    id: i32,
    optimized: bool,
    subordinates_allowed: bool,
    server_created: AtomicBool,
    valid: AtomicBool,
    lowest_priority: LowestPriority,
}

/// A transaction local to one connection.
///
/// Committing or rolling back completes the transaction; any further use is
/// a usage error.
#[derive(Clone)]
pub struct LocalTransaction(Arc<LocalInner>);

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.0.id)
            .field("valid", &self.is_valid())
            .field("server_created", &self.is_server_transaction_created())
            .finish()
    }
}

impl LocalTransaction {
    /// `server_created` is true when a create flow already ran.
    pub(crate) fn new(
        connection: Connection,
        id: i32,
        optimized: bool,
        subordinates_allowed: bool,
        server_created: bool,
    ) -> Self {
        Self(Arc::new(LocalInner {
            connection,
            id,
            optimized,
            subordinates_allowed,
            server_created: AtomicBool::new(server_created),
            valid: AtomicBool::new(true),
            lowest_priority: LowestPriority::default(),
        }))
    }

    #[must_use]
    pub fn id(&self) -> i32 { self.0.id }

    #[must_use]
    pub fn is_valid(&self) -> bool { self.0.valid.load(Ordering::Acquire) }

    /// Returns true once the peer holds a transaction for this unit of work.
    #[must_use]
    pub fn is_server_transaction_created(&self) -> bool {
        self.0.server_created.load(Ordering::Acquire)
    }

    pub(super) fn lowest_priority(&self) -> &LowestPriority { &self.0.lowest_priority }

    pub(super) fn encode(&self, request: &mut RequestBuffer) {
        if !self.0.optimized {
            request.put_i32(self.0.id);
            return;
        }
        let mut flags = OptimizedTxFlags::TRANSACTED | OptimizedTxFlags::LOCAL;
        if !self.0.server_created.swap(true, Ordering::AcqRel) {
            flags |= OptimizedTxFlags::CREATE;
            if self.0.subordinates_allowed {
                flags |= OptimizedTxFlags::SUBORDINATES_ALLOWED;
            }
        }
        request.put_u32(flags.bits());
        request.put_u32(self.0.connection.conversation_id());
        request.put_i32(self.0.id);
    }

    fn complete(&self) -> Result<()> {
        if self.0.valid.swap(false, Ordering::AcqRel) {
            Ok(())
        } else {
            Err(ProxyError::incorrect_call(format!(
                "transaction {} has already completed",
                self.0.id
            )))
        }
    }

    async fn flow(&self, segment: Segment) -> Result<()> {
        let mut request = RequestBuffer::new();
        request.put_i16(self.0.connection.object_id());
        request.put_i32(self.0.id);
        let mut reply = self
            .0
            .connection
            .exchange_shared(segment, self.0.lowest_priority.completion_priority(), request)
            .await?;
        reply.check_completion(segment.reply(), cascade::TRANSACTION)
    }

    /// Commit the transaction.
    ///
    /// Nothing flows when no transacted work reached the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IncorrectCall`] when the transaction already
    /// completed, or the peer's error.
    pub async fn commit(&self) -> Result<()> {
        self.complete()?;
        if !self.is_server_transaction_created() {
            debug!("transaction {} committed without server work", self.0.id);
            return Ok(());
        }
        self.flow(Segment::COMMIT_TRANSACTION).await
    }

    /// Roll the transaction back.
    ///
    /// With strict redelivery ordering every consumer session of the
    /// connection drops its buffered messages afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IncorrectCall`] when the transaction already
    /// completed, or the peer's error.
    pub async fn rollback(&self) -> Result<()> {
        self.complete()?;
        if !self.is_server_transaction_created() {
            debug!("transaction {} rolled back without server work", self.0.id);
            return Ok(());
        }
        let outcome = self.flow(Segment::ROLLBACK_TRANSACTION).await;
        if self.0.connection.config().strict_redelivery_ordering_value() {
            self.0.connection.rollback_occurred().await;
        }
        outcome
    }
}
