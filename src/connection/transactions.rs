//! Transactions scoped to a connection.

use std::sync::Arc;

use log::debug;

use super::Connection;
use crate::{
    completion::cascade,
    conversation::Priority,
    error::Result,
    protocol::{Segment, level},
    transaction::{LocalTransaction, XaResource},
};

impl Connection {
    /// Create an uncoordinated transaction.
    ///
    /// When the peer requires optimized transactions nothing flows now:
    /// the first transacted request creates the transaction on the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`](crate::error::ProxyError::ConnectionUnavailable)
    /// once closed, or the peer's error from the simple connection cascade.
    pub async fn create_uncoordinated_transaction(
        &self,
        allow_subordinates: bool,
    ) -> Result<LocalTransaction> {
        let _guard = self.operation().await?;
        let id = self.next_transaction_id();
        if self.0.handshake.requires_optimized_transactions() {
            return Ok(LocalTransaction::new(
                self.clone(),
                id,
                true,
                allow_subordinates,
                false,
            ));
        }
        let mut request = self.request();
        request.put_i32(id);
        if self.0.handshake.supports(level::OPTIMIZED_TRANSACTIONS) {
            request.put_bool(allow_subordinates);
        }
        let mut reply = self
            .exchange(Segment::CREATE_UCTRANSACTION, Priority::Medium, request)
            .await?;
        reply.check_completion(
            Segment::CREATE_UCTRANSACTION.reply(),
            cascade::CONNECTION_SIMPLE,
        )?;
        debug!("created transaction {id} on connection {}", self.object_id());
        Ok(LocalTransaction::new(
            self.clone(),
            id,
            false,
            allow_subordinates,
            true,
        ))
    }

    /// An XA resource bound to this connection and its branch table.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`](crate::error::ProxyError::ConnectionUnavailable)
    /// once closed.
    pub async fn get_xa_resource(&self) -> Result<XaResource> {
        let _guard = self.operation().await?;
        Ok(XaResource::new(self.clone(), Arc::clone(&self.0.xid_table)))
    }

    /// A transaction on this connection rolled back; let every consumer
    /// session drop messages it buffered ahead of the rollback.
    pub async fn rollback_occurred(&self) {
        for session in self.0.sessions.active_sessions() {
            session.rollback_occurred().await;
        }
    }
}
