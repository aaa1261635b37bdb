//! Sending and receiving messages through the connection.
//!
//! Producer sessions send through the same path as the connection itself;
//! only the routing fields at the head of each request differ. A message
//! whose encoded size reaches the chunking threshold is sent one slice per
//! transmission from level 9: every slice but the last goes without a
//! reply, and the last is exchanged when the send needs a reply at all.

use bytes::Bytes;
use log::warn;

use super::{Connection, ReceiveOptions, SendOptions, lock};
use crate::{
    chunk::{ChunkError, ChunkPlan, SliceAssembler},
    codec::{ReplyBuffer, RequestBuffer},
    completion::cascade,
    conversation::Priority,
    error::Result,
    message::{DestinationAddress, DestinationType, Message, ReceiveTimeout, Reliability},
    metrics,
    ordering::{self, OrderingContext},
    protocol::{ChunkFlags, NO_DESTINATION_TYPE, NO_RELIABILITY, Segment, level},
    registry::ProxyId,
    transaction::{self, Transaction},
};

/// Where a message is sent: through a producer session, or straight to a
/// destination named on the connection.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SendRoute<'a> {
    Session(ProxyId),
    Connection {
        destination: &'a DestinationAddress,
        destination_type: Option<DestinationType>,
        alternate_user: Option<&'a str>,
    },
}

impl SendRoute<'_> {
    /// Segments for a whole message: with a reply, then without.
    fn whole_segments(&self) -> (Segment, Segment) {
        match self {
            Self::Session(_) => (Segment::SEND_SESS_MSG, Segment::SEND_SESS_MSG_NOREPLY),
            Self::Connection { .. } => (Segment::SEND_CONN_MSG, Segment::SEND_CONN_MSG_NOREPLY),
        }
    }

    fn chunked_segments(&self) -> (Segment, Segment) {
        match self {
            Self::Session(_) => (
                Segment::SEND_CHUNKED_SESS_MSG,
                Segment::SEND_CHUNKED_SESS_MSG_NOREPLY,
            ),
            Self::Connection { .. } => (
                Segment::SEND_CHUNKED_CONN_MSG,
                Segment::SEND_CHUNKED_CONN_MSG_NOREPLY,
            ),
        }
    }
}

/// Whether a send must wait for the peer's reply.
///
/// Transacted sends go without a reply unless configured otherwise; the
/// transaction's completion reports any failure. Otherwise only the two
/// low-assurance reliabilities skip the reply, unless express sends are
/// configured to be exchanged.
pub(super) fn reply_required(
    transacted: bool,
    exchange_transacted: bool,
    exchange_express: bool,
    reliability: Reliability,
) -> bool {
    if transacted && !exchange_transacted {
        return false;
    }
    exchange_express || !reliability.is_low_assurance()
}

fn destination_type_wire(destination_type: Option<DestinationType>) -> i16 {
    destination_type.map_or(NO_DESTINATION_TYPE, DestinationType::to_wire)
}

impl Connection {
    /// Send `message` to `destination` without a producer session.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`](crate::error::ProxyError::ConnectionUnavailable)
    /// once closed, [`ProxyError::IncorrectCall`](crate::error::ProxyError::IncorrectCall)
    /// for a completed transaction, or the peer's error from the send
    /// cascade.
    pub async fn send(
        &self,
        message: &Message,
        transaction: Option<&Transaction>,
        destination: &DestinationAddress,
        options: &SendOptions,
    ) -> Result<()> {
        transaction::ensure_valid(transaction)?;
        self.transmit(
            SendRoute::Connection {
                destination,
                destination_type: options.destination_type,
                alternate_user: options.alternate_user.as_deref(),
            },
            message,
            transaction,
            options.ordering.as_ref(),
        )
        .await
    }

    /// Send `message` along `route`, whole or in chunks.
    pub(crate) async fn transmit(
        &self,
        route: SendRoute<'_>,
        message: &Message,
        transaction: Option<&Transaction>,
        ordering: Option<&OrderingContext>,
    ) -> Result<()> {
        let _guard = match route {
            SendRoute::Session(_) => self.shared().await?,
            SendRoute::Connection { .. } => self.operation().await?,
        };
        let config = &self.0.config;
        let reply = reply_required(
            transaction.is_some(),
            config.exchange_transacted_sends_value(),
            config.exchange_express_sends_value(),
            message.reliability,
        );
        let priority = Priority::for_message(message.priority);
        let plan = ChunkPlan::new(self.codec().encode(message)?);
        if self.0.handshake.supports(level::CHUNKING)
            && plan.needs_chunking(config.chunking_threshold_value())
        {
            self.send_chunked(route, plan, transaction, ordering, reply, priority)
                .await?;
        } else {
            self.send_whole(route, plan, transaction, ordering, reply, priority)
                .await?;
        }
        if !reply {
            if let Some(transaction) = transaction {
                transaction.update_lowest_message_priority(priority);
            }
        }
        Ok(())
    }

    /// Start a send request with the connection id and the route's id.
    fn route_request(
        &self,
        route: SendRoute<'_>,
        ordering: Option<&OrderingContext>,
    ) -> RequestBuffer {
        let mut request = self.request();
        match route {
            SendRoute::Session(proxy_id) => request.put_i16(proxy_id.as_i16()),
            SendRoute::Connection { .. } => request.put_i16(ordering::wire_id(ordering)),
        }
        request
    }

    fn put_address(request: &mut RequestBuffer, route: SendRoute<'_>) -> Result<()> {
        if let SendRoute::Connection {
            destination,
            destination_type,
            alternate_user,
        } = route
        {
            request.put_i16(destination_type_wire(destination_type));
            request.put_opt_string(alternate_user)?;
            request.put_destination(destination)?;
        }
        Ok(())
    }

    async fn send_whole(
        &self,
        route: SendRoute<'_>,
        plan: ChunkPlan,
        transaction: Option<&Transaction>,
        ordering: Option<&OrderingContext>,
        reply: bool,
        priority: Priority,
    ) -> Result<()> {
        let mut request = self.route_request(route, ordering);
        transaction::put_transaction(&mut request, transaction)?;
        Self::put_address(&mut request, route)?;
        request.put_i32(1);
        request.put_slice(&plan.into_whole())?;
        let (exchanged, sent) = route.whole_segments();
        self.deliver(exchanged, sent, priority, request, reply).await
    }

    async fn send_chunked(
        &self,
        route: SendRoute<'_>,
        plan: ChunkPlan,
        transaction: Option<&Transaction>,
        ordering: Option<&OrderingContext>,
        reply: bool,
        priority: Priority,
    ) -> Result<()> {
        let (exchanged, sent) = route.chunked_segments();
        for chunk in plan.into_chunks() {
            let mut request = self.route_request(route, ordering);
            transaction::put_transaction(&mut request, transaction)?;
            request.put_u8(chunk.flags.bits());
            if chunk.is_first() {
                Self::put_address(&mut request, route)?;
            }
            request.put_slice(&chunk.payload)?;
            metrics::inc_chunks_sent();
            if chunk.is_last() {
                self.deliver(exchanged, sent, priority, request, reply).await?;
            } else {
                self.send_request(sent, priority, request).await?;
            }
        }
        Ok(())
    }

    async fn deliver(
        &self,
        exchanged: Segment,
        sent: Segment,
        priority: Priority,
        request: RequestBuffer,
        reply: bool,
    ) -> Result<()> {
        if !reply {
            return self.send_request(sent, priority, request).await;
        }
        let mut reply = self.exchange(exchanged, priority, request).await?;
        reply.check_completion(exchanged.reply(), cascade::SEND)
    }

    /// Receive one message from `destination` if one is available now.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`](crate::error::ProxyError::ConnectionUnavailable)
    /// once closed, or the peer's error from the receive cascade.
    pub async fn receive_no_wait(
        &self,
        destination: &DestinationAddress,
        transaction: Option<&Transaction>,
        options: &ReceiveOptions,
    ) -> Result<Option<Message>> {
        transaction::ensure_valid(transaction)?;
        let request = Self::receive_request(
            self.request(),
            destination,
            transaction,
            ReceiveTimeout::NoWait,
            options,
        )?;
        let _receive = self.0.receive.lock().await;
        let mut reply = {
            let _guard = self.operation().await?;
            self.exchange(Segment::RECEIVE_CONN_MSG, Priority::Medium, request)
                .await?
        };
        self.finish_receive(&mut reply)
    }

    /// Receive one message from `destination`, waiting up to `timeout`.
    ///
    /// The wait holds no close or general lock, so the connection can be
    /// closed while a receive is outstanding. Connection-level receives run
    /// one at a time because pushed slices are buffered per connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`](crate::error::ProxyError::ConnectionUnavailable)
    /// once closed, or the peer's error from the receive cascade.
    pub async fn receive_with_wait(
        &self,
        destination: &DestinationAddress,
        transaction: Option<&Transaction>,
        timeout: ReceiveTimeout,
        options: &ReceiveOptions,
    ) -> Result<Option<Message>> {
        transaction::ensure_valid(transaction)?;
        let request =
            Self::receive_request(self.request(), destination, transaction, timeout, options)?;
        let _receive = self.0.receive.lock().await;
        let mut reply = self
            .exchange_unguarded(Segment::RECEIVE_CONN_MSG, Priority::Medium, request)
            .await?;
        self.finish_receive(&mut reply)
    }

    fn receive_request(
        mut request: RequestBuffer,
        destination: &DestinationAddress,
        transaction: Option<&Transaction>,
        timeout: ReceiveTimeout,
        options: &ReceiveOptions,
    ) -> Result<RequestBuffer> {
        transaction::put_transaction(&mut request, transaction)?;
        request.put_i16(options.reliability.map_or(NO_RELIABILITY, Reliability::to_wire));
        request.put_i64(timeout.to_wire());
        request.put_i16(destination_type_wire(options.destination_type));
        request.put_i16(options.unrecoverable_reliability.to_wire());
        request.put_destination(destination)?;
        request.put_criteria(options.criteria.as_ref())?;
        request.put_opt_string(options.alternate_user.as_deref())?;
        Ok(request)
    }

    fn finish_receive(&self, reply: &mut ReplyBuffer) -> Result<Option<Message>> {
        reply.check_completion(Segment::RECEIVE_CONN_MSG.reply(), cascade::RECEIVE)?;
        let pending = lock(&self.0.pending_slices).take();
        self.read_received_message(reply, pending)
    }

    /// Read the message carried by a receive reply.
    ///
    /// The reply holds a slice count followed by the slices; a count of
    /// zero means no message was available. When slices were pushed ahead
    /// of the reply, the reply's slices complete that message.
    pub(crate) fn read_received_message(
        &self,
        reply: &mut ReplyBuffer,
        pending: Option<SliceAssembler>,
    ) -> Result<Option<Message>> {
        let count = usize::try_from(reply.get_i32()?).unwrap_or_default();
        if count == 0 {
            return Ok(None);
        }
        let mut slices = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            slices.push(reply.get_slice()?);
        }
        let slices = match pending {
            None => slices,
            Some(mut assembler) => {
                let mut complete = None;
                for (index, slice) in slices.into_iter().enumerate() {
                    let flags = if index + 1 == count {
                        ChunkFlags::LAST
                    } else {
                        ChunkFlags::MIDDLE
                    };
                    complete = assembler.push(flags, slice)?;
                }
                complete.ok_or(ChunkError::MissingFirst)?
            }
        };
        Ok(Some(self.codec().decode(&slices)?))
    }

    /// Buffer one pushed slice of a chunked connection-level receive.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Chunk`](crate::error::ProxyError::Chunk) for an
    /// out-of-order slice.
    pub fn add_message_part(&self, flags: ChunkFlags, slice: Bytes) -> Result<()> {
        let mut pending = lock(&self.0.pending_slices);
        let assembler = pending.get_or_insert_with(SliceAssembler::new);
        match assembler.push(flags, slice) {
            Ok(None) => Ok(()),
            Ok(Some(_)) => {
                warn!(
                    "connection {} got a complete message outside a receive reply; dropped",
                    self.object_id()
                );
                *pending = None;
                Ok(())
            }
            Err(error) => {
                *pending = None;
                Err(error.into())
            }
        }
    }
}
