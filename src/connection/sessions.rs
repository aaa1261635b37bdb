//! Session creation.

use std::{collections::HashMap, sync::Arc};

use log::debug;

use super::{BrowserOptions, Connection, ConsumerOptions, ProducerOptions};
use crate::{
    codec::{ReplyBuffer, RequestBuffer},
    completion::{ExceptionKind, cascade},
    conversation::Priority,
    error::{ProxyError, Result},
    message::{DestinationAddress, DestinationType, Reliability},
    ordering,
    protocol::{
        ConsumerFlags, HandshakeProperties, NO_DESTINATION_TYPE, NO_RELIABILITY, ProducerFlags,
        ReplyFlags, Segment, level,
    },
    proxy_queue::ProxyQueue,
    registry::ProxyId,
    session::{
        BifurcatedConsumerSession, BrowserSession, ConsumerParts, ConsumerSession,
        ProducerSession,
    },
};

/// Browser flag asking the peer to gather messages from every queue point.
const BROWSER_ALLOW_GATHERING: u16 = 0x0100;

/// Consumer creation flags for `options` at the negotiated level.
///
/// Ignoring initial in-doubts is dropped silently below level 5; gathering
/// and shared subscriptions fail below the level that introduced them.
pub(super) fn consumer_flags(
    handshake: HandshakeProperties,
    options: &ConsumerOptions,
) -> Result<ConsumerFlags> {
    let mut flags = ConsumerFlags::UNICAST;
    if options.read_ahead && !options.bifurcatable {
        flags |= ConsumerFlags::READ_AHEAD;
    }
    if options.no_local {
        flags |= ConsumerFlags::NO_LOCAL;
    }
    if options.bifurcatable {
        flags |= ConsumerFlags::BIFURCATABLE;
    }
    if options.ignore_initial_indoubts && handshake.supports(level::OPTIMIZED_TRANSACTIONS) {
        flags |= ConsumerFlags::IGNORE_INITIAL_INDOUBTS;
    }
    if options.allow_gathering {
        handshake.require(level::CHUNKING)?;
        flags |= ConsumerFlags::ALLOW_GATHERING;
    }
    if options.subscription_name.is_some() {
        handshake.require(level::SHARED_SUBSCRIPTIONS)?;
        flags |= ConsumerFlags::MULTI_CONSUMER;
    }
    Ok(flags)
}

fn destination_type_wire(destination_type: Option<DestinationType>) -> i16 {
    destination_type.map_or(NO_DESTINATION_TYPE, DestinationType::to_wire)
}

impl Connection {
    /// Exchange a request and check its completion against `cascade`.
    async fn create(
        &self,
        segment: Segment,
        request: RequestBuffer,
        cascade: &[ExceptionKind],
    ) -> Result<ReplyBuffer> {
        let mut reply = self.exchange(segment, Priority::Medium, request).await?;
        reply.check_completion(segment.reply(), cascade)?;
        Ok(reply)
    }

    /// Read-ahead queue for a new consumer, when it reads ahead at all.
    fn read_ahead_queue(
        &self,
        id: ProxyId,
        options: &ConsumerOptions,
    ) -> Result<Option<Arc<ProxyQueue>>> {
        if options.read_ahead && !options.bifurcatable {
            Ok(Some(self.queue_group()?.create_read_ahead_queue(id)?))
        } else {
            Ok(None)
        }
    }

    fn bury(&self, id: ProxyId) {
        if let Some(group) = self.existing_queue_group() {
            group.bury(id);
        }
    }

    fn register_consumer(
        &self,
        proxy_id: ProxyId,
        message_processor_id: i64,
        destination: &DestinationAddress,
        options: &ConsumerOptions,
        read_ahead_queue: Option<Arc<ProxyQueue>>,
    ) -> ConsumerSession {
        let session = ConsumerSession::new(ConsumerParts {
            proxy_id,
            connection: self.clone(),
            message_processor_id,
            destination: destination.clone(),
            destination_type: options.destination_type,
            unrecoverable_reliability: options.unrecoverable_reliability,
            bifurcatable: options.bifurcatable,
            read_ahead_queue,
        });
        self.0.sessions.insert(proxy_id, &session);
        debug!(
            "created consumer session {proxy_id} on connection {}",
            self.object_id()
        );
        session
    }

    /// Create a consumer session on `destination`.
    ///
    /// A read-ahead consumer gets its proxy queue before the flow; the
    /// queue is buried again if creation fails.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ProtocolLevel`] for options the peer's level
    /// does not support, [`ProxyError::ConnectionUnavailable`] once closed,
    /// [`ProxyError::Error`] for a multicast consumer, or the peer's error
    /// from the consumer cascade.
    pub async fn create_consumer_session(
        &self,
        destination: &DestinationAddress,
        options: &ConsumerOptions,
    ) -> Result<ConsumerSession> {
        let handshake = self.0.handshake;
        let flags = consumer_flags(handshake, options)?;
        if options.message_control_properties.is_some() {
            handshake.require(level::CHUNKING)?;
        }
        let _guard = self.operation().await?;
        let proxy_id = self.next_proxy_id()?;
        let queue = self.read_ahead_queue(proxy_id, options)?;

        let created = async {
            let mut request = self.request();
            request.put_i16(proxy_id.as_i16());
            request.put_u16(flags.bits());
            request.put_i16(options.reliability.map_or(NO_RELIABILITY, Reliability::to_wire));
            request.put_i32(self.0.config.read_ahead_high_queue_bytes_value());
            request.put_i16(destination_type_wire(options.destination_type));
            request.put_i16(options.unrecoverable_reliability.to_wire());
            request.put_destination(destination)?;
            if handshake.supports(level::SHARED_SUBSCRIPTIONS) {
                request.put_opt_string(options.subscription_name.as_deref())?;
            }
            request.put_criteria(options.criteria.as_ref())?;
            request.put_opt_string(options.alternate_user.as_deref())?;
            if handshake.supports(level::CHUNKING) {
                let empty = HashMap::new();
                let properties = options.message_control_properties.as_ref().unwrap_or(&empty);
                request.put_properties(properties)?;
            }
            let mut reply = self
                .create(Segment::CREATE_CONSUMER_SESS, request, cascade::CREATE_CONSUMER)
                .await?;
            let message_processor_id = reply.get_i64()?;
            let reply_flags = ReplyFlags::from_bits_truncate(reply.get_u16()?);
            if reply_flags.contains(ReplyFlags::MULTICAST) {
                return Err(ProxyError::Error(
                    "multicast consumer sessions are not supported".into(),
                ));
            }
            Ok::<_, ProxyError>(message_processor_id)
        }
        .await;

        match created {
            Ok(message_processor_id) => Ok(self.register_consumer(
                proxy_id,
                message_processor_id,
                destination,
                options,
                queue,
            )),
            Err(error) => {
                if queue.is_some() {
                    self.bury(proxy_id);
                }
                Err(error)
            }
        }
    }

    /// Create a consumer session attached to the durable subscription
    /// `subscription_name`.
    ///
    /// # Errors
    ///
    /// As [`create_consumer_session`](Self::create_consumer_session), with
    /// the durable consume cascade.
    pub async fn create_consumer_session_for_durable_subscription(
        &self,
        subscription_name: &str,
        destination: &DestinationAddress,
        durable_home: Option<&str>,
        options: &ConsumerOptions,
    ) -> Result<ConsumerSession> {
        let flags = consumer_flags(self.0.handshake, options)?;
        let _guard = self.operation().await?;
        let proxy_id = self.next_proxy_id()?;
        let queue = self.read_ahead_queue(proxy_id, options)?;

        let created = async {
            let mut request = self.request();
            request.put_i16(proxy_id.as_i16());
            request.put_u16(flags.bits());
            request.put_i16(options.reliability.map_or(NO_RELIABILITY, Reliability::to_wire));
            request.put_i32(self.0.config.read_ahead_high_queue_bytes_value());
            request.put_i16(options.unrecoverable_reliability.to_wire());
            request.put_destination(destination)?;
            request.put_string(subscription_name)?;
            request.put_opt_string(durable_home)?;
            request.put_criteria(options.criteria.as_ref())?;
            request.put_opt_string(options.alternate_user.as_deref())?;
            let mut reply = self
                .create(
                    Segment::CREATE_CONSUMER_FOR_DURABLE_SUB,
                    request,
                    cascade::CONSUME_DURABLE,
                )
                .await?;
            Ok::<_, ProxyError>(reply.get_i64()?)
        }
        .await;

        match created {
            Ok(message_processor_id) => Ok(self.register_consumer(
                proxy_id,
                message_processor_id,
                destination,
                options,
                queue,
            )),
            Err(error) => {
                if queue.is_some() {
                    self.bury(proxy_id);
                }
                Err(error)
            }
        }
    }

    /// Create a producer session sending to `destination`.
    ///
    /// The session holds one use of the ordering context from before the
    /// flow; a failed flow gives it back.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ProtocolLevel`] when producer flags are
    /// requested below level 9, or the peer's error from the producer
    /// cascade.
    pub async fn create_producer_session(
        &self,
        destination: &DestinationAddress,
        options: &ProducerOptions,
    ) -> Result<ProducerSession> {
        let mut flags = ProducerFlags::empty();
        if options.bind_to_queue_point {
            flags |= ProducerFlags::BIND_TO_QUEUE_POINT;
        }
        if options.prefer_local {
            flags |= ProducerFlags::PREFER_LOCAL;
        }
        if !flags.is_empty() {
            self.0.handshake.require(level::CHUNKING)?;
        }
        let _guard = self.operation().await?;
        let ordering = options.ordering.clone();
        if let Some(ordering) = &ordering {
            ordering.increment_use_count();
        }

        let created = async {
            let mut request = self.request();
            request.put_i16(ordering::wire_id(ordering.as_ref()));
            request.put_i16(destination_type_wire(options.destination_type));
            if self.0.handshake.supports(level::CHUNKING) {
                request.put_u16(flags.bits());
            }
            request.put_destination(destination)?;
            request.put_opt_string(options.discriminator.as_deref())?;
            request.put_opt_string(options.alternate_user.as_deref())?;
            let mut reply = self
                .create(Segment::CREATE_PRODUCER_SESS, request, cascade::CREATE_PRODUCER)
                .await?;
            Ok::<_, ProxyError>(ProxyId::new(reply.get_i16()?))
        }
        .await;

        match created {
            Ok(proxy_id) => Ok(ProducerSession::new(
                proxy_id,
                self.clone(),
                destination.clone(),
                options.destination_type,
                ordering,
            )),
            Err(error) => {
                if let Some(ordering) = &ordering {
                    ordering.decrement_use_count();
                }
                Err(error)
            }
        }
    }

    /// Create a browser session over `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ProtocolLevel`] when gathering is requested
    /// below level 9, or the peer's error from the browser cascade.
    pub async fn create_browser_session(
        &self,
        destination: &DestinationAddress,
        options: &BrowserOptions,
    ) -> Result<BrowserSession> {
        if options.allow_gathering {
            self.0.handshake.require(level::CHUNKING)?;
        }
        let _guard = self.operation().await?;
        let proxy_id = self.next_proxy_id()?;
        let mut request = self.request();
        request.put_i16(proxy_id.as_i16());
        request.put_i32(self.0.config.read_ahead_high_queue_bytes_value());
        request.put_i16(destination_type_wire(options.destination_type));
        if self.0.handshake.supports(level::CHUNKING) {
            request.put_u16(if options.allow_gathering {
                BROWSER_ALLOW_GATHERING
            } else {
                0
            });
        }
        request.put_destination(destination)?;
        request.put_criteria(options.criteria.as_ref())?;
        request.put_opt_string(options.alternate_user.as_deref())?;
        self.create(Segment::CREATE_BROWSER_SESS, request, cascade::CREATE_BROWSER)
            .await?;
        Ok(BrowserSession::new(
            proxy_id,
            self.clone(),
            destination.clone(),
            options.criteria.clone(),
        ))
    }

    /// Create a session operating on messages locked by the consumer with
    /// `message_processor_id`.
    ///
    /// # Errors
    ///
    /// Returns the peer's error from the bifurcated cascade.
    pub async fn create_bifurcated_consumer_session(
        &self,
        message_processor_id: i64,
    ) -> Result<BifurcatedConsumerSession> {
        let _guard = self.operation().await?;
        let mut request = self.request();
        request.put_i64(message_processor_id);
        let mut reply = self
            .create(
                Segment::CREATE_BIFURCATED_SESS,
                request,
                cascade::CREATE_BIFURCATED,
            )
            .await?;
        let proxy_id = ProxyId::new(reply.get_i16()?);
        Ok(BifurcatedConsumerSession::new(
            proxy_id,
            self.clone(),
            message_processor_id,
        ))
    }
}
