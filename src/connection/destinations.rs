//! Destination administration and connection-scoped identifiers.

use std::{collections::HashMap, sync::atomic::Ordering};

use bytes::Bytes;

use super::{Connection, DurableSubscriptionOptions, lock};
use crate::{
    codec::{ReplyBuffer, RequestBuffer},
    completion::{ExceptionKind, cascade},
    conversation::Priority,
    error::{ProxyError, Result},
    message::{
        DestinationAddress, DestinationConfiguration, DestinationType, Distribution, Reliability,
    },
    ordering::OrderingContext,
    protocol::{NO_ORDER_CONTEXT, NO_RELIABILITY, Segment, level},
};

const DURABLE_NO_LOCAL: u16 = 0x0002;
const DURABLE_SHARED: u16 = 0x0004;

fn optional_reliability(value: i16) -> Result<Option<Reliability>> {
    if value == NO_RELIABILITY {
        Ok(None)
    } else {
        Reliability::from_wire(value).map(Some)
    }
}

impl Connection {
    async fn administer(
        &self,
        segment: Segment,
        request: RequestBuffer,
        cascade: &[ExceptionKind],
    ) -> Result<ReplyBuffer> {
        let _guard = self.operation().await?;
        let mut reply = self.exchange(segment, Priority::Medium, request).await?;
        reply.check_completion(segment.reply(), cascade)?;
        Ok(reply)
    }

    /// Create the durable subscription `subscription_name` on
    /// `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NotSupported`] for a shared subscription below
    /// level 20, or the peer's error from the durable create cascade.
    pub async fn create_durable_subscription(
        &self,
        subscription_name: &str,
        destination: &DestinationAddress,
        options: &DurableSubscriptionOptions,
    ) -> Result<()> {
        if options.shared && !self.0.handshake.supports(level::SHARED_SUBSCRIPTIONS) {
            return Err(ProxyError::NotSupported(
                "shared durable subscriptions need a newer engine".into(),
            ));
        }
        let mut flags = 0;
        if options.no_local {
            flags |= DURABLE_NO_LOCAL;
        }
        if options.shared {
            flags |= DURABLE_SHARED;
        }
        let mut request = self.request();
        request.put_u16(flags);
        request.put_destination(destination)?;
        request.put_string(subscription_name)?;
        request.put_opt_string(options.durable_home.as_deref())?;
        request.put_criteria(options.criteria.as_ref())?;
        request.put_opt_string(options.durable_user.as_deref())?;
        self.administer(Segment::CREATE_DURABLE_SUB, request, cascade::CREATE_DURABLE)
            .await
            .map(drop)
    }

    /// Delete the durable subscription `subscription_name`.
    ///
    /// # Errors
    ///
    /// Returns the peer's error from the durable delete cascade.
    pub async fn delete_durable_subscription(
        &self,
        subscription_name: &str,
        durable_home: Option<&str>,
    ) -> Result<()> {
        let mut request = self.request();
        request.put_string(subscription_name)?;
        request.put_opt_string(durable_home)?;
        self.administer(Segment::DELETE_DURABLE_SUB, request, cascade::DELETE_DURABLE)
            .await
            .map(drop)
    }

    /// Create a temporary destination that lives as long as the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidDestinationPrefix`] for a rejected
    /// prefix, or another error from the temporary create cascade.
    pub async fn create_temporary_destination(
        &self,
        distribution: Distribution,
        prefix: Option<&str>,
    ) -> Result<DestinationAddress> {
        let mut request = self.request();
        request.put_i16(distribution.to_wire());
        request.put_opt_string(prefix)?;
        let mut reply = self
            .administer(
                Segment::CREATE_TEMP_DESTINATION,
                request,
                cascade::CREATE_TEMPORARY,
            )
            .await?;
        Ok(reply.get_destination()?)
    }

    /// # Errors
    ///
    /// Returns the peer's error from the temporary delete cascade.
    pub async fn delete_temporary_destination(
        &self,
        destination: &DestinationAddress,
    ) -> Result<()> {
        let mut request = self.request();
        request.put_destination(destination)?;
        self.administer(
            Segment::DELETE_TEMP_DESTINATION,
            request,
            cascade::DELETE_TEMPORARY,
        )
        .await
        .map(drop)
    }

    /// Fetch the engine's attributes for `destination`.
    ///
    /// # Errors
    ///
    /// Returns the peer's error from the destination configuration
    /// cascade, or a codec error for a malformed reply.
    pub async fn get_destination_configuration(
        &self,
        destination: &DestinationAddress,
    ) -> Result<DestinationConfiguration> {
        let mut request = self.request();
        request.put_destination(destination)?;
        let mut reply = self
            .administer(
                Segment::GET_DESTINATION_CONFIGURATION,
                request,
                cascade::DESTINATION_CONFIGURATION,
            )
            .await?;
        let default_priority = reply.get_i32()?;
        let max_failed_deliveries = reply.get_i32()?;
        let default_reliability = optional_reliability(reply.get_i16()?)?;
        let max_reliability = optional_reliability(reply.get_i16()?)?;
        let destination_type = DestinationType::from_wire(reply.get_i16()?)?;
        let flags = reply.get_i16()?;
        let uuid = reply.get_string()?;
        let description = reply.get_string()?;
        let exception_destination = reply.get_opt_string()?;
        let name = reply.get_string()?;
        let count = reply.get_u16()?;
        let mut context = HashMap::with_capacity(usize::from(count));
        for _ in 0..count {
            context.insert(reply.get_string()?, reply.get_string()?);
        }
        Ok(DestinationConfiguration {
            default_priority,
            max_failed_deliveries,
            default_reliability,
            max_reliability,
            destination_type,
            flags,
            uuid,
            description,
            exception_destination,
            name,
            context,
        })
    }

    /// Return a unique identifier from the engine.
    ///
    /// The first call returns the stem handed out when the connection was
    /// established, if there was one.
    ///
    /// # Errors
    ///
    /// Returns the peer's error from the simple connection cascade.
    pub async fn create_unique_id(&self) -> Result<Bytes> {
        let _guard = self.operation().await?;
        if let Some(stem) = lock(&self.0.unique_id_stem).take() {
            return Ok(stem);
        }
        let mut reply = self
            .exchange(Segment::GET_UNIQUE_ID, Priority::Medium, self.request())
            .await?;
        reply.check_completion(Segment::GET_UNIQUE_ID.reply(), cascade::CONNECTION_SIMPLE)?;
        Ok(reply.get_short_bytes()?)
    }

    /// Create an ordering context, reusing an id pooled from the peer when
    /// one is available.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionUnavailable`] once closed.
    pub async fn create_ordering_context(&self) -> Result<OrderingContext> {
        let _guard = self.operation().await?;
        let pooled = lock(&self.0.ordering_pool).pop_front();
        let id = pooled.unwrap_or_else(|| loop {
            let id = self.0.ordering_ids.fetch_add(1, Ordering::AcqRel);
            if id != NO_ORDER_CONTEXT {
                break id;
            }
        });
        Ok(OrderingContext::new(id))
    }

    /// Listen for destinations matching `pattern` being created.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ProtocolLevel`] below level 9 and
    /// [`ProxyError::NotSupported`] otherwise.
    pub async fn add_destination_listener(&self, pattern: &str) -> Result<()> {
        self.0.handshake.require(level::CHUNKING)?;
        let _guard = self.operation().await?;
        Err(ProxyError::NotSupported(format!(
            "destination listeners for {pattern:?} are not available"
        )))
    }

    /// Monitor the consumers attached to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ProtocolLevel`] below level 14 and
    /// [`ProxyError::NotSupported`] otherwise.
    pub async fn register_consumer_set_monitor(
        &self,
        destination: &DestinationAddress,
    ) -> Result<()> {
        self.0.handshake.require(level::CONSUMER_SET_MONITOR)?;
        let _guard = self.operation().await?;
        Err(ProxyError::NotSupported(format!(
            "consumer set monitors for {} are not available",
            destination.name
        )))
    }
}
