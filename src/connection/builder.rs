//! Establishing root connections.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicI16, AtomicI32},
    },
};

use log::debug;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use super::{
    ActiveConnection, Connection, ConnectionInner, ConnectionKind, EngineIdentity, Established,
    ReceiveRouter, exchange_on,
};
use crate::{
    codec::{BincodeMessageCodec, MessageCodec, ReplyBuffer, RequestBuffer},
    completion::cascade,
    config::{ConfigError, ProxyConfig},
    conversation::{Conversation, Priority},
    error::{ProxyError, Result},
    protocol::{HandshakeProperties, Segment, level},
    registry::{ProxyIdAllocator, SessionRegistry},
    transaction::XidTable,
};

/// Builder for a root [`Connection`].
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use wireproxy::{config::ProxyConfig, connection::Connection, conversation::Conversation};
/// # async fn demo(conversation: Arc<dyn Conversation>) -> wireproxy::Result<()> {
/// let connection = Connection::builder(conversation)
///     .config(ProxyConfig::default().max_cached_clones(4))
///     .user("admin")
///     .connect()
///     .await?;
/// # drop(connection);
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct ConnectionBuilder {
    conversation: Arc<dyn Conversation>,
    config: ProxyConfig,
    codec: Option<Arc<dyn MessageCodec>>,
    xid_table: Option<Arc<XidTable>>,
    user: Option<String>,
}

impl ConnectionBuilder {
    pub(super) fn new(conversation: Arc<dyn Conversation>) -> Self {
        Self {
            conversation,
            config: ProxyConfig::default(),
            codec: None,
            xid_table: None,
            user: None,
        }
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `codec` instead of a [`BincodeMessageCodec`] sized from the
    /// configuration.
    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Record XA branches in `table` instead of the process-wide table.
    pub fn xid_table(mut self, table: Arc<XidTable>) -> Self {
        self.xid_table = Some(table);
        self
    }

    /// Connect as `user` instead of the identity of the link.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Exchange the connect flow and build the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for an invalid configuration, or the
    /// peer's error from the connect cascade.
    pub async fn connect(self) -> Result<Connection> {
        self.config.validate()?;
        let codec = match self.codec {
            Some(codec) => codec,
            None => {
                let slice = self
                    .config
                    .max_slice_size_value()
                    .ok_or(ConfigError::ZeroSliceSize)?;
                Arc::new(BincodeMessageCodec::new(slice))
            }
        };
        let router = Arc::new(ReceiveRouter::default());
        self.conversation.set_receive_listener(router.clone());
        let handshake = self.conversation.handshake();

        let mut request = RequestBuffer::new();
        request.put_opt_string(self.user.as_deref())?;
        let mut reply = exchange_on(
            self.conversation.as_ref(),
            Segment::CONNECT,
            Priority::Medium,
            request,
        )
        .await?;
        reply.check_completion(Segment::CONNECT.reply(), cascade::CONNECT)?;
        let object_id = reply.get_i16()?;
        let engine = EngineIdentity {
            name: reply.get_string()?,
            uuid: reply.get_string()?,
            user: reply.get_opt_string()?,
        };
        let established = read_level_fields(object_id, &mut reply, handshake)?;
        debug!(
            "connected to engine {} as connection {object_id} on conversation {}",
            engine.name,
            self.conversation.id()
        );
        let connection = assemble(Assembly {
            conversation: self.conversation,
            config: self.config,
            codec,
            xid_table: self.xid_table.unwrap_or_else(XidTable::shared),
            kind: ConnectionKind::Standard,
            engine,
            parent: None,
            established,
        });
        router.bind(&connection);
        Ok(connection)
    }
}

/// Everything needed to put a connection together.
pub(super) struct Assembly {
    pub(super) conversation: Arc<dyn Conversation>,
    pub(super) config: ProxyConfig,
    pub(super) codec: Arc<dyn MessageCodec>,
    pub(super) xid_table: Arc<XidTable>,
    pub(super) kind: ConnectionKind,
    pub(super) engine: EngineIdentity,
    pub(super) parent: Option<Weak<ConnectionInner>>,
    pub(super) established: Established,
}

pub(super) fn assemble(parts: Assembly) -> Connection {
    let handshake = parts.conversation.handshake();
    let connection = Connection::from_inner(Arc::new(ConnectionInner {
        conversation: parts.conversation,
        handshake,
        config: parts.config,
        codec: parts.codec,
        xid_table: parts.xid_table,
        kind: parts.kind,
        engine: parts.engine,
        parent: parts.parent,
        object_id: AtomicI16::new(parts.established.object_id),
        general: AsyncMutex::new(()),
        close_lock: Arc::new(RwLock::new(())),
        closed: AtomicBool::new(false),
        active: Mutex::new(Some(ActiveConnection::new())),
        sessions: SessionRegistry::default(),
        proxy_ids: ProxyIdAllocator::default(),
        transaction_ids: AtomicI32::new(1),
        ordering_ids: AtomicI16::new(1),
        ordering_pool: Mutex::new(VecDeque::new()),
        unique_id_stem: Mutex::new(None),
        queue_group: Mutex::new(None),
        listeners: Mutex::new(Vec::new()),
        clone_cache: Mutex::new(Vec::new()),
        receive: AsyncMutex::new(()),
        pending_slices: Mutex::new(None),
    }));
    connection.adopt(parts.established);
    connection
}

/// Read the fields a connect, clone or reset reply carries from level 9.
pub(super) fn read_level_fields(
    object_id: i16,
    reply: &mut ReplyBuffer,
    handshake: HandshakeProperties,
) -> std::result::Result<Established, ProxyError> {
    let mut established = Established {
        object_id,
        unique_id_stem: None,
        ordering_id: None,
    };
    if handshake.supports(level::CHUNKING) {
        established.unique_id_stem = Some(reply.get_short_bytes()?);
        established.ordering_id = Some(reply.get_i16()?);
    }
    Ok(established)
}

impl Connection {
    /// Apply the identity from a connect, clone or reset reply.
    pub(super) fn adopt(&self, established: Established) {
        self.0
            .object_id
            .store(established.object_id, std::sync::atomic::Ordering::Release);
        *super::lock(&self.0.unique_id_stem) = established.unique_id_stem;
        if let Some(id) = established.ordering_id {
            super::lock(&self.0.ordering_pool).push_back(id);
        }
    }
}

impl Connection {
    /// Connect over `conversation` with `config`, optionally as `user`.
    ///
    /// Shorthand for [`Connection::builder`] with the same settings.
    ///
    /// # Errors
    ///
    /// See [`ConnectionBuilder::connect`].
    pub async fn connect(
        conversation: Arc<dyn Conversation>,
        config: ProxyConfig,
        user: Option<&str>,
    ) -> Result<Self> {
        let mut builder = Self::builder(conversation).config(config);
        if let Some(user) = user {
            builder = builder.user(user);
        }
        builder.connect().await
    }
}
