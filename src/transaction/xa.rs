//! XA resources.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use log::{debug, warn};

use super::{
    LowestPriority, XaFlags, XaVote, Xid, XidTable,
    xid_table::Branch,
};
use crate::{
    codec::{ReplyBuffer, RequestBuffer},
    completion::{self, ExceptionKind, NO_EXCEPTION, cascade},
    connection::Connection,
    error::{ProxyError, Result, XaError},
    protocol::{OptimizedTxFlags, Segment, level},
};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Enlistment {
    xid: Xid,
    joined: bool,
}

/// How a completion call reaches its branch.
enum Route {
    /// This resource owns the branch.
    Owned(BranchView),
    /// Another resource owns the branch.
    Delegate(XaResource),
    /// The branch is unknown locally; ask the peer directly.
    Recover,
}

#[derive(Clone, Copy)]
struct BranchView {
    transaction_id: i32,
    server_created: bool,
    prepared: bool,
    end_flags: XaFlags,
}

/// Failure of an XA flow before it is mapped onto an [`XaError`].
enum FlowFailure {
    Xa(XaError),
    Other(ProxyError),
}

impl FlowFailure {
    fn into_xa(self, operation: &str) -> XaError {
        match self {
            Self::Xa(error) => error,
            Self::Other(error) => {
                warn!("xa {operation} failed: {error}");
                XaError::ResourceManagerFailure
            }
        }
    }
}

struct XaInner {
    id: u64,
    connection: Connection,
    table: Arc<XidTable>,
    enlisted: Mutex<Option<Enlistment>>,
    previous_end: Mutex<Option<Xid>>,
    timeout: AtomicU32,
    lowest_priority: LowestPriority,
}

/// A connection's participation in global transactions.
///
/// `start` and `end` only update the shared [`XidTable`] when the peer uses
/// optimized transactions; the branch is created on the peer by the first
/// transacted request made while enlisted. `prepare`, `commit` and
/// `rollback` may be called on any resource sharing the table and are
/// delegated to the branch owner.
#[derive(Clone)]
pub struct XaResource(Arc<XaInner>);

impl fmt::Debug for XaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaResource")
            .field("id", &self.0.id)
            .field("enlisted", &self.current_xid())
            .finish_non_exhaustive()
    }
}

impl XaResource {
    pub(crate) fn new(connection: Connection, table: Arc<XidTable>) -> Self {
        Self(Arc::new(XaInner {
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            table,
            enlisted: Mutex::new(None),
            previous_end: Mutex::new(None),
            timeout: AtomicU32::new(0),
            lowest_priority: LowestPriority::default(),
        }))
    }

    #[must_use]
    pub fn connection(&self) -> &Connection { &self.0.connection }

    /// The table this resource records its branches in.
    #[must_use]
    pub fn xid_table(&self) -> &Arc<XidTable> { &self.0.table }

    /// Returns true when both handles refer to the same resource.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }

    /// The branch this resource is currently enlisted in.
    #[must_use]
    pub fn current_xid(&self) -> Option<Xid> {
        self.lock_enlisted().as_ref().map(|enlistment| enlistment.xid.clone())
    }

    #[must_use]
    pub fn is_enlisted(&self) -> bool { self.lock_enlisted().is_some() }

    /// Returns true when `other` talks to the same resource manager.
    #[must_use]
    pub fn is_same_rm(&self, other: &Self) -> bool {
        self.0.connection.same_as(&other.0.connection)
    }

    /// Transaction timeout in seconds; zero means the manager's default.
    #[must_use]
    pub fn transaction_timeout(&self) -> u32 { self.0.timeout.load(Ordering::Acquire) }

    /// Record a transaction timeout. Always accepted.
    pub fn set_transaction_timeout(&self, seconds: u32) -> bool {
        self.0.timeout.store(seconds, Ordering::Release);
        true
    }

    pub(super) fn lowest_priority(&self) -> &LowestPriority { &self.0.lowest_priority }

    fn lock_enlisted(&self) -> MutexGuard<'_, Option<Enlistment>> {
        self.0.enlisted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_previous_end(&self) -> MutexGuard<'_, Option<Xid>> {
        self.0.previous_end.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn optimized(&self) -> bool {
        self.0
            .connection
            .handshake()
            .requires_optimized_transactions()
    }

    /// Write the transaction field for work done while enlisted.
    pub(super) fn encode(&self, request: &mut RequestBuffer) -> Result<()> {
        let xid = self
            .current_xid()
            .ok_or_else(|| ProxyError::incorrect_call("xa resource is not enlisted"))?;
        let (owner, transaction_id, create) = self
            .0
            .table
            .with_branch(&xid, |branch| {
                let create = !branch.server_created;
                branch.server_created = true;
                (branch.owner.clone(), branch.transaction_id, create)
            })
            .ok_or_else(|| ProxyError::Xa(XaError::UnknownXid))?;
        if !self.optimized() {
            request.put_i32(transaction_id);
            return Ok(());
        }
        let mut flags = OptimizedTxFlags::TRANSACTED;
        let previous_end = if create {
            flags |= OptimizedTxFlags::CREATE;
            owner.take_previous_end()
        } else {
            None
        };
        if previous_end.is_some() {
            flags |= OptimizedTxFlags::END_PREVIOUS;
        }
        request.put_u32(flags.bits());
        request.put_u32(self.0.connection.conversation_id());
        request.put_i32(transaction_id);
        if create {
            if let Some(end_flags) = previous_end {
                request.put_u32(end_flags.bits());
            }
            request.put_xid(&xid)?;
        }
        Ok(())
    }

    /// Flags of this resource's previously ended branch, if its end is
    /// still owed to the peer.
    fn take_previous_end(&self) -> Option<XaFlags> {
        let xid = self.lock_previous_end().take()?;
        self.take_end_owed(&xid)
    }

    fn take_end_owed(&self, xid: &Xid) -> Option<XaFlags> {
        self.0
            .table
            .with_branch(xid, |branch| {
                std::mem::take(&mut branch.end_owed).then_some(branch.end_flags)
            })
            .flatten()
    }

    /// Associate this resource with the branch `xid`.
    ///
    /// With [`XaFlags::JOIN`] the resource joins a branch started elsewhere;
    /// with [`XaFlags::RESUME`] it resumes a branch it suspended.
    ///
    /// # Errors
    ///
    /// Returns [`XaError::Protocol`] when already enlisted,
    /// [`XaError::DuplicateXid`] for a new branch whose xid is in use,
    /// [`XaError::UnknownXid`] when joining or resuming an unknown branch and
    /// [`XaError::ResourceManagerFailure`] when the connection is closed.
    pub async fn start(&self, xid: &Xid, flags: XaFlags) -> std::result::Result<(), XaError> {
        if self.0.connection.is_closed() {
            return Err(XaError::ResourceManagerFailure);
        }
        {
            let mut enlisted = self.lock_enlisted();
            if enlisted.is_some() {
                return Err(XaError::Protocol);
            }
            *enlisted = Some(Enlistment {
                xid: xid.clone(),
                joined: flags.contains(XaFlags::JOIN),
            });
        }
        let started = self.start_branch(xid, flags).await;
        if started.is_err() {
            *self.lock_enlisted() = None;
        }
        started
    }

    async fn start_branch(&self, xid: &Xid, flags: XaFlags) -> std::result::Result<(), XaError> {
        if flags.contains(XaFlags::JOIN) {
            return self
                .0
                .table
                .with_branch(xid, |branch| branch.joined += 1)
                .ok_or(XaError::UnknownXid);
        }
        if flags.contains(XaFlags::RESUME) {
            let owned = self
                .0
                .table
                .with_branch(xid, |branch| branch.owner.same_as(self))
                .ok_or(XaError::UnknownXid)?;
            return if owned { Ok(()) } else { Err(XaError::Protocol) };
        }
        let transaction_id = self.0.connection.next_transaction_id();
        let optimized = self.optimized();
        self.0
            .table
            .register(xid.clone(), Branch::new(self.clone(), transaction_id, !optimized))?;
        debug!("xa branch {xid} started as transaction {transaction_id}");
        if optimized {
            return Ok(());
        }
        let mut request = self.branch_request(transaction_id, xid)?;
        request.put_u32(flags.bits());
        if let Err(failure) = self.flow(Segment::XA_START, request).await {
            self.0.table.remove(xid);
            return Err(failure.into_xa("start"));
        }
        Ok(())
    }

    /// Dissociate this resource from `xid`.
    ///
    /// The end is processed once the primary resource and every joined
    /// resource have ended. If the peer holds the branch, the end is owed to
    /// it: piggybacked on the next flow when optimized, flowed now
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`XaError::Protocol`] when `xid` is not the enlisted branch.
    pub async fn end(&self, xid: &Xid, flags: XaFlags) -> std::result::Result<(), XaError> {
        let enlistment = {
            let mut enlisted = self.lock_enlisted();
            match enlisted.take() {
                Some(enlistment) if enlistment.xid == *xid => enlistment,
                other => {
                    *enlisted = other;
                    return Err(XaError::Protocol);
                }
            }
        };
        if flags.contains(XaFlags::SUSPEND) && !enlistment.joined {
            return Ok(());
        }
        let processed = self
            .0
            .table
            .with_branch(xid, |branch| {
                if enlistment.joined {
                    branch.joined = branch.joined.saturating_sub(1);
                    branch.end_flags |= flags & XaFlags::FAIL;
                } else {
                    branch.primary_ended = true;
                    branch.end_flags |= flags;
                }
                if branch.joined > 0 || !branch.primary_ended || branch.end_processed {
                    return None;
                }
                branch.end_processed = true;
                branch.server_created.then(|| {
                    (branch.owner.clone(), branch.transaction_id, branch.end_flags)
                })
            })
            .ok_or(XaError::UnknownXid)?;
        let Some((owner, transaction_id, end_flags)) = processed else {
            return Ok(());
        };
        if self.optimized() {
            self.0.table.with_branch(xid, |branch| branch.end_owed = true);
            *owner.lock_previous_end() = Some(xid.clone());
            return Ok(());
        }
        let mut request = owner.branch_request(transaction_id, xid)?;
        request.put_u32(end_flags.bits());
        owner
            .flow(Segment::XA_END, request)
            .await
            .map(drop)
            .map_err(|failure| failure.into_xa("end"))
    }

    fn route(&self, xid: &Xid) -> Route {
        self.0
            .table
            .with_branch(xid, |branch| {
                if branch.owner.same_as(self) {
                    Route::Owned(BranchView {
                        transaction_id: branch.transaction_id,
                        server_created: branch.server_created,
                        prepared: branch.prepared,
                        end_flags: branch.end_flags,
                    })
                } else {
                    Route::Delegate(branch.owner.clone())
                }
            })
            .unwrap_or(Route::Recover)
    }

    /// Outcome for a branch whose owning connection has closed.
    fn closed_outcome(&self, xid: &Xid, prepared: bool) -> XaError {
        if prepared {
            XaError::ResourceManagerFailure
        } else {
            self.0.table.remove(xid);
            XaError::RollbackOccurred
        }
    }

    /// Prepare the branch `xid` for commit.
    ///
    /// A branch that never reached the peer votes read-only, or fails with
    /// a rollback when it was ended with [`XaFlags::FAIL`].
    ///
    /// # Errors
    ///
    /// Returns the peer's XA error. Any other failure is reported as
    /// [`XaError::ResourceManagerFailure`] and invalidates the connection.
    pub async fn prepare(&self, xid: &Xid) -> std::result::Result<XaVote, XaError> {
        let view = match self.route(xid) {
            Route::Delegate(owner) => return Box::pin(owner.prepare(xid)).await,
            Route::Recover => return self.prepare_flow(xid, 0, None).await,
            Route::Owned(view) => view,
        };
        if self.0.connection.is_closed() {
            return Err(self.closed_outcome(xid, view.prepared));
        }
        if !view.server_created {
            self.0.table.remove(xid);
            return if view.end_flags.contains(XaFlags::FAIL) {
                Err(XaError::RollbackOccurred)
            } else {
                Ok(XaVote::ReadOnly)
            };
        }
        let end = self.take_end_owed(xid);
        match self.prepare_flow(xid, view.transaction_id, end).await {
            Ok(XaVote::Ok) => {
                self.0.table.with_branch(xid, |branch| branch.prepared = true);
                Ok(XaVote::Ok)
            }
            Ok(XaVote::ReadOnly) => {
                self.0.table.remove(xid);
                Ok(XaVote::ReadOnly)
            }
            Err(error) => {
                if error.is_rollback() {
                    self.0.table.remove(xid);
                }
                Err(error)
            }
        }
    }

    async fn prepare_flow(
        &self,
        xid: &Xid,
        transaction_id: i32,
        end: Option<XaFlags>,
    ) -> std::result::Result<XaVote, XaError> {
        let mut request = self.branch_request(transaction_id, xid)?;
        put_end(&mut request, end);
        let mut reply = match self.flow(Segment::XA_PREPARE, request).await {
            Ok(reply) => reply,
            Err(FlowFailure::Xa(error)) => return Err(error),
            Err(FlowFailure::Other(error)) => {
                warn!("xa prepare of {xid} failed, invalidating connection: {error}");
                self.0.connection.invalidate().await;
                return Err(XaError::ResourceManagerFailure);
            }
        };
        match reply.get_i32() {
            Ok(XaVote::WIRE_READ_ONLY) => Ok(XaVote::ReadOnly),
            Ok(XaVote::WIRE_OK) => Ok(XaVote::Ok),
            Ok(other) => Err(XaError::from_code(other)),
            Err(error) => {
                warn!("malformed prepare vote for {xid}: {error}");
                Err(XaError::ResourceManagerFailure)
            }
        }
    }

    /// Commit the branch `xid`.
    ///
    /// # Errors
    ///
    /// Returns [`XaError::HeuristicRollback`] for a one-phase commit of a
    /// branch that never reached the peer and was ended with
    /// [`XaFlags::FAIL`], the peer's XA error, or
    /// [`XaError::ResourceManagerFailure`] for any other failure.
    pub async fn commit(&self, xid: &Xid, one_phase: bool) -> std::result::Result<(), XaError> {
        let view = match self.route(xid) {
            Route::Delegate(owner) => return Box::pin(owner.commit(xid, one_phase)).await,
            Route::Recover => return self.commit_flow(xid, 0, None, one_phase).await,
            Route::Owned(view) => view,
        };
        if self.0.connection.is_closed() {
            return Err(self.closed_outcome(xid, view.prepared));
        }
        if !view.server_created {
            self.0.table.remove(xid);
            return if one_phase && view.end_flags.contains(XaFlags::FAIL) {
                Err(XaError::HeuristicRollback)
            } else {
                Ok(())
            };
        }
        let end = self.take_end_owed(xid);
        let outcome = self.commit_flow(xid, view.transaction_id, end, one_phase).await;
        self.settle(xid, outcome)
    }

    async fn commit_flow(
        &self,
        xid: &Xid,
        transaction_id: i32,
        end: Option<XaFlags>,
        one_phase: bool,
    ) -> std::result::Result<(), XaError> {
        let mut request = self.branch_request(transaction_id, xid)?;
        put_end(&mut request, end);
        request.put_bool(one_phase);
        self.flow(Segment::XA_COMMIT, request)
            .await
            .map(drop)
            .map_err(|failure| failure.into_xa("commit"))
    }

    /// Roll back the branch `xid`.
    ///
    /// # Errors
    ///
    /// On a closed connection returns [`XaError::RollbackOccurred`] for an
    /// unprepared branch and [`XaError::ResourceManagerFailure`] for a
    /// prepared one. Otherwise returns the peer's XA error, or
    /// [`XaError::ResourceManagerFailure`] for any other failure.
    pub async fn rollback(&self, xid: &Xid) -> std::result::Result<(), XaError> {
        let view = match self.route(xid) {
            Route::Delegate(owner) => return Box::pin(owner.rollback(xid)).await,
            Route::Recover => return self.rollback_flow(xid, 0, None).await,
            Route::Owned(view) => view,
        };
        if self.0.connection.is_closed() {
            return Err(self.closed_outcome(xid, view.prepared));
        }
        if !view.server_created {
            self.0.table.remove(xid);
            return Ok(());
        }
        let end = self.take_end_owed(xid);
        let outcome = self.rollback_flow(xid, view.transaction_id, end).await;
        self.settle(xid, outcome)
    }

    async fn rollback_flow(
        &self,
        xid: &Xid,
        transaction_id: i32,
        end: Option<XaFlags>,
    ) -> std::result::Result<(), XaError> {
        let mut request = self.branch_request(transaction_id, xid)?;
        put_end(&mut request, end);
        self.flow(Segment::XA_ROLLBACK, request)
            .await
            .map(drop)
            .map_err(|failure| failure.into_xa("rollback"))
    }

    /// Drop the branch unless the outcome asks the manager to retry.
    fn settle(
        &self,
        xid: &Xid,
        outcome: std::result::Result<(), XaError>,
    ) -> std::result::Result<(), XaError> {
        if outcome != Err(XaError::ResourceManagerFailure) {
            self.0.table.remove(xid);
        }
        outcome
    }

    /// List branches the peer holds in doubt.
    ///
    /// # Errors
    ///
    /// Returns [`XaError::ResourceManagerFailure`] when the peer cannot
    /// recover remotely or the flow fails.
    pub async fn recover(&self, flags: XaFlags) -> std::result::Result<Vec<Xid>, XaError> {
        self.0
            .connection
            .handshake()
            .require(level::OPTIMIZED_TRANSACTIONS)
            .map_err(|error| FlowFailure::Other(error).into_xa("recover"))?;
        let mut request = RequestBuffer::new();
        request.put_i16(self.0.connection.object_id());
        request.put_u32(flags.bits());
        let mut reply = self
            .flow(Segment::XA_RECOVER, request)
            .await
            .map_err(|failure| failure.into_xa("recover"))?;
        read_xids(&mut reply).map_err(|error| FlowFailure::Other(error).into_xa("recover"))
    }

    /// Tell the peer to forget a heuristically completed branch.
    ///
    /// # Errors
    ///
    /// Returns the peer's XA error or [`XaError::ResourceManagerFailure`].
    pub async fn forget(&self, xid: &Xid) -> std::result::Result<(), XaError> {
        let mut request = RequestBuffer::new();
        request.put_i16(self.0.connection.object_id());
        request
            .put_xid(xid)
            .map_err(|error| FlowFailure::Other(error.into()).into_xa("forget"))?;
        self.0.table.remove(xid);
        self.flow(Segment::XA_FORGET, request)
            .await
            .map(drop)
            .map_err(|failure| failure.into_xa("forget"))
    }

    fn branch_request(
        &self,
        transaction_id: i32,
        xid: &Xid,
    ) -> std::result::Result<RequestBuffer, XaError> {
        let mut request = RequestBuffer::new();
        request.put_i16(self.0.connection.object_id());
        request.put_i32(transaction_id);
        request
            .put_xid(xid)
            .map_err(|error| FlowFailure::Other(error.into()).into_xa("encode"))?;
        Ok(request)
    }

    async fn flow(
        &self,
        segment: Segment,
        request: RequestBuffer,
    ) -> std::result::Result<ReplyBuffer, FlowFailure> {
        let mut reply = self
            .0
            .connection
            .exchange_shared(segment, self.0.lowest_priority.completion_priority(), request)
            .await
            .map_err(FlowFailure::Other)?;
        let code = reply
            .completion_code(segment.reply())
            .map_err(|error| FlowFailure::Other(error.into()))?;
        if code == NO_EXCEPTION {
            return Ok(reply);
        }
        let (code, message) = reply
            .read_exception()
            .map_err(|error| FlowFailure::Other(error.into()))?;
        if code == ExceptionKind::Xa.code() {
            let xa_code = reply
                .get_i32()
                .map_err(|error| FlowFailure::Other(error.into()))?;
            debug!("xa flow {segment} failed with code {xa_code}: {message}");
            return Err(FlowFailure::Xa(XaError::from_code(xa_code)));
        }
        Err(FlowFailure::Other(completion::resolve(
            code,
            message,
            cascade::TRANSACTION,
        )))
    }
}

fn put_end(request: &mut RequestBuffer, end: Option<XaFlags>) {
    match end {
        Some(flags) => {
            request.put_bool(true);
            request.put_u32(flags.bits());
        }
        None => request.put_bool(false),
    }
}

fn read_xids(reply: &mut ReplyBuffer) -> Result<Vec<Xid>> {
    let count = usize::try_from(reply.get_i32()?).unwrap_or_default();
    let mut xids = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        xids.push(reply.get_xid()?);
    }
    Ok(xids)
}
