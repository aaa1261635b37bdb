//! Recording consumer callbacks and connection listeners.

use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;
use wireproxy::{
    Connection,
    ConnectionListener,
    Message,
    ProxyError,
    connection::ConnectionEvent,
    session::{ConsumerCallback, ConsumerSession},
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait until `ready` returns a value, re-checking whenever `changed` fires.
async fn wait_until<T>(changed: &Notify, mut ready: impl FnMut() -> Option<T>) -> T {
    let wait = async {
        loop {
            let notified = changed.notified();
            if let Some(value) = ready() {
                return value;
            }
            notified.await;
        }
    };
    tokio::time::timeout(WAIT_LIMIT, wait)
        .await
        .expect("condition not reached in time")
}

/// What a [`RecordingCallback`] does to its own session after recording a
/// batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InCallback {
    #[default]
    Nothing,
    Stop,
    Close,
    /// Stop, then deregister.
    StopAndDeregister,
}

/// Consumer callback that records what it is given.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    action: InCallback,
    messages: Mutex<Vec<Message>>,
    batches: Mutex<Vec<usize>>,
    errors: Mutex<Vec<String>>,
    in_callback_results: Mutex<Vec<Result<(), String>>>,
    stopped_by_peer: Mutex<usize>,
    changed: Notify,
}

impl RecordingCallback {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Perform `action` on the session from inside every delivery.
    #[must_use]
    pub fn acting(action: InCallback) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<Message> { lock(&self.messages).clone() }

    /// Size of every batch delivered so far.
    pub fn batches(&self) -> Vec<usize> { lock(&self.batches).clone() }

    pub fn errors(&self) -> Vec<String> { lock(&self.errors).clone() }

    /// Outcomes of the session calls made from inside the callback.
    pub fn in_callback_results(&self) -> Vec<Result<(), String>> {
        lock(&self.in_callback_results).clone()
    }

    pub fn stopped_by_peer(&self) -> usize { *lock(&self.stopped_by_peer) }

    /// Wait until at least `count` messages were delivered.
    pub async fn wait_for_messages(&self, count: usize) -> Vec<Message> {
        wait_until(&self.changed, || {
            let messages = lock(&self.messages);
            (messages.len() >= count).then(|| messages.clone())
        })
        .await
    }

    pub async fn wait_for_error(&self) -> String {
        wait_until(&self.changed, || lock(&self.errors).first().cloned()).await
    }

    pub async fn wait_for_peer_stop(&self) {
        wait_until(&self.changed, || (*lock(&self.stopped_by_peer) > 0).then_some(())).await;
    }

    async fn act(&self, session: &ConsumerSession) -> Option<Result<(), ProxyError>> {
        match self.action {
            InCallback::Nothing => None,
            InCallback::Stop => Some(session.stop().await),
            InCallback::Close => Some(session.close().await),
            InCallback::StopAndDeregister => {
                let stopped = session.stop().await;
                Some(match stopped {
                    Ok(()) => session.deregister_async_consumer_callback().await,
                    Err(err) => Err(err),
                })
            }
        }
    }
}

#[async_trait]
impl ConsumerCallback for RecordingCallback {
    async fn consume_messages(&self, session: &ConsumerSession, messages: Vec<Message>) {
        lock(&self.batches).push(messages.len());
        lock(&self.messages).extend(messages);
        if let Some(outcome) = self.act(session).await {
            lock(&self.in_callback_results).push(outcome.map_err(|err| err.to_string()));
        }
        self.changed.notify_waiters();
    }

    async fn consumer_session_stopped(&self, _session: &ConsumerSession) {
        *lock(&self.stopped_by_peer) += 1;
        self.changed.notify_waiters();
    }

    async fn async_exception(&self, _session: &ConsumerSession, error: &ProxyError) {
        lock(&self.errors).push(error.to_string());
        self.changed.notify_waiters();
    }
}

/// Connection listener that records errors and events.
#[derive(Debug, Default)]
pub struct RecordingListener {
    errors: Mutex<Vec<String>>,
    events: Mutex<Vec<ConnectionEvent>>,
    changed: Notify,
}

impl RecordingListener {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn errors(&self) -> Vec<String> { lock(&self.errors).clone() }

    pub fn events(&self) -> Vec<ConnectionEvent> { lock(&self.events).clone() }

    pub async fn wait_for_error(&self) -> String {
        wait_until(&self.changed, || lock(&self.errors).first().cloned()).await
    }

    pub async fn wait_for_event(&self) -> ConnectionEvent {
        wait_until(&self.changed, || lock(&self.events).first().copied()).await
    }
}

#[async_trait]
impl ConnectionListener for RecordingListener {
    async fn async_exception(&self, _connection: &Connection, error: &ProxyError) {
        lock(&self.errors).push(error.to_string());
        self.changed.notify_waiters();
    }

    async fn event_occurred(&self, _connection: &Connection, event: ConnectionEvent) {
        lock(&self.events).push(event);
        self.changed.notify_waiters();
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(WAIT_LIMIT, poll)
        .await
        .expect("condition not reached in time");
}

/// Run `future` with the standard wait limit.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT_LIMIT, future)
        .await
        .expect("operation did not finish in time")
}
