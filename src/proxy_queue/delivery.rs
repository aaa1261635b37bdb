//! The task that drives callback delivery for one queue.

use std::{any::Any, sync::Arc};

use tracing::{debug, error, warn};

use super::ProxyQueue;

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else {
        format!("{payload:?}")
    }
}

pub(super) async fn run(queue: Arc<ProxyQueue>) {
    debug!(queue = %queue.id(), "delivery task started");
    loop {
        tokio::select! {
            () = queue.shutdown.cancelled() => break,
            () = queue.wait_deliverable() => {}
        }
        let Some(session) = queue.session() else {
            debug!(queue = %queue.id(), "consumer session gone; ending delivery");
            break;
        };
        match session.deliver_from(&queue).await {
            Ok(()) => {}
            Err(err) if err.is_usage_error() => {
                error!(queue = %queue.id(), error = %err, "callback follow-up rejected");
            }
            Err(err) => warn!(queue = %queue.id(), error = %err, "callback follow-up failed"),
        }
        tokio::task::yield_now().await;
    }
    queue.delivery_task_ended();
    debug!(queue = %queue.id(), "delivery task finished");
}
