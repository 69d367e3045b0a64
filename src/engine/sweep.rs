//! Periodic timeout sweep.
//!
//! Each pass first retries unmatched responses once, then walks the
//! timestamps of pending requests. An overdue request is resent while it
//! has retries left and failed with a timeout error afterwards.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::DispatchEngine;
use crate::error::ClientError;
use crate::protocol::{RequestId, RequestType};

pub(super) async fn sweep_loop(engine: Weak<DispatchEngine>) {
    loop {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        if !engine.active.load(Ordering::SeqCst) {
            break;
        }

        engine.retry_unhandled();
        engine.sweep_timeouts().await;

        let interval = engine.timer_interval();
        let _ = tokio::time::timeout(interval, engine.trigger.notified()).await;
    }
    debug!("Timeout sweep stopped");
}

impl DispatchEngine {
    /// Give each queued response one more chance to find its request.
    fn retry_unhandled(&self) {
        for response in self.table.take_unhandled() {
            if self.correlate(&response) {
                debug!(id = response.id, "Matched response on retry");
                continue;
            }
            match response.kind {
                RequestType::Error => warn!(
                    id = response.id,
                    reason = response.payload_text().as_deref().unwrap_or(""),
                    "Unhandled error response"
                ),
                RequestType::Result => warn!(id = response.id, "Unhandled result response"),
                RequestType::Success => warn!(id = response.id, "Unhandled success response"),
                kind => warn!(id = response.id, %kind, "Dropping unmatched response"),
            }
        }
    }

    async fn sweep_timeouts(&self) {
        let timeout = self.timeout();
        if timeout.is_zero() {
            return;
        }

        for id in self.table.expired(Instant::now(), timeout) {
            self.expire(id).await;
        }
    }

    async fn expire(&self, id: RequestId) {
        let Some(entry) = self.table.entry(id) else {
            error!(id, "Timed out request has no pending entry");
            self.table.remove(id);
            return;
        };

        let attempts = self.table.retries(id);
        if attempts >= self.retry_count() {
            error!(id, kind = %entry.request.kind, attempts, "Request timed out, no retries left");
            entry.callback.fail(ClientError::Timeout);
            self.table.remove(id);
            return;
        }

        if !self.table.mark_retry(id, attempts + 1) {
            debug!(id, "Request completed before its retry");
            return;
        }
        warn!(id, kind = %entry.request.kind, attempt = attempts + 1, "Request timed out, retrying");

        let sent = match &entry.pinned {
            Some(channel) if channel.is_open() => channel.send(&entry.request).await,
            Some(_) => Err(ClientError::NoConnection),
            None => {
                let members = self.channels.snapshot();
                if members.is_empty() {
                    Err(ClientError::NoConnection)
                } else {
                    self.dispatch(&entry.request, &members).await
                }
            }
        };

        match sent {
            Ok(()) => {}
            Err(ClientError::NoConnection) => {
                error!(id, "No connection to retry request");
                entry.callback.fail(ClientError::NoConnection);
                self.table.remove(id);
            }
            Err(e) => {
                error!(id, error = %e, "Failed to resend request");
            }
        }
    }
}
