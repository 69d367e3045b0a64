//! Bookkeeping for in-flight requests.
//!
//! Every map is keyed by correlation id. `remove` drops an id from all of
//! them, so after a request completes, fails or is cancelled nothing of it
//! remains.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::future::Callback;
use crate::protocol::{Request, RequestId};

/// A submitted request awaiting its response.
#[derive(Clone)]
pub(crate) struct PendingEntry {
    pub request: Request,
    pub callback: Callback,
    /// Channel the request is bound to, for direct sends.
    pub pinned: Option<Arc<dyn Channel>>,
}

/// Outcome of counting down a broadcast response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FanIn {
    /// The id is not a broadcast.
    Untracked,
    /// More responses are outstanding.
    Waiting(usize),
    /// This was the last expected response.
    Complete,
}

#[derive(Default)]
pub(crate) struct RequestTable {
    entries: DashMap<RequestId, PendingEntry>,
    timestamps: DashMap<RequestId, Instant>,
    retries: DashMap<RequestId, u32>,
    fan_in: DashMap<RequestId, usize>,
    unhandled: Mutex<Vec<Request>>,
}

impl RequestTable {
    pub(crate) fn insert(&self, id: RequestId, entry: PendingEntry) {
        self.timestamps.insert(id, Instant::now());
        self.entries.insert(id, entry);
    }

    pub(crate) fn entry(&self, id: RequestId) -> Option<PendingEntry> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    pub(crate) fn callback(&self, id: RequestId) -> Option<Callback> {
        self.entries.get(&id).map(|e| e.callback.clone())
    }

    /// Forget everything about `id`.
    ///
    /// The entry goes first, so `mark_retry` cannot revive the side maps.
    pub(crate) fn remove(&self, id: RequestId) -> Option<PendingEntry> {
        let entry = self.entries.remove(&id).map(|(_, entry)| entry);
        self.timestamps.remove(&id);
        self.retries.remove(&id);
        self.fan_in.remove(&id);
        entry
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Ids whose timestamp is older than `timeout`.
    pub(crate) fn expired(&self, now: Instant, timeout: Duration) -> Vec<RequestId> {
        self.timestamps
            .iter()
            .filter(|ts| now.saturating_duration_since(*ts.value()) > timeout)
            .map(|ts| *ts.key())
            .collect()
    }

    pub(crate) fn retries(&self, id: RequestId) -> u32 {
        self.retries.get(&id).map(|r| *r).unwrap_or(0)
    }

    /// Record retry `attempt` of `id` and restart its clock, unless the
    /// request completed in the meantime.
    pub(crate) fn mark_retry(&self, id: RequestId, attempt: u32) -> bool {
        // Holding the entry blocks a concurrent `remove` until both are set
        let Some(_entry) = self.entries.get(&id) else {
            return false;
        };
        self.retries.insert(id, attempt);
        self.timestamps.insert(id, Instant::now());
        true
    }

    /// Expect `count` responses for the broadcast `id`.
    pub(crate) fn expect_responses(&self, id: RequestId, count: usize) {
        self.fan_in.insert(id, count);
    }

    pub(crate) fn count_down(&self, id: RequestId) -> FanIn {
        match self.fan_in.entry(id) {
            Entry::Occupied(mut counter) => {
                let left = counter.get().saturating_sub(1);
                if left > 0 {
                    *counter.get_mut() = left;
                    FanIn::Waiting(left)
                } else {
                    counter.remove();
                    FanIn::Complete
                }
            }
            Entry::Vacant(_) => FanIn::Untracked,
        }
    }

    pub(crate) fn queue_unhandled(&self, response: Request) {
        self.unhandled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(response);
    }

    pub(crate) fn take_unhandled(&self) -> Vec<Request> {
        std::mem::take(&mut *self.unhandled.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub(crate) fn unhandled_len(&self) -> usize {
        self.unhandled.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::MessageFuture;
    use crate::protocol::RequestType;

    fn entry(id: RequestId) -> PendingEntry {
        PendingEntry {
            request: Request::with_id(id, RequestType::Query),
            callback: MessageFuture::new().into(),
            pinned: None,
        }
    }

    #[test]
    fn test_remove_clears_all_maps() {
        let table = RequestTable::default();
        table.insert(1, entry(1));
        assert!(table.mark_retry(1, 2));
        table.expect_responses(1, 3);

        assert!(table.remove(1).is_some());
        assert_eq!(table.len(), 0);
        assert_eq!(table.retries(1), 0);
        assert_eq!(table.count_down(1), FanIn::Untracked);
        assert!(table.expired(Instant::now() + Duration::from_secs(60), Duration::ZERO).is_empty());
        assert!(table.remove(1).is_none());
    }

    #[test]
    fn test_mark_retry_skips_completed_requests() {
        let table = RequestTable::default();
        table.insert(1, entry(1));
        assert!(table.mark_retry(1, 1));
        assert_eq!(table.retries(1), 1);

        table.remove(1);
        assert!(!table.mark_retry(1, 2));
        assert_eq!(table.retries(1), 0);
        assert!(table.expired(Instant::now() + Duration::from_secs(60), Duration::ZERO).is_empty());
    }

    #[test]
    fn test_count_down() {
        let table = RequestTable::default();
        table.expect_responses(7, 3);
        assert_eq!(table.count_down(7), FanIn::Waiting(2));
        assert_eq!(table.count_down(7), FanIn::Waiting(1));
        assert_eq!(table.count_down(7), FanIn::Complete);
        assert_eq!(table.count_down(7), FanIn::Untracked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired() {
        let table = RequestTable::default();
        table.insert(1, entry(1));
        tokio::time::advance(Duration::from_millis(150)).await;
        table.insert(2, entry(2));
        tokio::time::advance(Duration::from_millis(100)).await;

        let expired = table.expired(Instant::now(), Duration::from_millis(200));
        assert_eq!(expired, vec![1]);

        assert!(table.mark_retry(1, 1));
        assert!(table.expired(Instant::now(), Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn test_unhandled_queue_drains() {
        let table = RequestTable::default();
        table.queue_unhandled(Request::with_id(9, RequestType::Result));
        assert_eq!(table.unhandled_len(), 1);
        assert_eq!(table.take_unhandled().len(), 1);
        assert_eq!(table.unhandled_len(), 0);
    }
}
