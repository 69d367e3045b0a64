//! Single-assignment futures handed out for submitted requests.
//!
//! A `PendingFuture` starts out pending and transitions at most once, to
//! resolved, failed or cancelled. Later transitions are ignored. Any number
//! of tasks may wait on clones of the same future.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{ClientError, Result};
use crate::protocol::{Request, RequestType, ResultSet};

#[derive(Debug, Clone)]
enum State<T> {
    Pending,
    Resolved(T),
    Failed(ClientError),
    Cancelled,
}

impl<T: Clone> State<T> {
    fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    fn outcome(&self) -> Option<Result<T>> {
        match self {
            State::Pending => None,
            State::Resolved(value) => Some(Ok(value.clone())),
            State::Failed(err) => Some(Err(err.clone())),
            State::Cancelled => Some(Err(ClientError::Cancelled)),
        }
    }
}

/// Cancellable, single-assignment result holder.
pub struct PendingFuture<T> {
    state: Arc<watch::Sender<State<T>>>,
}

/// Future for a message; resolves to the raw response.
pub type MessageFuture = PendingFuture<Request>;

/// Future for a query; resolves to the decoded result set.
pub type QueryFuture = PendingFuture<ResultSet>;

impl<T: Clone> PendingFuture<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(State::Pending);
        Self { state: Arc::new(tx) }
    }

    /// Wait until the future leaves the pending state.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !s.is_pending())
            .await
            .map_err(|_| ClientError::Closed)?;
        state.outcome().unwrap_or(Err(ClientError::Closed))
    }

    /// Wait at most `limit`. Running out of time leaves the future pending.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<T> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Elapsed(limit)),
        }
    }

    /// Resolve with a value. Returns false if the future was already done.
    pub fn resolve(&self, value: T) -> bool {
        self.transition(State::Resolved(value))
    }

    /// Fail with an error. Returns false if the future was already done.
    pub fn fail(&self, error: ClientError) -> bool {
        self.transition(State::Failed(error))
    }

    /// Cancel the future, waking all waiters. Idempotent.
    pub fn cancel(&self) -> bool {
        self.transition(State::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        !self.state.borrow().is_pending()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), State::Cancelled)
    }

    /// The error this future failed with, if any.
    pub fn error(&self) -> Option<ClientError> {
        match &*self.state.borrow() {
            State::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// The error message, if the future failed with one.
    pub fn error_message(&self) -> Option<String> {
        self.error().and_then(|e| e.message())
    }

    /// The resolved value without waiting.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.state.borrow().outcome()
    }

    fn transition(&self, next: State<T>) -> bool {
        self.state.send_if_modified(move |state| {
            if state.is_pending() {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

impl<T: Clone> Default for PendingFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PendingFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PendingFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingFuture")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// The callback registered for an in-flight request.
#[derive(Debug, Clone)]
pub enum Callback {
    Message(MessageFuture),
    Query(QueryFuture),
}

impl Callback {
    /// Complete the callback from a correlated response.
    ///
    /// Error-typed responses fail the callback with their payload text.
    /// Query callbacks decode the payload into a result set.
    pub fn complete(&self, response: Request) -> bool {
        if response.kind == RequestType::Error {
            return self.fail(ClientError::Remote(response.payload_text()));
        }

        match self {
            Callback::Message(future) => future.resolve(response),
            Callback::Query(future) => match ResultSet::from_payload(response.payload.as_ref()) {
                Ok(set) => future.resolve(set),
                Err(e) => future.fail(ClientError::Remote(Some(e.to_string()))),
            },
        }
    }

    pub fn fail(&self, error: ClientError) -> bool {
        match self {
            Callback::Message(future) => future.fail(error),
            Callback::Query(future) => future.fail(error),
        }
    }

    pub fn cancel(&self) -> bool {
        match self {
            Callback::Message(future) => future.cancel(),
            Callback::Query(future) => future.cancel(),
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Callback::Message(future) => future.is_done(),
            Callback::Query(future) => future.is_done(),
        }
    }
}

impl From<MessageFuture> for Callback {
    fn from(future: MessageFuture) -> Self {
        Callback::Message(future)
    }
}

impl From<QueryFuture> for Callback {
    fn from(future: QueryFuture) -> Self {
        Callback::Query(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_first_transition_wins() {
        let future = MessageFuture::new();
        let response = Request::with_id(1, RequestType::Pong);

        assert!(future.resolve(response.clone()));
        assert!(!future.fail(ClientError::Timeout));
        assert!(!future.cancel());

        assert!(future.is_done());
        assert!(!future.is_cancelled());
        assert!(future.error().is_none());
        assert_eq!(assert_ok!(future.wait().await), response);
    }

    #[tokio::test]
    async fn test_fail_then_resolve_keeps_error() {
        let future = QueryFuture::new();
        assert!(future.fail(ClientError::Timeout));
        assert!(!future.resolve(ResultSet::Empty));

        assert_eq!(future.error(), Some(ClientError::Timeout));
        assert_eq!(future.error_message(), Some("timeout error".to_string()));
        assert_eq!(future.wait().await, Err(ClientError::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let future = MessageFuture::new();
        let waiter = {
            let future = future.clone();
            tokio::spawn(async move { future.wait().await })
        };

        tokio::task::yield_now().await;
        assert!(future.cancel());
        assert!(!future.cancel());

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(ClientError::Cancelled));
        assert!(future.is_cancelled());
        assert!(future.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_leaves_future_pending() {
        let future = MessageFuture::new();
        let result = future.wait_timeout(Duration::from_millis(50)).await;

        assert_eq!(result, Err(ClientError::Elapsed(Duration::from_millis(50))));
        assert!(!future.is_done());
        assert!(future.try_get().is_none());
    }

    #[tokio::test]
    async fn test_wait_after_resolution_returns_immediately() {
        let future = MessageFuture::new();
        future.resolve(Request::with_id(9, RequestType::Success));
        let response = assert_ok!(future.wait_timeout(Duration::from_millis(10)).await);
        assert_eq!(response.id, 9);
    }

    #[tokio::test]
    async fn test_callback_decodes_query_results() {
        let future = QueryFuture::new();
        let callback = Callback::from(future.clone());

        let response = Request::with_id(4, RequestType::Result)
            .with_payload(json!({"type": "list", "results": [1, 2]}));
        assert!(callback.complete(response));

        let set = assert_ok!(future.wait().await);
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_callback_error_responses() {
        let future = MessageFuture::new();
        let callback = Callback::from(future.clone());
        callback.complete(Request::with_id(4, RequestType::Error).with_payload("bad query"));
        assert_eq!(
            assert_err!(future.wait().await),
            ClientError::Remote(Some("bad query".into()))
        );

        let future = QueryFuture::new();
        let callback = Callback::from(future.clone());
        callback.complete(Request::with_id(5, RequestType::Error));
        assert_eq!(future.error(), Some(ClientError::Remote(None)));
        assert_eq!(future.error_message(), None);
    }

    #[tokio::test]
    async fn test_malformed_query_result_fails_future() {
        let future = QueryFuture::new();
        let callback = Callback::from(future.clone());
        callback.complete(Request::with_id(6, RequestType::Result).with_payload("oops"));
        assert!(matches!(future.error(), Some(ClientError::Remote(Some(_)))));
    }
}
