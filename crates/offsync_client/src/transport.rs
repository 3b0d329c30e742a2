//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use offsync_protocol::{
    BatchRequest, BatchResponse, ChangesRequest, ChangesResponse, ResolveRequest,
    ResolveResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing).
pub trait SyncTransport: Send + Sync {
    /// Pushes a batch of mutations to the reconciler.
    fn push_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse>;

    /// Pulls a page of the change feed.
    fn pull_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse>;

    /// Sends a conflict resolution.
    fn resolve_conflict(&self, request: &ResolveRequest) -> SyncResult<ResolveResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    fn push_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
        (**self).push_batch(request)
    }

    fn pull_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        (**self).pull_changes(request)
    }

    fn resolve_conflict(&self, request: &ResolveRequest) -> SyncResult<ResolveResponse> {
        (**self).resolve_conflict(request)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        (**self).close()
    }
}

/// A mock transport for testing.
///
/// Push responses are served from a FIFO; when it runs dry every item of the
/// request is acknowledged as created with version 1. Pushes can be made to
/// fail a number of times with a retryable transport error.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    push_failures: AtomicUsize,
    push_responses: Mutex<VecDeque<BatchResponse>>,
    pull_responses: Mutex<VecDeque<ChangesResponse>>,
    resolve_response: Mutex<Option<ResolveResponse>>,
    pushed: Mutex<Vec<BatchRequest>>,
}

impl MockTransport {
    /// Creates a new connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            push_failures: AtomicUsize::new(0),
            push_responses: Mutex::new(VecDeque::new()),
            pull_responses: Mutex::new(VecDeque::new()),
            resolve_response: Mutex::new(None),
            pushed: Mutex::new(Vec::new()),
        }
    }

    /// Queues a push response.
    pub fn queue_push_response(&self, response: BatchResponse) {
        self.push_responses.lock().push_back(response);
    }

    /// Queues a pull response.
    pub fn queue_pull_response(&self, response: ChangesResponse) {
        self.pull_responses.lock().push_back(response);
    }

    /// Sets the resolve response.
    pub fn set_resolve_response(&self, response: ResolveResponse) {
        *self.resolve_response.lock() = Some(response);
    }

    /// Makes the next `count` pushes fail with a retryable transport error.
    pub fn fail_next_pushes(&self, count: usize) {
        self.push_failures.store(count, Ordering::SeqCst);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Requests received by `push_batch`, failed ones included.
    pub fn pushed_requests(&self) -> Vec<BatchRequest> {
        self.pushed.lock().clone()
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    fn acknowledge_all(request: &BatchRequest) -> BatchResponse {
        use offsync_protocol::{ItemOutcome, SettledItem};
        BatchResponse::from_outcomes(
            request
                .operations
                .iter()
                .enumerate()
                .map(|(index, m)| {
                    ItemOutcome::Created(SettledItem {
                        index,
                        local_id: m.local_id.clone(),
                        server_id: format!("srv-{}", m.local_id),
                        version: 1,
                        applied: true,
                    })
                })
                .collect(),
        )
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn push_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
        self.ensure_connected()?;
        self.pushed.lock().push(request.clone());

        let failing = self
            .push_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::transport_retryable("connection reset"));
        }

        Ok(self
            .push_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::acknowledge_all(request)))
    }

    fn pull_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        self.ensure_connected()?;
        Ok(self
            .pull_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| ChangesResponse {
                server_time: request.since,
                cursor: request.since,
                ..Default::default()
            }))
    }

    fn resolve_conflict(&self, _request: &ResolveRequest) -> SyncResult<ResolveResponse> {
        self.ensure_connected()?;
        self.resolve_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock resolve response set".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
