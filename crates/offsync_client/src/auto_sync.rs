//! Async helpers: periodic background sync and timed cycles.
//!
//! Sync cycles are blocking; these helpers run them on tokio's blocking pool.

use crate::client::{SyncClient, SyncReport};
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Handle to a running auto-sync loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct AutoSyncHandle {
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    /// Stops the loop. A cycle already running finishes on its own.
    pub fn stop(self) {
        self.task.abort();
    }

    /// Returns true while the loop is running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns a loop that syncs every `interval` while connected.
///
/// Ticks with queued work run a full `sync_now`; idle ticks only pull.
/// Must be called from within a tokio runtime.
pub fn spawn<T>(client: Arc<SyncClient<T>>, interval: Duration) -> AutoSyncHandle
where
    T: SyncTransport + 'static,
{
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !client.is_connected() {
                continue;
            }

            let worker = Arc::clone(&client);
            let joined = tokio::task::spawn_blocking(move || {
                if worker.has_pending_work() {
                    worker.sync_now().map(|report| report.synced)
                } else if worker.config().pull_after_push {
                    worker.pull().map(|_| 0)
                } else {
                    Ok(0)
                }
            })
            .await;

            match joined {
                Ok(Ok(synced)) => debug!(synced, "auto-sync tick"),
                Ok(Err(e)) => warn!(error = %e, "auto-sync cycle failed"),
                Err(e) => warn!(error = %e, "auto-sync task panicked"),
            }
        }
    });
    AutoSyncHandle { task }
}

/// Spawns the loop using the client's configured interval, if any.
pub fn spawn_configured<T>(client: Arc<SyncClient<T>>) -> Option<AutoSyncHandle>
where
    T: SyncTransport + 'static,
{
    let interval = client.config().auto_sync_interval?;
    Some(spawn(client, interval))
}

/// Runs `sync_now` and abandons it after `timeout`.
///
/// On timeout the cycle, if still running, is cancelled: results already
/// applied stay applied and unconfirmed entries stay queued for the next
/// cycle. The cancellation ends with that cycle.
pub async fn sync_with_timeout<T>(
    client: Arc<SyncClient<T>>,
    timeout: Duration,
) -> SyncResult<SyncReport>
where
    T: SyncTransport + 'static,
{
    let worker = Arc::clone(&client);
    let task = tokio::task::spawn_blocking(move || worker.sync_now());
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(SyncError::Protocol(format!("sync task failed: {e}"))),
        Err(_) => {
            let cancelled = client.cancel_running();
            warn!(timeout_ms = timeout.as_millis() as u64, cancelled, "sync cycle timed out");
            Err(SyncError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncState;
    use crate::config::SyncConfig;
    use crate::local::LocalStore;
    use crate::transport::MockTransport;
    use offsync_protocol::{
        BatchRequest, BatchResponse, ChangesRequest, ChangesResponse, EntityType, Payload,
        ResolveRequest, ResolveResponse,
    };
    use serde_json::json;

    struct SlowTransport {
        inner: MockTransport,
        delay: Duration,
    }

    impl SyncTransport for SlowTransport {
        fn push_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
            std::thread::sleep(self.delay);
            self.inner.push_batch(request)
        }

        fn pull_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
            self.inner.pull_changes(request)
        }

        fn resolve_conflict(&self, request: &ResolveRequest) -> SyncResult<ResolveResponse> {
            self.inner.resolve_conflict(request)
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn close(&self) -> SyncResult<()> {
            self.inner.close()
        }
    }

    fn write_post(store: &LocalStore, id: &str) {
        let payload = Payload::from_value(EntityType::Post, json!({ "content": id })).unwrap();
        store.write(EntityType::Post, Some(id), payload).unwrap();
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn auto_sync_drains_queue() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let client = Arc::new(SyncClient::new(
            SyncConfig::new(),
            MockTransport::new(),
            Arc::clone(&store),
        ));
        let handle = spawn(Arc::clone(&client), Duration::from_millis(10));
        assert!(handle.is_running());

        write_post(&store, "A");
        assert!(wait_for(|| store.queue().is_empty()).await);
        assert!(client.stats().cycles_completed >= 1);
        handle.stop();
    }

    #[tokio::test]
    async fn auto_sync_waits_while_offline() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let client = Arc::new(SyncClient::new(
            SyncConfig::new(),
            MockTransport::new(),
            Arc::clone(&store),
        ));
        client.transport().set_connected(false);
        write_post(&store, "A");

        let handle = spawn(Arc::clone(&client), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.queue().len(), 1);

        client.transport().set_connected(true);
        assert!(wait_for(|| store.queue().is_empty()).await);
        drop(handle);
    }

    #[tokio::test]
    async fn spawn_configured_respects_disabled_interval() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let client = Arc::new(SyncClient::new(
            SyncConfig::new().with_auto_sync_interval(None),
            MockTransport::new(),
            store,
        ));
        assert!(spawn_configured(client).is_none());
    }

    #[tokio::test]
    async fn timed_out_cycle_is_cancelled() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = SlowTransport {
            inner: MockTransport::new(),
            delay: Duration::from_millis(300),
        };
        let client = Arc::new(SyncClient::new(
            SyncConfig::new().with_pull_after_push(false),
            transport,
            Arc::clone(&store),
        ));
        write_post(&store, "A");

        let result = sync_with_timeout(Arc::clone(&client), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(SyncError::Timeout)));

        // the in-flight batch still lands; the cycle then stops
        assert!(wait_for(|| !client.state().is_active()).await);
        assert_eq!(client.state(), SyncState::Idle);
        assert!(store.queue().is_empty());
    }

    #[tokio::test]
    async fn retry_after_timed_out_cycle_is_not_cancelled() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let transport = SlowTransport {
            inner: MockTransport::new(),
            delay: Duration::from_millis(100),
        };
        let client = Arc::new(SyncClient::new(
            SyncConfig::new().with_pull_after_push(false),
            transport,
            Arc::clone(&store),
        ));
        write_post(&store, "A");

        let result = sync_with_timeout(Arc::clone(&client), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SyncError::Timeout)));
        assert!(wait_for(|| !client.state().is_active()).await);
        // lets the abandoned cycle release its lock
        tokio::time::sleep(Duration::from_millis(20)).await;

        write_post(&store, "B");
        let worker = Arc::clone(&client);
        let report = tokio::task::spawn_blocking(move || worker.sync_with_retry())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced, 1);
        assert!(store.queue().is_empty());
    }

    #[tokio::test]
    async fn fast_cycle_completes_within_timeout() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let client = Arc::new(SyncClient::new(
            SyncConfig::new(),
            MockTransport::new(),
            Arc::clone(&store),
        ));
        write_post(&store, "A");
        let report = sync_with_timeout(client, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.synced, 1);
    }
}
