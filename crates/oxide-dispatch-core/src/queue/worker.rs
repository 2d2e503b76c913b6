//! Partition workers
//!
//! A worker is spawned when a partition receives its first entry and exits
//! once the partition drains. Each entry runs in its own task so a panic
//! fails that entry only, and the worker moves on to the next one.

use super::{PartitionKey, QueueEntry, RequestHandle, RequestId, RequestQueue, RequestStatus};
use crate::error::DispatchError;
use crate::llm::ProviderResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Instrument};

/// Executes one dequeued entry
#[async_trait]
pub trait EntryRunner<T>: Send + Sync + 'static {
    /// Run the entry to completion.
    async fn run(&self, entry: QueueEntry<T>) -> Result<ProviderResult, DispatchError>;
}

/// Queue plus the runner its workers call
pub struct QueueDispatcher<T> {
    queue: Arc<RequestQueue<T>>,
    runner: Arc<dyn EntryRunner<T>>,
}

impl<T> Clone for QueueDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<T: Send + 'static> QueueDispatcher<T> {
    /// Create a dispatcher over `queue`
    pub fn new(queue: Arc<RequestQueue<T>>, runner: Arc<dyn EntryRunner<T>>) -> Self {
        Self { queue, runner }
    }

    /// Underlying queue
    #[must_use]
    pub fn queue(&self) -> &Arc<RequestQueue<T>> {
        &self.queue
    }

    /// Enqueue `payload` and make sure its partition has a worker.
    ///
    /// With a `timeout`, the entry fails with `Timeout` if it has not
    /// finished when the deadline passes.
    pub fn submit(
        &self,
        key: PartitionKey,
        payload: T,
        timeout: Option<Duration>,
    ) -> RequestHandle {
        self.submit_as(RequestId::new(), key, payload, timeout)
    }

    /// [`Self::submit`] under a caller-chosen id.
    pub fn submit_as(
        &self,
        request_id: RequestId,
        key: PartitionKey,
        payload: T,
        timeout: Option<Duration>,
    ) -> RequestHandle {
        let enqueued = self.queue.enqueue_with_id(request_id, key.clone(), payload);

        if enqueued.start_worker {
            let dispatcher = self.clone();
            let span = tracing::info_span!("partition_worker", partition = %key);
            tokio::spawn(async move { dispatcher.drain(key).await }.instrument(span));
        }

        if let Some(timeout) = timeout {
            let queue = Arc::clone(&self.queue);
            let mut status = enqueued.status.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        if queue.expire(request_id) {
                            info!(request_id = %request_id, timeout_secs = timeout.as_secs(), "Request deadline passed");
                        }
                    }
                    _ = status.wait_for(RequestStatus::is_terminal) => {}
                }
            });
        }

        RequestHandle::new(request_id, enqueued.position, enqueued.status)
    }

    /// Runs entries of `key` one at a time until the partition is empty.
    async fn drain(&self, key: PartitionKey) {
        while let Some(entry) = self.queue.dequeue_next(&key) {
            let request_id = entry.request_id;
            let runner = Arc::clone(&self.runner);
            let job = tokio::spawn(async move { runner.run(entry).await });

            let result = match job.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(
                        request_id = %request_id,
                        partition = %key,
                        error = %join_error,
                        "Queued request crashed"
                    );
                    Err(DispatchError::InternalQueueFailure {
                        reason: "request worker crashed".to_string(),
                    })
                }
            };
            self.queue.finish(request_id, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetentionPolicy;
    use tokio::sync::Notify;

    /// Echoes the payload; `"block"` waits for the gate, `"panic"` panics.
    struct Echo {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl EntryRunner<String> for Echo {
        async fn run(&self, entry: QueueEntry<String>) -> Result<ProviderResult, DispatchError> {
            match entry.payload.as_str() {
                "block" => {
                    self.gate.notified().await;
                    Ok(ProviderResult::Text("unblocked".to_string()))
                }
                "panic" => panic!("runner blew up"),
                other => Ok(ProviderResult::Text(other.to_string())),
            }
        }
    }

    fn dispatcher() -> (QueueDispatcher<String>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let runner = Arc::new(Echo {
            gate: Arc::clone(&gate),
        });
        let queue = Arc::new(RequestQueue::new(RetentionPolicy::default()));
        (QueueDispatcher::new(queue, runner), gate)
    }

    fn text(s: &str) -> ProviderResult {
        ProviderResult::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_blocked_partition_does_not_stall_others() {
        let (dispatcher, gate) = dispatcher();
        let blocked = dispatcher.submit(PartitionKey::Chat(42), "block".to_string(), None);
        let queued = dispatcher.submit(PartitionKey::Chat(42), "second".to_string(), None);
        let other = dispatcher.submit(PartitionKey::Chat(43), "other".to_string(), None);
        assert_eq!(queued.position, 2);

        assert_eq!(other.wait().await, Ok(text("other")));
        assert!(matches!(queued.current(), RequestStatus::Pending { .. }));

        gate.notify_one();
        assert_eq!(blocked.wait().await, Ok(text("unblocked")));
        assert_eq!(queued.wait().await, Ok(text("second")));
    }

    #[tokio::test]
    async fn test_panicking_entry_fails_alone() {
        let (dispatcher, _gate) = dispatcher();
        let crashed = dispatcher.submit(PartitionKey::Global, "panic".to_string(), None);
        let next = dispatcher.submit(PartitionKey::Global, "fine".to_string(), None);

        assert!(matches!(
            crashed.wait().await,
            Err(DispatchError::InternalQueueFailure { .. })
        ));
        assert_eq!(next.wait().await, Ok(text("fine")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_running_entry_and_frees_partition_later() {
        let (dispatcher, gate) = dispatcher();
        let slow = dispatcher.submit(
            PartitionKey::Global,
            "block".to_string(),
            Some(Duration::from_secs(5)),
        );
        let id = slow.request_id;
        assert_eq!(slow.wait().await, Err(DispatchError::Timeout));

        let next = dispatcher.submit(PartitionKey::Global, "after".to_string(), None);
        gate.notify_one();
        assert_eq!(next.wait().await, Ok(text("after")));
        assert_eq!(
            dispatcher.queue().status(id),
            Some(RequestStatus::Failed(DispatchError::Timeout))
        );
    }
}
