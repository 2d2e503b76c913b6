//! Partitioned FIFO request queues
//!
//! Work is serialized per [`PartitionKey`]: one in-flight analysis per chat,
//! one image job per model, one speech job process-wide. Distinct partitions
//! never wait on each other. Status changes are published on a
//! `tokio::sync::watch` channel per request so callers can await or poll.
//!
//! Terminal entries stay pollable for a bounded time and count
//! ([`RetentionPolicy`]) and are then forgotten.

mod worker;

pub use worker::{EntryRunner, QueueDispatcher};

use crate::error::DispatchError;
use crate::llm::{CommandType, ProviderResult};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique id of one submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity under which work is serialized
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    /// One entry at a time per chat
    Chat(i64),
    /// One entry at a time per model
    Model(String),
    /// One entry at a time process-wide
    Global,
    /// Private partition of a single request (no serialization)
    Direct(RequestId),
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Model(name) => write!(f, "model:{name}"),
            Self::Global => f.write_str("global"),
            Self::Direct(id) => write!(f, "direct:{id}"),
        }
    }
}

/// How a command type picks its partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPolicy {
    /// Every request runs on its own
    Direct,
    /// Serialized per chat
    PerChat,
    /// Serialized per model
    PerModel,
    /// Serialized process-wide
    Global,
}

impl PartitionPolicy {
    /// Policy used when none is configured
    #[must_use]
    pub const fn default_for(command: CommandType) -> Self {
        match command {
            CommandType::Chat | CommandType::Translation => Self::Direct,
            CommandType::Analysis => Self::PerChat,
            CommandType::Image => Self::PerModel,
            CommandType::Speech => Self::Global,
        }
    }
}

impl FromStr for PartitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "none" => Ok(Self::Direct),
            "chat" | "per_chat" => Ok(Self::PerChat),
            "model" | "per_model" => Ok(Self::PerModel),
            "global" | "singleton" => Ok(Self::Global),
            other => Err(format!("unknown partition policy: {other}")),
        }
    }
}

/// Lifecycle of a queued request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Waiting in its partition
    Pending {
        /// 1-based place in line; the in-flight entry is place 1
        position: usize,
    },
    /// Being executed
    Processing,
    /// Finished with a result
    Completed(ProviderResult),
    /// Finished with an error
    Failed(DispatchError),
}

impl RequestStatus {
    /// Whether no further transitions can happen
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Outcome of [`RequestQueue::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Entry removed before it started
    Cancelled,
    /// Entry is running and will complete on its own
    AlreadyProcessing,
    /// Unknown, already finished, or purged
    NotFound,
}

/// Bounds for terminal entry retention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a terminal entry stays pollable
    pub ttl: Duration,
    /// Maximum number of terminal entries kept
    pub capacity: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 1000,
        }
    }
}

/// A unit of work handed to a partition worker
#[derive(Debug)]
pub struct QueueEntry<T> {
    /// Request id
    pub request_id: RequestId,
    /// Partition the entry was queued under
    pub partition: PartitionKey,
    /// Caller payload
    pub payload: T,
    /// Enqueue time
    pub enqueued_at: Instant,
}

/// Result of [`RequestQueue::enqueue`]
#[derive(Debug)]
pub struct Enqueued {
    /// Id of the new entry
    pub request_id: RequestId,
    /// Initial place in line
    pub position: usize,
    /// Status feed
    pub status: watch::Receiver<RequestStatus>,
    /// The partition had no worker; the caller must start one
    pub start_worker: bool,
}

/// Counters for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Partitions with a live worker
    pub partitions: usize,
    /// Entries waiting
    pub pending: usize,
    /// Entries running
    pub processing: usize,
    /// Terminal entries kept for polling
    pub retained: usize,
}

/// Caller's view of a submitted request
#[derive(Debug, Clone)]
pub struct RequestHandle {
    /// Request id, for polling and cancellation
    pub request_id: RequestId,
    /// Place in line at submission
    pub position: usize,
    status: watch::Receiver<RequestStatus>,
}

impl RequestHandle {
    /// Wrap a status feed
    #[must_use]
    pub const fn new(
        request_id: RequestId,
        position: usize,
        status: watch::Receiver<RequestStatus>,
    ) -> Self {
        Self {
            request_id,
            position,
            status,
        }
    }

    /// Latest status
    #[must_use]
    pub fn current(&self) -> RequestStatus {
        self.status.borrow().clone()
    }

    /// Wait for the terminal status.
    ///
    /// # Errors
    ///
    /// Returns the request's failure, or `InternalQueueFailure` if the queue
    /// went away before the request finished.
    pub async fn wait(mut self) -> Result<ProviderResult, DispatchError> {
        let status = self
            .status
            .wait_for(RequestStatus::is_terminal)
            .await
            .map(|status| status.clone());
        match status {
            Ok(RequestStatus::Completed(result)) => Ok(result),
            Ok(RequestStatus::Failed(error)) => Err(error),
            Ok(_) | Err(_) => Err(DispatchError::InternalQueueFailure {
                reason: "status channel closed before completion".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
struct Partition<T> {
    pending: VecDeque<QueueEntry<T>>,
    in_flight: Option<RequestId>,
}

impl<T> Partition<T> {
    const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    fn offset(&self) -> usize {
        usize::from(self.in_flight.is_some())
    }
}

#[derive(Debug)]
struct Tracked {
    partition: PartitionKey,
    status: watch::Sender<RequestStatus>,
    terminal_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner<T> {
    partitions: HashMap<PartitionKey, Partition<T>>,
    entries: HashMap<RequestId, Tracked>,
    retained: VecDeque<RequestId>,
}

impl<T> Inner<T> {
    /// Publishes the current place in line of every pending entry in `key`.
    fn publish_positions(&self, key: &PartitionKey) {
        let Some(partition) = self.partitions.get(key) else {
            return;
        };
        let offset = partition.offset();
        for (index, entry) in partition.pending.iter().enumerate() {
            if let Some(tracked) = self.entries.get(&entry.request_id) {
                let next = RequestStatus::Pending {
                    position: index + 1 + offset,
                };
                tracked.status.send_if_modified(|status| {
                    if *status == next {
                        false
                    } else {
                        *status = next;
                        true
                    }
                });
            }
        }
    }

    fn remove_pending(&mut self, id: RequestId, key: &PartitionKey) -> bool {
        let Some(partition) = self.partitions.get_mut(key) else {
            return false;
        };
        let Some(index) = partition.pending.iter().position(|e| e.request_id == id) else {
            return false;
        };
        partition.pending.remove(index);
        self.publish_positions(key);
        true
    }

    /// Moves an entry to a terminal status and enforces the count bound.
    fn mark_terminal(&mut self, id: RequestId, status: RequestStatus, capacity: usize) {
        let Some(tracked) = self.entries.get_mut(&id) else {
            return;
        };
        tracked.status.send_replace(status);
        tracked.terminal_at = Some(Instant::now());
        self.retained.push_back(id);
        while self.retained.len() > capacity {
            if let Some(evicted) = self.retained.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn is_terminal(&self, id: RequestId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|t| t.terminal_at.is_some())
    }
}

/// Partitioned FIFO queue with status tracking
#[derive(Debug)]
pub struct RequestQueue<T> {
    inner: Mutex<Inner<T>>,
    retention: RetentionPolicy,
}

impl<T> RequestQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                partitions: HashMap::new(),
                entries: HashMap::new(),
                retained: VecDeque::new(),
            }),
            retention: RetentionPolicy {
                capacity: retention.capacity.max(1),
                ..retention
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `payload` to partition `key` under a fresh id.
    pub fn enqueue(&self, key: PartitionKey, payload: T) -> Enqueued {
        self.enqueue_with_id(RequestId::new(), key, payload)
    }

    /// Append `payload` to partition `key` under a caller-chosen id.
    pub fn enqueue_with_id(&self, request_id: RequestId, key: PartitionKey, payload: T) -> Enqueued {
        let mut inner = self.lock();
        let start_worker = !inner.partitions.contains_key(&key);
        let partition = inner
            .partitions
            .entry(key.clone())
            .or_insert_with(Partition::new);
        partition.pending.push_back(QueueEntry {
            request_id,
            partition: key.clone(),
            payload,
            enqueued_at: Instant::now(),
        });
        let position = partition.pending.len() + partition.offset();

        let (sender, receiver) = watch::channel(RequestStatus::Pending { position });
        inner.entries.insert(
            request_id,
            Tracked {
                partition: key.clone(),
                status: sender,
                terminal_at: None,
            },
        );
        debug!(request_id = %request_id, partition = %key, position, "Request enqueued");

        Enqueued {
            request_id,
            position,
            status: receiver,
            start_worker,
        }
    }

    /// Next entry of `key` for its worker, now marked `Processing`.
    ///
    /// Returns `None` when the partition is drained; the partition is then
    /// dropped and the worker must exit. A later `enqueue` starts a new one.
    pub fn dequeue_next(&self, key: &PartitionKey) -> Option<QueueEntry<T>> {
        let mut inner = self.lock();
        let partition = inner.partitions.get_mut(key)?;
        partition.in_flight = None;
        let Some(entry) = partition.pending.pop_front() else {
            inner.partitions.remove(key);
            return None;
        };
        partition.in_flight = Some(entry.request_id);

        if let Some(tracked) = inner.entries.get(&entry.request_id) {
            tracked.status.send_replace(RequestStatus::Processing);
        }
        inner.publish_positions(key);
        Some(entry)
    }

    /// Record the result of a processed entry.
    ///
    /// A result for an entry that already failed (deadline) is discarded.
    pub fn finish(&self, id: RequestId, result: Result<ProviderResult, DispatchError>) {
        let mut inner = self.lock();
        let Some(key) = inner.entries.get(&id).map(|t| t.partition.clone()) else {
            return;
        };
        if let Some(partition) = inner.partitions.get_mut(&key) {
            if partition.in_flight == Some(id) {
                partition.in_flight = None;
            }
        }
        inner.publish_positions(&key);

        if inner.is_terminal(id) {
            debug!(request_id = %id, "Discarding late result");
            return;
        }
        let status = match result {
            Ok(result) => RequestStatus::Completed(result),
            Err(error) => RequestStatus::Failed(error),
        };
        inner.mark_terminal(id, status, self.retention.capacity);
    }

    /// Fail an entry whose caller deadline passed. Returns whether it changed.
    ///
    /// A pending entry is removed from its partition; a processing one keeps
    /// running but its result will be discarded.
    pub fn expire(&self, id: RequestId) -> bool {
        let mut inner = self.lock();
        let Some(tracked) = inner.entries.get(&id) else {
            return false;
        };
        let key = tracked.partition.clone();
        let pending = match *tracked.status.borrow() {
            RequestStatus::Pending { .. } => true,
            RequestStatus::Processing => false,
            RequestStatus::Completed(_) | RequestStatus::Failed(_) => return false,
        };

        if pending {
            inner.remove_pending(id, &key);
        }
        info!(request_id = %id, partition = %key, pending, "Request timed out");
        inner.mark_terminal(
            id,
            RequestStatus::Failed(DispatchError::Timeout),
            self.retention.capacity,
        );
        true
    }

    /// Withdraw a pending entry.
    pub fn cancel(&self, id: RequestId) -> CancelOutcome {
        let mut inner = self.lock();
        let Some(tracked) = inner.entries.get(&id) else {
            return CancelOutcome::NotFound;
        };
        let outcome = match &*tracked.status.borrow() {
            RequestStatus::Pending { .. } => CancelOutcome::Cancelled,
            RequestStatus::Processing => CancelOutcome::AlreadyProcessing,
            RequestStatus::Completed(_) | RequestStatus::Failed(_) => CancelOutcome::NotFound,
        };
        if outcome == CancelOutcome::Cancelled {
            let key = tracked.partition.clone();
            inner.remove_pending(id, &key);
            inner.mark_terminal(
                id,
                RequestStatus::Failed(DispatchError::Cancelled),
                self.retention.capacity,
            );
            info!(request_id = %id, partition = %key, "Request cancelled");
        }
        outcome
    }

    /// Current status, if the id is known and not yet purged
    #[must_use]
    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        self.lock()
            .entries
            .get(&id)
            .map(|t| t.status.borrow().clone())
    }

    /// Place in line: pending entries count the in-flight one, which is place 1.
    #[must_use]
    pub fn position(&self, id: RequestId) -> Option<usize> {
        match self.status(id)? {
            RequestStatus::Pending { position } => Some(position),
            RequestStatus::Processing => Some(1),
            RequestStatus::Completed(_) | RequestStatus::Failed(_) => None,
        }
    }

    /// New status feed for a known id
    #[must_use]
    pub fn subscribe(&self, id: RequestId) -> Option<watch::Receiver<RequestStatus>> {
        self.lock().entries.get(&id).map(|t| t.status.subscribe())
    }

    /// Forget terminal entries older than the retention ttl. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut purged = 0;
        while let Some(id) = inner.retained.front().copied() {
            let expired = inner
                .entries
                .get(&id)
                .and_then(|t| t.terminal_at)
                .is_none_or(|at| now.duration_since(at) >= self.retention.ttl);
            if !expired {
                break;
            }
            inner.retained.pop_front();
            inner.entries.remove(&id);
            purged += 1;
        }
        purged
    }

    /// Fail every pending entry (shutdown). Returns how many.
    pub fn fail_all_pending(&self, reason: &str) -> usize {
        let mut inner = self.lock();
        let ids: Vec<RequestId> = inner
            .partitions
            .values_mut()
            .flat_map(|p| p.pending.drain(..).map(|e| e.request_id))
            .collect();
        for id in &ids {
            inner.mark_terminal(
                *id,
                RequestStatus::Failed(DispatchError::InternalQueueFailure {
                    reason: reason.to_string(),
                }),
                self.retention.capacity,
            );
        }
        ids.len()
    }

    /// Counters for health reporting
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            partitions: inner.partitions.len(),
            pending: inner.partitions.values().map(|p| p.pending.len()).sum(),
            processing: inner
                .partitions
                .values()
                .filter(|p| p.in_flight.is_some())
                .count(),
            retained: inner.retained.len(),
        }
    }

    /// Retention bounds in use
    #[must_use]
    pub const fn retention(&self) -> RetentionPolicy {
        self.retention
    }
}
