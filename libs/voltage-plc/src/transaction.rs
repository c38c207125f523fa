//! Transaction slot manager
//!
//! Bounds the number of operations in flight on one physical connection and
//! dispatches queued work in submission order. The slot of a running
//! operation is held by the task that runs it and released when the operation
//! completes, or earlier through [`TransactionHandle::end_request`].
//! Bookkeeping happens under one short lock, the operations themselves run as
//! spawned tasks outside it.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use errors::{PlcError, PlcResult};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use crate::config::TransactionConfig;

type Work = Box<dyn FnOnce(TransactionHandle) -> BoxFuture<'static, ()> + Send>;

/// Lifecycle of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Started, nothing submitted yet
    Created,
    /// Waiting for a free slot
    Queued,
    /// Holding a slot
    Running,
    /// Slot released
    Ended,
    /// Removed from the queue before it ran
    Cancelled,
    /// Refused: queue full or manager shut down
    Rejected,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Ended | TransactionStatus::Cancelled | TransactionStatus::Rejected
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Created => "CREATED",
            TransactionStatus::Queued => "QUEUED",
            TransactionStatus::Running => "RUNNING",
            TransactionStatus::Ended => "ENDED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Rejected => "REJECTED",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of the manager counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

struct Cell {
    id: u64,
    status: watch::Sender<TransactionStatus>,
}

impl Cell {
    fn status(&self) -> TransactionStatus {
        *self.status.borrow()
    }

    fn set(&self, status: TransactionStatus) {
        self.status.send_replace(status);
    }
}

struct Queued {
    cell: Arc<Cell>,
    work: Work,
}

struct State {
    limit: usize,
    running: HashSet<u64>,
    queue: VecDeque<Queued>,
    closed: bool,
}

impl State {
    /// Move queued work into free slots; the caller spawns it after unlocking
    fn take_dispatchable(&mut self) -> Vec<Queued> {
        let mut ready = Vec::new();
        while self.running.len() < self.limit {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(next.cell.id);
            next.cell.set(TransactionStatus::Running);
            ready.push(next);
        }
        ready
    }
}

struct Shared {
    state: Mutex<State>,
    next_id: AtomicU64,
    max_queue_depth: Option<usize>,
    counters: Counters,
    runtime: Option<Handle>,
}

impl Shared {
    fn dispatch(self: &Arc<Self>, ready: Vec<Queued>) {
        for Queued { cell, work } in ready {
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            debug!(txn_id = cell.id, "Dispatching transaction");
            let guard = SlotGuard {
                shared: self.clone(),
                cell: cell.clone(),
            };
            let op = work(TransactionHandle {
                shared: self.clone(),
                cell,
            });
            let task = async move {
                op.await;
                drop(guard);
            };
            match Handle::try_current().ok().or_else(|| self.runtime.clone()) {
                Some(runtime) => {
                    runtime.spawn(task);
                },
                None => {
                    // Dropping the task drops its guard, which frees the slot again
                    error!("No tokio runtime available, dropping transaction work");
                },
            }
        }
    }

    /// Release the slot held by a running transaction
    fn finish(self: &Arc<Self>, cell: &Cell) -> PlcResult<()> {
        let ready = {
            let mut state = self.state.lock();
            match cell.status() {
                TransactionStatus::Running => {},
                status if status.is_terminal() => {
                    drop(state);
                    warn!(txn_id = cell.id, %status, "end_request called on an ended transaction");
                    return Err(PlcError::TransactionAlreadyEnded { id: cell.id });
                },
                status => {
                    drop(state);
                    warn!(
                        txn_id = cell.id,
                        %status,
                        "end_request called before the transaction ran"
                    );
                    return Err(PlcError::Internal(format!(
                        "transaction {} is {}, not running",
                        cell.id, status
                    )));
                },
            }
            state.running.remove(&cell.id);
            cell.set(TransactionStatus::Ended);
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            state.take_dispatchable()
        };
        debug!(txn_id = cell.id, "Transaction ended");
        self.dispatch(ready);
        Ok(())
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Per-connection admission control
///
/// Cheap to clone; clones share the same slots and queue.
#[derive(Clone)]
pub struct RequestTransactionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for RequestTransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTransactionManager")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for RequestTransactionManager {
    fn default() -> Self {
        Self::new(1)
    }
}

impl RequestTransactionManager {
    /// Manager with `max_concurrent_requests` slots and an unbounded queue
    pub fn new(max_concurrent_requests: usize) -> Self {
        Self::with_queue_limit(max_concurrent_requests, None)
    }

    pub fn from_config(config: &TransactionConfig) -> Self {
        Self::with_queue_limit(config.max_concurrent_requests, config.max_queue_depth)
    }

    pub fn with_queue_limit(
        max_concurrent_requests: usize,
        max_queue_depth: Option<usize>,
    ) -> Self {
        let limit = clamp_limit(max_concurrent_requests);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    limit,
                    running: HashSet::new(),
                    queue: VecDeque::new(),
                    closed: false,
                }),
                next_id: AtomicU64::new(0),
                max_queue_depth,
                counters: Counters::default(),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Change the ceiling; raising it dispatches queued work immediately
    pub fn set_number_of_concurrent_requests(&self, max_concurrent_requests: usize) {
        let limit = clamp_limit(max_concurrent_requests);
        let ready = {
            let mut state = self.shared.state.lock();
            if state.limit != limit {
                debug!(from = state.limit, to = limit, "Changing transaction concurrency");
            }
            state.limit = limit;
            state.take_dispatchable()
        };
        self.shared.dispatch(ready);
    }

    pub fn number_of_concurrent_requests(&self) -> usize {
        self.shared.state.lock().limit
    }

    /// Allocate a transaction handle without blocking
    pub fn start_request(&self) -> RequestTransaction {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (status, _) = watch::channel(TransactionStatus::Created);
        RequestTransaction {
            shared: self.shared.clone(),
            cell: Arc::new(Cell { id, status }),
        }
    }

    /// Run `op` inside a transaction and wait for its result
    ///
    /// If the caller goes away while the operation is still queued, the
    /// operation is skipped when its turn comes and the slot is released.
    pub async fn execute<T, F, Fut>(&self, op: F) -> PlcResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PlcResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let transaction = self.start_request();
        let id = transaction.id();
        transaction.submit(move |handle| async move {
            if tx.is_closed() {
                debug!(txn_id = handle.id(), "Caller gone, skipping queued transaction");
                return;
            }
            let result = op().await;
            // Free the slot before the caller resumes
            let _ = handle.end_request();
            let _ = tx.send(result);
        })?;

        rx.await.map_err(|_| {
            PlcError::Internal(format!("transaction {} dropped before completion", id))
        })?
    }

    /// Refuse new work and drop everything still queued
    ///
    /// Running operations finish normally.
    pub fn close(&self) {
        let dropped: Vec<Queued> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.drain(..).collect()
        };
        debug!(dropped = dropped.len(), "Transaction manager shut down");
        for queued in &dropped {
            queued.cell.set(TransactionStatus::Rejected);
        }
        self.shared
            .counters
            .rejected
            .fetch_add(dropped.len() as u64, Ordering::Relaxed);
        // Work closures are dropped here, outside the lock
        drop(dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> TransactionStats {
        let (running, queued, max_concurrent) = {
            let state = self.shared.state.lock();
            (state.running.len(), state.queue.len(), state.limit)
        };
        let c = &self.shared.counters;
        TransactionStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            running,
            queued,
            max_concurrent,
        }
    }
}

fn clamp_limit(requested: usize) -> usize {
    if requested == 0 {
        warn!("Concurrent request limit of 0 would stall every request, using 1");
        1
    } else {
        requested
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Caller-side handle of one transaction
pub struct RequestTransaction {
    shared: Arc<Shared>,
    cell: Arc<Cell>,
}

impl fmt::Debug for RequestTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTransaction")
            .field("id", &self.cell.id)
            .field("status", &self.cell.status())
            .finish()
    }
}

impl RequestTransaction {
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.cell.status()
    }

    /// Hand over the operation; it runs as soon as a slot is free
    ///
    /// The slot stays taken until the returned future completes. The operation
    /// may release it earlier through the [`TransactionHandle`] it receives.
    pub fn submit<F, Fut>(&self, op: F) -> PlcResult<()>
    where
        F: FnOnce(TransactionHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let work: Work = Box::new(move |handle| Box::pin(op(handle)));
        let shared = &self.shared;
        let cell = &self.cell;

        let mut state = shared.state.lock();
        if cell.status() != TransactionStatus::Created {
            let status = cell.status();
            drop(state);
            return Err(PlcError::Internal(format!(
                "transaction {} already submitted ({})",
                cell.id, status
            )));
        }
        if state.closed {
            cell.set(TransactionStatus::Rejected);
            drop(state);
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PlcError::TransactionManagerShutdown);
        }

        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if state.queue.is_empty() && state.running.len() < state.limit {
            state.running.insert(cell.id);
            cell.set(TransactionStatus::Running);
            drop(state);
            shared.dispatch(vec![Queued {
                cell: cell.clone(),
                work,
            }]);
            return Ok(());
        }

        if let Some(depth) = shared.max_queue_depth {
            if state.queue.len() >= depth {
                cell.set(TransactionStatus::Rejected);
                drop(state);
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(txn_id = cell.id, depth, "Transaction queue full");
                return Err(PlcError::QueueFull { depth });
            }
        }

        cell.set(TransactionStatus::Queued);
        state.queue.push_back(Queued {
            cell: cell.clone(),
            work,
        });
        debug!(txn_id = cell.id, queued = state.queue.len(), "Transaction queued");
        Ok(())
    }

    /// Release the slot from the caller side
    pub fn end_request(&self) -> PlcResult<()> {
        self.shared.finish(&self.cell)
    }

    /// Remove a still-queued transaction; false once it has been dispatched
    pub fn cancel(&self) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let Some(pos) = state.queue.iter().position(|q| q.cell.id == self.cell.id) else {
                return false;
            };
            self.cell.set(TransactionStatus::Cancelled);
            state.queue.remove(pos)
        };
        self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(txn_id = self.cell.id, "Queued transaction cancelled");
        drop(removed);
        true
    }

    /// Resolve once the transaction reached a terminal status
    pub async fn await_completion(&self) -> TransactionStatus {
        let mut rx = self.cell.status.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.cell.status(),
        };
        status
    }
}

/// What a running operation sees of its transaction
///
/// Dropping the handle does not release the slot; the slot is held until the
/// operation's future completes.
pub struct TransactionHandle {
    shared: Arc<Shared>,
    cell: Arc<Cell>,
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.cell.id)
            .field("status", &self.cell.status())
            .finish()
    }
}

impl TransactionHandle {
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.cell.status()
    }

    /// Release the slot before the operation completes; a second call is an error
    pub fn end_request(&self) -> PlcResult<()> {
        self.shared.finish(&self.cell)
    }
}

/// Held by the dispatched task for as long as the operation runs
struct SlotGuard {
    shared: Arc<Shared>,
    cell: Arc<Cell>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.cell.status() == TransactionStatus::Running {
            let _ = self.shared.finish(&self.cell);
        }
    }
}
