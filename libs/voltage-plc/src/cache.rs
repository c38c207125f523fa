//! Single-connection cache with exclusive borrow
//!
//! A cache owns at most one physical connection for one key and lends it to
//! one borrower at a time. The connection is created lazily on the first
//! borrow, returned when the lease is closed or dropped, and discarded when a
//! request through it times out or fails in a way that breaks the transport.
//! A watchdog task revokes leases held too long and, if configured, closes
//! connections left idle.
//!
//! ```text
//!  DISCONNECTED ──get──▶ CONNECTING ──ok──▶ AVAILABLE ◀──return── BORROWED
//!       ▲                    │                  │                    ▲  │
//!       └──── failed ────────┘                  └──────get───────────┘  │
//!       └──────────── broken / watchdog / idle / reconnect ─────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use errors::{PlcError, PlcResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::connection::{ConnectionFactory, ConnectionKey, PlcConnection};
use crate::driver::SubscriptionEvent;
use crate::model::{PlcTag, SubscriptionHandle};
use crate::request::{
    ReadRequest, ReadRequestBuilder, RequestBuilder, RequestExecutor, RequestOperation,
    SubscriptionRequest, SubscriptionRequestBuilder, UnsubscriptionRequest,
    UnsubscriptionRequestBuilder, WriteRequest, WriteRequestBuilder,
};
use crate::response::{ReadResponse, SubscriptionResponse, UnsubscriptionResponse, WriteResponse};
use crate::transaction::TransactionStats;

// ============================================================================
// State & events
// ============================================================================

/// Externally visible cache state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheState {
    Disconnected,
    Connecting,
    Available,
    Borrowed,
    Closed,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheState::Disconnected => write!(f, "DISCONNECTED"),
            CacheState::Connecting => write!(f, "CONNECTING"),
            CacheState::Available => write!(f, "AVAILABLE"),
            CacheState::Borrowed => write!(f, "BORROWED"),
            CacheState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Metrics event for cache operations
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    StateChanged { key: String, from: CacheState, to: CacheState },
    Connected { key: String },
    ConnectFailed { key: String, reason: String },
    Borrowed { key: String, lease_id: u64 },
    Returned { key: String, lease_id: u64 },
    Rejected { key: String },
    BorrowTimeout { key: String, waited_ms: u64 },
    WatchdogTriggered { key: String, lease_id: u64 },
    ConnectionBroken { key: String, reason: String },
    IdleClosed { key: String },
}

pub type CacheEventHook = Arc<dyn Fn(CacheEvent) + Send + Sync>;

/// Snapshot of one cache's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub key: String,
    pub state: CacheState,
    pub connects: u64,
    pub connect_failures: u64,
    pub borrows: u64,
    pub returns: u64,
    pub rejections: u64,
    pub borrow_timeouts: u64,
    pub watchdog_triggers: u64,
    pub broken_connections: u64,
    pub idle_closes: u64,
    pub reconnects: u64,
    pub waiting: usize,
    pub transactions: Option<TransactionStats>,
}

#[derive(Default)]
struct CacheMetrics {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    borrows: AtomicU64,
    returns: AtomicU64,
    rejections: AtomicU64,
    borrow_timeouts: AtomicU64,
    watchdog_triggers: AtomicU64,
    broken_connections: AtomicU64,
    idle_closes: AtomicU64,
    reconnects: AtomicU64,
    waiting: AtomicUsize,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// Internal slot
// ============================================================================

struct Lease {
    id: u64,
    valid: AtomicBool,
    returned: AtomicBool,
}

impl Lease {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            valid: AtomicBool::new(true),
            returned: AtomicBool::new(false),
        })
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn revoke(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// The connection lives inside the states that need it, so `Borrowed`
/// without a connection cannot be represented
enum Slot {
    Disconnected,
    Connecting,
    Available {
        connection: Arc<PlcConnection>,
        since: Instant,
    },
    Borrowed {
        connection: Arc<PlcConnection>,
        lease: Arc<Lease>,
        since: Instant,
    },
    Closed,
}

impl Slot {
    fn state(&self) -> CacheState {
        match self {
            Slot::Disconnected => CacheState::Disconnected,
            Slot::Connecting => CacheState::Connecting,
            Slot::Available { .. } => CacheState::Available,
            Slot::Borrowed { .. } => CacheState::Borrowed,
            Slot::Closed => CacheState::Closed,
        }
    }
}

enum Next {
    Leased(CachedConnection),
    Connect,
    Wait,
}

struct CacheInner {
    key: ConnectionKey,
    label: String,
    factory: ConnectionFactory,
    config: CacheConfig,
    slot: Mutex<Slot>,
    released: Notify,
    next_lease: AtomicU64,
    metrics: CacheMetrics,
    metrics_hook: Option<CacheEventHook>,
}

impl CacheInner {
    fn emit(&self, event: CacheEvent) {
        if let Some(hook) = &self.metrics_hook {
            hook(event);
        }
    }

    /// Replace the slot, logging and reporting the state change
    ///
    /// Runs under the slot lock so observers see transitions in order; the
    /// metrics hook must not call back into the cache.
    fn transition(&self, slot: &mut Slot, next: Slot) -> Option<Arc<PlcConnection>> {
        let from = slot.state();
        let to = next.state();
        let previous = std::mem::replace(slot, next);
        if from != to {
            debug!(key = %self.label, %from, %to, "Connection cache state change");
            self.emit(CacheEvent::StateChanged {
                key: self.label.clone(),
                from,
                to,
            });
        }
        match previous {
            Slot::Available { connection, .. } | Slot::Borrowed { connection, .. } => {
                Some(connection)
            },
            _ => None,
        }
    }

    fn lease_out(
        self: &Arc<Self>,
        slot: &mut Slot,
        connection: Arc<PlcConnection>,
    ) -> CachedConnection {
        let lease = Lease::new(self.next_lease.fetch_add(1, Ordering::Relaxed) + 1);
        self.transition(
            slot,
            Slot::Borrowed {
                connection: connection.clone(),
                lease: lease.clone(),
                since: Instant::now(),
            },
        );
        bump(&self.metrics.borrows);
        self.emit(CacheEvent::Borrowed {
            key: self.label.clone(),
            lease_id: lease.id,
        });
        debug!(key = %self.label, lease_id = lease.id, "Connection borrowed");
        CachedConnection::new(self.clone(), connection, lease)
    }

    async fn acquire(self: &Arc<Self>) -> PlcResult<CachedConnection> {
        let started = Instant::now();
        let deadline = self.config.max_wait_time().map(|wait| started + wait);

        loop {
            // Register interest before inspecting the slot so a release between
            // the check and the wait is not lost
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut slot = self.slot.lock();
                match &*slot {
                    Slot::Closed => {
                        return Err(PlcError::CacheClosed {
                            key: self.label.clone(),
                        })
                    },
                    Slot::Disconnected => {
                        self.transition(&mut slot, Slot::Connecting);
                        Next::Connect
                    },
                    Slot::Available { connection, .. } => {
                        let connection = connection.clone();
                        Next::Leased(self.lease_out(&mut slot, connection))
                    },
                    Slot::Connecting | Slot::Borrowed { .. } => Next::Wait,
                }
            };

            match next {
                Next::Leased(leased) => return Ok(leased),
                Next::Connect => return self.connect_and_lease().await,
                Next::Wait => {},
            }

            let Some(deadline) = deadline else {
                bump(&self.metrics.rejections);
                self.emit(CacheEvent::Rejected {
                    key: self.label.clone(),
                });
                debug!(key = %self.label, "Connection busy, rejecting borrow");
                return Err(PlcError::BorrowConflict {
                    key: self.label.clone(),
                });
            };

            self.metrics.waiting.fetch_add(1, Ordering::Relaxed);
            let woke = tokio::time::timeout_at(deadline, notified).await;
            self.metrics.waiting.fetch_sub(1, Ordering::Relaxed);

            if woke.is_err() {
                let waited_ms = started.elapsed().as_millis() as u64;
                bump(&self.metrics.borrow_timeouts);
                self.emit(CacheEvent::BorrowTimeout {
                    key: self.label.clone(),
                    waited_ms,
                });
                debug!(key = %self.label, waited_ms, "Timed out waiting for connection");
                return Err(PlcError::BorrowTimeout {
                    key: self.label.clone(),
                    waited_ms,
                });
            }
        }
    }

    async fn connect_and_lease(self: &Arc<Self>) -> PlcResult<CachedConnection> {
        let mut pending = ConnectingGuard {
            cache: self,
            connection: None,
            armed: true,
        };

        let connection = match (self.factory)(&self.key) {
            Ok(connection) => Arc::new(connection),
            Err(e) => return Err(self.connect_failed(e.to_string())),
        };
        pending.connection = Some(connection.clone());

        match tokio::time::timeout(self.config.request_timeout(), connection.connect()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string())),
            Err(_) => {
                return Err(self.connect_failed(format!(
                    "connect timed out after {}ms",
                    self.config.request_timeout_ms
                )));
            },
        }

        let leased = {
            let mut slot = self.slot.lock();
            match slot.state() {
                CacheState::Connecting => {},
                CacheState::Closed => {
                    drop(slot);
                    pending.armed = false;
                    close_in_background(connection, self.label.clone());
                    return Err(PlcError::CacheClosed {
                        key: self.label.clone(),
                    });
                },
                _ => {
                    // Reset while the handshake was running; the slot no
                    // longer belongs to this attempt
                    drop(slot);
                    pending.armed = false;
                    close_in_background(connection, self.label.clone());
                    return Err(self.connect_failed("reset during connect".to_string()));
                },
            }
            pending.armed = false;
            self.transition(
                &mut slot,
                Slot::Available {
                    connection: connection.clone(),
                    since: Instant::now(),
                },
            );
            bump(&self.metrics.connects);
            self.emit(CacheEvent::Connected {
                key: self.label.clone(),
            });
            self.lease_out(&mut slot, connection)
        };
        info!(key = %self.label, "Cached connection established");
        Ok(leased)
    }

    fn connect_failed(&self, reason: String) -> PlcError {
        bump(&self.metrics.connect_failures);
        warn!(key = %self.label, "Connection failed: {}", reason);
        self.emit(CacheEvent::ConnectFailed {
            key: self.label.clone(),
            reason: reason.clone(),
        });
        PlcError::ConnectionFailed {
            url: self.key.url.clone(),
            reason,
        }
    }

    fn return_lease(&self, lease: &Lease) -> PlcResult<()> {
        if lease.returned.swap(true, Ordering::AcqRel) {
            return Err(PlcError::LeaseInvalidated(format!(
                "lease {} of {} was already returned",
                lease.id, self.label
            )));
        }
        if !lease.is_valid() {
            warn!(
                key = %self.label,
                lease_id = lease.id,
                "Error trying to return lease from invalid connection"
            );
            return Err(PlcError::LeaseInvalidated(format!(
                "lease {} of {} was revoked before it was returned",
                lease.id, self.label
            )));
        }

        let mut slot = self.slot.lock();
        let connection = match &*slot {
            Slot::Borrowed {
                connection,
                lease: current,
                ..
            } if current.id == lease.id => connection.clone(),
            _ => {
                drop(slot);
                return Err(PlcError::LeaseInvalidated(format!(
                    "lease {} of {} no longer holds the connection",
                    lease.id, self.label
                )));
            },
        };
        lease.revoke();
        self.transition(
            &mut slot,
            Slot::Available {
                connection,
                since: Instant::now(),
            },
        );
        drop(slot);

        bump(&self.metrics.returns);
        self.emit(CacheEvent::Returned {
            key: self.label.clone(),
            lease_id: lease.id,
        });
        debug!(key = %self.label, lease_id = lease.id, "Connection returned");
        self.released.notify_one();
        Ok(())
    }

    /// Discard the physical connection
    ///
    /// With `lease_id` set, only acts if that lease still holds the
    /// connection, so a stale lease cannot tear down its successor.
    fn discard(&self, lease_id: Option<u64>, reason: &str) -> bool {
        let stale = {
            let mut slot = self.slot.lock();
            if let Some(id) = lease_id {
                match &*slot {
                    Slot::Borrowed { lease, .. } if lease.id == id => {},
                    _ => return false,
                }
            }
            if matches!(&*slot, Slot::Closed | Slot::Disconnected) {
                return false;
            }
            if let Slot::Borrowed { lease, .. } = &*slot {
                lease.revoke();
            }
            self.transition(&mut slot, Slot::Disconnected)
        };
        warn!(key = %self.label, "Discarding connection: {}", reason);
        if let Some(connection) = stale {
            close_in_background(connection, self.label.clone());
        }
        self.released.notify_one();
        true
    }

    fn handle_broken_connection(&self, lease_id: Option<u64>, reason: &str) {
        if self.discard(lease_id, reason) {
            bump(&self.metrics.broken_connections);
            self.emit(CacheEvent::ConnectionBroken {
                key: self.label.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// One watchdog pass; false once the cache is closed
    fn check_deadlines(&self) -> bool {
        enum Expired {
            Lease(u64),
            Idle,
        }

        let expired = {
            let slot = self.slot.lock();
            match &*slot {
                Slot::Closed => return false,
                Slot::Borrowed { lease, since, .. }
                    if since.elapsed() > self.config.max_lease_time() =>
                {
                    Some(Expired::Lease(lease.id))
                },
                Slot::Available { since, .. } => match self.config.max_idle_time() {
                    Some(idle) if since.elapsed() > idle => Some(Expired::Idle),
                    _ => None,
                },
                _ => None,
            }
        };

        match expired {
            Some(Expired::Lease(lease_id)) => {
                let reason = format!(
                    "lease {} held longer than {}ms",
                    lease_id, self.config.max_lease_time_ms
                );
                if self.discard(Some(lease_id), &reason) {
                    bump(&self.metrics.watchdog_triggers);
                    self.emit(CacheEvent::WatchdogTriggered {
                        key: self.label.clone(),
                        lease_id,
                    });
                }
            },
            Some(Expired::Idle) => {
                let stale = {
                    let mut slot = self.slot.lock();
                    match &*slot {
                        Slot::Available { since, .. }
                            if self
                                .config
                                .max_idle_time()
                                .is_some_and(|idle| since.elapsed() > idle) =>
                        {
                            self.transition(&mut slot, Slot::Disconnected)
                        },
                        _ => None,
                    }
                };
                if let Some(connection) = stale {
                    debug!(key = %self.label, "Closing idle connection");
                    bump(&self.metrics.idle_closes);
                    self.emit(CacheEvent::IdleClosed {
                        key: self.label.clone(),
                    });
                    close_in_background(connection, self.label.clone());
                }
            },
            None => {},
        }
        true
    }

    fn stats(&self) -> CacheStats {
        let (state, transactions) = {
            let slot = self.slot.lock();
            let transactions = match &*slot {
                Slot::Available { connection, .. } | Slot::Borrowed { connection, .. } => {
                    Some(connection.transaction_stats())
                },
                _ => None,
            };
            (slot.state(), transactions)
        };
        let m = &self.metrics;
        CacheStats {
            key: self.label.clone(),
            state,
            connects: m.connects.load(Ordering::Relaxed),
            connect_failures: m.connect_failures.load(Ordering::Relaxed),
            borrows: m.borrows.load(Ordering::Relaxed),
            returns: m.returns.load(Ordering::Relaxed),
            rejections: m.rejections.load(Ordering::Relaxed),
            borrow_timeouts: m.borrow_timeouts.load(Ordering::Relaxed),
            watchdog_triggers: m.watchdog_triggers.load(Ordering::Relaxed),
            broken_connections: m.broken_connections.load(Ordering::Relaxed),
            idle_closes: m.idle_closes.load(Ordering::Relaxed),
            reconnects: m.reconnects.load(Ordering::Relaxed),
            waiting: m.waiting.load(Ordering::Relaxed),
            transactions,
        }
    }
}

/// Puts a cache stuck in `Connecting` back to `Disconnected` on early exit
///
/// Covers failed handshakes and callers that stop polling mid-connect; a
/// connection created by the attempt is closed.
struct ConnectingGuard<'a> {
    cache: &'a CacheInner,
    connection: Option<Arc<PlcConnection>>,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut slot = self.cache.slot.lock();
            if matches!(&*slot, Slot::Connecting) {
                self.cache.transition(&mut slot, Slot::Disconnected);
            }
        }
        if let Some(connection) = self.connection.take() {
            close_in_background(connection, self.cache.label.clone());
        }
        self.cache.released.notify_one();
    }
}

fn close_in_background(connection: Arc<PlcConnection>, key: String) {
    let close = async move {
        if let Err(e) = connection.close().await {
            debug!(key = %key, "Error closing discarded connection: {}", e);
        }
    };
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(close);
        },
        Err(_) => debug!("No runtime to close discarded connection"),
    }
}

async fn run_watchdog(cache: Weak<CacheInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
            break;
        };
        if !cache.check_deadlines() {
            debug!(key = %cache.label, "Cache closed, watchdog stopping");
            break;
        }
    }
}

// ============================================================================
// Public cache
// ============================================================================

/// Lazily connected, exclusively borrowed connection for one key
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
    watchdog: Option<JoinHandle<()>>,
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("key", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionCache {
    /// No connection is made until the first `get_connection`
    pub fn new(key: ConnectionKey, factory: ConnectionFactory, config: CacheConfig) -> Self {
        Self::with_metrics_hook(key, factory, config, None)
    }

    pub fn with_metrics_hook(
        key: ConnectionKey,
        factory: ConnectionFactory,
        config: CacheConfig,
        metrics_hook: Option<CacheEventHook>,
    ) -> Self {
        let interval = config.watchdog_interval().max(Duration::from_millis(1));
        let inner = Arc::new(CacheInner {
            label: key.to_string(),
            key,
            factory,
            config,
            slot: Mutex::new(Slot::Disconnected),
            released: Notify::new(),
            next_lease: AtomicU64::new(0),
            metrics: CacheMetrics::default(),
            metrics_hook,
        });

        let watchdog = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(run_watchdog(Arc::downgrade(&inner), interval))),
            Err(_) => {
                warn!(key = %inner.label, "No tokio runtime, connection watchdog disabled");
                None
            },
        };

        Self { inner, watchdog }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.inner.key
    }

    pub fn state(&self) -> CacheState {
        self.inner.slot.lock().state()
    }

    /// Borrow the connection, connecting first if needed
    ///
    /// While another lease is out this fails with `BorrowConflict`, or waits
    /// up to `max_wait_time` and then fails with `BorrowTimeout`.
    pub async fn get_connection(&self) -> PlcResult<CachedConnection> {
        self.inner.acquire().await
    }

    /// Discard the physical connection unconditionally
    pub fn handle_broken_connection(&self) {
        self.inner.handle_broken_connection(None, "reported broken");
    }

    /// Force a fresh connect on the next borrow
    pub fn trigger_reconnect(&self) {
        if self.inner.discard(None, "manual reconnect") {
            bump(&self.inner.metrics.reconnects);
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    /// Revoke any lease, close the connection and refuse further borrows
    pub async fn close(&self) -> PlcResult<()> {
        let connection = {
            let mut slot = self.inner.slot.lock();
            if let Slot::Borrowed { lease, .. } = &*slot {
                lease.revoke();
            }
            self.inner.transition(&mut slot, Slot::Closed)
        };
        self.inner.released.notify_waiters();
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
        if let Some(connection) = connection {
            connection.close().await?;
        }
        info!(key = %self.inner.label, "Connection cache closed");
        Ok(())
    }
}

impl Drop for ConnectionCache {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Request executor bound to one lease
///
/// Refuses to run once the lease is gone, bounds every request by the
/// request timeout and reports transport failures back to the cache.
struct LeasedExecutor {
    cache: Arc<CacheInner>,
    connection: Arc<PlcConnection>,
    lease: Arc<Lease>,
}

impl LeasedExecutor {
    fn ensure_valid(&self) -> PlcResult<()> {
        if self.lease.is_valid() {
            Ok(())
        } else {
            Err(PlcError::LeaseInvalidated(format!(
                "{}-{} is no longer usable",
                self.cache.label, self.lease.id
            )))
        }
    }

    async fn guarded<T, F>(&self, fut: F) -> PlcResult<T>
    where
        F: Future<Output = PlcResult<T>>,
    {
        self.ensure_valid()?;
        let timeout = self.cache.config.request_timeout();
        let outcome = match tokio::time::timeout(timeout, fut).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PlcError::Timeout(format!(
                "{} after {}ms",
                self.cache.label,
                timeout.as_millis()
            ))),
        };

        // Split requests report sub-request failures per tag, so the
        // connection's own record is checked as well
        match (&outcome, self.connection.take_broken()) {
            (Err(e), _) if e.breaks_connection() => {
                self.cache
                    .handle_broken_connection(Some(self.lease.id), &e.to_string());
            },
            (_, Some(reason)) => {
                self.cache.handle_broken_connection(Some(self.lease.id), &reason);
            },
            _ if !self.connection.is_connected() => {
                self.cache.handle_broken_connection(
                    Some(self.lease.id),
                    "driver reports disconnected",
                );
            },
            _ => {},
        }
        outcome
    }
}

#[async_trait]
impl RequestExecutor for LeasedExecutor {
    fn parse_tag(&self, address: &str) -> PlcResult<PlcTag> {
        self.connection.parse_tag(address)
    }

    async fn execute_read(&self, request: ReadRequest) -> PlcResult<ReadResponse> {
        self.guarded(self.connection.execute_read(request)).await
    }

    async fn execute_write(&self, request: WriteRequest) -> PlcResult<WriteResponse> {
        self.guarded(self.connection.execute_write(request)).await
    }

    async fn execute_subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> PlcResult<SubscriptionResponse> {
        self.guarded(self.connection.execute_subscribe(request)).await
    }

    async fn execute_unsubscribe(
        &self,
        request: UnsubscriptionRequest,
    ) -> PlcResult<UnsubscriptionResponse> {
        self.guarded(self.connection.execute_unsubscribe(request))
            .await
    }
}

/// Exclusive handle on the cached connection
///
/// Close it to hand the connection back; dropping it does the same. Once
/// returned, revoked by the watchdog or invalidated by a broken connection,
/// every operation on it fails with `LeaseInvalidated`.
pub struct CachedConnection {
    executor: Arc<LeasedExecutor>,
}

impl fmt::Debug for CachedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedConnection")
            .field("id", &self.connection_id())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl CachedConnection {
    fn new(cache: Arc<CacheInner>, connection: Arc<PlcConnection>, lease: Arc<Lease>) -> Self {
        Self {
            executor: Arc::new(LeasedExecutor {
                cache,
                connection,
                lease,
            }),
        }
    }

    pub fn lease_id(&self) -> u64 {
        self.executor.lease.id
    }

    /// `"{key}-{lease_id}"`
    pub fn connection_id(&self) -> String {
        format!("{}-{}", self.executor.cache.label, self.executor.lease.id)
    }

    pub fn is_valid(&self) -> bool {
        self.executor.lease.is_valid()
    }

    pub fn is_connected(&self) -> bool {
        self.is_valid() && self.executor.connection.is_connected()
    }

    fn builder<T: RequestOperation>(&self) -> PlcResult<RequestBuilder<T>> {
        self.executor.ensure_valid()?;
        Ok(RequestBuilder::new(self.executor.clone()))
    }

    pub fn read_request_builder(&self) -> PlcResult<ReadRequestBuilder> {
        self.builder()
    }

    pub fn write_request_builder(&self) -> PlcResult<WriteRequestBuilder> {
        self.builder()
    }

    pub fn subscription_request_builder(&self) -> PlcResult<SubscriptionRequestBuilder> {
        self.builder()
    }

    pub fn unsubscription_request_builder(&self) -> PlcResult<UnsubscriptionRequestBuilder> {
        self.builder()
    }

    /// Receive value changes for handles obtained through this connection
    pub fn register_consumer(
        &self,
        handles: &[SubscriptionHandle],
        buffer: usize,
    ) -> PlcResult<mpsc::Receiver<SubscriptionEvent>> {
        self.executor.ensure_valid()?;
        Ok(self.executor.connection.register_consumer(handles, buffer))
    }

    pub fn transaction_stats(&self) -> PlcResult<TransactionStats> {
        self.executor.ensure_valid()?;
        Ok(self.executor.connection.transaction_stats())
    }

    /// Hand the connection back to the cache
    ///
    /// Fails if the lease was revoked in the meantime or already returned.
    pub fn close(&self) -> PlcResult<()> {
        self.executor.cache.return_lease(&self.executor.lease)
    }
}

impl Drop for CachedConnection {
    fn drop(&mut self) {
        let lease = &self.executor.lease;
        if lease.is_valid() && !lease.returned.load(Ordering::Acquire) {
            let _ = self.executor.cache.return_lease(lease);
        }
    }
}
