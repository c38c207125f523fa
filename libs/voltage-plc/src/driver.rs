//! Contract between the core and the per-protocol drivers
//!
//! A driver owns the wire. It receives requests after optimization, one
//! transaction slot at a time, and reports per-tag failures as response codes.
//! Errors it returns from `read`/`write` are systemic; those for which
//! [`PlcError::breaks_connection`] holds make the connection cache discard the
//! physical connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use errors::{PlcError, PlcResult};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::model::{PlcResponseCode, PlcTag, PlcValue, SubscriptionHandle};
use crate::request::{ReadRequest, SubscriptionRequest, UnsubscriptionRequest, WriteRequest};
use crate::response::{ReadResponse, SubscriptionResponse, UnsubscriptionResponse, WriteResponse};

// ============================================================================
// Driver trait
// ============================================================================

/// Device-specific protocol logic behind one physical connection
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Protocol name used in logs and errors (`"s7"`, `"modbus-tcp"`, ...)
    fn protocol(&self) -> &str;

    /// Open the transport and run the protocol handshake
    async fn connect(&self, ctx: &DriverContext) -> PlcResult<()>;

    async fn close(&self) -> PlcResult<()>;

    fn is_connected(&self) -> bool;

    /// In-flight request limit agreed with the device during `connect`
    fn negotiated_concurrency(&self) -> Option<usize> {
        None
    }

    /// Protocol-specific address validation
    fn parse_tag(&self, address: &str) -> PlcResult<PlcTag> {
        PlcTag::parse(address)
    }

    async fn read(&self, request: ReadRequest) -> PlcResult<ReadResponse>;

    async fn write(&self, request: WriteRequest) -> PlcResult<WriteResponse>;

    async fn subscribe(&self, _request: SubscriptionRequest) -> PlcResult<SubscriptionResponse> {
        Err(PlcError::Unsupported(format!(
            "{} does not support subscriptions",
            self.protocol()
        )))
    }

    async fn unsubscribe(
        &self,
        _request: UnsubscriptionRequest,
    ) -> PlcResult<UnsubscriptionResponse> {
        Err(PlcError::Unsupported(format!(
            "{} does not support subscriptions",
            self.protocol()
        )))
    }
}

/// Collaborators handed to a driver when it connects
#[derive(Clone, Default)]
pub struct DriverContext {
    subscriptions: SubscriptionRegistry,
}

impl DriverContext {
    pub fn new(subscriptions: SubscriptionRegistry) -> Self {
        Self { subscriptions }
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }
}

// ============================================================================
// Subscription registry
// ============================================================================

/// Value change pushed by a driver for a subscribed tag
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub handle_id: u64,
    pub tag_name: String,
    pub code: PlcResponseCode,
    pub value: Option<PlcValue>,
    pub timestamp: DateTime<Utc>,
}

impl SubscriptionEvent {
    pub fn new(handle: &SubscriptionHandle, value: PlcValue) -> Self {
        Self {
            handle_id: handle.id,
            tag_name: handle.tag_name.clone(),
            code: PlcResponseCode::Ok,
            value: Some(value),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(handle: &SubscriptionHandle, code: PlcResponseCode) -> Self {
        Self {
            handle_id: handle.id,
            tag_name: handle.tag_name.clone(),
            code,
            value: None,
            timestamp: Utc::now(),
        }
    }
}

/// Per-connection map from subscription handle to consumer channel
///
/// Owned by the connection and injected into its driver; dropping the
/// connection drops every consumer sender with it.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    consumers: Arc<DashMap<u64, mpsc::Sender<SubscriptionEvent>>>,
    next_handle: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle id, unique within this connection
    pub fn next_handle_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Route events of `handles` to one new consumer channel
    pub fn register(
        &self,
        handles: &[SubscriptionHandle],
        buffer: usize,
    ) -> mpsc::Receiver<SubscriptionEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        for handle in handles {
            debug!(
                handle_id = handle.id,
                tag = %handle.tag_name,
                "Registering subscription consumer"
            );
            self.consumers.insert(handle.id, tx.clone());
        }
        rx
    }

    /// Deliver an event; false when nobody listens for the handle
    ///
    /// A full consumer drops the event rather than stall the driver.
    pub fn publish(&self, event: SubscriptionEvent) -> bool {
        let handle_id = event.handle_id;
        let Some(sender) = self.consumers.get(&handle_id).map(|s| s.clone()) else {
            trace!(handle_id, "No consumer for subscription event");
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(handle_id, "Subscription consumer lagging, event dropped");
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(handle_id, "Subscription consumer gone, unregistering");
                self.consumers.remove(&handle_id);
                false
            },
        }
    }

    pub fn unregister(&self, handles: &[SubscriptionHandle]) {
        for handle in handles {
            self.consumers.remove(&handle.id);
        }
    }

    pub fn clear(&self) {
        self.consumers.clear();
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
