//! Common test utilities: an in-memory driver and a counting factory

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use voltage_plc::driver::{DriverContext, ProtocolDriver, SubscriptionEvent};
use voltage_plc::model::{PlcResponseCode, PlcValue, SubscriptionHandle};
use voltage_plc::request::{
    ReadRequest, SubscriptionRequest, UnsubscriptionRequest, WriteRequest,
};
use voltage_plc::response::{
    ReadResponse, ResponseItem, SubscriptionResponse, TagResponse, UnsubscriptionResponse,
    WriteResponse,
};
use voltage_plc::{
    CacheConfig, ConnectionFactory, ConnectionKey, PlcConnection, PlcError, PlcResult,
    RequestOptimizer,
};

/// Scriptable device: a map from address to value
#[derive(Default)]
pub struct MockDriver {
    connected: AtomicBool,
    ctx: Mutex<Option<DriverContext>>,
    memory: Mutex<HashMap<String, PlcValue>>,
    /// A sub-request touching one of these addresses fails as a whole
    failing: Mutex<HashSet<String>>,
    /// These addresses answer REMOTE_ERROR
    remote_errors: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    negotiated: Mutex<Option<usize>>,
    fail_connect: AtomicBool,
    /// Next request reports a transport failure and drops the link
    break_next: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    requests: Mutex<Vec<Vec<String>>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_value(&self, address: &str, value: impl Into<PlcValue>) {
        self.memory.lock().insert(address.to_string(), value.into());
    }

    pub fn fail_address(&self, address: &str) {
        self.failing.lock().insert(address.to_string());
    }

    pub fn remote_error_address(&self, address: &str) {
        self.remote_errors.lock().insert(address.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn set_negotiated_concurrency(&self, limit: usize) {
        *self.negotiated.lock() = Some(limit);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn break_next_request(&self) {
        self.break_next.store(true, Ordering::SeqCst);
    }

    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Tag names of every request that reached the driver, in arrival order
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().clone()
    }

    /// Push a value change for a subscription through the injected registry
    pub fn emit(&self, handle: &SubscriptionHandle, value: impl Into<PlcValue>) -> bool {
        let ctx = self.ctx.lock().clone();
        match ctx {
            Some(ctx) => ctx
                .subscriptions()
                .publish(SubscriptionEvent::new(handle, value.into())),
            None => false,
        }
    }

    async fn enter(&self, names: Vec<String>, addresses: &[String]) -> PlcResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PlcError::NotConnected("mock".to_string()));
        }
        self.requests.lock().push(names);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.break_next.swap(false, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(PlcError::ConnectionBroken("mock link reset".to_string()));
        }
        let failing = self.failing.lock();
        if let Some(address) = addresses.iter().find(|a| failing.contains(*a)) {
            return Err(PlcError::protocol("mock", format!("NAK for {}", address)));
        }
        Ok(())
    }

    fn code_for(&self, address: &str) -> PlcResponseCode {
        if self.remote_errors.lock().contains(address) {
            PlcResponseCode::RemoteError
        } else {
            PlcResponseCode::Ok
        }
    }
}

#[async_trait]
impl ProtocolDriver for MockDriver {
    fn protocol(&self) -> &str {
        "mock"
    }

    async fn connect(&self, ctx: &DriverContext) -> PlcResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let connect_delay = *self.connect_delay.lock();
        if !connect_delay.is_zero() {
            tokio::time::sleep(connect_delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(PlcError::ConnectionFailed {
                url: "mock://".to_string(),
                reason: "refused".to_string(),
            });
        }
        *self.ctx.lock() = Some(ctx.clone());
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> PlcResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn negotiated_concurrency(&self) -> Option<usize> {
        *self.negotiated.lock()
    }

    async fn read(&self, request: ReadRequest) -> PlcResult<ReadResponse> {
        let names = request.tag_names().map(str::to_string).collect();
        let addresses: Vec<String> = request
            .items()
            .iter()
            .map(|(_, tag)| tag.address().to_string())
            .collect();
        self.enter(names, &addresses).await?;

        let memory = self.memory.lock();
        let mut response = TagResponse::with_capacity(request.len());
        for (name, tag) in request.items() {
            let item = match (self.code_for(tag.address()), memory.get(tag.address())) {
                (PlcResponseCode::Ok, Some(value)) => ResponseItem::ok(value.clone()),
                (PlcResponseCode::Ok, None) => ResponseItem::error(PlcResponseCode::NotFound),
                (code, _) => ResponseItem::error(code),
            };
            response.insert(name.clone(), item);
        }
        Ok(response)
    }

    async fn write(&self, request: WriteRequest) -> PlcResult<WriteResponse> {
        let names = request.tag_names().map(str::to_string).collect();
        let addresses: Vec<String> = request
            .items()
            .iter()
            .map(|(_, item)| item.tag.address().to_string())
            .collect();
        self.enter(names, &addresses).await?;

        let mut memory = self.memory.lock();
        let mut response = TagResponse::with_capacity(request.len());
        for (name, item) in request.items() {
            let code = self.code_for(item.tag.address());
            if code.is_ok() {
                memory.insert(item.tag.address().to_string(), item.value.clone());
                response.insert(name.clone(), ResponseItem::ok(()));
            } else {
                response.insert(name.clone(), ResponseItem::error(code));
            }
        }
        Ok(response)
    }

    async fn subscribe(&self, request: SubscriptionRequest) -> PlcResult<SubscriptionResponse> {
        let names = request.tag_names().map(str::to_string).collect();
        let addresses: Vec<String> = request
            .items()
            .iter()
            .map(|(_, item)| item.tag.address().to_string())
            .collect();
        self.enter(names, &addresses).await?;

        let ctx = self
            .ctx
            .lock()
            .clone()
            .ok_or_else(|| PlcError::NotConnected("mock".to_string()))?;
        let mut response = TagResponse::with_capacity(request.len());
        for (name, item) in request.items() {
            let handle = SubscriptionHandle {
                id: ctx.subscriptions().next_handle_id(),
                tag_name: name.clone(),
                tag: item.tag.clone(),
            };
            response.insert(name.clone(), ResponseItem::ok(handle));
        }
        Ok(response)
    }

    async fn unsubscribe(
        &self,
        request: UnsubscriptionRequest,
    ) -> PlcResult<UnsubscriptionResponse> {
        let names = request.tag_names().map(str::to_string).collect();
        let addresses: Vec<String> = request
            .items()
            .iter()
            .map(|(_, handle)| handle.tag.address().to_string())
            .collect();
        self.enter(names, &addresses).await?;

        let mut response = TagResponse::with_capacity(request.len());
        for name in request.tag_names() {
            response.insert(name, ResponseItem::ok(()));
        }
        Ok(response)
    }
}

/// Connected connection over `driver` using `optimizer`
pub async fn connected(
    driver: Arc<MockDriver>,
    optimizer: Arc<dyn RequestOptimizer>,
) -> Arc<PlcConnection> {
    let connection = PlcConnection::new("mock://plc", driver).with_optimizer(optimizer);
    connection.connect().await.unwrap();
    Arc::new(connection)
}

/// Factory that builds a fresh `MockDriver` per connect cycle and remembers it
#[derive(Clone, Default)]
pub struct CountingFactory {
    pub created: Arc<AtomicUsize>,
    pub drivers: Arc<Mutex<Vec<Arc<MockDriver>>>>,
    pub fail_connect: Arc<AtomicBool>,
    pub delay: Arc<Mutex<Duration>>,
    pub connect_delay: Arc<Mutex<Duration>>,
    pub optimizer: Arc<Mutex<Option<Arc<dyn RequestOptimizer>>>>,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_driver(&self) -> Arc<MockDriver> {
        self.drivers.lock().last().cloned().expect("no driver created yet")
    }

    pub fn create(&self, key: &ConnectionKey) -> PlcResult<PlcConnection> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let driver = MockDriver::new();
        driver.set_fail_connect(self.fail_connect.load(Ordering::SeqCst));
        driver.set_delay(*self.delay.lock());
        driver.set_connect_delay(*self.connect_delay.lock());
        driver.set_value("%MW0", 42);
        driver.set_value("%MW2", 7);
        self.drivers.lock().push(driver.clone());
        let connection = PlcConnection::new(key.url.clone(), driver);
        Ok(match self.optimizer.lock().clone() {
            Some(optimizer) => connection.with_optimizer(optimizer),
            None => connection,
        })
    }

    /// Connections created from now on plan requests with `optimizer`
    pub fn use_optimizer(&self, optimizer: Arc<dyn RequestOptimizer>) {
        *self.optimizer.lock() = Some(optimizer);
    }

    pub fn as_factory(&self) -> ConnectionFactory {
        let this = self.clone();
        Arc::new(move |key: &ConnectionKey| this.create(key))
    }
}

/// Cache config with short real-time limits
pub fn fast_cache_config() -> CacheConfig {
    CacheConfig {
        max_lease_time_ms: 150,
        max_wait_time_ms: None,
        max_idle_time_ms: None,
        watchdog_interval_ms: 20,
        request_timeout_ms: 1000,
    }
}
