//! Physical connection: one driver behind a transaction manager and an optimizer

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use errors::PlcResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TransactionConfig;
use crate::driver::{DriverContext, ProtocolDriver, SubscriptionEvent, SubscriptionRegistry};
use crate::model::{PlcAuthentication, PlcTag, SubscriptionHandle};
use crate::optimizer::{
    optimized_read, optimized_subscribe, optimized_unsubscribe, optimized_write, NoOpOptimizer,
    RequestOptimizer,
};
use crate::request::{
    ReadRequest, ReadRequestBuilder, RequestBuilder, RequestExecutor, SubscriptionRequest,
    SubscriptionRequestBuilder, UnsubscriptionRequest, UnsubscriptionRequestBuilder, WriteRequest,
    WriteRequestBuilder,
};
use crate::response::{ReadResponse, SubscriptionResponse, UnsubscriptionResponse, WriteResponse};
use crate::transaction::{RequestTransactionManager, TransactionStats};

/// What an application asks the pool for: a URL and optional credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub url: String,
    pub auth: Option<PlcAuthentication>,
}

impl ConnectionKey {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: PlcAuthentication) -> Self {
        self.auth = Some(auth);
        self
    }

    /// URL scheme (`s7` in `s7://10.0.0.1`), lowercased
    pub fn scheme(&self) -> Option<String> {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.auth {
            Some(auth) => write!(f, "{}@{}", auth.username, self.url),
            None => write!(f, "{}", self.url),
        }
    }
}

/// Creates a not-yet-connected connection for a key
pub type ConnectionFactory = Arc<dyn Fn(&ConnectionKey) -> PlcResult<PlcConnection> + Send + Sync>;

/// Runs each request on the driver inside one transaction slot
///
/// A split request turns sub-request failures into per-tag error codes, so
/// transport failures are also remembered in `broken` for the lease holder.
struct TransactionalDriver {
    driver: Arc<dyn ProtocolDriver>,
    transactions: RequestTransactionManager,
    broken: Mutex<Option<String>>,
}

impl TransactionalDriver {
    fn observe<T>(&self, result: PlcResult<T>) -> PlcResult<T> {
        if let Err(e) = &result {
            if e.breaks_connection() {
                warn!(protocol = self.driver.protocol(), "Request broke the connection: {}", e);
                *self.broken.lock() = Some(e.to_string());
            }
        }
        result
    }
}

#[async_trait]
impl RequestExecutor for TransactionalDriver {
    fn parse_tag(&self, address: &str) -> PlcResult<PlcTag> {
        self.driver.parse_tag(address)
    }

    async fn execute_read(&self, request: ReadRequest) -> PlcResult<ReadResponse> {
        let driver = self.driver.clone();
        let result = self
            .transactions
            .execute(move || async move { driver.read(request).await })
            .await;
        self.observe(result)
    }

    async fn execute_write(&self, request: WriteRequest) -> PlcResult<WriteResponse> {
        let driver = self.driver.clone();
        let result = self
            .transactions
            .execute(move || async move { driver.write(request).await })
            .await;
        self.observe(result)
    }

    async fn execute_subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> PlcResult<SubscriptionResponse> {
        let driver = self.driver.clone();
        let result = self
            .transactions
            .execute(move || async move { driver.subscribe(request).await })
            .await;
        self.observe(result)
    }

    async fn execute_unsubscribe(
        &self,
        request: UnsubscriptionRequest,
    ) -> PlcResult<UnsubscriptionResponse> {
        let driver = self.driver.clone();
        let result = self
            .transactions
            .execute(move || async move { driver.unsubscribe(request).await })
            .await;
        self.observe(result)
    }
}

/// A driver instance together with its request pipeline
///
/// Requests executed through the connection are planned by its optimizer, and
/// every resulting sub-request takes a transaction slot before it reaches the
/// driver.
pub struct PlcConnection {
    url: String,
    dispatcher: TransactionalDriver,
    optimizer: Arc<dyn RequestOptimizer>,
    subscriptions: SubscriptionRegistry,
}

impl fmt::Debug for PlcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlcConnection")
            .field("url", &self.url)
            .field("protocol", &self.dispatcher.driver.protocol())
            .field("optimizer", &self.optimizer.name())
            .finish()
    }
}

impl PlcConnection {
    pub fn new(url: impl Into<String>, driver: Arc<dyn ProtocolDriver>) -> Self {
        Self {
            url: url.into(),
            dispatcher: TransactionalDriver {
                driver,
                transactions: RequestTransactionManager::default(),
                broken: Mutex::new(None),
            },
            optimizer: Arc::new(NoOpOptimizer),
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn RequestOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_transaction_config(mut self, config: &TransactionConfig) -> Self {
        self.dispatcher.transactions = RequestTransactionManager::from_config(config);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> &str {
        self.dispatcher.driver.protocol()
    }

    pub fn optimizer(&self) -> &Arc<dyn RequestOptimizer> {
        &self.optimizer
    }

    pub fn transactions(&self) -> &RequestTransactionManager {
        &self.dispatcher.transactions
    }

    pub fn transaction_stats(&self) -> TransactionStats {
        self.dispatcher.transactions.stats()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Reason of the last transport failure seen by any request, cleared on read
    pub fn take_broken(&self) -> Option<String> {
        self.dispatcher.broken.lock().take()
    }

    /// Connect the driver, then adopt the concurrency it negotiated
    pub async fn connect(&self) -> PlcResult<()> {
        self.dispatcher.broken.lock().take();
        let ctx = DriverContext::new(self.subscriptions.clone());
        self.dispatcher.driver.connect(&ctx).await?;

        if let Some(limit) = self.dispatcher.driver.negotiated_concurrency() {
            debug!(url = %self.url, limit, "Driver negotiated request concurrency");
            self.dispatcher
                .transactions
                .set_number_of_concurrent_requests(limit);
        }
        info!(url = %self.url, protocol = self.protocol(), "PLC connection established");
        Ok(())
    }

    /// Stop accepting work, drop subscribers and close the driver
    pub async fn close(&self) -> PlcResult<()> {
        self.dispatcher.transactions.close();
        self.subscriptions.clear();
        self.dispatcher.driver.close().await?;
        info!(url = %self.url, "PLC connection closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.driver.is_connected()
    }

    /// Receive value changes for subscribed handles
    pub fn register_consumer(
        &self,
        handles: &[SubscriptionHandle],
        buffer: usize,
    ) -> mpsc::Receiver<SubscriptionEvent> {
        self.subscriptions.register(handles, buffer)
    }

    pub fn read_request_builder(self: &Arc<Self>) -> ReadRequestBuilder {
        RequestBuilder::new(self.clone())
    }

    pub fn write_request_builder(self: &Arc<Self>) -> WriteRequestBuilder {
        RequestBuilder::new(self.clone())
    }

    pub fn subscription_request_builder(self: &Arc<Self>) -> SubscriptionRequestBuilder {
        RequestBuilder::new(self.clone())
    }

    pub fn unsubscription_request_builder(self: &Arc<Self>) -> UnsubscriptionRequestBuilder {
        RequestBuilder::new(self.clone())
    }
}

#[async_trait]
impl RequestExecutor for PlcConnection {
    fn parse_tag(&self, address: &str) -> PlcResult<PlcTag> {
        self.dispatcher.parse_tag(address)
    }

    async fn execute_read(&self, request: ReadRequest) -> PlcResult<ReadResponse> {
        optimized_read(self.optimizer.as_ref(), request, &self.dispatcher, None).await
    }

    async fn execute_write(&self, request: WriteRequest) -> PlcResult<WriteResponse> {
        optimized_write(self.optimizer.as_ref(), request, &self.dispatcher, None).await
    }

    async fn execute_subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> PlcResult<SubscriptionResponse> {
        optimized_subscribe(self.optimizer.as_ref(), request, &self.dispatcher, None).await
    }

    async fn execute_unsubscribe(
        &self,
        request: UnsubscriptionRequest,
    ) -> PlcResult<UnsubscriptionResponse> {
        let handles: Vec<SubscriptionHandle> =
            request.items().iter().map(|(_, h)| h.clone()).collect();
        let response =
            optimized_unsubscribe(self.optimizer.as_ref(), request, &self.dispatcher, None).await?;

        let released: Vec<SubscriptionHandle> = handles
            .into_iter()
            .filter(|h| {
                response
                    .get(&h.tag_name)
                    .is_some_and(|item| item.code.is_ok())
            })
            .collect();
        self.subscriptions.unregister(&released);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_scheme_and_display() {
        let key = ConnectionKey::new("S7://10.0.0.1?rack=0")
            .with_auth(PlcAuthentication::new("op", "pw"));
        assert_eq!(key.scheme().as_deref(), Some("s7"));
        assert_eq!(key.to_string(), "op@S7://10.0.0.1?rack=0");
        assert_eq!(ConnectionKey::new("no-scheme").scheme(), None);
    }
}
