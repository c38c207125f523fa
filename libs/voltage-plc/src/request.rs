//! Logical requests, their builders and the executor seam
//!
//! A request is an ordered list of uniquely named items. The four request kinds
//! share one container, [`TagRequest`], parameterised by item type; the
//! [`RequestOperation`] trait ties each item type to its response value and to
//! the matching [`RequestExecutor`] method, so the optimizer can be written once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::{PlcError, PlcResult};
use futures::future::BoxFuture;

use crate::model::{
    PlcTag, PlcValue, RequestItem, RequestKind, SubscriptionHandle, SubscriptionTag,
    SubscriptionType, WriteItem,
};
use crate::response::{
    ReadResponse, SubscriptionResponse, TagResponse, UnsubscriptionResponse, WriteResponse,
};

// ============================================================================
// Request container
// ============================================================================

/// Ordered, name-unique set of request items
#[derive(Debug, Clone, PartialEq)]
pub struct TagRequest<T> {
    items: Vec<(String, T)>,
}

pub type ReadRequest = TagRequest<PlcTag>;
pub type WriteRequest = TagRequest<WriteItem>;
pub type SubscriptionRequest = TagRequest<SubscriptionTag>;
pub type UnsubscriptionRequest = TagRequest<SubscriptionHandle>;

impl<T> Default for TagRequest<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: RequestItem> TagRequest<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<(String, T)>) -> PlcResult<Self> {
        let mut seen = HashSet::with_capacity(items.len());
        for (name, _) in &items {
            if !seen.insert(name.as_str()) {
                return Err(PlcError::DuplicateTag(name.clone()));
            }
        }
        Ok(Self { items })
    }

    pub fn push(&mut self, name: impl Into<String>, item: T) -> PlcResult<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(PlcError::DuplicateTag(name));
        }
        self.items.push((name, item));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.items.iter().find(|(n, _)| n == name).map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[(String, T)] {
        &self.items
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(name, _)| name.as_str())
    }

    /// Name and device address of every item, in request order
    pub fn tags(&self) -> Vec<(&str, &PlcTag)> {
        self.items
            .iter()
            .map(|(name, item)| (name.as_str(), item.tag()))
            .collect()
    }

    /// Sub-request made of the items at `indices`, in the given order
    ///
    /// Out-of-range and repeated indices are skipped.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let mut taken = HashSet::with_capacity(indices.len());
        let items = indices
            .iter()
            .filter(|&&i| i < self.items.len() && taken.insert(i))
            .map(|&i| self.items[i].clone())
            .collect();
        Self { items }
    }
}

// ============================================================================
// Executor seam
// ============================================================================

/// Anything able to run the four request kinds
///
/// Implemented by the driver-facing dispatcher, by [`crate::PlcConnection`]
/// (which optimizes first) and by leased connections (which add lease checks and
/// timeouts on top).
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Validate an address string; drivers refine this with their own syntax
    fn parse_tag(&self, address: &str) -> PlcResult<PlcTag> {
        PlcTag::parse(address)
    }

    async fn execute_read(&self, request: ReadRequest) -> PlcResult<ReadResponse>;

    async fn execute_write(&self, request: WriteRequest) -> PlcResult<WriteResponse>;

    async fn execute_subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> PlcResult<SubscriptionResponse>;

    async fn execute_unsubscribe(
        &self,
        request: UnsubscriptionRequest,
    ) -> PlcResult<UnsubscriptionResponse>;
}

/// Binds a request item type to its response value and executor method
pub trait RequestOperation: RequestItem {
    type Value: Clone + std::fmt::Debug + Send + Sync + 'static;

    const KIND: RequestKind;

    fn execute<'a>(
        executor: &'a dyn RequestExecutor,
        request: TagRequest<Self>,
    ) -> BoxFuture<'a, PlcResult<TagResponse<Self::Value>>>;
}

impl RequestOperation for PlcTag {
    type Value = PlcValue;
    const KIND: RequestKind = RequestKind::Read;

    fn execute<'a>(
        executor: &'a dyn RequestExecutor,
        request: ReadRequest,
    ) -> BoxFuture<'a, PlcResult<ReadResponse>> {
        executor.execute_read(request)
    }
}

impl RequestOperation for WriteItem {
    type Value = ();
    const KIND: RequestKind = RequestKind::Write;

    fn execute<'a>(
        executor: &'a dyn RequestExecutor,
        request: WriteRequest,
    ) -> BoxFuture<'a, PlcResult<WriteResponse>> {
        executor.execute_write(request)
    }
}

impl RequestOperation for SubscriptionTag {
    type Value = SubscriptionHandle;
    const KIND: RequestKind = RequestKind::Subscribe;

    fn execute<'a>(
        executor: &'a dyn RequestExecutor,
        request: SubscriptionRequest,
    ) -> BoxFuture<'a, PlcResult<SubscriptionResponse>> {
        executor.execute_subscribe(request)
    }
}

impl RequestOperation for SubscriptionHandle {
    type Value = ();
    const KIND: RequestKind = RequestKind::Unsubscribe;

    fn execute<'a>(
        executor: &'a dyn RequestExecutor,
        request: UnsubscriptionRequest,
    ) -> BoxFuture<'a, PlcResult<UnsubscriptionResponse>> {
        executor.execute_unsubscribe(request)
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Collects named items, deferring the first error to `build()`
pub struct RequestBuilder<T> {
    executor: Arc<dyn RequestExecutor>,
    items: Vec<(String, T)>,
    error: Option<PlcError>,
}

pub type ReadRequestBuilder = RequestBuilder<PlcTag>;
pub type WriteRequestBuilder = RequestBuilder<WriteItem>;
pub type SubscriptionRequestBuilder = RequestBuilder<SubscriptionTag>;
pub type UnsubscriptionRequestBuilder = RequestBuilder<SubscriptionHandle>;

impl<T: RequestOperation> RequestBuilder<T> {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self {
            executor,
            items: Vec::new(),
            error: None,
        }
    }

    fn push_with<F>(mut self, name: &str, address: &str, make: F) -> Self
    where
        F: FnOnce(PlcTag) -> T,
    {
        if self.error.is_some() {
            return self;
        }
        if self.items.iter().any(|(n, _)| n == name) {
            self.error = Some(PlcError::DuplicateTag(name.to_string()));
            return self;
        }
        match self.executor.parse_tag(address) {
            Ok(tag) => self.items.push((name.to_string(), make(tag))),
            Err(e) => self.error = Some(e),
        }
        self
    }

    pub fn build(self) -> PlcResult<PreparedRequest<T>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(PreparedRequest {
            request: TagRequest::from_items(self.items)?,
            executor: self.executor,
        })
    }
}

impl RequestBuilder<PlcTag> {
    pub fn add_tag_address(self, name: &str, address: &str) -> Self {
        self.push_with(name, address, |tag| tag)
    }
}

impl RequestBuilder<WriteItem> {
    pub fn add_tag_address(self, name: &str, address: &str, value: impl Into<PlcValue>) -> Self {
        let value = value.into();
        self.push_with(name, address, |tag| WriteItem { tag, value })
    }

    /// Several values for one address travel as a list
    pub fn add_tag_address_values(self, name: &str, address: &str, values: Vec<PlcValue>) -> Self {
        let value = match values.len() {
            1 => values.into_iter().next().unwrap_or(PlcValue::Null),
            _ => PlcValue::List(values),
        };
        self.push_with(name, address, |tag| WriteItem { tag, value })
    }
}

impl RequestBuilder<SubscriptionTag> {
    pub fn add_tag_address(
        self,
        name: &str,
        address: &str,
        subscription: SubscriptionType,
    ) -> Self {
        self.push_with(name, address, |tag| SubscriptionTag { tag, subscription })
    }

    pub fn add_cyclic_tag_address(self, name: &str, address: &str, interval: Duration) -> Self {
        self.add_tag_address(name, address, SubscriptionType::Cyclic { interval })
    }

    pub fn add_change_of_state_tag_address(self, name: &str, address: &str) -> Self {
        self.add_tag_address(name, address, SubscriptionType::ChangeOfState)
    }

    pub fn add_event_tag_address(self, name: &str, address: &str) -> Self {
        self.add_tag_address(name, address, SubscriptionType::Event)
    }
}

impl RequestBuilder<SubscriptionHandle> {
    pub fn add_handle(mut self, handle: SubscriptionHandle) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.items.iter().any(|(n, _)| *n == handle.tag_name) {
            self.error = Some(PlcError::DuplicateTag(handle.tag_name));
            return self;
        }
        self.items.push((handle.tag_name.clone(), handle));
        self
    }

    pub fn add_handles(self, handles: impl IntoIterator<Item = SubscriptionHandle>) -> Self {
        handles.into_iter().fold(self, |builder, h| builder.add_handle(h))
    }
}

/// A built request bound to the executor that will run it
pub struct PreparedRequest<T> {
    request: TagRequest<T>,
    executor: Arc<dyn RequestExecutor>,
}

impl<T: RequestOperation> PreparedRequest<T> {
    pub fn request(&self) -> &TagRequest<T> {
        &self.request
    }

    /// Run the request; per-tag failures come back as response codes
    pub async fn execute(&self) -> PlcResult<TagResponse<T::Value>> {
        T::execute(self.executor.as_ref(), self.request.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlcResponseCode;
    use crate::response::ResponseItem;

    /// Echoes every read tag's address back as its value
    struct EchoExecutor;

    #[async_trait]
    impl RequestExecutor for EchoExecutor {
        fn parse_tag(&self, address: &str) -> PlcResult<PlcTag> {
            if !address.starts_with('%') {
                return Err(PlcError::InvalidTagAddress {
                    address: address.to_string(),
                    reason: "must start with %".to_string(),
                });
            }
            PlcTag::parse(address)
        }

        async fn execute_read(&self, request: ReadRequest) -> PlcResult<ReadResponse> {
            let mut response = TagResponse::with_capacity(request.len());
            for (name, tag) in request.items() {
                response.insert(name.clone(), ResponseItem::ok(PlcValue::from(tag.address())));
            }
            Ok(response)
        }

        async fn execute_write(&self, request: WriteRequest) -> PlcResult<WriteResponse> {
            let mut response = TagResponse::new();
            for name in request.tag_names() {
                response.insert(name, ResponseItem::ok(()));
            }
            Ok(response)
        }

        async fn execute_subscribe(
            &self,
            _request: SubscriptionRequest,
        ) -> PlcResult<SubscriptionResponse> {
            Err(PlcError::Unsupported("subscribe".to_string()))
        }

        async fn execute_unsubscribe(
            &self,
            _request: UnsubscriptionRequest,
        ) -> PlcResult<UnsubscriptionResponse> {
            Err(PlcError::Unsupported("unsubscribe".to_string()))
        }
    }

    fn executor() -> Arc<dyn RequestExecutor> {
        Arc::new(EchoExecutor)
    }

    #[test]
    fn test_from_items_rejects_duplicates() {
        let tag = PlcTag::parse("%I0.0").unwrap();
        let err = ReadRequest::from_items(vec![
            ("a".to_string(), tag.clone()),
            ("a".to_string(), tag),
        ])
        .unwrap_err();
        assert!(matches!(err, PlcError::DuplicateTag(name) if name == "a"));
    }

    #[test]
    fn test_subset_preserves_given_order() {
        let mut request = ReadRequest::new();
        for (name, address) in [("a", "%A"), ("b", "%B"), ("c", "%C")] {
            request.push(name, PlcTag::parse(address).unwrap()).unwrap();
        }
        let sub = request.subset(&[2, 0, 2, 9]);
        let names: Vec<_> = sub.tag_names().collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn test_builder_defers_errors() {
        let err = ReadRequestBuilder::new(executor())
            .add_tag_address("a", "%MW0")
            .add_tag_address("b", "MW2")
            .add_tag_address("a", "%MW4")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PlcError::InvalidTagAddress { .. }));

        let err = ReadRequestBuilder::new(executor())
            .add_tag_address("a", "%MW0")
            .add_tag_address("a", "%MW4")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PlcError::DuplicateTag(_)));
    }

    #[tokio::test]
    async fn test_prepared_request_executes() {
        let request = ReadRequestBuilder::new(executor())
            .add_tag_address("a", "%MW0")
            .add_tag_address("b", "%MW2")
            .build()
            .unwrap();
        let response = request.execute().await.unwrap();
        assert_eq!(response.get_string("b").unwrap(), "%MW2");

        let write = WriteRequestBuilder::new(executor())
            .add_tag_address("a", "%MW0", 42)
            .add_tag_address_values("b", "%MW2", vec![PlcValue::Int(1), PlcValue::Int(2)])
            .build()
            .unwrap();
        assert_eq!(
            write.request().get("b").unwrap().value,
            PlcValue::List(vec![PlcValue::Int(1), PlcValue::Int(2)])
        );
        let response = write.execute().await.unwrap();
        assert_eq!(response.response_code("a").unwrap(), PlcResponseCode::Ok);
    }
}
