//! Logical responses: tag name to (response code, value)

use errors::{PlcError, PlcResult};
use serde::Serialize;

use crate::model::{PlcResponseCode, PlcValue, SubscriptionHandle};

static NULL_VALUE: PlcValue = PlcValue::Null;

/// Outcome for one tag
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseItem<V> {
    pub code: PlcResponseCode,
    pub value: Option<V>,
}

impl<V> ResponseItem<V> {
    pub fn ok(value: V) -> Self {
        Self {
            code: PlcResponseCode::Ok,
            value: Some(value),
        }
    }

    /// A failed tag never carries a value
    pub fn error(code: PlcResponseCode) -> Self {
        Self { code, value: None }
    }
}

/// Ordered tag-name keyed response
///
/// Order follows the originating request; lookups are by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagResponse<V> {
    items: Vec<(String, ResponseItem<V>)>,
}

pub type ReadResponse = TagResponse<PlcValue>;
pub type WriteResponse = TagResponse<()>;
pub type SubscriptionResponse = TagResponse<SubscriptionHandle>;
pub type UnsubscriptionResponse = TagResponse<()>;

impl<V> Default for TagResponse<V> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<V> TagResponse<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Later entries for the same name replace earlier ones
    pub fn insert(&mut self, name: impl Into<String>, item: ResponseItem<V>) {
        let name = name.into();
        match self.items.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = item,
            None => self.items.push((name, item)),
        }
    }

    /// Append without checking for an existing entry; `name` must be new
    pub(crate) fn push_unique(&mut self, name: String, item: ResponseItem<V>) {
        self.items.push((name, item));
    }

    pub fn with(mut self, name: impl Into<String>, item: ResponseItem<V>) -> Self {
        self.insert(name, item);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(name, _)| name.as_str())
    }

    pub fn items(&self) -> &[(String, ResponseItem<V>)] {
        &self.items
    }

    pub fn into_items(self) -> Vec<(String, ResponseItem<V>)> {
        self.items
    }

    pub fn get(&self, name: &str) -> Option<&ResponseItem<V>> {
        self.items.iter().find(|(n, _)| n == name).map(|(_, item)| item)
    }

    pub fn response_code(&self, name: &str) -> PlcResult<PlcResponseCode> {
        self.get(name)
            .map(|item| item.code)
            .ok_or_else(|| PlcError::TagNotFound(name.to_string()))
    }

    /// True when every tag answered OK
    pub fn all_ok(&self) -> bool {
        self.items.iter().all(|(_, item)| item.code.is_ok())
    }
}

impl TagResponse<PlcValue> {
    /// Value of a tag; a tag that failed reads as `Null`
    pub fn value(&self, name: &str) -> PlcResult<&PlcValue> {
        let item = self
            .get(name)
            .ok_or_else(|| PlcError::TagNotFound(name.to_string()))?;
        Ok(item.value.as_ref().unwrap_or(&NULL_VALUE))
    }

    pub fn get_bool(&self, name: &str) -> PlcResult<bool> {
        self.value(name)?.as_bool()
    }

    pub fn get_i64(&self, name: &str) -> PlcResult<i64> {
        self.value(name)?.as_i64()
    }

    pub fn get_f64(&self, name: &str) -> PlcResult<f64> {
        self.value(name)?.as_f64()
    }

    pub fn get_string(&self, name: &str) -> PlcResult<String> {
        self.value(name)?.as_str().map(str::to_string)
    }
}

impl TagResponse<SubscriptionHandle> {
    pub fn handle(&self, name: &str) -> Option<&SubscriptionHandle> {
        self.get(name).and_then(|item| item.value.as_ref())
    }

    /// Handles of every tag that subscribed successfully
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        self.items
            .iter()
            .filter(|(_, item)| item.code.is_ok())
            .filter_map(|(_, item)| item.value.clone())
            .collect()
    }
}
