//! Request optimizer: split a logical request, run the parts, merge the results
//!
//! A [`RequestOptimizer`] only decides how to partition a request. The
//! orchestration is shared: the parts run concurrently, each failure is
//! confined to the tags of its own part, and the merged response always lists
//! every tag of the original request in request order.

pub mod staged;

use std::collections::HashMap;
use std::fmt;

use errors::{PlcError, PlcResult};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{
    PlcResponseCode, PlcTag, RequestKind, SubscriptionHandle, SubscriptionTag, WriteItem,
};
use crate::request::{RequestExecutor, RequestOperation, TagRequest};
use crate::response::{
    ReadResponse, ResponseItem, SubscriptionResponse, TagResponse, UnsubscriptionResponse,
    WriteResponse,
};

pub use staged::{
    Ensemble, Fragment, MaxTagsPerRequest, OptimizerCondition, SplitByAddressArea, StagedOptimizer,
};

/// How a request is to be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitPlan {
    /// Send the original request as is
    Unchanged,
    /// Send one sub-request per group of item indices
    Split(Vec<Vec<usize>>),
}

/// Partitioning strategy for one protocol
pub trait RequestOptimizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Decide how to partition a request given its `(name, tag)` pairs
    fn plan(&self, kind: RequestKind, tags: &[(&str, &PlcTag)]) -> SplitPlan;
}

/// Leaves every request untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpOptimizer;

impl RequestOptimizer for NoOpOptimizer {
    fn name(&self) -> &str {
        "no-op"
    }

    fn plan(&self, _kind: RequestKind, _tags: &[(&str, &PlcTag)]) -> SplitPlan {
        SplitPlan::Unchanged
    }
}

/// One sub-request per tag, for devices that only answer single-item requests
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTagOptimizer;

impl RequestOptimizer for SingleTagOptimizer {
    fn name(&self) -> &str {
        "single-tag"
    }

    fn plan(&self, _kind: RequestKind, tags: &[(&str, &PlcTag)]) -> SplitPlan {
        if tags.len() > 1 {
            SplitPlan::Split((0..tags.len()).map(|i| vec![i]).collect())
        } else {
            SplitPlan::Unchanged
        }
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// Plan, dispatch and merge one request of any kind
///
/// Fails only when the request as a whole cannot complete: an unsplit request
/// whose executor fails, or a cancellation through `cancel`.
pub async fn optimized<T: RequestOperation>(
    optimizer: &dyn RequestOptimizer,
    request: TagRequest<T>,
    executor: &dyn RequestExecutor,
    cancel: Option<&CancellationToken>,
) -> PlcResult<TagResponse<T::Value>> {
    let plan = optimizer.plan(T::KIND, &request.tags());

    let groups = match plan {
        SplitPlan::Unchanged => {
            return with_cancel(T::execute(executor, request), cancel, T::KIND).await?;
        },
        SplitPlan::Split(groups) => groups,
    };

    let sub_requests: Vec<TagRequest<T>> = groups
        .iter()
        .map(|group| request.subset(group))
        .filter(|sub| !sub.is_empty())
        .collect();

    if sub_requests.is_empty() {
        debug!(kind = %T::KIND, optimizer = optimizer.name(), "Request decomposed into nothing");
        return Ok(TagResponse::new());
    }

    debug!(
        kind = %T::KIND,
        optimizer = optimizer.name(),
        tags = request.len(),
        parts = sub_requests.len(),
        "Dispatching split request"
    );

    let (parts, futures): (Vec<_>, Vec<_>) = sub_requests
        .into_iter()
        .map(|sub| {
            let names: Vec<String> = sub.tag_names().map(str::to_string).collect();
            (names, T::execute(executor, sub))
        })
        .unzip();

    let results = with_cancel(join_all(futures), cancel, T::KIND).await?;
    Ok(process_responses(&request, parts.into_iter().zip(results).collect()))
}

async fn with_cancel<F: std::future::Future>(
    fut: F,
    cancel: Option<&CancellationToken>,
    kind: RequestKind,
) -> PlcResult<F::Output> {
    match cancel {
        None => Ok(fut.await),
        Some(token) => tokio::select! {
            output = fut => Ok(output),
            _ = token.cancelled() => {
                debug!(%kind, "Request cancelled, outstanding sub-requests dropped");
                Err(PlcError::Cancelled(format!("{} request cancelled", kind)))
            },
        },
    }
}

/// Merge sub-responses into one response in original request order
///
/// `parts` pairs the tag names each sub-request carried with its outcome. Tags
/// of a failed part, and tags no part answered for, become `INTERNAL_ERROR`
/// without a value.
pub fn process_responses<T: RequestOperation>(
    request: &TagRequest<T>,
    parts: Vec<(Vec<String>, PlcResult<TagResponse<T::Value>>)>,
) -> TagResponse<T::Value> {
    let mut merged: HashMap<String, ResponseItem<T::Value>> =
        HashMap::with_capacity(request.len());

    for (names, outcome) in parts {
        match outcome {
            Ok(response) => {
                for (name, item) in response.into_items() {
                    merged.insert(name, item);
                }
            },
            Err(e) => {
                warn!(tags = ?names, "Sub-request failed: {}", e);
                for name in names {
                    merged.insert(name, ResponseItem::error(PlcResponseCode::InternalError));
                }
            },
        }
    }

    // Request names are unique, so items are appended without a lookup
    let mut response = TagResponse::with_capacity(request.len());
    for name in request.tag_names() {
        let item = merged.remove(name).unwrap_or_else(|| {
            debug!(tag = name, "No sub-response carried tag");
            ResponseItem::error(PlcResponseCode::InternalError)
        });
        response.push_unique(name.to_string(), item);
    }
    response
}

pub async fn optimized_read(
    optimizer: &dyn RequestOptimizer,
    request: TagRequest<PlcTag>,
    executor: &dyn RequestExecutor,
    cancel: Option<&CancellationToken>,
) -> PlcResult<ReadResponse> {
    optimized(optimizer, request, executor, cancel).await
}

pub async fn optimized_write(
    optimizer: &dyn RequestOptimizer,
    request: TagRequest<WriteItem>,
    executor: &dyn RequestExecutor,
    cancel: Option<&CancellationToken>,
) -> PlcResult<WriteResponse> {
    optimized(optimizer, request, executor, cancel).await
}

pub async fn optimized_subscribe(
    optimizer: &dyn RequestOptimizer,
    request: TagRequest<SubscriptionTag>,
    executor: &dyn RequestExecutor,
    cancel: Option<&CancellationToken>,
) -> PlcResult<SubscriptionResponse> {
    optimized(optimizer, request, executor, cancel).await
}

pub async fn optimized_unsubscribe(
    optimizer: &dyn RequestOptimizer,
    request: TagRequest<SubscriptionHandle>,
    executor: &dyn RequestExecutor,
    cancel: Option<&CancellationToken>,
) -> PlcResult<UnsubscriptionResponse> {
    optimized(optimizer, request, executor, cancel).await
}
