//! Process-wide map from connection key to connection cache
//!
//! Entries are created on first use and live as long as the pool. Which part
//! of a URL identifies a device is protocol specific, so the pool key is
//! derived by a [`PoolKeyFactory`] chosen by URL scheme.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use errors::{PlcError, PlcResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{
    CacheEvent, CacheEventHook, CacheState, CacheStats, CachedConnection, ConnectionCache,
};
use crate::config::CacheConfig;
use crate::connection::{ConnectionFactory, ConnectionKey, PlcConnection};
use crate::model::PlcAuthentication;

// ============================================================================
// Pool keys
// ============================================================================

/// Identity of a pool entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    /// The part of the URL that identifies the device
    pub poolable: String,
    pub auth: Option<PlcAuthentication>,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.auth {
            Some(auth) => write!(f, "{}@{}", auth.username, self.poolable),
            None => write!(f, "{}", self.poolable),
        }
    }
}

/// Derives the pool key for a connection key
pub trait PoolKeyFactory: Send + Sync + fmt::Debug {
    fn pool_key(&self, key: &ConnectionKey) -> PoolKey;
}

/// The whole URL is the key
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeUrlKeyFactory;

impl PoolKeyFactory for WholeUrlKeyFactory {
    fn pool_key(&self, key: &ConnectionKey) -> PoolKey {
        PoolKey {
            poolable: key.url.clone(),
            auth: key.auth.clone(),
        }
    }
}

/// Ignores the query string, for protocols whose URL parameters only tune a
/// session (`s7://10.0.0.1?remote-rack=0`)
#[derive(Debug, Clone, Copy, Default)]
pub struct StripQueryKeyFactory;

impl PoolKeyFactory for StripQueryKeyFactory {
    fn pool_key(&self, key: &ConnectionKey) -> PoolKey {
        let poolable = key
            .url
            .split_once('?')
            .map_or(key.url.as_str(), |(base, _)| base)
            .trim_end_matches('/')
            .to_string();
        PoolKey {
            poolable,
            auth: key.auth.clone(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of the whole pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub caches: usize,
    pub borrowed: usize,
    pub available: usize,
    pub disconnected: usize,
    pub entries: Vec<CacheStats>,
}

impl PoolStats {
    pub fn to_json(&self) -> PlcResult<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| PlcError::Internal(format!("failed to serialize pool stats: {}", e)))
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Keyed collection of connection caches
pub struct ConnectionPool {
    caches: DashMap<PoolKey, Arc<ConnectionCache>>,
    factory: ConnectionFactory,
    config: CacheConfig,
    key_factories: HashMap<String, Arc<dyn PoolKeyFactory>>,
    default_key_factory: Arc<dyn PoolKeyFactory>,
    metrics_hook: Option<CacheEventHook>,
    closed: AtomicBool,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("caches", &self.caches.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionPool {
    pub fn builder() -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::new()
    }

    /// Pool with the default whole-URL key for every scheme
    pub fn new<F>(factory: F, config: CacheConfig) -> Self
    where
        F: Fn(&ConnectionKey) -> PlcResult<PlcConnection> + Send + Sync + 'static,
    {
        Self {
            caches: DashMap::new(),
            factory: Arc::new(factory),
            config,
            key_factories: HashMap::new(),
            default_key_factory: Arc::new(WholeUrlKeyFactory),
            metrics_hook: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool_key(&self, key: &ConnectionKey) -> PoolKey {
        let factory = key
            .scheme()
            .and_then(|scheme| self.key_factories.get(&scheme))
            .unwrap_or(&self.default_key_factory);
        factory.pool_key(key)
    }

    fn cache_for(&self, key: ConnectionKey) -> Arc<ConnectionCache> {
        let pool_key = self.pool_key(&key);
        self.caches
            .entry(pool_key)
            .or_insert_with(|| {
                debug!(key = %key, "Creating connection cache");
                Arc::new(ConnectionCache::with_metrics_hook(
                    key,
                    self.factory.clone(),
                    self.config.clone(),
                    self.metrics_hook.clone(),
                ))
            })
            .clone()
    }

    fn existing(&self, url: &str, auth: Option<PlcAuthentication>) -> Option<Arc<ConnectionCache>> {
        let key = ConnectionKey {
            url: url.to_string(),
            auth,
        };
        self.caches
            .get(&self.pool_key(&key))
            .map(|entry| entry.value().clone())
    }

    /// Borrow the connection for `url`, creating its cache on first use
    pub async fn get_connection(
        &self,
        url: &str,
        auth: Option<PlcAuthentication>,
    ) -> PlcResult<CachedConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PlcError::CacheClosed {
                key: url.to_string(),
            });
        }
        let cache = self.cache_for(ConnectionKey {
            url: url.to_string(),
            auth,
        });

        // Lost a race with close(): make sure the late entry is closed too
        if self.closed.load(Ordering::Acquire) {
            cache.close().await?;
            return Err(PlcError::CacheClosed {
                key: url.to_string(),
            });
        }

        cache.get_connection().await
    }

    /// State of the cache for `url`, if one exists
    pub fn state(&self, url: &str, auth: Option<PlcAuthentication>) -> Option<CacheState> {
        self.existing(url, auth).map(|cache| cache.state())
    }

    /// Force the next borrow of `url` to reconnect; false if unknown
    pub fn trigger_reconnect(&self, url: &str, auth: Option<PlcAuthentication>) -> bool {
        match self.existing(url, auth) {
            Some(cache) => {
                info!(url, "Manual reconnect requested");
                cache.trigger_reconnect();
                true
            },
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for entry in self.caches.iter() {
            let cache_stats = entry.value().stats();
            match cache_stats.state {
                CacheState::Borrowed => stats.borrowed += 1,
                CacheState::Available => stats.available += 1,
                _ => stats.disconnected += 1,
            }
            stats.entries.push(cache_stats);
        }
        stats.caches = stats.entries.len();
        stats.entries.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Close every cache; later borrows fail with `CacheClosed`
    pub async fn close(&self) -> PlcResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let caches: Vec<Arc<ConnectionCache>> =
            self.caches.iter().map(|e| e.value().clone()).collect();
        let mut first_error = None;
        for cache in caches {
            if let Err(e) = cache.close().await {
                warn!(key = %cache.key(), "Error closing connection cache: {}", e);
                first_error.get_or_insert(e);
            }
        }
        info!("Connection pool closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct ConnectionPoolBuilder {
    factory: Option<ConnectionFactory>,
    config: CacheConfig,
    key_factories: HashMap<String, Arc<dyn PoolKeyFactory>>,
    metrics_hook: Option<CacheEventHook>,
}

impl Default for ConnectionPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPoolBuilder {
    pub fn new() -> Self {
        Self {
            factory: None,
            config: CacheConfig::default(),
            key_factories: HashMap::new(),
            metrics_hook: None,
        }
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ConnectionKey) -> PlcResult<PlcConnection> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `factory` for URLs with this scheme
    pub fn key_factory(mut self, scheme: &str, factory: impl PoolKeyFactory + 'static) -> Self {
        self.key_factories
            .insert(scheme.to_ascii_lowercase(), Arc::new(factory));
        self
    }

    pub fn metrics_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(CacheEvent) + Send + Sync + 'static,
    {
        self.metrics_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> PlcResult<ConnectionPool> {
        let factory = self.factory.ok_or_else(|| {
            PlcError::Configuration("connection pool needs a connection factory".to_string())
        })?;
        Ok(ConnectionPool {
            caches: DashMap::new(),
            factory,
            config: self.config,
            key_factories: self.key_factories,
            default_key_factory: Arc::new(WholeUrlKeyFactory),
            metrics_hook: self.metrics_hook,
            closed: AtomicBool::new(false),
        })
    }
}
