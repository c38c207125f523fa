//! Request lifecycle core for PLC drivers
//!
//! Turns stateful, asynchronous device protocols into uniform
//! read/write/subscribe operations:
//!
//! - [`transaction`] bounds in-flight requests per connection
//! - [`optimizer`] splits multi-tag requests and merges the answers
//! - [`cache`] keeps one exclusively borrowed connection per device
//! - [`pool`] maps connection URLs to caches
//!
//! Protocol drivers plug in through [`driver::ProtocolDriver`].

pub mod cache;
pub mod config;
pub mod connection;
pub mod driver;
pub mod model;
pub mod optimizer;
pub mod pool;
pub mod request;
pub mod response;
pub mod transaction;

pub use cache::{CacheEvent, CacheState, CacheStats, CachedConnection, ConnectionCache};
pub use config::{CacheConfig, PlcCoreConfig, TransactionConfig};
pub use connection::{ConnectionFactory, ConnectionKey, PlcConnection};
pub use driver::{DriverContext, ProtocolDriver, SubscriptionEvent, SubscriptionRegistry};
pub use errors::{PlcError, PlcResult};
pub use model::{
    PlcAuthentication, PlcResponseCode, PlcTag, PlcValue, RequestKind, SubscriptionHandle,
    SubscriptionType,
};
pub use optimizer::{NoOpOptimizer, RequestOptimizer, SingleTagOptimizer, SplitPlan};
pub use pool::{ConnectionPool, PoolKey, PoolKeyFactory, PoolStats};
pub use request::{RequestExecutor, TagRequest};
pub use response::{ReadResponse, TagResponse};
pub use transaction::{RequestTransaction, RequestTransactionManager, TransactionHandle};
