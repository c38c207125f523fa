//! Value, tag and response-code types shared by requests and responses

use std::fmt;
use std::time::Duration;

use errors::{PlcError, PlcResult};
use serde::{Deserialize, Serialize};

// ============================================================================
// Response codes
// ============================================================================

/// Per-tag outcome of a request
///
/// Drivers translate protocol-level failures (NAKs, malformed frames) into one
/// of these before a response ever reaches the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlcResponseCode {
    Ok,
    NotFound,
    AccessDenied,
    InvalidAddress,
    InvalidDatatype,
    InvalidData,
    InternalError,
    RemoteBusy,
    RemoteError,
    Unsupported,
    Timeout,
}

impl PlcResponseCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, PlcResponseCode::Ok)
    }
}

impl fmt::Display for PlcResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlcResponseCode::Ok => "OK",
            PlcResponseCode::NotFound => "NOT_FOUND",
            PlcResponseCode::AccessDenied => "ACCESS_DENIED",
            PlcResponseCode::InvalidAddress => "INVALID_ADDRESS",
            PlcResponseCode::InvalidDatatype => "INVALID_DATATYPE",
            PlcResponseCode::InvalidData => "INVALID_DATA",
            PlcResponseCode::InternalError => "INTERNAL_ERROR",
            PlcResponseCode::RemoteBusy => "REMOTE_BUSY",
            PlcResponseCode::RemoteError => "REMOTE_ERROR",
            PlcResponseCode::Unsupported => "UNSUPPORTED",
            PlcResponseCode::Timeout => "TIMEOUT",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Value read from or written to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PlcValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<PlcValue>),
}

impl PlcValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PlcValue::Null => "null",
            PlcValue::Bool(_) => "bool",
            PlcValue::Int(_) => "int",
            PlcValue::Float(_) => "float",
            PlcValue::String(_) => "string",
            PlcValue::Bytes(_) => "bytes",
            PlcValue::List(_) => "list",
        }
    }

    fn mismatch(&self, expected: &str) -> PlcError {
        PlcError::TypeMismatch {
            expected: expected.to_string(),
            actual: self.type_name().to_string(),
        }
    }

    pub fn as_bool(&self) -> PlcResult<bool> {
        match self {
            PlcValue::Bool(b) => Ok(*b),
            PlcValue::Int(i) => Ok(*i != 0),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_i64(&self) -> PlcResult<i64> {
        match self {
            PlcValue::Int(i) => Ok(*i),
            PlcValue::Bool(b) => Ok(i64::from(*b)),
            other => Err(other.mismatch("int")),
        }
    }

    /// Integers widen to floats; nothing narrows implicitly
    pub fn as_f64(&self) -> PlcResult<f64> {
        match self {
            PlcValue::Float(f) => Ok(*f),
            PlcValue::Int(i) => Ok(*i as f64),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_str(&self) -> PlcResult<&str> {
        match self {
            PlcValue::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_list(&self) -> PlcResult<&[PlcValue]> {
        match self {
            PlcValue::List(items) => Ok(items),
            other => Err(other.mismatch("list")),
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Null => write!(f, "null"),
            PlcValue::Bool(b) => write!(f, "{}", b),
            PlcValue::Int(i) => write!(f, "{}", i),
            PlcValue::Float(v) => write!(f, "{}", v),
            PlcValue::String(s) => write!(f, "{}", s),
            PlcValue::Bytes(b) => write!(f, "{:02X?}", b),
            PlcValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            },
        }
    }
}

impl From<bool> for PlcValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PlcValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for PlcValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u16> for PlcValue {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for PlcValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PlcValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PlcValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<PlcValue>> for PlcValue {
    fn from(v: Vec<PlcValue>) -> Self {
        Self::List(v)
    }
}

// ============================================================================
// Tags
// ============================================================================

/// A device address, opaque to the core
///
/// Only the driver knows how to interpret the address string; the core merely
/// guarantees it is non-empty and carries it to the driver untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlcTag {
    address: String,
}

impl PlcTag {
    pub fn parse(address: &str) -> PlcResult<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(PlcError::InvalidTagAddress {
                address: address.to_string(),
                reason: "address is empty".to_string(),
            });
        }
        Ok(Self {
            address: trimmed.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for PlcTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// How a subscribed tag reports changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Cyclic { interval: Duration },
    ChangeOfState,
    Event,
}

/// Write-request item: where to write and what
#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub tag: PlcTag,
    pub value: PlcValue,
}

/// Subscription-request item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTag {
    pub tag: PlcTag,
    pub subscription: SubscriptionType,
}

/// Returned by a successful subscription, consumed by unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub tag_name: String,
    pub tag: PlcTag,
}

/// The four request operations every driver understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Read,
    Write,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Read => write!(f, "read"),
            RequestKind::Write => write!(f, "write"),
            RequestKind::Subscribe => write!(f, "subscribe"),
            RequestKind::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// Anything that can sit in a request: every item kind resolves to one tag
pub trait RequestItem: Clone + Send + Sync + 'static {
    fn tag(&self) -> &PlcTag;
}

impl RequestItem for PlcTag {
    fn tag(&self) -> &PlcTag {
        self
    }
}

impl RequestItem for WriteItem {
    fn tag(&self) -> &PlcTag {
        &self.tag
    }
}

impl RequestItem for SubscriptionTag {
    fn tag(&self) -> &PlcTag {
        &self.tag
    }
}

impl RequestItem for SubscriptionHandle {
    fn tag(&self) -> &PlcTag {
        &self.tag
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Username/password credentials, part of the pool key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlcAuthentication {
    pub username: String,
    pub password: String,
}

impl PlcAuthentication {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for PlcAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlcAuthentication")
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .finish()
    }
}
