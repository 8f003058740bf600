//! Bus endpoint abstraction.
//!
//! The connectivity code never talks to a bus library directly. It goes
//! through [`Endpoint`], a small capability set (call a method, read or write
//! a property, watch a signal) that a real transport and the
//! [`testing::TestingEndpoint`] double both implement.
//!
//! Signal subscriptions are channels: each payload arrives as a
//! `Vec<BusValue>`, and the channel closing means the subscription died.

pub mod testing;

use crate::cancel::CancellationToken;
use crate::error::{ConnError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// A value carried over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    Bool(bool),
    U32(u32),
    I64(i64),
    Str(String),
    ObjectPath(String),
    Array(Vec<BusValue>),
    Dict(HashMap<String, BusValue>),
}

impl BusValue {
    fn kind(&self) -> &'static str {
        match self {
            BusValue::Bool(_) => "bool",
            BusValue::U32(_) => "u32",
            BusValue::I64(_) => "i64",
            BusValue::Str(_) => "string",
            BusValue::ObjectPath(_) => "object path",
            BusValue::Array(_) => "array",
            BusValue::Dict(_) => "dict",
        }
    }

    fn unexpected(&self, what: &str, expected: &'static str) -> ConnError {
        ConnError::UnexpectedValue {
            what: what.to_string(),
            expected,
            actual: self.kind().to_string(),
        }
    }

    pub fn as_u32(&self, what: &str) -> Result<u32> {
        match self {
            BusValue::U32(v) => Ok(*v),
            other => Err(other.unexpected(what, "u32")),
        }
    }

    pub fn as_object_path(&self, what: &str) -> Result<&str> {
        match self {
            BusValue::ObjectPath(p) => Ok(p),
            other => Err(other.unexpected(what, "object path")),
        }
    }
}

impl From<u32> for BusValue {
    fn from(v: u32) -> Self {
        BusValue::U32(v)
    }
}

impl From<bool> for BusValue {
    fn from(v: bool) -> Self {
        BusValue::Bool(v)
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self {
        BusValue::Str(v.to_string())
    }
}

/// Payload of a `PropertiesChanged` signal, already filtered to the
/// endpoint's interface.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertiesChanged {
    pub changed: HashMap<String, BusValue>,
    pub invalidated: Vec<String>,
}

/// A live subscription.
///
/// Items arrive on `recv()`; `None` means the subscription terminated.
/// Dropping the watch cancels the task feeding it.
pub struct Watch<T> {
    rx: mpsc::Receiver<T>,
    _guard: DropGuard,
}

impl<T> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").finish_non_exhaustive()
    }
}

/// Watch on a plain signal; each item is the signal's argument list.
pub type SignalWatch = Watch<Vec<BusValue>>;

/// Watch on `org.freedesktop.DBus.Properties.PropertiesChanged`.
pub type PropertiesWatch = Watch<PropertiesChanged>;

impl<T> Watch<T> {
    /// Wrap a receiver together with the token its producer listens to.
    pub fn new(rx: mpsc::Receiver<T>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    /// Wait for the next item.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// The connection to a bus service.
#[async_trait]
pub trait Endpoint: fmt::Display + Send + Sync {
    /// (Re)establish the connection.
    async fn dial(&self) -> Result<()>;

    /// Invoke `member` and return its reply values.
    async fn call(&self, member: &str, args: Vec<BusValue>) -> Result<Vec<BusValue>>;

    /// Read a property of the endpoint's interface.
    async fn get_property(&self, property: &str) -> Result<BusValue>;

    /// Write a property on the object at the endpoint path plus `suffix`.
    async fn set_property(&self, property: &str, suffix: &str, value: BusValue) -> Result<()>;

    /// Subscribe to a signal of the endpoint's interface.
    async fn watch_signal(&self, member: &str) -> Result<SignalWatch>;

    /// Subscribe to property changes of the endpoint's interface.
    async fn watch_properties(&self) -> Result<PropertiesWatch>;

    /// Drop the connection. Safe to call repeatedly.
    fn close(&self);
}

/// Shared handle to an endpoint.
pub type DynEndpoint = Arc<dyn Endpoint>;
