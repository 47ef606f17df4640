//! Transport clients
//!
//! A transport is a thin binding over one backend's wire protocol. It knows
//! nothing about Lightning: it moves JSON requests and responses and reports
//! failures as [`TransportError`]. Adapters in [`crate::node`] translate those
//! errors into [`crate::GatewayError`] kinds, so nothing in this module ever
//! crosses the capability interface.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

mod rest;
mod unix;

pub use rest::{RestAuth, RestConnector, RestTransport};
pub use unix::{UnixConnector, UnixRpcTransport};

/// HTTP-style verb of a call. JSON-RPC transports ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Read
    Get,
    /// Create / invoke
    Post,
    /// Remove
    Delete,
}

/// One backend method: a JSON-RPC method name or a REST path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMethod {
    /// Verb used by REST transports
    pub verb: Verb,
    /// Method name (`getinfo`) or path (`v1/getinfo`)
    pub name: String,
    /// Long-poll calls block on the backend and are exempt from the
    /// transport's call timeout
    pub long_poll: bool,
}

impl RpcMethod {
    /// `GET <path>`
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Verb::Get, path)
    }

    /// `POST <path>`
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Verb::Post, path)
    }

    /// `DELETE <path>`
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Verb::Delete, path)
    }

    /// A named JSON-RPC method. REST transports post it to `v1/<name>`.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(Verb::Post, name)
    }

    /// Mark this call as a long poll
    pub fn long_poll(mut self) -> Self {
        self.long_poll = true;
        self
    }

    fn new(verb: Verb, name: impl Into<String>) -> Self {
        Self {
            verb,
            name: name.into(),
            long_poll: false,
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.verb, self.name)
    }
}

/// Transport-native failures
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not open or keep a connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// No response within the call timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Backend answered with an error object
    #[error("backend error {code}: {message}")]
    Rpc {
        /// Backend error code (JSON-RPC code, gRPC code or HTTP status)
        code: i64,
        /// Backend error message
        message: String,
    },

    /// Response could not be parsed
    #[error("malformed response: {0}")]
    Decode(String),

    /// The handle was closed explicitly
    #[error("transport closed")]
    Closed,

    /// The transport cannot perform this kind of call
    #[error("not supported by this transport: {0}")]
    Unsupported(String),
}

/// A stream of JSON messages pushed by the backend
pub type EventStream = BoxStream<'static, Result<Value, TransportError>>;

/// One open handle onto a backend
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Perform one request/response call
    async fn call(&self, method: &RpcMethod, params: Value) -> Result<Value, TransportError>;

    /// Open a server-push stream
    async fn subscribe(
        &self,
        method: &RpcMethod,
        _params: Value,
    ) -> Result<EventStream, TransportError> {
        Err(TransportError::Unsupported(method.to_string()))
    }

    /// Release server-side resources held by this handle
    async fn close(&self) {}

    /// Human readable endpoint, for logs
    fn describe(&self) -> String;
}

/// Opens fresh transport handles
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new handle. Never reuses a previous one.
    async fn connect(&self) -> Result<Arc<dyn RpcTransport>, TransportError>;

    /// Human readable endpoint, for logs
    fn describe(&self) -> String;
}

/// Lazily connected, long-lived handle shared by an adapter's regular calls.
/// Clones share the same live handle.
#[derive(Clone)]
pub struct SharedTransport {
    connector: Arc<dyn Connector>,
    live: Arc<RwLock<Option<Arc<dyn RpcTransport>>>>,
}

impl SharedTransport {
    /// Wrap a connector; nothing is opened until first use
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            live: Arc::new(RwLock::new(None)),
        }
    }

    /// The live handle, connecting on first use
    pub async fn get(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
        if let Some(transport) = self.live.read().await.as_ref() {
            return Ok(transport.clone());
        }

        let mut live = self.live.write().await;
        if let Some(transport) = live.as_ref() {
            return Ok(transport.clone());
        }

        let transport = self.connector.connect().await?;
        debug!("Opened transport to {}", transport.describe());
        *live = Some(transport.clone());
        Ok(transport)
    }

    /// A brand new handle, independent of the live one. The caller owns it
    /// and must close it.
    pub async fn fresh(&self) -> Result<Arc<dyn RpcTransport>, TransportError> {
        self.connector.connect().await
    }

    /// Drop the live handle if it failed at the connection level, so the
    /// next call reconnects
    pub async fn reset_on(&self, err: &TransportError) {
        if matches!(err, TransportError::Connect(_) | TransportError::Closed) {
            if let Some(transport) = self.live.write().await.take() {
                debug!("Discarding broken transport to {}", transport.describe());
                transport.close().await;
            }
        }
    }

    /// Perform a call on the live handle
    pub async fn call(&self, method: &RpcMethod, params: Value) -> Result<Value, TransportError> {
        let transport = self.get().await?;
        let result = transport.call(method, params).await;
        if let Err(e) = &result {
            self.reset_on(e).await;
        }
        result
    }

    /// Open a push stream on the live handle
    pub async fn subscribe(
        &self,
        method: &RpcMethod,
        params: Value,
    ) -> Result<EventStream, TransportError> {
        let transport = self.get().await?;
        let result = transport.subscribe(method, params).await;
        if let Err(e) = &result {
            self.reset_on(e).await;
        }
        result
    }

    /// Endpoint description, for logs
    pub fn describe(&self) -> String {
        self.connector.describe()
    }
}

/// Unwrap a JSON-RPC 2.0 response envelope
pub(crate) fn unwrap_jsonrpc(response: Value) -> Result<Value, TransportError> {
    if let Some(error) = response.get("error") {
        if !error.is_null() {
            return Err(rpc_error(error));
        }
    }
    response
        .get("result")
        .cloned()
        .ok_or_else(|| TransportError::Decode("response has neither result nor error".to_string()))
}

/// Build an [`TransportError::Rpc`] from a `{code, message}` error object
pub(crate) fn rpc_error(error: &Value) -> TransportError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    TransportError::Rpc { code, message }
}
