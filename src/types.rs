//! Type definitions for subscription requests and caller-facing channels

use crate::error::Result;
use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// GraphQL request body carried by a `start`/`subscribe` frame.
///
/// Absent fields are omitted from the wire payload, so a body holding only a
/// query serializes as `{"query":"..."}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphQLBody {
    /// GraphQL query string
    pub query: String,

    /// Variables for the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,

    /// Operation name (optional)
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// Protocol extensions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl GraphQLBody {
    /// Create a body from a bare query string.
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// One logical subscription request from an application caller.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Endpoint URL (`ws://` or `wss://`)
    pub url: String,

    /// Headers forwarded at WebSocket upgrade; part of the connection
    /// fingerprint, so callers with different header sets never share a
    /// socket
    pub headers: HeaderMap,

    /// The subscription operation itself
    pub body: GraphQLBody,
}

impl SubscriptionOptions {
    /// Create options for a URL and body with no extra headers.
    pub fn new(url: impl Into<String>, body: GraphQLBody) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Replace the upgrade headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Caller-owned output channels for one subscriber.
///
/// The client only ever writes: `data` receives the raw payload bytes of each
/// `data`/`next` frame in upstream arrival order, and `errors` (when present)
/// receives the payload of an `error` frame before the subscription ends.
/// Closing and draining are the caller's business.
#[derive(Debug, Clone)]
pub struct SubscriberSink {
    /// Ordered data payload channel
    pub data: mpsc::Sender<Bytes>,

    /// Optional out-of-band channel for per-subscription error payloads
    pub errors: Option<mpsc::Sender<Bytes>>,
}

impl SubscriberSink {
    /// A sink delivering data payloads only.
    pub fn new(data: mpsc::Sender<Bytes>) -> Self {
        Self { data, errors: None }
    }

    /// Attach an out-of-band error channel.
    pub fn with_errors(mut self, errors: mpsc::Sender<Bytes>) -> Self {
        self.errors = Some(errors);
        self
    }
}

impl From<mpsc::Sender<Bytes>> for SubscriberSink {
    fn from(data: mpsc::Sender<Bytes>) -> Self {
        Self::new(data)
    }
}

/// Hook producing the opaque `connection_init` payload for a new connection.
///
/// Invoked once per dialed connection, before the init frame is written. A
/// `None` return emits `{"type":"connection_init"}` with no payload key; a
/// `Some` value is embedded verbatim.
#[async_trait::async_trait]
pub trait InitPayloadProvider: Send + Sync {
    /// Produce the init payload for the given endpoint.
    async fn init_payload(&self, url: &str, headers: &HeaderMap)
        -> Result<Option<serde_json::Value>>;
}

/// Static init payload, for the common token-in-payload setup.
pub struct StaticInitPayload(pub serde_json::Value);

#[async_trait::async_trait]
impl InitPayloadProvider for StaticInitPayload {
    async fn init_payload(
        &self,
        _url: &str,
        _headers: &HeaderMap,
    ) -> Result<Option<serde_json::Value>> {
        Ok(Some(self.0.clone()))
    }
}
