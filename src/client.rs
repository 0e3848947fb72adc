//! Subscription client façade
//!
//! [`SubscriptionClient`] is the caller-facing entry point: it fingerprints
//! each request, routes it to a shared [`ConnectionHandler`] through the
//! registry (dialing a new upstream only when no live connection matches),
//! and wires the caller's cancellation token to sink detachment. Connections
//! are shared, subscriptions are deduplicated, and the client never
//! reconnects on its own.
//!
//! ```rust,no_run
//! use graphql_ws_mux::{GraphQLBody, SubscriptionClient, SubscriptionOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> graphql_ws_mux::Result<()> {
//! let client = SubscriptionClient::builder().build();
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! let caller = CancellationToken::new();
//!
//! client
//!     .subscribe(
//!         &caller,
//!         SubscriptionOptions::new(
//!             "ws://localhost:4000/graphql",
//!             GraphQLBody::query("subscription { messageAdded { text } }"),
//!         ),
//!         tx,
//!     )
//!     .await?;
//!
//! while let Some(payload) = rx.recv().await {
//!     println!("{}", String::from_utf8_lossy(&payload));
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fingerprint::{ConnectionKey, SubscriptionKey};
use crate::handler::{ConnectionHandler, HandlerStatus, SubscriptionTicket};
use crate::protocol::SubprotocolChoice;
use crate::registry::HandlerRegistry;
use crate::transport::{Dialer, TungsteniteDialer};
use crate::types::{InitPayloadProvider, SubscriberSink, SubscriptionOptions};

/// Tunables for the subscription client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound between socket reads; doubles as the liveness tick
    /// driving grace expiry and keepalive probes (default: 1 second)
    pub read_timeout: Duration,
    /// Deadline for `connection_ack` after dialing (default: 10 seconds)
    pub init_timeout: Duration,
    /// Idle interval before a client `ping` on the modern subprotocol
    /// (default: 30 seconds)
    pub keepalive_interval: Duration,
    /// Linger after the last subscription leaves before the connection
    /// self-terminates, absorbing bursty resubscribes (default: 5 seconds)
    pub idle_grace: Duration,
    /// Bounded wait on a full sink before it is dropped from its fan-out
    /// set (default: 1 second)
    pub sink_send_timeout: Duration,
    /// Subprotocol selection mode (default: auto)
    pub subprotocol: SubprotocolChoice,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            init_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            idle_grace: Duration::from_secs(5),
            sink_send_timeout: Duration::from_secs(1),
            subprotocol: SubprotocolChoice::default(),
        }
    }
}

struct ClientInner {
    config: Arc<ClientConfig>,
    registry: HandlerRegistry,
    dialer: Arc<dyn Dialer>,
    init_payload: Option<Arc<dyn InitPayloadProvider>>,
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Multiplexing GraphQL subscription client.
///
/// Cheap to clone; clones share the registry and shutdown signal.
#[derive(Clone)]
pub struct SubscriptionClient {
    inner: Arc<ClientInner>,
}

impl SubscriptionClient {
    /// Start configuring a client.
    pub fn builder() -> SubscriptionClientBuilder {
        SubscriptionClientBuilder::new()
    }

    /// Register a subscriber.
    ///
    /// Returns once the sink is attached to a handler that completed its
    /// init handshake and the `start`/`subscribe` frame (for a first
    /// subscriber) is on the wire. The upstream execution result is not
    /// awaited. Cancelling `caller` afterwards detaches the sink; the
    /// upstream subscription stops when its last subscriber leaves.
    pub async fn subscribe(
        &self,
        caller: &CancellationToken,
        options: SubscriptionOptions,
        sink: impl Into<SubscriberSink>,
    ) -> Result<()> {
        let sink = sink.into();
        if caller.is_cancelled() {
            return Err(Error::SubscriberCancelled);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ClientShutdown);
        }

        let init_payload = match &self.inner.init_payload {
            Some(provider) => provider.init_payload(&options.url, &options.headers).await?,
            None => None,
        };
        let init_bytes = init_payload
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;
        let connection_key = ConnectionKey::new(
            &options.url,
            &options.headers,
            self.inner.config.subprotocol.fingerprint_label(),
            init_bytes.as_deref(),
        );
        let body_bytes = serde_json::to_vec(&options.body)?;
        let subscription_key = SubscriptionKey::new(&connection_key, &body_bytes);

        // One retry: a handler observed mid-close is released and replaced
        // by a fresh dial.
        for attempt in 0..2 {
            if self.inner.shutdown.is_cancelled() {
                return Err(Error::ClientShutdown);
            }

            let (handler, created) =
                self.inner.registry.acquire_or_create(&connection_key, || {
                    ConnectionHandler::new(
                        connection_key.clone(),
                        self.inner.config.clone(),
                        self.inner.shutdown.child_token(),
                    )
                });
            if created {
                debug!(attempt, "dialing new upstream connection");
                spawn_connection(
                    self.inner.clone(),
                    handler.clone(),
                    options.url.clone(),
                    options.headers.clone(),
                    init_payload.clone(),
                );
            }

            let status = tokio::select! {
                _ = caller.cancelled() => return Err(Error::SubscriberCancelled),
                _ = self.inner.shutdown.cancelled() => return Err(Error::ClientShutdown),
                status = handler.wait_ready() => status,
            };

            match status {
                HandlerStatus::Ready => {
                    match handler
                        .add_subscription(subscription_key.clone(), &options.body, sink.clone())
                        .await
                    {
                        Ok(ticket) => {
                            spawn_cancel_watcher(handler, caller.clone(), ticket);
                            return Ok(());
                        }
                        Err(Error::HandlerClosing) if attempt == 0 => continue,
                        Err(err) => return Err(err),
                    }
                }
                HandlerStatus::Closed | HandlerStatus::Connecting => {
                    if let Some(err) = handler.take_failure() {
                        return Err(err);
                    }
                    if self.inner.shutdown.is_cancelled() {
                        return Err(Error::ClientShutdown);
                    }
                    if created {
                        return Err(Error::Handshake(
                            "connection closed during init".to_string(),
                        ));
                    }
                    if attempt == 0 {
                        continue;
                    }
                    return Err(Error::HandlerClosing);
                }
            }
        }
        Err(Error::HandlerClosing)
    }

    /// Terminate every handler and fail pending subscribes. Idempotent; the
    /// registry drains without waiting on sink consumers.
    pub fn shutdown(&self) {
        debug!(
            active_connections = self.inner.registry.len(),
            "client shutdown requested"
        );
        self.inner.shutdown.cancel();
    }

    /// Whether client-wide shutdown has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of live upstream connections.
    pub fn active_connections(&self) -> usize {
        self.inner.registry.len()
    }
}

/// Dial and serve one connection, then deregister it.
fn spawn_connection(
    inner: Arc<ClientInner>,
    handler: Arc<ConnectionHandler>,
    url: String,
    headers: HeaderMap,
    init_payload: Option<serde_json::Value>,
) {
    tokio::spawn(async move {
        let offered = inner.config.subprotocol.offered();
        let dialed = tokio::select! {
            _ = handler.closed() => Err(Error::ClientShutdown),
            dialed = inner.dialer.dial(&url, &headers, offered) => dialed,
        };
        match dialed {
            Ok(conn) => handler.serve(conn, init_payload).await,
            Err(err) => {
                warn!(url = %url, error = %err, "dial failed");
                handler.record_failure(err);
                handler.teardown().await;
            }
        }
        inner.registry.release(handler.connection_key(), &handler);
        debug!(
            active_connections = inner.registry.len(),
            "connection handler released"
        );
    });
}

/// Detach the caller's sink when its token fires; the watcher dies with the
/// handler otherwise.
fn spawn_cancel_watcher(
    handler: Arc<ConnectionHandler>,
    caller: CancellationToken,
    ticket: SubscriptionTicket,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => {
                handler.remove_sink(ticket.id, ticket.sink_token).await;
            }
            _ = handler.closed() => {}
        }
    });
}

/// Builder for [`SubscriptionClient`].
pub struct SubscriptionClientBuilder {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    init_payload: Option<Arc<dyn InitPayloadProvider>>,
    shutdown: CancellationToken,
}

impl SubscriptionClientBuilder {
    fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            dialer: Arc::new(TungsteniteDialer),
            init_payload: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the upper bound between socket reads.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the `connection_ack` deadline.
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.config.init_timeout = timeout;
        self
    }

    /// Set the idle interval before a keepalive ping.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the linger after the last subscription leaves.
    pub fn idle_grace(mut self, grace: Duration) -> Self {
        self.config.idle_grace = grace;
        self
    }

    /// Set the bounded wait on a full sink.
    pub fn sink_send_timeout(mut self, timeout: Duration) -> Self {
        self.config.sink_send_timeout = timeout;
        self
    }

    /// Set the subprotocol selection mode.
    pub fn subprotocol(mut self, choice: SubprotocolChoice) -> Self {
        self.config.subprotocol = choice;
        self
    }

    /// Replace the transport dialer.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Install the `connection_init` payload hook.
    pub fn init_payload_provider(mut self, provider: Arc<dyn InitPayloadProvider>) -> Self {
        self.init_payload = Some(provider);
        self
    }

    /// Tie the client's lifetime to an external token; cancelling it is
    /// equivalent to [`SubscriptionClient::shutdown`].
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Build the client.
    pub fn build(self) -> SubscriptionClient {
        SubscriptionClient {
            inner: Arc::new(ClientInner {
                config: Arc::new(self.config),
                registry: HandlerRegistry::new(),
                dialer: self.dialer,
                init_payload: self.init_payload,
                shutdown: self.shutdown,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Subprotocol;
    use crate::transport::testing::{pipe, PipeServer};
    use crate::transport::{Connection, Frame};
    use crate::types::GraphQLBody;
    use bytes::Bytes;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Duration};

    /// Dialer that refuses every dial and counts attempts.
    struct RefusingDialer {
        dials: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(
            &self,
            _url: &str,
            _headers: &HeaderMap,
            _subprotocols: &[Subprotocol],
        ) -> Result<Connection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(Error::Dial("connection refused".to_string()))
        }
    }

    /// Dialer handing out pre-built in-memory connections.
    struct PipeDialer {
        prepared: Mutex<Vec<Connection>>,
    }

    #[async_trait::async_trait]
    impl Dialer for PipeDialer {
        async fn dial(
            &self,
            _url: &str,
            _headers: &HeaderMap,
            _subprotocols: &[Subprotocol],
        ) -> Result<Connection> {
            self.prepared
                .lock()
                .pop()
                .ok_or_else(|| Error::Dial("no prepared connection".to_string()))
        }
    }

    fn test_client(dialer: Arc<dyn Dialer>) -> SubscriptionClient {
        SubscriptionClient::builder()
            .read_timeout(Duration::from_millis(20))
            .idle_grace(Duration::from_secs(5))
            .subprotocol(SubprotocolChoice::GraphqlWs)
            .dialer(dialer)
            .build()
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions::new(
            "ws://host/graphql",
            GraphQLBody::query("subscription { x }"),
        )
    }

    async fn ack_handshake(server: &mut PipeServer) {
        match server.from_client.next().await {
            Some(Frame::Text(text)) => assert_eq!(text, r#"{"type":"connection_init"}"#),
            other => panic!("expected init frame, got {other:?}"),
        }
        server
            .to_client
            .unbounded_send(Ok(Frame::Text(r#"{"type":"connection_ack"}"#.to_string())))
            .unwrap();
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {what}");
    }

    #[tokio::test]
    async fn test_subscribe_with_cancelled_caller_never_dials() {
        let dialer = Arc::new(RefusingDialer {
            dials: AtomicUsize::new(0),
        });
        let client = test_client(dialer.clone());

        let caller = CancellationToken::new();
        caller.cancel();
        let (tx, _rx) = mpsc::channel::<Bytes>(1);
        let err = client.subscribe(&caller, options(), tx).await.unwrap_err();
        assert!(matches!(err, Error::SubscriberCancelled));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        assert_eq!(client.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_fails() {
        let client = test_client(Arc::new(RefusingDialer {
            dials: AtomicUsize::new(0),
        }));
        client.shutdown();
        assert!(client.is_shut_down());

        let (tx, _rx) = mpsc::channel::<Bytes>(1);
        let err = client
            .subscribe(&CancellationToken::new(), options(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientShutdown));
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces_and_registry_drains() {
        let dialer = Arc::new(RefusingDialer {
            dials: AtomicUsize::new(0),
        });
        let client = test_client(dialer.clone());

        let (tx, _rx) = mpsc::channel::<Bytes>(1);
        let err = client
            .subscribe(&CancellationToken::new(), options(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial(_)));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        let probe = client.clone();
        eventually("registry drained after dial failure", move || {
            probe.active_connections() == 0
        })
        .await;
    }

    #[tokio::test]
    async fn test_subscribe_shares_one_connection_and_shutdown_drains() {
        let (conn, mut server) = pipe(Some(Subprotocol::GraphqlWs));
        let dialer = Arc::new(PipeDialer {
            prepared: Mutex::new(vec![conn]),
        });
        let client = test_client(dialer);

        let server_task = tokio::spawn(async move {
            ack_handshake(&mut server).await;
            // exactly one start frame for two identical subscribers
            match server.from_client.next().await {
                Some(Frame::Text(text)) => assert!(text.starts_with(r#"{"type":"start","id":"1""#)),
                other => panic!("expected start frame, got {other:?}"),
            }
            server
        });

        let caller = CancellationToken::new();
        let (tx1, _rx1) = mpsc::channel::<Bytes>(8);
        let (tx2, _rx2) = mpsc::channel::<Bytes>(8);
        client.subscribe(&caller, options(), tx1).await.unwrap();
        client.subscribe(&caller, options(), tx2).await.unwrap();
        assert_eq!(client.active_connections(), 1);

        let _server = server_task.await.unwrap();
        client.shutdown();
        let probe = client.clone();
        eventually("registry drained after shutdown", move || {
            probe.active_connections() == 0
        })
        .await;
    }

    #[tokio::test]
    async fn test_caller_cancellation_detaches_only_that_sink() {
        let (conn, mut server) = pipe(Some(Subprotocol::GraphqlWs));
        let dialer = Arc::new(PipeDialer {
            prepared: Mutex::new(vec![conn]),
        });
        let client = test_client(dialer);

        let handshake = tokio::spawn(async move {
            ack_handshake(&mut server).await;
            server
        });

        let caller1 = CancellationToken::new();
        let caller2 = CancellationToken::new();
        let (tx1, mut rx1) = mpsc::channel::<Bytes>(8);
        let (tx2, mut rx2) = mpsc::channel::<Bytes>(8);
        client.subscribe(&caller1, options(), tx1).await.unwrap();
        client.subscribe(&caller2, options(), tx2).await.unwrap();
        let mut server = handshake.await.unwrap();
        let _ = server.from_client.next().await; // start frame

        caller1.cancel();
        sleep(Duration::from_millis(50)).await;

        server
            .to_client
            .unbounded_send(Ok(Frame::Text(
                r#"{"type":"data","id":"1","payload":{"n":1}}"#.to_string(),
            )))
            .unwrap();
        assert_eq!(
            rx2.recv().await.unwrap(),
            Bytes::from_static(br#"{"n":1}"#)
        );
        // the cancelled caller's sink saw nothing
        assert!(rx1.try_recv().is_err());

        client.shutdown();
    }
}
