//! Per-connection protocol state machine
//!
//! A [`ConnectionHandler`] owns one upstream WebSocket and multiplexes every
//! logical subscription whose fingerprint routed here. It drives the init
//! handshake, reads frames in a loop, fans data payloads out to subscriber
//! sinks, answers keepalives, and tears the connection down when the last
//! subscriber leaves, a fatal error occurs, or the client shuts down.
//!
//! Socket writes and the subscription table share one async mutex: a
//! `start`/`subscribe` frame is on the wire before `add_subscription`
//! returns, and a `stop` is emitted exactly when a fan-out set empties,
//! never racing a late joiner.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{ConnectionKey, SubscriptionKey};
use crate::protocol::{Codec, ServerEvent};
use crate::transport::{Connection, Frame, SocketStream};
use crate::types::{GraphQLBody, SubscriberSink};

/// Externally observable handler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerStatus {
    /// Dialing or awaiting `connection_ack`
    Connecting,
    /// Handshake complete; accepting subscriptions
    Ready,
    /// Terminated and deregistering
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Starting,
    Active,
    Stopping,
    Stopped,
}

/// Proof of registration returned by `add_subscription`; identifies the
/// attached sink for later removal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubscriptionTicket {
    pub id: u64,
    pub sink_token: u64,
}

struct FanoutSink {
    token: u64,
    sink: SubscriberSink,
}

struct LogicalSubscription {
    key: SubscriptionKey,
    state: SubscriptionState,
    sinks: Vec<FanoutSink>,
}

struct HandlerCore {
    socket: Option<crate::transport::SocketSink>,
    codec: Option<Codec>,
    accepting: bool,
    subscriptions: AHashMap<u64, LogicalSubscription>,
    by_key: AHashMap<SubscriptionKey, u64>,
    next_id: u64,
    next_sink_token: u64,
    idle_since: Option<Instant>,
}

/// One live multiplexer bound to one upstream WebSocket connection.
pub(crate) struct ConnectionHandler {
    key: ConnectionKey,
    config: Arc<ClientConfig>,
    core: Mutex<HandlerCore>,
    status_tx: watch::Sender<HandlerStatus>,
    status_rx: watch::Receiver<HandlerStatus>,
    failure: SyncMutex<Option<Error>>,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    /// Create a handler in the `Connecting` state. The socket arrives later
    /// via [`ConnectionHandler::serve`], so the registry can install the
    /// entry before the dial completes.
    pub(crate) fn new(
        key: ConnectionKey,
        config: Arc<ClientConfig>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(HandlerStatus::Connecting);
        Arc::new(Self {
            key,
            config,
            core: Mutex::new(HandlerCore {
                socket: None,
                codec: None,
                accepting: true,
                subscriptions: AHashMap::new(),
                by_key: AHashMap::new(),
                next_id: 1,
                next_sink_token: 1,
                idle_since: Some(Instant::now()),
            }),
            status_tx,
            status_rx,
            failure: SyncMutex::new(None),
            shutdown,
        })
    }

    /// The fingerprint this handler is registered under.
    pub(crate) fn connection_key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Whether new subscriptions may still be routed here.
    pub(crate) fn is_live(&self) -> bool {
        !self.shutdown.is_cancelled() && *self.status_rx.borrow() != HandlerStatus::Closed
    }

    /// Resolves when the handler terminates (fatal error, idle expiry, or
    /// client shutdown).
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Wait until the handler leaves `Connecting`.
    pub(crate) async fn wait_ready(&self) -> HandlerStatus {
        let mut rx = self.status_rx.clone();
        let result = match rx.wait_for(|status| *status != HandlerStatus::Connecting).await {
            Ok(status) => *status,
            Err(_) => HandlerStatus::Closed,
        };
        result
    }

    /// Take the terminal connection error, if one was recorded.
    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    /// Record the terminal connection error; the first one wins.
    pub(crate) fn record_failure(&self, err: Error) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Number of live logical subscriptions, for tests and introspection.
    #[cfg(test)]
    pub(crate) async fn subscription_count(&self) -> usize {
        self.core.lock().await.subscriptions.len()
    }

    /// Register a subscriber.
    ///
    /// If a live subscription with the same fingerprint exists, the sink
    /// joins its fan-out set. Otherwise a connection-local id is assigned
    /// and the `start`/`subscribe` frame is written before returning, under
    /// the same lock that the read loop dispatches with.
    pub(crate) async fn add_subscription(
        &self,
        key: SubscriptionKey,
        body: &GraphQLBody,
        sink: SubscriberSink,
    ) -> Result<SubscriptionTicket> {
        let mut core = self.core.lock().await;
        if !core.accepting || self.shutdown.is_cancelled() {
            return Err(Error::HandlerClosing);
        }

        let sink_token = core.next_sink_token;
        core.next_sink_token += 1;

        if let Some(&id) = core.by_key.get(&key) {
            if let Some(sub) = core.subscriptions.get_mut(&id) {
                sub.sinks.push(FanoutSink { token: sink_token, sink });
                debug!(
                    subscription_id = id,
                    sinks = sub.sinks.len(),
                    "sink attached to shared subscription"
                );
                return Ok(SubscriptionTicket { id, sink_token });
            }
        }

        let codec = core.codec.ok_or(Error::HandlerClosing)?;
        let id = core.next_id;
        let frame = codec.encode_start(id, body)?;
        let socket = core.socket.as_mut().ok_or(Error::HandlerClosing)?;
        if let Err(err) = socket.send(Frame::Text(frame)).await {
            warn!(subscription_id = id, error = %err, "failed to write start frame");
            core.accepting = false;
            self.shutdown.cancel();
            return Err(err);
        }

        core.next_id += 1;
        core.by_key.insert(key.clone(), id);
        core.subscriptions.insert(
            id,
            LogicalSubscription {
                key,
                state: SubscriptionState::Starting,
                sinks: vec![FanoutSink { token: sink_token, sink }],
            },
        );
        core.idle_since = None;
        debug!(subscription_id = id, "subscription started");
        Ok(SubscriptionTicket { id, sink_token })
    }

    /// Detach one subscriber's sink. When the fan-out set empties, the
    /// upstream subscription is stopped; siblings are untouched.
    pub(crate) async fn remove_sink(&self, id: u64, sink_token: u64) {
        let mut core = self.core.lock().await;
        let now_empty = match core.subscriptions.get_mut(&id) {
            Some(sub) => {
                let before = sub.sinks.len();
                sub.sinks.retain(|entry| entry.token != sink_token);
                sub.sinks.len() != before && sub.sinks.is_empty()
            }
            None => return,
        };
        if !now_empty {
            return;
        }
        let Some(mut sub) = core.subscriptions.remove(&id) else {
            return;
        };
        core.by_key.remove(&sub.key);
        sub.state = SubscriptionState::Stopping;
        Self::stop_upstream(&mut core, id).await;
        sub.state = SubscriptionState::Stopped;
        debug!(
            subscription_id = id,
            state = ?sub.state,
            "upstream subscription stopped after last unsubscribe"
        );
    }

    /// Run the connection to completion over an established socket.
    pub(crate) async fn serve(&self, conn: Connection, init_payload: Option<serde_json::Value>) {
        if let Err(err) = self.serve_inner(conn, init_payload).await {
            warn!(error = %err, "connection handler terminating");
            self.record_failure(err);
        }
        self.teardown().await;
    }

    async fn serve_inner(
        &self,
        conn: Connection,
        init_payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let Connection {
            sink,
            mut stream,
            subprotocol,
        } = conn;
        let protocol = self.config.subprotocol.resolve(subprotocol);
        let codec = Codec::new(protocol);
        {
            let mut core = self.core.lock().await;
            core.socket = Some(sink);
            core.codec = Some(codec);
        }

        self.handshake(&codec, &mut stream, init_payload).await?;
        self.status_tx.send_replace(HandlerStatus::Ready);
        debug!(protocol = protocol.name(), "connection ready");

        self.read_loop(&codec, &mut stream).await
    }

    async fn handshake(
        &self,
        codec: &Codec,
        stream: &mut SocketStream,
        init_payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let init = codec.encode_init(init_payload.as_ref())?;
        self.write_frame(Frame::Text(init)).await?;

        let deadline = tokio::time::Instant::now() + self.config.init_timeout;
        let next = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(Error::ClientShutdown),
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let text = match next {
            Err(_) => {
                return Err(Error::Handshake(
                    "timed out waiting for connection_ack".to_string(),
                ))
            }
            Ok(None) | Ok(Some(Ok(Frame::Close))) => {
                return Err(Error::Handshake(
                    "connection closed before connection_ack".to_string(),
                ))
            }
            Ok(Some(Err(err))) => return Err(Error::Handshake(err.to_string())),
            Ok(Some(Ok(Frame::Text(text)))) => text,
        };

        match codec.decode(&text) {
            Ok(ServerEvent::ConnectionAck) => Ok(()),
            Ok(ServerEvent::ConnectionError { .. }) => Err(Error::Handshake(
                "server rejected connection during init".to_string(),
            )),
            Ok(other) => Err(Error::Handshake(format!(
                "unexpected frame before connection_ack: {other:?}"
            ))),
            Err(err) => Err(Error::Handshake(err.to_string())),
        }
    }

    /// Read frames until termination. A read timeout is a liveness tick,
    /// not a failure: it lets the loop observe shutdown, expire an idle
    /// connection, and probe with a modern-protocol ping.
    async fn read_loop(&self, codec: &Codec, stream: &mut SocketStream) -> Result<()> {
        let mut last_inbound = Instant::now();
        let mut last_probe = Instant::now();
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = timeout(self.config.read_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    if self.tick(codec, last_inbound, &mut last_probe).await? {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    debug!("server closed connection");
                    return Ok(());
                }
                Ok(Some(Ok(Frame::Close))) => {
                    debug!("server sent close frame");
                    return Ok(());
                }
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(Frame::Text(text)))) => {
                    last_inbound = Instant::now();
                    if self.handle_frame(codec, &text).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn tick(
        &self,
        codec: &Codec,
        last_inbound: Instant,
        last_probe: &mut Instant,
    ) -> Result<bool> {
        {
            let core = self.core.lock().await;
            if let Some(idle_since) = core.idle_since {
                if core.subscriptions.is_empty()
                    && idle_since.elapsed() >= self.config.idle_grace
                {
                    debug!("closing connection idle past grace interval");
                    return Ok(true);
                }
            }
        }
        if let Some(ping) = codec.encode_ping() {
            if last_inbound.elapsed() >= self.config.keepalive_interval
                && last_probe.elapsed() >= self.config.keepalive_interval
            {
                *last_probe = Instant::now();
                self.write_frame(Frame::Text(ping)).await?;
            }
        }
        Ok(false)
    }

    /// Returns `Ok(true)` when the frame terminates the connection.
    async fn handle_frame(&self, codec: &Codec, text: &str) -> Result<bool> {
        let event = match codec.decode(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "skipping malformed frame");
                return Ok(false);
            }
        };
        match event {
            ServerEvent::Data { id, payload } => {
                self.fan_out(id, payload).await;
                Ok(false)
            }
            ServerEvent::SubscriptionError { id, payload } => {
                self.fail_subscription(id, payload).await;
                Ok(false)
            }
            ServerEvent::Complete { id } => {
                self.complete_subscription(id).await;
                Ok(false)
            }
            ServerEvent::Ping => {
                if let Some(pong) = codec.encode_pong() {
                    self.write_frame(Frame::Text(pong)).await?;
                }
                Ok(false)
            }
            ServerEvent::Pong | ServerEvent::KeepAlive => Ok(false),
            ServerEvent::ConnectionAck => {
                debug!("ignoring duplicate connection_ack");
                Ok(false)
            }
            ServerEvent::ConnectionError { payload } => {
                warn!("connection-level error from server");
                self.broadcast_error(payload.unwrap_or_default()).await;
                Ok(true)
            }
            ServerEvent::ConnectionTerminate => {
                debug!("server terminated connection");
                Ok(true)
            }
            ServerEvent::Unknown { kind } => {
                warn!(op = %kind, "ignoring unknown operation");
                Ok(false)
            }
        }
    }

    /// Deliver a data payload to every sink of subscription `id` in order.
    /// A sink that stays full past the backpressure bound is detached from
    /// the fan-out set without affecting its siblings.
    async fn fan_out(&self, id: u64, payload: Bytes) {
        let mut core = self.core.lock().await;
        let Some(sub) = core.subscriptions.get_mut(&id) else {
            debug!(subscription_id = id, "data frame for unknown subscription");
            return;
        };
        if sub.state == SubscriptionState::Starting {
            sub.state = SubscriptionState::Active;
        }

        let bound = self.config.sink_send_timeout;
        let mut dropped = Vec::new();
        for entry in &sub.sinks {
            if !bounded_send(&entry.sink.data, payload.clone(), bound).await {
                warn!(
                    subscription_id = id,
                    sink = entry.token,
                    "dropping unresponsive sink from fan-out set"
                );
                dropped.push(entry.token);
            }
        }
        if dropped.is_empty() {
            return;
        }

        sub.sinks.retain(|entry| !dropped.contains(&entry.token));
        if sub.sinks.is_empty() {
            let Some(mut sub) = core.subscriptions.remove(&id) else {
                return;
            };
            core.by_key.remove(&sub.key);
            sub.state = SubscriptionState::Stopping;
            Self::stop_upstream(&mut core, id).await;
            sub.state = SubscriptionState::Stopped;
            debug!(subscription_id = id, "last sink dropped, upstream stopped");
        }
    }

    /// An `error` frame terminates its subscription: surface the payload on
    /// the out-of-band channels, then treat as complete.
    async fn fail_subscription(&self, id: u64, payload: Bytes) {
        let mut core = self.core.lock().await;
        let Some(mut sub) = core.subscriptions.remove(&id) else {
            debug!(subscription_id = id, "error frame for unknown subscription");
            return;
        };
        core.by_key.remove(&sub.key);
        warn!(subscription_id = id, "subscription failed upstream");
        let bound = self.config.sink_send_timeout;
        for entry in &sub.sinks {
            if let Some(errors) = &entry.sink.errors {
                let _ = bounded_send(errors, payload.clone(), bound).await;
            }
        }
        sub.state = SubscriptionState::Stopped;
        if core.subscriptions.is_empty() {
            core.idle_since = Some(Instant::now());
        }
    }

    async fn complete_subscription(&self, id: u64) {
        let mut core = self.core.lock().await;
        let Some(mut sub) = core.subscriptions.remove(&id) else {
            debug!(subscription_id = id, "complete frame for unknown subscription");
            return;
        };
        core.by_key.remove(&sub.key);
        sub.state = SubscriptionState::Stopped;
        debug!(subscription_id = id, "subscription completed by server");
        if core.subscriptions.is_empty() {
            core.idle_since = Some(Instant::now());
        }
    }

    /// Forward a connection-level error payload to every out-of-band
    /// channel before the handler closes.
    async fn broadcast_error(&self, payload: Bytes) {
        let core = self.core.lock().await;
        let bound = self.config.sink_send_timeout;
        for sub in core.subscriptions.values() {
            for entry in &sub.sinks {
                if let Some(errors) = &entry.sink.errors {
                    let _ = bounded_send(errors, payload.clone(), bound).await;
                }
            }
        }
    }

    async fn stop_upstream(core: &mut HandlerCore, id: u64) {
        if let (Some(codec), Some(socket)) = (core.codec, core.socket.as_mut()) {
            match codec.encode_stop(id) {
                Ok(frame) => {
                    if let Err(err) = socket.send(Frame::Text(frame)).await {
                        warn!(subscription_id = id, error = %err, "failed to write stop frame");
                    }
                }
                Err(err) => {
                    warn!(subscription_id = id, error = %err, "failed to encode stop frame");
                }
            }
        }
        if core.subscriptions.is_empty() {
            core.idle_since = Some(Instant::now());
        }
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let mut core = self.core.lock().await;
        match core.socket.as_mut() {
            Some(socket) => socket.send(frame).await,
            None => Err(Error::HandlerClosing),
        }
    }

    /// Terminate the handler. Idempotent; stops accepting, best-effort
    /// sends the protocol goodbye, closes the socket, and drops every
    /// remaining subscription without touching caller-owned sinks.
    pub(crate) async fn teardown(&self) {
        self.shutdown.cancel();
        let mut core = self.core.lock().await;
        core.accepting = false;
        let remaining = core.subscriptions.len();
        core.subscriptions.clear();
        core.by_key.clear();
        if let Some(mut socket) = core.socket.take() {
            if let Some(frame) = core.codec.and_then(|codec| codec.encode_terminate()) {
                let _ = socket.send(Frame::Text(frame)).await;
            }
            let _ = socket.send(Frame::Close).await;
            let _ = socket.close().await;
        }
        drop(core);
        self.status_tx.send_replace(HandlerStatus::Closed);
        debug!(
            remaining_subscriptions = remaining,
            "connection handler closed"
        );
    }
}

/// Non-blocking attempt with a bounded wait; `false` means the sink is
/// closed or stayed full past the bound.
async fn bounded_send(
    sender: &mpsc::Sender<Bytes>,
    value: Bytes,
    bound: std::time::Duration,
) -> bool {
    match sender.try_send(value) {
        Ok(()) => true,
        Err(TrySendError::Closed(_)) => false,
        Err(TrySendError::Full(value)) => sender.send_timeout(value, bound).await.is_ok(),
    }
}
