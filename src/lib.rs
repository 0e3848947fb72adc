//! # graphql-ws-mux
//!
//! A multiplexing GraphQL subscription client: many logical subscriptions
//! from application callers are serviced over a deduplicated set of shared
//! upstream WebSocket connections.
//!
//! ## Features
//!
//! - **Connection sharing**: requests with the same URL, headers, and init
//!   payload share one upstream WebSocket, keyed by content fingerprint
//! - **Subscription deduplication**: identical subscription bodies on a
//!   shared connection produce a single upstream subscription whose data
//!   frames fan out to every subscriber sink, in arrival order
//! - **Two subprotocols**: `graphql-ws` (legacy) and `graphql-transport-ws`
//!   (modern), negotiated at upgrade or forced by configuration
//! - **Cancellation-driven lifecycle**: cancelling a caller's token detaches
//!   its sink; the upstream subscription stops when the last subscriber
//!   leaves, and idle connections expire after a grace interval
//! - **Bounded fan-out**: a sink that stalls past the backpressure bound is
//!   dropped alone, never starving its siblings
//!
//! ## Main Components
//!
//! - [`SubscriptionClient`]: the caller-facing entry point.
//! - [`SubscriptionClientBuilder`]: configuration builder for the client.
//! - [`SubscriptionOptions`] / [`GraphQLBody`]: one subscription request.
//! - [`SubscriberSink`]: caller-owned output channels.
//! - [`Dialer`]: transport abstraction; the default dials with
//!   tokio-tungstenite.
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphql_ws_mux::{GraphQLBody, SubscriptionClient, SubscriptionOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> graphql_ws_mux::Result<()> {
//!     let client = SubscriptionClient::builder().build();
//!     let caller = CancellationToken::new();
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//!
//!     client
//!         .subscribe(
//!             &caller,
//!             SubscriptionOptions::new(
//!                 "ws://localhost:4000/graphql",
//!                 GraphQLBody::query(r#"subscription {messageAdded(roomName: "room"){text}}"#),
//!             ),
//!             tx,
//!         )
//!         .await?;
//!
//!     while let Some(payload) = rx.recv().await {
//!         println!("{}", String::from_utf8_lossy(&payload));
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod fingerprint;
mod handler;
pub mod protocol;
mod registry;
pub mod transport;
pub mod types;

pub use client::{ClientConfig, SubscriptionClient, SubscriptionClientBuilder};
pub use error::{Error, Result};
pub use fingerprint::{ConnectionKey, SubscriptionKey};
pub use protocol::{Codec, ServerEvent, Subprotocol, SubprotocolChoice};
pub use transport::{Connection, Dialer, Frame, SocketSink, SocketStream, TungsteniteDialer};
pub use types::{
    GraphQLBody, InitPayloadProvider, StaticInitPayload, SubscriberSink, SubscriptionOptions,
};
