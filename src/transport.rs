//! WebSocket transport abstraction
//!
//! The connection handler only needs framed text I/O over a dialed socket,
//! so the transport surface is a [`Dialer`] producing boxed frame halves.
//! The default implementation dials with tokio-tungstenite; tests substitute
//! in-memory pipes.

use std::pin::Pin;

use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use http::HeaderMap;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::{Error, Result};
use crate::protocol::Subprotocol;

/// A text frame on the wire, as seen by the protocol state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame carrying one protocol message
    Text(String),
    /// Close handshake
    Close,
}

impl Frame {
    fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Write half of a dialed connection.
pub type SocketSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;

/// Read half of a dialed connection.
pub type SocketStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An established, upgrade-complete connection.
pub struct Connection {
    /// Write half; the handler serializes access to it
    pub sink: SocketSink,
    /// Read half; owned by the handler's read loop
    pub stream: SocketStream,
    /// Subprotocol the server echoed at upgrade, when any
    pub subprotocol: Option<Subprotocol>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("subprotocol", &self.subprotocol)
            .finish()
    }
}

/// Opens WebSocket connections for the subscription client.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `url`, forwarding `headers` and offering `subprotocols` at
    /// upgrade.
    async fn dial(
        &self,
        url: &str,
        headers: &HeaderMap,
        subprotocols: &[Subprotocol],
    ) -> Result<Connection>;
}

/// Default dialer backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteDialer;

#[async_trait::async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(
        &self,
        url: &str,
        headers: &HeaderMap,
        subprotocols: &[Subprotocol],
    ) -> Result<Connection> {
        let mut request = url
            .into_client_request()
            .map_err(|err| Error::Dial(err.to_string()))?;

        for (name, value) in headers.iter() {
            request.headers_mut().append(name, value.clone());
        }
        if !subprotocols.is_empty() {
            let offered = subprotocols
                .iter()
                .map(|protocol| protocol.name())
                .collect::<Vec<_>>()
                .join(", ");
            request.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&offered)
                    .map_err(|err| Error::Dial(err.to_string()))?,
            );
        }

        let (socket, response) = connect_async(request)
            .await
            .map_err(|err| Error::Dial(err.to_string()))?;

        let subprotocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .and_then(Subprotocol::from_name);

        let (write, read) = socket.split();

        let sink: SocketSink = Box::pin(
            write
                .sink_map_err(Error::from)
                .with(|frame: Frame| future::ready(Ok::<Message, Error>(frame.into_message()))),
        );

        let stream: SocketStream = Box::pin(read.filter_map(|result| {
            future::ready(match result {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                // ws-level ping/pong and binary frames are not part of
                // either GraphQL dialect
                Ok(_) => None,
                Err(err) => Some(Err(Error::from(err))),
            })
        }));

        Ok(Connection {
            sink,
            stream,
            subprotocol,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::pipe;
    use super::*;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn test_frame_to_message_mapping() {
        assert!(matches!(
            Frame::Text("x".to_string()).into_message(),
            Message::Text(text) if text == "x"
        ));
        assert!(matches!(Frame::Close.into_message(), Message::Close(None)));
    }

    #[tokio::test]
    async fn test_pipe_roundtrip() {
        let (mut conn, mut server) = pipe(Some(Subprotocol::GraphqlWs));
        assert_eq!(conn.subprotocol, Some(Subprotocol::GraphqlWs));

        conn.sink
            .send(Frame::Text("hello".to_string()))
            .await
            .unwrap();
        assert_eq!(
            server.from_client.next().await,
            Some(Frame::Text("hello".to_string()))
        );

        server
            .to_client
            .send(Ok(Frame::Text("world".to_string())))
            .await
            .unwrap();
        match conn.stream.next().await {
            Some(Ok(Frame::Text(text))) => assert_eq!(text, "world"),
            other => panic!("unexpected frame: {other:?}"),
        }

        // dropping the server side ends the client stream
        drop(server.to_client);
        assert!(conn.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pipe_write_after_peer_drop_errors() {
        let (mut conn, server) = pipe(None);
        drop(server.from_client);
        let err = conn
            .sink
            .send(Frame::Text("late".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
