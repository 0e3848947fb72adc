//! Frame codec for the GraphQL-over-WebSocket subprotocols
//!
//! Two dialects are supported, negotiated at upgrade:
//!
//! | logical event | `graphql-ws` (legacy) | `graphql-transport-ws` (modern) |
//! |---|---|---|
//! | client init | `connection_init` | `connection_init` |
//! | server ack | `connection_ack` | `connection_ack` |
//! | client start | `start` | `subscribe` |
//! | server data | `data` | `next` |
//! | client stop | `stop` | `complete` |
//! | keepalive | `ka` (server only) | `ping`/`pong` |
//!
//! The codec is pure: encoding produces the exact frame text, decoding
//! extracts `{op, id, payload}` without reshaping the payload JSON. Unknown
//! operation names decode to [`ServerEvent::Unknown`] so the read loop can
//! log and skip them.

use std::borrow::Cow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::types::GraphQLBody;

/// A concrete GraphQL-over-WS dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subprotocol {
    /// The legacy `graphql-ws` dialect (subscriptions-transport-ws)
    GraphqlWs,
    /// The modern `graphql-transport-ws` dialect
    GraphqlTransportWs,
}

impl Subprotocol {
    /// The subprotocol string offered at WebSocket upgrade.
    pub const fn name(self) -> &'static str {
        match self {
            Subprotocol::GraphqlWs => "graphql-ws",
            Subprotocol::GraphqlTransportWs => "graphql-transport-ws",
        }
    }

    /// Parse a negotiated subprotocol string.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "graphql-ws" => Some(Subprotocol::GraphqlWs),
            "graphql-transport-ws" => Some(Subprotocol::GraphqlTransportWs),
            _ => None,
        }
    }
}

/// Subprotocol selection mode for a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubprotocolChoice {
    /// Offer both dialects and adopt the server's pick, preferring the
    /// modern one when the server echoes nothing
    #[default]
    Auto,
    /// Force the legacy dialect
    GraphqlWs,
    /// Force the modern dialect
    GraphqlTransportWs,
}

impl SubprotocolChoice {
    /// Subprotocols offered at upgrade, in preference order.
    pub fn offered(self) -> &'static [Subprotocol] {
        match self {
            SubprotocolChoice::Auto => {
                &[Subprotocol::GraphqlTransportWs, Subprotocol::GraphqlWs]
            }
            SubprotocolChoice::GraphqlWs => &[Subprotocol::GraphqlWs],
            SubprotocolChoice::GraphqlTransportWs => &[Subprotocol::GraphqlTransportWs],
        }
    }

    /// Stable label folded into connection fingerprints.
    pub fn fingerprint_label(self) -> &'static str {
        match self {
            SubprotocolChoice::Auto => "auto",
            SubprotocolChoice::GraphqlWs => Subprotocol::GraphqlWs.name(),
            SubprotocolChoice::GraphqlTransportWs => Subprotocol::GraphqlTransportWs.name(),
        }
    }

    /// Resolve the dialect from the server's negotiated subprotocol.
    pub fn resolve(self, negotiated: Option<Subprotocol>) -> Subprotocol {
        match (self, negotiated) {
            (_, Some(protocol)) => protocol,
            (SubprotocolChoice::GraphqlWs, None) => Subprotocol::GraphqlWs,
            _ => Subprotocol::GraphqlTransportWs,
        }
    }
}

/// A decoded server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Init handshake accepted
    ConnectionAck,
    /// Legacy `ka`; carries no id and needs no reply
    KeepAlive,
    /// Modern keepalive probe; must be answered with `pong`
    Ping,
    /// Reply to an earlier client `ping`
    Pong,
    /// Execution result payload for one subscription id
    Data { id: u64, payload: Bytes },
    /// Terminal error for one subscription id
    SubscriptionError { id: u64, payload: Bytes },
    /// Upstream completed one subscription id
    Complete { id: u64 },
    /// Connection-level rejection; fatal for every subscription
    ConnectionError { payload: Option<Bytes> },
    /// Legacy connection-level termination
    ConnectionTerminate,
    /// Operation name not defined by the negotiated dialect
    Unknown { kind: String },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LegacyClientFrame<'a> {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a serde_json::Value>,
    },
    Start {
        id: String,
        payload: &'a GraphQLBody,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ModernClientFrame<'a> {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a serde_json::Value>,
    },
    Subscribe {
        id: String,
        payload: &'a GraphQLBody,
    },
    Complete {
        id: String,
    },
    Ping,
    Pong,
}

#[derive(Deserialize)]
struct WireFrame<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
    #[serde(borrow, default)]
    id: Option<Cow<'a, str>>,
    #[serde(borrow, default)]
    payload: Option<&'a RawValue>,
}

impl WireFrame<'_> {
    fn require_id(&self) -> Result<u64> {
        let id = self
            .id
            .as_deref()
            .ok_or_else(|| Error::Protocol(format!("{} frame without id", self.kind)))?;
        id.parse::<u64>()
            .map_err(|_| Error::Protocol(format!("non-numeric subscription id {id:?}")))
    }

    fn payload_bytes(&self) -> Bytes {
        self.payload
            .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
            .unwrap_or_default()
    }
}

/// Encoder/decoder bound to one negotiated dialect.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    protocol: Subprotocol,
}

impl Codec {
    /// Create a codec for the negotiated dialect.
    pub fn new(protocol: Subprotocol) -> Self {
        Self { protocol }
    }

    /// The dialect this codec speaks.
    pub fn protocol(&self) -> Subprotocol {
        self.protocol
    }

    /// Encode the `connection_init` frame, embedding the payload verbatim
    /// when present.
    pub fn encode_init(&self, payload: Option<&serde_json::Value>) -> Result<String> {
        let text = match self.protocol {
            Subprotocol::GraphqlWs => {
                serde_json::to_string(&LegacyClientFrame::ConnectionInit { payload })?
            }
            Subprotocol::GraphqlTransportWs => {
                serde_json::to_string(&ModernClientFrame::ConnectionInit { payload })?
            }
        };
        Ok(text)
    }

    /// Encode the frame that starts subscription `id`.
    pub fn encode_start(&self, id: u64, body: &GraphQLBody) -> Result<String> {
        let id = id.to_string();
        let text = match self.protocol {
            Subprotocol::GraphqlWs => {
                serde_json::to_string(&LegacyClientFrame::Start { id, payload: body })?
            }
            Subprotocol::GraphqlTransportWs => {
                serde_json::to_string(&ModernClientFrame::Subscribe { id, payload: body })?
            }
        };
        Ok(text)
    }

    /// Encode the frame that stops subscription `id`.
    pub fn encode_stop(&self, id: u64) -> Result<String> {
        let id = id.to_string();
        let text = match self.protocol {
            Subprotocol::GraphqlWs => serde_json::to_string(&LegacyClientFrame::Stop { id })?,
            Subprotocol::GraphqlTransportWs => {
                serde_json::to_string(&ModernClientFrame::Complete { id })?
            }
        };
        Ok(text)
    }

    /// Encode a keepalive probe; the legacy dialect has none.
    pub fn encode_ping(&self) -> Option<String> {
        match self.protocol {
            Subprotocol::GraphqlWs => None,
            Subprotocol::GraphqlTransportWs => Some(r#"{"type":"ping"}"#.to_string()),
        }
    }

    /// Encode the reply to a server `ping`; the legacy dialect has none.
    pub fn encode_pong(&self) -> Option<String> {
        match self.protocol {
            Subprotocol::GraphqlWs => None,
            Subprotocol::GraphqlTransportWs => Some(r#"{"type":"pong"}"#.to_string()),
        }
    }

    /// Encode the connection-level goodbye, where the dialect defines one.
    pub fn encode_terminate(&self) -> Option<String> {
        match self.protocol {
            Subprotocol::GraphqlWs => Some(r#"{"type":"connection_terminate"}"#.to_string()),
            Subprotocol::GraphqlTransportWs => None,
        }
    }

    /// Decode one inbound text frame.
    ///
    /// Payload bytes are sliced out of the source text untouched, so sinks
    /// observe exactly what the server sent.
    pub fn decode(&self, text: &str) -> Result<ServerEvent> {
        let frame: WireFrame<'_> = serde_json::from_str(text)
            .map_err(|err| Error::Protocol(format!("unparseable frame: {err}")))?;

        let event = match (self.protocol, frame.kind.as_ref()) {
            (_, "connection_ack") => ServerEvent::ConnectionAck,

            (Subprotocol::GraphqlWs, "ka") => ServerEvent::KeepAlive,
            (Subprotocol::GraphqlWs, "data") => ServerEvent::Data {
                id: frame.require_id()?,
                payload: frame.payload_bytes(),
            },
            (Subprotocol::GraphqlWs, "connection_error") => ServerEvent::ConnectionError {
                payload: frame.payload.map(|_| frame.payload_bytes()),
            },
            (Subprotocol::GraphqlWs, "connection_terminate") => ServerEvent::ConnectionTerminate,

            (Subprotocol::GraphqlTransportWs, "ping") => ServerEvent::Ping,
            (Subprotocol::GraphqlTransportWs, "pong") => ServerEvent::Pong,
            (Subprotocol::GraphqlTransportWs, "next") => ServerEvent::Data {
                id: frame.require_id()?,
                payload: frame.payload_bytes(),
            },

            (_, "error") => ServerEvent::SubscriptionError {
                id: frame.require_id()?,
                payload: frame.payload_bytes(),
            },
            (_, "complete") => ServerEvent::Complete {
                id: frame.require_id()?,
            },

            (_, kind) => ServerEvent::Unknown {
                kind: kind.to_string(),
            },
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_init_without_payload() {
        for protocol in [Subprotocol::GraphqlWs, Subprotocol::GraphqlTransportWs] {
            let codec = Codec::new(protocol);
            assert_eq!(
                codec.encode_init(None).unwrap(),
                r#"{"type":"connection_init"}"#
            );
        }
    }

    #[test]
    fn test_encode_init_with_payload() {
        let payload = json!({"authorization": "secret"});
        for protocol in [Subprotocol::GraphqlWs, Subprotocol::GraphqlTransportWs] {
            let codec = Codec::new(protocol);
            assert_eq!(
                codec.encode_init(Some(&payload)).unwrap(),
                r#"{"type":"connection_init","payload":{"authorization":"secret"}}"#
            );
        }
    }

    #[test]
    fn test_encode_start_legacy() {
        let codec = Codec::new(Subprotocol::GraphqlWs);
        let body = GraphQLBody::query(r#"subscription {messageAdded(roomName: "room"){text}}"#);
        assert_eq!(
            codec.encode_start(1, &body).unwrap(),
            r#"{"type":"start","id":"1","payload":{"query":"subscription {messageAdded(roomName: \"room\"){text}}"}}"#
        );
    }

    #[test]
    fn test_encode_start_modern() {
        let codec = Codec::new(Subprotocol::GraphqlTransportWs);
        let body = GraphQLBody::query("subscription { tick }");
        assert_eq!(
            codec.encode_start(7, &body).unwrap(),
            r#"{"type":"subscribe","id":"7","payload":{"query":"subscription { tick }"}}"#
        );
    }

    #[test]
    fn test_encode_stop_per_dialect() {
        assert_eq!(
            Codec::new(Subprotocol::GraphqlWs).encode_stop(3).unwrap(),
            r#"{"type":"stop","id":"3"}"#
        );
        assert_eq!(
            Codec::new(Subprotocol::GraphqlTransportWs)
                .encode_stop(3)
                .unwrap(),
            r#"{"type":"complete","id":"3"}"#
        );
    }

    #[test]
    fn test_keepalive_frames_per_dialect() {
        let legacy = Codec::new(Subprotocol::GraphqlWs);
        assert!(legacy.encode_ping().is_none());
        assert!(legacy.encode_pong().is_none());
        assert_eq!(
            legacy.encode_terminate().as_deref(),
            Some(r#"{"type":"connection_terminate"}"#)
        );

        let modern = Codec::new(Subprotocol::GraphqlTransportWs);
        assert_eq!(modern.encode_ping().as_deref(), Some(r#"{"type":"ping"}"#));
        assert_eq!(modern.encode_pong().as_deref(), Some(r#"{"type":"pong"}"#));
        assert!(modern.encode_terminate().is_none());
    }

    #[test]
    fn test_decode_data_preserves_payload_bytes() {
        let codec = Codec::new(Subprotocol::GraphqlWs);
        let event = codec
            .decode(r#"{"type":"data","id":"1","payload":{"data":{"messageAdded":{"text":"first"}}}}"#)
            .unwrap();
        match event {
            ServerEvent::Data { id, payload } => {
                assert_eq!(id, 1);
                assert_eq!(
                    payload.as_ref(),
                    br#"{"data":{"messageAdded":{"text":"first"}}}"#
                );
            }
            other => panic!("expected data event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_next_modern() {
        let codec = Codec::new(Subprotocol::GraphqlTransportWs);
        let event = codec
            .decode(r#"{"type":"next","id":"42","payload":{"data":{"tick":1}}}"#)
            .unwrap();
        assert_eq!(
            event,
            ServerEvent::Data {
                id: 42,
                payload: Bytes::from_static(br#"{"data":{"tick":1}}"#),
            }
        );
    }

    #[test]
    fn test_decode_error_and_complete() {
        let codec = Codec::new(Subprotocol::GraphqlTransportWs);
        assert_eq!(
            codec
                .decode(r#"{"type":"error","id":"2","payload":[{"message":"boom"}]}"#)
                .unwrap(),
            ServerEvent::SubscriptionError {
                id: 2,
                payload: Bytes::from_static(br#"[{"message":"boom"}]"#),
            }
        );
        assert_eq!(
            codec.decode(r#"{"type":"complete","id":"2"}"#).unwrap(),
            ServerEvent::Complete { id: 2 }
        );
    }

    #[test]
    fn test_decode_keepalive_variants() {
        assert_eq!(
            Codec::new(Subprotocol::GraphqlWs)
                .decode(r#"{"type":"ka"}"#)
                .unwrap(),
            ServerEvent::KeepAlive
        );
        assert_eq!(
            Codec::new(Subprotocol::GraphqlTransportWs)
                .decode(r#"{"type":"ping"}"#)
                .unwrap(),
            ServerEvent::Ping
        );
        // "ka" is not part of the modern dialect
        assert_eq!(
            Codec::new(Subprotocol::GraphqlTransportWs)
                .decode(r#"{"type":"ka"}"#)
                .unwrap(),
            ServerEvent::Unknown {
                kind: "ka".to_string()
            }
        );
    }

    #[test]
    fn test_decode_connection_level_events() {
        let codec = Codec::new(Subprotocol::GraphqlWs);
        assert_eq!(
            codec.decode(r#"{"type":"connection_terminate"}"#).unwrap(),
            ServerEvent::ConnectionTerminate
        );
        match codec
            .decode(r#"{"type":"connection_error","payload":{"message":"unauthorized"}}"#)
            .unwrap()
        {
            ServerEvent::ConnectionError { payload: Some(p) } => {
                assert_eq!(p.as_ref(), br#"{"message":"unauthorized"}"#);
            }
            other => panic!("expected connection_error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_op_is_not_fatal() {
        let codec = Codec::new(Subprotocol::GraphqlWs);
        assert_eq!(
            codec.decode(r#"{"type":"surprise","id":"1"}"#).unwrap(),
            ServerEvent::Unknown {
                kind: "surprise".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = Codec::new(Subprotocol::GraphqlWs);
        assert!(matches!(codec.decode("not json"), Err(Error::Protocol(_))));
        assert!(matches!(
            codec.decode(r#"{"type":"data","payload":{}}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            codec.decode(r#"{"type":"data","id":"x","payload":{}}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_choice_resolution() {
        assert_eq!(
            SubprotocolChoice::Auto.resolve(Some(Subprotocol::GraphqlWs)),
            Subprotocol::GraphqlWs
        );
        assert_eq!(
            SubprotocolChoice::Auto.resolve(None),
            Subprotocol::GraphqlTransportWs
        );
        assert_eq!(
            SubprotocolChoice::GraphqlWs.resolve(None),
            Subprotocol::GraphqlWs
        );
        assert_eq!(
            SubprotocolChoice::Auto.offered(),
            &[Subprotocol::GraphqlTransportWs, Subprotocol::GraphqlWs]
        );
    }
}

#[cfg(test)]
mod proptest_checks {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fuzz_decode_never_panics(text in ".{0,256}") {
            let _ = Codec::new(Subprotocol::GraphqlWs).decode(&text);
            let _ = Codec::new(Subprotocol::GraphqlTransportWs).decode(&text);
        }

        #[test]
        fn fuzz_unknown_ops_are_ignored(kind in "[a-z_]{1,24}") {
            prop_assume!(!matches!(
                kind.as_str(),
                "connection_ack" | "ka" | "data" | "error" | "complete"
                    | "connection_error" | "connection_terminate"
            ));
            let frame = format!(r#"{{"type":"{kind}"}}"#);
            let event = Codec::new(Subprotocol::GraphqlWs).decode(&frame).unwrap();
            prop_assert_eq!(event, ServerEvent::Unknown { kind });
        }

        #[test]
        fn fuzz_start_frame_roundtrips_query(query in "[ -~]{0,64}") {
            let codec = Codec::new(Subprotocol::GraphqlTransportWs);
            let frame = codec.encode_start(1, &GraphQLBody::query(query.clone())).unwrap();
            let decoded: serde_json::Value = serde_json::from_str(&frame).unwrap();
            prop_assert_eq!(decoded["type"].as_str(), Some("subscribe"));
            prop_assert_eq!(decoded["payload"]["query"].as_str(), Some(query.as_str()));
        }
    }
}
