//! Content-hash keys for connection sharing and subscription deduplication
//!
//! Two callers may share an upstream WebSocket only when their
//! [`ConnectionKey`]s are equal, and share an upstream subscription only when
//! their [`SubscriptionKey`]s are equal. Keys are SHA-256 over the routing
//! inputs, so equality is content equality and never identity.

use http::HeaderMap;
use sha2::{Digest, Sha256};

/// Key identifying a shareable upstream connection.
///
/// Hashes the URL, the upgrade header set, the requested subprotocol mode,
/// and the init payload bytes. Headers are folded in name order so
/// insertion order does not split connections.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ConnectionKey {
    hash: String,
}

impl ConnectionKey {
    /// Compute the key for a prospective connection.
    pub fn new(
        url: &str,
        headers: &HeaderMap,
        subprotocol: &str,
        init_payload: Option<&[u8]>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b":");
        hasher.update(subprotocol.as_bytes());
        hasher.update(b":");

        let mut names: Vec<&str> = headers.keys().map(|name| name.as_str()).collect();
        names.sort_unstable();
        for name in names {
            for value in headers.get_all(name) {
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
                hasher.update(b";");
            }
        }

        hasher.update(b":");
        if let Some(payload) = init_payload {
            hasher.update(payload);
        }

        Self {
            hash: hex::encode(hasher.finalize()),
        }
    }

    /// Get the hash string.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Key identifying one deduplicated subscription on a connection.
///
/// Scoped under the owning [`ConnectionKey`]: identical bodies on different
/// connections are distinct subscriptions.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct SubscriptionKey {
    hash: String,
}

impl SubscriptionKey {
    /// Compute the key for a request body on a given connection.
    pub fn new(connection: &ConnectionKey, body_bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(connection.hash.as_bytes());
        hasher.update(b":");
        hasher.update(body_bytes);
        Self {
            hash: hex::encode(hasher.finalize()),
        }
    }

    /// Get the hash string.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}


#[cfg(test)]
mod proptest_checks {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fuzz_keys_deterministic(url in "ws://[a-z]{1,12}/[a-z]{0,8}", body in ".{0,64}") {
            let conn_a = ConnectionKey::new(&url, &HeaderMap::new(), "graphql-ws", None);
            let conn_b = ConnectionKey::new(&url, &HeaderMap::new(), "graphql-ws", None);
            prop_assert_eq!(&conn_a, &conn_b);

            let sub_a = SubscriptionKey::new(&conn_a, body.as_bytes());
            let sub_b = SubscriptionKey::new(&conn_b, body.as_bytes());
            prop_assert_eq!(sub_a, sub_b);
        }

        #[test]
        fn fuzz_distinct_bodies_distinct_keys(
            body_a in "[a-m]{1,32}",
            body_b in "[n-z]{1,32}",
        ) {
            let conn = ConnectionKey::new("ws://host/graphql", &HeaderMap::new(), "auto", None);
            let key_a = SubscriptionKey::new(&conn, body_a.as_bytes());
            let key_b = SubscriptionKey::new(&conn, body_b.as_bytes());
            prop_assert_ne!(key_a, key_b);
        }
    }
}
