//! Invalidation wire message.

use std::slice;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a peer should drop from its local tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvalidationKind {
    Evict,
    BulkEvict,
    Clear,
}

/// One key or many; encoded as a bare string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InvalidationKeys {
    One(String),
    Many(Vec<String>),
}

impl InvalidationKeys {
    pub fn as_slice(&self) -> &[String] {
        match self {
            InvalidationKeys::One(key) => slice::from_ref(key),
            InvalidationKeys::Many(keys) => keys,
        }
    }
}

/// Notification that some keys of a cache changed on `origin_id`.
///
/// Encoded as JSON:
///
/// ```json
/// {"cacheName":"orders","keys":["o1","o2"],"kind":"bulkEvict","originId":"node-a","publishedAt":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub cache_name: String,
    pub keys: InvalidationKeys,
    pub kind: InvalidationKind,
    pub origin_id: String,
    #[serde(default = "Utc::now")]
    pub published_at: DateTime<Utc>,
}

impl InvalidationMessage {
    /// Evict a single key.
    pub fn evict(
        cache_name: impl Into<String>,
        key: impl Into<String>,
        origin_id: impl Into<String>,
    ) -> Self {
        Self::new(
            cache_name,
            InvalidationKeys::One(key.into()),
            InvalidationKind::Evict,
            origin_id,
        )
    }

    /// Evict several keys.
    pub fn bulk_evict(
        cache_name: impl Into<String>,
        keys: Vec<String>,
        origin_id: impl Into<String>,
    ) -> Self {
        Self::new(
            cache_name,
            InvalidationKeys::Many(keys),
            InvalidationKind::BulkEvict,
            origin_id,
        )
    }

    /// Drop every local entry of the cache.
    pub fn clear(cache_name: impl Into<String>, origin_id: impl Into<String>) -> Self {
        Self::new(
            cache_name,
            InvalidationKeys::Many(Vec::new()),
            InvalidationKind::Clear,
            origin_id,
        )
    }

    fn new(
        cache_name: impl Into<String>,
        keys: InvalidationKeys,
        kind: InvalidationKind,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            keys,
            kind,
            origin_id: origin_id.into(),
            published_at: Utc::now(),
        }
    }

    pub fn keys(&self) -> &[String] {
        self.keys.as_slice()
    }

    /// Check if this node published the message.
    pub fn is_from(&self, node_id: &str) -> bool {
        self.origin_id == node_id
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
