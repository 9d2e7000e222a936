//! Znode path layout and payload codecs.
//!
//! Payloads are compact JSON. Unknown fields are ignored on decode; a
//! payload that fails to decode at all is operator or programmer error and
//! is fatal.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shoal_core::{MemberId, ShardId};

const LOCK_SUFFIX: &str = "/lock";
const NODES_SUFFIX: &str = "/nodes";
const ASSIGNS_SUFFIX: &str = "/assigns";

/// Fixed znode layout under a deployment root.
#[derive(Debug, Clone)]
pub(crate) struct PathLayout {
    root: String,
}

impl PathLayout {
    /// # Panics
    /// Panics if the root is not an absolute path without a trailing slash.
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        assert!(root.starts_with('/'), "root must be absolute: {root}");
        assert!(!root.ends_with('/'), "root must not end with '/': {root}");
        Self { root }
    }

    pub fn lock(&self) -> String {
        format!("{}{LOCK_SUFFIX}", self.root)
    }

    pub fn nodes(&self) -> String {
        format!("{}{NODES_SUFFIX}", self.root)
    }

    pub fn assigns(&self) -> String {
        format!("{}{ASSIGNS_SUFFIX}", self.root)
    }

    pub fn presence(&self, member: &MemberId) -> String {
        format!("{}{NODES_SUFFIX}/{member}", self.root)
    }

    pub fn assign(&self, member: &MemberId) -> String {
        format!("{}{ASSIGNS_SUFFIX}/{member}", self.root)
    }
}

/// Payload of a member's ephemeral presence znode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PresenceData {
    pub address: String,
}

impl PresenceData {
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("presence payload serializes"))
    }

    /// # Panics
    /// Panics on malformed payloads; the store only ever holds payloads
    /// this module wrote.
    pub fn decode(data: &[u8]) -> Self {
        serde_json::from_slice(data)
            .unwrap_or_else(|err| panic!("malformed presence payload: {err}"))
    }
}

/// Payload of a member's persistent assignment znode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub(crate) struct AssignData {
    pub shards: Vec<ShardId>,
}

impl AssignData {
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("assignment payload serializes"))
    }

    /// # Panics
    /// Panics on malformed payloads.
    pub fn decode(data: &[u8]) -> Self {
        serde_json::from_slice(data)
            .unwrap_or_else(|err| panic!("malformed assignment payload: {err}"))
    }
}
