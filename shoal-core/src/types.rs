//! Strongly-typed identifiers for Shoal entities.
//!
//! Explicit types prevent bugs from mixing up identifiers: a shard number is
//! never interchangeable with a version, and a member identifier is never a
//! bare string in the sharding logic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::limits::MEMBER_ID_RANDOM_LEN;

/// Identifier of a single shard, in `[0, N)` for a deployment with N shards.
///
/// Serialized as a bare integer inside assignment payloads.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ShardId(u32);

impl ShardId {
    /// Creates a new shard ID from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<ShardId> for u32 {
    fn from(id: ShardId) -> Self {
        id.get()
    }
}

/// Printable identifier of a fleet member, unique per process instance.
///
/// Member identifiers name znodes, so they must not contain `/`. Generated
/// identifiers are 16 random bytes hex-encoded (32 characters).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(String);

impl MemberId {
    /// Creates a member ID from an existing string.
    ///
    /// # Panics
    /// Panics if the ID is empty or contains a path separator.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "member ID must not be empty");
        assert!(!id.contains('/'), "member ID must not contain '/'");
        Self(id)
    }

    /// Generates a random member ID: 16 random bytes, hex-encoded.
    #[must_use]
    pub fn random() -> Self {
        let data: [u8; MEMBER_ID_RANDOM_LEN] = rand::random();
        Self(hex::encode(data))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member({})", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MemberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_display() {
        let id = ShardId::new(7);
        assert_eq!(format!("{id}"), "shard-7");
        assert_eq!(format!("{id:?}"), "shard(7)");
    }

    #[test]
    fn test_shard_id_ordering() {
        let a = ShardId::new(1);
        let b = ShardId::new(2);
        assert!(a < b);
        assert_eq!(a, ShardId::new(1));
    }

    #[test]
    fn test_member_id_random_length() {
        let id = MemberId::random();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_member_id_random_unique() {
        // Two draws colliding would mean a broken RNG.
        assert_ne!(MemberId::random(), MemberId::random());
    }

    #[test]
    fn test_member_id_ordering_is_lexicographic() {
        let a = MemberId::new("node01");
        let b = MemberId::new("node02");
        assert!(a < b);
    }

    #[test]
    #[should_panic(expected = "must not contain '/'")]
    fn test_member_id_rejects_separator() {
        let _ = MemberId::new("a/b");
    }
}
