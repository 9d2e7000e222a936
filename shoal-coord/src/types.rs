//! Operation, response, and watch-event types for the coordination store.

use std::fmt;

use bytes::Bytes;

use crate::error::CoordError;

/// Identifies a client (one fleet process) attached to the simulated store.
///
/// Tests declare these as constants; the store keys its per-client operation
/// queues by this ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(&'static str);

impl ClientId {
    /// Creates a client ID from a static name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the client name.
    #[must_use]
    pub const fn get(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Metadata of a znode, returned with reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Store-wide logical timestamp of the creating write.
    pub czxid: i64,
    /// Store-wide logical timestamp of the last modifying write.
    pub mzxid: i64,
    /// Per-znode data version, starting at 0 and incremented by each set.
    pub version: i32,
}

/// How a znode is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Outlives the creating session.
    Persistent,
    /// Deleted automatically when the creating session expires.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the
    /// name by the store. Used for leader election.
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true for the ephemeral modes.
    #[must_use]
    pub const fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Returns true if the store appends a sequence suffix to the name.
    #[must_use]
    pub const fn is_sequential(self) -> bool {
        matches!(self, Self::EphemeralSequential)
    }
}

/// Successful completion of a create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    /// Full path of the created znode (including any sequence suffix).
    pub path: String,
}

/// Successful completion of a get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    /// The znode payload.
    pub data: Bytes,
    /// Metadata at read time.
    pub stat: Stat,
}

/// Successful completion of a children listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildrenResponse {
    /// Child names (not full paths), in creation order.
    pub children: Vec<String>,
}

/// Successful completion of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetResponse {
    /// Metadata after the write; `version` is the new version.
    pub stat: Stat,
}

/// The kind of a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A child was created or deleted under the watched znode.
    ChildrenChanged,
    /// The watched znode's data changed.
    DataChanged,
    /// The watched znode was deleted.
    NodeDeleted,
}

/// A one-shot watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// What happened.
    pub kind: EventKind,
    /// Path of the znode the watch was installed on.
    pub path: String,
}

/// Completion callback for create operations.
pub(crate) type CreateCallback = Box<dyn FnOnce(Result<CreateResponse, CoordError>)>;
/// Completion callback for get operations.
pub(crate) type GetCallback = Box<dyn FnOnce(Result<GetResponse, CoordError>)>;
/// Completion callback for children listings.
pub(crate) type ChildrenCallback = Box<dyn FnOnce(Result<ChildrenResponse, CoordError>)>;
/// Completion callback for set operations.
pub(crate) type SetCallback = Box<dyn FnOnce(Result<SetResponse, CoordError>)>;
/// Completion callback for delete operations.
pub(crate) type DeleteCallback = Box<dyn FnOnce(Result<(), CoordError>)>;
/// One-shot watch callback.
pub(crate) type WatchCallback = Box<dyn FnOnce(WatchedEvent)>;
