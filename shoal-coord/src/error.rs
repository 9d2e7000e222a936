//! Coordination-store error taxonomy.

use thiserror::Error;

/// Errors a coordination-store operation can complete with.
///
/// These are the only error kinds the store surfaces to callers; everything
/// else (malformed paths, deleting a znode with children) is a harness
/// invariant and panics inside the simulated store.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoordError {
    /// The connection dropped before the operation was acknowledged.
    ///
    /// The session itself may still be alive; callers re-enqueue the step
    /// via [`crate::Session::add_retry`] and resume after reconnect.
    #[error("connection closed")]
    ConnectionClosed,

    /// A create found the znode already present.
    #[error("node already exists")]
    NodeExists,

    /// The znode (or its parent, for creates) does not exist.
    #[error("no node")]
    NoNode,

    /// A versioned set or delete lost a compare-and-swap race.
    #[error("version mismatch")]
    BadVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(CoordError::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(CoordError::BadVersion.to_string(), "version mismatch");
    }
}
