//! Shoal Sharding - balanced shard assignment for a fleet of peers.
//!
//! A fixed universe of N numeric shards is assigned across the live members
//! of a fleet so that, at any stable point, every shard is owned by exactly
//! one live member and ownership is as balanced as possible. One member
//! holds a leader lease and writes assignments; every member (and any
//! read-only observer) can reconstruct a consistent view of the assignment
//! from the coordination store.
//!
//! # Layout
//!
//! Under a caller-supplied root:
//!
//! ```text
//! <root>/lock/                 lease contenders (ephemeral-sequential)
//! <root>/nodes/<member>        ephemeral presence, {"address":"host:port"}
//! <root>/assigns/<member>      persistent assignment, {"shards":[0,1,...]}
//! ```
//!
//! # Lifecycle
//!
//! Each session runs three phases: idempotent bootstrap of the container
//! znodes and the member's presence znode, then lease acquisition, then —
//! for the lease holder only — reconciliation of live members against
//! assignment records. An observer projection runs on every session
//! regardless of the lease.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod layout;
mod member;
mod observer;
mod reconciler;

pub use member::Member;
pub use observer::{ChangeEvent, Node, Observer};
pub use shoal_core::{MemberId, ShardId};
