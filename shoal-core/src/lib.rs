//! Shoal Core - Shared types for the Shoal shard coordinator.
//!
//! This crate holds the strongly-typed identifiers and explicit limits used
//! by every other Shoal crate. Keeping them here avoids a dependency cycle
//! between the coordination client and the sharding logic.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod limits;
mod types;

pub use limits::{MEMBER_ID_RANDOM_LEN, SHARDS_MAX};
pub use types::{MemberId, ShardId};
