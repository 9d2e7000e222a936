//! Shoal Coord - Coordination-store plumbing for the Shoal shard coordinator.
//!
//! This crate provides the client surface the sharding logic is written
//! against, plus the pieces that live below it:
//!
//! - `types` / `error`: operations, responses, watch events, and the error
//!   taxonomy of the hierarchical coordination store
//! - `session`: the single-threaded cooperative session driver (`run`,
//!   `add_retry`, chained session phases)
//! - `lock`: leader election via sorted ephemeral-sequential znodes
//! - `sim`: a deterministic in-memory store for simulation testing, driven
//!   step-by-step by the test harness
//!
//! # Design
//!
//! Every operation is asynchronous in the callback sense: issuing it returns
//! immediately and the completion callback runs on the session executor once
//! the store has applied it. Within a session, completions are delivered in
//! the order the store acknowledged them; session expiry cancels every
//! pending callback and watch of that session.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
pub mod lock;
mod session;
pub mod sim;
mod types;

pub use error::CoordError;
pub use session::{Client, NextPhase, Session, SessionDriver, SessionPhase};
pub use types::{
    ChildrenResponse, ClientId, CreateMode, CreateResponse, EventKind, GetResponse, SetResponse,
    Stat, WatchedEvent,
};
