//! Member facade: session lifecycle and idempotent bootstrap.
//!
//! Each session runs three chained phases:
//!
//! 1. bootstrap the container znodes and this member's ephemeral presence
//! 2. acquire the leader lease (the observer, if configured, starts here
//!    too, so it runs whether or not the lease is ever granted)
//! 3. reconcile assignments (lease holder only)
//!
//! Session expiry resets everything: a fresh session re-enters phase 1 with
//! fresh per-session state.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use bytes::Bytes;
use shoal_coord::lock::LeaderLock;
use shoal_coord::{CoordError, CreateMode, NextPhase, Session, SessionDriver};
use shoal_core::{MemberId, ShardId, SHARDS_MAX};

use crate::layout::{PathLayout, PresenceData};
use crate::observer::{ChangeEvent, ObserverCore};

/// A fleet member: one process participating in shard assignment.
///
/// Created with [`Member::new`]; the returned handle exposes only the
/// session driver, which the coordination store consumes to run the
/// member's lifecycle on every session.
pub struct Member {
    core: Rc<MemberCore>,
    driver: SessionDriver,
}

impl Member {
    /// Creates a member for the deployment rooted at `root`.
    ///
    /// `num_shards` is the fixed shard universe size N; every live fleet
    /// member must be configured with the same value.
    ///
    /// # Panics
    /// Panics if `num_shards` is zero or exceeds
    /// [`SHARDS_MAX`](shoal_core::SHARDS_MAX).
    #[must_use]
    pub fn new(
        root: &str,
        member_id: MemberId,
        num_shards: u32,
        address: impl Into<String>,
    ) -> Self {
        assert!(num_shards > 0, "num_shards must be positive");
        assert!(
            num_shards <= SHARDS_MAX,
            "num_shards {num_shards} exceeds {SHARDS_MAX}"
        );

        let layout = PathLayout::new(root);
        let lock = LeaderLock::new(layout.lock(), member_id.clone());
        let core = Rc::new(MemberCore {
            layout,
            member_id,
            num_shards,
            address: address.into(),
            lock,
            observer: RefCell::new(None),
            bootstrap_next: RefCell::new(None),
            state: RefCell::new(SessionState::default()),
        });

        let bootstrap = Rc::clone(&core);
        let lease = Rc::clone(&core);
        let leader = Rc::clone(&core);
        let driver = SessionDriver::chain(vec![
            Box::new(move |sess: &Session, next: NextPhase| bootstrap.begin_session(sess, next)),
            Box::new(move |sess: &Session, next: NextPhase| {
                lease.lock.start(sess, next);
                let observer = lease.observer.borrow().clone();
                if let Some(observer) = observer {
                    observer.on_start(sess);
                }
            }),
            Box::new(move |sess: &Session, _next: NextPhase| leader.leader_granted(sess)),
        ]);

        Self { core, driver }
    }

    /// Attaches an observer projection, invoked with coalesced assignment
    /// changes on every session of this member (leader or not).
    #[must_use]
    pub fn with_observer(self, on_change: impl FnMut(ChangeEvent) + 'static) -> Self {
        let observer = ObserverCore::new(
            self.core.layout.clone(),
            self.core.num_shards,
            Box::new(on_change),
        );
        *self.core.observer.borrow_mut() = Some(observer);
        self
    }

    /// The opaque session driver, consumed by the coordination store.
    #[must_use]
    pub fn driver(&self) -> SessionDriver {
        self.driver.clone()
    }

    /// This member's identifier.
    #[must_use]
    pub fn member_id(&self) -> &MemberId {
        &self.core.member_id
    }
}

/// Shared per-member state; every callback owns an `Rc` to this.
pub(crate) struct MemberCore {
    pub(crate) layout: PathLayout,
    pub(crate) member_id: MemberId,
    pub(crate) num_shards: u32,
    pub(crate) address: String,
    pub(crate) lock: Rc<LeaderLock>,
    pub(crate) observer: RefCell<Option<Rc<ObserverCore>>>,
    /// Continuation into the lease phase, installed at session start.
    bootstrap_next: RefCell<Option<NextPhase>>,
    pub(crate) state: RefCell<SessionState>,
}

/// Per-session mutable state, reset on every new session.
#[derive(Default)]
pub(crate) struct SessionState {
    lock_created: bool,
    nodes_created: bool,
    assigns_created: bool,
    leader_started: bool,

    /// Live members, sorted lexicographically.
    pub(crate) nodes: Vec<MemberId>,
    pub(crate) nodes_listed: bool,
    pub(crate) assigns_listed: bool,
    /// Assignment records as last observed by this leader.
    pub(crate) assigns: BTreeMap<MemberId, AssignRecord>,
}

/// One member's assignment record, with the version last observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AssignRecord {
    pub(crate) version: i32,
    pub(crate) shards: Vec<ShardId>,
}

/// Which bootstrap create completed.
#[derive(Clone, Copy)]
enum BootstrapStep {
    Lock,
    NodesContainer,
    Presence,
    Assigns,
}

impl MemberCore {
    /// Phase 1: reset per-session state and issue the three container
    /// creates in parallel.
    fn begin_session(self: &Rc<Self>, sess: &Session, next: NextPhase) {
        self.state.replace(SessionState::default());
        *self.bootstrap_next.borrow_mut() = Some(next);

        self.create_idempotent(
            sess,
            self.layout.lock(),
            Bytes::new(),
            CreateMode::Persistent,
            BootstrapStep::Lock,
        );
        self.create_idempotent(
            sess,
            self.layout.nodes(),
            Bytes::new(),
            CreateMode::Persistent,
            BootstrapStep::NodesContainer,
        );
        self.create_idempotent(
            sess,
            self.layout.assigns(),
            Bytes::new(),
            CreateMode::Persistent,
            BootstrapStep::Assigns,
        );
    }

    /// Creates a znode, treating "already exists" as success and retrying
    /// the same step after a connection loss. Anything else is fatal.
    fn create_idempotent(
        self: &Rc<Self>,
        sess: &Session,
        path: String,
        data: Bytes,
        mode: CreateMode,
        step: BootstrapStep,
    ) {
        let core = Rc::clone(self);
        let sess_cb = sess.clone();
        let retry_path = path.clone();
        let retry_data = data.clone();
        sess.run(move |client| {
            client.create(&path, data, mode, move |result| match result {
                Ok(_) | Err(CoordError::NodeExists) => core.bootstrap_step_done(&sess_cb, step),
                Err(CoordError::ConnectionClosed) => {
                    let core = Rc::clone(&core);
                    sess_cb.add_retry(move |s| {
                        core.create_idempotent(s, retry_path, retry_data, mode, step);
                    });
                }
                Err(err) => panic!("bootstrap create {retry_path}: {err}"),
            });
        });
    }

    fn bootstrap_step_done(self: &Rc<Self>, sess: &Session, step: BootstrapStep) {
        match step {
            BootstrapStep::Lock => {
                self.state.borrow_mut().lock_created = true;
                self.maybe_bootstrap_complete(sess);
            }
            BootstrapStep::NodesContainer => {
                // Container ready: announce our presence under it.
                let payload = PresenceData {
                    address: self.address.clone(),
                };
                self.create_idempotent(
                    sess,
                    self.layout.presence(&self.member_id),
                    payload.encode(),
                    CreateMode::Ephemeral,
                    BootstrapStep::Presence,
                );
            }
            BootstrapStep::Presence => {
                self.state.borrow_mut().nodes_created = true;
                self.maybe_bootstrap_complete(sess);
            }
            BootstrapStep::Assigns => {
                self.state.borrow_mut().assigns_created = true;
                self.maybe_bootstrap_complete(sess);
            }
        }
    }

    /// Advances to the lease phase exactly once, after all three signals.
    ///
    /// # Panics
    /// Panics if the phase would be entered twice in one session; that is a
    /// programming error, not a runtime failure mode.
    fn maybe_bootstrap_complete(self: &Rc<Self>, sess: &Session) {
        let mut state = self.state.borrow_mut();
        if !(state.lock_created && state.nodes_created && state.assigns_created) {
            return;
        }
        assert!(
            !state.leader_started,
            "lease phase re-entered within one session"
        );
        state.leader_started = true;
        drop(state);

        tracing::debug!(member = %self.member_id, "bootstrap complete");
        let next = self
            .bootstrap_next
            .borrow()
            .clone()
            .expect("bootstrap continuation installed at session start");
        (*next)(sess);
    }

    /// Phase 3: this session holds the lease.
    fn leader_granted(self: &Rc<Self>, sess: &Session) {
        tracing::info!(member = %self.member_id, "leader started");
        self.list_assigns(sess);
        self.list_active_nodes(sess);
    }
}
