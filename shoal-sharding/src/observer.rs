//! Observer projection: a read-only, eventually consistent view of the
//! assignment.
//!
//! The observer runs on every session, leader or not, and independently
//! reconstructs the member → (address, shards) map from the store. Because
//! it reads while the leader writes, it can see intermediate states where a
//! shard appears in two records; the projector resolves those by awarding
//! each shard to the claimant with the newest write. An event is emitted
//! only when the projection covers the whole shard universe and differs
//! from the previously emitted one.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use shoal_coord::{CoordError, EventKind, Session, SessionDriver};
use shoal_core::{MemberId, ShardId, SHARDS_MAX};

use crate::layout::{AssignData, PathLayout, PresenceData};

/// One member's slice of an emitted projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// The member owning the shards.
    pub id: MemberId,
    /// The member's advertised address.
    pub address: String,
    /// Owned shards, in stored payload order.
    pub shards: Vec<ShardId>,
    /// Logical timestamp of the member's last assignment write.
    pub mzxid: i64,
}

/// Emitted whenever the complete projection changes.
///
/// Both lists are sorted by member ID; `old` is empty for the first
/// emission of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The previously emitted projection.
    pub old: Vec<Node>,
    /// The projection that replaced it.
    pub new: Vec<Node>,
}

/// A standalone read-only observer of a deployment.
///
/// Attaches to the store like a member but creates nothing and never
/// contends for the lease.
pub struct Observer {
    driver: SessionDriver,
}

impl Observer {
    /// Creates an observer of the deployment rooted at `root`.
    ///
    /// # Panics
    /// Panics if `num_shards` is zero or exceeds
    /// [`SHARDS_MAX`](shoal_core::SHARDS_MAX).
    #[must_use]
    pub fn new(
        root: &str,
        num_shards: u32,
        on_change: impl FnMut(ChangeEvent) + 'static,
    ) -> Self {
        assert!(num_shards > 0, "num_shards must be positive");
        assert!(
            num_shards <= SHARDS_MAX,
            "num_shards {num_shards} exceeds {SHARDS_MAX}"
        );
        let core = ObserverCore::new(PathLayout::new(root), num_shards, Box::new(on_change));
        let driver = SessionDriver::new(move |sess| core.on_start(sess));
        Self { driver }
    }

    /// The opaque session driver, consumed by the coordination store.
    #[must_use]
    pub fn driver(&self) -> SessionDriver {
        self.driver.clone()
    }
}

/// What the observer knows about one member.
#[derive(Debug, Clone, Default)]
struct ObservedMember {
    /// Empty until the presence znode has been read.
    address: String,
    /// Shards in stored payload order.
    shards: Vec<ShardId>,
    /// Zero until the assignment znode has been read, and reset to zero
    /// when it is deleted.
    mzxid: i64,
}

#[derive(Default)]
struct ObserverState {
    members: BTreeMap<MemberId, ObservedMember>,
    /// The last emitted projection; survives session restarts so a new
    /// session does not re-emit an unchanged view.
    last: Vec<Node>,
}

/// Observer internals, shared by every callback of a session.
pub(crate) struct ObserverCore {
    layout: PathLayout,
    num_shards: u32,
    on_change: RefCell<Box<dyn FnMut(ChangeEvent)>>,
    state: RefCell<ObserverState>,
}

impl ObserverCore {
    pub(crate) fn new(
        layout: PathLayout,
        num_shards: u32,
        on_change: Box<dyn FnMut(ChangeEvent)>,
    ) -> Rc<Self> {
        Rc::new(Self {
            layout,
            num_shards,
            on_change: RefCell::new(on_change),
            state: RefCell::new(ObserverState::default()),
        })
    }

    /// Starts observation on a session. Per-session member state is
    /// rebuilt from scratch; the emission history is kept.
    pub(crate) fn on_start(self: &Rc<Self>, sess: &Session) {
        self.state.borrow_mut().members.clear();
        self.list_members(sess);
        self.list_assignments(sess);
    }

    fn list_members(self: &Rc<Self>, sess: &Session) {
        let core = Rc::clone(self);
        let watch_core = Rc::clone(self);
        let sess_cb = sess.clone();
        let watch_sess = sess.clone();
        let path = self.layout.nodes();
        sess.run(move |client| {
            client.children_w(
                &path,
                move |result| match result {
                    Ok(resp) => core.handle_member_children(&sess_cb, resp.children),
                    Err(CoordError::ConnectionClosed) => {
                        let core = Rc::clone(&core);
                        sess_cb.add_retry(move |s| core.list_members(s));
                    }
                    Err(err) => panic!("observer: list members: {err}"),
                },
                move |event| {
                    if event.kind == EventKind::ChildrenChanged {
                        watch_core.list_members(&watch_sess);
                    }
                },
            );
        });
    }

    fn handle_member_children(self: &Rc<Self>, sess: &Session, children: Vec<String>) {
        let members: Vec<MemberId> = children.into_iter().map(MemberId::new).collect();
        for member in &members {
            let known = {
                let mut state = self.state.borrow_mut();
                !state.members.entry(member.clone()).or_default().address.is_empty()
            };
            if !known {
                self.fetch_presence(sess, member.clone());
            }
        }
        self.forget_departed(&members, |info| info.address.clear());
    }

    fn fetch_presence(self: &Rc<Self>, sess: &Session, member: MemberId) {
        let core = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = self.layout.presence(&member);
        sess.run(move |client| {
            client.get(&path, move |result| match result {
                Ok(resp) => {
                    let presence = PresenceData::decode(&resp.data);
                    {
                        let mut state = core.state.borrow_mut();
                        state.members.entry(member).or_default().address = presence.address;
                    }
                    core.project();
                }
                // Gone again; the parent's child watch reconciles.
                Err(CoordError::NoNode) => {}
                Err(CoordError::ConnectionClosed) => {
                    let core = Rc::clone(&core);
                    sess_cb.add_retry(move |s| core.fetch_presence(s, member));
                }
                Err(err) => panic!("observer: read presence: {err}"),
            });
        });
    }

    fn list_assignments(self: &Rc<Self>, sess: &Session) {
        let core = Rc::clone(self);
        let watch_core = Rc::clone(self);
        let sess_cb = sess.clone();
        let watch_sess = sess.clone();
        let path = self.layout.assigns();
        sess.run(move |client| {
            client.children_w(
                &path,
                move |result| match result {
                    Ok(resp) => core.handle_assignment_children(&sess_cb, resp.children),
                    Err(CoordError::ConnectionClosed) => {
                        let core = Rc::clone(&core);
                        sess_cb.add_retry(move |s| core.list_assignments(s));
                    }
                    Err(err) => panic!("observer: list assignments: {err}"),
                },
                // Re-list on any event on the assignments container.
                move |_event| watch_core.list_assignments(&watch_sess),
            );
        });
    }

    fn handle_assignment_children(self: &Rc<Self>, sess: &Session, children: Vec<String>) {
        let members: Vec<MemberId> = children.into_iter().map(MemberId::new).collect();
        for member in &members {
            let known = {
                let mut state = self.state.borrow_mut();
                state.members.entry(member.clone()).or_default().mzxid > 0
            };
            if !known {
                self.fetch_assignment(sess, member.clone());
            }
        }
        self.forget_departed(&members, |info| info.mzxid = 0);
    }

    /// Reads a member's assignment with a data watch, re-arming on every
    /// data change.
    fn fetch_assignment(self: &Rc<Self>, sess: &Session, member: MemberId) {
        let core = Rc::clone(self);
        let watch_core = Rc::clone(self);
        let sess_cb = sess.clone();
        let watch_sess = sess.clone();
        let path = self.layout.assign(&member);
        let watch_member = member.clone();
        sess.run(move |client| {
            client.get_w(
                &path,
                move |result| match result {
                    Ok(resp) => {
                        let assign = AssignData::decode(&resp.data);
                        {
                            let mut state = core.state.borrow_mut();
                            let info = state.members.entry(member).or_default();
                            info.mzxid = resp.stat.mzxid;
                            info.shards = assign.shards;
                        }
                        core.project();
                    }
                    Err(CoordError::NoNode) => {}
                    Err(CoordError::ConnectionClosed) => {
                        let core = Rc::clone(&core);
                        sess_cb.add_retry(move |s| core.fetch_assignment(s, member));
                    }
                    Err(err) => panic!("observer: read assignment: {err}"),
                },
                move |event| match event.kind {
                    EventKind::DataChanged => {
                        watch_core.fetch_assignment(&watch_sess, watch_member);
                    }
                    EventKind::NodeDeleted => {
                        let mut state = watch_core.state.borrow_mut();
                        state.members.entry(watch_member).or_default().mzxid = 0;
                    }
                    EventKind::ChildrenChanged => {}
                },
            );
        });
    }

    /// Clears one facet of members missing from `live` and drops entries
    /// that have neither facet left.
    fn forget_departed(&self, live: &[MemberId], clear: impl Fn(&mut ObservedMember)) {
        let mut state = self.state.borrow_mut();
        let departed: Vec<MemberId> = state
            .members
            .keys()
            .filter(|member| !live.contains(*member))
            .cloned()
            .collect();
        for member in departed {
            let info = state.members.get_mut(&member).expect("key taken from map");
            clear(info);
            if info.address.is_empty() && info.mzxid == 0 {
                state.members.remove(&member);
            }
        }
    }

    /// Rebuilds the projection and emits a change event if it is complete
    /// and differs from the last emitted one.
    fn project(&self) {
        let new_list = {
            let state = self.state.borrow();

            // Award each claimed shard to the claimant with the newest
            // write; on a tie the later member ID wins. This collapses
            // intermediate states where a shard is claimed twice.
            let mut awards: HashMap<ShardId, (i64, MemberId)> = HashMap::new();
            for (member, info) in &state.members {
                if info.address.is_empty() || info.mzxid <= 0 {
                    continue;
                }
                for &shard in &info.shards {
                    match awards.get(&shard) {
                        Some((mzxid, _)) if *mzxid > info.mzxid => {}
                        _ => {
                            awards.insert(shard, (info.mzxid, member.clone()));
                        }
                    }
                }
            }

            // Incomplete projections are never emitted.
            if awards.len() < self.num_shards as usize {
                return;
            }

            let mut new_list = Vec::new();
            for (member, info) in &state.members {
                let shards: Vec<ShardId> = info
                    .shards
                    .iter()
                    .copied()
                    .filter(|shard| {
                        awards
                            .get(shard)
                            .is_some_and(|(_, winner)| winner == member)
                    })
                    .collect();
                if shards.is_empty() {
                    continue;
                }
                new_list.push(Node {
                    id: member.clone(),
                    address: info.address.clone(),
                    shards,
                    mzxid: info.mzxid,
                });
            }

            if new_list == state.last {
                return;
            }
            new_list
        };

        let old = {
            let mut state = self.state.borrow_mut();
            std::mem::replace(&mut state.last, new_list.clone())
        };
        tracing::debug!(members = new_list.len(), "projection changed");
        let mut on_change = self.on_change.borrow_mut();
        (*on_change)(ChangeEvent {
            old,
            new: new_list,
        });
    }
}
