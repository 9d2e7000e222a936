//! Deterministic in-memory coordination store for simulation testing.
//!
//! The simulated store is driven step-by-step by the test harness: issuing
//! an operation only queues it on the owning client, and nothing happens
//! until the harness applies it. This makes every interleaving of operation
//! completions, watch deliveries, connection errors, and session expiries
//! reproducible from the harness's action sequence alone.
//!
//! Semantics mirrored from the real store:
//!
//! - a global logical timestamp (zxid) advances on every successful write
//! - sets and deletes are compare-and-swap on the znode version
//! - watches are one-shot and are installed when the `*_w` read succeeds
//! - session expiry deletes the session's ephemerals (firing watches,
//!   including to the dying session) and then invalidates it: queued
//!   operations complete with `ConnectionClosed`, retries are dropped, and
//!   its watches never fire again

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::CoordError;
use crate::session::{Session, SessionDriver};
use crate::types::{
    ChildrenCallback, ChildrenResponse, ClientId, CreateCallback, CreateMode, CreateResponse,
    DeleteCallback, EventKind, GetCallback, GetResponse, SetCallback, SetResponse, Stat,
    WatchCallback, WatchedEvent,
};

/// Upper bound on drain iterations; exceeding it means the system under
/// test is not quiescing.
const DRAIN_STEPS_MAX: usize = 100_000;

/// First zxid handed out is 101: the counter starts here and every
/// successful write pre-increments it.
const ZXID_INITIAL: i64 = 100;

pub(crate) enum Op {
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
        cb: CreateCallback,
    },
    Get {
        path: String,
        watch: Option<WatchCallback>,
        cb: GetCallback,
    },
    Children {
        path: String,
        watch: Option<WatchCallback>,
        cb: ChildrenCallback,
    },
    Set {
        path: String,
        data: Bytes,
        expected_version: i32,
        cb: SetCallback,
    },
    Delete {
        path: String,
        expected_version: i32,
        cb: DeleteCallback,
    },
}

type Thunk = Box<dyn FnOnce()>;
type Firing = (Watch, WatchedEvent);

impl Op {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Get { .. } => "get",
            Self::Children { .. } => "children",
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
        }
    }

    /// Consumes the op, producing a thunk that delivers `err` to its
    /// completion callback. Any watch callback is dropped uninstalled.
    fn fail(self, err: CoordError) -> Thunk {
        match self {
            Self::Create { cb, .. } => Box::new(move || cb(Err(err))),
            Self::Get { cb, .. } => Box::new(move || cb(Err(err))),
            Self::Children { cb, .. } => Box::new(move || cb(Err(err))),
            Self::Set { cb, .. } => Box::new(move || cb(Err(err))),
            Self::Delete { cb, .. } => Box::new(move || cb(Err(err))),
        }
    }
}

struct QueuedOp {
    session: Session,
    op: Op,
}

struct Watch {
    session: Session,
    cb: WatchCallback,
}

struct Znode {
    name: String,
    data: Bytes,
    /// Owning session ID for ephemerals.
    owner: Option<u64>,
    czxid: i64,
    mzxid: i64,
    version: i32,
    /// Counter for sequential child names.
    next_seq: u64,
    /// In creation order.
    children: Vec<Znode>,
    child_watches: Vec<Watch>,
    data_watches: Vec<Watch>,
}

impl Znode {
    fn new(name: String, data: Bytes, owner: Option<u64>, zxid: i64) -> Self {
        Self {
            name,
            data,
            owner,
            czxid: zxid,
            mzxid: zxid,
            version: 0,
            next_seq: 0,
            children: Vec::new(),
            child_watches: Vec::new(),
            data_watches: Vec::new(),
        }
    }

    fn root() -> Self {
        Self::new(String::new(), Bytes::new(), None, 0)
    }
}

struct ClientSlot {
    id: ClientId,
    driver: SessionDriver,
    session: Option<Session>,
    queue: VecDeque<QueuedOp>,
}

pub(crate) struct SimCore {
    root: Znode,
    next_zxid: i64,
    next_session_id: u64,
    /// Registration order; drains walk this deterministically.
    clients: Vec<ClientSlot>,
}

/// Point-in-time view of a znode, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// The znode payload.
    pub data: Bytes,
    /// Current data version.
    pub version: i32,
    /// Creation zxid.
    pub czxid: i64,
    /// Last-modification zxid.
    pub mzxid: i64,
    /// True if the znode dies with its session.
    pub ephemeral: bool,
    /// Child names in creation order.
    pub children: Vec<String>,
}

/// The deterministic in-memory coordination store.
///
/// Single-threaded; shared via internal reference counting. Cloning the
/// handle shares the same store.
#[derive(Clone)]
pub struct SimStore {
    core: Rc<RefCell<SimCore>>,
}

impl Default for SimStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(SimCore {
                root: Znode::root(),
                next_zxid: ZXID_INITIAL,
                next_session_id: 1,
                clients: Vec::new(),
            })),
        }
    }

    /// Creates a persistent znode directly, for harness setup (e.g. the
    /// deployment root). Parents must already exist.
    ///
    /// # Panics
    /// Panics if the path is invalid or already present.
    pub fn seed_node(&self, path: &str) {
        let firings = {
            let mut core = self.core.borrow_mut();
            let (_, firings) = core
                .create_at(path, Bytes::new(), CreateMode::Persistent, None)
                .unwrap_or_else(|err| panic!("seed {path}: {err}"));
            firings
        };
        fire(firings);
    }

    /// Registers a client and the driver to run for each of its sessions.
    ///
    /// # Panics
    /// Panics if the client is already registered.
    pub fn register(&self, client: ClientId, driver: SessionDriver) {
        let mut core = self.core.borrow_mut();
        assert!(
            !core.clients.iter().any(|s| s.id == client),
            "client {client} already registered"
        );
        core.clients.push(ClientSlot {
            id: client,
            driver,
            session: None,
            queue: VecDeque::new(),
        });
    }

    /// Starts a new session for the client and runs its driver chain.
    ///
    /// # Panics
    /// Panics if the client still has a live session.
    pub fn begin(&self, client: ClientId) {
        let (session, driver) = {
            let mut core = self.core.borrow_mut();
            let id = core.next_session_id;
            core.next_session_id += 1;
            let weak = Rc::downgrade(&self.core);
            let slot = core.slot_mut(client);
            if let Some(old) = slot.session.take() {
                assert!(old.is_expired(), "client {client} already has a live session");
            }
            // Undelivered callbacks of a dead session are dropped here.
            slot.queue.clear();
            let session = Session::new(client, id, weak);
            slot.session = Some(session.clone());
            (session, slot.driver.clone())
        };
        driver.start(&session);
    }

    /// Applies the next queued operation, asserting it is a create.
    pub fn create_apply(&self, client: ClientId) {
        self.apply_internal(client, Some("create"));
    }

    /// Applies the next queued operation, asserting it is a get.
    pub fn get_apply(&self, client: ClientId) {
        self.apply_internal(client, Some("get"));
    }

    /// Applies the next queued operation, asserting it is a children listing.
    pub fn children_apply(&self, client: ClientId) {
        self.apply_internal(client, Some("children"));
    }

    /// Applies the next queued operation, asserting it is a set.
    pub fn set_apply(&self, client: ClientId) {
        self.apply_internal(client, Some("set"));
    }

    /// Applies the next queued operation, asserting it is a delete.
    pub fn delete_apply(&self, client: ClientId) {
        self.apply_internal(client, Some("delete"));
    }

    /// Applies the next queued operation of any kind.
    pub fn apply_next(&self, client: ClientId) {
        self.apply_internal(client, None);
    }

    /// Kinds of the client's queued operations, front first.
    #[must_use]
    pub fn pending_ops(&self, client: ClientId) -> Vec<&'static str> {
        let core = self.core.borrow();
        core.slot(client).queue.iter().map(|q| q.op.kind_name()).collect()
    }

    /// Number of queued operations for the client.
    #[must_use]
    pub fn pending_count(&self, client: ClientId) -> usize {
        self.core.borrow().slot(client).queue.len()
    }

    /// Number of retry continuations waiting for a reconnect.
    #[must_use]
    pub fn pending_retries(&self, client: ClientId) -> usize {
        let core = self.core.borrow();
        core.slot(client)
            .session
            .as_ref()
            .map_or(0, Session::retry_count)
    }

    /// Fails every queued operation of the client with `ConnectionClosed`.
    ///
    /// The session stays alive; handlers typically re-enqueue their step via
    /// [`Session::add_retry`], to be resumed by [`Self::retry`].
    pub fn conn_error(&self, client: ClientId) {
        let ops: Vec<Op> = {
            let mut core = self.core.borrow_mut();
            core.slot_mut(client).queue.drain(..).map(|q| q.op).collect()
        };
        for op in ops {
            op.fail(CoordError::ConnectionClosed)();
        }
    }

    /// Simulates a successful reconnect: runs the session's retry queue.
    pub fn retry(&self, client: ClientId) {
        let session = {
            let core = self.core.borrow();
            core.slot(client)
                .session
                .clone()
                .unwrap_or_else(|| panic!("client {client} has no session"))
        };
        if session.is_expired() {
            return;
        }
        for retry in session.take_retries() {
            retry(&session);
        }
    }

    /// Expires the client's session: deletes its ephemerals (firing watches,
    /// including to the dying session) and then invalidates it.
    ///
    /// # Panics
    /// Panics if the client has no live session.
    pub fn session_expired(&self, client: ClientId) {
        let (session, firings) = {
            let mut core = self.core.borrow_mut();
            let session = core
                .slot(client)
                .session
                .clone()
                .unwrap_or_else(|| panic!("client {client} has no session"));
            assert!(!session.is_expired(), "client {client} session already expired");

            let mut paths = Vec::new();
            collect_ephemerals(&core.root, "", session.id(), &mut paths);
            let mut firings = Vec::new();
            for path in &paths {
                let fired = core
                    .delete_at(path, None)
                    .unwrap_or_else(|err| panic!("expire {path}: {err}"));
                firings.extend(fired);
            }
            (session, firings)
        };
        fire(firings);
        session.expire();
    }

    /// Applies the client's queued operations until its queue is empty.
    ///
    /// # Panics
    /// Panics if the client does not quiesce within the step budget.
    pub fn drain(&self, client: ClientId) {
        for _ in 0..DRAIN_STEPS_MAX {
            if self.pending_count(client) == 0 {
                return;
            }
            self.apply_next(client);
        }
        panic!("client {client} did not quiesce within {DRAIN_STEPS_MAX} steps");
    }

    /// Applies queued operations across all clients (registration order)
    /// until every queue is empty.
    ///
    /// # Panics
    /// Panics if the system does not quiesce within the step budget.
    pub fn drain_all(&self) {
        for _ in 0..DRAIN_STEPS_MAX {
            let next = {
                let core = self.core.borrow();
                core.clients
                    .iter()
                    .find(|s| !s.queue.is_empty())
                    .map(|s| s.id)
            };
            let Some(client) = next else { return };
            self.apply_next(client);
        }
        panic!("store did not quiesce within {DRAIN_STEPS_MAX} steps");
    }

    /// Reads a znode for test assertions.
    #[must_use]
    pub fn read(&self, path: &str) -> Option<NodeSnapshot> {
        let core = self.core.borrow();
        find(&core.root, path).map(|node| NodeSnapshot {
            data: node.data.clone(),
            version: node.version,
            czxid: node.czxid,
            mzxid: node.mzxid,
            ephemeral: node.owner.is_some(),
            children: node.children.iter().map(|c| c.name.clone()).collect(),
        })
    }

    fn apply_internal(&self, client: ClientId, expect: Option<&'static str>) {
        let (thunk, firings) = {
            let mut core = self.core.borrow_mut();
            let qop = core
                .slot_mut(client)
                .queue
                .pop_front()
                .unwrap_or_else(|| panic!("client {client} has no pending calls"));
            if let Some(expected) = expect {
                let actual = qop.op.kind_name();
                assert_eq!(
                    actual, expected,
                    "client {client}: next pending call is {actual}, expected {expected}"
                );
            }
            if qop.session.is_expired() {
                (qop.op.fail(CoordError::ConnectionClosed), Vec::new())
            } else {
                core.apply_op(&qop.session, qop.op)
            }
        };
        thunk();
        fire(firings);
    }
}

/// Delivers watch events, skipping sessions that expired since firing.
fn fire(firings: Vec<Firing>) {
    for (watch, event) in firings {
        if !watch.session.is_expired() {
            (watch.cb)(event);
        }
    }
}

impl SimCore {
    fn slot(&self, client: ClientId) -> &ClientSlot {
        self.clients
            .iter()
            .find(|s| s.id == client)
            .unwrap_or_else(|| panic!("unknown client {client}"))
    }

    fn slot_mut(&mut self, client: ClientId) -> &mut ClientSlot {
        self.clients
            .iter_mut()
            .find(|s| s.id == client)
            .unwrap_or_else(|| panic!("unknown client {client}"))
    }

    fn apply_op(&mut self, session: &Session, op: Op) -> (Thunk, Vec<Firing>) {
        match op {
            Op::Create {
                path,
                data,
                mode,
                cb,
            } => {
                let owner = mode.is_ephemeral().then(|| session.id());
                match self.create_at(&path, data, mode, owner) {
                    Ok((created, firings)) => (
                        Box::new(move || cb(Ok(CreateResponse { path: created }))),
                        firings,
                    ),
                    Err(err) => (Box::new(move || cb(Err(err))), Vec::new()),
                }
            }
            Op::Get { path, watch, cb } => match find_mut(&mut self.root, &path) {
                None => (Box::new(move || cb(Err(CoordError::NoNode))), Vec::new()),
                Some(node) => {
                    let resp = GetResponse {
                        data: node.data.clone(),
                        stat: stat_of(node),
                    };
                    if let Some(watch_cb) = watch {
                        node.data_watches.push(Watch {
                            session: session.clone(),
                            cb: watch_cb,
                        });
                    }
                    (Box::new(move || cb(Ok(resp))), Vec::new())
                }
            },
            Op::Children { path, watch, cb } => match find_mut(&mut self.root, &path) {
                None => (Box::new(move || cb(Err(CoordError::NoNode))), Vec::new()),
                Some(node) => {
                    let resp = ChildrenResponse {
                        children: node.children.iter().map(|c| c.name.clone()).collect(),
                    };
                    if let Some(watch_cb) = watch {
                        node.child_watches.push(Watch {
                            session: session.clone(),
                            cb: watch_cb,
                        });
                    }
                    (Box::new(move || cb(Ok(resp))), Vec::new())
                }
            },
            Op::Set {
                path,
                data,
                expected_version,
                cb,
            } => match self.set_at(&path, data, expected_version) {
                Ok((stat, firings)) => (Box::new(move || cb(Ok(SetResponse { stat }))), firings),
                Err(err) => (Box::new(move || cb(Err(err))), Vec::new()),
            },
            Op::Delete {
                path,
                expected_version,
                cb,
            } => match self.delete_at(&path, Some(expected_version)) {
                Ok(firings) => (Box::new(move || cb(Ok(()))), firings),
                Err(err) => (Box::new(move || cb(Err(err))), Vec::new()),
            },
        }
    }

    fn create_at(
        &mut self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        owner: Option<u64>,
    ) -> Result<(String, Vec<Firing>), CoordError> {
        let (parent_path, base) = split_parent(path);
        assert!(!base.is_empty(), "create: empty znode name in {path}");

        {
            let Some(parent) = find(&self.root, parent_path) else {
                return Err(CoordError::NoNode);
            };
            if !mode.is_sequential() && parent.children.iter().any(|c| c.name == base) {
                return Err(CoordError::NodeExists);
            }
        }

        self.next_zxid += 1;
        let zxid = self.next_zxid;
        let parent = find_mut(&mut self.root, parent_path).expect("parent checked above");

        let name = if mode.is_sequential() {
            let seq = parent.next_seq;
            parent.next_seq += 1;
            format!("{base}{seq:010}")
        } else {
            base.to_owned()
        };

        parent.children.push(Znode::new(name.clone(), data, owner, zxid));
        let firings = take_watches(
            &mut parent.child_watches,
            EventKind::ChildrenChanged,
            parent_path,
        );
        Ok((format!("{parent_path}/{name}"), firings))
    }

    fn set_at(
        &mut self,
        path: &str,
        data: Bytes,
        expected_version: i32,
    ) -> Result<(Stat, Vec<Firing>), CoordError> {
        {
            let Some(node) = find(&self.root, path) else {
                return Err(CoordError::NoNode);
            };
            if node.version != expected_version {
                return Err(CoordError::BadVersion);
            }
        }

        self.next_zxid += 1;
        let zxid = self.next_zxid;
        let node = find_mut(&mut self.root, path).expect("node checked above");
        node.data = data;
        node.version += 1;
        node.mzxid = zxid;
        let stat = stat_of(node);
        let firings = take_watches(&mut node.data_watches, EventKind::DataChanged, path);
        Ok((stat, firings))
    }

    /// Deletes a znode. `expected_version: None` skips the CAS check
    /// (ephemeral cleanup on expiry).
    fn delete_at(
        &mut self,
        path: &str,
        expected_version: Option<i32>,
    ) -> Result<Vec<Firing>, CoordError> {
        {
            let Some(node) = find(&self.root, path) else {
                return Err(CoordError::NoNode);
            };
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(CoordError::BadVersion);
                }
            }
            assert!(
                node.children.is_empty(),
                "delete: znode {path} still has children"
            );
        }

        self.next_zxid += 1;
        let (parent_path, base) = split_parent(path);
        let parent = find_mut(&mut self.root, parent_path).expect("parent of existing node");
        let index = parent
            .children
            .iter()
            .position(|c| c.name == base)
            .expect("node checked above");
        let mut node = parent.children.remove(index);

        let mut firings = take_watches(&mut node.data_watches, EventKind::NodeDeleted, path);
        firings.extend(take_watches(
            &mut parent.child_watches,
            EventKind::ChildrenChanged,
            parent_path,
        ));
        Ok(firings)
    }
}

fn stat_of(node: &Znode) -> Stat {
    Stat {
        czxid: node.czxid,
        mzxid: node.mzxid,
        version: node.version,
    }
}

fn take_watches(watches: &mut Vec<Watch>, kind: EventKind, path: &str) -> Vec<Firing> {
    std::mem::take(watches)
        .into_iter()
        .map(|watch| {
            (
                watch,
                WatchedEvent {
                    kind,
                    path: path.to_owned(),
                },
            )
        })
        .collect()
}

/// Splits an absolute path into (parent path, last segment).
fn split_parent(path: &str) -> (&str, &str) {
    assert!(path.starts_with('/'), "path must be absolute: {path}");
    let idx = path.rfind('/').expect("checked above");
    (&path[..idx], &path[idx + 1..])
}

fn find<'a>(root: &'a Znode, path: &str) -> Option<&'a Znode> {
    let mut current = root;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = current.children.iter().find(|c| c.name == segment)?;
    }
    Some(current)
}

fn find_mut<'a>(root: &'a mut Znode, path: &str) -> Option<&'a mut Znode> {
    let mut current = root;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = current.children.iter_mut().find(|c| c.name == segment)?;
    }
    Some(current)
}

/// Collects paths of ephemerals owned by `session_id`, preorder.
fn collect_ephemerals(node: &Znode, path: &str, session_id: u64, out: &mut Vec<String>) {
    for child in &node.children {
        let child_path = format!("{path}/{}", child.name);
        if child.owner == Some(session_id) {
            out.push(child_path.clone());
        }
        collect_ephemerals(child, &child_path, session_id, out);
    }
}

/// Queues an operation on the session's client. No-op if the store is gone.
pub(crate) fn enqueue(sess: &Session, op: Op) {
    let Some(core) = sess.store().upgrade() else {
        return;
    };
    let mut core = core.borrow_mut();
    let slot = core.slot_mut(sess.client_id());
    slot.queue.push_back(QueuedOp {
        session: sess.clone(),
        op,
    });
}
