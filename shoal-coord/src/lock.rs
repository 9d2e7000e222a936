//! Leader election via sorted ephemeral-sequential znodes.
//!
//! Every contender creates an ephemeral-sequential child under the lock
//! znode, named `<member>-<seq>`. The contender with the lowest sequence
//! holds the lease; everyone else watches its immediate predecessor and
//! re-checks when that predecessor disappears. Release is implicit: session
//! expiry deletes the contender's znode.

use std::cell::RefCell;
use std::rc::Rc;

use shoal_core::MemberId;

use crate::error::CoordError;
use crate::session::{NextPhase, Session};
use crate::types::{CreateMode, EventKind};

/// A distributed leader lease over a lock znode.
///
/// [`LeaderLock::start`] begins acquisition on a session and invokes the
/// continuation exactly once per session that wins the lease. The lock holds
/// no store state of its own between sessions.
pub struct LeaderLock {
    lock_path: String,
    member_id: MemberId,
    state: RefCell<LockState>,
}

#[derive(Default)]
struct LockState {
    granted: bool,
}

impl LeaderLock {
    /// Creates a lock over `lock_path` for the given contender.
    pub fn new(lock_path: impl Into<String>, member_id: MemberId) -> Rc<Self> {
        Rc::new(Self {
            lock_path: lock_path.into(),
            member_id,
            state: RefCell::new(LockState::default()),
        })
    }

    /// Begins lease acquisition on this session.
    ///
    /// `next` runs exactly once if and when this session wins the lease.
    pub fn start(self: &Rc<Self>, sess: &Session, next: NextPhase) {
        self.state.replace(LockState { granted: false });
        self.list(sess, next);
    }

    /// Lists the contenders. Entry point for every (re)check.
    fn list(self: &Rc<Self>, sess: &Session, next: NextPhase) {
        let lock = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = self.lock_path.clone();
        sess.run(move |client| {
            client.children(&path, move |result| match result {
                Ok(resp) => lock.handle_children(&sess_cb, next, resp.children),
                Err(CoordError::ConnectionClosed) => {
                    let lock = Rc::clone(&lock);
                    sess_cb.add_retry(move |s| lock.list(s, Rc::clone(&next)));
                }
                Err(err) => panic!("leader lock: list contenders: {err}"),
            });
        });
    }

    fn handle_children(
        self: &Rc<Self>,
        sess: &Session,
        next: NextPhase,
        children: Vec<String>,
    ) {
        let prefix = format!("{}-", self.member_id);
        if children.iter().any(|c| c.starts_with(&prefix)) {
            self.rank(sess, next, children);
        } else {
            self.create_contender(sess, next);
        }
    }

    /// Creates this member's ephemeral-sequential contender znode.
    fn create_contender(self: &Rc<Self>, sess: &Session, next: NextPhase) {
        let lock = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = format!("{}/{}-", self.lock_path, self.member_id);
        sess.run(move |client| {
            client.create(
                &path,
                bytes::Bytes::new(),
                CreateMode::EphemeralSequential,
                move |result| match result {
                    Ok(_resp) => lock.list(&sess_cb, next),
                    Err(CoordError::ConnectionClosed) => {
                        let lock = Rc::clone(&lock);
                        sess_cb.add_retry(move |s| lock.list(s, Rc::clone(&next)));
                    }
                    Err(err) => panic!("leader lock: create contender: {err}"),
                },
            );
        });
    }

    /// Sorts contenders by sequence and either grants or watches the
    /// predecessor.
    fn rank(self: &Rc<Self>, sess: &Session, next: NextPhase, children: Vec<String>) {
        let mut contenders: Vec<(u64, String)> = children
            .into_iter()
            .map(|name| (parse_sequence(&name), name))
            .collect();
        contenders.sort_unstable();

        let prefix = format!("{}-", self.member_id);
        let own_index = contenders
            .iter()
            .position(|(_, name)| name.starts_with(&prefix))
            .expect("own contender znode disappeared while session alive");

        if own_index == 0 {
            self.grant(sess, &next);
            return;
        }

        let predecessor = format!("{}/{}", self.lock_path, contenders[own_index - 1].1);
        let lock = Rc::clone(self);
        let watch_lock = Rc::clone(self);
        let sess_cb = sess.clone();
        let watch_sess = sess.clone();
        let watch_next = Rc::clone(&next);
        sess.run(move |client| {
            client.get_w(
                &predecessor,
                move |result| match result {
                    // Predecessor alive: wait for the watch.
                    Ok(_resp) => {}
                    // Predecessor vanished between listing and read.
                    Err(CoordError::NoNode) => lock.list(&sess_cb, next),
                    Err(CoordError::ConnectionClosed) => {
                        let lock = Rc::clone(&lock);
                        sess_cb.add_retry(move |s| lock.list(s, Rc::clone(&next)));
                    }
                    Err(err) => panic!("leader lock: watch predecessor: {err}"),
                },
                move |event| {
                    if event.kind == EventKind::NodeDeleted {
                        watch_lock.list(&watch_sess, watch_next);
                    }
                },
            );
        });
    }

    fn grant(&self, sess: &Session, next: &NextPhase) {
        let mut state = self.state.borrow_mut();
        if state.granted {
            return;
        }
        state.granted = true;
        drop(state);
        tracing::info!(member = %self.member_id, "leader lock acquired");
        (**next)(sess);
    }
}

/// Extracts the numeric sequence suffix from a contender name.
///
/// # Panics
/// Panics on a name without a numeric suffix; only the lock writes under
/// the lock znode, so anything else is corruption.
fn parse_sequence(name: &str) -> u64 {
    name.rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or_else(|| panic!("malformed lock contender name: {name}"))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::session::SessionDriver;
    use crate::sim::SimStore;
    use crate::types::ClientId;

    use super::*;

    const C1: ClientId = ClientId::new("lock-c1");
    const C2: ClientId = ClientId::new("lock-c2");
    const C3: ClientId = ClientId::new("lock-c3");

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("node01-0000000003"), 3);
        assert_eq!(parse_sequence("ab-cd-0000000010"), 10);
    }

    #[test]
    #[should_panic(expected = "malformed lock contender name")]
    fn test_parse_sequence_rejects_garbage() {
        let _ = parse_sequence("garbage");
    }

    fn contender(
        store: &SimStore,
        client: ClientId,
        id: &'static str,
        granted: &Rc<RefCell<Vec<&'static str>>>,
    ) {
        let lock = LeaderLock::new("/lock", MemberId::new(id));
        let granted = Rc::clone(granted);
        let driver = SessionDriver::new(move |sess| {
            let granted = Rc::clone(&granted);
            lock.start(
                sess,
                Rc::new(move |_sess: &Session| granted.borrow_mut().push(id)),
            );
        });
        store.register(client, driver);
    }

    #[test]
    fn test_first_contender_wins() {
        let store = SimStore::new();
        store.seed_node("/lock");
        let granted = Rc::new(RefCell::new(Vec::new()));

        contender(&store, C1, "alpha", &granted);
        contender(&store, C2, "beta", &granted);
        store.begin(C1);
        store.begin(C2);
        store.drain_all();

        assert_eq!(*granted.borrow(), vec!["alpha"]);
        // Both contender znodes exist; beta is watching alpha's.
        let lock_node = store.read("/lock").unwrap();
        assert_eq!(
            lock_node.children,
            vec!["alpha-0000000000", "beta-0000000001"]
        );
    }

    #[test]
    fn test_handover_follows_sequence_order() {
        let store = SimStore::new();
        store.seed_node("/lock");
        let granted = Rc::new(RefCell::new(Vec::new()));

        contender(&store, C1, "alpha", &granted);
        contender(&store, C2, "beta", &granted);
        contender(&store, C3, "gamma", &granted);
        store.begin(C1);
        store.begin(C2);
        store.begin(C3);
        store.drain_all();
        assert_eq!(*granted.borrow(), vec!["alpha"]);

        // The middle contender dying promotes nobody.
        store.session_expired(C2);
        store.drain_all();
        assert_eq!(*granted.borrow(), vec!["alpha"]);

        // The holder dying promotes the next in sequence order.
        store.session_expired(C1);
        store.drain_all();
        assert_eq!(*granted.borrow(), vec!["alpha", "gamma"]);
    }

    #[test]
    fn test_connection_error_during_acquisition_is_retried() {
        let store = SimStore::new();
        store.seed_node("/lock");
        let granted = Rc::new(RefCell::new(Vec::new()));

        contender(&store, C1, "alpha", &granted);
        store.begin(C1);
        store.conn_error(C1);
        assert_eq!(store.pending_retries(C1), 1);

        store.retry(C1);
        store.drain_all();
        assert_eq!(*granted.borrow(), vec!["alpha"]);
    }
}
