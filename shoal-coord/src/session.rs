//! Session driver: the single-threaded cooperative executor every callback
//! runs on.
//!
//! A [`Session`] is one logical connection to the coordination store. All
//! per-session state in the layers above is touched only from callbacks the
//! session delivers, so no locking is needed anywhere. Expiry invalidates
//! the session: queued operations complete with
//! [`CoordError::ConnectionClosed`], retries are dropped, and installed
//! watches never fire again.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::error::CoordError;
use crate::sim::{self, Op, SimCore};
use crate::types::{
    ChildrenResponse, ClientId, CreateMode, CreateResponse, GetResponse, SetResponse, WatchedEvent,
};

pub(crate) type RetryFn = Box<dyn FnOnce(&Session)>;

/// A logical connection to the coordination store.
///
/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

struct SessionInner {
    client: ClientId,
    id: u64,
    store: Weak<RefCell<SimCore>>,
    expired: Cell<bool>,
    retries: RefCell<Vec<RetryFn>>,
}

impl Session {
    pub(crate) fn new(client: ClientId, id: u64, store: Weak<RefCell<SimCore>>) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                client,
                id,
                store,
                expired: Cell::new(false),
                retries: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Runs `f` on the session executor with an operation-issuing client.
    ///
    /// No-op once the session has expired.
    pub fn run(&self, f: impl FnOnce(&Client)) {
        if self.is_expired() {
            return;
        }
        let client = Client {
            sess: self.clone(),
        };
        f(&client);
    }

    /// Enqueues `f` to run after the next successful reconnect.
    ///
    /// Dropped without running if the session expires first.
    pub fn add_retry(&self, f: impl FnOnce(&Session) + 'static) {
        if self.is_expired() {
            return;
        }
        self.inner.retries.borrow_mut().push(Box::new(f));
    }

    /// Returns true once the session has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.inner.expired.get()
    }

    /// The store-assigned session ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The client this session belongs to.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.inner.client
    }

    pub(crate) fn store(&self) -> Weak<RefCell<SimCore>> {
        self.inner.store.clone()
    }

    pub(crate) fn expire(&self) {
        self.inner.expired.set(true);
        self.inner.retries.borrow_mut().clear();
    }

    pub(crate) fn take_retries(&self) -> Vec<RetryFn> {
        std::mem::take(&mut self.inner.retries.borrow_mut())
    }

    pub(crate) fn retry_count(&self) -> usize {
        self.inner.retries.borrow().len()
    }
}

/// Issues operations against the coordination store.
///
/// Obtained inside [`Session::run`]. Every method returns immediately; the
/// completion callback runs when the store applies the operation.
pub struct Client {
    sess: Session,
}

impl Client {
    /// Creates a znode.
    pub fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        cb: impl FnOnce(Result<CreateResponse, CoordError>) + 'static,
    ) {
        sim::enqueue(
            &self.sess,
            Op::Create {
                path: path.to_owned(),
                data,
                mode,
                cb: Box::new(cb),
            },
        );
    }

    /// Reads a znode's payload and metadata.
    pub fn get(&self, path: &str, cb: impl FnOnce(Result<GetResponse, CoordError>) + 'static) {
        sim::enqueue(
            &self.sess,
            Op::Get {
                path: path.to_owned(),
                watch: None,
                cb: Box::new(cb),
            },
        );
    }

    /// Reads a znode's payload and installs a one-shot data watch.
    ///
    /// The watch is installed only if the read succeeds; it fires once on
    /// the next data change or deletion of the znode.
    pub fn get_w(
        &self,
        path: &str,
        cb: impl FnOnce(Result<GetResponse, CoordError>) + 'static,
        watch: impl FnOnce(WatchedEvent) + 'static,
    ) {
        sim::enqueue(
            &self.sess,
            Op::Get {
                path: path.to_owned(),
                watch: Some(Box::new(watch)),
                cb: Box::new(cb),
            },
        );
    }

    /// Lists a znode's children.
    pub fn children(
        &self,
        path: &str,
        cb: impl FnOnce(Result<ChildrenResponse, CoordError>) + 'static,
    ) {
        sim::enqueue(
            &self.sess,
            Op::Children {
                path: path.to_owned(),
                watch: None,
                cb: Box::new(cb),
            },
        );
    }

    /// Lists a znode's children and installs a one-shot child watch.
    ///
    /// The watch fires once on the next child creation or deletion under
    /// the znode; each listing must re-install it.
    pub fn children_w(
        &self,
        path: &str,
        cb: impl FnOnce(Result<ChildrenResponse, CoordError>) + 'static,
        watch: impl FnOnce(WatchedEvent) + 'static,
    ) {
        sim::enqueue(
            &self.sess,
            Op::Children {
                path: path.to_owned(),
                watch: Some(Box::new(watch)),
                cb: Box::new(cb),
            },
        );
    }

    /// Writes a znode's payload, conditioned on its current version.
    pub fn set(
        &self,
        path: &str,
        data: Bytes,
        expected_version: i32,
        cb: impl FnOnce(Result<SetResponse, CoordError>) + 'static,
    ) {
        sim::enqueue(
            &self.sess,
            Op::Set {
                path: path.to_owned(),
                data,
                expected_version,
                cb: Box::new(cb),
            },
        );
    }

    /// Deletes a znode, conditioned on its current version.
    pub fn delete(
        &self,
        path: &str,
        expected_version: i32,
        cb: impl FnOnce(Result<(), CoordError>) + 'static,
    ) {
        sim::enqueue(
            &self.sess,
            Op::Delete {
                path: path.to_owned(),
                expected_version,
                cb: Box::new(cb),
            },
        );
    }
}

/// Continuation invoked by a session phase to hand control to the next one.
pub type NextPhase = Rc<dyn Fn(&Session)>;

/// One phase of a session lifecycle; decides when to call `next`.
pub type SessionPhase = Box<dyn Fn(&Session, NextPhase)>;

/// The entry point the store invokes for every new session of a client.
///
/// Built from a chain of phases: each new session runs phase 1 with a
/// continuation for phase 2, and so on. A phase that never calls `next`
/// (for example a lock that is never granted) simply stalls the chain for
/// that session; a fresh session restarts from phase 1.
#[derive(Clone)]
pub struct SessionDriver {
    begin: Rc<dyn Fn(&Session)>,
}

impl SessionDriver {
    /// A single-phase driver.
    pub fn new(phase: impl Fn(&Session) + 'static) -> Self {
        Self {
            begin: Rc::new(phase),
        }
    }

    /// Chains phases; each receives the next phase as its continuation.
    #[must_use]
    pub fn chain(phases: Vec<SessionPhase>) -> Self {
        let mut next: NextPhase = Rc::new(|_sess: &Session| {});
        for phase in phases.into_iter().rev() {
            let after = next;
            next = Rc::new(move |sess: &Session| phase(sess, Rc::clone(&after)));
        }
        Self { begin: next }
    }

    /// Starts the chain on a fresh session. Called by the store.
    pub fn start(&self, sess: &Session) {
        (*self.begin)(sess);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_chain_runs_phases_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        let l2 = Rc::clone(&log);
        let l3 = Rc::clone(&log);

        let driver = SessionDriver::chain(vec![
            Box::new(move |sess, next| {
                l1.borrow_mut().push("one");
                next(sess);
            }),
            Box::new(move |sess, next| {
                l2.borrow_mut().push("two");
                next(sess);
            }),
            Box::new(move |_sess, _next| {
                l3.borrow_mut().push("three");
            }),
        ]);

        let sess = Session::new(ClientId::new("test"), 1, Weak::new());
        driver.start(&sess);

        assert_eq!(*log.borrow(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_chain_stalls_until_next_is_called() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        let l2 = Rc::clone(&log);

        let driver = SessionDriver::chain(vec![
            Box::new(move |_sess, _next| {
                // Never calls next: second phase must not run.
                l1.borrow_mut().push("one");
            }),
            Box::new(move |_sess, _next| {
                l2.borrow_mut().push("two");
            }),
        ]);

        let sess = Session::new(ClientId::new("test"), 1, Weak::new());
        driver.start(&sess);

        assert_eq!(*log.borrow(), vec!["one"]);
    }

    #[test]
    fn test_expired_session_drops_run_and_retry() {
        let sess = Session::new(ClientId::new("test"), 1, Weak::new());
        sess.expire();

        let ran = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran);
        sess.run(move |_client| r.set(true));
        assert!(!ran.get());

        sess.add_retry(|_sess| {});
        assert_eq!(sess.retry_count(), 0);
    }
}
