//! Leader reconciler: balances shard ownership across live members.
//!
//! The reconciler runs only on the session that holds the leader lease. Its
//! two inputs are the live-member listing (`/nodes`, watched) and the
//! assignment records (`/assigns/*`, re-read on demand). Whenever both are
//! available it computes a balanced target allocation and applies the
//! difference as versioned writes.
//!
//! # Rounds
//!
//! Every write belongs to a round, tracked by a [`RoundCounter`]. When the
//! last write of a round completes, the round decides what happens next:
//!
//! - all writes succeeded: reconcile again (a stable state reconciles to a
//!   no-op, so this converges)
//! - some write lost a CAS race or hit a missing/extra znode: the local map
//!   is stale; re-list `/assigns` and rebuild it
//! - a connection dropped: re-list `/assigns` after the next reconnect
//!
//! A round that issues no writes leaves the reconciler idle until the next
//! `/nodes` watch fires.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use shoal_coord::{CoordError, CreateMode, EventKind, Session};
use shoal_core::{MemberId, ShardId};

use crate::layout::AssignData;
use crate::member::{AssignRecord, MemberCore};

/// What a draining round does next, in escalation order: later variants
/// override earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DrainAction {
    /// Base action of a listing round: mark `/assigns` listed and try to
    /// reconcile.
    AssignsListed,
    /// Base action of a write round: reconcile again.
    Reconcile,
    /// The local map went stale; re-list `/assigns` immediately.
    RelistAssigns,
    /// Connection lost; re-list `/assigns` after the next reconnect.
    RetryRelist,
}

/// Tracks the outstanding operations of one round and dispatches the
/// drain action when the last one completes.
struct RoundCounter {
    core: Rc<MemberCore>,
    count: Cell<i32>,
    action: Cell<DrainAction>,
}

impl RoundCounter {
    fn new(core: Rc<MemberCore>, base: DrainAction) -> Rc<Self> {
        Rc::new(Self {
            core,
            count: Cell::new(0),
            action: Cell::new(base),
        })
    }

    fn begin(&self) {
        self.count.set(self.count.get() + 1);
    }

    /// Escalates the drain action; never downgrades.
    fn escalate(&self, action: DrainAction) {
        self.action.set(self.action.get().max(action));
    }

    fn finish(&self, sess: &Session) {
        let remaining = self.count.get() - 1;
        self.count.set(remaining);
        if remaining > 0 {
            return;
        }
        match self.action.get() {
            DrainAction::AssignsListed => self.core.assigns_list_complete(sess),
            DrainAction::Reconcile => self.core.reconcile(sess),
            DrainAction::RelistAssigns => self.core.list_assigns(sess),
            DrainAction::RetryRelist => {
                let core = Rc::clone(&self.core);
                sess.add_retry(move |s| core.list_assigns(s));
            }
        }
    }
}

impl MemberCore {
    /// Lists `/assigns` and reads every record, rebuilding the local map.
    pub(crate) fn list_assigns(self: &Rc<Self>, sess: &Session) {
        let core = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = self.layout.assigns();
        sess.run(move |client| {
            client.children(&path, move |result| match result {
                Ok(resp) => {
                    let counter = RoundCounter::new(Rc::clone(&core), DrainAction::AssignsListed);
                    // Guard against draining before every read is issued.
                    counter.begin();
                    for child in resp.children {
                        core.fetch_assign_record(
                            &sess_cb,
                            MemberId::new(child),
                            Rc::clone(&counter),
                        );
                    }
                    counter.finish(&sess_cb);
                }
                Err(CoordError::ConnectionClosed) => {
                    let core = Rc::clone(&core);
                    sess_cb.add_retry(move |s| core.list_assigns(s));
                }
                Err(err) => panic!("list assignments: {err}"),
            });
        });
    }

    fn fetch_assign_record(
        self: &Rc<Self>,
        sess: &Session,
        member: MemberId,
        counter: Rc<RoundCounter>,
    ) {
        counter.begin();
        let core = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = self.layout.assign(&member);
        sess.run(move |client| {
            client.get(&path, move |result| {
                match result {
                    Ok(resp) => {
                        let assign = AssignData::decode(&resp.data);
                        core.put_assign_record(&member, resp.stat.version, assign.shards);
                    }
                    Err(CoordError::ConnectionClosed) => {
                        counter.escalate(DrainAction::RetryRelist);
                    }
                    // Deleted between listing and read; the next round
                    // will not see it either.
                    Err(CoordError::NoNode) => {}
                    Err(err) => panic!("read assignment of {member}: {err}"),
                }
                counter.finish(&sess_cb);
            });
        });
    }

    /// Remembers a record, ignoring out-of-order completions: the session
    /// executor does not order completions across different paths, so an
    /// older version may arrive after a newer one.
    fn put_assign_record(&self, member: &MemberId, version: i32, shards: Vec<ShardId>) {
        let mut state = self.state.borrow_mut();
        if let Some(existing) = state.assigns.get(member) {
            if existing.version > version {
                tracing::warn!(member = %member, version, "stale assignment response ignored");
                return;
            }
        }
        state
            .assigns
            .insert(member.clone(), AssignRecord { version, shards });
    }

    fn assigns_list_complete(self: &Rc<Self>, sess: &Session) {
        self.state.borrow_mut().assigns_listed = true;
        self.maybe_reconcile(sess);
    }

    /// Lists `/nodes` with a child watch; the watch re-enters this, so the
    /// reconciler sees every membership change.
    pub(crate) fn list_active_nodes(self: &Rc<Self>, sess: &Session) {
        let core = Rc::clone(self);
        let watch_core = Rc::clone(self);
        let sess_cb = sess.clone();
        let watch_sess = sess.clone();
        let path = self.layout.nodes();
        sess.run(move |client| {
            client.children_w(
                &path,
                move |result| match result {
                    Ok(resp) => {
                        let mut nodes: Vec<MemberId> =
                            resp.children.into_iter().map(MemberId::new).collect();
                        nodes.sort_unstable();
                        {
                            let mut state = core.state.borrow_mut();
                            state.nodes = nodes;
                            state.nodes_listed = true;
                        }
                        core.maybe_reconcile(&sess_cb);
                    }
                    Err(CoordError::ConnectionClosed) => {
                        let core = Rc::clone(&core);
                        sess_cb.add_retry(move |s| core.list_active_nodes(s));
                    }
                    Err(err) => panic!("list active members: {err}"),
                },
                move |event| {
                    if event.kind == EventKind::ChildrenChanged {
                        watch_core.list_active_nodes(&watch_sess);
                    }
                },
            );
        });
    }

    fn maybe_reconcile(self: &Rc<Self>, sess: &Session) {
        {
            let state = self.state.borrow();
            if !(state.nodes_listed && state.assigns_listed) {
                return;
            }
        }
        self.reconcile(sess);
    }

    /// One reconciliation round: computes the balanced target and issues
    /// the differing writes. A no-op plan leaves the reconciler idle.
    pub(crate) fn reconcile(self: &Rc<Self>, sess: &Session) {
        let plan = {
            let state = self.state.borrow();
            compute_plan(self.num_shards, &state.nodes, &state.assigns)
        };
        let Some(plan) = plan else {
            return;
        };

        let counter = RoundCounter::new(Rc::clone(self), DrainAction::Reconcile);
        for update in plan.updates {
            self.apply_update(sess, update, &counter);
        }
        for member in plan.removals {
            self.remove_assignment(sess, member, &counter);
        }
    }

    fn apply_update(
        self: &Rc<Self>,
        sess: &Session,
        update: AssignmentUpdate,
        counter: &Rc<RoundCounter>,
    ) {
        let existing = self
            .state
            .borrow()
            .assigns
            .get(&update.member)
            .map(|record| record.version);
        match existing {
            None => self.create_assignment(sess, update, Rc::clone(counter)),
            Some(version) => self.set_assignment(sess, update, version, Rc::clone(counter)),
        }
    }

    fn create_assignment(
        self: &Rc<Self>,
        sess: &Session,
        update: AssignmentUpdate,
        counter: Rc<RoundCounter>,
    ) {
        counter.begin();
        let core = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = self.layout.assign(&update.member);
        let data = AssignData {
            shards: update.shards.clone(),
        }
        .encode();
        let AssignmentUpdate { member, shards } = update;
        tracing::debug!(member = %member, ?shards, "creating assignment");
        sess.run(move |client| {
            client.create(&path, data, CreateMode::Persistent, move |result| {
                match result {
                    Ok(_) => core.put_assign_record(&member, 0, shards),
                    Err(err) => core.write_failed(err, &member, &counter),
                }
                counter.finish(&sess_cb);
            });
        });
    }

    fn set_assignment(
        self: &Rc<Self>,
        sess: &Session,
        update: AssignmentUpdate,
        expected_version: i32,
        counter: Rc<RoundCounter>,
    ) {
        counter.begin();
        let core = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = self.layout.assign(&update.member);
        let data = AssignData {
            shards: update.shards.clone(),
        }
        .encode();
        let AssignmentUpdate { member, shards } = update;
        tracing::debug!(member = %member, ?shards, expected_version, "updating assignment");
        sess.run(move |client| {
            client.set(&path, data, expected_version, move |result| {
                match result {
                    Ok(resp) => core.put_assign_record(&member, resp.stat.version, shards),
                    Err(err) => core.write_failed(err, &member, &counter),
                }
                counter.finish(&sess_cb);
            });
        });
    }

    fn remove_assignment(
        self: &Rc<Self>,
        sess: &Session,
        member: MemberId,
        counter: &Rc<RoundCounter>,
    ) {
        counter.begin();
        let counter = Rc::clone(counter);
        let core = Rc::clone(self);
        let sess_cb = sess.clone();
        let path = self.layout.assign(&member);
        let expected_version = self
            .state
            .borrow()
            .assigns
            .get(&member)
            .map_or(0, |record| record.version);
        tracing::debug!(member = %member, "removing assignment of departed member");
        sess.run(move |client| {
            client.delete(&path, expected_version, move |result| {
                match result {
                    Ok(()) => {
                        core.state.borrow_mut().assigns.remove(&member);
                    }
                    Err(err) => core.write_failed(err, &member, &counter),
                }
                counter.finish(&sess_cb);
            });
        });
    }

    /// Handles a failed assignment write. Every failure abandons the rest
    /// of the round's effect and schedules recovery via the counter.
    fn write_failed(&self, err: CoordError, member: &MemberId, counter: &RoundCounter) {
        match err {
            CoordError::ConnectionClosed => counter.escalate(DrainAction::RetryRelist),
            CoordError::NoNode => {
                // The record vanished under us; forget it and rebuild.
                self.state.borrow_mut().assigns.remove(member);
                tracing::warn!(member = %member, "assignment gone; scheduling re-list");
                counter.escalate(DrainAction::RelistAssigns);
            }
            CoordError::BadVersion | CoordError::NodeExists => {
                tracing::warn!(member = %member, error = %err, "assignment write raced; scheduling re-list");
                counter.escalate(DrainAction::RelistAssigns);
            }
        }
    }
}

/// A differing assignment to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AssignmentUpdate {
    pub(crate) member: MemberId,
    /// Retained shards (ascending) followed by filled shards (ascending).
    pub(crate) shards: Vec<ShardId>,
}

/// The writes one reconciliation round must issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AssignmentPlan {
    /// Changed assignments, in priority order.
    pub(crate) updates: Vec<AssignmentUpdate>,
    /// Records of departed members, ascending.
    pub(crate) removals: Vec<MemberId>,
}

/// Computes the balanced target allocation, deterministically.
///
/// With `n` live members, every member targets `N/n` or `⌈N/n⌉` shards, and
/// exactly `N mod n` members get the larger count. Members are prioritized
/// by descending current ownership (ties lexicographic) so that reshuffles
/// are minimal: first every member retains up to its target from its
/// current shards (a shard claimed by a higher-priority member is freed
/// from lower-priority ones), then members still under target fill from the
/// unclaimed pool, smallest shard IDs first.
///
/// Returns `None` when no members are live.
pub(crate) fn compute_plan(
    num_shards: u32,
    nodes: &[MemberId],
    current: &BTreeMap<MemberId, AssignRecord>,
) -> Option<AssignmentPlan> {
    if nodes.is_empty() {
        return None;
    }
    let n = u32::try_from(nodes.len()).expect("member count fits in u32");
    let min_per = num_shards / n;
    let num_max = (num_shards - min_per * n) as usize;

    // Priority: descending current ownership, stable on the (sorted) input.
    let mut priority: Vec<&MemberId> = nodes.iter().collect();
    priority.sort_by_key(|member| {
        std::cmp::Reverse(current.get(*member).map_or(0, |record| record.shards.len()))
    });

    struct Slot<'a> {
        member: &'a MemberId,
        target: usize,
        kept: Vec<ShardId>,
        /// Retention already forced a write (truncation).
        write: bool,
        old_sorted: Vec<ShardId>,
    }

    // Pass 1: retention. Walk members in priority order, keeping up to
    // `target` of each member's current shards that nobody above claimed.
    let mut allocated = vec![false; num_shards as usize];
    let mut slots: Vec<Slot<'_>> = Vec::with_capacity(priority.len());
    for (index, member) in priority.into_iter().enumerate() {
        let target = if index < num_max {
            (min_per + 1) as usize
        } else {
            min_per as usize
        };
        let old: &[ShardId] = current.get(member).map_or(&[], |record| &record.shards);
        let mut kept: Vec<ShardId> = old
            .iter()
            .copied()
            .filter(|shard| !allocated[shard.get() as usize])
            .collect();
        kept.sort_unstable();
        let mut write = false;
        if kept.len() > target {
            kept.truncate(target);
            write = true;
        }
        for shard in &kept {
            allocated[shard.get() as usize] = true;
        }
        let mut old_sorted = old.to_vec();
        old_sorted.sort_unstable();
        slots.push(Slot {
            member,
            target,
            kept,
            write,
            old_sorted,
        });
    }

    // Pass 2: fill members still under target from the unclaimed pool.
    let mut free = (0..num_shards)
        .map(ShardId::new)
        .filter(|shard| !allocated[shard.get() as usize]);
    let mut updates = Vec::new();
    for slot in &mut slots {
        let mut shards = std::mem::take(&mut slot.kept);
        let mut write = slot.write;
        while shards.len() < slot.target {
            let shard = free
                .next()
                .expect("free pool exhausted below target: shard accounting broken");
            shards.push(shard);
            write = true;
        }
        if write || slot.old_sorted != shards {
            updates.push(AssignmentUpdate {
                member: slot.member.clone(),
                shards,
            });
        }
    }

    // Prune records of members that are no longer live. BTreeMap keys keep
    // this ascending.
    let removals: Vec<MemberId> = current
        .keys()
        .filter(|member| !nodes.contains(*member))
        .cloned()
        .collect();

    Some(AssignmentPlan { updates, removals })
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: u32 = 8;

    fn member(id: &str) -> MemberId {
        MemberId::new(id)
    }

    fn shards(ids: &[u32]) -> Vec<ShardId> {
        ids.iter().copied().map(ShardId::new).collect()
    }

    fn record(version: i32, ids: &[u32]) -> AssignRecord {
        AssignRecord {
            version,
            shards: shards(ids),
        }
    }

    fn plan(
        nodes: &[&str],
        current: &[(&str, &[u32])],
    ) -> AssignmentPlan {
        let nodes: Vec<MemberId> = nodes.iter().map(|id| member(id)).collect();
        let current: BTreeMap<MemberId, AssignRecord> = current
            .iter()
            .map(|(id, owned)| (member(id), record(0, owned)))
            .collect();
        compute_plan(N, &nodes, &current).expect("nodes not empty")
    }

    #[test]
    fn test_no_members_is_noop() {
        assert!(compute_plan(N, &[], &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_single_member_gets_everything() {
        let plan = plan(&["node01"], &[]);
        assert_eq!(
            plan.updates,
            vec![AssignmentUpdate {
                member: member("node01"),
                shards: shards(&[0, 1, 2, 3, 4, 5, 6, 7]),
            }]
        );
        assert!(plan.removals.is_empty());
    }

    #[test]
    fn test_fresh_two_members_split_evenly() {
        let plan = plan(&["node01", "node02"], &[]);
        assert_eq!(plan.updates.len(), 2);
        assert_eq!(plan.updates[0].shards, shards(&[0, 1, 2, 3]));
        assert_eq!(plan.updates[1].shards, shards(&[4, 5, 6, 7]));
    }

    #[test]
    fn test_fresh_three_members_remainder_goes_first() {
        let plan = plan(&["node01", "node02", "node03"], &[]);
        assert_eq!(plan.updates.len(), 3);
        assert_eq!(plan.updates[0].member, member("node01"));
        assert_eq!(plan.updates[0].shards, shards(&[0, 1, 2]));
        assert_eq!(plan.updates[1].shards, shards(&[3, 4, 5]));
        assert_eq!(plan.updates[2].shards, shards(&[6, 7]));
    }

    #[test]
    fn test_join_truncates_loaded_member_only() {
        // node01 owns everything; node02 joins.
        let plan = plan(&["node01", "node02"], &[("node01", &[0, 1, 2, 3, 4, 5, 6, 7])]);
        assert_eq!(plan.updates.len(), 2);
        assert_eq!(plan.updates[0].member, member("node01"));
        assert_eq!(plan.updates[0].shards, shards(&[0, 1, 2, 3]));
        assert_eq!(plan.updates[1].member, member("node02"));
        assert_eq!(plan.updates[1].shards, shards(&[4, 5, 6, 7]));
    }

    #[test]
    fn test_leave_redistributes_only_freed_shards() {
        // node03 departed; its {6,7} is split across the survivors, whose
        // own shards stay put.
        let plan = plan(
            &["node01", "node02"],
            &[
                ("node01", &[0, 1, 2]),
                ("node02", &[3, 4, 5]),
                ("node03", &[6, 7]),
            ],
        );
        assert_eq!(plan.updates.len(), 2);
        assert_eq!(plan.updates[0].shards, shards(&[0, 1, 2, 6]));
        assert_eq!(plan.updates[1].shards, shards(&[3, 4, 5, 7]));
        assert_eq!(plan.removals, vec![member("node03")]);
    }

    #[test]
    fn test_fill_appends_after_retained() {
        // New leader view after the old leader (node01) departed: the
        // freed shards are appended after each survivor's retained run.
        let plan = plan(
            &["node02", "node03"],
            &[
                ("node01", &[0, 1, 2]),
                ("node02", &[3, 4, 5]),
                ("node03", &[6, 7]),
            ],
        );
        assert_eq!(plan.updates[0].member, member("node02"));
        assert_eq!(plan.updates[0].shards, shards(&[3, 4, 5, 0]));
        assert_eq!(plan.updates[1].member, member("node03"));
        assert_eq!(plan.updates[1].shards, shards(&[6, 7, 1, 2]));
        assert_eq!(plan.removals, vec![member("node01")]);
    }

    #[test]
    fn test_duplicate_claim_goes_to_higher_priority_member() {
        // Shard 3 is claimed twice; the member with more shards keeps it.
        let plan = plan(
            &["node01", "node02"],
            &[("node01", &[0, 1, 2, 3]), ("node02", &[3, 4, 5])],
        );
        // node01 keeps its four; node02 loses the duplicate and fills up.
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].member, member("node02"));
        assert_eq!(plan.updates[0].shards, shards(&[4, 5, 6, 7]));
    }

    #[test]
    fn test_stable_state_is_noop() {
        let plan = plan(
            &["node01", "node02", "node03"],
            &[
                ("node01", &[0, 1, 2]),
                ("node02", &[3, 4, 5]),
                ("node03", &[6, 7]),
            ],
        );
        assert!(plan.updates.is_empty());
        assert!(plan.removals.is_empty());
    }

    #[test]
    fn test_unsorted_record_is_rewritten_sorted() {
        let plan = plan(
            &["node01"],
            &[("node01", &[7, 0, 3, 1, 2, 6, 4, 5])],
        );
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].shards, shards(&[0, 1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn test_more_members_than_shards() {
        let nodes: Vec<MemberId> = (0..10).map(|i| member(&format!("node{i:02}"))).collect();
        let plan = compute_plan(4, &nodes, &BTreeMap::new()).unwrap();
        // Four members get one shard each, six get none (and no record).
        assert_eq!(plan.updates.len(), 4);
        for update in &plan.updates {
            assert_eq!(update.shards.len(), 1);
        }
    }

    #[test]
    fn test_balance_invariant_over_many_shapes() {
        for n in 1..=8_u32 {
            let nodes: Vec<MemberId> = (0..n).map(|i| member(&format!("m{i:02}"))).collect();
            let plan = compute_plan(N, &nodes, &BTreeMap::new()).unwrap();
            let mut owned = vec![0_u32; N as usize];
            let mut larger = 0;
            for update in &plan.updates {
                let count = u32::try_from(update.shards.len()).unwrap();
                assert!(count == N / n || count == N.div_ceil(n), "unbalanced: {count}");
                if count == N.div_ceil(n) && N % n != 0 {
                    larger += 1;
                }
                for shard in &update.shards {
                    owned[shard.get() as usize] += 1;
                }
            }
            assert!(owned.iter().all(|&c| c == 1), "coverage broken for n={n}");
            if N % n != 0 {
                assert_eq!(larger, N % n, "wrong large-count members for n={n}");
            }
        }
    }
}
