//! Randomized convergence tests.
//!
//! A seeded RNG interleaves operation applies with connection errors and
//! session expiries across a fleet, then the harness restarts the dead
//! members, flushes every retry queue, and runs the store to quiescence.
//! Whatever happened along the way, the stable state must satisfy the
//! universal invariants: full coverage, balance, and membership closure.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use shoal_coord::sim::SimStore;
use shoal_coord::ClientId;
use shoal_sharding::{Member, MemberId};

const ROOT: &str = "/chaos";
const NUM_SHARDS: u32 = 8;
const STEP_BUDGET: usize = 600;
const RECOVERY_ROUNDS: usize = 4;

const CLIENTS: [ClientId; 10] = [
    ClientId::new("m00"),
    ClientId::new("m01"),
    ClientId::new("m02"),
    ClientId::new("m03"),
    ClientId::new("m04"),
    ClientId::new("m05"),
    ClientId::new("m06"),
    ClientId::new("m07"),
    ClientId::new("m08"),
    ClientId::new("m09"),
];

#[derive(Deserialize)]
struct AssignPayload {
    shards: Vec<u32>,
}

fn run_chaos(seed: u64, member_count: usize, expiry_rate: f64, conn_error_rate: f64) {
    let store = SimStore::new();
    store.seed_node(ROOT);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    for (index, client) in CLIENTS.iter().take(member_count).enumerate() {
        let member = Member::new(
            ROOT,
            MemberId::new(format!("m{index:02}")),
            NUM_SHARDS,
            format!("m{index:02}-addr:4001"),
        );
        store.register(*client, member.driver());
        store.begin(*client);
    }

    let mut expired = vec![false; member_count];

    for _ in 0..STEP_BUDGET {
        let choice = rng.gen_range(0..member_count);
        let client = CLIENTS[choice];

        if expired[choice] {
            store.begin(client);
            expired[choice] = false;
            continue;
        }

        let roll: f64 = rng.gen();
        let live = expired.iter().filter(|dead| !**dead).count();
        if roll < expiry_rate && live > 1 {
            store.session_expired(client);
            expired[choice] = true;
        } else if roll < expiry_rate + conn_error_rate {
            store.conn_error(client);
            store.retry(client);
        } else if store.pending_count(client) > 0 {
            store.apply_next(client);
        }
    }

    // Recovery: bring every member back and run to quiescence.
    for (choice, client) in CLIENTS.iter().take(member_count).enumerate() {
        if expired[choice] {
            store.begin(*client);
            expired[choice] = false;
        }
    }
    for _ in 0..RECOVERY_ROUNDS {
        for client in CLIENTS.iter().take(member_count) {
            store.retry(*client);
        }
        store.drain_all();
    }
    for client in CLIENTS.iter().take(member_count) {
        assert_eq!(store.pending_count(*client), 0, "seed {seed}: not quiescent");
        assert_eq!(store.pending_retries(*client), 0, "seed {seed}: retries left");
    }

    assert_stable_invariants(&store, seed);
}

/// Coverage, balance, and membership closure over the stable store state.
fn assert_stable_invariants(store: &SimStore, seed: u64) {
    let nodes = store
        .read(&format!("{ROOT}/nodes"))
        .expect("nodes container")
        .children;
    let assigns = store
        .read(&format!("{ROOT}/assigns"))
        .expect("assigns container")
        .children;

    let n = u32::try_from(nodes.len()).unwrap();
    assert!(n > 0, "seed {seed}: no live members");

    // Membership closure: every record belongs to a live member.
    for member in &assigns {
        assert!(
            nodes.contains(member),
            "seed {seed}: record for departed member {member}"
        );
    }

    let min_per = NUM_SHARDS / n;
    let max_per = NUM_SHARDS.div_ceil(n);
    let mut owners = vec![0_u32; NUM_SHARDS as usize];
    let mut at_max = 0_u32;

    for member in &assigns {
        let snapshot = store
            .read(&format!("{ROOT}/assigns/{member}"))
            .expect("listed record exists");
        let payload: AssignPayload =
            serde_json::from_slice(&snapshot.data).expect("valid assignment payload");

        let count = u32::try_from(payload.shards.len()).unwrap();
        assert!(
            count == min_per || count == max_per,
            "seed {seed}: member {member} owns {count} shards (expected {min_per} or {max_per})"
        );
        if NUM_SHARDS % n != 0 && count == max_per {
            at_max += 1;
        }
        for shard in payload.shards {
            assert!(shard < NUM_SHARDS, "seed {seed}: shard {shard} out of range");
            owners[shard as usize] += 1;
        }
    }

    for (shard, owner_count) in owners.iter().enumerate() {
        assert_eq!(
            *owner_count, 1,
            "seed {seed}: shard {shard} owned by {owner_count} members"
        );
    }
    if NUM_SHARDS % n != 0 {
        assert_eq!(
            at_max,
            NUM_SHARDS % n,
            "seed {seed}: wrong number of members at the larger count"
        );
    }
}

#[test]
fn test_chaos_three_members() {
    for seed in 0..25 {
        run_chaos(seed, 3, 0.02, 0.05);
    }
}

#[test]
fn test_chaos_four_members() {
    for seed in 100..125 {
        run_chaos(seed, 4, 0.03, 0.08);
    }
}

#[test]
fn test_chaos_five_members() {
    for seed in 200..225 {
        run_chaos(seed, 5, 0.05, 0.10);
    }
}

#[test]
fn test_chaos_ten_members() {
    // More members than shards: some members own nothing and have no
    // record at all.
    for seed in 300..320 {
        run_chaos(seed, 10, 0.04, 0.08);
    }
}

#[test]
fn test_quiet_fleet_converges_without_faults() {
    for member_count in [1, 2, 3, 5, 8] {
        run_chaos(u64::try_from(member_count).unwrap(), member_count, 0.0, 0.0);
    }
}
