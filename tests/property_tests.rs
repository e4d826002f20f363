//! Property and concurrency tests for ledger invariants
//!
//! - Idempotency: a replayed transaction id has exactly one effect
//! - Non-negativity: no sequence of accepted operations overdraws an account
//! - Conservation: transfers move points without creating or destroying them
//! - Concurrency safety: concurrent mutators never lose updates

use points_ledger::{
    AccountId, LedgerEngine, LedgerStore, MemoryStore, Outcome, Points, SaveRequest, Source,
    SqliteStore, TransferRequest, UseRequest,
};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

fn save(account: u64, amount: Points, tx: String) -> SaveRequest {
    SaveRequest {
        account: AccountId(account),
        amount,
        reason: "reward".to_string(),
        transaction_id: tx,
        trace_id: None,
        source: Source::OrderReward,
    }
}

fn use_points(account: u64, amount: Points, tx: String) -> UseRequest {
    UseRequest {
        account: AccountId(account),
        amount,
        reason: "checkout".to_string(),
        transaction_id: tx,
        trace_id: None,
        source: Source::OrderReward,
    }
}

fn transfer(sender: u64, receiver: u64, amount: Points, tx: &str) -> TransferRequest {
    TransferRequest {
        sender: AccountId(sender),
        receiver: AccountId(receiver),
        amount,
        reason: "transfer".to_string(),
        sender_transaction_id: format!("{tx}-s"),
        sender_trace_id: None,
        receiver_transaction_id: format!("{tx}-r"),
        receiver_trace_id: None,
        source: Source::MemberTransfer,
    }
}

/// A random ledger operation over accounts 1..=3
#[derive(Debug, Clone)]
enum Op {
    Save(u64, Points),
    Use(u64, Points),
    Transfer(u64, u64, Points),
}

/// Strategy for generating positive amounts with 2 decimal places
fn amount_strategy() -> impl Strategy<Value = Points> {
    (1i64..500_000i64).prop_map(|cents| Points::new(rust_decimal::Decimal::new(cents, 2)))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let account = 1u64..=3;
    prop_oneof![
        (account.clone(), amount_strategy()).prop_map(|(a, amt)| Op::Save(a, amt)),
        (account.clone(), amount_strategy()).prop_map(|(a, amt)| Op::Use(a, amt)),
        (account.clone(), account, amount_strategy())
            .prop_map(|(from, to, amt)| Op::Transfer(from, to, amt)),
    ]
}

fn apply<S: LedgerStore>(engine: &LedgerEngine<S>, op: &Op, tx: &str) -> Outcome {
    match op {
        Op::Save(account, amount) => engine.apply_save(save(*account, *amount, tx.to_string())),
        Op::Use(account, amount) => engine.apply_use(use_points(*account, *amount, tx.to_string())),
        Op::Transfer(from, to, amount) => engine.apply_transfer(transfer(*from, *to, *amount, tx)),
    }
    .unwrap()
}

fn total<S: LedgerStore>(engine: &LedgerEngine<S>) -> Points {
    (1..=3)
        .map(|a| engine.get_balance(AccountId(a)).unwrap())
        .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: balances never go negative, and the total only moves by
    /// accepted saves and uses
    #[test]
    fn prop_non_negative_and_conserved(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let engine = LedgerEngine::open(MemoryStore::new());
        let mut expected_total = Points::ZERO;

        for (i, op) in ops.iter().enumerate() {
            let outcome = apply(&engine, op, &format!("tx-{i}"));
            if outcome.is_accepted() {
                match op {
                    Op::Save(_, amount) => expected_total = expected_total + *amount,
                    Op::Use(_, amount) => expected_total = expected_total - *amount,
                    Op::Transfer(..) => {}
                }
            }

            for account in 1..=3 {
                let balance = engine.get_balance(AccountId(account)).unwrap();
                prop_assert!(balance >= Points::ZERO, "account {} went negative: {}", account, balance);
            }
            prop_assert_eq!(total(&engine), expected_total);
        }
    }

    /// Property: replaying every operation changes nothing
    #[test]
    fn prop_replay_is_a_no_op(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let engine = LedgerEngine::open(MemoryStore::new());
        let outcomes: Vec<Outcome> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| apply(&engine, op, &format!("tx-{i}")))
            .collect();
        let balances = engine.balances().unwrap();
        let history_len: usize = (1..=3)
            .map(|a| engine.get_history(AccountId(a)).unwrap().len())
            .sum();

        for (i, (op, first)) in ops.iter().zip(&outcomes).enumerate() {
            let replay = apply(&engine, op, &format!("tx-{i}"));
            if first.is_accepted() {
                prop_assert!(replay.is_duplicate());
            }
        }

        prop_assert_eq!(engine.balances().unwrap(), balances);
        let replayed_len: usize = (1..=3)
            .map(|a| engine.get_history(AccountId(a)).unwrap().len())
            .sum();
        prop_assert_eq!(replayed_len, history_len);
    }

    /// Property: an accepted transfer moves exactly its amount and writes two legs
    #[test]
    fn prop_transfer_conserves(seed in amount_strategy(), amount in amount_strategy()) {
        let engine = LedgerEngine::open(MemoryStore::new());
        engine.apply_save(save(1, seed, "seed".to_string())).unwrap();

        let outcome = engine.apply_transfer(transfer(1, 2, amount, "x")).unwrap();

        let sender = engine.get_balance(AccountId(1)).unwrap();
        let receiver = engine.get_balance(AccountId(2)).unwrap();
        prop_assert_eq!(sender + receiver, seed);
        if amount <= seed {
            prop_assert!(outcome.is_accepted());
            prop_assert_eq!(sender, seed - amount);
            prop_assert_eq!(receiver, amount);
            prop_assert_eq!(engine.get_history(AccountId(1)).unwrap().len(), 2);
            prop_assert_eq!(engine.get_history(AccountId(2)).unwrap().len(), 1);
        } else {
            prop_assert!(outcome.rejection().is_some());
            prop_assert_eq!(sender, seed);
            prop_assert!(engine.get_history(AccountId(2)).unwrap().is_empty());
        }
    }
}

// ==================== CONCURRENCY ====================

#[test]
fn test_concurrent_saves_lose_no_updates() {
    let engine = Arc::new(LedgerEngine::open(MemoryStore::new()));
    let threads = 8;
    let per_thread = 50;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let outcome = engine
                        .apply_save(save(1, Points::whole(3), format!("save-{t}-{i}")))
                        .unwrap();
                    assert!(outcome.is_accepted());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        engine.get_balance(AccountId(1)).unwrap(),
        Points::whole(3 * threads * per_thread)
    );
    assert_eq!(
        engine.get_history(AccountId(1)).unwrap().len(),
        (threads * per_thread) as usize
    );
}

#[test]
fn test_concurrent_duplicate_delivery_applies_once() {
    let engine = Arc::new(LedgerEngine::open(MemoryStore::new()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .apply_save(save(1, Points::whole(100), "order-1-reward".to_string()))
                    .unwrap()
            })
        })
        .collect();
    let outcomes: Vec<Outcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_accepted()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_duplicate()).count(), 15);
    assert_eq!(engine.get_balance(AccountId(1)).unwrap(), Points::whole(100));
    assert_eq!(engine.get_history(AccountId(1)).unwrap().len(), 1);
}

#[test]
fn test_same_transaction_id_on_two_accounts_applies_once() {
    for round in 0..50 {
        let engine = Arc::new(LedgerEngine::open(MemoryStore::new()));
        let start = Arc::new(Barrier::new(2));
        let tx = format!("order-{round}-reward");

        let handles: Vec<_> = [1u64, 2]
            .into_iter()
            .map(|account| {
                let engine = Arc::clone(&engine);
                let start = Arc::clone(&start);
                let tx = tx.clone();
                thread::spawn(move || {
                    start.wait();
                    engine.apply_save(save(account, Points::whole(40), tx)).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<Outcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.is_accepted()).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.is_duplicate()).count(), 1);
        assert_eq!(total(&*engine), Points::whole(40));
    }
}

#[test]
fn test_concurrent_uses_never_overdraw() {
    let engine = Arc::new(LedgerEngine::open(MemoryStore::new()));
    engine
        .apply_save(save(1, Points::whole(100), "seed".to_string()))
        .unwrap();

    let handles: Vec<_> = (0..20)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .apply_use(use_points(1, Points::whole(10), format!("use-{t}")))
                    .unwrap()
            })
        })
        .collect();
    let accepted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Outcome::is_accepted)
        .count();

    assert_eq!(accepted, 10);
    assert_eq!(engine.get_balance(AccountId(1)).unwrap(), Points::ZERO);
}

#[test]
fn test_opposing_transfers_do_not_deadlock_and_conserve() {
    let engine = Arc::new(LedgerEngine::open(MemoryStore::new()));
    engine
        .apply_save(save(1, Points::whole(1000), "seed-1".to_string()))
        .unwrap();
    engine
        .apply_save(save(2, Points::whole(1000), "seed-2".to_string()))
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let (from, to) = if t % 2 == 0 { (1, 2) } else { (2, 1) };
                for i in 0..100 {
                    engine
                        .apply_transfer(transfer(from, to, Points::whole(7), &format!("x-{t}-{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let one = engine.get_balance(AccountId(1)).unwrap();
    let two = engine.get_balance(AccountId(2)).unwrap();
    assert!(one >= Points::ZERO && two >= Points::ZERO);
    assert_eq!(one + two, Points::whole(2000));
}

#[test]
fn test_concurrent_saves_on_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("ledger.db")).unwrap();
    let engine = Arc::new(LedgerEngine::open(store));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..25 {
                    engine
                        .apply_save(save(1, Points::whole(2), format!("save-{t}-{i}")))
                        .unwrap();
                    // Every thread also replays the first event.
                    engine
                        .apply_save(save(1, Points::whole(2), "save-0-0".to_string()))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.get_balance(AccountId(1)).unwrap(), Points::whole(200));
    assert_eq!(engine.get_history(AccountId(1)).unwrap().len(), 100);
}
