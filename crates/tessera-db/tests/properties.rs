//! Property-based tests for locks and the session history.
//!
//! These tests verify the laws the collaboration core relies on:
//!  - Lock expiry: a lock blocks others iff `now - acquired_at <= ttl`
//!  - Self-lock: a lock never blocks its own holder
//!  - History bound: the undo stack never exceeds its capacity and drops
//!    the oldest actions first
//!  - Inverse law: push, undo, redo leaves the state as it was after push
//!  - Redo truncation: a new push after undo forbids redo

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_db::{HistoryAction, HistoryStack, Lock, LockTable, Reversible, LOCK_TTL_MS};

/// Test command: replaces a register value.
#[derive(Clone, Debug, PartialEq)]
struct Assign {
    before: i32,
    after: i32,
}

#[derive(Default)]
struct Register {
    value: Mutex<i32>,
}

impl Register {
    fn get(&self) -> i32 {
        *self.value.lock()
    }
}

#[async_trait]
impl Reversible for Assign {
    type Target = Register;
    type Error = std::convert::Infallible;

    async fn undo(&self, register: &Register) -> Result<(), Self::Error> {
        *register.value.lock() = self.before;
        Ok(())
    }

    async fn redo(&self, register: &Register) -> Result<(), Self::Error> {
        *register.value.lock() = self.after;
        Ok(())
    }
}

fn assign(history: &HistoryStack<Assign>, register: &Register, after: i32) {
    let before = register.get();
    *register.value.lock() = after;
    history.push_action(HistoryAction::new(
        "assign",
        format!("{before} -> {after}"),
        0,
        Assign { before, after },
    ));
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn lock_blocks_others_iff_within_ttl(acquired_at in 0u64..1_000_000_000, elapsed in 0u64..(2 * LOCK_TTL_MS)) {
        let lock = Lock::new("LO-1", "alice", acquired_at);
        let now = acquired_at + elapsed;

        prop_assert_eq!(lock.blocks("bob", now, LOCK_TTL_MS), elapsed <= LOCK_TTL_MS);
        prop_assert_eq!(lock.is_expired_at(now, LOCK_TTL_MS), elapsed > LOCK_TTL_MS);
    }

    #[test]
    fn lock_never_blocks_its_holder(acquired_at in 0u64..1_000_000, elapsed in 0u64..(2 * LOCK_TTL_MS)) {
        let mut table = LockTable::new();
        table.insert(Lock::new("LO-1", "alice", acquired_at));

        prop_assert!(!table.is_locked("LO-1", "alice", acquired_at + elapsed, LOCK_TTL_MS));
    }

    #[test]
    fn history_is_bounded_and_drops_oldest(pushes in 0usize..150) {
        let history = HistoryStack::default();
        let register = Register::default();
        for i in 1..=pushes {
            assign(&history, &register, i as i32);
        }

        let actions = history.undo_actions();
        prop_assert_eq!(actions.len(), pushes.min(50));
        if pushes > 0 {
            let oldest_kept = pushes.saturating_sub(50) + 1;
            prop_assert_eq!(actions[0].command.after, oldest_kept as i32);
        }
    }

    #[test]
    fn undo_then_redo_restores_post_push_state(values in prop::collection::vec(-1000i32..1000, 1..30)) {
        let rt = runtime();
        let history = HistoryStack::default();
        let register = Register::default();
        for value in &values {
            assign(&history, &register, *value);
        }
        let after_push = register.get();
        let undo_len = history.undo_len();

        rt.block_on(async {
            history.undo(&register).await.unwrap();
            history.redo(&register).await.unwrap();
        });

        prop_assert_eq!(register.get(), after_push);
        prop_assert_eq!(history.undo_len(), undo_len);
        prop_assert!(!history.can_redo());
    }

    #[test]
    fn push_after_undo_truncates_redo(values in prop::collection::vec(-1000i32..1000, 1..20), undos in 1usize..20, next in -1000i32..1000) {
        let rt = runtime();
        let history = HistoryStack::default();
        let register = Register::default();
        for value in &values {
            assign(&history, &register, *value);
        }

        rt.block_on(async {
            for _ in 0..undos {
                history.undo(&register).await.unwrap();
            }
        });
        assign(&history, &register, next);

        prop_assert!(!history.can_redo());
        let redone = rt.block_on(history.redo(&register)).unwrap();
        prop_assert!(redone.is_none());
        prop_assert_eq!(register.get(), next);
    }
}

#[test]
fn sixty_pushes_keep_fifty_starting_at_the_eleventh() {
    let history = HistoryStack::default();
    let register = Register::default();
    for i in 1..=60 {
        assign(&history, &register, i);
    }

    let actions = history.undo_actions();
    assert_eq!(actions.len(), 50);
    assert_eq!(actions[0].command.after, 11);
    assert_eq!(actions[49].command.after, 60);
}

/// Counts how often each direction ran.
struct CountingCommand {
    undos: Arc<AtomicUsize>,
    redos: Arc<AtomicUsize>,
}

#[async_trait]
impl Reversible for CountingCommand {
    type Target = ();
    type Error = std::convert::Infallible;

    async fn undo(&self, _: &()) -> Result<(), Self::Error> {
        self.undos.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn redo(&self, _: &()) -> Result<(), Self::Error> {
        self.redos.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn single_action_scenario() {
    let undos = Arc::new(AtomicUsize::new(0));
    let redos = Arc::new(AtomicUsize::new(0));
    let history = HistoryStack::default();

    history.push_action(
        HistoryAction::new(
            "counted",
            "s1",
            0,
            CountingCommand {
                undos: undos.clone(),
                redos: redos.clone(),
            },
        )
        .with_id("s1"),
    );

    let undone = history.undo(&()).await.unwrap().unwrap();
    assert_eq!(undone.id.as_str(), "s1");
    assert_eq!(undos.load(Ordering::SeqCst), 1);
    assert_eq!(redos.load(Ordering::SeqCst), 0);
    assert!(!history.can_undo());
    assert!(history.can_redo());

    let redone = history.redo(&()).await.unwrap().unwrap();
    assert_eq!(redone.id.as_str(), "s1");
    assert_eq!(undos.load(Ordering::SeqCst), 1);
    assert_eq!(redos.load(Ordering::SeqCst), 1);
    assert!(!history.can_redo());
    assert!(history.can_undo());
}
