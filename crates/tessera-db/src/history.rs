//! Session Undo/Redo - a bounded, client-local command history.
//!
//! Provides linear undo for one editing session:
//! - Two stacks (`undo`, `redo`); pushing a new action clears `redo`
//! - The undo stack is capped (oldest dropped first)
//! - An `applying` guard turns `push_action` into a no-op while an undo or
//!   redo is running, so a command's own save path cannot re-record itself
//!
//! Nothing here is persisted or shared with other clients. Field-level
//! restore from the remote audit log is a separate mechanism.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use ulid::Ulid;

/// Default number of actions kept on the undo stack.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Unique identifier for a history action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A command that knows how to reverse and reapply itself.
///
/// Each command captures its exact before/after values when it is built.
#[async_trait]
pub trait Reversible: Send + Sync {
    /// What the command acts on.
    type Target: ?Sized + Send + Sync;
    type Error: Send;

    async fn undo(&self, target: &Self::Target) -> Result<(), Self::Error>;

    async fn redo(&self, target: &Self::Target) -> Result<(), Self::Error>;
}

/// An entry on the history stacks.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryAction<C> {
    pub id: ActionId,
    /// Short machine-readable kind, e.g. `status_change`.
    pub kind: String,
    pub description: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub command: C,
}

impl<C> HistoryAction<C> {
    pub fn new(
        kind: impl Into<String>,
        description: impl Into<String>,
        timestamp: u64,
        command: C,
    ) -> Self {
        Self {
            id: ActionId::new(),
            kind: kind.into(),
            description: description.into(),
            timestamp,
            command,
        }
    }

    pub fn with_id(mut self, id: impl Into<ActionId>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Undo,
    Redo,
}

struct Stacks<C> {
    undo: VecDeque<Arc<HistoryAction<C>>>,
    redo: Vec<Arc<HistoryAction<C>>>,
}

/// Linear undo/redo history.
pub struct HistoryStack<C> {
    stacks: Mutex<Stacks<C>>,
    capacity: usize,
    applying: AtomicBool,
}

impl<C> Default for HistoryStack<C> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Clears the guard when dropped and returns an unfinished action to the
/// stack it was taken from. Covers both command errors and cancellation.
struct Applying<'a, C> {
    history: &'a HistoryStack<C>,
    action: Option<Arc<HistoryAction<C>>>,
    origin: Side,
}

impl<C> Applying<'_, C> {
    fn complete(mut self) -> Option<Arc<HistoryAction<C>>> {
        let action = self.action.take()?;
        let mut stacks = self.history.stacks.lock();
        match self.origin {
            Side::Undo => stacks.redo.push(action.clone()),
            Side::Redo => stacks.undo.push_back(action.clone()),
        }
        Some(action)
    }
}

impl<C> Drop for Applying<'_, C> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            tracing::warn!(id = %action.id, kind = %action.kind, "history action failed, restored");
            let mut stacks = self.history.stacks.lock();
            match self.origin {
                Side::Undo => stacks.undo.push_back(action),
                Side::Redo => stacks.redo.push(action),
            }
        }
        self.history.applying.store(false, Ordering::SeqCst);
    }
}

impl<C> HistoryStack<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            stacks: Mutex::new(Stacks {
                undo: VecDeque::new(),
                redo: Vec::new(),
            }),
            capacity: capacity.max(1),
            applying: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a new action. Returns `false` (and records nothing) while an
    /// undo or redo is being applied.
    pub fn push_action(&self, action: HistoryAction<C>) -> bool {
        if self.is_applying() {
            tracing::trace!(kind = %action.kind, "push suppressed while applying history");
            return false;
        }

        let mut stacks = self.stacks.lock();
        stacks.undo.push_back(Arc::new(action));
        while stacks.undo.len() > self.capacity {
            stacks.undo.pop_front();
        }
        stacks.redo.clear();
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.stacks.lock().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stacks.lock().redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.stacks.lock().undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.stacks.lock().redo.len()
    }

    /// The action `undo` would revert next.
    pub fn peek_undo(&self) -> Option<Arc<HistoryAction<C>>> {
        self.stacks.lock().undo.back().cloned()
    }

    /// The action `redo` would reapply next.
    pub fn peek_redo(&self) -> Option<Arc<HistoryAction<C>>> {
        self.stacks.lock().redo.last().cloned()
    }

    /// Undo stack from oldest to newest.
    pub fn undo_actions(&self) -> Vec<Arc<HistoryAction<C>>> {
        self.stacks.lock().undo.iter().cloned().collect()
    }

    pub fn is_applying(&self) -> bool {
        self.applying.load(Ordering::SeqCst)
    }

    pub fn clear_history(&self) {
        let mut stacks = self.stacks.lock();
        stacks.undo.clear();
        stacks.redo.clear();
    }

    /// Take the top of `side` and raise the guard. `None` if the stack is
    /// empty or another undo/redo is already running.
    fn begin(&self, side: Side) -> Option<Applying<'_, C>> {
        if self
            .applying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let action = {
            let mut stacks = self.stacks.lock();
            match side {
                Side::Undo => stacks.undo.pop_back(),
                Side::Redo => stacks.redo.pop(),
            }
        };

        // Dropping the guard with no action just lowers the flag.
        let guard = Applying {
            history: self,
            action,
            origin: side,
        };
        guard.action.is_some().then_some(guard)
    }
}

impl<C: Reversible> HistoryStack<C> {
    /// Revert the most recent action and move it to the redo stack.
    ///
    /// Returns `Ok(None)` when there is nothing to undo. If the command
    /// fails, the action stays on the undo stack and the error is returned.
    pub async fn undo(
        &self,
        target: &C::Target,
    ) -> Result<Option<Arc<HistoryAction<C>>>, C::Error> {
        let Some(guard) = self.begin(Side::Undo) else {
            return Ok(None);
        };
        if let Some(action) = guard.action.clone() {
            action.command.undo(target).await?;
            tracing::debug!(id = %action.id, kind = %action.kind, "undone");
        }
        Ok(guard.complete())
    }

    /// Reapply the most recently undone action and move it back to the undo
    /// stack. Mirror image of [`undo`](Self::undo).
    pub async fn redo(
        &self,
        target: &C::Target,
    ) -> Result<Option<Arc<HistoryAction<C>>>, C::Error> {
        let Some(guard) = self.begin(Side::Redo) else {
            return Ok(None);
        };
        if let Some(action) = guard.action.clone() {
            action.command.redo(target).await?;
            tracing::debug!(id = %action.id, kind = %action.kind, "redone");
        }
        Ok(guard.complete())
    }
}

impl<C> fmt::Debug for HistoryStack<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stacks = self.stacks.lock();
        f.debug_struct("HistoryStack")
            .field("undo", &stacks.undo.len())
            .field("redo", &stacks.redo.len())
            .field("capacity", &self.capacity)
            .field("applying", &self.is_applying())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sets a shared integer to `after` on redo and `before` on undo.
    #[derive(Clone, Debug, PartialEq)]
    struct SetValue {
        before: i64,
        after: i64,
    }

    struct Cell {
        value: Mutex<i64>,
        fail: AtomicBool,
    }

    impl Cell {
        fn new(value: i64) -> Self {
            Self {
                value: Mutex::new(value),
                fail: AtomicBool::new(false),
            }
        }

        fn get(&self) -> i64 {
            *self.value.lock()
        }
    }

    #[async_trait]
    impl Reversible for SetValue {
        type Target = Cell;
        type Error = String;

        async fn undo(&self, cell: &Cell) -> Result<(), String> {
            if cell.fail.load(Ordering::SeqCst) {
                return Err("offline".into());
            }
            *cell.value.lock() = self.before;
            Ok(())
        }

        async fn redo(&self, cell: &Cell) -> Result<(), String> {
            if cell.fail.load(Ordering::SeqCst) {
                return Err("offline".into());
            }
            *cell.value.lock() = self.after;
            Ok(())
        }
    }

    fn set(history: &HistoryStack<SetValue>, cell: &Cell, after: i64) {
        let before = cell.get();
        *cell.value.lock() = after;
        history.push_action(HistoryAction::new(
            "set",
            format!("{before} -> {after}"),
            0,
            SetValue { before, after },
        ));
    }

    #[tokio::test]
    async fn test_undo_redo_roundtrip() {
        let history = HistoryStack::default();
        let cell = Cell::new(0);

        set(&history, &cell, 1);
        set(&history, &cell, 2);

        let undone = history.undo(&cell).await.unwrap().unwrap();
        assert_eq!(undone.command.after, 2);
        assert_eq!(cell.get(), 1);
        assert!(history.can_redo());

        history.redo(&cell).await.unwrap();
        assert_eq!(cell.get(), 2);
        assert!(!history.can_redo());
        assert_eq!(history.undo_len(), 2);
    }

    #[tokio::test]
    async fn test_empty_stacks_return_none() {
        let history: HistoryStack<SetValue> = HistoryStack::default();
        let cell = Cell::new(0);

        assert!(history.undo(&cell).await.unwrap().is_none());
        assert!(history.redo(&cell).await.unwrap().is_none());
        assert!(!history.is_applying());
    }

    #[tokio::test]
    async fn test_push_clears_redo() {
        let history = HistoryStack::default();
        let cell = Cell::new(0);

        set(&history, &cell, 1);
        history.undo(&cell).await.unwrap();
        assert!(history.can_redo());

        set(&history, &cell, 5);
        assert!(!history.can_redo());
        assert!(history.redo(&cell).await.unwrap().is_none());
        assert_eq!(cell.get(), 5);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let history = HistoryStack::new(3);
        let cell = Cell::new(0);
        for i in 1..=5 {
            set(&history, &cell, i);
        }

        let kept: Vec<_> = history
            .undo_actions()
            .iter()
            .map(|a| a.command.after)
            .collect();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_undo_keeps_action() {
        let history = HistoryStack::default();
        let cell = Cell::new(0);
        set(&history, &cell, 1);

        cell.fail.store(true, Ordering::SeqCst);
        assert!(history.undo(&cell).await.is_err());
        assert_eq!(history.undo_len(), 1);
        assert_eq!(history.redo_len(), 0);
        assert!(!history.is_applying());

        cell.fail.store(false, Ordering::SeqCst);
        assert!(history.undo(&cell).await.unwrap().is_some());
        assert_eq!(cell.get(), 0);
    }

    #[test]
    fn test_push_suppressed_while_applying() {
        let history = HistoryStack::default();
        history.applying.store(true, Ordering::SeqCst);

        let pushed = history.push_action(HistoryAction::new(
            "set",
            "",
            0,
            SetValue { before: 0, after: 1 },
        ));
        assert!(!pushed);
        assert!(!history.can_undo());
    }

    #[test]
    fn test_clear_history() {
        let history = HistoryStack::default();
        let cell = Cell::new(0);
        set(&history, &cell, 1);
        history.clear_history();
        assert!(!history.can_undo());
        assert!(history.peek_undo().is_none());
    }
}
