//! Three-level upgradeable lock (shared / update / exclusive).
//!
//! A [`LockLadder`] guards one resource, typically an attribute index. Any
//! number of shared holders may coexist with at most one update holder. The
//! update holder can promote itself to exclusive without releasing, which is
//! what keeps two would-be writers from deadlocking on a read-then-write
//! upgrade: the second writer never gets past the update slot.
//!
//! Holders receive a [`LadderGuard`] that releases its level on drop, including
//! during unwinding.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{AssocError, Result};

/// Lock level held on a ladder.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Read-only access; many holders.
    Shared,
    /// Read access plus the right to promote; one holder, compatible with shared holders.
    Update,
    /// Full read/write access; sole holder.
    Exclusive,
}

#[derive(Default, Debug)]
struct LadderState {
    shared: u32,
    update: bool,
    exclusive: bool,
    promotion_pending: bool,
}

/// Snapshot of ladder state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderSnapshot {
    /// Number of shared holders.
    pub shared: u32,
    /// Whether the update slot is taken (also true while exclusive).
    pub update: bool,
    /// Whether the exclusive level is held.
    pub exclusive: bool,
    /// Whether the update holder is waiting for shared holders to drain.
    pub promotion_pending: bool,
}

/// Upgradeable lock around a value of type `T`.
pub struct LockLadder<T> {
    name: String,
    timeout: Option<Duration>,
    state: Mutex<LadderState>,
    changed: Condvar,
    data: RwLock<T>,
}

impl<T> fmt::Debug for LockLadder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLadder")
            .field("name", &self.name)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl<T> LockLadder<T> {
    /// Creates a ladder named `name` guarding `value`.
    ///
    /// `timeout` bounds every blocking acquisition and promotion; `None` waits forever.
    pub fn new(name: impl Into<String>, value: T, timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            timeout,
            state: Mutex::new(LadderState::default()),
            changed: Condvar::new(),
            data: RwLock::new(value),
        }
    }

    /// Resource name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires a shared guard, blocking while an exclusive holder or a pending
    /// promotion exists.
    pub fn shared(self: &Arc<Self>) -> Result<LadderGuard<T>> {
        let mut state = self.state.lock();
        self.wait_for(&mut state, LockLevel::Shared, |s| {
            !s.exclusive && !s.promotion_pending
        })?;
        state.shared += 1;
        Ok(LadderGuard::new(Arc::clone(self), LockLevel::Shared))
    }

    /// Acquires the update slot, blocking while another update or exclusive holder exists.
    pub fn update(self: &Arc<Self>) -> Result<LadderGuard<T>> {
        let mut state = self.state.lock();
        self.wait_for(&mut state, LockLevel::Update, |s| !s.update)?;
        state.update = true;
        Ok(LadderGuard::new(Arc::clone(self), LockLevel::Update))
    }

    /// Acquires exclusive access by taking the update slot and promoting it.
    pub fn exclusive(self: &Arc<Self>) -> Result<LadderGuard<T>> {
        let mut guard = self.update()?;
        guard.promote()?;
        Ok(guard)
    }

    /// Returns a snapshot of the current holders.
    pub fn snapshot(&self) -> LadderSnapshot {
        let state = self.state.lock();
        LadderSnapshot {
            shared: state.shared,
            update: state.update,
            exclusive: state.exclusive,
            promotion_pending: state.promotion_pending,
        }
    }

    /// Reads the guarded value on behalf of a guard the caller already holds.
    ///
    /// Used by cursors that outlive a borrow of the guard itself but not the
    /// guard's owner (a transaction keeps its guards until it ends).
    pub(crate) fn read_held(&self) -> RwLockReadGuard<'_, T> {
        debug_assert!({
            let s = self.state.lock();
            s.shared > 0 || s.update
        });
        self.data.read()
    }

    fn wait_for<F>(
        &self,
        state: &mut MutexGuard<'_, LadderState>,
        level: LockLevel,
        ready: F,
    ) -> Result<()>
    where
        F: Fn(&LadderState) -> bool,
    {
        if ready(&**state) {
            return Ok(());
        }
        debug!(resource = %self.name, ?level, "lock.acquire.wait");
        let deadline = self.timeout.map(|t| Instant::now() + t);
        while !ready(&**state) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(state, deadline).timed_out() && !ready(&**state) {
                        debug!(resource = %self.name, ?level, "lock.acquire.timeout");
                        return Err(AssocError::LockTimeout {
                            resource: self.name.clone(),
                            level,
                        });
                    }
                }
                None => self.changed.wait(state),
            }
        }
        Ok(())
    }

    fn release(&self, level: LockLevel) {
        let mut state = self.state.lock();
        match level {
            LockLevel::Shared => {
                state.shared = state.shared.saturating_sub(1);
            }
            LockLevel::Update => {
                state.update = false;
            }
            LockLevel::Exclusive => {
                state.exclusive = false;
                state.update = false;
            }
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// Scoped holder of one level on a [`LockLadder`].
pub struct LadderGuard<T> {
    ladder: Arc<LockLadder<T>>,
    level: LockLevel,
}

impl<T> fmt::Debug for LadderGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LadderGuard")
            .field("resource", &self.ladder.name)
            .field("level", &self.level)
            .finish()
    }
}

impl<T> LadderGuard<T> {
    fn new(ladder: Arc<LockLadder<T>>, level: LockLevel) -> Self {
        Self { ladder, level }
    }

    /// Level currently held.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// The ladder this guard belongs to.
    pub fn ladder(&self) -> &Arc<LockLadder<T>> {
        &self.ladder
    }

    /// Read access; valid at every level.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.ladder.data.read()
    }

    /// Write access; requires the exclusive level.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        if self.level != LockLevel::Exclusive {
            return Err(AssocError::Invalid("write access requires an exclusive lock"));
        }
        Ok(self.ladder.data.write())
    }

    /// Promotes an update guard to exclusive, waiting for shared holders to drain.
    ///
    /// New shared requests queue behind the pending promotion. On timeout the
    /// guard keeps its update level so the caller can retry or release.
    pub fn promote(&mut self) -> Result<()> {
        match self.level {
            LockLevel::Exclusive => return Ok(()),
            LockLevel::Shared => {
                return Err(AssocError::Invalid(
                    "shared holders cannot promote; acquire the update level first",
                ))
            }
            LockLevel::Update => {}
        }
        let ladder = Arc::clone(&self.ladder);
        let mut state = ladder.state.lock();
        state.promotion_pending = true;
        let waited = ladder.wait_for(&mut state, LockLevel::Exclusive, |s| s.shared == 0);
        state.promotion_pending = false;
        match waited {
            Ok(()) => {
                state.exclusive = true;
                drop(state);
                self.level = LockLevel::Exclusive;
                debug!(resource = %ladder.name, "lock.promote.done");
                Ok(())
            }
            Err(err) => {
                drop(state);
                ladder.changed.notify_all();
                Err(err)
            }
        }
    }
}

impl<T> Drop for LadderGuard<T> {
    fn drop(&mut self) {
        self.ladder.release(self.level);
    }
}
