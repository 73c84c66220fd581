//! Small synchronization helpers shared by the registries.
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Locks `mutex`, recovering the guard if another thread panicked while
/// holding it. Every critical section in this crate is short and leaves its
/// data consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct WaitState<T> {
    value: Option<T>,
    abandoned: bool,
}

/// One-shot result slot a thread blocks on until another thread fills it.
///
/// Used as the private monitor of connect legs, synchronous sends and name
/// resolution.
#[derive(Debug)]
pub(crate) struct SyncWait<T> {
    state: Mutex<WaitState<T>>,
    cond: Condvar,
}

impl<T> SyncWait<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaitState {
                value: None,
                abandoned: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Stores `value` and wakes the waiters. The value is handed back when
    /// the slot is already filled or the waiter gave up.
    pub fn complete(&self, value: T) -> Result<(), T> {
        let mut state = lock(&self.state);
        if state.abandoned || state.value.is_some() {
            return Err(value);
        }
        state.value = Some(value);
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks until a value arrives or `deadline` passes. On timeout the slot
    /// is abandoned, so a late `complete` returns its value to the caller.
    pub fn wait_until(&self, deadline: Instant) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if let Some(value) = state.value.take() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                state.abandoned = true;
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

impl<T: Clone> SyncWait<T> {
    /// Like [`SyncWait::wait_until`] but leaves the value in place so every
    /// thread waiting on the same slot observes it.
    pub fn wait_shared(&self, deadline: Instant) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if let Some(value) = state.value.as_ref() {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

#[derive(Debug, Default)]
struct TickState {
    stopped: bool,
    kicked: bool,
}

/// Periodic wake-up for background tasks, with out-of-cycle kicks.
#[derive(Debug, Default)]
pub(crate) struct Ticker {
    state: Mutex<TickState>,
    cond: Condvar,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `period` or until kicked. Returns `false` once stopped.
    pub fn tick(&self, period: Duration) -> bool {
        let state = lock(&self.state);
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, period, |s| !s.stopped && !s.kicked)
            .unwrap_or_else(PoisonError::into_inner);
        if state.stopped {
            return false;
        }
        state.kicked = false;
        true
    }

    pub fn kick(&self) {
        lock(&self.state).kicked = true;
        self.cond.notify_all();
    }

    pub fn stop(&self) {
        lock(&self.state).stopped = true;
        self.cond.notify_all();
    }
}
