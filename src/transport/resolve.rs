use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    error::TransportError,
    sync::{SyncWait, lock},
};

pub(crate) type Answer = Result<i32, TransportError>;
pub(crate) type AnswerSlot = Arc<SyncWait<Answer>>;

/// Outstanding name resolutions. Callers resolving the same name share one
/// slot, so only the first of them sends a request.
#[derive(Debug, Default)]
pub(crate) struct Resolver {
    pending: Mutex<HashMap<String, AnswerSlot>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot the answer for `name` lands in, and whether the
    /// caller is the one who must ask for it.
    pub fn join(&self, name: &str) -> (AnswerSlot, bool) {
        let mut pending = lock(&self.pending);
        match pending.get(name) {
            Some(slot) => (Arc::clone(slot), false),
            None => {
                let slot = Arc::new(SyncWait::new());
                pending.insert(name.to_string(), Arc::clone(&slot));
                (slot, true)
            }
        }
    }

    /// Completes the resolution of `name`. Returns `false` when nobody is
    /// waiting for it any more.
    pub fn answer(&self, name: &str, answer: Answer) -> bool {
        let Some(slot) = lock(&self.pending).remove(name) else {
            debug!("late resolve answer for '{name}'");
            return false;
        };
        slot.complete(answer).is_ok()
    }

    /// Forgets `slot` after its waiters gave up, unless a newer round trip
    /// already replaced it.
    pub fn abandon(&self, name: &str, slot: &AnswerSlot) {
        let mut pending = lock(&self.pending);
        if pending.get(name).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            pending.remove(name);
        }
    }

    pub fn fail_all(&self, err: TransportError) {
        let slots: Vec<_> = lock(&self.pending).drain().map(|(_, s)| s).collect();
        for slot in slots {
            let _ = slot.complete(Err(err.clone()));
        }
    }
}
