//! Pooled records of in-flight operation legs.
//!
//! Every connect, send or synchronous wait is tracked by an [`Operation`]
//! taken from an [`OperationPool`]. Whoever removes an operation from the
//! pool's live set owns its completion, so a reply racing a timeout is
//! completed exactly once.
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Instant,
};

use crate::{
    driver::ConnectionId, error::TransportError, message::Message, routing::Link,
    sync::{SyncWait, lock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Listen,
    Connect,
    Send,
    /// Control traffic on behalf of a bound client or proxy.
    Client,
    SendAndWait,
}

pub type TransmitCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;
pub type ReplyCallback = Box<dyn FnOnce(Result<Message, TransportError>) + Send>;

pub(crate) type ReplySlot = Arc<SyncWait<Result<Message, TransportError>>>;
pub(crate) type ConnectSlot = Arc<SyncWait<Result<Arc<Link>, TransportError>>>;

/// How the owner of an operation learns its outcome.
#[derive(Default)]
pub(crate) enum Completion {
    #[default]
    Idle,
    Callbacks {
        on_transmit: Option<TransmitCallback>,
        on_reply: Option<ReplyCallback>,
    },
    Reply(ReplySlot),
    Connect(ConnectSlot),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Callbacks {
                on_transmit,
                on_reply,
            } => f
                .debug_struct("Callbacks")
                .field("on_transmit", &on_transmit.is_some())
                .field("on_reply", &on_reply.is_some())
                .finish(),
            Self::Reply(_) => f.write_str("Reply"),
            Self::Connect(_) => f.write_str("Connect"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub completion: Completion,
    /// Link whose use this operation holds.
    pub link: Option<ConnectionId>,
    pub route: u32,
    pub deadline: Option<Instant>,
    /// Destination of a connect leg.
    pub address: Option<SocketAddr>,
    /// What the operation was addressed to, for error reports.
    pub target: String,
}

impl Operation {
    fn blank(id: OperationId) -> Self {
        Self {
            id,
            kind: OperationKind::Send,
            completion: Completion::Idle,
            link: None,
            route: 0,
            deadline: None,
            address: None,
            target: String::new(),
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(
            &self.completion,
            Completion::Reply(_)
                | Completion::Callbacks {
                    on_reply: Some(_),
                    ..
                }
        )
    }

    /// Detaches the transmit callback so it can run outside the pool lock.
    pub fn take_on_transmit(&mut self) -> Option<TransmitCallback> {
        match &mut self.completion {
            Completion::Callbacks { on_transmit, .. } => on_transmit.take(),
            _ => None,
        }
    }

    /// Hands `reply` to the waiter. A reply nobody waits for any more is
    /// returned so the caller can free it.
    pub fn deliver(&mut self, reply: Message) -> Option<Message> {
        match std::mem::take(&mut self.completion) {
            Completion::Callbacks {
                on_transmit,
                on_reply: Some(cb),
            } => {
                // The reply can overtake the transmit report.
                if let Some(sent) = on_transmit {
                    sent(Ok(()));
                }
                cb(Ok(reply));
                None
            }
            Completion::Reply(slot) => slot.complete(Ok(reply)).err().and_then(Result::ok),
            _ => Some(reply),
        }
    }

    /// The single failure path: every callback or waiter learns `err`.
    pub fn fail(&mut self, err: TransportError) {
        match std::mem::take(&mut self.completion) {
            Completion::Idle => {}
            Completion::Callbacks {
                on_transmit,
                on_reply,
            } => {
                if let Some(cb) = on_transmit {
                    cb(Err(err.clone()));
                }
                if let Some(cb) = on_reply {
                    cb(Err(err));
                }
            }
            Completion::Reply(slot) => {
                let _ = slot.complete(Err(err));
            }
            Completion::Connect(slot) => {
                let _ = slot.complete(Err(err));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub created: usize,
    pub live: usize,
    pub free: usize,
}

#[derive(Debug, Default)]
struct Ops {
    next: u64,
    created: usize,
    free: Vec<Operation>,
    live: HashMap<OperationId, Operation>,
}

#[derive(Debug, Default)]
pub(crate) struct OperationPool {
    inner: Mutex<Ops>,
}

impl OperationPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a record off the free list, gives it a fresh identity and makes
    /// it live.
    pub fn start(&self, kind: OperationKind, completion: Completion, target: &str) -> OperationId {
        let mut ops = lock(&self.inner);
        ops.next += 1;
        let id = OperationId(ops.next);
        let mut op = match ops.free.pop() {
            Some(mut op) => {
                op.id = id;
                op
            }
            None => {
                ops.created += 1;
                Operation::blank(id)
            }
        };
        op.kind = kind;
        op.completion = completion;
        op.target.push_str(target);
        ops.live.insert(id, op);
        id
    }

    /// Runs `f` on a live operation without taking ownership of it.
    pub fn with<R>(&self, id: OperationId, f: impl FnOnce(&mut Operation) -> R) -> Option<R> {
        lock(&self.inner).live.get_mut(&id).map(f)
    }

    /// Removes a live operation; the caller now owns its completion.
    pub fn take(&self, id: OperationId) -> Option<Operation> {
        lock(&self.inner).live.remove(&id)
    }

    /// Removes every live operation, for shutdown.
    pub fn drain(&self) -> Vec<Operation> {
        lock(&self.inner).live.drain().map(|(_, op)| op).collect()
    }

    /// Clears a finished operation and puts it back on the free list.
    pub fn recycle(&self, mut op: Operation) {
        op.completion = Completion::Idle;
        op.link = None;
        op.route = 0;
        op.deadline = None;
        op.address = None;
        op.target.clear();
        lock(&self.inner).free.push(op);
    }

    pub fn stats(&self) -> OperationStats {
        let ops = lock(&self.inner);
        OperationStats {
            created: ops.created,
            live: ops.live.len(),
            free: ops.free.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use crate::message::MessagePool;

    use super::*;

    fn counting() -> (Arc<AtomicUsize>, Completion) {
        let count = Arc::new(AtomicUsize::new(0));
        let (a, b) = (Arc::clone(&count), Arc::clone(&count));
        let completion = Completion::Callbacks {
            on_transmit: Some(Box::new(move |r| {
                assert!(r.is_err());
                a.fetch_add(1, Ordering::SeqCst);
            })),
            on_reply: Some(Box::new(move |r| {
                assert!(matches!(r, Err(TransportError::NotConnected)));
                b.fetch_add(1, Ordering::SeqCst);
            })),
        };
        (count, completion)
    }

    #[test]
    fn recycled_operation_gets_new_identity() {
        let pool = OperationPool::new();
        let first = pool.start(OperationKind::Send, Completion::Idle, "a");
        let op = pool.take(first).unwrap();
        pool.recycle(op);

        let second = pool.start(OperationKind::Connect, Completion::Idle, "b");
        assert_ne!(first, second);
        assert!(pool.take(first).is_none());
        assert_eq!(pool.with(second, |op| op.target.clone()).unwrap(), "b");
        assert_eq!(
            pool.stats(),
            OperationStats {
                created: 1,
                live: 1,
                free: 0
            }
        );
    }

    #[test]
    fn fail_reaches_both_callbacks_once() {
        let pool = OperationPool::new();
        let (count, completion) = counting();
        let id = pool.start(OperationKind::Send, completion, "a");

        let mut op = pool.take(id).unwrap();
        op.fail(TransportError::NotConnected);
        op.fail(TransportError::NotConnected);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transmit_keeps_reply_pending() {
        let pool = OperationPool::new();
        let sent = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&sent);
        let id = pool.start(
            OperationKind::Send,
            Completion::Callbacks {
                on_transmit: Some(Box::new(move |r| {
                    assert!(r.is_ok());
                    handle.fetch_add(1, Ordering::SeqCst);
                })),
                on_reply: Some(Box::new(|r| assert!(r.is_ok()))),
            },
            "a",
        );

        let callback = pool.with(id, |op| op.take_on_transmit()).unwrap();
        callback.unwrap()(Ok(()));
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(pool.with(id, |op| op.expects_reply()), Some(true));

        let messages = MessagePool::new();
        let mut op = pool.take(id).unwrap();
        assert!(op.deliver(messages.allocate(1)).is_none());
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_reply_to_abandoned_wait_is_returned() {
        let slot: ReplySlot = Arc::new(SyncWait::new());
        let pool = OperationPool::new();
        let id = pool.start(OperationKind::SendAndWait, Completion::Reply(Arc::clone(&slot)), "a");
        assert!(slot.wait_until(Instant::now() + Duration::from_millis(1)).is_none());

        let messages = MessagePool::new();
        let mut op = pool.take(id).unwrap();
        let back = op.deliver(messages.allocate(3)).unwrap();
        assert_eq!(back.len(), 3);
    }
}
