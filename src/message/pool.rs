use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use log::{trace, warn};
use thiserror::Error;

use crate::sync::lock;

use super::{Message, round_capacity};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("message {0} freed twice")]
    DoubleFree(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ever created by the pool.
    pub created: usize,
    /// Buffers waiting on the free list.
    pub free: usize,
    /// Buffers currently owned by someone.
    pub in_use: usize,
}

/// Thread-safe free list of message buffers.
#[derive(Debug, Default)]
pub struct MessagePool {
    free: Mutex<VecDeque<Message>>,
    next_serial: AtomicU64,
    created: AtomicUsize,
    in_use: AtomicUsize,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a zero-filled message with a body of `len` bytes. The first
    /// free buffer with enough capacity is reused, otherwise a new one is
    /// created.
    pub fn allocate(&self, len: usize) -> Message {
        let capacity = round_capacity(len);
        let reused = {
            let mut free = lock(&self.free);
            free.iter()
                .position(|m| m.capacity() >= capacity)
                .and_then(|pos| free.remove(pos))
        };

        let message = match reused {
            Some(mut message) => {
                message.recycle(len);
                trace!("reusing message {} for {len} bytes", message.serial());
                message
            }
            None => {
                self.created.fetch_add(1, Ordering::SeqCst);
                let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
                trace!("created message {serial} for {len} bytes");
                Message::new(serial, len)
            }
        };
        self.in_use.fetch_add(1, Ordering::SeqCst);
        message
    }

    /// Returns a message to the free list. A buffer that is already free is
    /// left alone so the list is never corrupted.
    pub fn free(&self, mut message: Message) -> Result<(), PoolError> {
        let mut free = lock(&self.free);
        if free.iter().any(|m| m.serial() == message.serial()) {
            warn!("message {} freed twice; ignoring", message.serial());
            return Err(PoolError::DoubleFree(message.serial()));
        }
        message.release();
        free.push_front(message);
        drop(free);

        let _ = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }

    /// Copies header fields and body of `message` into a fresh buffer.
    pub fn duplicate(&self, message: &Message) -> Message {
        let mut copy = self.allocate(message.len());
        copy.copy_from(message);
        copy
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::SeqCst),
            free: lock(&self.free).len(),
            in_use: self.in_use.load(Ordering::SeqCst),
        }
    }
}
